//! Command line surface (`spec.md` §6, AMBIENT per `SPEC_FULL.md` §6):
//! exactly the flags `spec.md` enumerates, derived with `clap` the way
//! `rustdds`'s own example binaries (`ddsperf`, `shapes-demo`) do.
//!
//! Only `src/bin/main.rs` depends on this module; the library crate root
//! never sees a `Cli` value, only the `GatewayConfig`/bitset it is
//! translated into.

use clap::Parser;

/// `--pcie/-p`, `--udp/-u`, `--tcp/-t` (UDP and TCP are mutually
/// exclusive), `--log-level`, `--config`, `--help/-h`.
#[derive(Parser, Debug)]
#[command(name = "gateway-bridge", about = "Cross-node publish/subscribe gateway")]
pub struct Cli {
    /// Enable the Interconnect (DMA-capable) transport.
    #[arg(short = 'p', long = "pcie")]
    pub pcie: bool,

    /// Enable the Datagram (UDP) transport.
    #[arg(short = 'u', long = "udp", conflicts_with = "tcp")]
    pub udp: bool,

    /// Enable the Stream (TCP) transport.
    #[arg(short = 't', long = "tcp", conflicts_with = "udp")]
    pub tcp: bool,

    /// Minimum severity passed through to `env_logger`.
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Path to a `GatewayConfig` TOML file. A missing default path is a
    /// soft fallback; a missing *explicitly-given* path is a fatal error
    /// (`spec.md` §6 exit codes).
    #[arg(long = "config")]
    pub config: Option<std::path::PathBuf>,

    /// Run the in-memory IPC fabric instead of a real one, for smoke
    /// testing the gateway end to end without a shared-memory runtime.
    #[arg(long = "self-test")]
    pub self_test: bool,
}

#[derive(clap::ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Off,
    Fatal,
    Error,
    Warning,
    Info,
    Debug,
    Verbose,
}

impl LogLevel {
    pub fn to_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Fatal | LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warning => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Verbose => log::LevelFilter::Trace,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn udp_and_tcp_are_mutually_exclusive() {
        let result = Cli::try_parse_from(["gateway-bridge", "--udp", "--tcp"]);
        assert!(result.is_err());
    }

    #[test]
    fn pcie_and_udp_can_combine() {
        let cli = Cli::try_parse_from(["gateway-bridge", "--pcie", "--udp"]).unwrap();
        assert!(cli.pcie);
        assert!(cli.udp);
        assert!(!cli.tcp);
    }

    #[test]
    fn log_level_defaults_to_info() {
        let cli = Cli::try_parse_from(["gateway-bridge"]).unwrap();
        assert_eq!(cli.log_level, LogLevel::Info);
        assert_eq!(cli.log_level.to_filter(), log::LevelFilter::Info);
    }

    #[test]
    fn log_level_parses_named_variant() {
        let cli = Cli::try_parse_from(["gateway-bridge", "--log-level", "verbose"]).unwrap();
        assert_eq!(cli.log_level, LogLevel::Verbose);
    }
}
