//! Gateway configuration (`spec.md` §6, AMBIENT per `SPEC_FULL.md` §6):
//! `GatewayConfig` plus TOML loading.
//!
//! Grounded on `original_source/include/p3com/gateway/gateway_config.hpp`
//! (`GatewayConfig_t`) and `gateway_config.cpp` (`TomlGatewayConfigParser`):
//! same two fields (`preferred-transport`, `forwarded-service` table array
//! with `service`/`instance`/`event` keys), same soft-fallback behavior on a
//! missing or malformed file. Unlike the original, parsing is never gated
//! behind a build-time `TOML_CONFIG` flag — `toml`/`serde` are always
//! available here.

use std::path::Path;

use serde::Deserialize;

use crate::error::{GatewayError, Result};
use crate::types::{ServiceId, TransportKind, MAX_FORWARDED_SERVICES};

#[derive(Debug, Clone, Default, Deserialize)]
struct RawConfig {
    #[serde(rename = "preferred-transport")]
    preferred_transport: Option<String>,
    #[serde(rename = "forwarded-service", default)]
    forwarded_service: Vec<RawServiceId>,
    #[serde(default)]
    network: RawNetwork,
}

#[derive(Debug, Clone, Deserialize)]
struct RawServiceId {
    service: String,
    instance: String,
    event: String,
}

/// Bind/peer addresses for the concrete transport drivers. Not present in
/// the original's `GatewayConfig_t` — the NIC/PCIe configuration there
/// lives entirely outside the retrieved source, so this is a supplement
/// needed for `src/bin/main.rs` to actually bind a socket.
#[derive(Debug, Clone, Default, Deserialize)]
struct RawNetwork {
    udp_bind: Option<String>,
    udp_broadcast: Option<String>,
    tcp_bind: Option<String>,
    tcp_peers: Vec<String>,
}

/// Unchanged from `spec.md` §6: `{ preferred_transport, forwarded_services }`.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    pub preferred_transport: Option<TransportKind>,
    pub forwarded_services: Vec<ServiceId>,
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Default)]
pub struct NetworkConfig {
    pub udp_bind: Option<String>,
    pub udp_broadcast: Option<String>,
    pub tcp_bind: Option<String>,
    pub tcp_peers: Vec<String>,
}

const TRANSPORT_TYPE_NAMES: [(&str, TransportKind); 3] =
    [("stream", TransportKind::Stream), ("datagram", TransportKind::Datagram), ("interconnect", TransportKind::Interconnect)];

impl From<RawConfig> for GatewayConfig {
    fn from(raw: RawConfig) -> Self {
        let preferred_transport = raw
            .preferred_transport
            .as_deref()
            .and_then(|name| TRANSPORT_TYPE_NAMES.iter().find(|(n, _)| *n == name).map(|(_, kind)| *kind));

        let mut forwarded_services: Vec<ServiceId> =
            raw.forwarded_service.into_iter().map(|s| ServiceId::new(s.service, s.instance, s.event)).collect();
        if forwarded_services.len() > MAX_FORWARDED_SERVICES {
            log::warn!(
                "config: {} forwarded services configured, truncating to {MAX_FORWARDED_SERVICES}",
                forwarded_services.len()
            );
            forwarded_services.truncate(MAX_FORWARDED_SERVICES);
        }

        GatewayConfig {
            preferred_transport,
            forwarded_services,
            network: NetworkConfig {
                udp_bind: raw.network.udp_bind,
                udp_broadcast: raw.network.udp_broadcast,
                tcp_bind: raw.network.tcp_bind,
                tcp_peers: raw.network.tcp_peers,
            },
        }
    }
}

/// Load and parse `path`. Mirrors `TomlGatewayConfigParser::parse`'s
/// soft-fallback behavior: a missing file is logged at info level and
/// yields the default config; a malformed file is logged as a warning and
/// also falls back, rather than aborting startup.
pub fn load_from_path(path: &Path) -> GatewayConfig {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            log::info!("config: '{}' not found ({e}), using default config", path.display());
            return GatewayConfig::default();
        }
    };

    match toml::from_str::<RawConfig>(&contents) {
        Ok(raw) => {
            log::info!("config: loaded gateway config from '{}'", path.display());
            raw.into()
        }
        Err(e) => {
            log::warn!("config: '{}' failed to parse ({e}), using default config", path.display());
            GatewayConfig::default()
        }
    }
}

/// Like `load_from_path`, but returns an error instead of silently falling
/// back — used when the caller passed `--config` explicitly and a missing
/// or malformed file should be treated as a fatal init failure rather than
/// quietly ignored (`spec.md` §6 "non-zero on ... fatal init failure").
pub fn load_from_path_strict(path: &Path) -> Result<GatewayConfig> {
    let contents = std::fs::read_to_string(path)?;
    let raw: RawConfig = toml::from_str(&contents).map_err(|e| GatewayError::Config(e.to_string()))?;
    Ok(raw.into())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use tempfile::NamedTempFile;

    use super::*;

    #[test]
    fn missing_file_falls_back_to_default() {
        let config = load_from_path(Path::new("/nonexistent/p3com.toml"));
        assert_eq!(config.preferred_transport, None);
        assert!(config.forwarded_services.is_empty());
    }

    #[test]
    fn parses_preferred_transport_and_forwarded_services() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            preferred-transport = "datagram"

            [[forwarded-service]]
            service = "svc"
            instance = "inst"
            event = "evt"
            "#
        )
        .unwrap();

        let config = load_from_path(file.path());
        assert_eq!(config.preferred_transport, Some(TransportKind::Datagram));
        assert_eq!(config.forwarded_services, vec![ServiceId::new("svc", "inst", "evt")]);
    }

    #[test]
    fn truncates_excess_forwarded_services() {
        let mut file = NamedTempFile::new().unwrap();
        for i in 0..(MAX_FORWARDED_SERVICES + 3) {
            writeln!(file, "[[forwarded-service]]\nservice = \"s{i}\"\ninstance = \"i\"\nevent = \"e\"").unwrap();
        }
        let config = load_from_path(file.path());
        assert_eq!(config.forwarded_services.len(), MAX_FORWARDED_SERVICES);
    }

    #[test]
    fn malformed_file_falls_back_to_default() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not valid toml [[[").unwrap();
        let config = load_from_path(file.path());
        assert!(config.forwarded_services.is_empty());
    }

    #[test]
    fn strict_loader_propagates_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "not valid toml [[[").unwrap();
        assert!(load_from_path_strict(file.path()).is_err());
    }
}
