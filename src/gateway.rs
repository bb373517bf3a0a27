//! Top-level wiring of C1–C8 into one `Gateway` with a `start()`/`join()`
//! lifecycle (`spec.md` §5 teardown order).
//!
//! Grounded on `original_source/include/p3com/gateway/gateway_app.hpp` and
//! `gateway_app.cpp` (`GatewayApp::run`): construct Discovery, the
//! Pending-buffer Tracker, the Reassembler and the Forwarder, wire both
//! Direction Adapters behind the Discovery Manager's needed-topics
//! callback, then run a loop that checks reassembly timeouts every
//! `DISCOVERY_PERIOD` and re-broadcasts discovery on lossy transports every
//! `LOSSY_DISCOVERY_PERIOD` — followed by the fixed teardown order from the
//! original's closing comment: Discovery first (so no late-firing local
//! event reaches an adapter mid-teardown), then the L→R adapter and the
//! Forwarder (the only two things left that can still originate a send),
//! then the Transport Registry.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::info;

use crate::adapters::forwarder::TransportForwarder;
use crate::adapters::local_to_remote::LocalToRemote;
use crate::adapters::remote_to_local::RemoteToLocal;
use crate::config::GatewayConfig;
use crate::discovery::DiscoveryManager;
use crate::ipc::Fabric;
use crate::pending::PendingTracker;
use crate::reassembler::Reassembler;
use crate::transport::registry::TransportRegistry;
use crate::types::{TransportKind, DISCOVERY_PERIOD, LOSSY_DISCOVERY_PERIOD};

/// Transports that need their discovery record re-sent periodically to
/// compensate for dropped datagrams (`spec.md` §4.4), computed once up
/// front rather than filtering `TransportKind::ALL` every tick.
fn lossy_transport_kinds() -> Vec<TransportKind> {
    TransportKind::ALL.into_iter().filter(|k| k.is_lossy()).collect()
}

pub struct Gateway {
    registry: Arc<TransportRegistry>,
    discovery: Arc<DiscoveryManager>,
    reassembler: Arc<Reassembler>,
    forwarder: Arc<TransportForwarder>,
    local_to_remote: Arc<LocalToRemote>,
    remote_to_local: Arc<RemoteToLocal>,
    terminated: AtomicBool,
    main_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Assembles C1–C8 from an already-populated `TransportRegistry` (the
    /// concrete drivers are constructed by `src/bin/main.rs`, per
    /// `SPEC_FULL.md`'s binary/library split) and an IPC `Fabric`. If
    /// `config.preferred_transport` names a kind that isn't enabled on
    /// `registry`, it is reset to `None` with a warning, matching
    /// `GatewayApp`'s constructor.
    pub fn new(fabric: Arc<dyn Fabric>, registry: Arc<TransportRegistry>, config: GatewayConfig) -> Arc<Self> {
        let preferred_transport = match config.preferred_transport {
            Some(kind) if !registry.bitset().contains(kind) => {
                log::warn!("gateway: preferred transport {kind} is not enabled, ignoring");
                None
            }
            other => other,
        };

        let discovery = DiscoveryManager::new(Arc::clone(&registry), fabric.introspection(), fabric.new_waitset(), preferred_transport);
        let pending = Arc::new(PendingTracker::new());
        let reassembler = Arc::new(Reassembler::new());

        let forwarder = TransportForwarder::new(
            Arc::clone(&fabric),
            Arc::clone(&registry),
            Arc::clone(&pending),
            Arc::clone(&discovery),
            fabric.new_waitset(),
            &config.forwarded_services,
        );

        let remote_to_local =
            RemoteToLocal::new(Arc::clone(&fabric), Arc::clone(&registry), Arc::clone(&discovery), Arc::clone(&reassembler), Arc::clone(&forwarder));

        let local_to_remote = LocalToRemote::new(Arc::clone(&fabric), Arc::clone(&registry), Arc::clone(&pending), Arc::clone(&discovery), fabric.new_waitset());

        Arc::new(Self {
            registry,
            discovery,
            reassembler,
            forwarder,
            local_to_remote,
            remote_to_local,
            terminated: AtomicBool::new(false),
            main_loop: Mutex::new(None),
        })
    }

    /// Starts the L→R reactor thread, installs the needed-topics callback
    /// that fans out to both adapters (`updateCallback` in the original),
    /// and spawns the main loop thread. Call `join()` to run it to
    /// completion (blocks until `terminate()` is called from another
    /// thread, e.g. a signal handler).
    pub fn start(self: &Arc<Self>) {
        self.local_to_remote.start();

        let local_to_remote = Arc::clone(&self.local_to_remote);
        let remote_to_local = Arc::clone(&self.remote_to_local);
        self.discovery.start(Box::new(move |needed| {
            local_to_remote.update_channels(needed);
            remote_to_local.update_channels(needed);
        }));

        let gateway = Arc::clone(self);
        *self.main_loop.lock().unwrap() = Some(std::thread::spawn(move || gateway.main_loop()));
    }

    /// Blocks until `terminate()` is called and the main loop thread has
    /// exited.
    pub fn join(&self) {
        if let Some(handle) = self.main_loop.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    /// Request shutdown. Idempotent; safe to call from a signal handler
    /// thread while `join()` blocks on the main thread.
    pub fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }

    fn main_loop(self: Arc<Self>) {
        let lossy_kinds = lossy_transport_kinds();
        let mut last_lossy_discovery = Instant::now();

        while !self.terminated.load(Ordering::Acquire) {
            self.reassembler.check_timeouts();

            let now = Instant::now();
            if now.duration_since(last_lossy_discovery) > LOSSY_DISCOVERY_PERIOD {
                for kind in &lossy_kinds {
                    self.discovery.resend_discovery_info_to_transport(*kind);
                }
                last_lossy_discovery = now;
            }

            std::thread::sleep(DISCOVERY_PERIOD);
        }

        self.teardown();
    }

    /// Fixed order from `GatewayApp::run`'s closing comment: Discovery
    /// first, then the two things left that can still originate a send
    /// (L→R adapter, Forwarder), then the Registry.
    fn teardown(&self) {
        self.discovery.terminate();
        self.local_to_remote.join();
        self.forwarder.join();
        self.registry.terminate();
        info!("gateway: shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ipc::testing::TestFabric;

    #[test]
    fn start_terminate_join_tears_down_cleanly() {
        let fabric = TestFabric::new(8);
        let registry = Arc::new(TransportRegistry::new());
        let gateway = Gateway::new(fabric, registry, GatewayConfig::default());

        gateway.start();
        std::thread::sleep(Duration::from_millis(10));
        gateway.terminate();
        gateway.join();
    }

    #[test]
    fn preferred_transport_not_enabled_is_reset_with_warning() {
        let fabric = TestFabric::new(8);
        let registry = Arc::new(TransportRegistry::new());
        let config = GatewayConfig { preferred_transport: Some(TransportKind::Stream), ..GatewayConfig::default() };

        // Nothing enabled on `registry`, so `Stream` is not a match; this
        // must not panic, only log a warning and fall back to `None`.
        let gateway = Gateway::new(fabric, registry, config);
        gateway.start();
        gateway.terminate();
        gateway.join();
    }
}
