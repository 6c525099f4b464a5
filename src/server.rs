//! Server orchestrator: one generation of pools and listeners per start

use crate::config::Config;
use crate::listener::Listener;
use crate::pool::{BackendPools, FcgiPool, ProxyPool};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

/// Everything built by one `start` and torn down by the matching `stop`
struct Generation {
    listeners: BTreeMap<String, Arc<Listener>>,
    pools: BackendPools,
}

/// Owns the configuration snapshot and the running generation.
///
/// Reload is stop then start: the control loop calls [`Server::reload`]
/// (or [`Server::stop`]) and restarts when the stopped notification arrives.
pub struct Server {
    config: RwLock<Arc<Config>>,
    generation: Mutex<Option<Generation>>,
    stopped_tx: mpsc::UnboundedSender<()>,
}

impl Server {
    /// Create a stopped server and the receiver for its stopped notifications
    pub fn new(config: Arc<Config>) -> (Self, mpsc::UnboundedReceiver<()>) {
        let (stopped_tx, stopped_rx) = mpsc::unbounded_channel();
        let server = Self {
            config: RwLock::new(config),
            generation: Mutex::new(None),
            stopped_tx,
        };
        (server, stopped_rx)
    }

    /// Current configuration snapshot
    pub fn config(&self) -> Arc<Config> {
        Arc::clone(&self.config.read())
    }

    /// Start pools and listeners. No-op when already running.
    pub async fn start(&self) {
        let mut generation = self.generation.lock().await;
        if generation.is_some() {
            debug!("Server already running");
            return;
        }

        let config = self.config();
        let pools = BackendPools::start(&config);

        let mut listeners: BTreeMap<String, Arc<Listener>> = BTreeMap::new();
        for site in &config.sites {
            let addr = site.addr();
            let listener = listeners.entry(addr.clone()).or_insert_with(|| {
                let tls_opts = if site.tls { site.tls_opts.clone() } else { None };
                Arc::new(Listener::new(addr.clone(), tls_opts, config.live))
            });
            if site.tls != listener.is_tls() {
                warn!(
                    addr = %addr,
                    host = %site.host,
                    "Site TLS setting differs from the first site on this address, using the listener's"
                );
            }
            listener.add_site(site, &pools);
        }

        for listener in listeners.values() {
            let listener = Arc::clone(listener);
            tokio::spawn(async move {
                // Failures are logged by the listener itself
                let _ = listener.open().await;
            });
        }

        info!(listeners = listeners.len(), pools = pools.len(), "Server started");
        *generation = Some(Generation { listeners, pools });
    }

    /// Close every listener, wait for them, then shut the pools down.
    /// No-op when not running.
    pub async fn stop(&self) {
        let mut generation = self.generation.lock().await;
        let Some(current) = generation.take() else {
            debug!("Server not running");
            return;
        };

        info!(listeners = current.listeners.len(), "Stopping server");
        for listener in current.listeners.values() {
            listener.close();
        }
        futures::future::join_all(current.listeners.values().map(|l| l.closed())).await;

        let Generation { listeners, pools } = current;
        drop(listeners);
        pools.shutdown();
        drop(pools);

        info!("Server stopped");
        let _ = self.stopped_tx.send(());
    }

    /// Install a new configuration snapshot and stop. The next `start`
    /// builds from the new snapshot.
    pub async fn reload(&self, config: Arc<Config>) {
        info!(sites = config.sites.len(), "Reloading configuration");
        *self.config.write() = config;
        self.stop().await;
    }

    pub async fn is_running(&self) -> bool {
        self.generation.lock().await.is_some()
    }

    pub async fn fcgi_pool(&self, name: &str) -> Option<Arc<FcgiPool>> {
        let generation = self.generation.lock().await;
        generation.as_ref().and_then(|g| g.pools.fcgi(name))
    }

    pub async fn proxy_pool(&self, name: &str) -> Option<Arc<ProxyPool>> {
        let generation = self.generation.lock().await;
        generation.as_ref().and_then(|g| g.pools.proxy(name))
    }

    /// Addresses currently accepting connections
    pub async fn listening_addrs(&self) -> Vec<SocketAddr> {
        let generation = self.generation.lock().await;
        generation
            .as_ref()
            .map(|g| g.listeners.values().filter_map(|l| l.local_addr()).collect())
            .unwrap_or_default()
    }
}
