use std::path::PathBuf;
use std::sync::Arc;
use switchyard::config::{Config, DEFAULT_CONFIG_PATH};
use switchyard::server::Server;
use tracing::{error, info, warn};

/// Exit status used when a second shutdown signal arrives before the first finished
const FORCED_EXIT_CODE: i32 = 137;

enum Control {
    Shutdown(&'static str),
    Reload,
}

#[cfg(unix)]
struct Signals {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sighup: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    fn install() -> anyhow::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sighup: signal(SignalKind::hangup())?,
        })
    }

    async fn recv(&mut self) -> Control {
        tokio::select! {
            _ = self.sigint.recv() => Control::Shutdown("SIGINT"),
            _ = self.sigterm.recv() => Control::Shutdown("SIGTERM"),
            _ = self.sighup.recv() => Control::Reload,
        }
    }
}

#[cfg(not(unix))]
struct Signals;

#[cfg(not(unix))]
impl Signals {
    fn install() -> anyhow::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> Control {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        Control::Shutdown("Ctrl+C")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("switchyard=debug".parse().expect("valid log directive")),
        )
        .init();

    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(
        path = %config_path.display(),
        version = env!("CARGO_PKG_VERSION"),
        sites = config.sites.len(),
        "Configuration loaded"
    );

    let (server, mut stopped) = Server::new(Arc::new(config));
    let server = Arc::new(server);
    let mut signals = Signals::install()?;

    server.start().await;

    let mut shutting_down = false;
    loop {
        tokio::select! {
            event = stopped.recv() => {
                if event.is_none() || shutting_down {
                    break;
                }
                info!("Restarting server");
                server.start().await;
            }
            control = signals.recv() => match control {
                Control::Shutdown(signal) => {
                    if shutting_down {
                        warn!(signal, "Second shutdown signal, forcing exit");
                        std::process::exit(FORCED_EXIT_CODE);
                    }
                    info!(signal, "Shutting down");
                    shutting_down = true;
                    let server = Arc::clone(&server);
                    tokio::spawn(async move { server.stop().await });
                }
                Control::Reload => {
                    info!(path = %config_path.display(), "Received SIGHUP, reloading configuration");
                    match Config::load(&config_path) {
                        Ok(config) => {
                            let server = Arc::clone(&server);
                            tokio::spawn(async move { server.reload(Arc::new(config)).await });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to reload configuration, keeping the current one");
                        }
                    }
                }
            }
        }
    }

    info!("Shutdown complete");
    Ok(())
}
