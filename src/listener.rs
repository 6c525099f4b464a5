//! One bound address: its route table, its accept loop and its connections

use crate::config::{SiteConfig, TlsOpts};
use crate::error::{error_response, ConfigError, GatewayErrorCode, ListenerError};
use crate::fastcgi::FcgiHandler;
use crate::handler::{catch_internal_fault, GatewayBody, Handler};
use crate::pool::BackendPools;
use crate::proxy::ProxyHandler;
use crate::router::RouteTable;
use crate::static_files::FileServer;
use crate::tls;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONNECTION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// TCP keep-alive period applied to every accepted connection
pub const KEEPALIVE_PERIOD: Duration = Duration::from_secs(180);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Closed,
    Opening,
    Open,
    Closing,
}

struct Lifecycle {
    state: ListenerState,
    /// `open` was called, or `close` ran first and pre-empted it
    started: bool,
    /// The closed notification has gone out
    finished: bool,
}

/// A bound address serving one or more sites, plain or encrypted.
///
/// Sites are added while the listener is closed. [`Listener::open`] runs the
/// accept loop until [`Listener::close`] is called, after which every live
/// connection is dropped and the closed notification fires exactly once.
pub struct Listener {
    bind_addr: String,
    tls_opts: Option<TlsOpts>,
    live: bool,
    routes: Mutex<Option<Arc<RouteTable>>>,
    lifecycle: Mutex<Lifecycle>,
    local_addr: Mutex<Option<SocketAddr>>,
    shutdown: watch::Sender<bool>,
    closed: watch::Sender<bool>,
}

impl Listener {
    /// A plain listener when `tls_opts` is `None`, an encrypted one otherwise
    pub fn new(bind_addr: impl Into<String>, tls_opts: Option<TlsOpts>, live: bool) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (closed, _) = watch::channel(false);
        Self {
            bind_addr: bind_addr.into(),
            tls_opts,
            live,
            routes: Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle {
                state: ListenerState::Closed,
                started: false,
                finished: false,
            }),
            local_addr: Mutex::new(None),
            shutdown,
            closed,
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.bind_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls_opts.is_some()
    }

    pub fn state(&self) -> ListenerState {
        self.lifecycle.lock().state
    }

    /// The address actually bound, once open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    pub fn routes(&self) -> Option<Arc<RouteTable>> {
        self.routes.lock().clone()
    }

    /// Register a site's routes on this listener.
    ///
    /// The first site added also becomes the default for requests whose host
    /// matches no site. Ignored once the listener has been opened. A route
    /// that fails to register is logged and skipped.
    pub fn add_site(&self, site: &SiteConfig, pools: &BackendPools) {
        // Held for the whole registration so `open` cannot start midway
        let lifecycle = self.lifecycle.lock();
        if lifecycle.started {
            warn!(addr = %self.bind_addr, host = %site.host, "Listener already opened, site ignored");
            return;
        }

        let (table, first) = {
            let mut routes = self.routes.lock();
            let first = routes.is_none();
            let table = routes.get_or_insert_with(|| Arc::new(RouteTable::new())).clone();
            (table, first)
        };

        let handlers = self.site_handlers(site, pools);

        let mut scopes = vec![site.host.as_str()];
        if first && !site.host.is_empty() {
            scopes.push("");
        }

        for scope in scopes {
            for (pattern, is_regex, handler) in &handlers {
                if let Err(e) = table.register(pattern, scope, *is_regex, handler.clone()) {
                    self.log_route_error(site, pattern, &e);
                }
            }
        }
        drop(lifecycle);
    }

    fn site_handlers(&self, site: &SiteConfig, pools: &BackendPools) -> Vec<(String, bool, Handler)> {
        let mut handlers = Vec::new();

        if !site.root.is_empty() {
            info!(host = %site.host, addr = %self.bind_addr, root = %site.root, "Serving static files");
            let files = Arc::new(FileServer::new(&site.root));
            handlers.push(("/".to_string(), false, Handler::Static(files)));
        }

        for binding in &site.fcgi {
            let Some(pool) = pools.fcgi(&binding.server) else {
                error!(host = %site.host, server = %binding.server, "Unknown FastCGI group, binding skipped");
                continue;
            };
            info!(host = %site.host, pattern = %binding.pattern, server = %binding.server, "FastCGI route");
            let handler = FcgiHandler::new(pool, binding.clone(), self.bind_addr.clone(), self.live);
            handlers.push((binding.pattern.clone(), true, Handler::FastCgi(Arc::new(handler))));
        }

        for binding in &site.proxy {
            let Some(pool) = pools.proxy(&binding.server) else {
                error!(host = %site.host, server = %binding.server, "Unknown proxy group, binding skipped");
                continue;
            };
            info!(host = %site.host, pattern = %binding.pattern, server = %binding.server, "Proxy route");
            let handler = ProxyHandler::new(pool, self.live);
            handlers.push((binding.pattern.clone(), true, Handler::Proxy(Arc::new(handler))));
        }

        handlers
    }

    fn log_route_error(&self, site: &SiteConfig, pattern: &str, e: &ConfigError) {
        error!(
            addr = %self.bind_addr,
            host = %site.host,
            pattern,
            error = %e,
            "Failed to register route"
        );
    }

    /// Bind and serve until closed.
    ///
    /// Returns once the accept loop has stopped. The closed notification is
    /// emitted on every exit path, including a failed bind.
    pub async fn open(&self) -> Result<(), ListenerError> {
        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.started {
                return Err(ListenerError::AlreadyOpened(self.bind_addr.clone()));
            }
            lifecycle.started = true;
            lifecycle.state = ListenerState::Opening;
        }

        let shutdown_rx = self.shutdown.subscribe();
        let result = self.accept_loop(shutdown_rx).await;
        if let Err(e) = &result {
            error!(addr = %self.bind_addr, error = %e, "Listener failed");
        }
        self.finish();
        result
    }

    async fn accept_loop(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), ListenerError> {
        let acceptor = match &self.tls_opts {
            Some(opts) => Some(tls::acceptor(opts)?),
            None => None,
        };

        let bind_error = |source: io::Error| ListenerError::Bind {
            addr: self.bind_addr.clone(),
            source,
        };
        let listener = TcpListener::bind(&self.bind_addr).await.map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;
        *self.local_addr.lock() = Some(local_addr);

        {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.state == ListenerState::Opening {
                lifecycle.state = ListenerState::Open;
            }
        }

        let routes = self.routes().unwrap_or_default();
        let protocol = if acceptor.is_some() { "HTTPS" } else { "HTTP" };
        info!(addr = %local_addr, protocol, routes = routes.len(), "Listener open");

        loop {
            tokio::select! {
                biased;

                _ = closed_signal(&mut shutdown_rx) => {
                    info!(addr = %local_addr, "Listener closing");
                    break;
                }
                result = listener.accept() => {
                    match result {
                        Ok((stream, remote_addr)) => {
                            if let Err(e) = enable_keepalive(&stream) {
                                debug!(addr = %remote_addr, error = %e, "Failed to set TCP keep-alive");
                            }

                            let routes = Arc::clone(&routes);
                            let acceptor = acceptor.clone();
                            let live = self.live;
                            let mut conn_shutdown = shutdown_rx.clone();

                            tokio::spawn(async move {
                                tokio::select! {
                                    _ = handle_connection(stream, remote_addr, acceptor, routes, live) => {}
                                    _ = closed_signal(&mut conn_shutdown) => {
                                        debug!(addr = %remote_addr, "Dropping connection, listener closed");
                                    }
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        Ok(())
    }

    /// Stop accepting and drop every connection. Idempotent.
    ///
    /// Closing a listener whose `open` has not run yet emits the closed
    /// notification directly, and the later `open` does nothing.
    pub fn close(&self) {
        let never_opened = {
            let mut lifecycle = self.lifecycle.lock();
            let state = lifecycle.state;
            match state {
                ListenerState::Closing => return,
                ListenerState::Closed if lifecycle.finished => return,
                ListenerState::Closed => {
                    lifecycle.started = true;
                    true
                }
                ListenerState::Opening | ListenerState::Open => {
                    lifecycle.state = ListenerState::Closing;
                    false
                }
            }
        };

        self.shutdown.send_replace(true);
        if never_opened {
            debug!(addr = %self.bind_addr, "Closed before opening");
            self.finish();
        }
    }

    fn finish(&self) {
        let mut lifecycle = self.lifecycle.lock();
        lifecycle.state = ListenerState::Closed;
        if !lifecycle.finished {
            lifecycle.finished = true;
            self.closed.send_replace(true);
        }
    }

    /// Resolves once the listener has fully closed
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

async fn closed_signal(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|closed| *closed).await;
}

fn enable_keepalive(stream: &TcpStream) -> io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    #[cfg(any(target_os = "linux", target_os = "macos", windows))]
    let keepalive = keepalive.with_interval(KEEPALIVE_PERIOD);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    routes: Arc<RouteTable>,
    live: bool,
) {
    let Some(acceptor) = acceptor else {
        if let Err(e) = serve_http(stream, remote_addr, routes, live).await {
            debug!(addr = %remote_addr, error = %e, "Connection error");
        }
        return;
    };

    match acceptor.accept(stream).await {
        Ok(tls_stream) => {
            if let Err(e) = serve_http(tls_stream, remote_addr, routes, live).await {
                debug!(addr = %remote_addr, error = %e, "TLS connection error");
            }
        }
        Err(e) => {
            debug!(addr = %remote_addr, error = %e, "TLS handshake failed");
        }
    }
}

async fn serve_http<S>(
    stream: S,
    remote_addr: SocketAddr,
    routes: Arc<RouteTable>,
    live: bool,
) -> Result<(), hyper::Error>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let routes = Arc::clone(&routes);
        async move { Ok::<_, Infallible>(handle_request(req, remote_addr, routes, live).await) }
    });

    http1::Builder::new()
        .keep_alive(true)
        .serve_connection(io, service)
        .await
}

async fn handle_request(
    req: Request<Incoming>,
    remote_addr: SocketAddr,
    routes: Arc<RouteTable>,
    live: bool,
) -> Response<GatewayBody> {
    if req.uri() == "*" {
        let mut response = error_response(GatewayErrorCode::BadRequest, None);
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
        return response;
    }

    catch_internal_fault(
        async move {
            let (handler, pattern) = routes.dispatch_request(&req);
            debug!(
                method = %req.method(),
                path = %req.uri().path(),
                handler = handler.kind(),
                pattern = %pattern,
                "Dispatching request"
            );
            handler.serve(req, remote_addr).await
        },
        live,
    )
    .await
}
