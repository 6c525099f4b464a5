//! Request handlers a route can resolve to

use crate::error::{error_response, GatewayErrorCode};
use crate::fastcgi::FcgiHandler;
use crate::proxy::ProxyHandler;
use crate::static_files::FileServer;
use futures::FutureExt;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response, StatusCode};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::error;

/// Response body type shared by every handler
pub type GatewayBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(bytes: impl Into<Bytes>) -> GatewayBody {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

pub fn empty_body() -> GatewayBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

/// What a route entry dispatches to
#[derive(Clone)]
pub enum Handler {
    /// Files under a document root
    Static(Arc<FileServer>),
    /// A FastCGI server group
    FastCgi(Arc<FcgiHandler>),
    /// A reverse-proxy server group
    Proxy(Arc<ProxyHandler>),
    /// Permanent redirect to the given location
    Redirect(String),
    NotFound,
}

impl Handler {
    pub fn kind(&self) -> &'static str {
        match self {
            Handler::Static(_) => "static",
            Handler::FastCgi(_) => "fastcgi",
            Handler::Proxy(_) => "proxy",
            Handler::Redirect(_) => "redirect",
            Handler::NotFound => "not-found",
        }
    }

    pub async fn serve(&self, req: Request<Incoming>, remote_addr: SocketAddr) -> Response<GatewayBody> {
        match self {
            Handler::Static(files) => files.serve(&req).await,
            Handler::FastCgi(fcgi) => fcgi.serve(req, remote_addr).await,
            Handler::Proxy(proxy) => proxy.serve(req, remote_addr).await,
            Handler::Redirect(location) => redirect_response(location),
            Handler::NotFound => error_response(GatewayErrorCode::NotFound, None),
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handler::Static(files) => f.debug_tuple("Static").field(&files.root()).finish(),
            Handler::FastCgi(fcgi) => f.debug_tuple("FastCgi").field(&fcgi.pool_name()).finish(),
            Handler::Proxy(proxy) => f.debug_tuple("Proxy").field(&proxy.pool_name()).finish(),
            Handler::Redirect(location) => f.debug_tuple("Redirect").field(location).finish(),
            Handler::NotFound => f.write_str("NotFound"),
        }
    }
}

/// Build a 301 Moved Permanently response
pub fn redirect_response(location: &str) -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body("Moved Permanently"))
        .unwrap_or_else(|_| {
            // Location contained bytes that are not a valid header value
            error_response(GatewayErrorCode::BadRequest, None)
        })
}

/// Run a request future, converting a panic into an internal-error response.
///
/// The panic message is included in the body only when `live` is off.
pub async fn catch_internal_fault<F>(fut: F, live: bool) -> Response<GatewayBody>
where
    F: Future<Output = Response<GatewayBody>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!(error = %message, "Request handler panicked");
            let detail = if live { None } else { Some(message.as_str()) };
            error_response(GatewayErrorCode::InternalError, detail)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
