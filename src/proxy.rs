//! Reverse-proxy client bound to one upstream base URL

use crate::error::{error_response, BackendError, ConfigError, GatewayErrorCode};
use crate::handler::GatewayBody;
use crate::pool::ProxyPool;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION};
use hyper::{Request, Response, Uri, Version};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Headers that describe a single connection and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Long-lived HTTP client for one upstream
#[derive(Debug)]
pub struct ProxyClient {
    base_url: String,
    base: Uri,
    client: Client<HttpConnector, GatewayBody>,
}

impl ProxyClient {
    pub fn new(base_url: &str) -> Result<Self, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidUpstream {
            url: base_url.to_string(),
            reason: reason.to_string(),
        };

        let base: Uri = base_url.parse().map_err(|_| invalid("not a valid URL"))?;
        match base.scheme_str() {
            Some("http") => {}
            Some(_) => return Err(invalid("only http upstreams are supported")),
            None => return Err(invalid("missing scheme")),
        }
        if base.authority().is_none() {
            return Err(invalid("missing host"));
        }

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        Ok(Self {
            base_url: base_url.to_string(),
            base,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Map a request URI onto the upstream: base path joined with the
    /// request path by a single slash, queries combined with `&`
    pub fn upstream_uri(&self, uri: &Uri) -> Result<Uri, BackendError> {
        let path = join_paths(self.base.path(), uri.path());
        let query = match (self.base.query(), uri.query()) {
            (Some(a), Some(b)) if !a.is_empty() && !b.is_empty() => Some(format!("{}&{}", a, b)),
            (Some(a), _) if !a.is_empty() => Some(a.to_string()),
            (_, Some(b)) => Some(b.to_string()),
            _ => None,
        };

        let path_and_query = match query {
            Some(q) => format!("{}?{}", path, q),
            None => path,
        };

        Uri::builder()
            .scheme("http")
            .authority(self.base.authority().map(|a| a.as_str()).unwrap_or_default())
            .path_and_query(path_and_query)
            .build()
            .map_err(|e| BackendError::Upstream(e.to_string()))
    }

    /// Forward a request to the upstream and return its response
    pub async fn forward<B>(
        &self,
        req: Request<B>,
        client_addr: SocketAddr,
    ) -> Result<Response<GatewayBody>, BackendError>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let uri = self.upstream_uri(req.uri())?;
        let (parts, body) = req.into_parts();

        let mut headers = parts.headers;
        remove_hop_headers(&mut headers);
        append_forwarded_for(&mut headers, client_addr);

        let mut builder = Request::builder()
            .method(parts.method)
            .uri(&uri)
            .version(Version::HTTP_11);
        for (key, value) in headers.iter() {
            builder = builder.header(key, value);
        }
        let upstream_req = builder
            .body(body.boxed())
            .map_err(|e| BackendError::Upstream(e.to_string()))?;

        debug!(upstream = %uri, "Forwarding request");

        let response = self
            .client
            .request(upstream_req)
            .await
            .map_err(|e| BackendError::Upstream(e.to_string()))?;

        let (mut parts, body) = response.into_parts();
        remove_hop_headers(&mut parts.headers);
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Strip hop-by-hop headers, including any named in `Connection`
pub fn remove_hop_headers(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|token| HeaderName::from_bytes(token.trim().as_bytes()).ok())
        .collect();
    for name in named {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Add the client IP to `X-Forwarded-For`, keeping earlier hops
fn append_forwarded_for(headers: &mut HeaderMap, client_addr: SocketAddr) {
    let ip = client_addr.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all(X_FORWARDED_FOR)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();
    let value = if prior.is_empty() {
        ip
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert(X_FORWARDED_FOR, value);
    }
}

/// Routes requests through a proxy group
pub struct ProxyHandler {
    pool: Arc<ProxyPool>,
    live: bool,
}

impl ProxyHandler {
    pub fn new(pool: Arc<ProxyPool>, live: bool) -> Self {
        Self { pool, live }
    }

    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    pub async fn serve<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes, Error = hyper::Error> + Send + Sync + 'static,
    {
        let result = match self.pool.submit().await {
            Ok(client) => client.forward(req, remote_addr).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(response) => response,
            Err(e) => {
                if !e.is_quiet() {
                    warn!(pool = %self.pool.name(), error = %e, "Proxy request failed");
                }
                let detail = e.to_string();
                let detail = if self.live { None } else { Some(detail.as_str()) };
                error_response(GatewayErrorCode::UpstreamFailed, detail)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::full_body;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::StatusCode;
    use hyper_util::rt::TokioIo;
    use tokio::net::TcpListener;

    /// Upstream that echoes what it received in response headers
    async fn echo_upstream() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                tokio::spawn(async move {
                    let service = service_fn(|req: Request<Incoming>| async move {
                        let uri = req.uri().to_string();
                        let xff = req
                            .headers()
                            .get(X_FORWARDED_FOR)
                            .map(|v| v.to_str().unwrap().to_string())
                            .unwrap_or_default();
                        let custom = req.headers().contains_key("x-drop-me");
                        let body = req.into_body().collect().await?.to_bytes();
                        Ok::<_, hyper::Error>(
                            Response::builder()
                                .header("x-seen-uri", uri)
                                .header("x-seen-xff", xff)
                                .header("x-seen-custom", custom.to_string())
                                .header("keep-alive", "timeout=5")
                                .body(full_body(body))
                                .unwrap(),
                        )
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        addr
    }

    fn client_addr() -> SocketAddr {
        "10.1.2.3:5555".parse().unwrap()
    }

    #[test]
    fn test_new_rejects_unsupported_urls() {
        assert!(ProxyClient::new("https://upstream.local").is_err());
        assert!(ProxyClient::new("/relative").is_err());
        assert!(ProxyClient::new("not a url").is_err());
    }

    #[tokio::test]
    async fn test_upstream_uri() {
        let client = ProxyClient::new("http://127.0.0.1:8080/base").unwrap();
        let uri: Uri = "/users?page=2".parse().unwrap();
        assert_eq!(
            client.upstream_uri(&uri).unwrap().to_string(),
            "http://127.0.0.1:8080/base/users?page=2"
        );

        let client = ProxyClient::new("http://127.0.0.1:8080/base/?key=1").unwrap();
        assert_eq!(
            client.upstream_uri(&uri).unwrap().to_string(),
            "http://127.0.0.1:8080/base/users?key=1&page=2"
        );

        let client = ProxyClient::new("http://127.0.0.1:8080").unwrap();
        let uri: Uri = "/".parse().unwrap();
        assert_eq!(
            client.upstream_uri(&uri).unwrap().to_string(),
            "http://127.0.0.1:8080/"
        );
    }

    #[test]
    fn test_remove_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("connection", HeaderValue::from_static("keep-alive, x-drop-me"));
        headers.insert("x-drop-me", HeaderValue::from_static("1"));
        headers.insert("upgrade", HeaderValue::from_static("websocket"));
        headers.insert("x-keep-me", HeaderValue::from_static("1"));

        remove_hop_headers(&mut headers);
        assert!(!headers.contains_key("connection"));
        assert!(!headers.contains_key("x-drop-me"));
        assert!(!headers.contains_key("upgrade"));
        assert!(headers.contains_key("x-keep-me"));
    }

    #[test]
    fn test_append_forwarded_for() {
        let mut headers = HeaderMap::new();
        append_forwarded_for(&mut headers, client_addr());
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "10.1.2.3");

        let mut headers = HeaderMap::new();
        headers.insert(X_FORWARDED_FOR, HeaderValue::from_static("192.0.2.1"));
        append_forwarded_for(&mut headers, client_addr());
        assert_eq!(headers.get(X_FORWARDED_FOR).unwrap(), "192.0.2.1, 10.1.2.3");
    }

    #[tokio::test]
    async fn test_forward_to_upstream() {
        let upstream = echo_upstream().await;
        let client = ProxyClient::new(&format!("http://{}/app", upstream)).unwrap();

        let req = Request::builder()
            .method("POST")
            .uri("/items?id=9")
            .header("host", "gateway.local")
            .header("connection", "x-drop-me")
            .header("x-drop-me", "secret")
            .body(full_body("payload"))
            .unwrap();

        let response = client.forward(req, client_addr()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get("x-seen-uri").unwrap(), "/app/items?id=9");
        assert_eq!(response.headers().get("x-seen-xff").unwrap(), "10.1.2.3");
        assert_eq!(response.headers().get("x-seen-custom").unwrap(), "false");
        assert!(!response.headers().contains_key("keep-alive"));

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"payload");
    }

    #[tokio::test]
    async fn test_handler_reports_unreachable_upstream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let pool = Arc::new(ProxyPool::proxy("api", &[format!("http://{}", addr)]).unwrap());
        let handler = ProxyHandler::new(Arc::clone(&pool), false);
        let req = Request::builder().uri("/").body(full_body("")).unwrap();

        let response = handler.serve(req, client_addr()).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.starts_with("502: Bad Gateway\nupstream request failed"));

        let quiet = ProxyHandler::new(pool, true);
        let req = Request::builder().uri("/").body(full_body("")).unwrap();
        let response = quiet.serve(req, client_addr()).await;
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"502: Bad Gateway");
    }
}
