//! FastCGI request handler: CGI parameter construction and response mapping

use crate::config::FcgiBinding;
use crate::error::{error_response, BackendError, GatewayErrorCode};
use crate::fcgi::FcgiResponse;
use crate::handler::{full_body, GatewayBody};
use crate::pool::FcgiPool;
use chrono::Utc;
use http_body_util::BodyExt;
use hyper::body::{Body, Bytes};
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, COOKIE, LOCATION};
use hyper::http::request::Parts;
use hyper::{Method, Request, Response, StatusCode};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

const SERVER_SOFTWARE: &str = concat!("switchyard/", env!("CARGO_PKG_VERSION"));
const DEFAULT_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Serves requests matched by one FastCGI binding
pub struct FcgiHandler {
    pool: Arc<FcgiPool>,
    binding: FcgiBinding,
    /// Listener address (`ip:port`) reported as SERVER_ADDR/SERVER_PORT
    server_addr: String,
    live: bool,
}

impl FcgiHandler {
    pub fn new(pool: Arc<FcgiPool>, binding: FcgiBinding, server_addr: impl Into<String>, live: bool) -> Self {
        Self {
            pool,
            binding,
            server_addr: server_addr.into(),
            live,
        }
    }

    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    pub async fn serve<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Response<GatewayBody>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        match self.exchange(req, remote_addr).await {
            Ok(response) => response,
            Err(e) => {
                if !e.is_quiet() {
                    warn!(pool = %self.pool.name(), error = %e, "FastCGI request failed");
                }
                let detail = e.to_string();
                let detail = if self.live { None } else { Some(detail.as_str()) };
                error_response(GatewayErrorCode::BackendFailed, detail)
            }
        }
    }

    async fn exchange<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Result<Response<GatewayBody>, BackendError>
    where
        B: Body<Data = Bytes>,
        B::Error: Display,
    {
        let client = self.pool.submit().await??;

        let (parts, body) = req.into_parts();
        let body = if carries_body(&parts.method) {
            body.collect()
                .await
                .map_err(|e| BackendError::Body(e.to_string()))?
                .to_bytes()
        } else {
            Bytes::new()
        };

        let params = build_params(
            &parts,
            body.len(),
            remote_addr,
            &self.server_addr,
            &self.binding,
            Utc::now().timestamp(),
        );
        debug!(server = %client.addr(), script = ?params.get("SCRIPT_FILENAME"), "FastCGI request");

        let response = client.request(&params, &body).await?;
        Ok(map_response(response))
    }
}

/// Methods that receive QUERY_STRING
fn carries_query(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS | Method::DELETE)
}

/// Methods that receive CONTENT_TYPE/CONTENT_LENGTH and a request body
fn carries_body(method: &Method) -> bool {
    matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::OPTIONS | Method::DELETE
    )
}

/// Build the CGI parameter set for one request
pub fn build_params(
    parts: &Parts,
    body_len: usize,
    remote_addr: SocketAddr,
    server_addr: &str,
    binding: &FcgiBinding,
    request_time: i64,
) -> BTreeMap<String, String> {
    let (server_host, server_port) = server_addr.rsplit_once(':').unwrap_or((server_addr, ""));
    let path = parts.uri.path();
    let request_uri = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or(path);

    let mut params = BTreeMap::new();
    params.insert("SCRIPT_FILENAME".to_string(), script_filename(binding, path));
    params.insert("SCRIPT_NAME".to_string(), path.to_string());
    params.insert("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string());
    params.insert("SERVER_SOFTWARE".to_string(), SERVER_SOFTWARE.to_string());
    params.insert("REQUEST_URI".to_string(), request_uri.to_string());
    params.insert("REQUEST_METHOD".to_string(), parts.method.to_string());
    params.insert("SERVER_PROTOCOL".to_string(), format!("{:?}", parts.version));
    params.insert("REMOTE_ADDR".to_string(), remote_addr.ip().to_string());
    params.insert("REMOTE_PORT".to_string(), remote_addr.port().to_string());
    params.insert("SERVER_ADDR".to_string(), server_host.to_string());
    params.insert("SERVER_PORT".to_string(), server_port.to_string());

    for name in parts.headers.keys() {
        if *name == COOKIE {
            continue;
        }
        let key = format!("HTTP_{}", name.as_str().to_uppercase().replace('-', "_"));
        if params.contains_key(&key) {
            continue;
        }
        let values: Vec<&str> = parts
            .headers
            .get_all(name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if !values.is_empty() {
            params.insert(key, values.join(", "));
        }
    }

    params
        .entry("HTTP_HOST".to_string())
        .or_insert_with(|| server_host.to_string());
    params
        .entry("HTTP_CONNECTION".to_string())
        .or_insert_with(|| "keep-alive".to_string());

    let cookies = cookie_header(parts);
    if !cookies.is_empty() {
        params.insert("HTTP_COOKIE".to_string(), cookies);
    }

    params.insert("REQUEST_TIME".to_string(), request_time.to_string());

    if carries_query(&parts.method) {
        params.insert(
            "QUERY_STRING".to_string(),
            parts.uri.query().unwrap_or_default().to_string(),
        );
    }

    if carries_body(&parts.method) {
        let content_type = parts
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .unwrap_or(DEFAULT_CONTENT_TYPE);
        params.insert("CONTENT_TYPE".to_string(), content_type.to_string());

        let declared = parts
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.parse::<u64>().is_ok());
        if let Some(length) = declared {
            params.insert("CONTENT_LENGTH".to_string(), length.to_string());
        } else if body_len > 0 {
            params.insert("CONTENT_LENGTH".to_string(), body_len.to_string());
        }
    }

    for (key, value) in &binding.params {
        params.insert(key.clone(), value.clone());
    }

    params
}

/// SCRIPT_FILENAME: first `%s` of the template replaced by the path, with
/// the index file appended to directory results
fn script_filename(binding: &FcgiBinding, path: &str) -> String {
    let mut filename = if binding.script.is_empty() {
        path.to_string()
    } else {
        binding.script.replacen("%s", path, 1)
    };
    if !binding.index.is_empty() && filename.ends_with('/') {
        filename.push_str(&binding.index);
    }
    filename
}

/// All request cookies, sanitized and joined with `"; "`
fn cookie_header(parts: &Parts) -> String {
    let mut cookies = Vec::new();
    for header in parts.headers.get_all(COOKIE) {
        let Ok(header) = header.to_str() else {
            continue;
        };
        for pair in header.split(';') {
            let pair = pair.trim();
            if pair.is_empty() {
                continue;
            }
            let (name, value) = pair.split_once('=').unwrap_or((pair, ""));
            let name = name.trim();
            if name.is_empty() || !name.bytes().all(is_token_byte) {
                continue;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .unwrap_or(value);
            cookies.push(format!(
                "{}={}",
                sanitize_cookie_name(name),
                sanitize_cookie_value(value)
            ));
        }
    }
    cookies.join("; ")
}

fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

pub fn sanitize_cookie_name(name: &str) -> String {
    name.replace(['\n', '\r'], "-")
}

fn valid_cookie_value_byte(b: u8) -> bool {
    (0x20..0x7f).contains(&b) && b != b'"' && b != b';' && b != b'\\'
}

/// Drop bytes not allowed in a cookie value; quote values that start or
/// end with a space or comma
pub fn sanitize_cookie_value(value: &str) -> String {
    let value: String = if value.bytes().all(valid_cookie_value_byte) {
        value.to_string()
    } else {
        debug!(value, "Dropping invalid bytes from cookie value");
        value
            .chars()
            .filter(|c| c.is_ascii() && valid_cookie_value_byte(*c as u8))
            .collect()
    };

    if value.is_empty() {
        return value;
    }
    let needs_quotes = value.starts_with([' ', ',']) || value.ends_with([' ', ',']);
    if needs_quotes {
        format!("\"{}\"", value)
    } else {
        value
    }
}

/// Turn a CGI response into an HTTP response.
///
/// `Status` sets the status code and is not forwarded; `Location` without
/// `Status` means 302; everything else is copied, repeated names appended.
pub fn map_response(response: FcgiResponse) -> Response<GatewayBody> {
    let mut status = None;
    let mut location = false;
    let mut builder = Response::builder();

    for (name, value) in &response.headers {
        if name.eq_ignore_ascii_case("status") {
            if status.is_none() {
                status = value
                    .split_whitespace()
                    .next()
                    .and_then(|code| code.parse::<u16>().ok())
                    .and_then(|code| StatusCode::from_u16(code).ok());
                if status.is_none() {
                    debug!(value = %value, "Ignoring unparsable Status header");
                }
            }
            continue;
        }

        let (Ok(header_name), Ok(header_value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) else {
            debug!(header = %name, "Skipping invalid FastCGI response header");
            continue;
        };
        if header_name == LOCATION {
            location = true;
        }
        if let Some(headers) = builder.headers_mut() {
            headers.append(header_name, header_value);
        }
    }

    let status = status.unwrap_or(if location {
        StatusCode::FOUND
    } else {
        StatusCode::OK
    });

    builder
        .status(status)
        .body(full_body(response.body))
        .expect("valid response builder")
}
