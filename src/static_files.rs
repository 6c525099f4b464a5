//! Static file serving from a site's document root

use crate::error::{error_response, GatewayErrorCode};
use crate::handler::{empty_body, full_body, redirect_response, GatewayBody};
use chrono::{DateTime, Utc};
use futures::{future, StreamExt};
use http_body_util::{BodyExt, StreamBody};
use hyper::body::Frame;
use hyper::header::{HeaderValue, ALLOW, CONTENT_LENGTH, CONTENT_TYPE, LAST_MODIFIED};
use hyper::{Method, Request, Response, StatusCode};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

const INDEX_FILE: &str = "index.html";

/// Serves files below `root`, answering GET and HEAD only
#[derive(Debug)]
pub struct FileServer {
    root: PathBuf,
}

impl FileServer {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub async fn serve<B>(&self, req: &Request<B>) -> Response<GatewayBody> {
        let method = req.method();
        if method != Method::GET && method != Method::HEAD {
            let mut response = plain(StatusCode::METHOD_NOT_ALLOWED, "405: Method Not Allowed");
            response
                .headers_mut()
                .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
            return response;
        }

        let url_path = req.uri().path();
        let Some(relative) = resolve(url_path) else {
            debug!(path = %url_path, "Rejected static path");
            return error_response(GatewayErrorCode::NotFound, None);
        };
        let mut path = self.root.join(relative);

        let mut metadata = match tokio::fs::metadata(&path).await {
            Ok(m) => m,
            Err(e) => return io_error_response(&path, e),
        };

        if metadata.is_dir() {
            if !url_path.ends_with('/') {
                return redirect_response(&format!("{}/", url_path));
            }
            path.push(INDEX_FILE);
            metadata = match tokio::fs::metadata(&path).await {
                Ok(m) if m.is_file() => m,
                Ok(_) => return error_response(GatewayErrorCode::NotFound, None),
                Err(e) => return io_error_response(&path, e),
            };
        } else if url_path.ends_with('/') {
            return redirect_response(url_path.trim_end_matches('/'));
        }

        let content_type = mime_guess::from_path(&path)
            .first_raw()
            .unwrap_or("application/octet-stream");

        let mut builder = Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, content_type)
            .header(CONTENT_LENGTH, metadata.len());
        if let Ok(modified) = metadata.modified() {
            let modified: DateTime<Utc> = modified.into();
            builder = builder.header(
                LAST_MODIFIED,
                modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            );
        }

        let body = if method == Method::HEAD {
            empty_body()
        } else {
            match File::open(&path).await {
                Ok(file) => file_body(file, path),
                Err(e) => return io_error_response(&path, e),
            }
        };

        builder.body(body).expect("valid response builder")
    }
}

/// Stream `file` in chunks. A read error ends the body short of its
/// declared length, which aborts the connection.
fn file_body(file: File, path: PathBuf) -> GatewayBody {
    let frames = ReaderStream::new(file).scan(path, |path, chunk| {
        future::ready(match chunk {
            Ok(bytes) => Some(Ok::<_, hyper::Error>(Frame::data(bytes))),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read static file");
                None
            }
        })
    });
    BodyExt::boxed(StreamBody::new(frames))
}

/// Translate a URL path into a relative filesystem path.
///
/// Each segment is percent-decoded on its own; segments that would escape
/// the root or smuggle separators are rejected.
fn resolve(url_path: &str) -> Option<PathBuf> {
    let mut relative = PathBuf::new();
    for segment in url_path.split('/') {
        if segment.is_empty() || segment == "." {
            continue;
        }
        let decoded = urlencoding::decode(segment).ok()?;
        if decoded == ".." || decoded.contains(['/', '\\', '\0']) {
            return None;
        }
        relative.push(decoded.as_ref());
    }
    Some(relative)
}

fn io_error_response(path: &Path, e: io::Error) -> Response<GatewayBody> {
    match e.kind() {
        io::ErrorKind::NotFound => error_response(GatewayErrorCode::NotFound, None),
        io::ErrorKind::PermissionDenied => plain(StatusCode::FORBIDDEN, "403: Forbidden"),
        _ => {
            warn!(path = %path.display(), error = %e, "Failed to read static file");
            error_response(GatewayErrorCode::InternalError, None)
        }
    }
}

fn plain(status: StatusCode, text: &'static str) -> Response<GatewayBody> {
    Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(text))
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(uri: &str) -> Request<()> {
        Request::builder().uri(uri).body(()).unwrap()
    }

    async fn body_text(response: Response<GatewayBody>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn site() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), "<h1>home</h1>").unwrap();
        std::fs::write(dir.path().join("style.css"), "body {}").unwrap();
        std::fs::create_dir(dir.path().join("docs")).unwrap();
        std::fs::write(dir.path().join("docs/index.html"), "docs").unwrap();
        std::fs::write(dir.path().join("docs/a b.txt"), "spaced").unwrap();
        dir
    }

    #[test]
    fn test_resolve() {
        assert_eq!(resolve("/"), Some(PathBuf::new()));
        assert_eq!(resolve("/docs/a%20b.txt"), Some(PathBuf::from("docs/a b.txt")));
        assert_eq!(resolve("/a/./b"), Some(PathBuf::from("a/b")));
        assert_eq!(resolve("/%2e%2e/etc/passwd"), None);
        assert_eq!(resolve("/a%2fb"), None);
        assert_eq!(resolve("/a%00"), None);
    }

    #[tokio::test]
    async fn test_serves_file_with_mime_type() {
        let dir = site();
        let files = FileServer::new(dir.path());

        let response = files.serve(&get("/style.css")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_TYPE).unwrap(), "text/css");
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "7");
        assert!(response.headers().contains_key(LAST_MODIFIED));
        assert_eq!(body_text(response).await, "body {}");
    }

    #[tokio::test]
    async fn test_large_file_is_streamed_whole() {
        let dir = site();
        let contents: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(dir.path().join("blob.bin"), &contents).unwrap();
        let files = FileServer::new(dir.path());

        let response = files.serve(&get("/blob.bin")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(CONTENT_LENGTH).unwrap(),
            &contents.len().to_string()
        );

        let mut body = response.into_body();
        let mut frames = 0;
        let mut received = Vec::new();
        while let Some(frame) = body.frame().await {
            if let Ok(data) = frame.unwrap().into_data() {
                frames += 1;
                received.extend_from_slice(&data);
            }
        }
        assert!(frames > 1);
        assert_eq!(received, contents);
    }

    #[tokio::test]
    async fn test_directory_index() {
        let dir = site();
        let files = FileServer::new(dir.path());

        let response = files.serve(&get("/")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "<h1>home</h1>");

        let response = files.serve(&get("/docs/")).await;
        assert_eq!(body_text(response).await, "docs");
    }

    #[tokio::test]
    async fn test_directory_without_slash_redirects() {
        let dir = site();
        let files = FileServer::new(dir.path());

        let response = files.serve(&get("/docs")).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers().get("Location").unwrap(), "/docs/");
    }

    #[tokio::test]
    async fn test_percent_encoded_name() {
        let dir = site();
        let files = FileServer::new(dir.path());

        let response = files.serve(&get("/docs/a%20b.txt")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "spaced");
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = site();
        let files = FileServer::new(dir.path());

        let response = files.serve(&get("/nope.html")).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_head_has_no_body() {
        let dir = site();
        let files = FileServer::new(dir.path());

        let req = Request::builder()
            .method(Method::HEAD)
            .uri("/style.css")
            .body(())
            .unwrap();
        let response = files.serve(&req).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers().get(CONTENT_LENGTH).unwrap(), "7");
        assert_eq!(body_text(response).await, "");
    }

    #[tokio::test]
    async fn test_post_not_allowed() {
        let dir = site();
        let files = FileServer::new(dir.path());

        let req = Request::builder()
            .method(Method::POST)
            .uri("/index.html")
            .body(())
            .unwrap();
        let response = files.serve(&req).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers().get(ALLOW).unwrap(), "GET, HEAD");
    }
}
