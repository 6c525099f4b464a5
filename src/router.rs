//! Host- and pattern-aware request routing
//!
//! A [`RouteTable`] maps an incoming `(host, path)` pair to a [`Handler`].
//! Two kinds of entries exist:
//!
//! - literal patterns such as `/static/` or `example.com/`, matched exactly
//!   or, when they end in `/`, as a prefix of `host + path`
//! - regular expressions scoped to a host (or to every host when the scope is
//!   empty), matched against the path alone
//!
//! Among all matching entries the longest pattern wins. Entries are kept in
//! registration order so that equal-length matches resolve to the entry that
//! was registered first.
//!
//! Host-scoped entries are consulted before host-agnostic ones; the
//! host-agnostic pass only runs when the scoped pass found nothing.

use crate::error::ConfigError;
use crate::handler::Handler;
use hyper::{Method, Request};
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;

enum Matcher {
    Literal,
    Regex(Regex),
}

struct RouteEntry {
    /// Pattern used for matching and for longest-match comparison
    pattern: String,
    /// Pattern reported to callers (differs for implicit redirects)
    reported: String,
    host_scope: String,
    explicit: bool,
    matcher: Matcher,
    handler: Handler,
}

impl RouteEntry {
    fn matches(&self, host: &str, path: &str) -> bool {
        match &self.matcher {
            Matcher::Regex(re) => self.host_scope == host && re.is_match(path),
            Matcher::Literal => {
                if host.is_empty() {
                    path_match(&self.pattern, path)
                } else {
                    path_match(&self.pattern, &format!("{}{}", host, path))
                }
            }
        }
    }
}

#[derive(Default)]
struct Routes {
    entries: Vec<RouteEntry>,
    /// (host scope, pattern) -> position in `entries`
    index: HashMap<(String, String), usize>,
    /// Whether any entry is restricted to a host
    hosts: bool,
}

impl Routes {
    fn is_explicit(&self, key: &(String, String)) -> bool {
        self.index
            .get(key)
            .map(|&i| self.entries[i].explicit)
            .unwrap_or(false)
    }

    /// Insert a new entry, replacing an implicit one registered under the same key
    fn upsert(&mut self, entry: RouteEntry) {
        let key = (entry.host_scope.clone(), entry.pattern.clone());
        match self.index.get(&key) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index.insert(key, self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    fn find(&self, host: &str, path: &str) -> Option<(Handler, String)> {
        let mut best: Option<&RouteEntry> = None;
        for entry in &self.entries {
            if !entry.matches(host, path) {
                continue;
            }
            if best.map_or(true, |b| entry.pattern.len() > b.pattern.len()) {
                best = Some(entry);
            }
        }
        best.map(|e| (e.handler.clone(), e.reported.clone()))
    }
}

/// Routing table owned by one listener
///
/// Registration happens while the owning listener is still closed; once it
/// opens, the table is only read, concurrently, from request tasks.
#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<Routes>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `pattern`.
    ///
    /// Literal patterns starting with `/` are prefixed with `host_scope`, so
    /// `("/", "example.com")` becomes `example.com/`. Literal patterns that do
    /// not start with `/` already carry their host.
    ///
    /// A literal pattern ending in `/` also installs an implicit permanent
    /// redirect from the pattern without the slash, unless that shorter
    /// pattern is explicitly registered. Explicit registrations replace
    /// implicit ones.
    pub fn register(
        &self,
        pattern: &str,
        host_scope: &str,
        is_regex: bool,
        handler: Handler,
    ) -> Result<(), ConfigError> {
        if pattern.is_empty() {
            return Err(ConfigError::InvalidPattern(pattern.to_string()));
        }

        // Request hosts are compared lowercased
        let host_scope = host_scope.to_ascii_lowercase();
        let host_scope = host_scope.as_str();

        let mut routes = self.routes.write();

        if is_regex {
            let key = (host_scope.to_string(), pattern.to_string());
            if routes.is_explicit(&key) {
                return Err(ConfigError::DuplicateRoute(describe(host_scope, pattern)));
            }
            let re = Regex::new(pattern).map_err(|source| ConfigError::InvalidRegex {
                pattern: pattern.to_string(),
                source,
            })?;
            routes.upsert(RouteEntry {
                pattern: pattern.to_string(),
                reported: pattern.to_string(),
                host_scope: host_scope.to_string(),
                explicit: true,
                matcher: Matcher::Regex(re),
                handler,
            });
            if !host_scope.is_empty() {
                routes.hosts = true;
            }
            return Ok(());
        }

        let pattern = if pattern.starts_with('/') {
            format!("{}{}", host_scope, pattern)
        } else {
            lowercase_host(pattern)
        };
        let key = (String::new(), pattern.clone());
        if routes.is_explicit(&key) {
            return Err(ConfigError::DuplicateRoute(pattern));
        }

        routes.upsert(RouteEntry {
            pattern: pattern.clone(),
            reported: pattern.clone(),
            host_scope: String::new(),
            explicit: true,
            matcher: Matcher::Literal,
            handler,
        });
        if !pattern.starts_with('/') {
            routes.hosts = true;
        }

        if let Some(shorter) = pattern.strip_suffix('/') {
            let shorter_key = (String::new(), shorter.to_string());
            if !shorter.is_empty() && !routes.is_explicit(&shorter_key) {
                // For host-qualified patterns the redirect target is the path part only
                let target = match pattern.find('/') {
                    Some(i) => pattern[i..].to_string(),
                    None => pattern.clone(),
                };
                routes.upsert(RouteEntry {
                    pattern: shorter.to_string(),
                    reported: pattern.clone(),
                    host_scope: String::new(),
                    explicit: false,
                    matcher: Matcher::Literal,
                    handler: Handler::Redirect(target),
                });
            }
        }

        Ok(())
    }

    /// Resolve `(host, path)` to a handler and the pattern that matched.
    ///
    /// A non-canonical path yields a redirect to its canonical form together
    /// with the pattern the canonical path resolves to. No match yields
    /// [`Handler::NotFound`] and an empty pattern.
    pub fn dispatch(&self, host: &str, path: &str) -> (Handler, String) {
        let clean = clean_path(path);
        if clean != path {
            let (_, pattern) = self.lookup(host, &clean);
            return (Handler::Redirect(clean), pattern);
        }
        self.lookup(host, path)
    }

    /// Resolve a request, using its Host header and URI.
    ///
    /// Canonicalisation redirects keep the request's query string.
    pub fn dispatch_request<B>(&self, req: &Request<B>) -> (Handler, String) {
        let host = request_host(req);
        let path = req.uri().path();

        if req.method() != Method::CONNECT {
            let clean = clean_path(path);
            if clean != path {
                let (_, pattern) = self.lookup(&host, &clean);
                let location = match req.uri().query() {
                    Some(query) => format!("{}?{}", clean, query),
                    None => clean,
                };
                return (Handler::Redirect(location), pattern);
            }
        }

        self.lookup(&host, path)
    }

    fn lookup(&self, host: &str, path: &str) -> (Handler, String) {
        let routes = self.routes.read();

        let mut found = None;
        if routes.hosts && !host.is_empty() {
            found = routes.find(host, path);
        }
        if found.is_none() {
            found = routes.find("", path);
        }
        found.unwrap_or_else(|| (Handler::NotFound, String::new()))
    }

    /// Number of entries, implicit redirects included
    pub fn len(&self) -> usize {
        self.routes.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lowercase the host part of a host-qualified literal pattern
fn lowercase_host(pattern: &str) -> String {
    match pattern.find('/') {
        Some(i) => format!("{}{}", pattern[..i].to_ascii_lowercase(), &pattern[i..]),
        None => pattern.to_ascii_lowercase(),
    }
}

fn describe(host_scope: &str, pattern: &str) -> String {
    if host_scope.is_empty() {
        pattern.to_string()
    } else {
        format!("{} (host {})", pattern, host_scope)
    }
}

/// Does `path` match the literal `pattern`?
fn path_match(pattern: &str, path: &str) -> bool {
    if pattern.is_empty() {
        return false;
    }
    if !pattern.ends_with('/') {
        return pattern == path;
    }
    path.starts_with(pattern)
}

/// Canonical form of `p`: `.` and `..` segments resolved, duplicate slashes
/// removed, a leading `/` forced and a trailing `/` kept.
pub fn clean_path(p: &str) -> String {
    if p.is_empty() {
        return "/".to_string();
    }

    let mut segments: Vec<&str> = Vec::new();
    for segment in p.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }

    let mut clean = String::with_capacity(p.len() + 1);
    clean.push('/');
    clean.push_str(&segments.join("/"));
    if p.ends_with('/') && clean != "/" {
        clean.push('/');
    }
    clean
}

/// Lowercased host name of a request without its port.
///
/// The authority of an absolute-form target takes precedence over `Host`.
pub fn request_host<B>(req: &Request<B>) -> String {
    if let Some(host) = req.uri().host() {
        return host.to_ascii_lowercase();
    }
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    strip_port(raw).to_ascii_lowercase()
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // IPv6 literal
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    host.split(':').next().unwrap_or(host)
}
