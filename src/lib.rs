//! Switchyard - a multi-site HTTP gateway
//!
//! Each configured site is bound to a listener (plain or TLS) and served from
//! a route table that maps host and path patterns to one of:
//! - static files under a document root
//! - a FastCGI server group, reached through a bounded worker pool
//! - a reverse-proxy upstream group, one durable client per upstream
//!
//! Reload stops every listener and pool, then starts a fresh generation from
//! the new configuration.

pub mod config;
pub mod error;
pub mod fastcgi;
pub mod fcgi;
pub mod handler;
pub mod listener;
pub mod pool;
pub mod proxy;
pub mod router;
pub mod server;
pub mod static_files;
pub mod tls;
