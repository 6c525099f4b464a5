use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;

/// Default configuration file looked up when no path is given on the command line
pub const DEFAULT_CONFIG_PATH: &str = "switchyard.toml";

/// Immutable configuration snapshot for one server generation
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Virtual sites, each bound to an `ip:port` listener
    #[serde(default)]
    pub sites: Vec<SiteConfig>,

    /// Named FastCGI server groups (`host:port` addresses)
    #[serde(default)]
    pub fcgi: BTreeMap<String, Vec<String>>,

    /// Named reverse-proxy server groups (base URLs)
    #[serde(default)]
    pub proxy: BTreeMap<String, Vec<String>>,

    /// Production mode: hide internal error details from response bodies
    #[serde(default)]
    pub live: bool,
}

/// One virtual site
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SiteConfig {
    /// Host name this site answers for
    #[serde(default)]
    pub host: String,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_ip")]
    pub ip: String,

    /// Bind port
    pub port: u16,

    /// Static document root (optional)
    #[serde(default)]
    pub root: String,

    /// Serve this site over TLS
    #[serde(default)]
    pub tls: bool,

    /// Certificate material, required when `tls` is set
    pub tls_opts: Option<TlsOpts>,

    /// FastCGI bindings
    #[serde(default)]
    pub fcgi: Vec<FcgiBinding>,

    /// Reverse-proxy bindings
    #[serde(default)]
    pub proxy: Vec<ProxyBinding>,
}

impl SiteConfig {
    /// Listener key for this site
    pub fn addr(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }
}

/// Certificate, chain and private key for an encrypted listener
#[derive(Debug, Deserialize, Clone, Default)]
pub struct TlsOpts {
    /// Private key file (PEM)
    pub key: String,

    /// Pass phrase for an encrypted private key
    #[serde(default)]
    pub key_pass: String,

    /// Leaf certificate file (PEM)
    pub cert: String,

    /// Intermediate chain file (PEM, optional)
    #[serde(default)]
    pub chain: String,
}

/// Routes requests matching `pattern` to the FastCGI group `server`
#[derive(Debug, Deserialize, Clone, Default)]
pub struct FcgiBinding {
    /// FastCGI group name
    pub server: String,

    /// Regular expression matched against the request path
    pub pattern: String,

    /// SCRIPT_FILENAME template, `%s` is replaced by the request path
    #[serde(default)]
    pub script: String,

    /// Index file appended when SCRIPT_FILENAME ends with `/`
    #[serde(default)]
    pub index: String,

    /// Static parameters overriding computed ones
    #[serde(default)]
    pub params: HashMap<String, String>,
}

/// Routes requests matching `pattern` to the proxy group `server`
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProxyBinding {
    /// Proxy group name
    pub server: String,

    /// Regular expression matched against the request path
    pub pattern: String,
}

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration, reporting every problem at once
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (name, servers) in &self.fcgi {
            if servers.is_empty() {
                errors.push(format!("FastCGI group '{}' has no servers", name));
            }
        }

        for (name, servers) in &self.proxy {
            if servers.is_empty() {
                errors.push(format!("Proxy group '{}' has no servers", name));
            }
            for server in servers {
                match server.parse::<hyper::Uri>() {
                    Ok(uri) if uri.host().is_some() => {
                        if uri.scheme_str() != Some("http") {
                            errors.push(format!(
                                "Proxy group '{}': '{}' must use http://, other schemes are not supported",
                                name, server
                            ));
                        }
                    }
                    _ => errors.push(format!(
                        "Proxy group '{}': '{}' is not an absolute URL",
                        name, server
                    )),
                }
            }
        }

        for site in &self.sites {
            let label = format!("{} ({})", site.host, site.addr());
            if site.port == 0 {
                errors.push(format!("Site {}: 'port' must be greater than 0", label));
            }
            if site.tls {
                match &site.tls_opts {
                    None => errors.push(format!("Site {}: 'tls' requires 'tls_opts'", label)),
                    Some(opts) => {
                        if opts.cert.is_empty() || opts.key.is_empty() {
                            errors.push(format!(
                                "Site {}: 'tls_opts' requires 'cert' and 'key'",
                                label
                            ));
                        }
                    }
                }
            }
            for binding in &site.fcgi {
                if binding.pattern.is_empty() {
                    errors.push(format!("Site {}: FastCGI binding has an empty pattern", label));
                }
                if !self.fcgi.contains_key(&binding.server) {
                    errors.push(format!(
                        "Site {}: unknown FastCGI group '{}'",
                        label, binding.server
                    ));
                }
            }
            for binding in &site.proxy {
                if binding.pattern.is_empty() {
                    errors.push(format!("Site {}: proxy binding has an empty pattern", label));
                }
                if !self.proxy.contains_key(&binding.server) {
                    errors.push(format!("Site {}: unknown proxy group '{}'", label, binding.server));
                }
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
