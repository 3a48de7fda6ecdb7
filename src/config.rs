//! File configuration for the `routegate` binary
//!
//! The library is driven programmatically; the binary reads this TOML shape
//! and translates it into construction options plus a set of initial route
//! registrations.

use crate::acme::AcmeOptions;
use crate::routes::{ForwardOptions, RouteLetsencrypt, RouteOptions, RouteSsl};
use crate::server::{ProxyOptions, SslConfig};
use anyhow::{bail, Context};
use serde::Deserialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const MAX_CLUSTER_WORKERS: u8 = 32;

#[derive(Debug, Deserialize, Clone)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub log: LogSection,

    #[serde(default)]
    pub routes: Vec<RouteSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSection {
    /// HTTP listener port; omit to disable plain HTTP.
    pub port: Option<u16>,

    /// Bind address for the HTTP listener.
    #[serde(default = "default_bind_address")]
    pub host: IpAddr,

    /// HTTPS listeners.
    #[serde(default)]
    pub ssl: Vec<SslSection>,

    /// Add X-Forwarded-* headers (default true).
    #[serde(default = "default_true")]
    pub xfwd: bool,

    /// Verify upstream TLS certificates (default true).
    #[serde(default = "default_true")]
    pub secure: bool,

    /// Prefer X-Forwarded-Host over Host when determining the source.
    #[serde(default)]
    pub prefer_forwarded_host: bool,

    /// Split multi-challenge WWW-Authenticate headers for NTLM.
    #[serde(default)]
    pub ntlm: bool,

    /// Worker process count (1..=32). Values above 1 enable cluster mode.
    #[serde(default = "default_cluster")]
    pub cluster: u8,

    pub letsencrypt: Option<LetsencryptSection>,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: None,
            host: default_bind_address(),
            ssl: Vec::new(),
            xfwd: true,
            secure: true,
            prefer_forwarded_host: false,
            ntlm: false,
            cluster: default_cluster(),
            letsencrypt: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SslSection {
    pub port: u16,

    #[serde(default = "default_bind_address")]
    pub ip: IpAddr,

    pub key: PathBuf,
    pub cert: PathBuf,
    pub ca: Option<PathBuf>,

    #[serde(default)]
    pub http2: bool,

    /// Advertise this listener in HTTP→HTTPS redirects (default true).
    /// Disable on listeners that should never appear in a Location header.
    #[serde(default = "default_true")]
    pub redirect: bool,

    pub redirect_port: Option<u16>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LetsencryptSection {
    /// Directory for ACME account material and issued certificates.
    pub path: PathBuf,

    /// Internal challenge server port (default 3000).
    #[serde(default = "default_challenge_port")]
    pub port: u16,

    /// Renew this many days before expiry (default 30).
    #[serde(default = "default_renew_within_days")]
    pub renew_within_days: u64,

    /// Lower clamp for renewal timers, in seconds (default 3600).
    #[serde(default = "default_min_renew_secs")]
    pub min_renew_time_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSection {
    /// `false` disables logging entirely.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// tracing env-filter directive, e.g. `info` or `routegate=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouteSection {
    pub src: String,
    pub target: String,

    #[serde(default)]
    pub use_target_host_header: bool,

    /// Per-route forward option overrides.
    #[serde(default)]
    pub secure: Option<bool>,
    #[serde(default)]
    pub xfwd: Option<bool>,
    #[serde(default)]
    pub change_origin: Option<bool>,

    pub ssl: Option<RouteSslSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouteSslSection {
    #[serde(default = "default_true")]
    pub redirect: bool,

    pub key: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub ca: Option<PathBuf>,

    pub letsencrypt: Option<RouteLetsencryptSection>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouteLetsencryptSection {
    pub email: String,

    #[serde(default)]
    pub production: bool,

    /// Renew this many days before expiry; defaults to the global setting.
    pub renew_within_days: Option<u64>,
}

fn default_bind_address() -> IpAddr {
    "0.0.0.0".parse().expect("valid address literal")
}

fn default_true() -> bool {
    true
}

fn default_cluster() -> u8 {
    1
}

fn default_challenge_port() -> u16 {
    3000
}

fn default_renew_within_days() -> u64 {
    30
}

fn default_min_renew_secs() -> u64 {
    3600
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: FileConfig = toml::from_str(&data)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.cluster == 0 || self.server.cluster > MAX_CLUSTER_WORKERS {
            bail!(
                "cluster must be between 1 and {}, got {}",
                MAX_CLUSTER_WORKERS,
                self.server.cluster
            );
        }
        if self.server.port.is_none() && self.server.ssl.is_empty() {
            bail!("no listeners configured: set server.port and/or server.ssl");
        }
        for route in &self.routes {
            if route.src.trim().is_empty() || route.target.trim().is_empty() {
                bail!("every route needs both src and target");
            }
            if let Some(ssl) = &route.ssl {
                if self.server.ssl.is_empty() {
                    bail!("route {} has ssl options but no https listener", route.src);
                }
                if ssl.letsencrypt.is_some() && self.server.letsencrypt.is_none() {
                    bail!(
                        "route {} requests letsencrypt but server.letsencrypt is not set",
                        route.src
                    );
                }
            }
        }
        Ok(())
    }

    /// Construction options for the proxy.
    pub fn proxy_options(&self) -> ProxyOptions {
        let letsencrypt = self.server.letsencrypt.as_ref().map(|le| {
            let mut opts = AcmeOptions::new(le.path.clone());
            opts.port = le.port;
            opts.renew_within = Duration::from_secs(le.renew_within_days * 24 * 60 * 60);
            opts.min_renew_time = Duration::from_secs(le.min_renew_time_secs);
            opts
        });

        ProxyOptions {
            port: self.server.port,
            host: self.server.host,
            ssl: self
                .server
                .ssl
                .iter()
                .map(|s| SslConfig {
                    port: s.port,
                    ip: s.ip,
                    key: s.key.clone(),
                    cert: s.cert.clone(),
                    ca: s.ca.clone(),
                    http2: s.http2,
                    redirect: s.redirect,
                    redirect_port: s.redirect_port,
                })
                .collect(),
            http_proxy: ForwardOptions::default(),
            xfwd: self.server.xfwd,
            secure: self.server.secure,
            prefer_forwarded_host: self.server.prefer_forwarded_host,
            ntlm: self.server.ntlm,
            letsencrypt,
            resolvers: Vec::new(),
            error_handler: None,
            certificate_source: None,
        }
    }

    /// `(src, target, options)` triples for initial registration.
    pub fn route_registrations(&self) -> Vec<(String, String, RouteOptions)> {
        self.routes
            .iter()
            .map(|route| {
                let ssl = route.ssl.as_ref().map(|s| RouteSsl {
                    redirect: Some(s.redirect),
                    key: s.key.clone(),
                    cert: s.cert.clone(),
                    ca: s.ca.clone(),
                    letsencrypt: s.letsencrypt.as_ref().map(|le| RouteLetsencrypt {
                        email: le.email.clone(),
                        production: le.production,
                        renew_within: le
                            .renew_within_days
                            .map(|d| Duration::from_secs(d * 24 * 60 * 60)),
                    }),
                });
                let opts = RouteOptions {
                    ssl,
                    use_target_host_header: route.use_target_host_header,
                    http_proxy: ForwardOptions {
                        secure: route.secure,
                        xfwd: route.xfwd,
                        change_origin: route.change_origin,
                    },
                    on_request: None,
                    on_response: None,
                    on_error: None,
                };
                (route.src.clone(), route.target.clone(), opts)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parsing() {
        let toml = r#"
[server]
port = 8080
host = "127.0.0.1"
cluster = 4
ntlm = true

[[server.ssl]]
port = 8443
key = "/etc/tls/key.pem"
cert = "/etc/tls/cert.pem"
http2 = true
redirect_port = 443

[server.letsencrypt]
path = "/var/lib/routegate/acme"
port = 9999

[log]
level = "routegate=debug"

[[routes]]
src = "example.com/api"
target = "http://127.0.0.1:3000/v1"
use_target_host_header = true
secure = false

[[routes]]
src = "secure.example.com"
target = "http://127.0.0.1:4000"

[routes.ssl]
redirect = false

[routes.ssl.letsencrypt]
email = "ops@example.com"
production = true
"#;

        let config: FileConfig = toml::from_str(toml).unwrap();
        config.validate().unwrap();

        assert_eq!(config.server.port, Some(8080));
        assert_eq!(config.server.cluster, 4);
        assert!(config.server.ntlm);
        assert_eq!(config.server.ssl.len(), 1);
        assert_eq!(config.server.ssl[0].redirect_port, Some(443));
        assert_eq!(config.server.letsencrypt.as_ref().unwrap().port, 9999);
        assert_eq!(config.routes.len(), 2);

        let opts = config.proxy_options();
        assert_eq!(opts.port, Some(8080));
        assert_eq!(opts.ssl.len(), 1);
        assert_eq!(opts.letsencrypt.as_ref().unwrap().port, 9999);

        let routes = config.route_registrations();
        assert_eq!(routes[0].0, "example.com/api");
        assert!(routes[0].2.use_target_host_header);
        assert_eq!(routes[0].2.http_proxy.secure, Some(false));
        let ssl = routes[1].2.ssl.as_ref().unwrap();
        assert_eq!(ssl.redirect, Some(false));
        assert_eq!(ssl.letsencrypt.as_ref().unwrap().email, "ops@example.com");
    }

    #[test]
    fn test_cluster_bounds() {
        let toml = r#"
[server]
port = 8080
cluster = 33
"#;
        let config: FileConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_requires_some_listener() {
        let config: FileConfig = toml::from_str("").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_ssl_route_without_listener_rejected() {
        let toml = r#"
[server]
port = 8080

[[routes]]
src = "a.test"
target = "http://127.0.0.1:9000"

[routes.ssl]
redirect = true
"#;
        let config: FileConfig = toml::from_str(toml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_letsencrypt_defaults() {
        let toml = r#"
[server]
port = 80

[server.letsencrypt]
path = "/tmp/acme"
"#;
        let config: FileConfig = toml::from_str(toml).unwrap();
        let opts = config.proxy_options();
        let le = opts.letsencrypt.unwrap();
        assert_eq!(le.port, 3000);
        assert_eq!(le.renew_within, Duration::from_secs(30 * 24 * 60 * 60));
        assert_eq!(le.min_renew_time, Duration::from_secs(3600));
    }
}
