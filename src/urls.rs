//! URL normalization, prefix matching and rewrite rules
//!
//! Source and target URLs arrive as loosely-formatted strings
//! (`"example.com/api"`, `"http://10.0.0.2:8080"`). This module turns them
//! into normalized values and implements the path rewriting applied on every
//! proxied request.

use std::fmt;
use url::Url;

/// Scheme of a proxy target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "http",
            Protocol::Https => "https",
        }
    }

    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, Protocol::Https)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed `register` source: hostname plus path prefix. The port is
/// irrelevant here, the listener fixes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceUrl {
    pub hostname: String,
    pub pathname: String,
}

/// A fully-resolved upstream target. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
    /// Path prefix prepended to rewritten request paths. Empty or `/` means
    /// no prefix.
    pub pathname: String,
    /// `hostname:port`, the value used for Host header overrides.
    pub host: String,
    /// Normalized URL string, used as the removal key by `unregister`.
    pub href: String,
    pub ssl_redirect: bool,
    pub use_target_host_header: bool,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.href)
    }
}

#[derive(Debug)]
pub enum UrlError {
    Parse(url::ParseError),
    /// Scheme other than http/https, or a URL without a host.
    NotHttp(String),
}

impl fmt::Display for UrlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UrlError::Parse(e) => write!(f, "invalid URL: {}", e),
            UrlError::NotHttp(s) => write!(f, "not an http(s) URL: {}", s),
        }
    }
}

impl std::error::Error for UrlError {}

impl From<url::ParseError> for UrlError {
    fn from(e: url::ParseError) -> Self {
        UrlError::Parse(e)
    }
}

/// Parse a loosely-formatted URL string. Strings without an `http://` or
/// `https://` prefix get `http://` prepended before parsing.
pub fn prepare_url(input: &str) -> Result<Url, UrlError> {
    let trimmed = input.trim();
    let with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    };

    let url = Url::parse(&with_scheme)?;
    if url.host_str().is_none() || !matches!(url.scheme(), "http" | "https") {
        return Err(UrlError::NotHttp(input.to_string()));
    }
    Ok(url)
}

/// Parse a `register` source. The path defaults to `/`.
pub fn parse_source(input: &str) -> Result<SourceUrl, UrlError> {
    let url = prepare_url(input)?;
    let pathname = match url.path() {
        "" => "/".to_string(),
        p => p.to_string(),
    };
    Ok(SourceUrl {
        hostname: url.host_str().unwrap_or_default().to_lowercase(),
        pathname,
    })
}

/// Flags attached to a target at build time, derived from route options.
#[derive(Debug, Clone, Copy, Default)]
pub struct TargetFlags {
    pub ssl_redirect: bool,
    pub use_target_host_header: bool,
}

/// Build a [`Target`] from a loosely-formatted URL string.
pub fn build_target(input: &str, flags: TargetFlags) -> Result<Target, UrlError> {
    let url = prepare_url(input)?;
    let protocol = match url.scheme() {
        "https" => Protocol::Https,
        _ => Protocol::Http,
    };
    let hostname = url.host_str().unwrap_or_default().to_lowercase();
    let port = url.port().unwrap_or_else(|| protocol.default_port());
    let pathname = match url.path() {
        "/" => String::new(),
        p => p.trim_end_matches('/').to_string(),
    };

    Ok(Target {
        protocol,
        host: format!("{}:{}", hostname, port),
        href: url.to_string(),
        hostname,
        port,
        pathname,
        ssl_redirect: flags.ssl_redirect,
        use_target_host_header: flags.use_target_host_header,
    })
}

/// Prefix match with a path-boundary guard: `url` matches `prefix` iff they
/// are equal or the character right after the prefix is `/` or `?`. This is
/// what keeps `/foo` from matching `/foobar`.
pub fn path_starts_with(url: &str, prefix: &str) -> bool {
    if !url.starts_with(prefix) {
        return false;
    }
    match url.as_bytes().get(prefix.len()) {
        None => true,
        Some(b'/') | Some(b'?') => true,
        Some(_) => false,
    }
}

/// Strip a matched route path from an incoming path-and-query. Paths of
/// length 1 (`/`) strip nothing. The query is preserved untouched.
pub fn strip_route_path(path_and_query: &str, route_path: &str) -> String {
    if route_path.len() <= 1 {
        return path_and_query.to_string();
    }
    let rest = &path_and_query[route_path.len().min(path_and_query.len())..];
    if rest.is_empty() {
        "/".to_string()
    } else {
        rest.to_string()
    }
}

/// Join a target path prefix with the (possibly stripped) request
/// path-and-query. POSIX-style join, except a query-only remainder is
/// concatenated directly so no `/` sneaks in before the `?`.
pub fn join_target_path(target_pathname: &str, path_and_query: &str) -> String {
    if target_pathname.is_empty() || target_pathname == "/" {
        return path_and_query.to_string();
    }
    let prefix = target_pathname.trim_end_matches('/');
    if path_and_query.starts_with('?') {
        return format!("{}{}", prefix, path_and_query);
    }
    if path_and_query == "/" || path_and_query.is_empty() {
        return prefix.to_string();
    }
    if path_and_query.starts_with('/') {
        format!("{}{}", prefix, path_and_query)
    } else {
        format!("{}/{}", prefix, path_and_query)
    }
}

/// Full rewrite for a matched route and chosen target.
pub fn rewrite_path(path_and_query: &str, route_path: &str, target: &Target) -> String {
    let stripped = strip_route_path(path_and_query, route_path);
    join_target_path(&target.pathname, &stripped)
}
