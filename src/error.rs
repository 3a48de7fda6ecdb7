//! Forward-error taxonomy and the default error responder

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::io;
use tracing::{debug, error};

/// Body type for every response the proxy produces or relays.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Build a response body from a static or owned chunk.
pub fn full_body(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}

/// An error raised while forwarding a request to an upstream.
#[derive(Debug)]
pub enum ForwardError {
    /// TCP connect or TLS handshake to the upstream failed.
    Connect(io::Error),
    /// The pooled HTTP client failed.
    Client(hyper_util::client::legacy::Error),
    /// Protocol-level failure on an established upstream connection.
    Protocol(hyper::Error),
    /// The outgoing request could not be built.
    RequestBuild(hyper::http::Error),
    /// The upstream rejected or mangled a WebSocket upgrade.
    Upgrade(String),
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForwardError::Connect(e) => write!(f, "upstream connect failed: {}", e),
            ForwardError::Client(e) => write!(f, "upstream request failed: {}", e),
            ForwardError::Protocol(e) => write!(f, "upstream protocol error: {}", e),
            ForwardError::RequestBuild(e) => write!(f, "failed to build upstream request: {}", e),
            ForwardError::Upgrade(s) => write!(f, "upgrade failed: {}", s),
        }
    }
}

impl std::error::Error for ForwardError {}

impl From<hyper_util::client::legacy::Error> for ForwardError {
    fn from(e: hyper_util::client::legacy::Error) -> Self {
        ForwardError::Client(e)
    }
}

impl From<hyper::Error> for ForwardError {
    fn from(e: hyper::Error) -> Self {
        ForwardError::Protocol(e)
    }
}

impl From<hyper::http::Error> for ForwardError {
    fn from(e: hyper::http::Error) -> Self {
        ForwardError::RequestBuild(e)
    }
}

/// Walk an error's source chain looking for an `io::Error` kind.
fn io_kind_of(err: &(dyn std::error::Error + 'static)) -> Option<io::ErrorKind> {
    let mut cur: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = cur {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            return Some(io_err.kind());
        }
        cur = e.source();
    }
    None
}

impl ForwardError {
    /// Platform-style error code string; also the default response body.
    pub fn code(&self) -> &'static str {
        let kind = match self {
            ForwardError::Connect(e) => Some(e.kind()),
            ForwardError::Client(e) => io_kind_of(e),
            ForwardError::Protocol(e) => {
                if e.is_incomplete_message() {
                    return "ECONNRESET";
                }
                io_kind_of(e)
            }
            ForwardError::RequestBuild(_) => None,
            ForwardError::Upgrade(_) => None,
        };
        match kind {
            Some(io::ErrorKind::ConnectionRefused) => "ECONNREFUSED",
            Some(io::ErrorKind::ConnectionReset) => "ECONNRESET",
            Some(io::ErrorKind::ConnectionAborted) => "ECONNABORTED",
            Some(io::ErrorKind::BrokenPipe) => "EPIPE",
            Some(io::ErrorKind::TimedOut) => "ETIMEDOUT",
            _ => "EPROTO",
        }
    }

    /// Reset-class errors (the upstream hung up mid-exchange). Common and
    /// noisy, so the default handler logs them below error level.
    pub fn is_reset(&self) -> bool {
        matches!(self.code(), "ECONNRESET" | "ECONNABORTED" | "EPIPE")
    }
}

/// The default error responder: `ECONNREFUSED` maps to 502, everything else
/// to 500. The body is the plain error code string.
pub fn default_error_response(err: &ForwardError) -> Response<ProxyBody> {
    if err.is_reset() {
        debug!(code = err.code(), error = %err, "Upstream reset");
    } else {
        error!(code = err.code(), error = %err, "Forward failed");
    }

    let status = if err.code() == "ECONNREFUSED" {
        StatusCode::BAD_GATEWAY
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };

    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body(err.code()))
        .expect("static response parts")
}

/// Errors surfaced by `register` and proxy construction. These are loud by
/// design: a misconfigured route should fail at registration, not at request
/// time.
#[derive(Debug)]
pub enum RegisterError {
    MissingSource,
    MissingTarget,
    InvalidUrl(crate::urls::UrlError),
    /// An `ssl` route was registered but no HTTPS listener is configured.
    NoHttpsListener,
    /// A `letsencrypt` route was registered without a global ACME path.
    AcmeNotConfigured,
    Certificate(String),
}

impl std::fmt::Display for RegisterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegisterError::MissingSource => write!(f, "register requires a source"),
            RegisterError::MissingTarget => write!(f, "register requires a target"),
            RegisterError::InvalidUrl(e) => write!(f, "{}", e),
            RegisterError::NoHttpsListener => {
                write!(f, "route has ssl options but no https listener is configured")
            }
            RegisterError::AcmeNotConfigured => {
                write!(f, "route requests letsencrypt but no acme path is configured")
            }
            RegisterError::Certificate(s) => write!(f, "certificate error: {}", s),
        }
    }
}

impl std::error::Error for RegisterError {}

impl From<crate::urls::UrlError> for RegisterError {
    fn from(e: crate::urls::UrlError) -> Self {
        RegisterError::InvalidUrl(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_refused_maps_to_502() {
        let err = ForwardError::Connect(io::Error::new(io::ErrorKind::ConnectionRefused, "nope"));
        assert_eq!(err.code(), "ECONNREFUSED");

        let resp = default_error_response(&err);
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    }

    #[test]
    fn test_generic_error_maps_to_500() {
        let err = ForwardError::Upgrade("bad handshake".into());
        assert_eq!(err.code(), "EPROTO");

        let resp = default_error_response(&err);
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_reset_class_detection() {
        let reset = ForwardError::Connect(io::Error::new(io::ErrorKind::ConnectionReset, "rst"));
        assert!(reset.is_reset());

        let refused =
            ForwardError::Connect(io::Error::new(io::ErrorKind::ConnectionRefused, "nope"));
        assert!(!refused.is_reset());
    }
}
