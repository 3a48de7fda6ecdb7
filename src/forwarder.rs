//! Upstream forwarding
//!
//! A [`Forwarder`] is the opaque handle a route forwards through. Handles are
//! cached per `(protocol, hostname, port, change_origin)` so routes with
//! equivalent origin semantics share one, and with it the underlying
//! connection pool. Plain-HTTP targets go through a pooled client; HTTPS
//! targets get a TLS handshake per request, optionally skipping certificate
//! verification when `secure: false`.

use crate::error::{ForwardError, ProxyBody};
use crate::urls::{Protocol, Target};
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, HOST, WWW_AUTHENTICATE};
use hyper::upgrade::Upgraded;
use hyper::{Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Cache key: origin plus the change-origin flag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ForwarderKey {
    pub protocol: Protocol,
    pub hostname: String,
    pub port: u16,
    pub change_origin: bool,
}

/// Fully-resolved forward options for one request, after the
/// route-over-global merge.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedForwardOptions {
    pub secure: bool,
    pub xfwd: bool,
    pub ntlm: bool,
    pub change_origin: bool,
}

/// Request-scoped forwarding context. Carries what the engine learned before
/// handing the request over: the client address, which listener kind it came
/// in on, and a Host override from `use_target_host_header`.
#[derive(Debug, Clone)]
pub struct ForwardMeta {
    pub client_ip: IpAddr,
    pub is_tls: bool,
    pub host_override: Option<HeaderValue>,
}

/// One upstream forwarder. Cheap to clone via `Arc`; owns the pooled client
/// for its origin.
pub struct Forwarder {
    key: ForwarderKey,
    http_client: Client<HttpConnector, Incoming>,
    tls_verified: Arc<rustls::ClientConfig>,
    tls_unverified: Arc<rustls::ClientConfig>,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder").field("key", &self.key).finish()
    }
}

/// Per-process forwarder cache plus the shared TLS client configurations.
pub struct ForwarderCache {
    entries: Mutex<HashMap<ForwarderKey, Arc<Forwarder>>>,
    tls_verified: Arc<rustls::ClientConfig>,
    tls_unverified: Arc<rustls::ClientConfig>,
    default_handle: Arc<Forwarder>,
}

impl ForwarderCache {
    pub fn new() -> Self {
        // Pin the process-wide TLS provider before any config is built; a
        // second call is a harmless no-op error.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let tls_verified = Arc::new(verified_client_config());
        let tls_unverified = Arc::new(unverified_client_config());

        // The default handle: empty origin, change_origin = false.
        let default_key = ForwarderKey {
            protocol: Protocol::Http,
            hostname: String::new(),
            port: 0,
            change_origin: false,
        };
        let default_handle = Arc::new(Forwarder::new(
            default_key.clone(),
            Arc::clone(&tls_verified),
            Arc::clone(&tls_unverified),
        ));

        let mut entries = HashMap::new();
        entries.insert(default_key, Arc::clone(&default_handle));

        Self {
            entries: Mutex::new(entries),
            tls_verified,
            tls_unverified,
            default_handle,
        }
    }

    /// Handle for a target's origin, creating it on first use.
    pub fn handle_for(&self, target: &Target, change_origin: bool) -> Arc<Forwarder> {
        let key = ForwarderKey {
            protocol: target.protocol,
            hostname: target.hostname.clone(),
            port: target.port,
            change_origin,
        };
        let mut entries = self.entries.lock();
        Arc::clone(entries.entry(key.clone()).or_insert_with(|| {
            Arc::new(Forwarder::new(
                key,
                Arc::clone(&self.tls_verified),
                Arc::clone(&self.tls_unverified),
            ))
        }))
    }

    pub fn default_handle(&self) -> Arc<Forwarder> {
        Arc::clone(&self.default_handle)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

impl Default for ForwarderCache {
    fn default() -> Self {
        Self::new()
    }
}

impl Forwarder {
    fn new(
        key: ForwarderKey,
        tls_verified: Arc<rustls::ClientConfig>,
        tls_unverified: Arc<rustls::ClientConfig>,
    ) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);

        let http_client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(10)
            .build(connector);

        Self {
            key,
            http_client,
            tls_verified,
            tls_unverified,
        }
    }

    /// Forward an HTTP request to `target`, returning the upstream response.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        target: &Target,
        opts: &ResolvedForwardOptions,
        meta: &ForwardMeta,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        apply_forward_headers(req.headers_mut(), target, opts, meta);

        let path_and_query = req
            .uri()
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let response = match target.protocol {
            Protocol::Http => {
                let uri: hyper::Uri =
                    format!("http://{}:{}{}", target.hostname, target.port, path_and_query)
                        .parse()
                        .map_err(hyper::http::Error::from)?;
                *req.uri_mut() = uri;
                self.http_client.request(req).await?
            }
            Protocol::Https => {
                let tls = self.connect_tls(target, opts.secure).await?;
                let (mut sender, conn) =
                    hyper::client::conn::http1::handshake::<_, Incoming>(TokioIo::new(tls))
                        .await?;
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        debug!(error = %e, "Upstream connection closed with error");
                    }
                });
                let uri: hyper::Uri =
                    path_and_query.parse().map_err(hyper::http::Error::from)?;
                *req.uri_mut() = uri;
                sender.send_request(req).await?
            }
        };

        let (mut parts, body) = response.into_parts();
        if opts.ntlm {
            split_auth_challenges(&mut parts.headers);
        }
        Ok(Response::from_parts(parts, body.boxed()))
    }

    /// Replay a WebSocket (or other `Upgrade:`) request to the target and,
    /// on 101, splice the two sockets together.
    pub async fn upgrade(
        &self,
        mut req: Request<Incoming>,
        target: &Target,
        opts: &ResolvedForwardOptions,
        meta: &ForwardMeta,
    ) -> Result<Response<ProxyBody>, ForwardError> {
        apply_forward_headers(req.headers_mut(), target, opts, meta);

        let mut upstream: Box<dyn AsyncReadWrite> = match target.protocol {
            Protocol::Http => Box::new(
                TcpStream::connect((target.hostname.as_str(), target.port))
                    .await
                    .map_err(ForwardError::Connect)?,
            ),
            Protocol::Https => Box::new(self.connect_tls(target, opts.secure).await?),
        };

        let raw = build_upgrade_request(&req, target);
        upstream
            .write_all(&raw)
            .await
            .map_err(ForwardError::Connect)?;

        let (head, leftover) = read_response_head(&mut upstream).await?;
        let (status, headers) = parse_response_head(&head)
            .ok_or_else(|| ForwardError::Upgrade("unparseable upstream response".into()))?;

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(upstream = %target, status = %status, "Upstream rejected upgrade");
            let mut builder = Response::builder().status(status);
            for (name, value) in &headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            return Ok(builder
                .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
                .map_err(ForwardError::RequestBuild)?);
        }

        let mut builder = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        for (name, value) in &headers {
            let lower = name.to_ascii_lowercase();
            if lower == "content-length" || lower == "transfer-encoding" {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder
            .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
            .map_err(ForwardError::RequestBuild)?;

        tokio::spawn(async move {
            match hyper::upgrade::on(&mut req).await {
                Ok(upgraded) => splice(upgraded, upstream, leftover).await,
                Err(e) => debug!(error = %e, "Client upgrade did not complete"),
            }
        });

        Ok(response)
    }

    async fn connect_tls(
        &self,
        target: &Target,
        secure: bool,
    ) -> Result<tokio_rustls::client::TlsStream<TcpStream>, ForwardError> {
        let stream = TcpStream::connect((target.hostname.as_str(), target.port))
            .await
            .map_err(ForwardError::Connect)?;
        let config = if secure {
            Arc::clone(&self.tls_verified)
        } else {
            Arc::clone(&self.tls_unverified)
        };
        let name = ServerName::try_from(target.hostname.clone()).map_err(|_| {
            ForwardError::Connect(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid TLS server name: {}", target.hostname),
            ))
        })?;
        TlsConnector::from(config)
            .connect(name, stream)
            .await
            .map_err(ForwardError::Connect)
    }
}

trait AsyncReadWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadWrite for T {}

/// Header rules applied to every outgoing request. X-Forwarded-* values are
/// overwritten, not appended: this proxy is the first trusted hop.
fn apply_forward_headers(
    headers: &mut HeaderMap,
    target: &Target,
    opts: &ResolvedForwardOptions,
    meta: &ForwardMeta,
) {
    let incoming_host = headers.get(HOST).cloned();

    if opts.xfwd {
        if let Ok(value) = HeaderValue::from_str(&meta.client_ip.to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = incoming_host.clone() {
            headers.insert(X_FORWARDED_HOST, host);
        }
        let proto = if meta.is_tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
    }

    if let Some(host) = &meta.host_override {
        headers.insert(HOST, host.clone());
    } else if opts.change_origin {
        if let Ok(value) = HeaderValue::from_str(&target.host) {
            headers.insert(HOST, value);
        }
    }
}

/// NTLM keeps multi-step challenges in a single comma-joined
/// `WWW-Authenticate` value; some clients only negotiate when each challenge
/// occupies its own header entry.
fn split_auth_challenges(headers: &mut HeaderMap) {
    let joined: Vec<String> = headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .map(String::from)
        .collect();
    if joined.is_empty() {
        return;
    }

    headers.remove(WWW_AUTHENTICATE);
    for value in joined {
        for challenge in value.split(',') {
            let challenge = challenge.trim();
            if challenge.is_empty() {
                continue;
            }
            if let Ok(v) = HeaderValue::from_str(challenge) {
                headers.append(WWW_AUTHENTICATE, v);
            }
        }
    }
}

/// Serialize the client's upgrade request for replay against the upstream.
fn build_upgrade_request(req: &Request<Incoming>, target: &Target) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut raw = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == HOST {
            continue;
        }
        if let Ok(v) = value.to_str() {
            raw.push_str(&format!("{}: {}\r\n", name, v));
        }
    }
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or(&target.host);
    raw.push_str(&format!("Host: {}\r\n\r\n", host));
    raw.into_bytes()
}

/// Read from the upstream until the end of the response head. Returns the
/// head bytes and whatever bytes of the body/stream were read past it.
async fn read_response_head(
    stream: &mut (impl AsyncRead + Unpin),
) -> Result<(Vec<u8>, Vec<u8>), ForwardError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.map_err(ForwardError::Connect)?;
        if n == 0 {
            return Err(ForwardError::Upgrade(
                "upstream closed before responding".into(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buf) {
            let leftover = buf.split_off(end);
            return Ok((buf, leftover));
        }
        if buf.len() > 16 * 1024 {
            return Err(ForwardError::Upgrade("response head too large".into()));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

fn parse_response_head(head: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(head).ok()?;
    let mut lines = text.lines();

    let status_line = lines.next()?;
    let code: u16 = status_line.split_whitespace().nth(1)?.parse().ok()?;
    let status = StatusCode::from_u16(code).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Some((status, headers))
}

/// Copy bytes both ways until either side closes. Any bytes the upstream
/// sent past its 101 head are flushed to the client first.
async fn splice(client: Upgraded, mut upstream: Box<dyn AsyncReadWrite>, leftover: Vec<u8>) {
    let mut client_io = TokioIo::new(client);
    if !leftover.is_empty() {
        if let Err(e) = client_io.write_all(&leftover).await {
            debug!(error = %e, "Failed to flush buffered upgrade bytes");
            return;
        }
    }
    match tokio::io::copy_bidirectional(&mut client_io, &mut upstream).await {
        Ok((tx, rx)) => debug!(tx, rx, "Upgraded connection closed"),
        Err(e) => debug!(error = %e, "Upgraded connection closed with error"),
    }
}

/// Verified upstream TLS: native roots.
fn verified_client_config() -> rustls::ClientConfig {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        roots.add(cert).ok();
    }
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Unverified upstream TLS, for `secure: false` targets.
fn unverified_client_config() -> rustls::ClientConfig {
    let mut config = rustls::ClientConfig::builder()
        .with_root_certificates(rustls::RootCertStore::empty())
        .with_no_client_auth();
    config
        .dangerous()
        .set_certificate_verifier(Arc::new(NoVerify));
    config
}

#[derive(Debug)]
struct NoVerify;

impl rustls::client::danger::ServerCertVerifier for NoVerify {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}
