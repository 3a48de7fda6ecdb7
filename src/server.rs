//! The proxy: listeners, connection bookkeeping and the request pipeline
//!
//! One optional HTTP listener plus zero-or-more HTTPS listeners with
//! SNI-based certificate selection feed every request through the same
//! pipeline: source extraction → resolver pipeline → URL rewrite →
//! round-robin target selection → `on_request` hook → skip / redirect /
//! forward → `on_response` or `on_error`.

use crate::acme::{AcmeOptions, AcmeService, CertificateSource};
use crate::certs::{certified_key_from_files, CertStore, SniResolver};
use crate::error::{default_error_response, full_body, ProxyBody, RegisterError};
use crate::forwarder::{ForwardMeta, ForwarderCache, ResolvedForwardOptions};
use crate::resolver::{BoxedResolver, RequestInfo, ResolverFuture, ResolverId, ResolverSet};
use crate::routes::{
    ErrorHook, ForwardOptions, NotFoundHook, RequestAction, RouteOptions, RoutingTable,
};
use crate::urls::{build_target, join_target_path, parse_source, strip_route_path, TargetFlags};
use anyhow::Context;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST, LOCATION};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const X_FORWARDED_HOST: &str = "x-forwarded-host";
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

/// One HTTPS listener.
#[derive(Debug, Clone)]
pub struct SslConfig {
    pub port: u16,
    pub ip: IpAddr,
    pub key: PathBuf,
    pub cert: PathBuf,
    pub ca: Option<PathBuf>,
    /// Offer h2 alongside http/1.1 via ALPN.
    pub http2: bool,
    /// Advertise this listener in HTTP→HTTPS redirect Locations. On by
    /// default; the first listener with it set is the redirect target.
    pub redirect: bool,
    /// Port advertised in redirect Locations; defaults to `port`.
    pub redirect_port: Option<u16>,
}

impl SslConfig {
    pub fn new(port: u16, key: impl Into<PathBuf>, cert: impl Into<PathBuf>) -> Self {
        Self {
            port,
            ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            key: key.into(),
            cert: cert.into(),
            ca: None,
            http2: false,
            redirect: true,
            redirect_port: None,
        }
    }
}

/// Proxy construction options.
pub struct ProxyOptions {
    /// HTTP listener port; `None` means no HTTP listener.
    pub port: Option<u16>,
    /// HTTP bind address.
    pub host: IpAddr,
    pub ssl: Vec<SslConfig>,
    /// Default forward options, merged under each route's.
    pub http_proxy: ForwardOptions,
    /// Add X-Forwarded-* headers.
    pub xfwd: bool,
    /// Verify upstream TLS certificates.
    pub secure: bool,
    /// Prefer X-Forwarded-Host over Host for source determination.
    pub prefer_forwarded_host: bool,
    /// Split multi-challenge WWW-Authenticate response headers.
    pub ntlm: bool,
    pub letsencrypt: Option<AcmeOptions>,
    /// Extra resolvers installed at construction, as `(priority, callable)`.
    pub resolvers: Vec<(i32, BoxedResolver)>,
    /// Global fallback for forward errors.
    pub error_handler: Option<ErrorHook>,
    /// Certificate provider override; defaults to the ACME directory client.
    pub certificate_source: Option<Arc<dyn CertificateSource>>,
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self {
            port: None,
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            ssl: Vec::new(),
            http_proxy: ForwardOptions::default(),
            xfwd: true,
            secure: true,
            prefer_forwarded_host: false,
            ntlm: false,
            letsencrypt: None,
            resolvers: Vec::new(),
            error_handler: None,
            certificate_source: None,
        }
    }
}

/// Live connections keyed by a monotonically increasing id. An entry exists
/// while the serving task runs; the task removes itself on completion.
#[derive(Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    conns: Mutex<HashMap<u64, AbortHandle>>,
}

impl ConnectionRegistry {
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn insert(&self, id: u64, handle: AbortHandle) {
        self.conns.lock().insert(id, handle);
    }

    pub fn remove(&self, id: u64) {
        self.conns.lock().remove(&id);
    }

    /// Swap the map for an empty one, returning the captured connections.
    pub fn drain(&self) -> Vec<AbortHandle> {
        std::mem::take(&mut *self.conns.lock())
            .into_values()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.conns.lock().len()
    }
}

struct Inner {
    opts: ProxyOptions,
    table: RoutingTable,
    resolvers: ResolverSet,
    certs: Arc<CertStore>,
    forwarders: ForwarderCache,
    connections: ConnectionRegistry,
    acme: Option<Arc<AcmeService>>,
    not_found: RwLock<Option<NotFoundHook>>,
    shutdown: watch::Sender<bool>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    http_addr: Mutex<Option<SocketAddr>>,
    https_addrs: Mutex<Vec<SocketAddr>>,
}

/// The dynamic reverse proxy. Cheap to clone; all clones share one state.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Inner>,
}

impl Proxy {
    pub fn new(mut opts: ProxyOptions) -> Self {
        let (shutdown, _) = watch::channel(false);
        let certificate_source = opts.certificate_source.take();
        let initial_resolvers = std::mem::take(&mut opts.resolvers);
        let acme = opts
            .letsencrypt
            .clone()
            .map(|acme_opts| AcmeService::new(acme_opts, certificate_source));

        let inner = Arc::new(Inner {
            opts,
            table: RoutingTable::new(),
            resolvers: ResolverSet::new(),
            certs: Arc::new(CertStore::new()),
            forwarders: ForwarderCache::new(),
            connections: ConnectionRegistry::default(),
            acme,
            not_found: RwLock::new(None),
            shutdown,
            listeners: Mutex::new(Vec::new()),
            http_addr: Mutex::new(None),
            https_addrs: Mutex::new(Vec::new()),
        });

        if let Some(acme) = &inner.acme {
            acme.register_resolver(&inner.resolvers);
        }
        for (priority, func) in initial_resolvers {
            inner.resolvers.add(priority, func);
        }
        Self { inner }
    }

    /// Register a route target for `(src host, src path)`.
    pub fn register(
        &self,
        src: &str,
        target: &str,
        opts: RouteOptions,
    ) -> Result<(), RegisterError> {
        if src.trim().is_empty() {
            return Err(RegisterError::MissingSource);
        }
        if target.trim().is_empty() {
            return Err(RegisterError::MissingTarget);
        }

        let source = parse_source(src)?;
        let flags = TargetFlags {
            ssl_redirect: opts
                .ssl
                .as_ref()
                .map(|s| s.redirect_enabled())
                .unwrap_or(false),
            use_target_host_header: opts.use_target_host_header,
        };
        let target = build_target(target, flags)?;

        if let Some(ssl) = &opts.ssl {
            if self.inner.opts.ssl.is_empty() {
                return Err(RegisterError::NoHttpsListener);
            }
            if !self.inner.certs.contains(&source.hostname) {
                if let (Some(key), Some(cert)) = (&ssl.key, &ssl.cert) {
                    let ck = certified_key_from_files(key, cert, ssl.ca.as_deref())
                        .map_err(|e| RegisterError::Certificate(e.to_string()))?;
                    self.inner.certs.install(&source.hostname, Some(Arc::new(ck)));
                } else if let Some(le) = &ssl.letsencrypt {
                    let Some(acme) = self.inner.acme.clone() else {
                        return Err(RegisterError::AcmeNotConfigured);
                    };
                    // Reserve the hostname on the default certificate until
                    // acquisition completes.
                    self.inner.certs.install(&source.hostname, None);
                    let renew_within =
                        le.renew_within.unwrap_or(acme.options().renew_within);
                    let store = Arc::clone(&self.inner.certs);
                    let hostname = source.hostname.clone();
                    let email = le.email.clone();
                    let production = le.production;
                    tokio::spawn(async move {
                        if let Err(e) = acme
                            .update_certificates(
                                &store,
                                &hostname,
                                &email,
                                production,
                                renew_within,
                                false,
                            )
                            .await
                        {
                            error!(hostname = %hostname, error = %e, "Certificate acquisition failed");
                        }
                    });
                } else {
                    self.inner.certs.install(&source.hostname, None);
                }
            }
        }

        let change_origin = opts.http_proxy.change_origin == Some(true);
        let forwarder = self.inner.forwarders.handle_for(&target, change_origin);
        self.inner
            .table
            .register_target(&source.hostname, &source.pathname, target, opts, forwarder);
        Ok(())
    }

    /// Remove a route target (or every target of the route when `target` is
    /// `None`). Emptied routes leave the table; a hostname left without
    /// routes drops its certificate entry and renewal timer.
    pub fn unregister(&self, src: &str, target: Option<&str>) -> Result<(), RegisterError> {
        if src.trim().is_empty() {
            return Err(RegisterError::MissingSource);
        }
        let source = parse_source(src)?;
        let href = match target {
            Some(t) => Some(build_target(t, TargetFlags::default())?.href),
            None => None,
        };
        let outcome =
            self.inner
                .table
                .unregister(&source.hostname, &source.pathname, href.as_deref());
        if outcome.host_empty {
            self.inner.certs.remove(&source.hostname);
        }
        Ok(())
    }

    pub fn add_resolver<F>(&self, priority: i32, func: F) -> ResolverId
    where
        F: Fn(&str, &str, &RequestInfo) -> ResolverFuture + Send + Sync + 'static,
    {
        self.inner.resolvers.add(priority, func)
    }

    pub fn remove_resolver(&self, id: ResolverId) {
        self.inner.resolvers.remove(id);
    }

    /// Replace the default 404 responder.
    pub fn not_found<F>(&self, func: F)
    where
        F: Fn(&Request<Incoming>) -> Response<ProxyBody> + Send + Sync + 'static,
    {
        *self.inner.not_found.write() = Some(Arc::new(func));
    }

    pub fn routing_table(&self) -> &RoutingTable {
        &self.inner.table
    }

    pub fn cert_store(&self) -> &CertStore {
        &self.inner.certs
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    /// Bound address of the HTTP listener, once `listen` succeeded.
    pub fn http_addr(&self) -> Option<SocketAddr> {
        *self.inner.http_addr.lock()
    }

    /// Bound addresses of the HTTPS listeners, in configuration order.
    pub fn https_addrs(&self) -> Vec<SocketAddr> {
        self.inner.https_addrs.lock().clone()
    }

    /// Bind every configured listener and start accepting. On partial
    /// failure, listeners that did start are torn down before returning.
    pub async fn listen(&self) -> anyhow::Result<()> {
        match self.try_listen().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.close(false).await;
                Err(e)
            }
        }
    }

    async fn try_listen(&self) -> anyhow::Result<()> {
        if let Some(port) = self.inner.opts.port {
            let addr = SocketAddr::new(self.inner.opts.host, port);
            let listener = bind_listener(addr)
                .with_context(|| format!("failed to bind HTTP listener on {}", addr))?;
            let local = listener.local_addr()?;
            *self.inner.http_addr.lock() = Some(local);
            info!(addr = %local, "HTTP listener ready");

            let task = tokio::spawn(accept_loop(Arc::clone(&self.inner), listener, None));
            self.inner.listeners.lock().push(task);
        }

        for ssl in &self.inner.opts.ssl {
            let default = certified_key_from_files(&ssl.key, &ssl.cert, ssl.ca.as_deref())
                .with_context(|| format!("failed to load listener certificate for :{}", ssl.port))?;
            let resolver =
                SniResolver::new(Arc::clone(&self.inner.certs), Arc::new(default));
            let mut config = rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_cert_resolver(Arc::new(resolver));
            config.alpn_protocols = if ssl.http2 {
                vec![b"h2".to_vec(), b"http/1.1".to_vec()]
            } else {
                vec![b"http/1.1".to_vec()]
            };
            let acceptor = TlsAcceptor::from(Arc::new(config));

            let addr = SocketAddr::new(ssl.ip, ssl.port);
            let listener = bind_listener(addr)
                .with_context(|| format!("failed to bind HTTPS listener on {}", addr))?;
            let local = listener.local_addr()?;
            self.inner.https_addrs.lock().push(local);
            info!(addr = %local, http2 = ssl.http2, "HTTPS listener ready");

            let task = tokio::spawn(accept_loop(
                Arc::clone(&self.inner),
                listener,
                Some(acceptor),
            ));
            self.inner.listeners.lock().push(task);
        }

        if let Some(acme) = &self.inner.acme {
            acme.start_challenge_server().await?;
        }
        Ok(())
    }

    /// Stop accepting. With `shutdown`, also end every tracked connection
    /// after a short grace period.
    pub async fn close(&self, shutdown: bool) {
        let _ = self.inner.shutdown.send(true);
        if let Some(acme) = &self.inner.acme {
            acme.stop();
        }
        // Dropping entries aborts renewal timers.
        self.inner.certs.clear();

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.inner.listeners.lock());
        for handle in handles {
            let _ = handle.await;
        }

        if shutdown {
            let captured = self.inner.connections.drain();
            if !captured.is_empty() {
                info!(connections = captured.len(), "Draining live connections");
                tokio::time::sleep(SHUTDOWN_GRACE).await;
                for conn in captured {
                    conn.abort();
                }
            }
        }
    }
}

/// Bind with SO_REUSEPORT (where available) so cluster workers can share a
/// listening port.
fn bind_listener(addr: SocketAddr) -> std::io::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        tokio::net::TcpSocket::new_v4()?
    } else {
        tokio::net::TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    socket.listen(1024)
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener, acceptor: Option<TlsAcceptor>) {
    let mut shutdown_rx = inner.shutdown.subscribe();
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        spawn_connection(Arc::clone(&inner), stream, addr, acceptor.clone());
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    debug!("Listener shutting down");
                    break;
                }
            }
        }
    }
}

fn spawn_connection(
    inner: Arc<Inner>,
    stream: TcpStream,
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
) {
    let id = inner.connections.next_id();
    // The task waits for its registry entry before serving, so removal
    // cannot race the insert below.
    let (ready_tx, ready_rx) = oneshot::channel::<()>();

    let task_inner = Arc::clone(&inner);
    let handle = tokio::spawn(async move {
        let _ = ready_rx.await;
        match acceptor {
            Some(acceptor) => match acceptor.accept(stream).await {
                Ok(tls) => serve_connection(Arc::clone(&task_inner), tls, addr, true).await,
                Err(e) => debug!(addr = %addr, error = %e, "TLS handshake failed"),
            },
            None => serve_connection(Arc::clone(&task_inner), stream, addr, false).await,
        }
        task_inner.connections.remove(id);
    });

    inner.connections.insert(id, handle.abort_handle());
    let _ = ready_tx.send(());
}

async fn serve_connection<S>(inner: Arc<Inner>, stream: S, addr: SocketAddr, is_tls: bool)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let inner = Arc::clone(&inner);
        async move { handle_request(inner, req, addr, is_tls).await }
    });

    if let Err(e) = AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .http2()
        .max_concurrent_streams(250)
        .serve_connection_with_upgrades(TokioIo::new(stream), service)
        .await
    {
        debug!(addr = %addr, error = %e, "Connection closed with error");
    }
}

async fn handle_request(
    inner: Arc<Inner>,
    mut req: Request<Incoming>,
    addr: SocketAddr,
    is_tls: bool,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let Some(host) = source_host(&inner, &req) else {
        return Ok(not_found_response(&inner, &req));
    };
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    // Pre-hook snapshot: resolvers (and anything else downstream) see the
    // request exactly as the client sent it.
    let info = RequestInfo {
        method: req.method().clone(),
        headers: req.headers().clone(),
    };

    let Some(route) = inner
        .resolvers
        .resolve(&inner.table, &inner.forwarders, &host, &path_and_query, &info)
        .await
    else {
        debug!(host = %host, url = %path_and_query, "No route");
        return Ok(not_found_response(&inner, &req));
    };

    // URL rewrite: strip the matched path, pick a target round-robin, join
    // the target's path prefix.
    let stripped = strip_route_path(&path_and_query, &route.path);
    let Some(target) = route.next_target() else {
        return Ok(not_found_response(&inner, &req));
    };
    let mut rewritten = join_target_path(&target.pathname, &stripped);
    if rewritten.starts_with('?') {
        rewritten.insert(0, '/');
    }
    if let Ok(uri) = rewritten.parse() {
        *req.uri_mut() = uri;
    }

    let host_override = if target.use_target_host_header {
        HeaderValue::from_str(&target.host).ok()
    } else {
        None
    };

    let merged = route.opts.http_proxy.merged_over(&inner.opts.http_proxy);
    let forward_opts = ResolvedForwardOptions {
        secure: merged.secure.unwrap_or(inner.opts.secure),
        xfwd: merged.xfwd.unwrap_or(inner.opts.xfwd),
        ntlm: inner.opts.ntlm,
        change_origin: merged.change_origin.unwrap_or(false),
    };
    let meta = ForwardMeta {
        client_ip: addr.ip(),
        is_tls,
        host_override,
    };

    // WebSocket (and other Upgrade:) requests skip hooks and redirects; the
    // socket is spliced to the upstream.
    if is_upgrade_request(&req) {
        return match route.forwarder.upgrade(req, &target, &forward_opts, &meta).await {
            Ok(resp) => Ok(resp),
            Err(e) => {
                warn!(host = %host, error = %e, "Upgrade forward failed");
                Ok(default_error_response(&e))
            }
        };
    }

    let mut effective = target.clone();
    if let Some(hook) = &route.opts.on_request {
        match hook(&mut req, &target) {
            RequestAction::Continue => {}
            RequestAction::Respond(mut resp) => {
                if let Some(on_response) = &route.opts.on_response {
                    on_response(&mut resp, None);
                }
                return Ok(resp);
            }
            RequestAction::Retarget(t) => effective = t,
        }
    }

    // HTTP source + SSL route + known certificate: send the client to the
    // HTTPS listener instead, unless this is ACME challenge traffic.
    if !is_tls && effective.ssl_redirect && inner.certs.contains(&host) {
        let is_challenge = inner
            .acme
            .as_ref()
            .map(|a| a.is_challenge_target(&effective))
            .unwrap_or(false);
        if !is_challenge {
            if let Some(resp) = https_redirect(&inner, &host, &path_and_query) {
                return Ok(resp);
            }
        }
    }

    match route.forwarder.forward(req, &effective, &forward_opts, &meta).await {
        Ok(mut resp) => {
            if let Some(on_response) = &route.opts.on_response {
                on_response(&mut resp, Some(&effective));
            }
            Ok(resp)
        }
        Err(e) => {
            if let Some(on_error) = &route.opts.on_error {
                Ok(on_error(&e, &effective))
            } else if let Some(handler) = &inner.opts.error_handler {
                Ok(handler(&e, &effective))
            } else {
                Ok(default_error_response(&e))
            }
        }
    }
}

/// Source host: X-Forwarded-Host when preferred and present, else Host.
/// Ports are stripped, the listener fixes them.
fn source_host(inner: &Inner, req: &Request<Incoming>) -> Option<String> {
    let forwarded = if inner.opts.prefer_forwarded_host {
        req.headers()
            .get(X_FORWARDED_HOST)
            .and_then(|v| v.to_str().ok())
    } else {
        None
    };
    let raw = forwarded
        .or_else(|| req.headers().get(HOST).and_then(|v| v.to_str().ok()))
        // HTTP/2 requests carry the authority in the URI instead.
        .or_else(|| req.uri().authority().map(|a| a.as_str()))?;
    let host = raw.split(':').next()?.trim().to_lowercase();
    if host.is_empty() {
        None
    } else {
        Some(host)
    }
}

fn not_found_response(inner: &Inner, req: &Request<Incoming>) -> Response<ProxyBody> {
    if let Some(handler) = &*inner.not_found.read() {
        return handler(req);
    }
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body("Not Found"))
        .expect("static response parts")
}

/// With several HTTPS listeners, the advertised port comes from the first
/// listener with `redirect` enabled; `redirect: false` keeps a listener (an
/// internal one, say) out of client-facing Locations. No eligible listener
/// means no redirect.
fn https_redirect(inner: &Inner, host: &str, original: &str) -> Option<Response<ProxyBody>> {
    let ssl = inner.opts.ssl.iter().find(|s| s.redirect)?;
    let port = ssl.redirect_port.unwrap_or(ssl.port);
    let location = format!("https://{}:{}{}", host, port, original);
    Some(
        Response::builder()
            .status(StatusCode::FOUND)
            .header(LOCATION, location)
            .body(full_body(""))
            .expect("static response parts"),
    )
}

fn is_upgrade_request(req: &Request<Incoming>) -> bool {
    let connection_upgrade = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);
    connection_upgrade && req.headers().contains_key(hyper::header::UPGRADE)
}
