//! ACME (Let's Encrypt) integration
//!
//! Certificate acquisition is bootstrapped from route registration: an
//! internal challenge server answers HTTP-01 probes, a highest-priority
//! resolver steers `/.well-known/acme-challenge` traffic to it, and
//! `update_certificates` installs the obtained context and schedules a
//! single-shot renewal timer.
//!
//! The ACME wire protocol sits behind the [`CertificateSource`] trait; the
//! default implementation drives `instant-acme`. Account keys and issued
//! material live under the configured path. Keys are written with 0600
//! permissions but are not encrypted at rest.

use crate::certs::{cert_expiry, certified_key_from_pem, CertStore};
use crate::error::{full_body, ProxyBody};
use crate::resolver::{Resolution, ResolverId, ResolverSet, CHALLENGE_PRIORITY};
use anyhow::{anyhow, Context};
use futures::future::BoxFuture;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use parking_lot::Mutex;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::CertificateDer;
use std::collections::HashMap;
use std::io::BufReader;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// URL prefix the challenge resolver intercepts.
pub const CHALLENGE_URL_PREFIX: &str = "/.well-known/acme-challenge";

const DEFAULT_CHALLENGE_PORT: u16 = 3000;
const DEFAULT_RENEW_WITHIN: Duration = Duration::from_secs(30 * 24 * 60 * 60);
const DEFAULT_MIN_RENEW_TIME: Duration = Duration::from_secs(60 * 60);

/// Global ACME configuration (`letsencrypt` construction option).
#[derive(Debug, Clone)]
pub struct AcmeOptions {
    /// Directory for account credentials, issued material and webroot
    /// challenges.
    pub path: PathBuf,
    /// Internal challenge server port.
    pub port: u16,
    /// Default renew-ahead window for routes that do not set their own.
    pub renew_within: Duration,
    /// Lower clamp for the renewal timer.
    pub min_renew_time: Duration,
}

impl AcmeOptions {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            port: DEFAULT_CHALLENGE_PORT,
            renew_within: DEFAULT_RENEW_WITHIN,
            min_renew_time: DEFAULT_MIN_RENEW_TIME,
        }
    }
}

/// Pending HTTP-01 key authorizations, shared between the ACME client and
/// the challenge server.
#[derive(Clone, Default)]
pub struct ChallengeTokens {
    inner: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, token: String, key_authorization: String) {
        self.inner.write().await.insert(token, key_authorization);
    }

    pub async fn get(&self, token: &str) -> Option<String> {
        self.inner.read().await.get(token).cloned()
    }

    pub async fn remove(&self, token: &str) {
        self.inner.write().await.remove(token);
    }
}

/// Material returned by a certificate provider.
#[derive(Debug, Clone)]
pub struct ObtainedCertificate {
    pub private_key_pem: String,
    /// Leaf certificate, possibly already concatenated with its chain.
    pub cert_pem: String,
    /// Additional chain material to append, may be empty.
    pub chain_pem: String,
    pub expires_at: SystemTime,
}

/// Opaque certificate provider. `staging` selects the provider's test
/// directory; `force_renew` bypasses any cached material.
pub trait CertificateSource: Send + Sync {
    fn get_certificates<'a>(
        &'a self,
        domain: &'a str,
        email: &'a str,
        staging: bool,
        force_renew: bool,
    ) -> BoxFuture<'a, anyhow::Result<ObtainedCertificate>>;
}

/// The ACME side of the proxy: challenge plumbing plus renewal scheduling.
pub struct AcmeService {
    opts: AcmeOptions,
    tokens: ChallengeTokens,
    source: Arc<dyn CertificateSource>,
    challenge_server: Mutex<Option<AbortHandle>>,
}

impl AcmeService {
    /// Build the service. `source` defaults to the `instant-acme`-backed
    /// client; tests inject their own.
    pub fn new(opts: AcmeOptions, source: Option<Arc<dyn CertificateSource>>) -> Arc<Self> {
        let tokens = ChallengeTokens::new();
        let source = source.unwrap_or_else(|| {
            Arc::new(AcmeDirectoryClient::new(opts.path.clone(), tokens.clone()))
                as Arc<dyn CertificateSource>
        });
        Arc::new(Self {
            opts,
            tokens,
            source,
            challenge_server: Mutex::new(None),
        })
    }

    pub fn options(&self) -> &AcmeOptions {
        &self.opts
    }

    pub fn tokens(&self) -> ChallengeTokens {
        self.tokens.clone()
    }

    /// True when `target` is the internal challenge endpoint; such targets
    /// are exempt from the HTTP→HTTPS redirect.
    pub fn is_challenge_target(&self, target: &crate::urls::Target) -> bool {
        target.hostname == "127.0.0.1" && target.port == self.opts.port
    }

    /// Register the priority-9999 resolver that maps challenge URLs to the
    /// internal server, encoding the requested host in the target path.
    pub fn register_resolver(self: &Arc<Self>, resolvers: &ResolverSet) -> ResolverId {
        let port = self.opts.port;
        resolvers.add(CHALLENGE_PRIORITY, move |host, url, _info| {
            let resolution = if url.starts_with(CHALLENGE_URL_PREFIX) {
                Some(Resolution::Target(format!("http://127.0.0.1:{}/{}", port, host)))
            } else {
                None
            };
            Box::pin(std::future::ready(Ok(resolution)))
        })
    }

    /// Start the internal challenge server on `127.0.0.1:<port>`.
    pub async fn start_challenge_server(self: &Arc<Self>) -> anyhow::Result<()> {
        let mut guard = self.challenge_server.lock();
        if guard.is_some() {
            return Ok(());
        }

        let addr = std::net::SocketAddr::from(([127, 0, 0, 1], self.opts.port));
        let listener = std::net::TcpListener::bind(addr)
            .with_context(|| format!("failed to bind ACME challenge server on {}", addr))?;
        listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(listener)?;
        info!(%addr, "ACME challenge server listening");

        let tokens = self.tokens.clone();
        let webroot = self.opts.path.clone();
        let task = tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "Challenge server accept failed");
                        continue;
                    }
                };
                let tokens = tokens.clone();
                let webroot = webroot.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        let tokens = tokens.clone();
                        let webroot = webroot.clone();
                        async move { serve_challenge(req, tokens, webroot).await }
                    });
                    if let Err(e) = hyper::server::conn::http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await
                    {
                        debug!(error = %e, "Challenge connection error");
                    }
                });
            }
        });
        *guard = Some(task.abort_handle());
        Ok(())
    }

    /// Stop the challenge server. Renewal timers are owned by the cert
    /// store and die with their entries.
    pub fn stop(&self) {
        if let Some(task) = self.challenge_server.lock().take() {
            task.abort();
        }
    }

    /// Obtain (or renew) the certificate for `domain`, install it and
    /// schedule the next renewal. On failure the error is returned and no
    /// retry is scheduled; the hostname keeps serving on the listener
    /// default certificate.
    pub async fn update_certificates(
        self: &Arc<Self>,
        store: &Arc<CertStore>,
        domain: &str,
        email: &str,
        production: bool,
        renew_within: Duration,
        renew: bool,
    ) -> anyhow::Result<()> {
        info!(domain, email, production, renew, "Requesting certificate");
        let obtained = self
            .source
            .get_certificates(domain, email, !production, renew)
            .await?;

        let chain = if obtained.chain_pem.is_empty() {
            None
        } else {
            Some(obtained.chain_pem.as_bytes())
        };
        let ck = certified_key_from_pem(
            obtained.private_key_pem.as_bytes(),
            obtained.cert_pem.as_bytes(),
            chain,
        )?;
        store.install(domain, Some(Arc::new(ck)));

        let delay = renewal_delay(
            obtained.expires_at,
            SystemTime::now(),
            renew_within,
            self.opts.min_renew_time,
        );
        info!(domain, renew_in_secs = delay.as_secs(), "Certificate installed");
        self.schedule_renewal(store, domain, email, production, renew_within, delay);
        Ok(())
    }

    fn schedule_renewal(
        self: &Arc<Self>,
        store: &Arc<CertStore>,
        domain: &str,
        email: &str,
        production: bool,
        renew_within: Duration,
        delay: Duration,
    ) {
        let svc = Arc::clone(self);
        let store_for_task = Arc::clone(store);
        let domain_owned = domain.to_string();
        let email_owned = email.to_string();

        // Boxed as `dyn Future` to cut the recursive future type.
        let task: Pin<Box<dyn std::future::Future<Output = ()> + Send>> =
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = svc
                    .update_certificates(
                        &store_for_task,
                        &domain_owned,
                        &email_owned,
                        production,
                        renew_within,
                        true,
                    )
                    .await
                {
                    error!(domain = %domain_owned, error = %e, "Certificate renewal failed");
                }
            });
        let handle = tokio::spawn(task);
        store.set_renewal(domain, handle.abort_handle());
    }
}

/// Timer delay: `expires_at − now − renew_within`, clamped to the minimum
/// when non-positive.
fn renewal_delay(
    expires_at: SystemTime,
    now: SystemTime,
    renew_within: Duration,
    min_renew_time: Duration,
) -> Duration {
    expires_at
        .duration_since(now)
        .ok()
        .and_then(|until_expiry| until_expiry.checked_sub(renew_within))
        .filter(|d| !d.is_zero())
        .unwrap_or(min_renew_time)
}

/// `/<host>/.well-known/acme-challenge/<token>` → `(host, token)`.
fn parse_challenge_path(path: &str) -> Option<(&str, &str)> {
    let rest = path.strip_prefix('/')?;
    let (host, rest) = rest.split_once('/')?;
    let token = rest
        .strip_prefix(CHALLENGE_URL_PREFIX.trim_start_matches('/'))?
        .strip_prefix('/')?;
    if host.is_empty() || token.is_empty() || token.contains('/') || token.contains("..") {
        return None;
    }
    Some((host, token))
}

async fn serve_challenge(
    req: Request<Incoming>,
    tokens: ChallengeTokens,
    webroot: PathBuf,
) -> Result<Response<ProxyBody>, hyper::Error> {
    let path = req.uri().path().to_string();
    let Some((host, token)) = parse_challenge_path(&path) else {
        return Ok(plain_response(StatusCode::NOT_FOUND, "Not Found"));
    };

    if let Some(key_auth) = tokens.get(token).await {
        debug!(host, token, "Answering ACME challenge from memory");
        return Ok(plain_response(StatusCode::OK, key_auth));
    }

    // Webroot fallback for externally-managed challenges.
    let file = webroot
        .join(host)
        .join(".well-known/acme-challenge")
        .join(token);
    match tokio::fs::read_to_string(&file).await {
        Ok(contents) => {
            debug!(host, token, "Answering ACME challenge from webroot");
            Ok(plain_response(StatusCode::OK, contents))
        }
        Err(_) => Ok(plain_response(StatusCode::NOT_FOUND, "Not Found")),
    }
}

fn plain_response(status: StatusCode, body: impl Into<String>) -> Response<ProxyBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body(body.into()))
        .expect("static response parts")
}

/// `instant-acme`-backed certificate provider. One ACME account per
/// `(email, directory)`, cached under `<path>/accounts`; issued material
/// cached under `<path>/certs/<domain>`.
pub struct AcmeDirectoryClient {
    path: PathBuf,
    tokens: ChallengeTokens,
}

impl AcmeDirectoryClient {
    pub fn new(path: PathBuf, tokens: ChallengeTokens) -> Self {
        Self { path, tokens }
    }

    async fn account(&self, email: &str, staging: bool) -> anyhow::Result<Account> {
        let suffix = if staging { "-staging" } else { "" };
        let account_path = self
            .path
            .join("accounts")
            .join(format!("{}{}.json", email, suffix));

        if account_path.exists() {
            debug!(path = %account_path.display(), "Loading ACME account");
            let data = tokio::fs::read_to_string(&account_path).await?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            return Ok(Account::from_credentials(credentials).await?);
        }

        info!(email, staging, "Creating ACME account");
        let directory = if staging {
            LetsEncrypt::Staging.url()
        } else {
            LetsEncrypt::Production.url()
        };
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory,
            None,
        )
        .await?;

        tokio::fs::create_dir_all(account_path.parent().expect("accounts dir")).await?;
        tokio::fs::write(&account_path, serde_json::to_string_pretty(&credentials)?).await?;
        Ok(account)
    }

    fn cached(&self, domain: &str, renew_within: Duration) -> Option<ObtainedCertificate> {
        let dir = self.path.join("certs").join(domain);
        let cert_pem = std::fs::read_to_string(dir.join("cert.pem")).ok()?;
        let key_pem = std::fs::read_to_string(dir.join("key.pem")).ok()?;
        let expires_at = first_cert_expiry(&cert_pem)?;

        // Only reuse material that is not already inside its renew window.
        if expires_at <= SystemTime::now() + renew_within {
            return None;
        }
        Some(ObtainedCertificate {
            private_key_pem: key_pem,
            cert_pem,
            chain_pem: String::new(),
            expires_at,
        })
    }

    fn save(&self, domain: &str, cert_pem: &str, key_pem: &str) -> anyhow::Result<()> {
        let dir = self.path.join("certs").join(domain);
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("cert.pem"), cert_pem)?;

        let key_path = dir.join("key.pem");
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&key_path)?;
            std::io::Write::write_all(&mut file, key_pem.as_bytes())?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(&key_path, key_pem)?;
        }
        Ok(())
    }

    async fn order(&self, account: &Account, domain: &str) -> anyhow::Result<ObtainedCertificate> {
        let identifier = Identifier::Dns(domain.to_string());
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &[identifier],
            })
            .await?;

        let authorizations = order.authorizations().await?;
        for authz in &authorizations {
            if matches!(authz.status, AuthorizationStatus::Valid) {
                continue;
            }
            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| anyhow!("no HTTP-01 challenge offered for {}", domain))?;

            let key_auth = order.key_authorization(challenge);
            self.tokens
                .set(challenge.token.clone(), key_auth.as_str().to_string())
                .await;
            order.set_challenge_ready(&challenge.url).await?;

            let mut attempts = 0u32;
            loop {
                tokio::time::sleep(Duration::from_secs(2)).await;
                order.refresh().await?;
                let auths = order.authorizations().await?;
                let status = auths
                    .iter()
                    .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == domain))
                    .map(|a| &a.status);
                match status {
                    Some(AuthorizationStatus::Valid) => break,
                    Some(AuthorizationStatus::Invalid) => {
                        self.tokens.remove(&challenge.token).await;
                        return Err(anyhow!("authorization failed for {}", domain));
                    }
                    _ => {
                        attempts += 1;
                        if attempts > 30 {
                            self.tokens.remove(&challenge.token).await;
                            return Err(anyhow!("authorization timeout for {}", domain));
                        }
                    }
                }
            }
            self.tokens.remove(&challenge.token).await;
        }

        // Wait for the order to accept a CSR.
        let mut attempts = 0u32;
        loop {
            let state = order.state();
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => return Err(anyhow!("order invalid for {}", domain)),
                _ => {
                    attempts += 1;
                    if attempts > 30 {
                        return Err(anyhow!("order timeout for {}", domain));
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    order.refresh().await?;
                }
            }
        }

        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, domain.to_string());
        let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&key_pair)?;
        order.finalize(csr.der()).await?;

        let mut attempts = 0u32;
        let cert_chain_pem: String = loop {
            order.refresh().await?;
            let state = order.state();
            match state.status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    return Err(anyhow!("order valid but no certificate for {}", domain));
                }
                OrderStatus::Invalid => return Err(anyhow!("order invalid for {}", domain)),
                _ => {
                    attempts += 1;
                    if attempts > 30 {
                        return Err(anyhow!("certificate timeout for {}", domain));
                    }
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        };

        let expires_at = first_cert_expiry(&cert_chain_pem)
            .ok_or_else(|| anyhow!("issued certificate for {} is unparseable", domain))?;
        Ok(ObtainedCertificate {
            private_key_pem: key_pair.serialize_pem(),
            cert_pem: cert_chain_pem,
            chain_pem: String::new(),
            expires_at,
        })
    }
}

impl CertificateSource for AcmeDirectoryClient {
    fn get_certificates<'a>(
        &'a self,
        domain: &'a str,
        email: &'a str,
        staging: bool,
        force_renew: bool,
    ) -> BoxFuture<'a, anyhow::Result<ObtainedCertificate>> {
        Box::pin(async move {
            if !force_renew {
                if let Some(cached) = self.cached(domain, DEFAULT_RENEW_WITHIN) {
                    info!(domain, "Using cached certificate material");
                    return Ok(cached);
                }
            }
            let account = self.account(email, staging).await?;
            let obtained = self.order(&account, domain).await?;
            self.save(domain, &obtained.cert_pem, &obtained.private_key_pem)?;
            Ok(obtained)
        })
    }
}

/// Expiry of the first certificate in a PEM bundle.
fn first_cert_expiry(pem: &str) -> Option<SystemTime> {
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(pem.as_bytes()))
            .filter_map(|c| c.ok())
            .collect();
    cert_expiry(certs.first()?)
}
