//! Certificate store and SNI resolution
//!
//! Hostnames map to secure contexts built from PEM material. An entry may be
//! a `None` sentinel, meaning "registered for TLS but served with the
//! listener's default certificate" (the state ACME hostnames are in until
//! acquisition completes). Entries may carry a renewal timer; the timer is
//! aborted whenever its entry is replaced or removed.

use anyhow::{anyhow, Context};
use parking_lot::RwLock;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::collections::HashMap;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::task::AbortHandle;
use tracing::debug;

struct CertEntry {
    /// `None` means "use the listener default".
    ctx: Option<Arc<CertifiedKey>>,
    renewal: Option<AbortHandle>,
}

impl Drop for CertEntry {
    fn drop(&mut self) {
        if let Some(timer) = self.renewal.take() {
            timer.abort();
        }
    }
}

/// hostname → secure context, shared between the control plane and the SNI
/// callback. The callback is synchronous, hence the sync lock.
#[derive(Default)]
pub struct CertStore {
    entries: RwLock<HashMap<String, CertEntry>>,
}

impl CertStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install (or atomically replace) the context for a hostname. A pending
    /// renewal timer survives the swap.
    pub fn install(&self, hostname: &str, ctx: Option<Arc<CertifiedKey>>) {
        let hostname = hostname.to_lowercase();
        let mut entries = self.entries.write();
        match entries.get_mut(&hostname) {
            Some(entry) => entry.ctx = ctx,
            None => {
                entries.insert(hostname.clone(), CertEntry { ctx, renewal: None });
            }
        }
        debug!(hostname = %hostname, "Certificate entry installed");
    }

    /// Attach a renewal timer, aborting any previous one.
    pub fn set_renewal(&self, hostname: &str, timer: AbortHandle) {
        let mut entries = self.entries.write();
        let entry = entries.entry(hostname.to_lowercase()).or_insert(CertEntry {
            ctx: None,
            renewal: None,
        });
        if let Some(old) = entry.renewal.replace(timer) {
            old.abort();
        }
    }

    pub fn contains(&self, hostname: &str) -> bool {
        self.entries.read().contains_key(hostname)
    }

    /// Context for a hostname. `None` on a miss or on the default-cert
    /// sentinel; the caller falls back to the listener default either way.
    pub fn context_for(&self, hostname: &str) -> Option<Arc<CertifiedKey>> {
        self.entries.read().get(hostname)?.ctx.clone()
    }

    /// Drop a hostname's entry, aborting its renewal timer.
    pub fn remove(&self, hostname: &str) {
        if self.entries.write().remove(hostname).is_some() {
            debug!(hostname, "Certificate entry removed");
        }
    }

    /// Drop everything. Called on proxy close so no renewal timer outlives
    /// the listeners.
    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// SNI resolver for one HTTPS listener: store hit wins, listener default
/// otherwise.
pub struct SniResolver {
    store: Arc<CertStore>,
    default: Arc<CertifiedKey>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("entries", &self.store.len())
            .finish()
    }
}

impl SniResolver {
    pub fn new(store: Arc<CertStore>, default: Arc<CertifiedKey>) -> Self {
        Self { store, default }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let from_store = client_hello
            .server_name()
            .and_then(|name| self.store.context_for(name));
        Some(from_store.unwrap_or_else(|| Arc::clone(&self.default)))
    }
}

/// Read every certificate in a PEM file. Bundles are split at each
/// certificate boundary into individual entries.
pub fn load_cert_file(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read certificate file {}", path.display()))?;
    let certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(&data[..]))
            .collect::<Result<_, _>>()
            .with_context(|| format!("invalid PEM in {}", path.display()))?;
    if certs.is_empty() {
        return Err(anyhow!("no certificates found in {}", path.display()));
    }
    Ok(certs)
}

/// Read the first private key in a PEM file.
pub fn load_key_file(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = std::fs::read(path)
        .with_context(|| format!("failed to read key file {}", path.display()))?;
    load_key_pem(&data).ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

/// Pull a private key out of PEM bytes.
pub fn load_key_pem(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(Some(_)) => continue,
            Ok(None) | Err(_) => return None,
        }
    }
}

/// Build a secure context from in-memory PEM material. `extra_chain` (a CA
/// bundle, or the issuer chain from an ACME order) is appended to the
/// certificate chain.
pub fn certified_key_from_pem(
    key_pem: &[u8],
    cert_pem: &[u8],
    extra_chain: Option<&[u8]>,
) -> anyhow::Result<CertifiedKey> {
    let mut certs: Vec<CertificateDer<'static>> =
        rustls_pemfile::certs(&mut BufReader::new(cert_pem))
            .collect::<Result<_, _>>()
            .context("invalid certificate PEM")?;
    if certs.is_empty() {
        return Err(anyhow!("certificate PEM contains no certificates"));
    }
    if let Some(chain) = extra_chain {
        let chain_certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(chain))
                .collect::<Result<_, _>>()
                .context("invalid chain PEM")?;
        certs.extend(chain_certs);
    }

    let key = load_key_pem(key_pem).ok_or_else(|| anyhow!("key PEM contains no private key"))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| anyhow!("unsupported private key: {}", e))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Build a secure context from PEM files on disk.
pub fn certified_key_from_files(
    key: &Path,
    cert: &Path,
    ca: Option<&Path>,
) -> anyhow::Result<CertifiedKey> {
    let mut certs = load_cert_file(cert)?;
    if let Some(ca_path) = ca {
        certs.extend(load_cert_file(ca_path)?);
    }
    let key = load_key_file(key)?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| anyhow!("unsupported private key: {}", e))?;
    Ok(CertifiedKey::new(certs, signing_key))
}

/// Expiry (notAfter) of a DER certificate.
pub fn cert_expiry(cert: &CertificateDer<'_>) -> Option<SystemTime> {
    use x509_parser::prelude::*;

    let (_, parsed) = X509Certificate::from_der(cert.as_ref()).ok()?;
    let timestamp = parsed.validity().not_after.timestamp();
    if timestamp < 0 {
        return None;
    }
    Some(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(timestamp as u64))
}
