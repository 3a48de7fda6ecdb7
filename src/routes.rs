//! Host+path routing table
//!
//! Routes live in per-hostname buckets ordered by descending path length so
//! that a prefix match always consults the most specific path first. Each
//! route carries an ordered target list with a round-robin cursor, the route
//! options (hooks included) and a shared forwarder handle for its origin.

use crate::error::{ForwardError, ProxyBody};
use crate::forwarder::Forwarder;
use crate::urls::{path_starts_with, Target};
use hyper::body::Incoming;
use hyper::{Request, Response};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// What an `on_request` hook wants done with the request.
pub enum RequestAction {
    /// Proceed to the selected target.
    Continue,
    /// Skip forwarding; the hook already produced the response.
    Respond(Response<ProxyBody>),
    /// Forward, but to this target instead of the selected one.
    Retarget(Target),
}

/// Invoked before forwarding. May mutate the request (headers, URI).
pub type RequestHook =
    Arc<dyn Fn(&mut Request<Incoming>, &Target) -> RequestAction + Send + Sync>;

/// Invoked after the upstream completed, or after a skip (`None` target).
pub type ResponseHook = Arc<dyn Fn(&mut Response<ProxyBody>, Option<&Target>) + Send + Sync>;

/// Invoked on forward failure; replaces the default error responder.
pub type ErrorHook = Arc<dyn Fn(&ForwardError, &Target) -> Response<ProxyBody> + Send + Sync>;

/// Replaces the default 404 responder.
pub type NotFoundHook = Arc<dyn Fn(&Request<Incoming>) -> Response<ProxyBody> + Send + Sync>;

/// Forward options, merged at request time: route-level values win over the
/// proxy-wide defaults, which win over the built-in `secure = true`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ForwardOptions {
    /// Verify upstream TLS certificates.
    pub secure: Option<bool>,
    /// Add X-Forwarded-* headers.
    pub xfwd: Option<bool>,
    /// Rewrite the outgoing Host header to the target's host.
    pub change_origin: Option<bool>,
}

impl ForwardOptions {
    /// Layer `self` (route) over `base` (proxy defaults).
    pub fn merged_over(&self, base: &ForwardOptions) -> ForwardOptions {
        ForwardOptions {
            secure: self.secure.or(base.secure),
            xfwd: self.xfwd.or(base.xfwd),
            change_origin: self.change_origin.or(base.change_origin),
        }
    }
}

/// Per-route TLS options.
#[derive(Clone, Default)]
pub struct RouteSsl {
    /// Redirect plain-HTTP requests for this route to HTTPS. On by default;
    /// `redirect: false` opts out.
    pub redirect: Option<bool>,
    pub key: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub ca: Option<PathBuf>,
    pub letsencrypt: Option<RouteLetsencrypt>,
}

impl RouteSsl {
    pub fn redirect_enabled(&self) -> bool {
        self.redirect != Some(false)
    }
}

/// Opt-in to ACME certificate acquisition for the source hostname.
#[derive(Clone)]
pub struct RouteLetsencrypt {
    pub email: String,
    pub production: bool,
    /// Renew this long before expiry. Defaults to 30 days.
    pub renew_within: Option<Duration>,
}

/// Options accepted by `register`.
#[derive(Clone, Default)]
pub struct RouteOptions {
    pub ssl: Option<RouteSsl>,
    pub use_target_host_header: bool,
    pub http_proxy: ForwardOptions,
    pub on_request: Option<RequestHook>,
    pub on_response: Option<ResponseHook>,
    pub on_error: Option<ErrorHook>,
}

impl std::fmt::Debug for RouteOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteOptions")
            .field("ssl", &self.ssl.is_some())
            .field("use_target_host_header", &self.use_target_host_header)
            .field("http_proxy", &self.http_proxy)
            .field("on_request", &self.on_request.is_some())
            .field("on_response", &self.on_response.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

/// A `(path, targets, round-robin, options, forwarder)` record under a host
/// bucket.
pub struct Route {
    pub path: String,
    urls: RwLock<Vec<Target>>,
    rr: AtomicUsize,
    pub opts: RouteOptions,
    pub(crate) forwarder: Arc<Forwarder>,
    /// Built by a resolver rather than the table; subject to the prefix
    /// guard in the pipeline.
    pub(crate) resolved: bool,
}

impl Route {
    pub(crate) fn new(
        path: impl Into<String>,
        opts: RouteOptions,
        forwarder: Arc<Forwarder>,
        resolved: bool,
    ) -> Self {
        Self {
            path: path.into(),
            urls: RwLock::new(Vec::new()),
            rr: AtomicUsize::new(0),
            opts,
            forwarder,
            resolved,
        }
    }

    /// Pick the next target and advance the cursor by exactly one, modulo the
    /// target count. Returns `None` when the route has been emptied.
    pub fn next_target(&self) -> Option<Target> {
        let urls = self.urls.read();
        let len = urls.len();
        if len == 0 {
            return None;
        }
        let prev = self
            .rr
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| Some((v + 1) % len))
            .unwrap_or(0);
        Some(urls[prev % len].clone())
    }

    pub fn push_target(&self, target: Target) {
        self.urls.write().push(target);
    }

    /// Remove targets matching `href`, or all of them when `None`. Returns
    /// true when the route is now empty.
    pub fn remove_targets(&self, href: Option<&str>) -> bool {
        let mut urls = self.urls.write();
        match href {
            Some(h) => urls.retain(|t| t.href != h),
            None => urls.clear(),
        }
        let len = urls.len();
        if len > 0 {
            // Keep the cursor inside [0, len).
            let cur = self.rr.load(Ordering::Acquire);
            self.rr.store(cur % len, Ordering::Release);
        }
        len == 0
    }

    pub fn target_count(&self) -> usize {
        self.urls.read().len()
    }

    pub fn targets(&self) -> Vec<Target> {
        self.urls.read().clone()
    }

    #[cfg(test)]
    pub(crate) fn rr_value(&self) -> usize {
        self.rr.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("path", &self.path)
            .field("urls", &*self.urls.read())
            .field("rr", &self.rr.load(Ordering::Relaxed))
            .field("resolved", &self.resolved)
            .finish()
    }
}

/// Outcome of an `unregister` call.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct UnregisterOutcome {
    /// A route was fully removed from its bucket.
    pub route_removed: bool,
    /// The hostname no longer has any routes; its certificate entry and
    /// renewal timer should be dropped.
    pub host_empty: bool,
}

/// hostname → ordered routes. Control-plane writes hold the write lock for
/// the whole mutation, so data-plane readers observe pre- or post-state,
/// never a partially-sorted bucket.
#[derive(Default)]
pub struct RoutingTable {
    buckets: RwLock<HashMap<String, Vec<Arc<Route>>>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Find-or-create the route for `(hostname, path)`, append the target and
    /// re-sort the bucket by descending path length (stable, so equal lengths
    /// keep insertion order).
    pub fn register_target(
        &self,
        hostname: &str,
        path: &str,
        target: Target,
        opts: RouteOptions,
        forwarder: Arc<Forwarder>,
    ) -> Arc<Route> {
        let mut buckets = self.buckets.write();
        let bucket = buckets.entry(hostname.to_string()).or_default();

        let route = match bucket.iter().find(|r| r.path == path) {
            Some(existing) => Arc::clone(existing),
            None => {
                let route = Arc::new(Route::new(path, opts, forwarder, false));
                bucket.push(Arc::clone(&route));
                route
            }
        };

        info!(hostname, path, upstream = %target, "Route target registered");
        route.push_target(target);
        bucket.sort_by(|a, b| b.path.len().cmp(&a.path.len()));
        route
    }

    /// Remove targets (all, or by href) from the route at `(hostname, path)`.
    /// A route emptied of targets is spliced out of its bucket.
    pub fn unregister(
        &self,
        hostname: &str,
        path: &str,
        href: Option<&str>,
    ) -> UnregisterOutcome {
        let mut buckets = self.buckets.write();
        let Some(bucket) = buckets.get_mut(hostname) else {
            return UnregisterOutcome::default();
        };
        let Some(pos) = bucket.iter().position(|r| r.path == path) else {
            return UnregisterOutcome::default();
        };

        let emptied = bucket[pos].remove_targets(href);
        let mut outcome = UnregisterOutcome::default();
        if emptied {
            bucket.remove(pos);
            outcome.route_removed = true;
            debug!(hostname, path, "Route removed");
        }
        if bucket.is_empty() {
            buckets.remove(hostname);
            outcome.host_empty = true;
        }
        outcome
    }

    /// First route whose path is `/` or a boundary-respecting prefix of
    /// `url`. Buckets are ordered most-specific-first.
    pub fn lookup(&self, hostname: &str, url: &str) -> Option<Arc<Route>> {
        let buckets = self.buckets.read();
        let bucket = buckets.get(hostname)?;
        bucket
            .iter()
            .find(|r| r.path == "/" || path_starts_with(url, &r.path))
            .cloned()
    }

    pub fn host_count(&self) -> usize {
        self.buckets.read().len()
    }

    /// Paths for a hostname in bucket order. Test and introspection helper.
    pub fn paths_for(&self, hostname: &str) -> Vec<String> {
        self.buckets
            .read()
            .get(hostname)
            .map(|b| b.iter().map(|r| r.path.clone()).collect())
            .unwrap_or_default()
    }
}
