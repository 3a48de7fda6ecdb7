//! Resolver pipeline
//!
//! A resolver maps `(host, url, request-info)` to a route, a bare target
//! string, or a route descriptor. Resolvers carry an integer priority; the
//! built-in table resolver sits at priority 0 and the ACME challenge
//! resolver at 9999. All resolvers run concurrently per request; results are
//! scanned in pipeline order and the first coercible one wins.

use crate::forwarder::ForwarderCache;
use crate::routes::{Route, RouteOptions, RoutingTable};
use crate::urls::{build_target, path_starts_with, TargetFlags};
use futures::future::join_all;
use hyper::header::HeaderMap;
use hyper::Method;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Priority of the built-in table resolver.
pub const TABLE_PRIORITY: i32 = 0;
/// Priority of the ACME challenge resolver.
pub const CHALLENGE_PRIORITY: i32 = 9999;

/// Read-only request view handed to resolvers.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub headers: HeaderMap,
}

/// What a resolver may produce.
pub enum Resolution {
    /// A ready route, used as-is.
    Route(Arc<Route>),
    /// A bare target URL; becomes a single-target route at path `/`.
    Target(String),
    /// Targets plus an optional path and options.
    Descriptor(RouteDescriptor),
}

#[derive(Clone, Default)]
pub struct RouteDescriptor {
    pub urls: Vec<String>,
    pub path: Option<String>,
    pub opts: RouteOptions,
}

pub type ResolverFuture =
    Pin<Box<dyn Future<Output = anyhow::Result<Option<Resolution>>> + Send>>;

/// Boxed resolver callable, for passing resolvers in construction options.
pub type BoxedResolver = Box<dyn Fn(&str, &str, &RequestInfo) -> ResolverFuture + Send + Sync>;

type ResolverFn = Arc<dyn Fn(&str, &str, &RequestInfo) -> ResolverFuture + Send + Sync>;

/// Handle for removing a resolver. Removal is by registration identity, not
/// structural equality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResolverId(u64);

struct ResolverEntry {
    id: ResolverId,
    priority: i32,
    func: ResolverFn,
}

/// Ordered resolver registry. Entries are kept sorted by descending
/// priority; the sort is stable, so equal priorities preserve registration
/// order.
pub struct ResolverSet {
    entries: RwLock<Vec<ResolverEntry>>,
    next_id: AtomicU64,
    /// Coerced-route cache keyed by the resolver output, so repeated answers
    /// reuse one route (and its round-robin cursor and forwarder handle).
    cache: Mutex<HashMap<String, Arc<Route>>>,
}

impl ResolverSet {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn add<F>(&self, priority: i32, func: F) -> ResolverId
    where
        F: Fn(&str, &str, &RequestInfo) -> ResolverFuture + Send + Sync + 'static,
    {
        let id = ResolverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut entries = self.entries.write();
        entries.push(ResolverEntry {
            id,
            priority,
            func: Arc::new(func),
        });
        entries.sort_by(|a, b| b.priority.cmp(&a.priority));
        id
    }

    pub fn remove(&self, id: ResolverId) {
        self.entries.write().retain(|e| e.id != id);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    #[cfg(test)]
    pub(crate) fn priorities(&self) -> Vec<i32> {
        self.entries.read().iter().map(|e| e.priority).collect()
    }

    /// Run the pipeline for one request. All resolvers (custom plus the
    /// built-in table resolver) are invoked concurrently; results are
    /// scanned in priority order for the first one that coerces to a route
    /// and passes the prefix guard.
    pub async fn resolve(
        &self,
        table: &RoutingTable,
        forwarders: &ForwarderCache,
        host: &str,
        url: &str,
        info: &RequestInfo,
    ) -> Option<Arc<Route>> {
        let host = host.to_lowercase();

        // Snapshot the pipeline so resolver bodies never run under the
        // registry lock.
        let (before, after): (Vec<ResolverFn>, Vec<ResolverFn>) = {
            let entries = self.entries.read();
            let split = entries
                .iter()
                .position(|e| e.priority <= TABLE_PRIORITY)
                .unwrap_or(entries.len());
            (
                entries[..split].iter().map(|e| Arc::clone(&e.func)).collect(),
                entries[split..].iter().map(|e| Arc::clone(&e.func)).collect(),
            )
        };

        let mut futures: Vec<ResolverFuture> = Vec::new();
        for func in &before {
            futures.push(func(&host, url, info));
        }
        let table_result = table.lookup(&host, url).map(Resolution::Route);
        futures.push(Box::pin(std::future::ready(Ok(table_result))));
        for func in &after {
            futures.push(func(&host, url, info));
        }

        let results = join_all(futures).await;
        if results.iter().any(|r| r.is_err()) {
            for err in results.into_iter().filter_map(|r| r.err()) {
                warn!(host = %host, url, error = %err, "Resolver failed; treating batch as a miss");
            }
            return None;
        }

        for resolution in results.into_iter().flat_map(|r| r.ok()).flatten() {
            let Some(route) = self.coerce(resolution, forwarders) else {
                continue;
            };
            // A resolver-built route must not usurp unrelated URLs.
            if route.resolved && route.path != "/" && !path_starts_with(url, &route.path) {
                debug!(host = %host, url, path = %route.path, "Resolved route rejected by prefix guard");
                continue;
            }
            return Some(route);
        }
        None
    }

    fn coerce(&self, resolution: Resolution, forwarders: &ForwarderCache) -> Option<Arc<Route>> {
        match resolution {
            Resolution::Route(route) => Some(route),
            Resolution::Target(url) => {
                let key = format!("t:{}", url);
                self.cached_route(&key, || {
                    let target = build_target(&url, TargetFlags::default()).ok()?;
                    let forwarder = forwarders.handle_for(&target, false);
                    let route = Route::new("/", RouteOptions::default(), forwarder, true);
                    route.push_target(target);
                    Some(Arc::new(route))
                })
            }
            Resolution::Descriptor(desc) => {
                if desc.urls.is_empty() {
                    return None;
                }
                let path = desc.path.clone().unwrap_or_else(|| "/".to_string());
                let key = format!("d:{}:{}", path, desc.urls.join(","));
                self.cached_route(&key, || {
                    let flags = TargetFlags {
                        ssl_redirect: desc
                            .opts
                            .ssl
                            .as_ref()
                            .map(|s| s.redirect_enabled())
                            .unwrap_or(false),
                        use_target_host_header: desc.opts.use_target_host_header,
                    };
                    let mut targets = Vec::new();
                    for url in &desc.urls {
                        targets.push(build_target(url, flags).ok()?);
                    }
                    let forwarder = forwarders
                        .handle_for(&targets[0], desc.opts.http_proxy.change_origin == Some(true));
                    let route = Route::new(path.clone(), desc.opts.clone(), forwarder, true);
                    for target in targets {
                        route.push_target(target);
                    }
                    Some(Arc::new(route))
                })
            }
        }
    }

    fn cached_route(
        &self,
        key: &str,
        build: impl FnOnce() -> Option<Arc<Route>>,
    ) -> Option<Arc<Route>> {
        let mut cache = self.cache.lock();
        if let Some(route) = cache.get(key) {
            return Some(Arc::clone(route));
        }
        let route = build()?;
        cache.insert(key.to_string(), Arc::clone(&route));
        Some(route)
    }
}

impl Default for ResolverSet {
    fn default() -> Self {
        Self::new()
    }
}
