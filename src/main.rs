use routegate::cluster;
use routegate::config::FileConfig;
use routegate::server::Proxy;
use std::path::PathBuf;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("routegate.toml"));

    let config = FileConfig::load(&config_path)?;

    if config.log.enabled {
        let filter = tracing_subscriber::EnvFilter::try_new(&config.log.level)
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    info!(path = %config_path.display(), "Configuration loaded");

    // The supervisor owns no proxy state; registrations only happen in
    // workers.
    if config.server.cluster > 1 && !cluster::is_worker() {
        return cluster::supervise(config.server.cluster, &config_path).await;
    }

    let proxy = Proxy::new(config.proxy_options());
    for (src, target, opts) in config.route_registrations() {
        proxy
            .register(&src, &target, opts)
            .map_err(|e| anyhow::anyhow!("route {}: {}", src, e))?;
    }

    proxy.listen().await?;
    if let Some(addr) = proxy.http_addr() {
        info!(%addr, "Proxying HTTP");
    }
    for addr in proxy.https_addrs() {
        info!(%addr, "Proxying HTTPS");
    }

    shutdown_signal().await;
    info!("Shutdown signal received; draining connections");
    proxy.close(true).await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
