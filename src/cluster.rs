//! Worker-process supervision for cluster mode
//!
//! `cluster = N` runs N copies of the binary, each owning its own listener
//! sockets (shared via SO_REUSEPORT on the kernel side). The supervisor only
//! spawns and restarts; it holds no proxy state, so control-plane calls
//! cannot apply to it by construction. Workers exiting for any reason are
//! respawned after a short delay.

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

/// Set in worker processes; its absence marks the supervisor.
pub const WORKER_ENV: &str = "ROUTEGATE_WORKER";

const RESTART_DELAY: Duration = Duration::from_secs(1);

pub fn is_worker() -> bool {
    std::env::var_os(WORKER_ENV).is_some()
}

/// Run the supervisor until interrupted. Workers are killed on exit.
pub async fn supervise(workers: u8, config_path: &Path) -> anyhow::Result<()> {
    let exe = std::env::current_exe().context("cannot locate current executable")?;
    info!(workers, exe = %exe.display(), "Cluster supervisor starting");

    let mut tasks = Vec::new();
    for idx in 0..workers {
        tasks.push(tokio::spawn(run_worker(
            exe.clone(),
            config_path.to_path_buf(),
            idx,
        )));
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Supervisor shutting down");
    for task in tasks {
        task.abort();
    }
    Ok(())
}

async fn run_worker(exe: PathBuf, config: PathBuf, idx: u8) {
    loop {
        info!(worker = idx, "Spawning worker");
        let mut cmd = Command::new(&exe);
        cmd.arg(&config)
            .env(WORKER_ENV, idx.to_string())
            .kill_on_drop(true);

        match cmd.spawn() {
            Ok(mut child) => match child.wait().await {
                Ok(status) => {
                    warn!(worker = idx, %status, "Worker exited; restarting");
                }
                Err(e) => {
                    error!(worker = idx, error = %e, "Failed waiting on worker");
                }
            },
            Err(e) => {
                error!(worker = idx, error = %e, "Failed to spawn worker");
            }
        }
        tokio::time::sleep(RESTART_DELAY).await;
    }
}
