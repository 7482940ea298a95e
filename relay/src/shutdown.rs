//! Ordered teardown once the process is asked to stop.

use crate::mqtt::Publisher;
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Grace period for each teardown step.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Resolves on Ctrl-C, or on SIGTERM where the platform has it.
pub async fn signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

/// Waits up to `grace` for `task`. A handle already awaited elsewhere (for
/// instance in the main `select!`) reports finished and is not polled again.
async fn stopped(task: &mut JoinHandle<()>, grace: Duration) -> bool {
    task.is_finished() || tokio::time::timeout(grace, task).await.is_ok()
}

/// Stops the relay in dependency order:
///
/// 1. disconnect from the broker and let the MQTT task return, which closes
///    the inbound channel;
/// 2. let the bridge worker finish what is already queued;
/// 3. close the store.
///
/// A step that overruns `grace` is aborted so shutdown always completes.
pub async fn teardown(
    publisher: &dyn Publisher,
    mut mqtt_task: JoinHandle<()>,
    mut bridge_task: JoinHandle<()>,
    store: Arc<dyn Store>,
    grace: Duration,
) {
    if let Err(e) = publisher.disconnect().await {
        warn!("Could not request MQTT disconnect: {}", e);
    }
    if !stopped(&mut mqtt_task, grace).await {
        warn!("MQTT task did not stop within {:?}; aborting", grace);
        mqtt_task.abort();
    }

    if !stopped(&mut bridge_task, grace).await {
        warn!("Bridge worker did not drain within {:?}; aborting", grace);
        bridge_task.abort();
    }

    store.close().await;
    info!("Shutdown complete");
}
