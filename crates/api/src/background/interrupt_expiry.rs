//! Periodic expiry of interrupted generation sessions.
//!
//! An INTERRUPTED session keeps its project locked while it waits for the
//! client to reconnect. Once it has waited longer than the interrupt timeout
//! it is closed and its latest snapshot becomes the project's page. Runs on
//! a fixed interval using `tokio::time::interval`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use pagecraft_pipeline::GenerationService;
use tokio_util::sync::CancellationToken;

/// Run the expiry loop until `cancel` is triggered.
pub async fn run(
    service: Arc<GenerationService>,
    interrupt_timeout: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let timeout = match chrono::Duration::from_std(interrupt_timeout) {
        Ok(timeout) => timeout,
        Err(e) => {
            tracing::error!(error = %e, "Interrupt expiry: timeout out of range, job not started");
            return;
        }
    };

    if interval.is_zero() {
        tracing::error!("Interrupt expiry: zero sweep interval, job not started");
        return;
    }

    tracing::info!(
        timeout_secs = interrupt_timeout.as_secs(),
        interval_secs = interval.as_secs(),
        "Interrupt expiry job started"
    );

    let mut ticker = tokio::time::interval(interval);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("Interrupt expiry job stopping");
                break;
            }
            _ = ticker.tick() => {
                let cutoff = Utc::now() - timeout;
                match service.expire_stale(cutoff).await {
                    Ok(0) => tracing::debug!("Interrupt expiry: nothing to expire"),
                    Ok(expired) => {
                        tracing::info!(
                            expired,
                            "Interrupt expiry: closed stale sessions"
                        );
                    }
                    Err(e) => tracing::error!(error = %e, "Interrupt expiry: sweep failed"),
                }
            }
        }
    }
}
