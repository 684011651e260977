//! Structured log sink for generation events.
//!
//! [`EventLogger`] subscribes to the [`EventBus`](crate::bus::EventBus) and
//! writes one `tracing` record per event. It stops when the bus is dropped
//! or the cancellation token fires.

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::bus::GenerationEvent;

pub struct EventLogger;

impl EventLogger {
    pub async fn run(
        mut receiver: broadcast::Receiver<GenerationEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("Event logger shutting down");
                    break;
                }
                received = receiver.recv() => match received {
                    Ok(event) => Self::log(&event),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(
                            skipped = n,
                            "Event logger lagged, some events were not logged"
                        );
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Event bus closed, event logger shutting down");
                        break;
                    }
                },
            }
        }
    }

    fn log(event: &GenerationEvent) {
        tracing::info!(
            event_type = event.event_type,
            session_id = %event.session_id,
            project_id = event.project_id,
            account_id = ?event.account_id,
            status = ?event.status,
            pass = ?event.pass,
            error_code = ?event.error_code,
            "Generation event"
        );
    }
}
