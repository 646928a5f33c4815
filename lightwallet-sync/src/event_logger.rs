//! Structured logging of processor events

use crate::events::ProcessorEvent;
use crate::progress::ProcessorMetrics;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const DEFAULT_HISTORY: usize = 1024;

/// Logged event with its wall-clock time
#[derive(Debug, Clone)]
pub struct LoggedEvent {
    /// RFC 3339 timestamp
    pub timestamp: String,
    /// The event
    pub event: ProcessorEvent,
}

/// Writes every processor event as a tracing record and keeps a bounded
/// history plus batch metrics.
#[derive(Debug)]
pub struct EventLogger {
    history: Vec<LoggedEvent>,
    max_history: usize,
    metrics: ProcessorMetrics,
}

impl EventLogger {
    /// Logger keeping the default history length
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    /// Logger keeping at most `max_history` events
    pub fn with_history(max_history: usize) -> Self {
        Self {
            history: Vec::new(),
            max_history: max_history.max(1),
            metrics: ProcessorMetrics::new(),
        }
    }

    /// Log one event
    pub fn log(&mut self, event: &ProcessorEvent) {
        let name = event.name();
        match event {
            ProcessorEvent::StateChanged { from, to } => {
                debug!(event = name, from = %from, to = %to, "State changed");
            }
            ProcessorEvent::Progress(report) => {
                self.metrics.record(report);
                info!(
                    event = name,
                    start_height = report.start_height,
                    end_height = report.end_height,
                    duration_ms = report.duration.as_millis() as u64,
                    "Scanned blocks {}..={}",
                    report.start_height,
                    report.end_height
                );
            }
            ProcessorEvent::ReorgDetected {
                invalid_height,
                rewind_height,
                consecutive_reorgs,
            } => {
                warn!(
                    event = name,
                    invalid_height = *invalid_height,
                    rewind_height = *rewind_height,
                    consecutive_reorgs = *consecutive_reorgs,
                    "Chain reorg detected"
                );
            }
            ProcessorEvent::Retrying {
                state,
                attempt,
                max_attempts,
                delay,
                error,
            } => {
                warn!(
                    event = name,
                    state = %state,
                    attempt = *attempt,
                    max_attempts = *max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying failed action"
                );
            }
            ProcessorEvent::Failed {
                state,
                attempts,
                error,
            } => {
                error!(
                    event = name,
                    state = %state,
                    attempts = *attempts,
                    error = %error,
                    "Sync failed"
                );
            }
            ProcessorEvent::TransactionsEnhanced { count } => {
                info!(event = name, count = *count, "Transactions enhanced");
            }
            ProcessorEvent::UtxosFetched { addresses, count } => {
                info!(
                    event = name,
                    addresses = *addresses,
                    count = *count,
                    "UTXOs fetched"
                );
            }
            ProcessorEvent::Finished { scanned_height } => {
                info!(
                    event = name,
                    scanned_height = ?scanned_height,
                    batches = self.metrics.batches(),
                    "Sync finished"
                );
            }
            ProcessorEvent::Stopped => {
                info!(event = name, "Sync stopped");
            }
        }

        if self.history.len() == self.max_history {
            self.history.remove(0);
        }
        self.history.push(LoggedEvent {
            timestamp: chrono::Utc::now().to_rfc3339(),
            event: event.clone(),
        });
    }

    /// Consume `events` on a background task until the run ends or the
    /// sender is dropped. The task returns the logger.
    pub fn spawn(mut self, mut events: broadcast::Receiver<ProcessorEvent>) -> JoinHandle<Self> {
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        self.log(&event);
                        if event.is_terminal() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(event = "events_lagged", skipped, "Event logger fell behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            self
        })
    }

    /// Events logged so far, oldest first
    pub fn history(&self) -> &[LoggedEvent] {
        &self.history
    }

    /// Batch metrics gathered from progress events
    pub fn metrics(&self) -> &ProcessorMetrics {
        &self.metrics
    }
}

impl Default for EventLogger {
    fn default() -> Self {
        Self::new()
    }
}
