//! In-process usage channel: fire-and-forget producers, a pool of
//! independent consumers.
//!
//! Two bounded lanes keep attributed traffic (events carrying an identity
//! reference) ahead of anonymous traffic. Submission uses `try_send` so the
//! request path never blocks on telemetry; a full lane is reported as a
//! submission failure and the caller decides what to drop.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::Mutex;

use crate::models::usage::{Priority, UsageEvent};

/// Producer half. Cheap to clone; dropping every clone closes both lanes
/// and lets consumers drain what remains.
#[derive(Clone)]
pub struct UsageQueue {
    high_tx: mpsc::Sender<UsageEvent>,
    low_tx: mpsc::Sender<UsageEvent>,
}

/// Consumer half, shared by the worker pool. Each message is delivered to
/// exactly one consumer.
pub struct UsageReceiver {
    high: Mutex<mpsc::Receiver<UsageEvent>>,
    low: Mutex<mpsc::Receiver<UsageEvent>>,
}

/// Create a usage channel with the given per-lane capacity.
pub fn usage_channel(capacity: usize) -> (UsageQueue, Arc<UsageReceiver>) {
    let (high_tx, high_rx) = mpsc::channel(capacity);
    let (low_tx, low_rx) = mpsc::channel(capacity);
    (
        UsageQueue { high_tx, low_tx },
        Arc::new(UsageReceiver {
            high: Mutex::new(high_rx),
            low: Mutex::new(low_rx),
        }),
    )
}

impl UsageQueue {
    /// Submit an event on the lane matching its priority. Returns whether
    /// submission succeeded; persistence is decoupled and reported elsewhere.
    pub fn submit(&self, event: UsageEvent) -> bool {
        let tx = match event.priority() {
            Priority::High => &self.high_tx,
            Priority::Low => &self.low_tx,
        };
        match tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(event)) => {
                tracing::warn!(
                    event_id = %event.event_id(),
                    "usage lane full, dropping event"
                );
                false
            }
            Err(TrySendError::Closed(event)) => {
                tracing::error!(
                    event_id = %event.event_id(),
                    "usage channel closed, dropping event"
                );
                false
            }
        }
    }
}

impl UsageReceiver {
    /// Receive the next event, draining the attributed lane first.
    /// Returns `None` once both lanes are closed and empty.
    pub async fn recv(&self) -> Option<UsageEvent> {
        // Attributed traffic jumps the line whenever any is buffered.
        match self.high.lock().await.try_recv() {
            Ok(event) => return Some(event),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {}
        }
        tokio::select! {
            biased;
            Some(event) = async { self.high.lock().await.recv().await } => Some(event),
            Some(event) = async { self.low.lock().await.recv().await } => Some(event),
            else => None,
        }
    }
}
