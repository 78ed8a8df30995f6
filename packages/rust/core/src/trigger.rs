//! Trigger source: merges startup, periodic and on-demand run requests.
//!
//! Each subscription yields one startup request right away, a periodic
//! request every `interval`, and the manual requests produced by
//! [`ManualTrigger::enqueue`], debounced over [`DEBOUNCE_WINDOW`].

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use importer_shared::{RunId, RunRequest};

/// Quiet period that must follow a manual request before it is forwarded.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);

/// Buffered manual requests per subscriber. Only the newest one of a burst
/// matters, so lagging behind is harmless.
const MANUAL_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// ManualTrigger
// ---------------------------------------------------------------------------

/// Thread-safe entry point for on-demand runs.
#[derive(Debug)]
pub struct ManualTrigger {
    next_id: AtomicI64,
    sender: broadcast::Sender<RunRequest>,
}

impl ManualTrigger {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(MANUAL_CHANNEL_CAPACITY);
        Self {
            next_id: AtomicI64::new(RunId::FIRST_MANUAL.0),
            sender,
        }
    }

    /// Request a run as soon as possible and return the id it was given.
    ///
    /// Never blocks. Requests made while no subscription is active are
    /// discarded, but still consume an id.
    pub fn enqueue(&self) -> RunId {
        let id = RunId(self.next_id.fetch_sub(1, Ordering::Relaxed));
        if self.sender.send(RunRequest::manual(id)).is_err() {
            debug!(run_id = %id, "no active subscription, manual trigger discarded");
        }
        id
    }
}

// ---------------------------------------------------------------------------
// TriggerSource
// ---------------------------------------------------------------------------

/// Produces the merged stream of run requests.
#[derive(Debug, Clone)]
pub struct TriggerSource {
    interval: Duration,
    manual: Arc<ManualTrigger>,
}

impl TriggerSource {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            manual: Arc::new(ManualTrigger::new()),
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Shareable handle for issuing manual requests from any thread.
    pub fn manual(&self) -> Arc<ManualTrigger> {
        Arc::clone(&self.manual)
    }

    pub fn enqueue(&self) -> RunId {
        self.manual.enqueue()
    }

    /// Start a new subscription.
    ///
    /// The returned stream never ends on its own; it closes once `cancel`
    /// fires. Periodic ids restart from 0 for every subscription, manual ids
    /// keep counting down across subscriptions.
    pub fn subscribe(&self, cancel: CancellationToken) -> UnboundedReceiver<RunRequest> {
        let (tx, rx) = mpsc::unbounded_channel();

        // Subscribe to manual requests before returning so none slip through.
        let manual_rx = self.manual.sender.subscribe();
        // The receiver is alive, so the startup request is always delivered first.
        let _ = tx.send(RunRequest::startup());

        tokio::spawn(emit_periodic(self.interval, tx.clone(), cancel.clone()));
        tokio::spawn(debounce_manual(manual_rx, tx, cancel));
        rx
    }
}

async fn emit_periodic(
    interval: Duration,
    tx: UnboundedSender<RunRequest>,
    cancel: CancellationToken,
) {
    let Some(start) = first_tick(Instant::now(), interval) else {
        warn!(?interval, "interval out of range, periodic triggers disabled");
        cancel.cancelled().await;
        return;
    };
    let mut ticker = tokio::time::interval_at(start, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tick: i64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                trace!(tick, "periodic trigger");
                if tx.send(RunRequest::periodic(tick)).is_err() {
                    break;
                }
                tick += 1;
            }
        }
    }
}

/// Deadline of the first periodic tick, or `None` if it is not representable.
fn first_tick(now: Instant, interval: Duration) -> Option<Instant> {
    now.checked_add(interval)
}

async fn debounce_manual(
    mut manual: broadcast::Receiver<RunRequest>,
    tx: UnboundedSender<RunRequest>,
    cancel: CancellationToken,
) {
    loop {
        // First request of a burst.
        let mut pending = tokio::select! {
            _ = cancel.cancelled() => return,
            next = recv_manual(&mut manual) => match next {
                Some(request) => request,
                None => return,
            },
        };

        // Keep replacing it until the window passes without a newer one.
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                next = recv_manual(&mut manual) => match next {
                    Some(request) => {
                        trace!(superseded = %pending.id, run_id = %request.id, "manual trigger debounced");
                        pending = request;
                    }
                    None => {
                        let _ = tx.send(pending);
                        return;
                    }
                },
                _ = tokio::time::sleep(DEBOUNCE_WINDOW) => {
                    if tx.send(pending).is_err() {
                        return;
                    }
                    break;
                }
            }
        }
    }
}

async fn recv_manual(rx: &mut broadcast::Receiver<RunRequest>) -> Option<RunRequest> {
    loop {
        match rx.recv().await {
            Ok(request) => return Some(request),
            Err(RecvError::Lagged(skipped)) => {
                trace!(skipped, "manual trigger burst overflowed, keeping newest");
            }
            Err(RecvError::Closed) => return None,
        }
    }
}
