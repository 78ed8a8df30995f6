//! Bounded-concurrency executor used by the download and parse stages.
//!
//! A [`WorkerPool`] pulls inputs from a channel, runs an async operation on
//! each with at most `limit` operations in flight, and emits every result as
//! soon as it completes. Completion order is arbitrary.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, trace};

use importer_shared::{ImportError, Result};

/// Runs an operation over a stream of inputs with a hard concurrency cap.
#[derive(Debug, Clone, Copy)]
pub struct WorkerPool {
    limit: usize,
}

impl WorkerPool {
    /// Create a pool allowing `limit` concurrent operations (0 is treated as 1).
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
        }
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Run `op` over every input of a finite sequence.
    pub fn spawn_iter<I, O, F, Fut>(
        &self,
        inputs: impl IntoIterator<Item = I>,
        cancel: CancellationToken,
        op: F,
    ) -> UnboundedReceiver<Result<O>>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        for input in inputs {
            // The receiver is still in scope, so this cannot fail.
            let _ = tx.send(input);
        }
        drop(tx);
        self.spawn(rx, cancel, op)
    }

    /// Run `op` over inputs as they arrive on `inputs`.
    ///
    /// The returned channel yields one result per input and closes once the
    /// input channel is closed and every operation has finished. When
    /// `cancel` fires, no further operations start, in-flight ones are
    /// aborted and the result channel closes; results already received stay
    /// valid. A failing operation never stops the others.
    pub fn spawn<I, O, F, Fut>(
        &self,
        inputs: UnboundedReceiver<I>,
        cancel: CancellationToken,
        op: F,
    ) -> UnboundedReceiver<Result<O>>
    where
        I: Send + 'static,
        O: Send + 'static,
        F: Fn(I, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        tokio::spawn(
            drive(self.limit, inputs, cancel, Arc::new(op), results_tx).in_current_span(),
        );
        results_rx
    }
}

async fn drive<I, O, F, Fut>(
    limit: usize,
    mut inputs: UnboundedReceiver<I>,
    cancel: CancellationToken,
    op: Arc<F>,
    results: UnboundedSender<Result<O>>,
) where
    I: Send + 'static,
    O: Send + 'static,
    F: Fn(I, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    let slots = Arc::new(Semaphore::new(limit));
    let mut tasks: JoinSet<Result<O>> = JoinSet::new();
    let mut inputs_open = true;

    loop {
        if !inputs_open && tasks.is_empty() {
            break;
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                trace!(in_flight = tasks.len(), "pool cancelled, aborting in-flight operations");
                tasks.abort_all();
                break;
            }

            Some(joined) = tasks.join_next() => {
                let result = joined.unwrap_or_else(|e| Err(ImportError::Worker(e.to_string())));
                if results.send(result).is_err() {
                    // Nobody is listening any more.
                    tasks.abort_all();
                    break;
                }
            }

            next = next_input(&slots, &mut inputs), if inputs_open => match next {
                Some((permit, input)) => {
                    let op = Arc::clone(&op);
                    let token = cancel.clone();
                    tasks.spawn(
                        async move {
                            let _permit = permit;
                            (*op)(input, token).await
                        }
                        .in_current_span(),
                    );
                }
                None => inputs_open = false,
            },
        }
    }
}

/// Wait for a free slot, then for the next input.
///
/// Dropping this future before it resolves releases the slot and loses no
/// input, so it is safe to race in `select!`.
async fn next_input<I>(
    slots: &Arc<Semaphore>,
    inputs: &mut UnboundedReceiver<I>,
) -> Option<(OwnedSemaphorePermit, I)> {
    let permit = Arc::clone(slots).acquire_owned().await.ok()?;
    let input = inputs.recv().await?;
    Some((permit, input))
}
