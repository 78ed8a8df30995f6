//! Single-flight admission with a bounded overflow queue.
//!
//! Every incoming request bumps an atomic `in_flight` counter. Requests that
//! keep it within `max_concurrency + overflow_slots` are admitted, the rest
//! are dropped on the spot. Admitted requests then wait for one of
//! `max_concurrency` execution slots, in arrival order.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use importer_shared::RunRequest;

/// Runs allowed to execute at the same time.
pub const DEFAULT_MAX_CONCURRENCY: usize = 1;

/// Admitted runs allowed to wait while the execution slots are busy.
pub const DEFAULT_OVERFLOW_SLOTS: usize = 1;

/// Capacity limits of a [`RunAdmission`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionPolicy {
    pub max_concurrency: usize,
    pub overflow_slots: usize,
}

impl AdmissionPolicy {
    /// `max_concurrency` is clamped to at least 1.
    pub fn new(max_concurrency: usize, overflow_slots: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            overflow_slots,
        }
    }

    /// Total number of requests that may be admitted at once.
    pub fn capacity(&self) -> usize {
        self.max_concurrency.saturating_add(self.overflow_slots)
    }
}

impl Default for AdmissionPolicy {
    /// One running, one queued, the rest dropped.
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONCURRENCY, DEFAULT_OVERFLOW_SLOTS)
    }
}

// ---------------------------------------------------------------------------
// RunAdmission
// ---------------------------------------------------------------------------

/// Admit/drop decision plus the execution slots admitted runs wait for.
///
/// Cloning shares the same counter and slots.
#[derive(Debug, Clone)]
pub struct RunAdmission {
    policy: AdmissionPolicy,
    in_flight: Arc<AtomicUsize>,
    slots: Arc<Semaphore>,
}

impl RunAdmission {
    pub fn new(policy: AdmissionPolicy) -> Self {
        Self {
            policy,
            in_flight: Arc::new(AtomicUsize::new(0)),
            slots: Arc::new(Semaphore::new(policy.max_concurrency)),
        }
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    /// Admitted requests that have not reached a terminal state yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Admit a request if capacity allows.
    ///
    /// The returned permit holds the capacity until it is dropped.
    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        if now <= self.policy.capacity() {
            Some(AdmissionPermit {
                in_flight: Arc::clone(&self.in_flight),
            })
        } else {
            self.in_flight.fetch_sub(1, Ordering::AcqRel);
            None
        }
    }

    /// Feed `requests` through admission and hand every admitted one to `run`.
    ///
    /// `run` is started as soon as a request is admitted and receives a child
    /// of `cancel`; it should call [`AdmittedRun::wait_for_slot`] before doing
    /// any work. Returns once `cancel` fires or `requests` closes, after every
    /// spawned run has finished.
    pub async fn dispatch<F, Fut>(
        &self,
        mut requests: UnboundedReceiver<RunRequest>,
        cancel: CancellationToken,
        run: F,
    ) where
        F: Fn(AdmittedRun, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut runs = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                Some(joined) = runs.join_next() => log_join_failure(joined),

                next = requests.recv() => {
                    let Some(request) = next else { break };
                    let Some(permit) = self.try_admit() else {
                        debug!(
                            run_id = %request.id,
                            origin = %request.origin,
                            in_flight = self.in_flight(),
                            "admission full, run dropped"
                        );
                        continue;
                    };
                    debug!(
                        run_id = %request.id,
                        origin = %request.origin,
                        in_flight = self.in_flight(),
                        "run admitted"
                    );
                    let admitted = AdmittedRun {
                        request,
                        _permit: permit,
                        slots: Arc::clone(&self.slots),
                    };
                    runs.spawn(run(admitted, cancel.child_token()));
                }
            }
        }

        // Runs hold child tokens, so after cancellation they unwind promptly.
        while let Some(joined) = runs.join_next().await {
            log_join_failure(joined);
        }
    }
}

fn log_join_failure(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!(error = %e, "run task panicked");
        }
    }
}

// ---------------------------------------------------------------------------
// Permits
// ---------------------------------------------------------------------------

/// Capacity held by one admitted request; released on drop.
#[derive(Debug)]
pub struct AdmissionPermit {
    in_flight: Arc<AtomicUsize>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// A request that passed admission. Dropping it releases its capacity.
#[derive(Debug)]
pub struct AdmittedRun {
    pub request: RunRequest,
    _permit: AdmissionPermit,
    slots: Arc<Semaphore>,
}

impl AdmittedRun {
    /// Wait for an execution slot. Returns `None` if `cancel` fires first.
    pub async fn wait_for_slot(&self, cancel: &CancellationToken) -> Option<ExecutionSlot> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            slot = Arc::clone(&self.slots).acquire_owned() => slot.ok().map(|permit| ExecutionSlot { _permit: permit }),
        }
    }
}

/// One of the `max_concurrency` execution slots, held while a run executes.
#[derive(Debug)]
pub struct ExecutionSlot {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use importer_shared::RunId;
    use tokio::sync::mpsc;
    use tokio::time::sleep;

    use crate::testing::ConcurrencyGauge;

    #[test]
    fn one_running_one_queued_rest_dropped() {
        let admission = RunAdmission::new(AdmissionPolicy::default());

        let first = admission.try_admit().expect("runs");
        let second = admission.try_admit().expect("queued");
        assert!(admission.try_admit().is_none());
        assert!(admission.try_admit().is_none());
        assert_eq!(admission.in_flight(), 2);

        drop(first);
        assert_eq!(admission.in_flight(), 1);
        let third = admission.try_admit().expect("capacity was released");
        assert_eq!(admission.in_flight(), 2);

        drop(second);
        drop(third);
        assert_eq!(admission.in_flight(), 0);
    }

    #[test]
    fn racing_callers_never_exceed_capacity() {
        let admission = RunAdmission::new(AdmissionPolicy::new(2, 3));
        let held = Arc::new(Mutex::new(Vec::new()));
        let barrier = Arc::new(std::sync::Barrier::new(16));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let admission = admission.clone();
                let held = Arc::clone(&held);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..50 {
                        if let Some(permit) = admission.try_admit() {
                            held.lock().unwrap().push(permit);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(held.lock().unwrap().len(), 5);
        assert_eq!(admission.in_flight(), 5);
        held.lock().unwrap().clear();
        assert_eq!(admission.in_flight(), 0);
    }

    /// Dispatch `requests`, each run taking `duration`, and record what ran.
    async fn dispatch_all(
        admission: &RunAdmission,
        requests: Vec<(Duration, RunRequest)>,
        duration: Duration,
    ) -> (Vec<RunId>, ConcurrencyGauge) {
        let (tx, rx) = mpsc::unbounded_channel();
        let executed = Arc::new(Mutex::new(Vec::new()));
        let gauge = ConcurrencyGauge::new();

        let feeder = tokio::spawn(async move {
            for (delay, request) in requests {
                sleep(delay).await;
                tx.send(request).unwrap();
            }
        });

        let (log, g) = (Arc::clone(&executed), gauge.clone());
        admission
            .dispatch(rx, CancellationToken::new(), move |admitted, token| {
                let (log, g) = (Arc::clone(&log), g.clone());
                async move {
                    let Some(_slot) = admitted.wait_for_slot(&token).await else {
                        return;
                    };
                    let _guard = g.enter();
                    log.lock().unwrap().push(admitted.request.id);
                    sleep(duration).await;
                }
            })
            .await;
        feeder.await.unwrap();

        let executed = executed.lock().unwrap().clone();
        (executed, gauge)
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_during_a_run_yield_exactly_one_more() {
        let admission = RunAdmission::new(AdmissionPolicy::default());
        let mut requests = vec![(Duration::ZERO, RunRequest::startup())];
        for n in 0..5 {
            requests.push((
                Duration::from_millis(400),
                RunRequest::manual(RunId(-2 - n)),
            ));
        }

        let (executed, gauge) =
            dispatch_all(&admission, requests, Duration::from_secs(5)).await;

        assert_eq!(executed, vec![RunId(-1), RunId(-2)]);
        assert_eq!(gauge.max(), 1);
        assert_eq!(admission.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn bounds_hold_for_wider_policies() {
        let admission = RunAdmission::new(AdmissionPolicy::new(2, 3));
        let requests = (0..20)
            .map(|n| (Duration::from_millis(10), RunRequest::periodic(n)))
            .collect();

        let (executed, gauge) =
            dispatch_all(&admission, requests, Duration::from_secs(1)).await;

        // Two running plus three queued; everything after that is dropped.
        assert_eq!(
            executed,
            (0..5).map(RunId).collect::<Vec<_>>()
        );
        assert_eq!(gauge.max(), 2);
        assert_eq!(admission.in_flight(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_abandons_waiting_runs_and_releases_capacity() {
        let admission = RunAdmission::new(AdmissionPolicy::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let started = ConcurrencyGauge::new();

        tx.send(RunRequest::startup()).unwrap();
        tx.send(RunRequest::periodic(0)).unwrap();

        let dispatcher = {
            let admission = admission.clone();
            let cancel = cancel.clone();
            let started = started.clone();
            tokio::spawn(async move {
                admission
                    .dispatch(rx, cancel, move |admitted, token| {
                        let started = started.clone();
                        async move {
                            let Some(_slot) = admitted.wait_for_slot(&token).await else {
                                return;
                            };
                            let _guard = started.enter();
                            token.cancelled().await;
                        }
                    })
                    .await;
            })
        };

        sleep(Duration::from_secs(1)).await;
        assert_eq!(admission.in_flight(), 2);
        assert_eq!(started.total(), 1);

        cancel.cancel();
        dispatcher.await.unwrap();
        assert_eq!(admission.in_flight(), 0);
        assert_eq!(started.total(), 1);
        drop(tx);
    }
}
