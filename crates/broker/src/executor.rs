//! Producer-side façade: turns a batch submission into queue traffic and
//! reconciles what comes back under a wait policy.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use optforge_core::{Evaluate, ExecutorConfig, ItemId, ItemStatus, WaitPolicyKind, WorkItem};

use crate::broker::{Broker, BrokerError, PortToken, RunState};
use crate::pool::ThreadPool;
use crate::port::BufferPort;

/// Far-future stand-in for "no deadline"; every blocking wait still has a
/// bound.
const WAIT_COMPLETE_SENTINEL: Duration = Duration::from_secs(365 * 24 * 3600);

/// Upper bound on a single processed-queue wait so cancellation and broker
/// state are observed promptly.
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Cooperative cancellation for an in-flight submission.
#[derive(Clone, Default)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Re-arm after a cancelled submission so the next one runs normally.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// What one submission did, for iteration-level accounting. Statuses and
/// results live on the items themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubmitReport {
    pub submitted: usize,
    pub processed: usize,
    pub error_flagged: usize,
    pub except_flagged: usize,
    pub timed_out: usize,
    pub resubmit_rounds: u32,
    pub elapsed_ms: u64,
}

enum Backend<E: Evaluate> {
    Serial,
    Threaded {
        pool: ThreadPool,
    },
    Brokered {
        broker: Broker<E>,
        port: Arc<BufferPort<E>>,
        // Held for its Drop: deregisters the port when the executor goes.
        _token: PortToken<E>,
    },
}

/// One executor per optimization instance. The parallelism model is fixed
/// at construction; the wait policy can be reconfigured between
/// submissions.
pub struct Executor<E: Evaluate> {
    cfg: ExecutorConfig,
    backend: Backend<E>,
    cancel: CancelHandle,
}

impl<E: Evaluate> Executor<E> {
    /// Evaluate inline on the calling thread, in submission order.
    pub fn serial(cfg: ExecutorConfig) -> Self {
        Self {
            cfg,
            backend: Backend::Serial,
            cancel: CancelHandle::new(),
        }
    }

    /// Evaluate on an owned fixed-size thread pool.
    pub fn threaded(cfg: ExecutorConfig) -> Result<Self, BrokerError> {
        let pool = ThreadPool::new(cfg.effective_threads(), "executor")?;
        Ok(Self {
            cfg,
            backend: Backend::Threaded { pool },
            cancel: CancelHandle::new(),
        })
    }

    /// Evaluate through the broker: allocates a buffer port sized by the
    /// broker's configuration and enrolls it for the executor's lifetime.
    pub fn brokered(cfg: ExecutorConfig, broker: &Broker<E>) -> Result<Self, BrokerError> {
        let port = BufferPort::new(broker.port_capacity());
        let token = broker.enroll_buffer_port(&port)?;
        Ok(Self {
            cfg,
            backend: Backend::Brokered {
                broker: broker.clone(),
                port,
                _token: token,
            },
            cancel: CancelHandle::new(),
        })
    }

    pub fn configure(&mut self, cfg: ExecutorConfig) {
        self.cfg = cfg;
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Submit a batch and block until the wait policy is satisfied.
    ///
    /// Eligible items are the ones in `DoProcess`. Statuses and results are
    /// written in place; the slot an item was submitted in is the slot its
    /// outcome lands in.
    pub fn submit(&mut self, batch: &mut [WorkItem<E>]) -> SubmitReport {
        let started = Instant::now();
        let eligible: Vec<usize> = batch
            .iter()
            .enumerate()
            .filter(|(_, item)| item.status() == ItemStatus::DoProcess)
            .map(|(idx, _)| idx)
            .collect();
        if eligible.is_empty() {
            return SubmitReport::default();
        }

        let rounds = match &mut self.backend {
            Backend::Serial => {
                run_serial(batch, &eligible, &self.cancel);
                0
            }
            Backend::Threaded { pool } => {
                run_threaded(pool, batch, &eligible);
                0
            }
            Backend::Brokered { broker, port, .. } => {
                run_brokered(&self.cfg, broker, port, batch, &eligible, &self.cancel)
            }
        };

        tally(batch, &eligible, rounds, started.elapsed())
    }
}

fn run_serial<E: Evaluate>(batch: &mut [WorkItem<E>], eligible: &[usize], cancel: &CancelHandle) {
    for &idx in eligible {
        if cancel.is_cancelled() {
            batch[idx].flag_error("cancelled");
            continue;
        }
        batch[idx].process();
    }
}

fn run_threaded<E: Evaluate>(pool: &ThreadPool, batch: &mut [WorkItem<E>], eligible: &[usize]) {
    let (tx, rx) = mpsc::channel::<(usize, WorkItem<E>)>();
    for &idx in eligible {
        let tx = tx.clone();
        let mut item = batch[idx].clone();
        let accepted = pool.execute(move || {
            item.process();
            let _ = tx.send((idx, item));
        });
        if !accepted {
            batch[idx].flag_fault("evaluation pool unavailable");
        }
    }
    drop(tx);
    while let Ok((idx, item)) = rx.recv() {
        batch[idx] = item;
    }
}

fn run_brokered<E: Evaluate>(
    cfg: &ExecutorConfig,
    broker: &Broker<E>,
    port: &Arc<BufferPort<E>>,
    batch: &mut [WorkItem<E>],
    eligible: &[usize],
    cancel: &CancelHandle,
) -> u32 {
    let started = Instant::now();
    let submission = broker.open_submission(port);

    // Stamp and push. Items the raw queue will not take within the push
    // timeout are flagged with backpressure and reconciled from their
    // original slot.
    let mut expected: BTreeSet<usize> = BTreeSet::new();
    for &idx in eligible {
        batch[idx].set_id(ItemId {
            submission,
            slot: idx as u32,
        });
        let clone = batch[idx].clone();
        match port.push_raw(clone, cfg.push_timeout()) {
            Ok(()) => {
                expected.insert(idx);
            }
            Err(_rejected) => {
                warn!(slot = idx, "raw queue full; flagging backpressure");
                batch[idx].flag_error("backpressure");
            }
        }
    }

    let first_k = if cfg.first_k > 0 {
        cfg.first_k
    } else {
        (eligible.len() / 10).max(1)
    }
    .min(expected.len().max(1));

    // Factor-style deadlines are derived from the k-th return; until that
    // sample exists the fixed wait acts as the base deadline, so a
    // submission where nothing comes back still terminates (and, under
    // resubmission, retries).
    let mut deadline = match cfg.wait_policy {
        WaitPolicyKind::Complete => Some(started + WAIT_COMPLETE_SENTINEL),
        WaitPolicyKind::Fixed => Some(started + cfg.wait_fixed()),
        WaitPolicyKind::Factor | WaitPolicyKind::ResubmitIncomplete => None,
    };

    let mut returned = 0usize;
    let mut rounds = 0u32;

    while !expected.is_empty() {
        if cancel.is_cancelled() {
            flag_remaining(batch, &expected, "cancelled");
            break;
        }
        if broker.run_state() == RunState::Stopped {
            // The broker's drain has already handed back whatever was
            // still queued (flagged as drained); collect that before
            // writing off the rest, which nothing can return any more.
            while let Some(item) = port.pop_processed(Duration::ZERO) {
                reconcile_one(item, submission, batch, &mut expected);
            }
            flag_remaining(batch, &expected, "drained");
            break;
        }

        let now = Instant::now();
        let effective_deadline = deadline.unwrap_or(started + cfg.wait_fixed());
        if now >= effective_deadline {
            if cfg.wait_policy == WaitPolicyKind::ResubmitIncomplete && rounds < cfg.resubmit_cap {
                rounds += 1;
                resubmit(port, batch, &mut expected, cfg.push_timeout());
                deadline = Some(now + cfg.resubmit_extend());
                continue;
            }
            flag_remaining(batch, &expected, "timeout");
            break;
        }

        let wait = effective_deadline.duration_since(now).min(POLL_SLICE);
        let Some(item) = port.pop_processed(wait) else {
            continue;
        };
        if !reconcile_one(item, submission, batch, &mut expected) {
            continue;
        }
        returned += 1;

        if deadline.is_none() && returned >= first_k {
            let tau = started.elapsed();
            let scaled = tau.mul_f64(cfg.wait_factor);
            let mut bounded = scaled.max(cfg.wait_min());
            if let Some(max) = cfg.wait_max() {
                bounded = bounded.min(max);
            }
            deadline = Some(started + bounded);
            debug!(
                tau_ms = tau.as_millis() as u64,
                deadline_ms = bounded.as_millis() as u64,
                "factor deadline set"
            );
        }
    }

    rounds
}

/// Move one returned item into its original slot. Returns false for items
/// that belong to another submission, carry no identity, or duplicate a
/// slot that was already reconciled (e.g. an original surfacing after its
/// resubmitted clone).
fn reconcile_one<E: Evaluate>(
    item: WorkItem<E>,
    submission: u64,
    batch: &mut [WorkItem<E>],
    expected: &mut BTreeSet<usize>,
) -> bool {
    let Some(id) = item.id() else {
        warn!("discarding returned item without identity");
        return false;
    };
    if id.submission != submission {
        debug!(item = %id, "discarding return from a previous submission");
        return false;
    }
    let slot = id.slot as usize;
    if slot >= batch.len() || !expected.remove(&slot) {
        debug!(item = %id, "discarding duplicate return");
        return false;
    }
    batch[slot] = item;
    true
}

fn resubmit<E: Evaluate>(
    port: &Arc<BufferPort<E>>,
    batch: &mut [WorkItem<E>],
    expected: &mut BTreeSet<usize>,
    push_timeout: Duration,
) {
    let stragglers: Vec<usize> = expected.iter().copied().collect();
    debug!(count = stragglers.len(), "resubmitting unreturned items");
    for idx in stragglers {
        let mut clone = batch[idx].clone();
        clone.bump_attempts();
        if port.push_raw(clone, push_timeout).is_err() {
            warn!(slot = idx, "raw queue full during resubmission");
            batch[idx].flag_error("backpressure");
            expected.remove(&idx);
        }
    }
}

fn flag_remaining<E: Evaluate>(
    batch: &mut [WorkItem<E>],
    remaining: &BTreeSet<usize>,
    reason: &str,
) {
    for &idx in remaining {
        batch[idx].flag_error(reason);
    }
}

fn tally<E: Evaluate>(
    batch: &[WorkItem<E>],
    eligible: &[usize],
    resubmit_rounds: u32,
    elapsed: Duration,
) -> SubmitReport {
    let mut report = SubmitReport {
        submitted: eligible.len(),
        resubmit_rounds,
        elapsed_ms: elapsed.as_millis() as u64,
        ..SubmitReport::default()
    };
    for &idx in eligible {
        match batch[idx].status() {
            ItemStatus::Processed => report.processed += 1,
            ItemStatus::ErrorFlagged => {
                report.error_flagged += 1;
                if batch[idx].last_error() == Some("timeout") {
                    report.timed_out += 1;
                }
            }
            ItemStatus::ExceptFlagged => report.except_flagged += 1,
            ItemStatus::Ignore | ItemStatus::DoProcess => {}
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use optforge_core::{EvalError, ResultPair};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct SleepyDouble {
        position: usize,
        sleep_ms: u64,
        explode: bool,
    }

    impl Evaluate for SleepyDouble {
        fn evaluate(&mut self) -> Result<Vec<ResultPair>, EvalError> {
            if self.explode {
                return Err(EvalError::Failed("synthetic failure".to_string()));
            }
            if self.sleep_ms > 0 {
                std::thread::sleep(Duration::from_millis(self.sleep_ms));
            }
            let raw = self.position as f64;
            Ok(vec![ResultPair::new(raw, raw * 2.0)])
        }
    }

    fn item(position: usize, sleep_ms: u64) -> WorkItem<SleepyDouble> {
        WorkItem::new(SleepyDouble {
            position,
            sleep_ms,
            explode: false,
        })
    }

    #[test]
    fn serial_processes_in_order_and_records_failures() {
        let mut exec = Executor::serial(ExecutorConfig::default());
        let mut batch = vec![
            item(1, 0),
            item(2, 0),
            WorkItem::new(SleepyDouble {
                position: 3,
                sleep_ms: 0,
                explode: true,
            }),
        ];
        let report = exec.submit(&mut batch);

        assert_eq!(batch[0].status(), ItemStatus::Processed);
        assert_eq!(batch[0].results()[0].raw, 1.0);
        assert_eq!(batch[1].status(), ItemStatus::Processed);
        assert_eq!(batch[1].results()[0].raw, 2.0);
        assert_eq!(batch[2].status(), ItemStatus::ExceptFlagged);
        assert!(batch[2].last_error().is_some());

        assert_eq!(report.submitted, 3);
        assert_eq!(report.processed, 2);
        assert_eq!(report.except_flagged, 1);
    }

    #[test]
    fn serial_skips_ignored_items() {
        let mut exec = Executor::serial(ExecutorConfig::default());
        let mut batch = vec![
            WorkItem::ignored(SleepyDouble {
                position: 0,
                sleep_ms: 0,
                explode: false,
            }),
            item(1, 0),
        ];
        let report = exec.submit(&mut batch);
        assert_eq!(batch[0].status(), ItemStatus::Ignore);
        assert_eq!(report.submitted, 1);
        assert_eq!(report.processed, 1);
    }

    #[test]
    fn threaded_completes_every_item_with_bounded_wall_clock() {
        let cfg = ExecutorConfig {
            threads: 4,
            ..ExecutorConfig::default()
        };
        let mut exec = Executor::threaded(cfg).unwrap();
        let mut batch: Vec<_> = (0..100).map(|pos| item(pos, 10)).collect();

        let started = Instant::now();
        let report = exec.submit(&mut batch);
        let elapsed = started.elapsed();

        // 100 items x 10 ms over 4 workers is at least 250 ms of work.
        assert!(elapsed >= Duration::from_millis(250), "too fast: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(5), "too slow: {elapsed:?}");
        assert_eq!(report.processed, 100);
        for (pos, item) in batch.iter().enumerate() {
            assert_eq!(item.status(), ItemStatus::Processed);
            assert_eq!(item.results()[0].raw, pos as f64);
        }
    }

    #[test]
    fn empty_batch_returns_immediately() {
        let mut exec = Executor::serial(ExecutorConfig::default());
        let mut batch: Vec<WorkItem<SleepyDouble>> = Vec::new();
        assert_eq!(exec.submit(&mut batch), SubmitReport::default());
    }
}
