//! The unit of work the dispatch core transports.
//!
//! A [`WorkItem`] wraps a user payload implementing [`Evaluate`] together
//! with the bookkeeping the broker and executors need: identity, processing
//! status, attempt counter, error text and the numeric results produced by
//! evaluation. The core never looks inside the payload.

use std::panic::{AssertUnwindSafe, catch_unwind};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Identity of an in-flight item: the submission it belongs to and the slot
/// it occupies within that submission.
///
/// Stamped by the executor before the item enters a queue and immutable
/// until the item is reconciled back into its original slot. Submission
/// numbers are allocated by the broker, so the submission half alone is
/// enough to route a processed item back to its owning port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId {
    pub submission: u64,
    pub slot: u32,
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.submission, self.slot)
    }
}

/// Processing state of a [`WorkItem`].
///
/// Advances monotonically: `DoProcess` moves to exactly one of the three
/// terminal states and never leaves it until the owner calls
/// [`WorkItem::renew`] for the next iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemStatus {
    /// Skip this item; it travels with the batch but is never dispatched.
    Ignore,
    /// Queued for processing.
    DoProcess,
    /// Evaluation completed; results are valid.
    Processed,
    /// Failed with a recorded reason (user-flagged, timeout, backpressure,
    /// drained, cancelled). Results are meaningless.
    ErrorFlagged,
    /// Evaluation itself failed or panicked. Results are meaningless.
    ExceptFlagged,
}

impl ItemStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ItemStatus::Processed | ItemStatus::ErrorFlagged | ItemStatus::ExceptFlagged
        )
    }
}

/// One evaluation result: the raw fitness and its transformed counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResultPair {
    pub raw: f64,
    pub transformed: f64,
}

impl ResultPair {
    pub fn new(raw: f64, transformed: f64) -> Self {
        Self { raw, transformed }
    }
}

/// Failure modes user evaluation code can report.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    /// User code judged the candidate unusable. Maps to
    /// [`ItemStatus::ErrorFlagged`].
    #[error("{0}")]
    Flagged(String),
    /// Evaluation failed outright. Maps to [`ItemStatus::ExceptFlagged`].
    #[error("{0}")]
    Failed(String),
}

/// Contract a user payload must satisfy to travel through the dispatch
/// core. The bounds are exactly what the queues and the wire need: the
/// payload is cloned on resubmission and serialized whenever it crosses a
/// process boundary.
pub trait Evaluate: Clone + Send + Serialize + DeserializeOwned + 'static {
    /// Run the user-supplied work. Returns one or more result pairs on
    /// success. Errors and panics are caught by [`WorkItem::process`] and
    /// recorded on the item; they never propagate further.
    fn evaluate(&mut self) -> Result<Vec<ResultPair>, EvalError>;
}

/// Envelope around a user payload with the state the dispatch core tracks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem<E> {
    #[serde(default)]
    id: Option<ItemId>,
    status: ItemStatus,
    #[serde(default)]
    attempts: u32,
    #[serde(default)]
    last_error: Option<String>,
    #[serde(default)]
    results: Vec<ResultPair>,
    payload: E,
}

impl<E> WorkItem<E> {
    /// A fresh item queued for processing.
    pub fn new(payload: E) -> Self {
        Self {
            id: None,
            status: ItemStatus::DoProcess,
            attempts: 0,
            last_error: None,
            results: Vec::new(),
            payload,
        }
    }

    /// An item that travels with its batch but is never dispatched.
    pub fn ignored(payload: E) -> Self {
        Self {
            status: ItemStatus::Ignore,
            ..Self::new(payload)
        }
    }

    pub fn id(&self) -> Option<ItemId> {
        self.id
    }

    /// Stamp the item for a new submission. Resets the attempt counter to 1;
    /// resubmitted clones bump it via [`WorkItem::bump_attempts`].
    pub fn set_id(&mut self, id: ItemId) {
        self.id = Some(id);
        self.attempts = 1;
    }

    pub fn status(&self) -> ItemStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn bump_attempts(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Reason recorded by the last failure, if any.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Results of the last evaluation. Only meaningful while the status is
    /// [`ItemStatus::Processed`].
    pub fn results(&self) -> &[ResultPair] {
        &self.results
    }

    pub fn payload(&self) -> &E {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut E {
        &mut self.payload
    }

    pub fn into_payload(self) -> E {
        self.payload
    }

    /// Mark successful completion. Ignored once a terminal state has been
    /// reached; the first terminal transition wins.
    pub fn mark_processed(&mut self, results: Vec<ResultPair>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = ItemStatus::Processed;
        self.results = results;
        self.last_error = None;
    }

    /// Record a user-visible failure (`ErrorFlagged`).
    pub fn flag_error(&mut self, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = ItemStatus::ErrorFlagged;
        self.last_error = Some(reason.into());
    }

    /// Record an evaluation fault (`ExceptFlagged`).
    pub fn flag_fault(&mut self, reason: impl Into<String>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = ItemStatus::ExceptFlagged;
        self.last_error = Some(reason.into());
    }

    /// Clear terminal state for the next iteration. Identity is dropped; the
    /// next submission stamps a fresh one.
    pub fn renew(&mut self) {
        self.id = None;
        self.status = ItemStatus::DoProcess;
        self.last_error = None;
        self.results.clear();
    }
}

impl<E: Evaluate> WorkItem<E> {
    /// Run the payload's evaluation and record the outcome on the item.
    ///
    /// Items not in `DoProcess` are left untouched. Panics inside user code
    /// are caught and recorded as `ExceptFlagged`; this method never
    /// unwinds.
    pub fn process(&mut self) {
        if self.status != ItemStatus::DoProcess {
            return;
        }
        let outcome = catch_unwind(AssertUnwindSafe(|| self.payload.evaluate()));
        match outcome {
            Ok(Ok(results)) => self.mark_processed(results),
            Ok(Err(EvalError::Flagged(reason))) => self.flag_error(reason),
            Ok(Err(EvalError::Failed(reason))) => self.flag_fault(reason),
            Err(panic) => self.flag_fault(panic_text(panic.as_ref())),
        }
    }
}

fn panic_text(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic during evaluation".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Probe {
        value: f64,
        fail: bool,
        explode: bool,
    }

    impl Evaluate for Probe {
        fn evaluate(&mut self) -> Result<Vec<ResultPair>, EvalError> {
            if self.explode {
                panic!("probe exploded");
            }
            if self.fail {
                return Err(EvalError::Flagged("bad candidate".to_string()));
            }
            Ok(vec![ResultPair::new(self.value, self.value * 2.0)])
        }
    }

    fn probe(value: f64) -> WorkItem<Probe> {
        WorkItem::new(Probe {
            value,
            fail: false,
            explode: false,
        })
    }

    #[test]
    fn process_records_results() {
        let mut item = probe(3.0);
        item.process();
        assert_eq!(item.status(), ItemStatus::Processed);
        assert_eq!(item.results()[0].raw, 3.0);
        assert_eq!(item.results()[0].transformed, 6.0);
        assert!(item.last_error().is_none());
    }

    #[test]
    fn flagged_failure_is_error_terminal() {
        let mut item = WorkItem::new(Probe {
            value: 0.0,
            fail: true,
            explode: false,
        });
        item.process();
        assert_eq!(item.status(), ItemStatus::ErrorFlagged);
        assert_eq!(item.last_error(), Some("bad candidate"));
    }

    #[test]
    fn panic_is_caught_and_recorded() {
        let mut item = WorkItem::new(Probe {
            value: 0.0,
            fail: false,
            explode: true,
        });
        item.process();
        assert_eq!(item.status(), ItemStatus::ExceptFlagged);
        assert_eq!(item.last_error(), Some("probe exploded"));
    }

    #[test]
    fn ignored_items_never_process() {
        let mut item = WorkItem::ignored(Probe {
            value: 1.0,
            fail: false,
            explode: false,
        });
        item.process();
        assert_eq!(item.status(), ItemStatus::Ignore);
        assert!(item.results().is_empty());
    }

    #[test]
    fn terminal_states_do_not_downgrade() {
        let mut item = probe(1.0);
        item.process();
        assert_eq!(item.status(), ItemStatus::Processed);
        item.flag_error("late timeout");
        assert_eq!(item.status(), ItemStatus::Processed);
        assert!(item.last_error().is_none());
    }

    #[test]
    fn stamp_resets_attempts_and_clone_preserves_id() {
        let mut item = probe(1.0);
        item.set_id(ItemId {
            submission: 7,
            slot: 4,
        });
        assert_eq!(item.attempts(), 1);

        let mut clone = item.clone();
        clone.bump_attempts();
        assert_eq!(clone.id(), item.id());
        assert_eq!(clone.attempts(), 2);
        assert_eq!(item.attempts(), 1);
    }

    #[test]
    fn renew_clears_terminal_state() {
        let mut item = probe(2.0);
        item.set_id(ItemId {
            submission: 1,
            slot: 0,
        });
        item.process();
        item.renew();
        assert_eq!(item.status(), ItemStatus::DoProcess);
        assert!(item.id().is_none());
        assert!(item.results().is_empty());
    }
}
