//! The broker-side endpoint of one producer: a paired raw/processed queue.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use optforge_core::{Evaluate, WorkItem};

use crate::broker::DispatchSignal;
use crate::queue::BoundedQueue;

static NEXT_PORT_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a buffer port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(u64);

impl std::fmt::Display for PortId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "port-{}", self.0)
    }
}

/// A pair of bounded queues owned by exactly one executor for its lifetime.
///
/// The producer pushes raw items and pops processed ones; the broker does
/// the reverse. The two queues have independent locks and no operation ever
/// holds both. An item is never present in both queues at once: ownership
/// moves with every push and pop.
pub struct BufferPort<E: Evaluate> {
    id: PortId,
    raw: BoundedQueue<WorkItem<E>>,
    processed: BoundedQueue<WorkItem<E>>,
    current_submission: AtomicU64,
    orphaned: AtomicBool,
    signal: Mutex<Option<Arc<DispatchSignal>>>,
}

impl<E: Evaluate> BufferPort<E> {
    /// A fresh, unenrolled port whose queues each hold up to `capacity`
    /// items.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            id: PortId(NEXT_PORT_ID.fetch_add(1, Ordering::Relaxed)),
            raw: BoundedQueue::new(capacity),
            processed: BoundedQueue::new(capacity),
            current_submission: AtomicU64::new(0),
            orphaned: AtomicBool::new(false),
            signal: Mutex::new(None),
        })
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    /// Producer side: enqueue a raw item. On timeout or after close the
    /// item is handed back so the caller can flag it.
    pub fn push_raw(&self, item: WorkItem<E>, timeout: Duration) -> Result<(), WorkItem<E>> {
        match self.raw.push(item, timeout) {
            Ok(()) => {
                if let Some(signal) = self.signal.lock().clone() {
                    signal.notify();
                }
                Ok(())
            }
            Err(err) => Err(err.into_inner()),
        }
    }

    /// Broker side: dequeue a raw item for dispatch.
    pub fn pop_raw(&self, timeout: Duration) -> Option<WorkItem<E>> {
        self.raw.pop(timeout)
    }

    pub(crate) fn try_pop_raw(&self) -> Option<WorkItem<E>> {
        self.raw.try_pop()
    }

    /// Broker side: return a processed item to the producer.
    pub fn push_processed(&self, item: WorkItem<E>, timeout: Duration) -> Result<(), WorkItem<E>> {
        self.processed.push(item, timeout).map_err(|err| err.into_inner())
    }

    /// Producer side: collect a processed item.
    pub fn pop_processed(&self, timeout: Duration) -> Option<WorkItem<E>> {
        self.processed.pop(timeout)
    }

    pub fn size_raw(&self) -> usize {
        self.raw.len()
    }

    pub fn size_processed(&self) -> usize {
        self.processed.len()
    }

    /// True once the enrollment token has been dropped; the broker stops
    /// routing to an orphaned port.
    pub fn is_orphaned(&self) -> bool {
        self.orphaned.load(Ordering::Acquire)
    }

    pub(crate) fn mark_orphaned(&self) {
        self.orphaned.store(true, Ordering::Release);
        self.raw.close();
        self.processed.close();
    }

    pub(crate) fn attach_signal(&self, signal: Arc<DispatchSignal>) {
        *self.signal.lock() = Some(signal);
    }

    /// The submission currently being drained by the owning executor.
    /// Responses for any other submission are stale.
    pub(crate) fn set_current_submission(&self, submission: u64) {
        self.current_submission.store(submission, Ordering::Release);
    }

    pub(crate) fn current_submission(&self) -> u64 {
        self.current_submission.load(Ordering::Acquire)
    }

    pub(crate) fn drain_raw(&self) -> Vec<WorkItem<E>> {
        self.raw.drain()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optforge_core::{EvalError, ResultPair};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Noop;

    impl Evaluate for Noop {
        fn evaluate(&mut self) -> Result<Vec<ResultPair>, EvalError> {
            Ok(vec![ResultPair::new(0.0, 0.0)])
        }
    }

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn ids_are_process_unique() {
        let a = BufferPort::<Noop>::new(2);
        let b = BufferPort::<Noop>::new(2);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn raw_and_processed_queues_are_independent() {
        let port = BufferPort::<Noop>::new(2);
        port.push_raw(WorkItem::new(Noop), SHORT).unwrap();
        assert_eq!(port.size_raw(), 1);
        assert_eq!(port.size_processed(), 0);

        let item = port.pop_raw(SHORT).unwrap();
        port.push_processed(item, SHORT).unwrap();
        assert_eq!(port.size_raw(), 0);
        assert_eq!(port.size_processed(), 1);
    }

    #[test]
    fn push_without_attached_signal_still_works() {
        let port = BufferPort::<Noop>::new(1);
        port.push_raw(WorkItem::new(Noop), SHORT).unwrap();
        assert!(port.pop_raw(SHORT).is_some());
    }

    #[test]
    fn full_raw_queue_returns_the_item() {
        let port = BufferPort::<Noop>::new(1);
        port.push_raw(WorkItem::new(Noop), SHORT).unwrap();
        let rejected = port.push_raw(WorkItem::new(Noop), SHORT);
        assert!(rejected.is_err());
    }

    #[test]
    fn orphaning_closes_both_queues() {
        let port = BufferPort::<Noop>::new(2);
        port.push_raw(WorkItem::new(Noop), SHORT).unwrap();
        port.mark_orphaned();
        assert!(port.is_orphaned());
        assert!(port.push_raw(WorkItem::new(Noop), SHORT).is_err());
        assert!(port.push_processed(WorkItem::new(Noop), SHORT).is_err());
        // Leftovers stay poppable so the drain path can still flush.
        assert!(port.pop_raw(SHORT).is_some());
        assert!(port.pop_raw(SHORT).is_none());
    }
}
