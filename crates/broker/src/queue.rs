//! Bounded blocking queue used for both sides of a buffer port.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
pub(crate) enum PushError<T> {
    /// The queue stayed full for the whole timeout; the value is handed
    /// back to the caller.
    Timeout(T),
    /// The queue has been closed; no further values are accepted.
    Closed(T),
}

impl<T> PushError<T> {
    pub(crate) fn into_inner(self) -> T {
        match self {
            PushError::Timeout(value) | PushError::Closed(value) => value,
        }
    }
}

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// A fixed-capacity FIFO with blocking push and pop, both bounded by a
/// caller-supplied timeout. Closing wakes every waiter; a closed queue
/// still drains its remaining items.
pub(crate) struct BoundedQueue<T> {
    state: Mutex<State<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "queue capacity must be >= 1");
        Self {
            state: Mutex::new(State {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity,
        }
    }

    pub(crate) fn push(&self, value: T, timeout: Duration) -> Result<(), PushError<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if state.closed {
                return Err(PushError::Closed(value));
            }
            if state.items.len() < self.capacity {
                state.items.push_back(value);
                drop(state);
                self.not_empty.notify_one();
                return Ok(());
            }
            if self.not_full.wait_until(&mut state, deadline).timed_out() {
                return Err(PushError::Timeout(value));
            }
        }
    }

    pub(crate) fn pop(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(value) = state.items.pop_front() {
                drop(state);
                self.not_full.notify_one();
                return Some(value);
            }
            if state.closed {
                return None;
            }
            if self.not_empty.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
    }

    /// Non-blocking pop.
    pub(crate) fn try_pop(&self) -> Option<T> {
        let value = self.state.lock().items.pop_front();
        if value.is_some() {
            self.not_full.notify_one();
        }
        value
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Stop accepting pushes and wake every waiter. Remaining items stay
    /// poppable.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Remove and return everything currently queued.
    pub(crate) fn drain(&self) -> Vec<T> {
        let drained: Vec<T> = self.state.lock().items.drain(..).collect();
        if !drained.is_empty() {
            self.not_full.notify_all();
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    const SHORT: Duration = Duration::from_millis(20);

    #[test]
    fn push_pop_fifo() {
        let q = BoundedQueue::new(4);
        q.push(1, SHORT).unwrap();
        q.push(2, SHORT).unwrap();
        assert_eq!(q.pop(SHORT), Some(1));
        assert_eq!(q.pop(SHORT), Some(2));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn full_push_times_out_and_returns_value() {
        let q = BoundedQueue::new(1);
        q.push(1, SHORT).unwrap();
        match q.push(2, SHORT) {
            Err(PushError::Timeout(v)) => assert_eq!(v, 2),
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn empty_pop_times_out_within_slack() {
        let q: BoundedQueue<u32> = BoundedQueue::new(1);
        let started = Instant::now();
        assert_eq!(q.pop(Duration::from_millis(50)), None);
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(45), "returned too early: {elapsed:?}");
        assert!(elapsed < Duration::from_secs(2), "returned too late: {elapsed:?}");
    }

    #[test]
    fn blocked_push_proceeds_when_space_frees() {
        let q = Arc::new(BoundedQueue::new(1));
        q.push(1, SHORT).unwrap();

        let q2 = Arc::clone(&q);
        let pusher = std::thread::spawn(move || q2.push(2, Duration::from_secs(5)));

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(q.pop(SHORT), Some(1));
        pusher.join().unwrap().unwrap();
        assert_eq!(q.pop(SHORT), Some(2));
    }

    #[test]
    fn close_wakes_blocked_pop() {
        let q: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(1));
        let q2 = Arc::clone(&q);
        let popper = std::thread::spawn(move || q2.pop(Duration::from_secs(5)));

        std::thread::sleep(Duration::from_millis(30));
        q.close();
        assert_eq!(popper.join().unwrap(), None);
    }

    #[test]
    fn closed_queue_rejects_pushes_but_drains() {
        let q = BoundedQueue::new(2);
        q.push(7, SHORT).unwrap();
        q.close();
        assert!(matches!(q.push(8, SHORT), Err(PushError::Closed(8))));
        assert_eq!(q.pop(SHORT), Some(7));
        assert_eq!(q.pop(SHORT), None);
    }
}
