//! The consumer contract and the in-process thread-pool implementation.

use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use optforge_core::Evaluate;

use crate::broker::{Broker, BrokerError, RunState};
use crate::pool::ThreadGroup;

/// A sink for raw work items. Implementations pull items from the broker,
/// arrange their processing and push the processed items back.
///
/// Ownership transfers to the broker at enrollment; the broker calls
/// [`Consumer::start`] once and [`Consumer::stop`] during shutdown. `stop`
/// must be idempotent and joining; dropping a consumer without `stop` must
/// still signal its threads to wind down. Enrolled consumers live inside
/// the broker's shared registry, which is read from many threads, so
/// implementations must be `Send + Sync`.
pub trait Consumer<E: Evaluate>: Send + Sync {
    fn name(&self) -> &str;

    /// Nominal parallelism, used as an admission-control hint.
    fn parallelism_hint(&self) -> usize {
        1
    }

    /// Whether the consumer can exert back-pressure of its own.
    fn capacity_restricted(&self) -> bool {
        false
    }

    /// Whether items leave the process to reach this consumer; remote
    /// consumers serialize items on the way out.
    fn is_remote(&self) -> bool {
        false
    }

    fn start(&mut self, broker: Broker<E>) -> Result<(), BrokerError>;

    fn stop(&mut self);
}

/// In-process consumer: a fixed set of worker threads, each looping
/// pull → process → return against the broker.
pub struct ThreadPoolConsumer<E> {
    name: String,
    parallelism: usize,
    stop: Arc<AtomicBool>,
    threads: ThreadGroup,
    _marker: PhantomData<fn() -> E>,
}

impl<E: Evaluate> ThreadPoolConsumer<E> {
    pub fn new(name: impl Into<String>, parallelism: usize) -> Self {
        Self {
            name: name.into(),
            parallelism: parallelism.max(1),
            stop: Arc::new(AtomicBool::new(false)),
            threads: ThreadGroup::new(),
            _marker: PhantomData,
        }
    }
}

impl<E: Evaluate> Consumer<E> for ThreadPoolConsumer<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn parallelism_hint(&self) -> usize {
        self.parallelism
    }

    fn capacity_restricted(&self) -> bool {
        true
    }

    fn start(&mut self, broker: Broker<E>) -> Result<(), BrokerError> {
        let poll = broker.dispatch_timeout();
        for idx in 0..self.parallelism {
            let broker = broker.clone();
            let stop = Arc::clone(&self.stop);
            self.threads
                .spawn(format!("{}-{idx}", self.name), move || {
                    run_worker(&broker, &stop, poll);
                })?;
        }
        info!(name = %self.name, workers = self.parallelism, "in-process consumer started");
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.threads.join_all();
    }
}

impl<E> Drop for ThreadPoolConsumer<E> {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}

fn run_worker<E: Evaluate>(broker: &Broker<E>, stop: &AtomicBool, poll: Duration) {
    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }
        match broker.get_raw(poll) {
            Some(mut item) => {
                item.process();
                broker.put_processed(item);
            }
            None => {
                if broker.run_state() == RunState::Stopped {
                    break;
                }
            }
        }
    }
    debug!("consumer worker exiting");
}
