//! Process-wide rendezvous between producer buffer ports and consumers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use optforge_core::{BrokerConfig, Evaluate, WorkItem};

use crate::consumer::Consumer;
use crate::port::{BufferPort, PortId};

/// Broker lifecycle. Created `Initializing`, `Running` once the first
/// consumer is enrolled, `Draining` on shutdown request, `Stopped` when the
/// backlog is flushed and every consumer has been joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Initializing,
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker is not accepting ports (state {0:?})")]
    NotRunning(RunState),
    #[error("broker is shutting down")]
    ShuttingDown,
    #[error("consumer failed to start: {0}")]
    ConsumerStart(String),
    #[error("cannot spawn service thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Handle under which a consumer is registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerId(u64);

impl std::fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "consumer-{}", self.0)
    }
}

/// Point-in-time view of the broker, for logs and diagnostics.
#[derive(Debug, Clone)]
pub struct BrokerSnapshot {
    pub state: RunState,
    pub ports: Vec<PortSnapshot>,
    pub consumers: Vec<ConsumerSnapshot>,
}

/// One enrolled port as seen at snapshot time.
#[derive(Debug, Clone)]
pub struct PortSnapshot {
    pub id: PortId,
    pub raw_queued: usize,
    pub processed_queued: usize,
    pub orphaned: bool,
}

/// One enrolled consumer and its advertised hints.
#[derive(Debug, Clone)]
pub struct ConsumerSnapshot {
    pub id: ConsumerId,
    pub name: String,
    pub parallelism: usize,
    pub capacity_restricted: bool,
    pub remote: bool,
}

/// Wakes consumers blocked on an all-ports-empty broker. Notification takes
/// the internal lock so a waiter that has just re-checked the ports cannot
/// miss the wakeup.
pub(crate) struct DispatchSignal {
    lock: Mutex<()>,
    cond: Condvar,
}

impl DispatchSignal {
    fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}

struct PortEntry<E: Evaluate> {
    id: PortId,
    port: Weak<BufferPort<E>>,
    /// Global service stamp of the last dispatch from this port; the least
    /// recently serviced non-empty port is dispatched next.
    last_serviced: AtomicU64,
}

struct ConsumerSlot<E: Evaluate> {
    id: ConsumerId,
    consumer: Box<dyn Consumer<E>>,
}

struct Registry<E: Evaluate> {
    ports: Vec<PortEntry<E>>,
    /// submission id -> owning port, recorded when the submission opens.
    submissions: HashMap<u64, PortId>,
    consumers: Vec<ConsumerSlot<E>>,
}

struct Lifecycle {
    state: RunState,
    drain_deadline: Option<Instant>,
}

struct BrokerShared<E: Evaluate> {
    cfg: BrokerConfig,
    registry: RwLock<Registry<E>>,
    lifecycle: RwLock<Lifecycle>,
    signal: Arc<DispatchSignal>,
    service_counter: AtomicU64,
    next_submission: AtomicU64,
    next_consumer_id: AtomicU64,
}

/// Cheaply cloneable handle to the process-wide broker. Construct one at
/// program start and pass clones to executors and consumers.
pub struct Broker<E: Evaluate> {
    shared: Arc<BrokerShared<E>>,
}

impl<E: Evaluate> Clone for Broker<E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// Keeps a buffer port enrolled; dropping it deregisters the port and
/// orphans its queues.
pub struct PortToken<E: Evaluate> {
    broker: Broker<E>,
    port_id: PortId,
}

impl<E: Evaluate> Drop for PortToken<E> {
    fn drop(&mut self) {
        self.broker.deregister_port(self.port_id);
    }
}

impl<E: Evaluate> Broker<E> {
    pub fn new(cfg: BrokerConfig) -> Self {
        Self {
            shared: Arc::new(BrokerShared {
                cfg,
                registry: RwLock::new(Registry {
                    ports: Vec::new(),
                    submissions: HashMap::new(),
                    consumers: Vec::new(),
                }),
                lifecycle: RwLock::new(Lifecycle {
                    state: RunState::Initializing,
                    drain_deadline: None,
                }),
                signal: Arc::new(DispatchSignal::new()),
                service_counter: AtomicU64::new(0),
                next_submission: AtomicU64::new(0),
                next_consumer_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn run_state(&self) -> RunState {
        self.shared.lifecycle.read().state
    }

    pub fn port_capacity(&self) -> usize {
        self.shared.cfg.port_capacity
    }

    pub fn dispatch_timeout(&self) -> Duration {
        self.shared.cfg.dispatch_timeout()
    }

    /// Register a producer port. Only accepted while the broker is
    /// `Running`; the returned token deregisters the port on drop.
    pub fn enroll_buffer_port(
        &self,
        port: &Arc<BufferPort<E>>,
    ) -> Result<PortToken<E>, BrokerError> {
        {
            let lifecycle = self.shared.lifecycle.read();
            if lifecycle.state != RunState::Running {
                return Err(BrokerError::NotRunning(lifecycle.state));
            }
        }
        port.attach_signal(Arc::clone(&self.shared.signal));
        let id = port.id();
        self.shared.registry.write().ports.push(PortEntry {
            id,
            port: Arc::downgrade(port),
            last_serviced: AtomicU64::new(0),
        });
        info!(%id, "buffer port enrolled");
        Ok(PortToken {
            broker: self.clone(),
            port_id: id,
        })
    }

    fn deregister_port(&self, id: PortId) {
        let mut registry = self.shared.registry.write();
        if let Some(pos) = registry.ports.iter().position(|entry| entry.id == id) {
            let entry = registry.ports.remove(pos);
            if let Some(port) = entry.port.upgrade() {
                port.mark_orphaned();
            }
        }
        registry.submissions.retain(|_, mapped| *mapped != id);
        info!(%id, "buffer port deregistered");
    }

    /// Hand a consumer to the broker, which starts its service threads and
    /// owns it until shutdown. The first enrollment moves the broker to
    /// `Running`.
    pub fn enroll_consumer(
        &self,
        mut consumer: Box<dyn Consumer<E>>,
    ) -> Result<ConsumerId, BrokerError> {
        {
            let mut lifecycle = self.shared.lifecycle.write();
            match lifecycle.state {
                RunState::Draining | RunState::Stopped => return Err(BrokerError::ShuttingDown),
                RunState::Initializing => {
                    lifecycle.state = RunState::Running;
                }
                RunState::Running => {}
            }
        }
        let id = ConsumerId(self.shared.next_consumer_id.fetch_add(1, Ordering::Relaxed) + 1);
        info!(
            %id,
            name = consumer.name(),
            parallelism = consumer.parallelism_hint(),
            remote = consumer.is_remote(),
            "enrolling consumer"
        );
        consumer.start(self.clone())?;
        self.shared
            .registry
            .write()
            .consumers
            .push(ConsumerSlot { id, consumer });
        Ok(id)
    }

    /// Deregister a consumer that hit an unrecoverable fault. Items already
    /// handed to it are lost; the producer's resubmission path is the only
    /// recovery. The broker never retries.
    pub fn report_consumer_failure(&self, id: ConsumerId, reason: &str) {
        error!(%id, reason, "consumer reported unrecoverable failure; deregistering");
        let slot = {
            let mut registry = self.shared.registry.write();
            registry
                .consumers
                .iter()
                .position(|slot| slot.id == id)
                .map(|pos| registry.consumers.remove(pos))
        };
        // Dropping the controller signals its remaining threads to wind
        // down; the failed consumer is never joined from here.
        drop(slot);
    }

    /// Open a new submission for `port` and bind its id for response
    /// routing. Any previous binding of the same port is retired.
    pub fn open_submission(&self, port: &BufferPort<E>) -> u64 {
        let submission = self.shared.next_submission.fetch_add(1, Ordering::Relaxed) + 1;
        let port_id = port.id();
        {
            let mut registry = self.shared.registry.write();
            registry.submissions.retain(|_, mapped| *mapped != port_id);
            registry.submissions.insert(submission, port_id);
        }
        port.set_current_submission(submission);
        debug!(%port_id, submission, "submission opened");
        submission
    }

    /// Pull the next raw item, blocking up to `timeout` while every port is
    /// empty. Returns `None` on timeout or once the broker refuses service
    /// (drain grace expired or stopped).
    pub fn get_raw(&self, timeout: Duration) -> Option<WorkItem<E>> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_serving() {
                return None;
            }
            if let Some(item) = self.try_dispatch() {
                return Some(item);
            }
            let signal = &self.shared.signal;
            let mut guard = signal.lock.lock();
            // Re-check under the signal lock: a push between the check
            // above and this wait would otherwise be missed.
            if let Some(item) = self.try_dispatch() {
                return Some(item);
            }
            if signal.cond.wait_until(&mut guard, deadline).timed_out() {
                return None;
            }
        }
    }

    fn is_serving(&self) -> bool {
        let lifecycle = self.shared.lifecycle.read();
        match lifecycle.state {
            RunState::Initializing | RunState::Running => true,
            RunState::Draining => lifecycle
                .drain_deadline
                .is_some_and(|deadline| Instant::now() < deadline),
            RunState::Stopped => false,
        }
    }

    /// One round-robin pass: dispatch from the least recently serviced
    /// non-empty port, oldest enrollment breaking ties.
    fn try_dispatch(&self) -> Option<WorkItem<E>> {
        let registry = self.shared.registry.read();
        loop {
            let mut best: Option<(&PortEntry<E>, Arc<BufferPort<E>>, u64)> = None;
            for entry in &registry.ports {
                let Some(port) = entry.port.upgrade() else {
                    continue;
                };
                if port.size_raw() == 0 {
                    continue;
                }
                let stamp = entry.last_serviced.load(Ordering::Relaxed);
                let beats_best = match &best {
                    Some((_, _, best_stamp)) => stamp < *best_stamp,
                    None => true,
                };
                if beats_best {
                    best = Some((entry, port, stamp));
                }
            }
            let (entry, port, _) = best?;
            if let Some(item) = port.try_pop_raw() {
                let stamp = self.shared.service_counter.fetch_add(1, Ordering::Relaxed) + 1;
                entry.last_serviced.store(stamp, Ordering::Relaxed);
                debug!(port = %port.id(), item = ?item.id().map(|id| id.to_string()), "dispatching raw item");
                return Some(item);
            }
            // Raced with another consumer for the last item; rescan.
        }
    }

    /// Return a processed item to its producer, keyed by the submission
    /// half of its identity. Items whose port is gone, or whose submission
    /// is no longer the port's current one, are dropped.
    pub fn put_processed(&self, item: WorkItem<E>) {
        let Some(id) = item.id() else {
            warn!("dropping processed item without identity");
            return;
        };
        let port = {
            let registry = self.shared.registry.read();
            let Some(port_id) = registry.submissions.get(&id.submission).copied() else {
                debug!(item = %id, "dropping processed item for retired submission");
                return;
            };
            registry
                .ports
                .iter()
                .find(|entry| entry.id == port_id)
                .and_then(|entry| entry.port.upgrade())
        };
        let Some(port) = port else {
            debug!(item = %id, "dropping processed item for deregistered port");
            return;
        };
        if port.current_submission() != id.submission {
            debug!(item = %id, "dropping stale processed item");
            return;
        }
        let timeout = self.shared.cfg.processed_push_timeout();
        if port.push_processed(item, timeout).is_err() {
            warn!(item = %id, port = %port.id(), "processed queue full; dropping item");
        }
    }

    /// Initiate draining. Consumers keep pulling for the grace window; the
    /// leftover backlog is then flagged as drained and handed back to any
    /// still-living owners, and every consumer is stopped and joined.
    pub fn shutdown(&self, grace: Duration) {
        {
            let mut lifecycle = self.shared.lifecycle.write();
            if matches!(lifecycle.state, RunState::Draining | RunState::Stopped) {
                return;
            }
            lifecycle.state = RunState::Draining;
            lifecycle.drain_deadline = Some(Instant::now() + grace);
        }
        info!(grace_ms = grace.as_millis() as u64, "broker draining");
        self.shared.signal.notify();

        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if self.raw_backlog() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        let live_ports: Vec<Arc<BufferPort<E>>> = {
            let registry = self.shared.registry.read();
            registry
                .ports
                .iter()
                .filter_map(|entry| entry.port.upgrade())
                .collect()
        };
        for port in live_ports {
            for mut item in port.drain_raw() {
                item.flag_error("drained");
                if port.push_processed(item, Duration::from_millis(100)).is_err() {
                    warn!(port = %port.id(), "dropping drained item; processed queue full");
                }
            }
        }

        let mut consumers = {
            let mut registry = self.shared.registry.write();
            std::mem::take(&mut registry.consumers)
        };
        for slot in &mut consumers {
            slot.consumer.stop();
        }
        drop(consumers);

        self.shared.lifecycle.write().state = RunState::Stopped;
        self.shared.signal.notify();
        info!("broker stopped");
    }

    fn raw_backlog(&self) -> usize {
        let registry = self.shared.registry.read();
        registry
            .ports
            .iter()
            .filter_map(|entry| entry.port.upgrade())
            .map(|port| port.size_raw())
            .sum()
    }

    pub fn snapshot(&self) -> BrokerSnapshot {
        let registry = self.shared.registry.read();
        let ports = registry
            .ports
            .iter()
            .filter_map(|entry| entry.port.upgrade())
            .map(|port| PortSnapshot {
                id: port.id(),
                raw_queued: port.size_raw(),
                processed_queued: port.size_processed(),
                orphaned: port.is_orphaned(),
            })
            .collect();
        let consumers = registry
            .consumers
            .iter()
            .map(|slot| ConsumerSnapshot {
                id: slot.id,
                name: slot.consumer.name().to_string(),
                parallelism: slot.consumer.parallelism_hint(),
                capacity_restricted: slot.consumer.capacity_restricted(),
                remote: slot.consumer.is_remote(),
            })
            .collect();
        drop(registry);
        BrokerSnapshot {
            state: self.run_state(),
            ports,
            consumers,
        }
    }
}
