//! Small thread utilities: a spawn-and-join-all group and a fixed-size
//! worker pool.

use std::sync::Arc;
use std::sync::mpsc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Collects spawned threads so they can be joined together.
#[derive(Default)]
pub struct ThreadGroup {
    handles: Vec<JoinHandle<()>>,
}

impl ThreadGroup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a named thread into the group. Fails when the OS refuses to
    /// create a thread; already-spawned members are unaffected.
    pub fn spawn<F>(&mut self, name: impl Into<String>, f: F) -> std::io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = std::thread::Builder::new().name(name.into()).spawn(f)?;
        self.handles.push(handle);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Join every thread spawned so far. Panicking threads are reported and
    /// skipped; the group never re-raises.
    pub fn join_all(&mut self) {
        for handle in self.handles.drain(..) {
            let name = handle.thread().name().unwrap_or("<unnamed>").to_string();
            if handle.join().is_err() {
                debug!(thread = %name, "thread terminated by panic");
            }
        }
    }
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Fixed-size pool executing boxed jobs in submission order. Workers share
/// one receiving end; the pool drains outstanding jobs before `join`
/// returns.
pub struct ThreadPool {
    sender: Option<mpsc::Sender<Job>>,
    workers: ThreadGroup,
}

impl ThreadPool {
    pub fn new(size: usize, name_prefix: &str) -> std::io::Result<Self> {
        assert!(size > 0, "thread pool size must be >= 1");
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = Arc::new(Mutex::new(receiver));
        let mut workers = ThreadGroup::new();
        for idx in 0..size {
            let receiver = Arc::clone(&receiver);
            workers.spawn(format!("{name_prefix}-{idx}"), move || {
                loop {
                    let job = { receiver.lock().recv() };
                    match job {
                        Ok(job) => job(),
                        Err(_) => break,
                    }
                }
            })?;
        }
        Ok(Self {
            sender: Some(sender),
            workers,
        })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Hand a job to the pool. Returns false when no worker can take it
    /// (the pool has been joined, or every worker has died); the job is
    /// dropped, so the caller decides what that means for its work.
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            return false;
        };
        if sender.send(Box::new(f)).is_err() {
            warn!("thread pool has no live workers; job rejected");
            return false;
        }
        true
    }

    /// Finish outstanding jobs and join the workers.
    pub fn join(&mut self) {
        self.sender.take();
        self.workers.join_all();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn pool_runs_every_job() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new(4, "test-pool").unwrap();
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            assert!(pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }));
        }
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn pool_survives_panicking_jobs() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = ThreadPool::new(2, "panicky").unwrap();
        pool.execute(|| panic!("job went sideways"));
        for _ in 0..10 {
            let counter = Arc::clone(&counter);
            pool.execute(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        pool.join();
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn joined_pool_rejects_new_jobs() {
        let mut pool = ThreadPool::new(1, "done").unwrap();
        pool.join();
        assert!(!pool.execute(|| {}));
    }

    #[test]
    fn group_joins_all() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut group = ThreadGroup::new();
        for idx in 0..8 {
            let counter = Arc::clone(&counter);
            group
                .spawn(format!("grp-{idx}"), move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        group.join_all();
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }
}
