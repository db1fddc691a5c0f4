//! Task scheduling primitives.
//!
//! [`ThreadPool`] is a small bounded worker pool over an unbounded channel:
//! workers are spawned on demand up to a fixed cap and retire after an idle
//! timeout. [`LimitExecutor`] and [`TagExecutor`] layer serial-execution
//! policies on top of a shared pool: the former keeps at most one task
//! active and one queued globally, the latter does the same per tag while
//! letting coalescable jobs replace a queued predecessor.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool with an unbounded queue and on-demand workers that exit
/// after `idle_timeout` without work.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    max_workers: usize,
    idle_timeout: Duration,
    workers: AtomicUsize,
    idle: AtomicUsize,
}

impl ThreadPool {
    pub fn new(max_workers: usize, idle_timeout: Duration) -> Self {
        let (tx, rx) = unbounded();
        ThreadPool {
            inner: Arc::new(PoolInner {
                tx,
                rx,
                max_workers: max_workers.max(1),
                idle_timeout,
                workers: AtomicUsize::new(0),
                idle: AtomicUsize::new(0),
            }),
        }
    }

    /// Enqueue a job, spawning a worker when none is idle and the cap
    /// allows.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        // The receiver half lives in `inner`, so the channel can never be
        // disconnected while `self` exists.
        let _ = self.inner.tx.send(Box::new(job));
        if self.inner.idle.load(Ordering::Acquire) == 0 {
            self.try_spawn();
        }
    }

    /// Number of live worker threads (for tests).
    #[cfg(test)]
    pub fn worker_count(&self) -> usize {
        self.inner.workers.load(Ordering::Acquire)
    }

    fn try_spawn(&self) {
        let inner = &self.inner;
        let mut count = inner.workers.load(Ordering::Acquire);
        loop {
            if count >= inner.max_workers {
                return;
            }
            match inner.workers.compare_exchange(
                count,
                count + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => count = observed,
            }
        }

        let inner = Arc::clone(&self.inner);
        let spawned = std::thread::Builder::new()
            .name("mirrorkv-worker".to_string())
            .spawn(move || worker_loop(inner));
        if spawned.is_err() {
            self.inner.workers.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    loop {
        inner.idle.fetch_add(1, Ordering::AcqRel);
        let received = inner.rx.recv_timeout(inner.idle_timeout);
        inner.idle.fetch_sub(1, Ordering::AcqRel);
        match received {
            Ok(job) => {
                let _ = catch_unwind(AssertUnwindSafe(job));
            }
            Err(RecvTimeoutError::Timeout) => {
                // A job may have raced the timeout; drain before retiring.
                match inner.rx.try_recv() {
                    Ok(job) => {
                        let _ = catch_unwind(AssertUnwindSafe(job));
                    }
                    Err(_) => break,
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    inner.workers.fetch_sub(1, Ordering::AcqRel);
}

/// Single-slot serial executor: one active task, one queued. Submissions
/// made while a task is already queued are dropped — the queued task will
/// observe the latest state when it runs.
pub struct LimitExecutor {
    pool: Arc<ThreadPool>,
    state: Arc<Mutex<LimitState>>,
}

#[derive(Default)]
struct LimitState {
    active: bool,
    waiting: Option<Job>,
}

impl LimitExecutor {
    pub fn new(pool: Arc<ThreadPool>) -> Self {
        LimitExecutor { pool, state: Arc::new(Mutex::new(LimitState::default())) }
    }

    pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        let mut state = self.state.lock();
        if !state.active {
            state.active = true;
            drop(state);
            self.schedule(Box::new(job));
        } else if state.waiting.is_none() {
            state.waiting = Some(Box::new(job));
        }
    }

    fn schedule(&self, job: Job) {
        let state = Arc::clone(&self.state);
        self.pool.execute(move || {
            let mut next = job;
            loop {
                let _ = catch_unwind(AssertUnwindSafe(next));
                let mut st = state.lock();
                match st.waiting.take() {
                    Some(queued) => next = queued,
                    None => {
                        st.active = false;
                        break;
                    }
                }
            }
        });
    }
}

/// Whether a queued job may be replaced by a later submission for the same
/// tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    /// Last-write-wins: a queued job of this kind is replaced in place by a
    /// newer one.
    Coalescing,
    /// Runs exactly once, in submission order.
    Ordered,
}

/// Per-tag serial executor. Jobs for one tag never overlap; jobs for
/// different tags run freely in parallel on the shared pool.
pub struct TagExecutor {
    pool: Arc<ThreadPool>,
    tags: Arc<Mutex<HashMap<String, TagQueue>>>,
}

struct TagQueue {
    queue: VecDeque<(JobKind, Job)>,
}

impl TagExecutor {
    pub fn new(pool: Arc<ThreadPool>) -> Self {
        TagExecutor { pool, tags: Arc::new(Mutex::new(HashMap::new())) }
    }

    pub fn execute<F: FnOnce() + Send + 'static>(&self, tag: &str, kind: JobKind, job: F) {
        let job: Job = Box::new(job);
        let mut tags = self.tags.lock();
        match tags.get_mut(tag) {
            Some(entry) => {
                if kind == JobKind::Coalescing {
                    if let Some(slot) =
                        entry.queue.iter_mut().find(|(k, _)| *k == JobKind::Coalescing)
                    {
                        slot.1 = job;
                        return;
                    }
                }
                entry.queue.push_back((kind, job));
            }
            None => {
                let mut queue = VecDeque::new();
                queue.push_back((kind, job));
                tags.insert(tag.to_string(), TagQueue { queue });
                drop(tags);
                self.run_tag(tag.to_string());
            }
        }
    }

    fn run_tag(&self, tag: String) {
        let tags = Arc::clone(&self.tags);
        self.pool.execute(move || loop {
            let job = {
                let mut map = tags.lock();
                match map.get_mut(&tag).and_then(|entry| entry.queue.pop_front()) {
                    Some((_, job)) => job,
                    None => {
                        map.remove(&tag);
                        break;
                    }
                }
            };
            let _ = catch_unwind(AssertUnwindSafe(job));
        });
    }
}
