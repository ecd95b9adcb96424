//! Worker pool with synchronous hand-off and idle reaping.
//!
//! A submission either lands on an already-idle worker or spawns a fresh
//! thread; nothing is queued. Idle workers exit after `idle_timeout`, so
//! the pool holds O(live connections) threads.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use thiserror::Error;

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Error)]
#[error("worker pool is shutting down")]
pub struct SubmissionRejected;

struct PoolInner {
    name: String,
    idle_timeout: Duration,
    shutdown: AtomicBool,
    handoff_tx: Sender<Task>,
    handoff_rx: Receiver<Task>,
    // Dropped on shutdown; idle workers select on it to wake promptly.
    stop_tx: Mutex<Option<Sender<()>>>,
    stop_rx: Receiver<()>,
    active: Mutex<usize>,
    quiesced: Condvar,
    worker_seq: AtomicUsize,
}

#[derive(Clone)]
pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    pub fn new(name: impl Into<String>, idle_timeout: Duration) -> Self {
        let (handoff_tx, handoff_rx) = channel::bounded::<Task>(0);
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                idle_timeout,
                shutdown: AtomicBool::new(false),
                handoff_tx,
                handoff_rx,
                stop_tx: Mutex::new(Some(stop_tx)),
                stop_rx,
                active: Mutex::new(0),
                quiesced: Condvar::new(),
                worker_seq: AtomicUsize::new(0),
            }),
        }
    }

    /// Hand the task to an idle worker or spawn a new one.
    pub fn submit(&self, task: Task) -> Result<(), SubmissionRejected> {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return Err(SubmissionRejected);
        }
        match self.inner.handoff_tx.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) => self.spawn_worker(task),
            Err(TrySendError::Disconnected(_)) => Err(SubmissionRejected),
        }
    }

    fn spawn_worker(&self, first: Task) -> Result<(), SubmissionRejected> {
        {
            let mut active = self.inner.active.lock().expect("pool active lock");
            *active += 1;
        }
        let seq = self.inner.worker_seq.fetch_add(1, Ordering::AcqRel);
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name(format!("{}-{seq}", inner.name))
            .spawn(move || run_worker(inner, first));
        match spawned {
            Ok(_) => Ok(()),
            Err(err) => {
                tracing::warn!("worker spawn failed: {err}");
                self.worker_exited();
                Err(SubmissionRejected)
            }
        }
    }

    fn worker_exited(&self) {
        let mut active = self.inner.active.lock().expect("pool active lock");
        *active -= 1;
        if *active == 0 {
            self.inner.quiesced.notify_all();
        }
    }

    /// Stop accepting submissions and wake idle workers. Running tasks
    /// finish on their own; this never blocks.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.stop_tx.lock().expect("pool stop lock").take();
    }

    /// Wait up to `deadline` for all workers to exit. Returns whether the
    /// pool reached quiescence; stragglers past the deadline are left to
    /// finish detached.
    pub fn await_quiescence(&self, deadline: Duration) -> bool {
        let end = Instant::now() + deadline;
        let mut active = self.inner.active.lock().expect("pool active lock");
        while *active > 0 {
            let now = Instant::now();
            if now >= end {
                return false;
            }
            let (next, _) = self
                .inner
                .quiesced
                .wait_timeout(active, end - now)
                .expect("pool active lock");
            active = next;
        }
        true
    }

    pub fn active_workers(&self) -> usize {
        *self.inner.active.lock().expect("pool active lock")
    }
}

fn run_worker(inner: Arc<PoolInner>, first: Task) {
    first();
    loop {
        if inner.shutdown.load(Ordering::Acquire) {
            break;
        }
        crossbeam::select! {
            recv(inner.handoff_rx) -> task => match task {
                Ok(task) => task(),
                Err(_) => break,
            },
            recv(inner.stop_rx) -> _ => break,
            default(inner.idle_timeout) => break,
        }
    }
    let mut active = inner.active.lock().expect("pool active lock");
    *active -= 1;
    if *active == 0 {
        inner.quiesced.notify_all();
    }
}
