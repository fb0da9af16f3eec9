//! Asynchronous delivery: bounded lanes drained by worker threads.
//!
//! ```text
//! submit(task)
//!     │  hash(ThreadId) % lanes
//!     ├──► [permits 1 | jobs 1] ──► worker 1 ──► task()
//!     ├──► [permits 2 | jobs 2] ──► worker 2 ──► task()
//!     └──► [permits N | jobs N] ──► worker N ──► task()
//! ```
//!
//! Each lane admits at most `capacity` tasks: a task takes a permit before
//! it is queued and the worker hands it back once the task has finished, so
//! queued and executing tasks together never exceed the capacity.
//!
//! A producing thread always lands on the same lane, so tasks submitted by
//! one thread run in submission order. Tasks submitted by a worker go to its
//! own lane. Under [`Backpressure::Block`] they skip admission, since the
//! worker would otherwise wait for a permit only it can release.

use crate::bus::{Backpressure, ShutdownPolicy};
use crate::error::{BusError, Result};
use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use parking_lot::{Mutex, RwLock};
use std::cell::Cell;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Unit of asynchronous work.
pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

struct Job {
    task: Task,
    /// Whether the task holds one of its lane's permits.
    permit: bool,
}

thread_local! {
    /// Pipeline and lane served by the current thread, if it is a worker.
    static WORKER_LANE: Cell<Option<(usize, usize)>> = const { Cell::new(None) };
}

#[derive(Clone)]
struct Lane {
    jobs: Sender<Job>,
    permits: Sender<()>,
    /// Takes back a permit that was acquired but not used.
    returns: Receiver<()>,
}

impl Lane {
    fn release_permit(&self) {
        let _ = self.returns.try_recv();
    }
}

/// Counters shared with the workers.
#[derive(Default)]
struct Shared {
    pending: AtomicUsize,
    discard: AtomicBool,
}

impl Shared {
    fn key(self: &Arc<Self>) -> usize {
        Arc::as_ptr(self) as usize
    }
}

pub(crate) struct Pipeline {
    /// Emptied on shutdown, which closes every lane.
    lanes: RwLock<Vec<Lane>>,
    capacity: usize,
    backpressure: Backpressure,
    shared: Arc<Shared>,
    workers: Mutex<Option<WorkerPool>>,
}

impl Pipeline {
    /// Spawns `workers` lanes (at least one) of `capacity` slots each.
    pub(crate) fn start(
        workers: usize,
        capacity: usize,
        backpressure: Backpressure,
        thread_name: &str,
    ) -> Result<Self> {
        let workers = workers.max(1);
        let capacity = capacity.max(1);
        let shared = Arc::new(Shared::default());

        let mut lanes = Vec::with_capacity(workers);
        let mut pool = WorkerPool::new(workers);
        for index in 0..workers {
            let (jobs, job_rx) = unbounded::<Job>();
            let (permits, permit_rx) = bounded::<()>(capacity);
            pool.spawn(
                format!("{}-{}", thread_name, index),
                index,
                job_rx,
                permit_rx.clone(),
                Arc::clone(&shared),
            )?;
            lanes.push(Lane {
                jobs,
                permits,
                returns: permit_rx,
            });
        }

        tracing::debug!(workers, capacity, ?backpressure, "started delivery workers");

        Ok(Self {
            lanes: RwLock::new(lanes),
            capacity,
            backpressure,
            shared,
            workers: Mutex::new(Some(pool)),
        })
    }

    /// Per-lane capacity.
    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether admitted tasks have not finished yet.
    pub(crate) fn has_pending(&self) -> bool {
        self.shared.pending.load(Ordering::Acquire) > 0
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.lanes.read().is_empty()
    }

    /// Lane served by the current thread, if it is one of our workers.
    fn worker_lane(&self) -> Option<usize> {
        let key = self.shared.key();
        WORKER_LANE.with(|current| match current.get() {
            Some((pipeline, lane)) if pipeline == key => Some(lane),
            _ => None,
        })
    }

    /// Whether the current thread is one of this pipeline's workers.
    pub(crate) fn on_worker_thread(&self) -> bool {
        self.worker_lane().is_some()
    }

    /// Queues `task` on the calling thread's lane.
    pub(crate) fn submit(&self, task: Task) -> Result<()> {
        let worker_lane = self.worker_lane();

        // Clone the lane so a blocked producer does not hold the lock.
        let lane = {
            let lanes = self.lanes.read();
            if lanes.is_empty() {
                return Err(BusError::ShutDown);
            }
            let index = worker_lane.unwrap_or_else(|| lane_of_current_thread(lanes.len()));
            lanes[index % lanes.len()].clone()
        };

        let permit = match (self.backpressure, worker_lane) {
            (Backpressure::Block, Some(_)) => false,
            (Backpressure::Block, None) => {
                lane.permits.send(()).map_err(|_| BusError::ShutDown)?;
                true
            }
            (Backpressure::Fail, _) => {
                lane.permits.try_send(()).map_err(|e| match e {
                    TrySendError::Full(_) => BusError::DeliveryBackpressure {
                        capacity: self.capacity,
                    },
                    TrySendError::Disconnected(_) => BusError::ShutDown,
                })?;
                true
            }
        };

        // Shutdown empties the lanes under the write lock, so a task queued
        // while the read lock is held was accepted before shutdown began.
        let lanes = self.lanes.read();
        if lanes.is_empty() {
            if permit {
                lane.release_permit();
            }
            return Err(BusError::ShutDown);
        }
        self.shared.pending.fetch_add(1, Ordering::AcqRel);
        if lane.jobs.send(Job { task, permit }).is_err() {
            self.shared.pending.fetch_sub(1, Ordering::AcqRel);
            if permit {
                lane.release_permit();
            }
            return Err(BusError::ShutDown);
        }
        Ok(())
    }

    /// Closes all lanes and waits up to `timeout` for the workers.
    ///
    /// Returns true once every worker has exited. Safe to call repeatedly;
    /// a call after a timed-out one keeps waiting for the same workers.
    /// Called from one of the workers it closes the lanes without waiting
    /// and returns false.
    pub(crate) fn shutdown(&self, policy: ShutdownPolicy, timeout: Duration) -> bool {
        if policy == ShutdownPolicy::Discard {
            self.shared.discard.store(true, Ordering::Release);
        }
        let closed = std::mem::take(&mut *self.lanes.write());
        drop(closed);

        if self.on_worker_thread() {
            tracing::debug!(?policy, "delivery lanes closed from a worker");
            return false;
        }

        let mut workers = self.workers.lock();
        let Some(pool) = workers.as_mut() else {
            return true;
        };
        if pool.join(timeout) {
            *workers = None;
            tracing::debug!(?policy, "delivery workers stopped");
            true
        } else {
            false
        }
    }
}

fn lane_of_current_thread(lanes: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    thread::current().id().hash(&mut hasher);
    (hasher.finish() % lanes as u64) as usize
}

/// Worker threads plus a channel each of them signals on exit.
struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
    finished_tx: Sender<()>,
    finished_rx: Receiver<()>,
    running: usize,
}

/// Signals the pool when a worker exits, panicking or not.
struct ExitSignal(Sender<()>);

impl Drop for ExitSignal {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

impl WorkerPool {
    fn new(size: usize) -> Self {
        let (finished_tx, finished_rx) = bounded(size);
        Self {
            handles: Vec::with_capacity(size),
            finished_tx,
            finished_rx,
            running: 0,
        }
    }

    fn spawn(
        &mut self,
        name: String,
        lane: usize,
        jobs: Receiver<Job>,
        permits: Receiver<()>,
        shared: Arc<Shared>,
    ) -> Result<()> {
        let exit = ExitSignal(self.finished_tx.clone());
        let handle = thread::Builder::new().name(name).spawn(move || {
            let _exit = exit;
            WORKER_LANE.with(|current| current.set(Some((shared.key(), lane))));
            for Job { task, permit } in jobs.iter() {
                if !shared.discard.load(Ordering::Acquire)
                    && catch_unwind(AssertUnwindSafe(task)).is_err()
                {
                    tracing::error!("delivery task panicked");
                }
                if permit {
                    let _ = permits.try_recv();
                }
                shared.pending.fetch_sub(1, Ordering::AcqRel);
            }
        })?;
        self.handles.push(handle);
        self.running += 1;
        Ok(())
    }

    /// Waits for all workers until `timeout` elapses.
    fn join(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.running > 0 {
            match self.finished_rx.recv_deadline(deadline) {
                Ok(()) => self.running -= 1,
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(
                        running = self.running,
                        ?timeout,
                        "delivery workers did not finish in time"
                    );
                    return false;
                }
                // Unreachable while we hold `finished_tx`.
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
        true
    }
}
