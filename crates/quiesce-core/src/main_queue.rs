//! The application's main execution context.
//!
//! UI mutation and run-loop-bound work happen on one designated thread. The
//! [`MainContext`] trait is the seam through which the synchronized executor
//! reaches that thread; [`MainQueue`] is the stock implementation, a dedicated
//! OS thread draining a job channel in FIFO order.
//!
//! Embedders with their own UI thread implement [`MainContext`] over it and
//! pass it to [`SyncManagerBuilder::main_context`](crate::manager::SyncManagerBuilder::main_context).

use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// A unit of work executed on the main context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// The main context has shut down and no longer accepts jobs.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("main context is closed")]
pub struct MainContextClosed;

/// A single-threaded cooperative execution context.
pub trait MainContext: Send + Sync {
    /// Enqueues a job. Jobs run in submission order.
    fn dispatch(&self, job: Job) -> Result<(), MainContextClosed>;

    /// Returns `true` if the calling thread is this context's thread.
    fn is_current(&self) -> bool;

    /// Number of jobs submitted but not yet finished, the running one included.
    fn pending_jobs(&self) -> usize;
}

/// A dedicated thread acting as the application main thread.
pub struct MainQueue {
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    pending: Arc<AtomicUsize>,
    thread_id: ThreadId,
    join_handle: Mutex<Option<JoinHandle<()>>>,
}

impl MainQueue {
    /// Spawns the queue thread.
    pub fn spawn(name: impl Into<String>) -> io::Result<Arc<Self>> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = pending.clone();

        let join_handle = thread::Builder::new().name(name.clone()).spawn(move || {
            while let Some(job) = rx.blocking_recv() {
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("job panicked on main queue");
                }
                worker_pending.fetch_sub(1, Ordering::AcqRel);
            }
            debug!("main queue drained");
        })?;
        let thread_id = join_handle.thread().id();

        debug!(name = %name, "main queue started");

        Ok(Arc::new(Self {
            name,
            tx: Mutex::new(Some(tx)),
            pending,
            thread_id,
            join_handle: Mutex::new(Some(join_handle)),
        }))
    }

    /// The thread name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops accepting jobs and waits for queued ones to finish.
    ///
    /// When called from the queue thread itself the wait is skipped.
    pub fn shutdown(&self) {
        self.tx.lock().take();
        if self.is_current() {
            return;
        }
        if let Some(handle) = self.join_handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl MainContext for MainQueue {
    fn dispatch(&self, job: Job) -> Result<(), MainContextClosed> {
        let tx = self.tx.lock();
        let Some(tx) = tx.as_ref() else {
            return Err(MainContextClosed);
        };
        self.pending.fetch_add(1, Ordering::AcqRel);
        tx.send(job).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::AcqRel);
            MainContextClosed
        })
    }

    fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn pending_jobs(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }
}

impl Drop for MainQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for MainQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainQueue")
            .field("name", &self.name)
            .field("pending", &self.pending_jobs())
            .field("thread_id", &self.thread_id)
            .finish()
    }
}
