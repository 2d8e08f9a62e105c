//! Single background thread that runs indexing jobs one at a time.

use crate::core::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Outcome of [`IndexWorker::submit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// The job was queued behind at most one running job
    Queued,
    /// A job was already waiting; it will see the same pending work
    Coalesced,
    /// The worker has shut down
    Closed,
}

/// One worker thread fed by a queue of depth one.
///
/// While a job waits in the queue further submissions are dropped: the
/// waiting job re-discovers pending work when it starts.
pub struct IndexWorker {
    sender: Option<SyncSender<Job>>,
    queued: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl IndexWorker {
    pub fn spawn() -> Result<Self> {
        let (sender, receiver) = mpsc::sync_channel::<Job>(1);
        let queued = Arc::new(AtomicBool::new(false));
        let worker_queued = Arc::clone(&queued);

        let handle = thread::Builder::new()
            .name("picvec-indexer".to_string())
            .spawn(move || {
                while let Ok(job) = receiver.recv() {
                    worker_queued.store(false, Ordering::SeqCst);
                    if thread_result(job).is_err() {
                        error!("Indexing job panicked");
                    }
                }
                debug!("Indexing worker stopped");
            })
            .map_err(Error::Io)?;

        Ok(Self {
            sender: Some(sender),
            queued,
            handle: Some(handle),
        })
    }

    /// Queue `job` unless another job is already waiting
    pub fn submit<F>(&self, job: F) -> Submission
    where
        F: FnOnce() + Send + 'static,
    {
        let Some(sender) = &self.sender else {
            return Submission::Closed;
        };

        if self
            .queued
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Submission::Coalesced;
        }

        match sender.try_send(Box::new(job)) {
            Ok(()) => Submission::Queued,
            Err(TrySendError::Full(_)) => Submission::Coalesced,
            Err(TrySendError::Disconnected(_)) => {
                self.queued.store(false, Ordering::SeqCst);
                Submission::Closed
            }
        }
    }

    /// Whether a job is waiting to start
    pub fn has_queued(&self) -> bool {
        self.queued.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs and wait for the queue to drain
    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            // The last owner may be dropped from inside a job.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for IndexWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn thread_result(job: Job) -> thread::Result<()> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(job))
}
