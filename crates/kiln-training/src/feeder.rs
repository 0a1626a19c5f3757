//! Background batch feeding.
//!
//! Input plugins fill a bounded [`BatchQueue`] from worker threads started through a
//! [`Coordinator`]. Workers check the coordinator's cancellation token between batches;
//! shutdown cancels the token, closes the queue and joins every worker within a deadline.

use crate::error::{TrainingError, TrainingResult};
use crate::plugin::{Batch, Split};
use futures::future::join_all;
use std::sync::Mutex;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

pub use crate::plugin::BatchProducer;

/// Bounded buffer between feeder workers and the training step.
///
/// The queue keeps one sender of its own until [`seal`](Self::seal) is called, so workers
/// can be attached before any of them runs. Once sealed and every worker is gone, a
/// dequeue on an empty queue reports [`TrainingError::QueueClosed`] instead of blocking.
pub struct BatchQueue {
    split: Split,
    capacity: usize,
    sender: Mutex<Option<mpsc::Sender<Batch>>>,
    receiver: Mutex<mpsc::Receiver<Batch>>,
}

impl BatchQueue {
    #[must_use]
    pub fn new(split: Split, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            split,
            capacity,
            sender: Mutex::new(Some(tx)),
            receiver: Mutex::new(rx),
        }
    }

    #[must_use]
    pub fn split(&self) -> Split {
        self.split
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// A new producer handle. Fails once the queue is sealed.
    pub fn sender(&self) -> TrainingResult<mpsc::Sender<Batch>> {
        let guard = self
            .sender
            .lock()
            .map_err(|_| TrainingError::backend("batch queue lock poisoned"))?;
        guard
            .as_ref()
            .cloned()
            .ok_or_else(|| TrainingError::QueueClosed(format!("{} queue is sealed", self.split)))
    }

    /// Drop the queue's own sender; from now on only workers keep it open.
    pub fn seal(&self) {
        if let Ok(mut guard) = self.sender.lock() {
            guard.take();
        }
    }

    /// Block until a batch is available.
    ///
    /// Must be called from a thread outside the async runtime's workers (the scheduler's
    /// blocking thread, or a plain thread in tests).
    pub fn dequeue(&self) -> TrainingResult<Batch> {
        let mut rx = self
            .receiver
            .lock()
            .map_err(|_| TrainingError::backend("batch queue lock poisoned"))?;
        rx.blocking_recv().ok_or_else(|| {
            TrainingError::QueueClosed(format!("{} queue has no producers left", self.split))
        })
    }

    /// Refuse further batches. Workers blocked on a full queue wake up and exit.
    pub fn close(&self) {
        self.seal();
        if let Ok(mut rx) = self.receiver.lock() {
            rx.close();
        }
    }
}

struct Worker {
    name: String,
    handle: JoinHandle<TrainingResult<()>>,
}

/// Outcome of joining the feeder workers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub joined: usize,
    pub timed_out: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ShutdownReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.timed_out.is_empty() && self.failed.is_empty()
    }
}

/// Owner of the background workers and their cancellation token.
pub struct Coordinator {
    token: CancellationToken,
    runtime: Handle,
    workers: Vec<Worker>,
}

impl Coordinator {
    /// The coordinator's token is a child of `parent`: an external stop reaches the
    /// workers, while [`request_stop`](Self::request_stop) stays local to this run.
    #[must_use]
    pub fn new(parent: &CancellationToken, runtime: Handle) -> Self {
        Self { token: parent.child_token(), runtime, workers: Vec::new() }
    }

    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Run `work` on a blocking thread; it receives the cancellation token to poll.
    pub fn spawn<F>(&mut self, name: impl Into<String>, work: F)
    where
        F: FnOnce(CancellationToken) -> TrainingResult<()> + Send + 'static,
    {
        let name = name.into();
        let token = self.token.clone();
        debug!(worker = %name, "Starting feeder worker");
        let handle = self.runtime.spawn_blocking(move || work(token));
        self.workers.push(Worker { name, handle });
    }

    /// Drive `producer` into `queue` until it is exhausted, the queue closes or a stop is
    /// requested.
    pub fn spawn_producer(
        &mut self,
        name: impl Into<String>,
        queue: &BatchQueue,
        mut producer: Box<dyn BatchProducer>,
    ) -> TrainingResult<()> {
        let sender = queue.sender()?;
        let name = name.into();
        let worker = name.clone();
        self.spawn(name, move |token| {
            loop {
                if token.is_cancelled() {
                    return Ok(());
                }
                let batch = match producer.next_batch() {
                    Ok(Some(batch)) => batch,
                    Ok(None) => return Ok(()),
                    Err(e) => {
                        error!(worker = %worker, "Feeder worker failed: {e}");
                        return Err(e);
                    }
                };
                if sender.blocking_send(batch).is_err() {
                    return Ok(());
                }
            }
        });
        Ok(())
    }

    pub fn request_stop(&self) {
        self.token.cancel();
    }

    /// Cancel and join every worker, waiting at most `timeout` overall.
    pub async fn join(self, timeout: Duration) -> ShutdownReport {
        self.token.cancel();
        let deadline = tokio::time::Instant::now() + timeout;
        let waits = self.workers.into_iter().map(|worker| async move {
            let outcome = tokio::time::timeout_at(deadline, worker.handle).await;
            (worker.name, outcome)
        });

        let mut report = ShutdownReport::default();
        for (name, outcome) in join_all(waits).await {
            match outcome {
                Ok(Ok(Ok(()))) => report.joined += 1,
                Ok(Ok(Err(e))) => report.failed.push((name, e.to_string())),
                Ok(Err(join_error)) => report.failed.push((name, join_error.to_string())),
                Err(_) => {
                    warn!(worker = %name, "Feeder worker did not stop within {timeout:?}");
                    report.timed_out.push(name);
                }
            }
        }
        report
    }
}
