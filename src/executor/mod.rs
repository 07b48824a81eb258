//! A dedicated sequential executor.
//!
//! Jobs run one at a time, strictly in submission order, on tokio's blocking pool so a long running job
//! never stalls the runtime workers. A job only starts once the previous one returned.
//!
//! This is what serializes cluster state transitions: the drain work of a transition can never be
//! reordered with the drain work of a later one.
use std::sync::{Mutex, PoisonError};

use tokio::{
    runtime::Handle,
    sync::{
        mpsc::{unbounded_channel, UnboundedSender},
        oneshot,
    },
    task::JoinHandle,
};
use tracing::{event, Level};

use crate::error::{Error, Result};

type Job = Box<dyn FnOnce() + Send + 'static>;

pub struct SequentialExecutor {
    name: &'static str,
    sender: Mutex<Option<UnboundedSender<Job>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SequentialExecutor {
    /// Starts the executor on the current tokio runtime.
    ///
    /// # Errors
    /// Returns [`Error::ExecutorUnavailable`] if called outside of a tokio runtime
    pub fn new(name: &'static str) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|e| Error::ExecutorUnavailable {
            reason: format!("{} needs a tokio runtime: {}", name, e),
        })?;

        let (sender, mut receiver) = unbounded_channel::<Job>();
        let worker = runtime.spawn(async move {
            while let Some(job) = receiver.recv().await {
                if let Err(err) = tokio::task::spawn_blocking(job).await {
                    event!(Level::ERROR, "{} job failed: {}", name, err);
                }
            }
            event!(Level::DEBUG, "{} stopped", name);
        });

        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Enqueues a job.
    ///
    /// # Errors
    /// Returns [`Error::ExecutorUnavailable`] once the executor was shut down
    pub fn execute<F>(&self, job: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let sender = guard.as_ref().ok_or_else(|| Error::ExecutorUnavailable {
            reason: format!("{} is shut down", self.name),
        })?;

        sender
            .send(Box::new(job))
            .map_err(|_| Error::ExecutorUnavailable {
                reason: format!("{} worker is gone", self.name),
            })
    }

    /// Waits until every job enqueued before this call has finished
    pub async fn sync(&self) -> Result<()> {
        let (done_sender, done_receiver) = oneshot::channel();
        self.execute(move || {
            let _ = done_sender.send(());
        })?;

        done_receiver.await.map_err(|_| Error::ExecutorUnavailable {
            reason: format!("{} dropped a sync job", self.name),
        })
    }

    /// Stops accepting jobs. Jobs already enqueued still run.
    pub fn shutdown(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }

    /// Shuts down and waits for the queued jobs to finish
    pub async fn join(&self) {
        self.shutdown();
        let worker = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(worker) = worker {
            if let Err(err) = worker.await {
                event!(Level::WARN, "{} worker ended abnormally: {}", self.name, err);
            }
        }
    }
}
