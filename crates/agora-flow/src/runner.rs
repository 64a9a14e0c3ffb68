//! Background job runner.
//!
//! Pulls due jobs from the durable queue one at a time and hands each to the
//! dispatcher on its own tokio task, gated by a semaphore so worker
//! concurrency stays bounded. Because jobs are rows enqueued inside the
//! admission transaction, a process restart resumes exactly where it
//! stopped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::counter;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;

use agora_store::{Job, JobKind, Store};

use crate::dispatcher::Dispatcher;

/// Runner tuning knobs.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum jobs executing at once.
    pub concurrency: usize,
    /// How often the queue is polled for due jobs.
    pub poll_interval: Duration,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            poll_interval: Duration::from_millis(250),
        }
    }
}

/// Consumes the durable job queue.
pub struct Runner {
    store: Store,
    dispatcher: Arc<Dispatcher>,
    config: RunnerConfig,
}

/// Handle to a started runner; signals shutdown and joins the loop.
pub struct RunnerHandle {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl RunnerHandle {
    /// Signals the loop to stop after the current poll.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    /// Signals shutdown and waits for the loop to exit.
    pub async fn join(self) {
        let _ = self.shutdown.send(true);
        let _ = self.handle.await;
    }
}

impl Runner {
    /// Creates a runner over the given store and dispatcher.
    #[must_use]
    pub fn new(store: Store, dispatcher: Arc<Dispatcher>, config: RunnerConfig) -> Self {
        Self {
            store,
            dispatcher,
            config,
        }
    }

    /// Starts the polling loop on a background task.
    #[must_use]
    pub fn start(self) -> RunnerHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(self.run(shutdown_rx));
        RunnerHandle { shutdown, handle }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            concurrency = self.config.concurrency,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "background runner started"
        );
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut tick = tokio::time::interval(self.config.poll_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = tick.tick() => self.drain_due(&semaphore).await,
            }
        }
        tracing::info!("background runner stopped");
    }

    /// Claims every currently-due job, spawning each behind the semaphore.
    async fn drain_due(&self, semaphore: &Arc<Semaphore>) {
        loop {
            let job = match self.store.claim_due_job(Utc::now()) {
                Ok(Some(job)) => job,
                Ok(None) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "job claim failed");
                    return;
                }
            };

            let Ok(permit) = Arc::clone(semaphore).acquire_owned().await else {
                return;
            };
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                let _permit = permit;
                counter!("agora_jobs_executed_total").increment(1);
                if let Err(e) = execute(&dispatcher, job).await {
                    tracing::error!(error = %e, "background job failed");
                }
            });
        }
    }
}

async fn execute(dispatcher: &Dispatcher, job: Job) -> agora_core::Result<()> {
    tracing::debug!(job_id = %job.id, task_id = %job.task_id, kind = job.kind.as_str(), "running job");
    match job.kind {
        JobKind::Dispatch { exclude_agent_id } => {
            dispatcher.dispatch(job.task_id, exclude_agent_id).await
        }
        JobKind::DeadlineCheck { worker_agent_id } => {
            dispatcher.deadline_expired(job.task_id, worker_agent_id).await
        }
    }
}
