//! Task dispatch orchestration.
//!
//! The dispatcher owns the lifecycle between admission and a terminal state:
//!
//! 1. [`Dispatcher::admit`] — lock credits, persist the task in `matching`,
//!    and enqueue a dispatch job, all in one transaction
//! 2. [`Dispatcher::dispatch`] — select a worker, deliver the webhook, arm a
//!    deadline watcher, and walk the fallback chain on failure
//! 3. [`Dispatcher::settle_result`] — settle or refund on worker callback
//! 4. [`Dispatcher::deadline_expired`] — fail tasks whose worker never
//!    called back, then fall back
//!
//! The callback/deadline race is resolved by compare-and-swap on task status:
//! whichever side transitions out of `in_progress` first wins and the loser
//! no-ops.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use metrics::counter;
use serde::Serialize;
use serde_json::Value;

use agora_core::task::MAX_RETRIES;
use agora_core::{
    AccountId, Agent, AgentId, Error, OutputStatus, Result, Task, TaskId, TaskStatus,
};
use agora_store::{CasResult, Job, Store};

use crate::escrow;
use crate::matchmaker::Matchmaker;
use crate::registry::SchemaRegistry;

/// Connect/send timeout for worker webhook delivery.
const DISPATCH_TIMEOUT: Duration = Duration::from_secs(5);

/// The body POSTed to a worker's endpoint.
#[derive(Debug, Serialize)]
struct DispatchPayload<'a> {
    task_id: TaskId,
    capability: &'a str,
    input_payload: &'a Value,
    callback_url: String,
    deadline: DateTime<Utc>,
}

/// A worker callback body, decoded by the API layer.
#[derive(Debug, Clone)]
pub struct ResultSubmission {
    /// The produced output payload.
    pub output_payload: Value,
    /// Worker-reported outcome.
    pub output_status: OutputStatus,
    /// Credits the worker charges; `0` falls back to the full budget.
    pub actual_cost: i64,
}

/// Orchestrates matching, webhook delivery, deadline monitoring, fallback,
/// and settlement.
#[derive(Clone)]
pub struct Dispatcher {
    store: Store,
    registry: Arc<SchemaRegistry>,
    matchmaker: Matchmaker,
    http: reqwest::Client,
    callback_base_url: String,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("callback_base_url", &self.callback_base_url)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Creates a dispatcher with the shared 5-second webhook client.
    #[must_use]
    pub fn new(store: Store, registry: Arc<SchemaRegistry>, callback_base_url: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(DISPATCH_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            matchmaker: Matchmaker::new(store.clone()),
            store,
            registry,
            http,
            callback_base_url: callback_base_url.into(),
        }
    }

    /// Admits a validated task: locks the budget, persists the task in
    /// `matching`, and enqueues an immediate dispatch job — one transaction,
    /// so no partial admission is observable.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientFunds` when the requester cannot cover the
    /// budget; nothing is persisted in that case.
    pub fn admit(&self, task: &mut Task, requester_account: AccountId) -> Result<()> {
        task.status = TaskStatus::Matching;
        self.store.with_tx(|tx| {
            escrow::lock_credits(tx, requester_account, task.id, task.budget)?;
            tx.insert_task(task)?;
            tx.enqueue_job(&Job::dispatch(task.id, None))
        })?;
        counter!("agora_tasks_admitted_total").increment(1);
        tracing::info!(task_id = %task.id, capability = %task.capability, budget = task.budget, "task admitted");
        Ok(())
    }

    /// Runs the dispatch chain for a task in `matching`.
    ///
    /// Attempts workers in preference order; a worker that refuses or cannot
    /// be reached consumes one retry and is excluded from the next
    /// selection. When retries are exhausted or no candidate exists, the
    /// task fails and the budget is refunded.
    ///
    /// # Errors
    ///
    /// Returns storage or registry errors; webhook failures are handled by
    /// the fallback chain instead of being surfaced.
    pub async fn dispatch(&self, task_id: TaskId, mut exclude: Option<AgentId>) -> Result<()> {
        loop {
            let mut task = self.store.get_task(task_id)?;
            if task.status != TaskStatus::Matching {
                tracing::debug!(task_id = %task_id, status = %task.status, "dispatch skipped");
                return Ok(());
            }

            let worker = match exclude {
                None => self.matchmaker.find_best(&task)?,
                Some(failed) => self
                    .matchmaker
                    .find_fallbacks(&task, failed)?
                    .into_iter()
                    .next(),
            };
            let Some(worker) = worker else {
                tracing::warn!(task_id = %task_id, "no workers available");
                counter!("agora_tasks_unmatched_total").increment(1);
                return self.fail_and_refund(&task);
            };

            if self.attempt(&mut task, &worker).await? {
                return Ok(());
            }

            // Worker refused or was unreachable; consume one retry.
            task.retry_count += 1;
            if task.retries_exhausted() {
                return self.fail_and_refund(&task);
            }
            task.status = TaskStatus::Matching;
            let reset = self.store.with_tx(|tx| {
                // The assigned worker may still have settled the task after
                // refusing the webhook; never resurrect a terminal task.
                if tx.get_task(task.id)?.status != TaskStatus::Dispatched {
                    return Ok(false);
                }
                tx.update_task(&task)?;
                Ok(true)
            })?;
            if !reset {
                tracing::debug!(task_id = %task_id, "task settled during fallback");
                return Ok(());
            }
            exclude = Some(worker.id);
        }
    }

    /// Delivers one webhook. Returns true when the worker accepted (2xx).
    async fn attempt(&self, task: &mut Task, worker: &Agent) -> Result<bool> {
        let window = self
            .registry
            .deadline(&task.capability, &task.input_payload)?;
        let deadline = Utc::now()
            + chrono::Duration::from_std(window)
                .map_err(|e| Error::internal(format!("deadline out of range: {e}")))?;

        task.worker_agent_id = Some(worker.id);
        task.deadline = Some(deadline);
        task.status = TaskStatus::Dispatched;
        self.store.update_task(task)?;

        let payload = DispatchPayload {
            task_id: task.id,
            capability: &task.capability,
            input_payload: &task.input_payload,
            callback_url: format!("{}/v1/tasks/{}/result", self.callback_base_url, task.id),
            deadline,
        };

        let response = self
            .http
            .post(&worker.endpoint_url)
            .json(&payload)
            .send()
            .await;
        let accepted = match response {
            Ok(r) if r.status().is_success() => true,
            Ok(r) => {
                tracing::warn!(
                    task_id = %task.id,
                    worker_id = %worker.id,
                    status = %r.status(),
                    "worker refused dispatch, falling back"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    task_id = %task.id,
                    worker_id = %worker.id,
                    error = %e,
                    "worker dispatch failed, falling back"
                );
                false
            }
        };
        if !accepted {
            counter!("agora_dispatch_fallbacks_total").increment(1);
            return Ok(false);
        }

        // A fast worker may call back before acknowledging the webhook; the
        // CAS keeps that settlement from being overwritten.
        match self
            .store
            .cas_task_status(task.id, TaskStatus::Dispatched, TaskStatus::InProgress)?
        {
            CasResult::Success => {
                task.status = TaskStatus::InProgress;
                self.store
                    .enqueue_job(&Job::deadline_check(task.id, worker.id, deadline))?;
                counter!("agora_tasks_dispatched_total").increment(1);
                tracing::info!(task_id = %task.id, worker_id = %worker.id, deadline = %deadline, "task dispatched");
            }
            CasResult::NotFound => {
                tracing::warn!(task_id = %task.id, "task vanished during dispatch");
            }
            CasResult::StateMismatch { actual } => {
                tracing::debug!(
                    task_id = %task.id,
                    status = %actual,
                    "task settled before dispatch acknowledgement"
                );
            }
        }
        Ok(true)
    }

    /// Fires when a deadline watcher comes due.
    ///
    /// Only a task still `in_progress` is affected; a settled task makes
    /// this a no-op (the callback won the race). The failed worker consumes
    /// one retry and the fallback chain continues without it.
    ///
    /// # Errors
    ///
    /// Returns storage errors from the re-read or refund path.
    pub async fn deadline_expired(&self, task_id: TaskId, failed_worker: AgentId) -> Result<()> {
        let task = match self.store.get_task(task_id) {
            Ok(task) => task,
            Err(Error::NotFound { .. }) => {
                tracing::warn!(task_id = %task_id, "deadline fired for unknown task");
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        if task.status != TaskStatus::InProgress {
            tracing::debug!(task_id = %task_id, status = %task.status, "deadline lost the race");
            return Ok(());
        }

        // The worker consumes one retry; exhausted tasks fail for good,
        // otherwise the fallback chain continues without this worker.
        let exhausted = task.retry_count + 1 > MAX_RETRIES;
        let target = if exhausted {
            TaskStatus::Failed
        } else {
            TaskStatus::Matching
        };
        match self
            .store
            .cas_task_status(task_id, TaskStatus::InProgress, target)?
        {
            CasResult::Success => {}
            CasResult::NotFound => {
                tracing::warn!(task_id = %task_id, "deadline fired for unknown task");
                return Ok(());
            }
            CasResult::StateMismatch { actual } => {
                tracing::debug!(task_id = %task_id, status = %actual, "deadline lost the race");
                return Ok(());
            }
        }

        counter!("agora_deadlines_exceeded_total").increment(1);
        tracing::warn!(task_id = %task_id, worker_id = %failed_worker, "task deadline exceeded");

        let mut task = self.store.get_task(task_id)?;
        task.retry_count += 1;
        task.output_status = Some(OutputStatus::Error);
        self.store.update_task(&task)?;

        if exhausted {
            let requester_account = self.store.get_agent(task.requester_agent_id)?.account_id;
            self.store.with_tx(|tx| {
                escrow::refund_failed(tx, task.id, requester_account, task.budget)
            })?;
            counter!("agora_tasks_failed_total").increment(1);
            tracing::warn!(task_id = %task_id, retries = task.retry_count, "task failed, budget refunded");
            return Ok(());
        }
        self.dispatch(task_id, Some(failed_worker)).await
    }

    /// Settles a worker callback.
    ///
    /// The caller must be the assigned worker and the task must still accept
    /// results. Output is soft-validated; a diagnostic never blocks
    /// settlement. Payable outcomes settle the ledger and complete the task
    /// in one transaction; an error outcome refunds.
    ///
    /// # Errors
    ///
    /// - `Forbidden` when the caller is not the assigned worker
    /// - `Conflict` when the task is already terminal or not yet dispatched
    /// - `NotFound` when the task does not exist
    pub fn settle_result(
        &self,
        task_id: TaskId,
        caller_agent: AgentId,
        submission: &ResultSubmission,
    ) -> Result<Task> {
        let task = self.store.get_task(task_id)?;
        if !task.status.accepts_result() {
            return Err(Error::conflict(format!(
                "task is {}, not accepting results",
                task.status
            )));
        }
        let Some(worker_id) = task.worker_agent_id else {
            return Err(Error::conflict("task has no assigned worker"));
        };
        if caller_agent != worker_id {
            return Err(Error::forbidden("caller is not the assigned worker"));
        }

        if let Some(diagnostic) =
            self.registry
                .validate_output(&task.capability, &submission.output_payload)
        {
            tracing::warn!(task_id = %task_id, diagnostic = %diagnostic, "output failed soft validation");
            counter!("agora_output_validation_flags_total").increment(1);
        }

        let requester_account = self.store.get_agent(task.requester_agent_id)?.account_id;
        let worker_account = self.store.get_agent(worker_id)?.account_id;

        let settled = self.store.with_tx(|tx| {
            // Re-read under the transaction: the deadline watcher may have
            // won the race since the pre-check above.
            let mut task = tx.get_task(task_id)?;
            if !task.status.accepts_result() {
                return Err(Error::conflict(format!(
                    "task is {}, not accepting results",
                    task.status
                )));
            }

            task.output_payload = Some(submission.output_payload.clone());
            task.output_status = Some(submission.output_status);

            if submission.output_status.is_payable() {
                let effective_cost = if submission.actual_cost > 0 {
                    submission.actual_cost.min(task.budget)
                } else {
                    task.budget
                };
                let settlement = escrow::settle_task(
                    tx,
                    task.id,
                    requester_account,
                    worker_account,
                    task.budget,
                    effective_cost,
                )?;
                task.actual_cost = Some(effective_cost);
                task.platform_fee = Some(settlement.platform_fee);
                task.status = TaskStatus::Completed;
            } else {
                escrow::refund_failed(tx, task.id, requester_account, task.budget)?;
                task.actual_cost = Some(0);
                task.status = TaskStatus::Failed;
            }

            tx.update_task(&task)?;
            Ok(task)
        })?;

        // The armed deadline watcher would no-op anyway; dropping it keeps
        // the queue small.
        let _ = self.store.cancel_jobs_for_task(task_id);

        if settled.status == TaskStatus::Completed {
            counter!("agora_tasks_completed_total").increment(1);
        } else {
            counter!("agora_tasks_failed_total").increment(1);
        }
        tracing::info!(task_id = %task_id, status = %settled.status, "task settled");
        self.refresh_worker_stats(&settled);
        Ok(settled)
    }

    /// Marks the task failed and returns the full budget to the requester.
    ///
    /// No-ops when the task already reached a terminal state (e.g. a
    /// callback settled it concurrently), so the refund cannot double up.
    fn fail_and_refund(&self, task: &Task) -> Result<()> {
        let requester_account = self.store.get_agent(task.requester_agent_id)?.account_id;
        let refunded = self.store.with_tx(|tx| {
            let mut current = tx.get_task(task.id)?;
            if current.status.is_terminal() {
                return Ok(false);
            }
            current.status = TaskStatus::Failed;
            current.retry_count = task.retry_count;
            if current.output_status.is_none() {
                current.output_status = Some(OutputStatus::Error);
            }
            tx.update_task(&current)?;
            escrow::refund_failed(tx, current.id, requester_account, current.budget)?;
            Ok(true)
        })?;
        if refunded {
            counter!("agora_tasks_failed_total").increment(1);
            tracing::warn!(task_id = %task.id, retries = task.retry_count, "task failed, budget refunded");
        } else {
            tracing::debug!(task_id = %task.id, "task already terminal, refund skipped");
        }
        Ok(())
    }

    /// Rolls observed response time and compliance into the worker's
    /// profile. Stats aggregation is not persisted yet; the settlement
    /// itself never depends on it.
    fn refresh_worker_stats(&self, task: &Task) {
        tracing::info!(
            worker_agent_id = ?task.worker_agent_id,
            task_id = %task.id,
            output_status = ?task.output_status,
            "worker stats refresh"
        );
    }
}
