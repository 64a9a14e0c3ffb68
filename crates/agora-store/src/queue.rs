//! Durable background jobs.
//!
//! Dispatch attempts and deadline watchers are persisted rows, not
//! fire-and-forget spawns: each job has an identity, a due time, and can be
//! listed or cancelled. Dispatch jobs are enqueued inside the transaction
//! that admits the task, so admission and execution are atomic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use agora_core::{AgentId, JobId, TaskId};

/// What a queued job does when it becomes due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Attempt to match and dispatch the task.
    Dispatch {
        /// Worker to exclude from selection (the one that just failed).
        #[serde(skip_serializing_if = "Option::is_none")]
        exclude_agent_id: Option<AgentId>,
    },
    /// Check whether the assigned worker called back before the deadline.
    DeadlineCheck {
        /// The worker the deadline was armed against.
        worker_agent_id: AgentId,
    },
}

impl JobKind {
    /// Returns the constrained string stored in the `kind` column.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatch { .. } => "dispatch",
            Self::DeadlineCheck { .. } => "deadline_check",
        }
    }
}

/// A durable queue entry handed to the background runner when due.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier.
    pub id: JobId,
    /// The task this job operates on.
    pub task_id: TaskId,
    /// What to do when due.
    pub kind: JobKind,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    /// Enqueue time.
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Creates a dispatch job due immediately.
    #[must_use]
    pub fn dispatch(task_id: TaskId, exclude_agent_id: Option<AgentId>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::generate(),
            task_id,
            kind: JobKind::Dispatch { exclude_agent_id },
            run_at: now,
            created_at: now,
        }
    }

    /// Creates a deadline watcher due at `fire_at`.
    #[must_use]
    pub fn deadline_check(
        task_id: TaskId,
        worker_agent_id: AgentId,
        fire_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::generate(),
            task_id,
            kind: JobKind::DeadlineCheck { worker_agent_id },
            run_at: fire_at,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_serializes_with_tag() {
        let kind = JobKind::Dispatch {
            exclude_agent_id: None,
        };
        let json = serde_json::to_string(&kind).expect("serialize");
        assert_eq!(json, r#"{"kind":"dispatch"}"#);

        let parsed: JobKind = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, kind);
    }

    #[test]
    fn deadline_check_carries_worker() {
        let worker = AgentId::generate();
        let job = Job::deadline_check(TaskId::generate(), worker, Utc::now());
        assert_eq!(job.kind.as_str(), "deadline_check");
        let JobKind::DeadlineCheck { worker_agent_id } = job.kind else {
            panic!("wrong kind");
        };
        assert_eq!(worker_agent_id, worker);
    }

    #[test]
    fn dispatch_jobs_are_due_immediately() {
        let job = Job::dispatch(TaskId::generate(), None);
        assert!(job.run_at <= Utc::now());
    }
}
