//! The `SQLite`-backed store and its transactional API.
//!
//! All access goes through [`Store`], which owns the connection behind a
//! mutex. Multi-statement operations run inside [`Store::with_tx`], which
//! opens an `IMMEDIATE` transaction: combined with the connection mutex this
//! gives the row-exclusivity the ledger requires. Single reads and writes use
//! the autocommit wrappers.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde_json::Value;

use agora_core::{
    Account, AccountId, Agent, AgentId, Availability, AgentRole, EntryKind, Error, LedgerEntry,
    OutputStatus, Result, RoutingPreference, Task, TaskId, TaskStatus,
};

use crate::migrations;
use crate::queue::{Job, JobKind};

/// Result of a compare-and-swap on task status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasResult {
    /// The transition was applied.
    Success,
    /// The task does not exist.
    NotFound,
    /// The task was not in the expected status.
    StateMismatch {
        /// The status that was actually found.
        actual: TaskStatus,
    },
}

impl CasResult {
    /// Returns true if the transition was applied.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Handle to the relational store.
///
/// Cheap to clone; all clones share one connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

/// An open `IMMEDIATE` transaction.
///
/// Obtained through [`Store::with_tx`]; commits when the closure returns
/// `Ok`, rolls back on error.
pub struct StoreTx<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl Store {
    /// Opens (creating if needed) a database file and runs migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or migrations fail.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path).map_err(db_err)?;
        // journal_mode returns the resulting mode as a row.
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))
            .map_err(db_err)?;
        Self::bootstrap(conn)
    }

    /// Opens an in-memory database (tests, debug mode).
    ///
    /// # Errors
    ///
    /// Returns an error if migrations fail.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        Self::bootstrap(conn)
    }

    fn bootstrap(conn: Connection) -> Result<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))
            .map_err(db_err)?;
        conn.pragma_update(None, "foreign_keys", "ON").map_err(db_err)?;
        migrations::init_schema(&conn).map_err(db_err)?;
        migrations::seed_system_accounts(&conn).map_err(db_err)?;
        tracing::debug!("store schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::internal("store connection lock poisoned"))
    }

    /// Runs `f` inside one `IMMEDIATE` transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back
    /// otherwise, so no partial admission or settlement is observable.
    ///
    /// # Errors
    ///
    /// Returns the closure's error, or a storage error from begin/commit.
    pub fn with_tx<T>(&self, f: impl FnOnce(&StoreTx<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(db_err)?;
        let store_tx = StoreTx { tx };
        let out = f(&store_tx)?;
        store_tx.tx.commit().map_err(db_err)?;
        Ok(out)
    }

    // --- Accounts ---

    /// Inserts an account row.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the id already exists.
    pub fn insert_account(&self, account: &Account) -> Result<()> {
        insert_account(&*self.lock()?, account)
    }

    /// Fetches an account by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such account exists.
    pub fn get_account(&self, id: AccountId) -> Result<Account> {
        get_account(&*self.lock()?, id)
    }

    /// Sums all account balances (credit conservation checks).
    ///
    /// # Errors
    ///
    /// Returns a storage error on query failure.
    pub fn sum_balances(&self) -> Result<i64> {
        self.lock()?
            .query_row("SELECT COALESCE(SUM(credit_balance), 0) FROM accounts", [], |r| {
                r.get(0)
            })
            .map_err(db_err)
    }

    // --- Agents ---

    /// Inserts an agent row.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the id already exists.
    pub fn insert_agent(&self, agent: &Agent) -> Result<()> {
        insert_agent(&*self.lock()?, agent)
    }

    /// Fetches an agent by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such agent exists.
    pub fn get_agent(&self, id: AgentId) -> Result<Agent> {
        get_agent(&*self.lock()?, id)
    }

    /// Lists online workers advertising `capability`, excluding system
    /// accounts, in store insertion order.
    ///
    /// # Errors
    ///
    /// Returns a storage error on query failure.
    pub fn find_available_workers(&self, capability: &str) -> Result<Vec<Agent>> {
        find_available_workers(&*self.lock()?, capability)
    }

    // --- API keys ---

    /// Registers an API key hash resolving to an account and optional agent.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the hash already exists.
    pub fn insert_api_key(
        &self,
        key_hash: &str,
        account_id: AccountId,
        agent_id: Option<AgentId>,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO api_keys (key_hash, account_id, agent_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                key_hash,
                account_id.to_string(),
                agent_id.map(|id| id.to_string()),
                fmt_ts(Utc::now())
            ],
        )
        .map_err(db_err)?;
        Ok(())
    }

    /// Resolves an API key hash to its principal, if registered.
    ///
    /// # Errors
    ///
    /// Returns a storage error on query failure.
    pub fn resolve_api_key(&self, key_hash: &str) -> Result<Option<(Account, Option<Agent>)>> {
        let conn = self.lock()?;
        let ids: Option<(String, Option<String>)> = conn
            .query_row(
                "SELECT account_id, agent_id FROM api_keys WHERE key_hash = ?1",
                params![key_hash],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .map_err(db_err)?;
        let Some((account_id, agent_id)) = ids else {
            return Ok(None);
        };
        let account = get_account(&conn, parse_account_id(&account_id)?)?;
        let agent = agent_id
            .map(|id| get_agent(&conn, parse_agent_id(&id)?))
            .transpose()?;
        Ok(Some((account, agent)))
    }

    // --- Tasks ---

    /// Fetches a task by id.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such task exists.
    pub fn get_task(&self, id: TaskId) -> Result<Task> {
        get_task(&*self.lock()?, id)
    }

    /// Updates the mutable columns of a task row.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the task does not exist.
    pub fn update_task(&self, task: &Task) -> Result<()> {
        update_task(&*self.lock()?, task)
    }

    /// Atomically transitions task status if the current status matches.
    ///
    /// This is the primitive that resolves the callback/deadline race: the
    /// loser observes `StateMismatch` and must no-op.
    ///
    /// # Errors
    ///
    /// Returns a storage error on query failure.
    pub fn cas_task_status(
        &self,
        id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<CasResult> {
        self.with_tx(|tx| tx.cas_task_status(id, expected, next))
    }

    /// Lists tasks whose requester or assigned worker agent belongs to
    /// `account_id`, newest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error on query failure.
    pub fn list_tasks_for_account(&self, account_id: AccountId) -> Result<Vec<Task>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT t.id, t.requester_agent_id, t.worker_agent_id, t.capability,
                        t.input_payload, t.output_payload, t.output_status, t.status,
                        t.budget, t.actual_cost, t.platform_fee, t.routing_preference,
                        t.deadline, t.retry_count, t.created_at, t.updated_at
                 FROM tasks t
                 JOIN agents r ON r.id = t.requester_agent_id
                 LEFT JOIN agents w ON w.id = t.worker_agent_id
                 WHERE r.account_id = ?1 OR w.account_id = ?1
                 ORDER BY t.created_at DESC, t.rowid DESC",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![account_id.to_string()], map_task)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    // --- Ledger ---

    /// Lists ledger entries for a task, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error on query failure.
    pub fn entries_for_task(&self, task_id: TaskId) -> Result<Vec<LedgerEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, account_id, task_id, entry_kind, amount, balance_after, created_at
                 FROM credit_ledger WHERE task_id = ?1 ORDER BY created_at, rowid",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![task_id.to_string()], map_entry)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Lists ledger entries for an account, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error on query failure.
    pub fn entries_for_account(&self, account_id: AccountId) -> Result<Vec<LedgerEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT id, account_id, task_id, entry_kind, amount, balance_after, created_at
                 FROM credit_ledger WHERE account_id = ?1 ORDER BY created_at, rowid",
            )
            .map_err(db_err)?;
        let rows = stmt
            .query_map(params![account_id.to_string()], map_entry)
            .map_err(db_err)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)
    }

    /// Sums `escrow_lock` amounts for an account since `since`.
    ///
    /// # Errors
    ///
    /// Returns a storage error on query failure.
    pub fn locked_since(&self, account_id: AccountId, since: DateTime<Utc>) -> Result<i64> {
        self.lock()?
            .query_row(
                "SELECT COALESCE(SUM(amount), 0) FROM credit_ledger
                 WHERE account_id = ?1 AND entry_kind = 'escrow_lock' AND created_at >= ?2",
                params![account_id.to_string(), fmt_ts(since)],
                |r| r.get(0),
            )
            .map_err(db_err)
    }

    // --- Job queue ---

    /// Enqueues a job outside any caller transaction.
    ///
    /// # Errors
    ///
    /// Returns a storage error on insert failure.
    pub fn enqueue_job(&self, job: &Job) -> Result<()> {
        enqueue_job(&*self.lock()?, job)
    }

    /// Claims (removes and returns) the oldest job due at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns a storage error on query failure.
    pub fn claim_due_job(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        self.with_tx(|tx| tx.claim_due_job(now))
    }

    /// Removes all queued jobs for a task; returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns a storage error on delete failure.
    pub fn cancel_jobs_for_task(&self, task_id: TaskId) -> Result<usize> {
        self.lock()?
            .execute(
                "DELETE FROM dispatch_jobs WHERE task_id = ?1",
                params![task_id.to_string()],
            )
            .map_err(db_err)
    }

    /// Counts queued jobs (due or not).
    ///
    /// # Errors
    ///
    /// Returns a storage error on query failure.
    pub fn pending_job_count(&self) -> Result<i64> {
        self.lock()?
            .query_row("SELECT COUNT(*) FROM dispatch_jobs", [], |r| r.get(0))
            .map_err(db_err)
    }
}

impl StoreTx<'_> {
    /// Fetches an account, holding it exclusively for the transaction.
    ///
    /// The `IMMEDIATE` transaction already holds the writer lock, so the row
    /// cannot change underneath the caller.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such account exists.
    pub fn account_for_update(&self, id: AccountId) -> Result<Account> {
        get_account(&self.tx, id)
    }

    /// Conditionally deducts `amount`; returns the new balance, or `None`
    /// when the balance cannot cover it (no row is changed).
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such account exists.
    pub fn try_deduct_credits(&self, id: AccountId, amount: i64) -> Result<Option<i64>> {
        let changed = self
            .tx
            .execute(
                "UPDATE accounts
                 SET credit_balance = credit_balance - ?1, updated_at = ?2
                 WHERE id = ?3 AND credit_balance >= ?1",
                params![amount, fmt_ts(Utc::now()), id.to_string()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            // Distinguish a missing account from an uncovered deduction.
            get_account(&self.tx, id)?;
            return Ok(None);
        }
        Ok(Some(get_account(&self.tx, id)?.credit_balance))
    }

    /// Adds `amount` to the account balance; returns the new balance.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such account exists.
    pub fn add_credits(&self, id: AccountId, amount: i64) -> Result<i64> {
        let changed = self
            .tx
            .execute(
                "UPDATE accounts
                 SET credit_balance = credit_balance + ?1, updated_at = ?2
                 WHERE id = ?3",
                params![amount, fmt_ts(Utc::now()), id.to_string()],
            )
            .map_err(db_err)?;
        if changed == 0 {
            return Err(Error::not_found("account", id));
        }
        Ok(get_account(&self.tx, id)?.credit_balance)
    }

    /// Appends a ledger entry.
    ///
    /// # Errors
    ///
    /// Returns a storage error on insert failure.
    pub fn insert_entry(&self, entry: &LedgerEntry) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO credit_ledger
                    (id, account_id, task_id, entry_kind, amount, balance_after, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    entry.id.to_string(),
                    entry.account_id.to_string(),
                    entry.task_id.map(|id| id.to_string()),
                    entry.kind.as_str(),
                    entry.amount,
                    entry.balance_after,
                    fmt_ts(entry.created_at)
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Inserts a task row.
    ///
    /// # Errors
    ///
    /// Returns `Conflict` if the id already exists.
    pub fn insert_task(&self, task: &Task) -> Result<()> {
        self.tx
            .execute(
                "INSERT INTO tasks
                    (id, requester_agent_id, worker_agent_id, capability, input_payload,
                     output_payload, output_status, status, budget, actual_cost,
                     platform_fee, routing_preference, deadline, retry_count,
                     created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
                params![
                    task.id.to_string(),
                    task.requester_agent_id.to_string(),
                    task.worker_agent_id.map(|id| id.to_string()),
                    task.capability,
                    task.input_payload.to_string(),
                    task.output_payload.as_ref().map(Value::to_string),
                    task.output_status.map(OutputStatus::as_str),
                    task.status.as_str(),
                    task.budget,
                    task.actual_cost,
                    task.platform_fee,
                    task.routing_preference.as_str(),
                    task.deadline.map(fmt_ts),
                    task.retry_count,
                    fmt_ts(task.created_at),
                    fmt_ts(task.updated_at)
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    /// Fetches a task within the transaction.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if no such task exists.
    pub fn get_task(&self, id: TaskId) -> Result<Task> {
        get_task(&self.tx, id)
    }

    /// Updates the mutable columns of a task row.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the task does not exist.
    pub fn update_task(&self, task: &Task) -> Result<()> {
        update_task(&self.tx, task)
    }

    /// Compare-and-swap on task status within the transaction.
    ///
    /// # Errors
    ///
    /// Returns a storage error on query failure.
    pub fn cas_task_status(
        &self,
        id: TaskId,
        expected: TaskStatus,
        next: TaskStatus,
    ) -> Result<CasResult> {
        let status: Option<String> = self
            .tx
            .query_row(
                "SELECT status FROM tasks WHERE id = ?1",
                params![id.to_string()],
                |r| r.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(raw) = status else {
            return Ok(CasResult::NotFound);
        };
        let actual = TaskStatus::parse(&raw)
            .ok_or_else(|| Error::internal(format!("unknown task status in store: {raw}")))?;
        if actual != expected {
            return Ok(CasResult::StateMismatch { actual });
        }
        self.tx
            .execute(
                "UPDATE tasks SET status = ?1, updated_at = ?2 WHERE id = ?3 AND status = ?4",
                params![
                    next.as_str(),
                    fmt_ts(Utc::now()),
                    id.to_string(),
                    expected.as_str()
                ],
            )
            .map_err(db_err)?;
        Ok(CasResult::Success)
    }

    /// Enqueues a job within the transaction (atomic with admission).
    ///
    /// # Errors
    ///
    /// Returns a storage error on insert failure.
    pub fn enqueue_job(&self, job: &Job) -> Result<()> {
        enqueue_job(&self.tx, job)
    }

    /// Claims (removes and returns) the oldest job due at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns a storage error on query failure.
    pub fn claim_due_job(&self, now: DateTime<Utc>) -> Result<Option<Job>> {
        let job = self
            .tx
            .query_row(
                "SELECT id, task_id, payload, run_at, created_at
                 FROM dispatch_jobs
                 WHERE run_at <= ?1 ORDER BY run_at, rowid LIMIT 1",
                params![fmt_ts(now)],
                map_job,
            )
            .optional()
            .map_err(db_err)?;
        let Some(job) = job else {
            return Ok(None);
        };
        self.tx
            .execute(
                "DELETE FROM dispatch_jobs WHERE id = ?1",
                params![job.id.to_string()],
            )
            .map_err(db_err)?;
        Ok(Some(job))
    }
}

// --- Shared row operations ------------------------------------------------

fn insert_account(conn: &Connection, account: &Account) -> Result<()> {
    conn.execute(
        "INSERT INTO accounts
            (id, email, name, credit_balance, max_per_task, max_per_day,
             is_system, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
        params![
            account.id.to_string(),
            account.email,
            account.name,
            account.credit_balance,
            account.max_per_task,
            account.max_per_day,
            account.is_system,
            fmt_ts(account.created_at),
            fmt_ts(account.updated_at)
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn get_account(conn: &Connection, id: AccountId) -> Result<Account> {
    conn.query_row(
        "SELECT id, email, name, credit_balance, max_per_task, max_per_day,
                is_system, created_at, updated_at
         FROM accounts WHERE id = ?1",
        params![id.to_string()],
        map_account,
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| Error::not_found("account", id))
}

fn insert_agent(conn: &Connection, agent: &Agent) -> Result<()> {
    let capabilities = serde_json::to_string(&agent.capabilities_offered)
        .map_err(|e| Error::Serialization {
            message: format!("failed to encode capabilities: {e}"),
        })?;
    conn.execute(
        "INSERT INTO agents
            (id, account_id, role, endpoint_url, capabilities_offered, availability,
             schema_compliance, success_rate, reputation, avg_response_ms,
             created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        params![
            agent.id.to_string(),
            agent.account_id.to_string(),
            agent.role.as_str(),
            agent.endpoint_url,
            capabilities,
            agent.availability.as_str(),
            agent.schema_compliance,
            agent.success_rate,
            agent.reputation,
            agent.avg_response_ms,
            fmt_ts(agent.created_at),
            fmt_ts(agent.updated_at)
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

fn get_agent(conn: &Connection, id: AgentId) -> Result<Agent> {
    conn.query_row(
        "SELECT id, account_id, role, endpoint_url, capabilities_offered, availability,
                schema_compliance, success_rate, reputation, avg_response_ms,
                created_at, updated_at
         FROM agents WHERE id = ?1",
        params![id.to_string()],
        map_agent,
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| Error::not_found("agent", id))
}

fn find_available_workers(conn: &Connection, capability: &str) -> Result<Vec<Agent>> {
    let mut stmt = conn
        .prepare(
            "SELECT a.id, a.account_id, a.role, a.endpoint_url, a.capabilities_offered,
                    a.availability, a.schema_compliance, a.success_rate, a.reputation,
                    a.avg_response_ms, a.created_at, a.updated_at
             FROM agents a
             JOIN accounts acc ON acc.id = a.account_id
             WHERE a.role IN ('worker', 'both')
               AND a.availability = 'online'
               AND acc.is_system = 0
             ORDER BY a.rowid",
        )
        .map_err(db_err)?;
    let rows = stmt.query_map([], map_agent).map_err(db_err)?;
    let agents = rows.collect::<rusqlite::Result<Vec<_>>>().map_err(db_err)?;
    Ok(agents.into_iter().filter(|a| a.offers(capability)).collect())
}

fn get_task(conn: &Connection, id: TaskId) -> Result<Task> {
    conn.query_row(
        "SELECT id, requester_agent_id, worker_agent_id, capability, input_payload,
                output_payload, output_status, status, budget, actual_cost,
                platform_fee, routing_preference, deadline, retry_count,
                created_at, updated_at
         FROM tasks WHERE id = ?1",
        params![id.to_string()],
        map_task,
    )
    .optional()
    .map_err(db_err)?
    .ok_or_else(|| Error::not_found("task", id))
}

fn update_task(conn: &Connection, task: &Task) -> Result<()> {
    let changed = conn
        .execute(
            "UPDATE tasks SET
                worker_agent_id = ?1,
                output_payload = ?2,
                output_status = ?3,
                status = ?4,
                actual_cost = ?5,
                platform_fee = ?6,
                deadline = ?7,
                retry_count = ?8,
                updated_at = ?9
             WHERE id = ?10",
            params![
                task.worker_agent_id.map(|id| id.to_string()),
                task.output_payload.as_ref().map(Value::to_string),
                task.output_status.map(OutputStatus::as_str),
                task.status.as_str(),
                task.actual_cost,
                task.platform_fee,
                task.deadline.map(fmt_ts),
                task.retry_count,
                fmt_ts(Utc::now()),
                task.id.to_string()
            ],
        )
        .map_err(db_err)?;
    if changed == 0 {
        return Err(Error::not_found("task", task.id));
    }
    Ok(())
}

fn enqueue_job(conn: &Connection, job: &Job) -> Result<()> {
    let payload = serde_json::to_string(&job.kind).map_err(|e| Error::Serialization {
        message: format!("failed to encode job payload: {e}"),
    })?;
    conn.execute(
        "INSERT INTO dispatch_jobs (id, task_id, kind, payload, run_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            job.id.to_string(),
            job.task_id.to_string(),
            job.kind.as_str(),
            payload,
            fmt_ts(job.run_at),
            fmt_ts(job.created_at)
        ],
    )
    .map_err(db_err)?;
    Ok(())
}

// --- Row mapping ----------------------------------------------------------

/// Formats a timestamp so lexicographic order matches chronological order.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

#[derive(Debug, thiserror::Error)]
#[error("invalid stored value: {0}")]
struct BadValue(String);

fn invalid(e: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
}

fn parse_ts(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(invalid)
}

fn parse_json(raw: String) -> rusqlite::Result<Value> {
    serde_json::from_str(&raw).map_err(invalid)
}

fn parse_account_id(raw: &str) -> Result<AccountId> {
    raw.parse()
}

fn parse_agent_id(raw: &str) -> Result<AgentId> {
    raw.parse()
}

fn map_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<Account> {
    let id: String = row.get(0)?;
    Ok(Account {
        id: id.parse().map_err(invalid)?,
        email: row.get(1)?,
        name: row.get(2)?,
        credit_balance: row.get(3)?,
        max_per_task: row.get(4)?,
        max_per_day: row.get(5)?,
        is_system: row.get(6)?,
        created_at: parse_ts(row.get(7)?)?,
        updated_at: parse_ts(row.get(8)?)?,
    })
}

fn map_agent(row: &rusqlite::Row<'_>) -> rusqlite::Result<Agent> {
    let id: String = row.get(0)?;
    let account_id: String = row.get(1)?;
    let role: String = row.get(2)?;
    let capabilities: String = row.get(4)?;
    let availability: String = row.get(5)?;
    Ok(Agent {
        id: id.parse().map_err(invalid)?,
        account_id: account_id.parse().map_err(invalid)?,
        role: AgentRole::parse(&role).ok_or_else(|| invalid(BadValue(role)))?,
        endpoint_url: row.get(3)?,
        capabilities_offered: serde_json::from_str(&capabilities).map_err(invalid)?,
        availability: Availability::parse(&availability)
            .ok_or_else(|| invalid(BadValue(availability)))?,
        schema_compliance: row.get(6)?,
        success_rate: row.get(7)?,
        reputation: row.get(8)?,
        avg_response_ms: row.get(9)?,
        created_at: parse_ts(row.get(10)?)?,
        updated_at: parse_ts(row.get(11)?)?,
    })
}

fn map_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let requester: String = row.get(1)?;
    let worker: Option<String> = row.get(2)?;
    let output_payload: Option<String> = row.get(5)?;
    let output_status: Option<String> = row.get(6)?;
    let status: String = row.get(7)?;
    let routing: String = row.get(11)?;
    let deadline: Option<String> = row.get(12)?;
    Ok(Task {
        id: id.parse().map_err(invalid)?,
        requester_agent_id: requester.parse().map_err(invalid)?,
        worker_agent_id: worker.map(|w| w.parse().map_err(invalid)).transpose()?,
        capability: row.get(3)?,
        input_payload: parse_json(row.get(4)?)?,
        output_payload: output_payload.map(parse_json).transpose()?,
        output_status: output_status
            .map(|s| OutputStatus::parse(&s).ok_or_else(|| invalid(BadValue(s))))
            .transpose()?,
        status: TaskStatus::parse(&status).ok_or_else(|| invalid(BadValue(status)))?,
        budget: row.get(8)?,
        actual_cost: row.get(9)?,
        platform_fee: row.get(10)?,
        routing_preference: RoutingPreference::parse(&routing),
        deadline: deadline.map(parse_ts).transpose()?,
        retry_count: row.get(13)?,
        created_at: parse_ts(row.get(14)?)?,
        updated_at: parse_ts(row.get(15)?)?,
    })
}

fn map_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let id: String = row.get(0)?;
    let account_id: String = row.get(1)?;
    let task_id: Option<String> = row.get(2)?;
    let kind: String = row.get(3)?;
    Ok(LedgerEntry {
        id: id.parse().map_err(invalid)?,
        account_id: account_id.parse().map_err(invalid)?,
        task_id: task_id.map(|t| t.parse().map_err(invalid)).transpose()?,
        kind: EntryKind::parse(&kind).ok_or_else(|| invalid(BadValue(kind)))?,
        amount: row.get(4)?,
        balance_after: row.get(5)?,
        created_at: parse_ts(row.get(6)?)?,
    })
}

fn map_job(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    let id: String = row.get(0)?;
    let task_id: String = row.get(1)?;
    let payload: String = row.get(2)?;
    Ok(Job {
        id: id.parse().map_err(invalid)?,
        task_id: task_id.parse().map_err(invalid)?,
        kind: serde_json::from_str::<JobKind>(&payload).map_err(invalid)?,
        run_at: parse_ts(row.get(3)?)?,
        created_at: parse_ts(row.get(4)?)?,
    })
}

fn db_err(e: rusqlite::Error) -> Error {
    match &e {
        rusqlite::Error::SqliteFailure(f, _)
            if matches!(
                f.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ) =>
        {
            Error::conflict("database is busy")
        }
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            Error::conflict(format!("constraint violation: {e}"))
        }
        _ => Error::storage_with_source("sqlite operation failed", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::CapabilityOffer;
    use chrono::Duration;
    use std::collections::BTreeMap;

    fn test_account(balance: i64) -> Account {
        let now = Utc::now();
        Account {
            id: AccountId::generate(),
            email: "a@example.com".into(),
            name: "a".into(),
            credit_balance: balance,
            max_per_task: None,
            max_per_day: None,
            is_system: false,
            created_at: now,
            updated_at: now,
        }
    }

    fn test_worker(account_id: AccountId, capability: &str, price: i64) -> Agent {
        let now = Utc::now();
        let mut capabilities = BTreeMap::new();
        capabilities.insert(capability.to_string(), CapabilityOffer { price });
        Agent {
            id: AgentId::generate(),
            account_id,
            role: AgentRole::Worker,
            endpoint_url: "http://worker.local/hook".into(),
            capabilities_offered: capabilities,
            availability: Availability::Online,
            schema_compliance: None,
            success_rate: None,
            reputation: None,
            avg_response_ms: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn test_task(requester: AgentId, budget: i64) -> Task {
        let mut task = Task::new(
            requester,
            "summarize",
            serde_json::json!({"text": "hello world"}),
            budget,
            RoutingPreference::Auto,
        );
        task.status = TaskStatus::Matching;
        task
    }

    #[test]
    fn migrations_seed_system_accounts() {
        let store = Store::open_in_memory().expect("open");
        let platform = store.get_account(AccountId::platform()).expect("platform");
        assert!(platform.is_system);
        assert_eq!(platform.credit_balance, 0);
        store.get_account(AccountId::admin()).expect("admin");
    }

    #[test]
    fn migrations_are_idempotent_on_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("agora.db");
        drop(Store::open(&path).expect("first open"));
        drop(Store::open(&path).expect("second open"));
    }

    #[test]
    fn account_round_trip() {
        let store = Store::open_in_memory().expect("open");
        let mut account = test_account(100);
        account.max_per_task = Some(4);
        store.insert_account(&account).expect("insert");
        let loaded = store.get_account(account.id).expect("get");
        assert_eq!(loaded.credit_balance, 100);
        assert_eq!(loaded.max_per_task, Some(4));
        assert!(!loaded.is_system);
    }

    #[test]
    fn missing_account_is_not_found() {
        let store = Store::open_in_memory().expect("open");
        let err = store.get_account(AccountId::generate()).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn conditional_deduct_refuses_overdraft() {
        let store = Store::open_in_memory().expect("open");
        let account = test_account(10);
        store.insert_account(&account).expect("insert");

        let refused = store
            .with_tx(|tx| tx.try_deduct_credits(account.id, 11))
            .expect("tx");
        assert_eq!(refused, None);
        assert_eq!(store.get_account(account.id).unwrap().credit_balance, 10);

        let new_balance = store
            .with_tx(|tx| tx.try_deduct_credits(account.id, 7))
            .expect("tx");
        assert_eq!(new_balance, Some(3));
    }

    #[test]
    fn with_tx_rolls_back_on_error() {
        let store = Store::open_in_memory().expect("open");
        let account = test_account(50);
        store.insert_account(&account).expect("insert");

        let result: Result<()> = store.with_tx(|tx| {
            tx.try_deduct_credits(account.id, 20)?;
            Err(Error::internal("boom"))
        });
        assert!(result.is_err());
        assert_eq!(store.get_account(account.id).unwrap().credit_balance, 50);
    }

    #[test]
    fn task_round_trip_and_update() {
        let store = Store::open_in_memory().expect("open");
        let account = test_account(100);
        store.insert_account(&account).expect("account");
        let agent = test_worker(account.id, "summarize", 3);
        store.insert_agent(&agent).expect("agent");

        let mut task = test_task(agent.id, 5);
        store.with_tx(|tx| tx.insert_task(&task)).expect("insert");

        task.status = TaskStatus::Dispatched;
        task.worker_agent_id = Some(agent.id);
        task.deadline = Some(Utc::now() + Duration::seconds(15));
        store.update_task(&task).expect("update");

        let loaded = store.get_task(task.id).expect("get");
        assert_eq!(loaded.status, TaskStatus::Dispatched);
        assert_eq!(loaded.worker_agent_id, Some(agent.id));
        assert!(loaded.deadline.is_some());
    }

    #[test]
    fn cas_only_first_writer_wins() {
        let store = Store::open_in_memory().expect("open");
        let account = test_account(100);
        store.insert_account(&account).expect("account");
        let agent = test_worker(account.id, "summarize", 3);
        store.insert_agent(&agent).expect("agent");

        let mut task = test_task(agent.id, 5);
        task.status = TaskStatus::InProgress;
        store.with_tx(|tx| tx.insert_task(&task)).expect("insert");

        let first = store
            .cas_task_status(task.id, TaskStatus::InProgress, TaskStatus::Completed)
            .expect("cas");
        assert!(first.is_success());

        let second = store
            .cas_task_status(task.id, TaskStatus::InProgress, TaskStatus::Failed)
            .expect("cas");
        assert_eq!(
            second,
            CasResult::StateMismatch {
                actual: TaskStatus::Completed
            }
        );
    }

    #[test]
    fn cas_missing_task_is_not_found() {
        let store = Store::open_in_memory().expect("open");
        let result = store
            .cas_task_status(TaskId::generate(), TaskStatus::InProgress, TaskStatus::Failed)
            .expect("cas");
        assert_eq!(result, CasResult::NotFound);
    }

    #[test]
    fn worker_pool_excludes_system_offline_and_other_capabilities() {
        let store = Store::open_in_memory().expect("open");

        let account = test_account(0);
        store.insert_account(&account).expect("account");
        let mut system_account = test_account(0);
        system_account.is_system = true;
        store.insert_account(&system_account).expect("system account");

        let good = test_worker(account.id, "summarize", 3);
        store.insert_agent(&good).expect("good");

        let mut offline = test_worker(account.id, "summarize", 3);
        offline.availability = Availability::Offline;
        store.insert_agent(&offline).expect("offline");

        let system_owned = test_worker(system_account.id, "summarize", 3);
        store.insert_agent(&system_owned).expect("system owned");

        let other_capability = test_worker(account.id, "research", 8);
        store.insert_agent(&other_capability).expect("other");

        let mut requester_only = test_worker(account.id, "summarize", 3);
        requester_only.role = AgentRole::Requester;
        store.insert_agent(&requester_only).expect("requester");

        let pool = store.find_available_workers("summarize").expect("pool");
        assert_eq!(pool.len(), 1);
        assert_eq!(pool[0].id, good.id);
    }

    #[test]
    fn task_listing_is_scoped_to_account() {
        let store = Store::open_in_memory().expect("open");
        let mine = test_account(0);
        let theirs = test_account(0);
        store.insert_account(&mine).expect("mine");
        store.insert_account(&theirs).expect("theirs");
        let my_agent = test_worker(mine.id, "summarize", 3);
        let their_agent = test_worker(theirs.id, "summarize", 3);
        store.insert_agent(&my_agent).expect("agent");
        store.insert_agent(&their_agent).expect("agent");

        store
            .with_tx(|tx| tx.insert_task(&test_task(my_agent.id, 5)))
            .expect("task");
        store
            .with_tx(|tx| tx.insert_task(&test_task(their_agent.id, 5)))
            .expect("task");

        let listed = store.list_tasks_for_account(mine.id).expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].requester_agent_id, my_agent.id);
    }

    #[test]
    fn task_listing_includes_assigned_worker_account() {
        let store = Store::open_in_memory().expect("open");
        let requester_account = test_account(0);
        let worker_account = test_account(0);
        store.insert_account(&requester_account).expect("requester");
        store.insert_account(&worker_account).expect("worker");
        let requester = test_worker(requester_account.id, "summarize", 3);
        let worker = test_worker(worker_account.id, "summarize", 3);
        store.insert_agent(&requester).expect("agent");
        store.insert_agent(&worker).expect("agent");

        let mut task = test_task(requester.id, 5);
        store.with_tx(|tx| tx.insert_task(&task)).expect("task");

        // Unassigned: only the requester's account sees it.
        assert!(store
            .list_tasks_for_account(worker_account.id)
            .expect("list")
            .is_empty());

        task.worker_agent_id = Some(worker.id);
        task.status = TaskStatus::InProgress;
        store.update_task(&task).expect("update");

        let listed = store
            .list_tasks_for_account(worker_account.id)
            .expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, task.id);
        // The requester still sees it exactly once.
        assert_eq!(
            store
                .list_tasks_for_account(requester_account.id)
                .expect("list")
                .len(),
            1
        );
    }

    #[test]
    fn locked_since_sums_only_escrow_locks() {
        let store = Store::open_in_memory().expect("open");
        let account = test_account(100);
        store.insert_account(&account).expect("account");
        let midnight = Utc::now() - Duration::hours(1);

        store
            .with_tx(|tx| {
                tx.insert_entry(&LedgerEntry::new(
                    account.id,
                    None,
                    EntryKind::EscrowLock,
                    5,
                    95,
                ))?;
                tx.insert_entry(&LedgerEntry::new(
                    account.id,
                    None,
                    EntryKind::Refund,
                    5,
                    100,
                ))?;
                tx.insert_entry(&LedgerEntry::new(
                    account.id,
                    None,
                    EntryKind::EscrowLock,
                    3,
                    97,
                ))
            })
            .expect("entries");

        assert_eq!(store.locked_since(account.id, midnight).expect("sum"), 8);
    }

    #[test]
    fn queue_claims_in_due_order_and_removes() {
        let store = Store::open_in_memory().expect("open");
        let task_a = TaskId::generate();
        let task_b = TaskId::generate();

        let early = Job::deadline_check(task_a, AgentId::generate(), Utc::now() - Duration::seconds(10));
        let late = Job::deadline_check(task_b, AgentId::generate(), Utc::now() + Duration::hours(1));
        let now_job = Job::dispatch(task_b, None);
        store.enqueue_job(&late).expect("late");
        store.enqueue_job(&early).expect("early");
        store.enqueue_job(&now_job).expect("now");

        let first = store.claim_due_job(Utc::now()).expect("claim").expect("due");
        assert_eq!(first.id, early.id);
        let second = store.claim_due_job(Utc::now()).expect("claim").expect("due");
        assert_eq!(second.id, now_job.id);
        assert!(store.claim_due_job(Utc::now()).expect("claim").is_none());
        assert_eq!(store.pending_job_count().expect("count"), 1);
    }

    #[test]
    fn cancel_jobs_for_task_removes_only_that_task() {
        let store = Store::open_in_memory().expect("open");
        let keep = TaskId::generate();
        let drop_id = TaskId::generate();
        store.enqueue_job(&Job::dispatch(keep, None)).expect("keep");
        store
            .enqueue_job(&Job::dispatch(drop_id, None))
            .expect("drop");
        store
            .enqueue_job(&Job::deadline_check(drop_id, AgentId::generate(), Utc::now()))
            .expect("drop watcher");

        assert_eq!(store.cancel_jobs_for_task(drop_id).expect("cancel"), 2);
        assert_eq!(store.pending_job_count().expect("count"), 1);
    }

    #[test]
    fn api_key_resolution() {
        let store = Store::open_in_memory().expect("open");
        let account = test_account(10);
        store.insert_account(&account).expect("account");
        let agent = test_worker(account.id, "summarize", 3);
        store.insert_agent(&agent).expect("agent");

        store
            .insert_api_key("deadbeef", account.id, Some(agent.id))
            .expect("key");

        let (resolved_account, resolved_agent) = store
            .resolve_api_key("deadbeef")
            .expect("resolve")
            .expect("present");
        assert_eq!(resolved_account.id, account.id);
        assert_eq!(resolved_agent.map(|a| a.id), Some(agent.id));

        assert!(store.resolve_api_key("unknown").expect("resolve").is_none());
    }
}
