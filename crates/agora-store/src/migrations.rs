//! Idempotent schema creation and bootstrap seeds.
//!
//! Every statement is safe to re-run: tables and indexes use
//! `IF NOT EXISTS`, seeds use `INSERT OR IGNORE`.

use chrono::Utc;
use rusqlite::{Connection, params};

use agora_core::AccountId;

use crate::store::fmt_ts;

/// Creates all tables and indexes.
pub(crate) fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS accounts (
            id TEXT PRIMARY KEY,
            email TEXT NOT NULL,
            name TEXT NOT NULL,
            credit_balance INTEGER NOT NULL DEFAULT 0 CHECK (credit_balance >= 0),
            max_per_task INTEGER,
            max_per_day INTEGER,
            is_system INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS agents (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id),
            role TEXT NOT NULL,
            endpoint_url TEXT NOT NULL,
            capabilities_offered TEXT NOT NULL DEFAULT '{}',
            availability TEXT NOT NULL DEFAULT 'offline',
            schema_compliance REAL,
            success_rate REAL,
            reputation REAL,
            avg_response_ms INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_agents_account ON agents(account_id);

        CREATE TABLE IF NOT EXISTS api_keys (
            key_hash TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id),
            agent_id TEXT REFERENCES agents(id),
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id TEXT PRIMARY KEY,
            requester_agent_id TEXT NOT NULL REFERENCES agents(id),
            worker_agent_id TEXT REFERENCES agents(id),
            capability TEXT NOT NULL,
            input_payload TEXT NOT NULL,
            output_payload TEXT,
            output_status TEXT,
            status TEXT NOT NULL,
            budget INTEGER NOT NULL CHECK (budget > 0),
            actual_cost INTEGER,
            platform_fee INTEGER,
            routing_preference TEXT NOT NULL DEFAULT 'auto',
            deadline TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tasks_requester ON tasks(requester_agent_id);
        CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);

        CREATE TABLE IF NOT EXISTS credit_ledger (
            id TEXT PRIMARY KEY,
            account_id TEXT NOT NULL REFERENCES accounts(id),
            task_id TEXT,
            entry_kind TEXT NOT NULL,
            amount INTEGER NOT NULL CHECK (amount >= 0),
            balance_after INTEGER NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_ledger_account_created
            ON credit_ledger(account_id, entry_kind, created_at);
        CREATE INDEX IF NOT EXISTS idx_ledger_task ON credit_ledger(task_id);

        CREATE TABLE IF NOT EXISTS dispatch_jobs (
            id TEXT PRIMARY KEY,
            task_id TEXT NOT NULL,
            kind TEXT NOT NULL,
            payload TEXT NOT NULL DEFAULT '{}',
            run_at TEXT NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_run_at ON dispatch_jobs(run_at);",
    )
}

/// Seeds the two well-known system accounts.
pub(crate) fn seed_system_accounts(conn: &Connection) -> rusqlite::Result<()> {
    let now = fmt_ts(Utc::now());
    conn.execute(
        "INSERT OR IGNORE INTO accounts
            (id, email, name, credit_balance, is_system, created_at, updated_at)
         VALUES (?1, ?2, ?3, 0, 1, ?4, ?4)",
        params![
            AccountId::platform().to_string(),
            "platform@agora.internal",
            "Platform Fees",
            now
        ],
    )?;
    conn.execute(
        "INSERT OR IGNORE INTO accounts
            (id, email, name, credit_balance, is_system, created_at, updated_at)
         VALUES (?1, ?2, ?3, 0, 1, ?4, ?4)",
        params![
            AccountId::admin().to_string(),
            "admin@agora.internal",
            "Admin",
            now
        ],
    )?;
    Ok(())
}
