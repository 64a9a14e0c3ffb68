//! Double-entry credit escrow.
//!
//! All operations run inside a caller-provided store transaction and keep two
//! invariants:
//!
//! - **Conservation**: the credits debited by an operation equal the credits
//!   it credits elsewhere (settlement splits the actual cost between worker
//!   and platform and releases the remainder)
//! - **No negative balances**: locks use the store's conditional deduction
//!   and fail with `InsufficientFunds` without writing a ledger entry
//!
//! Accounts touched by a settlement are read in ascending id order before any
//! mutation, so concurrent settlements cannot deadlock.

use agora_core::{AccountId, EntryKind, Error, LedgerEntry, Result, TaskId};
use agora_store::StoreTx;

/// Platform commission in percent of the actual cost.
pub const PLATFORM_FEE_PERCENT: i64 = 10;

/// The credit split computed by a successful settlement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    /// Credits paid to the worker.
    pub worker_earning: i64,
    /// Commission paid to the platform account.
    pub platform_fee: i64,
    /// Unspent budget returned to the requester.
    pub remainder: i64,
}

/// Computes the fee split for a given actual cost and budget.
#[must_use]
pub fn split(budget: i64, actual_cost: i64) -> Settlement {
    let platform_fee = actual_cost * PLATFORM_FEE_PERCENT / 100;
    Settlement {
        worker_earning: actual_cost - platform_fee,
        platform_fee,
        remainder: (budget - actual_cost).max(0),
    }
}

/// Locks `amount` credits of `account` against `task`.
///
/// Deducts the balance and appends an `escrow_lock` entry recording the new
/// balance.
///
/// # Errors
///
/// Returns `InsufficientFunds` (and writes nothing) when the balance cannot
/// cover the amount.
pub fn lock_credits(
    tx: &StoreTx<'_>,
    account: AccountId,
    task: TaskId,
    amount: i64,
) -> Result<()> {
    let row = tx.account_for_update(account)?;
    let Some(new_balance) = tx.try_deduct_credits(account, amount)? else {
        return Err(Error::InsufficientFunds {
            required: amount,
            available: row.credit_balance,
        });
    };
    tx.insert_entry(&LedgerEntry::new(
        account,
        Some(task),
        EntryKind::EscrowLock,
        amount,
        new_balance,
    ))
}

/// Settles a paid task: worker earning, platform fee, requester remainder.
///
/// `actual_cost` must already be clamped to the budget by the caller.
///
/// # Errors
///
/// Returns a storage error if any account is missing or an append fails.
pub fn settle_task(
    tx: &StoreTx<'_>,
    task: TaskId,
    requester: AccountId,
    worker: AccountId,
    budget: i64,
    actual_cost: i64,
) -> Result<Settlement> {
    let settlement = split(budget, actual_cost);

    // Deadlock avoidance: touch accounts in ascending id order.
    let mut accounts = [requester, worker, AccountId::platform()];
    accounts.sort_unstable();
    for id in accounts {
        tx.account_for_update(id)?;
    }

    let worker_balance = tx.add_credits(worker, settlement.worker_earning)?;
    tx.insert_entry(&LedgerEntry::new(
        worker,
        Some(task),
        EntryKind::TaskEarning,
        settlement.worker_earning,
        worker_balance,
    ))?;

    if settlement.platform_fee > 0 {
        let platform_balance = tx.add_credits(AccountId::platform(), settlement.platform_fee)?;
        tx.insert_entry(&LedgerEntry::new(
            AccountId::platform(),
            Some(task),
            EntryKind::PlatformFee,
            settlement.platform_fee,
            platform_balance,
        ))?;
    }

    if settlement.remainder > 0 {
        let requester_balance = tx.add_credits(requester, settlement.remainder)?;
        tx.insert_entry(&LedgerEntry::new(
            requester,
            Some(task),
            EntryKind::EscrowRelease,
            settlement.remainder,
            requester_balance,
        ))?;
    }

    Ok(settlement)
}

/// Returns the full budget to the requester after a failed task.
///
/// A non-positive budget is a no-op.
///
/// # Errors
///
/// Returns a storage error if the account is missing or the append fails.
pub fn refund_failed(
    tx: &StoreTx<'_>,
    task: TaskId,
    requester: AccountId,
    budget: i64,
) -> Result<()> {
    if budget <= 0 {
        return Ok(());
    }
    tx.account_for_update(requester)?;
    let new_balance = tx.add_credits(requester, budget)?;
    tx.insert_entry(&LedgerEntry::new(
        requester,
        Some(task),
        EntryKind::Refund,
        budget,
        new_balance,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::Account;
    use agora_store::Store;
    use chrono::Utc;

    fn seeded_account(store: &Store, balance: i64) -> AccountId {
        let now = Utc::now();
        let account = Account {
            id: AccountId::generate(),
            email: "t@example.com".into(),
            name: "t".into(),
            credit_balance: balance,
            max_per_task: None,
            max_per_day: None,
            is_system: false,
            created_at: now,
            updated_at: now,
        };
        store.insert_account(&account).expect("insert account");
        account.id
    }

    #[test]
    fn split_matches_fee_schedule() {
        let s = split(100, 80);
        assert_eq!(s.worker_earning, 72);
        assert_eq!(s.platform_fee, 8);
        assert_eq!(s.remainder, 20);

        // Fees floor: 10% of 3 is 0.
        let s = split(3, 3);
        assert_eq!(s.worker_earning, 3);
        assert_eq!(s.platform_fee, 0);
        assert_eq!(s.remainder, 0);
    }

    #[test]
    fn lock_deducts_and_records() {
        let store = Store::open_in_memory().expect("open");
        let requester = seeded_account(&store, 1000);
        let task = TaskId::generate();

        store
            .with_tx(|tx| lock_credits(tx, requester, task, 3))
            .expect("lock");

        assert_eq!(store.get_account(requester).unwrap().credit_balance, 997);
        let entries = store.entries_for_task(task).expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::EscrowLock);
        assert_eq!(entries[0].amount, 3);
        assert_eq!(entries[0].balance_after, 997);
    }

    #[test]
    fn insufficient_funds_writes_nothing() {
        let store = Store::open_in_memory().expect("open");
        let requester = seeded_account(&store, 2);
        let task = TaskId::generate();

        let err = store
            .with_tx(|tx| lock_credits(tx, requester, task, 5))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientFunds {
                required: 5,
                available: 2
            }
        ));
        assert_eq!(store.get_account(requester).unwrap().credit_balance, 2);
        assert!(store.entries_for_task(task).expect("entries").is_empty());
    }

    #[test]
    fn settlement_split_credits_all_parties() {
        let store = Store::open_in_memory().expect("open");
        let requester = seeded_account(&store, 900); // after a 100 lock from 1000
        let worker = seeded_account(&store, 50);
        let task = TaskId::generate();

        let settlement = store
            .with_tx(|tx| settle_task(tx, task, requester, worker, 100, 80))
            .expect("settle");

        assert_eq!(settlement.worker_earning, 72);
        assert_eq!(settlement.platform_fee, 8);
        assert_eq!(settlement.remainder, 20);
        assert_eq!(store.get_account(requester).unwrap().credit_balance, 920);
        assert_eq!(store.get_account(worker).unwrap().credit_balance, 122);
        assert_eq!(
            store
                .get_account(AccountId::platform())
                .unwrap()
                .credit_balance,
            8
        );
    }

    #[test]
    fn credits_are_conserved_across_lock_settle_refund() {
        let store = Store::open_in_memory().expect("open");
        let requester = seeded_account(&store, 1000);
        let worker = seeded_account(&store, 0);
        let before = store.sum_balances().expect("sum");

        let settled = TaskId::generate();
        store
            .with_tx(|tx| {
                lock_credits(tx, requester, settled, 100)?;
                settle_task(tx, settled, requester, worker, 100, 80).map(|_| ())
            })
            .expect("lock + settle");

        let refunded = TaskId::generate();
        store
            .with_tx(|tx| {
                lock_credits(tx, requester, refunded, 40)?;
                refund_failed(tx, refunded, requester, 40)
            })
            .expect("lock + refund");

        // The escrowed 100 was redistributed, not created or destroyed.
        assert_eq!(store.sum_balances().expect("sum"), before);
    }

    #[test]
    fn refund_restores_full_budget() {
        let store = Store::open_in_memory().expect("open");
        let requester = seeded_account(&store, 1000);
        let task = TaskId::generate();

        store
            .with_tx(|tx| {
                lock_credits(tx, requester, task, 5)?;
                refund_failed(tx, task, requester, 5)
            })
            .expect("lock + refund");

        assert_eq!(store.get_account(requester).unwrap().credit_balance, 1000);
        let kinds: Vec<_> = store
            .entries_for_task(task)
            .expect("entries")
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds, vec![EntryKind::EscrowLock, EntryKind::Refund]);
    }

    #[test]
    fn signed_entry_sums_reconcile_with_balance() {
        let store = Store::open_in_memory().expect("open");
        let requester = seeded_account(&store, 500);
        let worker = seeded_account(&store, 0);
        let task = TaskId::generate();

        store
            .with_tx(|tx| {
                lock_credits(tx, requester, task, 60)?;
                settle_task(tx, task, requester, worker, 60, 50).map(|_| ())
            })
            .expect("settle");

        let requester_delta: i64 = store
            .entries_for_account(requester)
            .expect("entries")
            .iter()
            .map(LedgerEntry::signed_amount)
            .sum();
        assert_eq!(
            store.get_account(requester).unwrap().credit_balance,
            500 + requester_delta
        );
    }
}
