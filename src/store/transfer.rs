//! Transfer orchestrator
//!
//! Moves money between two accounts as one atomic unit:
//!
//! ```text
//! INSERT transfer ─▶ INSERT debit entry ─▶ INSERT credit entry ─▶ balance deltas (lower id first)
//! ```
//!
//! # Lock ordering
//!
//! The two balance deltas are always applied in ascending account-id order,
//! whatever the direction of the transfer. `UPDATE ... SET balance = balance + $1`
//! takes the row lock, so two transfers between the same pair of accounts in
//! opposite directions acquire the locks in the same global order and can
//! never wait on each other in a cycle. Removing this rule reintroduces
//! deadlocks under bidirectional load.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::StoreError;
use super::models::{Account, Entry, NewEntry, NewTransfer, Transfer};
use super::repository::Repository;
use super::tx::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxParams {
    pub from_account_id: i64,
    pub to_account_id: i64,
    pub amount: i64,
}

impl TransferTxParams {
    pub fn new(from_account_id: i64, to_account_id: i64, amount: i64) -> Self {
        Self {
            from_account_id,
            to_account_id,
            amount,
        }
    }

    /// Checks that need no database access. Account existence is not
    /// checked: an unknown id fails the balance update inside the
    /// transaction.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.amount <= 0 {
            return Err(StoreError::InvalidAmount(self.amount));
        }
        if self.from_account_id == self.to_account_id {
            return Err(StoreError::SameAccount(self.from_account_id));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferTxResult {
    pub transfer: Transfer,
    pub from_account: Account,
    pub to_account: Account,
    pub from_entry: Entry,
    pub to_entry: Entry,
}

/// Balance deltas for a transfer in the order their row locks must be
/// taken: lower account id first.
pub fn lock_order(params: &TransferTxParams) -> [(i64, i64); 2] {
    let debit = (params.from_account_id, -params.amount);
    let credit = (params.to_account_id, params.amount);
    if params.from_account_id < params.to_account_id {
        [debit, credit]
    } else {
        [credit, debit]
    }
}

/// Transfer steps against a repository already bound to a transaction.
pub async fn execute_transfer<R>(
    repo: &mut R,
    params: TransferTxParams,
) -> Result<TransferTxResult, StoreError>
where
    R: Repository + ?Sized,
{
    let transfer = repo
        .insert_transfer(&NewTransfer {
            from_account_id: params.from_account_id,
            to_account_id: params.to_account_id,
            amount: params.amount,
        })
        .await?;
    debug!(transfer_id = transfer.id, "Transfer row inserted");

    let from_entry = repo
        .insert_entry(&NewEntry {
            account_id: params.from_account_id,
            amount: -params.amount,
        })
        .await?;
    let to_entry = repo
        .insert_entry(&NewEntry {
            account_id: params.to_account_id,
            amount: params.amount,
        })
        .await?;

    let [(first_id, first_delta), (second_id, second_delta)] = lock_order(&params);
    let first = repo.add_account_balance(first_id, first_delta).await?;
    let second = repo.add_account_balance(second_id, second_delta).await?;

    let (from_account, to_account) = if first_id == params.from_account_id {
        (first, second)
    } else {
        (second, first)
    };

    Ok(TransferTxResult {
        transfer,
        from_account,
        to_account,
        from_entry,
        to_entry,
    })
}

impl Store {
    /// Move `amount` from one account to another atomically.
    ///
    /// A transfer from an account to itself is rejected with
    /// [`StoreError::SameAccount`], and a non-positive amount with
    /// [`StoreError::InvalidAmount`], before a transaction is opened.
    /// Nothing is written for either.
    ///
    /// Lock conflicts are returned to the caller, never retried here.
    pub async fn transfer_tx(
        &self,
        params: TransferTxParams,
    ) -> Result<TransferTxResult, StoreError> {
        params.validate()?;

        let result = self
            .run_in_transaction(move |repo| Box::pin(execute_transfer(repo, params)))
            .await?;

        info!(
            transfer_id = result.transfer.id,
            from_account_id = params.from_account_id,
            to_account_id = params.to_account_id,
            amount = params.amount,
            from_balance = result.from_account.balance,
            to_balance = result.to_account.balance,
            "Transfer committed"
        );
        Ok(result)
    }
}
