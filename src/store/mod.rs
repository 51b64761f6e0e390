//! Transactional ledger store
//!
//! - [`Repository`] - atomic single-row CRUD ([`PgRepository`] on PostgreSQL)
//! - [`Store`] - opens transactions and composes repository calls
//! - [`Store::transfer_tx`], [`Store::create_user_tx`], [`Store::verify_email_tx`]

pub mod create_user;
pub mod error;
pub mod models;
pub mod repository;
pub mod transfer;
pub mod tx;
pub mod verify_email;

#[cfg(test)]
pub mod mock;

pub use create_user::CreateUserTxResult;
pub use error::StoreError;
pub use models::{
    Account, Entry, NewAccount, NewEntry, NewOutboxEvent, NewSession, NewTransfer, NewUser,
    NewVerifyEmail, OutboxEvent, Session, Transfer, UpdateUserParams, User, VerifyEmail,
};
pub use repository::{PgRepository, Repository};
pub use transfer::{TransferTxParams, TransferTxResult, lock_order};
pub use tx::{PooledRepository, Store, TxRepository};
pub use verify_email::VerifyEmailTxResult;
