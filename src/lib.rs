//! simple_bank - transactional ledger core
//!
//! Persists accounts, entries, transfers, users, sessions and email
//! verification codes in PostgreSQL, and composes them into atomic
//! multi-step operations.
//!
//! # Modules
//!
//! - [`store`] - repository and transaction orchestrators
//! - [`outbox`] - delivers committed side effects to the task queue
//! - [`worker`] - task queue and mailer boundary, `send_verify_email` task
//! - [`password`] - argon2 password hashing
//! - [`db`] - connection pool and migrations
//! - [`config`] / [`logging`] - YAML configuration and tracing setup

pub mod config;
pub mod db;
pub mod logging;
pub mod outbox;
pub mod password;
pub mod store;
pub mod worker;

pub use config::AppConfig;
pub use db::Database;
pub use outbox::OutboxDispatcher;
pub use store::{
    CreateUserTxResult, Repository, Store, StoreError, TransferTxParams, TransferTxResult,
    VerifyEmailTxResult,
};
pub use worker::{EmailSender, TaskDistributor, TaskError, VerifyEmailTaskProcessor};
