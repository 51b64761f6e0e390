//! Task-queue boundary
//!
//! The queue and the mailer are external collaborators. This module only
//! defines the traits they are consumed through, the task payloads, and
//! the store-facing half of the `send_verify_email` task.

pub mod task_send_verify_email;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;

pub use task_send_verify_email::{VerifyEmailTaskProcessor, send_verify_email};

/// Queue topic for the verification mail task
pub const TASK_SEND_VERIFY_EMAIL: &str = "task:send_verify_email";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadSendVerifyEmail {
    pub username: String,
}

/// Enqueues tasks on an external queue
#[async_trait]
pub trait TaskDistributor: Send + Sync {
    async fn distribute_send_verify_email(
        &self,
        payload: &PayloadSendVerifyEmail,
    ) -> anyhow::Result<()>;
}

/// Sends mail through an external provider
#[async_trait]
pub trait EmailSender: Send + Sync {
    async fn send_email(&self, subject: &str, content: &str, to: &[String])
    -> anyhow::Result<()>;
}

#[derive(Error, Debug)]
pub enum TaskError {
    /// Payload cannot be decoded. Retrying cannot help.
    #[error("Skip retry: invalid payload: {0}")]
    SkipRetry(#[source] serde_json::Error),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Failed to send verify email: {0}")]
    Mail(#[source] anyhow::Error),
}

impl TaskError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, TaskError::SkipRetry(_))
    }
}
