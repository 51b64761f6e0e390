//! User creation coupled to a side effect.
//!
//! Two flavours:
//! - [`Store::create_user_tx`] awaits a caller hook before commit. The user
//!   exists iff the hook succeeded, but the transaction stays open for as
//!   long as the hook takes.
//! - [`Store::create_user_with_outbox`] records the side effect as an
//!   `outbox_events` row in the same transaction and leaves delivery to
//!   [`crate::outbox::OutboxDispatcher`].

use std::future::Future;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::error::StoreError;
use super::models::{NewOutboxEvent, NewUser, User};
use super::repository::Repository;
use super::tx::Store;
use crate::worker::{PayloadSendVerifyEmail, TASK_SEND_VERIFY_EMAIL};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateUserTxResult {
    pub user: User,
}

pub async fn execute_create_user<R, F, Fut>(
    repo: &mut R,
    arg: NewUser,
    after_create: F,
) -> Result<CreateUserTxResult, StoreError>
where
    R: Repository + ?Sized,
    F: FnOnce(User) -> Fut + Send,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    let user = repo.insert_user(&arg).await?;
    debug!(username = %user.username, "User row inserted, running after-create hook");

    after_create(user.clone())
        .await
        .map_err(StoreError::AfterCreate)?;

    Ok(CreateUserTxResult { user })
}

pub async fn execute_create_user_with_outbox<R>(
    repo: &mut R,
    arg: NewUser,
) -> Result<CreateUserTxResult, StoreError>
where
    R: Repository + ?Sized,
{
    let user = repo.insert_user(&arg).await?;

    let payload = serde_json::to_value(PayloadSendVerifyEmail {
        username: user.username.clone(),
    })?;
    let event = repo
        .insert_outbox_event(&NewOutboxEvent {
            topic: TASK_SEND_VERIFY_EMAIL.to_string(),
            payload,
        })
        .await?;
    debug!(username = %user.username, event_id = event.id, "Outbox event recorded");

    Ok(CreateUserTxResult { user })
}

impl Store {
    /// Insert a user and run `after_create` before committing. A failing
    /// hook rolls the insert back.
    pub async fn create_user_tx<F, Fut>(
        &self,
        arg: NewUser,
        after_create: F,
    ) -> Result<CreateUserTxResult, StoreError>
    where
        F: FnOnce(User) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let result = self
            .run_in_transaction(move |repo| {
                Box::pin(execute_create_user(repo, arg, after_create))
            })
            .await?;

        info!(username = %result.user.username, "User created");
        Ok(result)
    }

    /// Insert a user and a `send_verify_email` outbox event atomically.
    pub async fn create_user_with_outbox(
        &self,
        arg: NewUser,
    ) -> Result<CreateUserTxResult, StoreError> {
        let result = self
            .run_in_transaction(move |repo| Box::pin(execute_create_user_with_outbox(repo, arg)))
            .await?;

        info!(username = %result.user.username, "User created with outbox event");
        Ok(result)
    }
}
