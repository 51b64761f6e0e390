//! Email verification orchestrator
//!
//! Consumes a verification code and marks the owning user as verified in
//! one transaction. The conditional update in
//! [`Repository::mark_verify_email_used`] is the only guard: there is no
//! read-then-write check that two callers could both pass.

use serde::{Deserialize, Serialize};
use tracing::info;

use super::error::StoreError;
use super::models::{UpdateUserParams, User, VerifyEmail};
use super::repository::Repository;
use super::tx::Store;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyEmailTxResult {
    pub verify_email: VerifyEmail,
    pub user: User,
}

pub async fn execute_verify_email<R>(
    repo: &mut R,
    id: i64,
    secret_code: &str,
) -> Result<VerifyEmailTxResult, StoreError>
where
    R: Repository + ?Sized,
{
    repo.mark_verify_email_used(id, secret_code).await?;

    let verify_email = repo
        .get_verify_email_by_id(id)
        .await?
        .ok_or_else(|| StoreError::Inconsistent(format!("verify_email {id} vanished")))?;

    let mut update = UpdateUserParams::new(verify_email.username.clone());
    update.is_email_verified = Some(true);
    repo.update_user(&update).await?.ok_or_else(|| {
        StoreError::Inconsistent(format!("user {} not found", verify_email.username))
    })?;

    let user = repo
        .get_user_by_username(&verify_email.username)
        .await?
        .ok_or_else(|| {
            StoreError::Inconsistent(format!("user {} not found", verify_email.username))
        })?;

    Ok(VerifyEmailTxResult { verify_email, user })
}

impl Store {
    /// Consume verification code `id` and flag the user's email as
    /// verified. Succeeds at most once per code; later calls, a wrong code
    /// or an expired code fail with [`StoreError::NothingAffected`].
    pub async fn verify_email_tx(
        &self,
        id: i64,
        secret_code: &str,
    ) -> Result<VerifyEmailTxResult, StoreError> {
        let secret_code = secret_code.to_owned();
        let result = self
            .run_in_transaction(move |repo| {
                Box::pin(async move { execute_verify_email(repo, id, &secret_code).await })
            })
            .await?;

        info!(
            verify_email_id = id,
            username = %result.user.username,
            "Email verified"
        );
        Ok(result)
    }
}
