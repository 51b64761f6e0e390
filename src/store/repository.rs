//! Repository layer for database operations
//!
//! Every method is a single SQL statement. Composition into multi-step
//! business transactions happens in [`super::Store`], never here.

use std::ops::DerefMut;

use async_trait::async_trait;
use sqlx::PgConnection;
use uuid::Uuid;

use super::error::StoreError;
use super::models::{
    Account, Entry, NewAccount, NewEntry, NewOutboxEvent, NewSession, NewTransfer, NewUser,
    NewVerifyEmail, OutboxEvent, Session, Transfer, UpdateUserParams, User, VerifyEmail,
};

/// Atomic single-row operations on the ledger tables.
///
/// Lookups return `Ok(None)` when no row matches. Errors are reserved for
/// infrastructure failures and constraint violations.
#[async_trait]
pub trait Repository: Send {
    // === Accounts ===

    async fn insert_account(&mut self, arg: &NewAccount) -> Result<Account, StoreError>;

    async fn get_account_by_id(&mut self, id: i64) -> Result<Option<Account>, StoreError>;

    async fn get_account_by_owner_and_currency(
        &mut self,
        owner: &str,
        currency: &str,
    ) -> Result<Option<Account>, StoreError>;

    /// Read an account and hold a `FOR NO KEY UPDATE` row lock until the
    /// enclosing transaction ends. Outside a transaction the lock is released
    /// immediately.
    async fn get_account_by_id_for_update(
        &mut self,
        id: i64,
    ) -> Result<Option<Account>, StoreError>;

    async fn list_accounts(
        &mut self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Account>, StoreError>;

    /// Overwrite balance and currency. CRUD path only; transfers must use
    /// [`Repository::add_account_balance`].
    async fn update_account(
        &mut self,
        id: i64,
        balance: i64,
        currency: &str,
    ) -> Result<Option<Account>, StoreError>;

    /// Returns true if a row was deleted.
    async fn delete_account(&mut self, id: i64) -> Result<bool, StoreError>;

    /// Apply a signed delta to the balance in one statement and return the
    /// updated row. An unknown id is an error, not `None`.
    async fn add_account_balance(&mut self, id: i64, delta: i64) -> Result<Account, StoreError>;

    // === Entries ===

    async fn insert_entry(&mut self, arg: &NewEntry) -> Result<Entry, StoreError>;

    async fn get_entry_by_id(&mut self, id: i64) -> Result<Option<Entry>, StoreError>;

    async fn list_entries(
        &mut self,
        account_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Entry>, StoreError>;

    // === Transfers ===

    async fn insert_transfer(&mut self, arg: &NewTransfer) -> Result<Transfer, StoreError>;

    async fn get_transfer_by_id(&mut self, id: i64) -> Result<Option<Transfer>, StoreError>;

    /// Transfers where `from_account_id` matches the first id or
    /// `to_account_id` matches the second.
    async fn list_transfers(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transfer>, StoreError>;

    // === Users ===

    async fn insert_user(&mut self, arg: &NewUser) -> Result<User, StoreError>;

    async fn get_user_by_username(&mut self, username: &str) -> Result<Option<User>, StoreError>;

    async fn get_user_by_email(&mut self, email: &str) -> Result<Option<User>, StoreError>;

    async fn list_users(&mut self, limit: i64, offset: i64) -> Result<Vec<User>, StoreError>;

    async fn update_user(&mut self, arg: &UpdateUserParams) -> Result<Option<User>, StoreError>;

    async fn delete_user(&mut self, username: &str) -> Result<bool, StoreError>;

    // === Sessions ===

    async fn insert_session(&mut self, arg: &NewSession) -> Result<Session, StoreError>;

    async fn get_session_by_id(&mut self, id: Uuid) -> Result<Option<Session>, StoreError>;

    async fn block_session(&mut self, id: Uuid) -> Result<Option<Session>, StoreError>;

    // === Email verification ===

    async fn insert_verify_email(&mut self, arg: &NewVerifyEmail)
    -> Result<VerifyEmail, StoreError>;

    async fn get_verify_email_by_id(&mut self, id: i64)
    -> Result<Option<VerifyEmail>, StoreError>;

    /// Flip `is_used` only if the row is unused, unexpired and the code
    /// matches. Fails with [`StoreError::NothingAffected`] otherwise.
    async fn mark_verify_email_used(&mut self, id: i64, secret_code: &str)
    -> Result<(), StoreError>;

    // === Outbox ===

    async fn insert_outbox_event(&mut self, arg: &NewOutboxEvent)
    -> Result<OutboxEvent, StoreError>;

    /// Lock up to `limit` undelivered events that are due, skipping rows
    /// another dispatcher already holds.
    async fn claim_pending_outbox_events(
        &mut self,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<OutboxEvent>, StoreError>;

    async fn mark_outbox_event_dispatched(&mut self, id: i64) -> Result<(), StoreError>;

    /// Count a failed delivery and hold the event back for `retry_after`.
    async fn record_outbox_event_failure(
        &mut self,
        id: i64,
        error: &str,
        retry_after: std::time::Duration,
    ) -> Result<(), StoreError>;
}

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";
const USER_COLUMNS: &str =
    "username, hashed_password, full_name, email, is_email_verified, created_at, updated_at";
const SESSION_COLUMNS: &str =
    "id, username, refresh_token, user_agent, client_ip, is_blocked, expired_at, created_at";
const VERIFY_EMAIL_COLUMNS: &str =
    "id, username, email, secret_code, is_used, created_at, expired_at";
const OUTBOX_COLUMNS: &str =
    "id, topic, payload, attempts, last_error, created_at, dispatched_at, next_attempt_at";

/// PostgreSQL repository over anything that derefs to a connection:
/// a pooled connection, or an open transaction (see [`super::TxRepository`]).
pub struct PgRepository<C> {
    conn: C,
}

impl<C> PgRepository<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    pub fn new(conn: C) -> Self {
        Self { conn }
    }
}

#[async_trait]
impl<C> Repository for PgRepository<C>
where
    C: DerefMut<Target = PgConnection> + Send,
{
    async fn insert_account(&mut self, arg: &NewAccount) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(&arg.owner)
        .bind(arg.balance)
        .bind(&arg.currency)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(account)
    }

    async fn get_account_by_id(&mut self, id: i64) -> Result<Option<Account>, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;

        if account.is_none() {
            tracing::debug!(account_id = id, "Account not found");
        }
        Ok(account)
    }

    async fn get_account_by_owner_and_currency(
        &mut self,
        owner: &str,
        currency: &str,
    ) -> Result<Option<Account>, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = $1 AND currency = $2"
        ))
        .bind(owner)
        .bind(currency)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(account)
    }

    async fn get_account_by_id_for_update(
        &mut self,
        id: i64,
    ) -> Result<Option<Account>, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR NO KEY UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(account)
    }

    async fn list_accounts(
        &mut self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Account>, StoreError> {
        let accounts = sqlx::query_as::<_, Account>(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = $1 ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(owner)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(accounts)
    }

    async fn update_account(
        &mut self,
        id: i64,
        balance: i64,
        currency: &str,
    ) -> Result<Option<Account>, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "UPDATE accounts SET balance = $1, currency = $2 WHERE id = $3 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(balance)
        .bind(currency)
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(account)
    }

    async fn delete_account(&mut self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id)
            .execute(&mut *self.conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn add_account_balance(&mut self, id: i64, delta: i64) -> Result<Account, StoreError> {
        let account = sqlx::query_as::<_, Account>(&format!(
            "UPDATE accounts SET balance = balance + $1 WHERE id = $2 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(delta)
        .bind(id)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(account)
    }

    async fn insert_entry(&mut self, arg: &NewEntry) -> Result<Entry, StoreError> {
        let entry = sqlx::query_as::<_, Entry>(&format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(arg.account_id)
        .bind(arg.amount)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(entry)
    }

    async fn get_entry_by_id(&mut self, id: i64) -> Result<Option<Entry>, StoreError> {
        let entry = sqlx::query_as::<_, Entry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(entry)
    }

    async fn list_entries(
        &mut self,
        account_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Entry>, StoreError> {
        let entries = sqlx::query_as::<_, Entry>(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = $1 ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(account_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(entries)
    }

    async fn insert_transfer(&mut self, arg: &NewTransfer) -> Result<Transfer, StoreError> {
        let transfer = sqlx::query_as::<_, Transfer>(&format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) RETURNING {TRANSFER_COLUMNS}"
        ))
        .bind(arg.from_account_id)
        .bind(arg.to_account_id)
        .bind(arg.amount)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(transfer)
    }

    async fn get_transfer_by_id(&mut self, id: i64) -> Result<Option<Transfer>, StoreError> {
        let transfer = sqlx::query_as::<_, Transfer>(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(transfer)
    }

    async fn list_transfers(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transfer>, StoreError> {
        let transfers = sqlx::query_as::<_, Transfer>(&format!(
            r#"SELECT {TRANSFER_COLUMNS} FROM transfers
               WHERE from_account_id = $1 OR to_account_id = $2
               ORDER BY id LIMIT $3 OFFSET $4"#
        ))
        .bind(from_account_id)
        .bind(to_account_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(transfers)
    }

    async fn insert_user(&mut self, arg: &NewUser) -> Result<User, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"INSERT INTO users (username, hashed_password, full_name, email)
               VALUES ($1, $2, $3, $4)
               RETURNING {USER_COLUMNS}"#
        ))
        .bind(&arg.username)
        .bind(&arg.hashed_password)
        .bind(&arg.full_name)
        .bind(&arg.email)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(user)
    }

    async fn get_user_by_username(&mut self, username: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE username = $1"
        ))
        .bind(username)
        .fetch_optional(&mut *self.conn)
        .await?;

        if user.is_none() {
            tracing::debug!(username, "User not found");
        }
        Ok(user)
    }

    async fn get_user_by_email(&mut self, email: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(user)
    }

    async fn list_users(&mut self, limit: i64, offset: i64) -> Result<Vec<User>, StoreError> {
        let users = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users ORDER BY username LIMIT $1 OFFSET $2"
        ))
        .bind(limit)
        .bind(offset)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(users)
    }

    async fn update_user(&mut self, arg: &UpdateUserParams) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            r#"UPDATE users SET
                   hashed_password = COALESCE($1, hashed_password),
                   full_name = COALESCE($2, full_name),
                   email = COALESCE($3, email),
                   is_email_verified = COALESCE($4, is_email_verified),
                   updated_at = NOW()
               WHERE username = $5
               RETURNING {USER_COLUMNS}"#
        ))
        .bind(arg.hashed_password.as_deref())
        .bind(arg.full_name.as_deref())
        .bind(arg.email.as_deref())
        .bind(arg.is_email_verified)
        .bind(&arg.username)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(user)
    }

    async fn delete_user(&mut self, username: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM users WHERE username = $1")
            .bind(username)
            .execute(&mut *self.conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn insert_session(&mut self, arg: &NewSession) -> Result<Session, StoreError> {
        let session = sqlx::query_as::<_, Session>(&format!(
            r#"INSERT INTO sessions (id, username, refresh_token, user_agent, client_ip, is_blocked, expired_at)
               VALUES ($1, $2, $3, $4, $5, FALSE, $6)
               RETURNING {SESSION_COLUMNS}"#
        ))
        .bind(arg.id)
        .bind(&arg.username)
        .bind(&arg.refresh_token)
        .bind(&arg.user_agent)
        .bind(&arg.client_ip)
        .bind(arg.expired_at)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(session)
    }

    async fn get_session_by_id(&mut self, id: Uuid) -> Result<Option<Session>, StoreError> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(session)
    }

    async fn block_session(&mut self, id: Uuid) -> Result<Option<Session>, StoreError> {
        let session = sqlx::query_as::<_, Session>(&format!(
            "UPDATE sessions SET is_blocked = TRUE WHERE id = $1 RETURNING {SESSION_COLUMNS}"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(session)
    }

    async fn insert_verify_email(
        &mut self,
        arg: &NewVerifyEmail,
    ) -> Result<VerifyEmail, StoreError> {
        let verify_email = sqlx::query_as::<_, VerifyEmail>(&format!(
            r#"INSERT INTO verify_email (username, email, secret_code, is_used, expired_at)
               VALUES ($1, $2, $3, FALSE, $4)
               RETURNING {VERIFY_EMAIL_COLUMNS}"#
        ))
        .bind(&arg.username)
        .bind(&arg.email)
        .bind(&arg.secret_code)
        .bind(arg.expired_at)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(verify_email)
    }

    async fn get_verify_email_by_id(
        &mut self,
        id: i64,
    ) -> Result<Option<VerifyEmail>, StoreError> {
        let verify_email = sqlx::query_as::<_, VerifyEmail>(&format!(
            "SELECT {VERIFY_EMAIL_COLUMNS} FROM verify_email WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(verify_email)
    }

    async fn mark_verify_email_used(
        &mut self,
        id: i64,
        secret_code: &str,
    ) -> Result<(), StoreError> {
        // The WHERE clause is the concurrency guard: two callers racing on the
        // same code serialize on the row lock and only one sees is_used = FALSE.
        let result = sqlx::query(
            r#"UPDATE verify_email SET is_used = TRUE
               WHERE id = $1
                 AND secret_code = $2
                 AND is_used = FALSE
                 AND expired_at > NOW()"#,
        )
        .bind(id)
        .bind(secret_code)
        .execute(&mut *self.conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::nothing_affected("mark_verify_email_used"));
        }
        Ok(())
    }

    async fn insert_outbox_event(
        &mut self,
        arg: &NewOutboxEvent,
    ) -> Result<OutboxEvent, StoreError> {
        let event = sqlx::query_as::<_, OutboxEvent>(&format!(
            "INSERT INTO outbox_events (topic, payload) VALUES ($1, $2) RETURNING {OUTBOX_COLUMNS}"
        ))
        .bind(&arg.topic)
        .bind(&arg.payload)
        .fetch_one(&mut *self.conn)
        .await?;

        Ok(event)
    }

    async fn claim_pending_outbox_events(
        &mut self,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let events = sqlx::query_as::<_, OutboxEvent>(&format!(
            r#"SELECT {OUTBOX_COLUMNS} FROM outbox_events
               WHERE dispatched_at IS NULL
                 AND attempts < $2
                 AND next_attempt_at <= NOW()
               ORDER BY id
               LIMIT $1
               FOR UPDATE SKIP LOCKED"#
        ))
        .bind(limit)
        .bind(max_attempts)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(events)
    }

    async fn mark_outbox_event_dispatched(&mut self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE outbox_events SET dispatched_at = NOW() WHERE id = $1 AND dispatched_at IS NULL",
        )
        .bind(id)
        .execute(&mut *self.conn)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::nothing_affected("mark_outbox_event_dispatched"));
        }
        Ok(())
    }

    async fn record_outbox_event_failure(
        &mut self,
        id: i64,
        error: &str,
        retry_after: std::time::Duration,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"UPDATE outbox_events SET
                   attempts = attempts + 1,
                   last_error = $2,
                   next_attempt_at = NOW() + make_interval(secs => $3::float8)
               WHERE id = $1"#,
        )
        .bind(id)
        .bind(error)
        .bind(retry_after.as_secs_f64())
        .execute(&mut *self.conn)
        .await?;

        Ok(())
    }
}
