//! In-memory repository for testing orchestration logic without a database.
//!
//! Mirrors the SQL semantics of `PgRepository` closely enough for the
//! orchestrators: conditional updates, RETURNING rows, ordering by id.
//! Not transactional.

use std::collections::{BTreeMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::error::StoreError;
use super::models::{
    Account, Entry, NewAccount, NewEntry, NewOutboxEvent, NewSession, NewTransfer, NewUser,
    NewVerifyEmail, OutboxEvent, Session, Transfer, UpdateUserParams, User, VerifyEmail,
};
use super::repository::Repository;

#[derive(Default)]
pub struct MemRepository {
    next_id: i64,
    accounts: BTreeMap<i64, Account>,
    entries: BTreeMap<i64, Entry>,
    transfers: BTreeMap<i64, Transfer>,
    users: BTreeMap<String, User>,
    sessions: BTreeMap<Uuid, Session>,
    verify_emails: BTreeMap<i64, VerifyEmail>,
    outbox: BTreeMap<i64, OutboxEvent>,
    /// Account ids in the order `add_account_balance` touched them
    balance_updates: Vec<i64>,
    /// Outbox ids currently claimed (stands in for row locks)
    claimed: HashSet<i64>,
    fail_insert_user: bool,
}

impl MemRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    pub fn seed_account(&mut self, owner: &str, balance: i64, currency: &str) -> i64 {
        let id = self.next_id();
        self.accounts.insert(
            id,
            Account {
                id,
                owner: owner.to_string(),
                balance,
                currency: currency.to_string(),
                created_at: Utc::now(),
            },
        );
        id
    }

    pub fn seed_user(&mut self, username: &str, email: &str) -> User {
        let now = Utc::now();
        let user = User {
            username: username.to_string(),
            hashed_password: "hashed".to_string(),
            full_name: username.to_uppercase(),
            email: email.to_string(),
            is_email_verified: false,
            created_at: now,
            updated_at: now,
        };
        self.users.insert(username.to_string(), user.clone());
        user
    }

    /// Force the expiry of a verification code into the past.
    pub fn expire_verify_email(&mut self, id: i64) {
        if let Some(v) = self.verify_emails.get_mut(&id) {
            v.expired_at = Utc::now() - chrono::Duration::seconds(1);
        }
    }

    pub fn set_fail_insert_user(&mut self, fail: bool) {
        self.fail_insert_user = fail;
    }

    pub fn balance_update_order(&self) -> Vec<i64> {
        self.balance_updates.clone()
    }

    pub fn outbox_events(&self) -> Vec<OutboxEvent> {
        self.outbox.values().cloned().collect()
    }

    /// Release claimed outbox rows, as a commit or rollback would.
    pub fn release_claims(&mut self) {
        self.claimed.clear();
    }

    /// Pull an event's retry time back to now, as if its backoff elapsed.
    pub fn make_outbox_event_due(&mut self, id: i64) {
        if let Some(e) = self.outbox.get_mut(&id) {
            e.next_attempt_at = Utc::now();
        }
    }
}

fn page<T: Clone>(items: impl Iterator<Item = T>, limit: i64, offset: i64) -> Vec<T> {
    items
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

#[async_trait]
impl Repository for MemRepository {
    async fn insert_account(&mut self, arg: &NewAccount) -> Result<Account, StoreError> {
        let id = self.seed_account(&arg.owner, arg.balance, &arg.currency);
        Ok(self.accounts[&id].clone())
    }

    async fn get_account_by_id(&mut self, id: i64) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.get(&id).cloned())
    }

    async fn get_account_by_owner_and_currency(
        &mut self,
        owner: &str,
        currency: &str,
    ) -> Result<Option<Account>, StoreError> {
        Ok(self
            .accounts
            .values()
            .find(|a| a.owner == owner && a.currency == currency)
            .cloned())
    }

    async fn get_account_by_id_for_update(
        &mut self,
        id: i64,
    ) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.get(&id).cloned())
    }

    async fn list_accounts(
        &mut self,
        owner: &str,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Account>, StoreError> {
        Ok(page(
            self.accounts.values().filter(|a| a.owner == owner).cloned(),
            limit,
            offset,
        ))
    }

    async fn update_account(
        &mut self,
        id: i64,
        balance: i64,
        currency: &str,
    ) -> Result<Option<Account>, StoreError> {
        Ok(self.accounts.get_mut(&id).map(|a| {
            a.balance = balance;
            a.currency = currency.to_string();
            a.clone()
        }))
    }

    async fn delete_account(&mut self, id: i64) -> Result<bool, StoreError> {
        Ok(self.accounts.remove(&id).is_some())
    }

    async fn add_account_balance(&mut self, id: i64, delta: i64) -> Result<Account, StoreError> {
        let account = self
            .accounts
            .get_mut(&id)
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;
        account.balance += delta;
        self.balance_updates.push(id);
        Ok(account.clone())
    }

    async fn insert_entry(&mut self, arg: &NewEntry) -> Result<Entry, StoreError> {
        let id = self.next_id();
        let entry = Entry {
            id,
            account_id: arg.account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.entries.insert(id, entry.clone());
        Ok(entry)
    }

    async fn get_entry_by_id(&mut self, id: i64) -> Result<Option<Entry>, StoreError> {
        Ok(self.entries.get(&id).cloned())
    }

    async fn list_entries(
        &mut self,
        account_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Entry>, StoreError> {
        Ok(page(
            self.entries
                .values()
                .filter(|e| e.account_id == account_id)
                .cloned(),
            limit,
            offset,
        ))
    }

    async fn insert_transfer(&mut self, arg: &NewTransfer) -> Result<Transfer, StoreError> {
        let id = self.next_id();
        let transfer = Transfer {
            id,
            from_account_id: arg.from_account_id,
            to_account_id: arg.to_account_id,
            amount: arg.amount,
            created_at: Utc::now(),
        };
        self.transfers.insert(id, transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer_by_id(&mut self, id: i64) -> Result<Option<Transfer>, StoreError> {
        Ok(self.transfers.get(&id).cloned())
    }

    async fn list_transfers(
        &mut self,
        from_account_id: i64,
        to_account_id: i64,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transfer>, StoreError> {
        Ok(page(
            self.transfers
                .values()
                .filter(|t| t.from_account_id == from_account_id || t.to_account_id == to_account_id)
                .cloned(),
            limit,
            offset,
        ))
    }

    async fn insert_user(&mut self, arg: &NewUser) -> Result<User, StoreError> {
        if self.fail_insert_user || self.users.contains_key(&arg.username) {
            return Err(StoreError::Database(sqlx::Error::Protocol(format!(
                "duplicate key value violates unique constraint \"users_pkey\": {}",
                arg.username
            ))));
        }
        let now = Utc::now();
        let user = User {
            username: arg.username.clone(),
            hashed_password: arg.hashed_password.clone(),
            full_name: arg.full_name.clone(),
            email: arg.email.clone(),
            is_email_verified: false,
            created_at: now,
            updated_at: now,
        };
        self.users.insert(arg.username.clone(), user.clone());
        Ok(user)
    }

    async fn get_user_by_username(&mut self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(username).cloned())
    }

    async fn get_user_by_email(&mut self, email: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.values().find(|u| u.email == email).cloned())
    }

    async fn list_users(&mut self, limit: i64, offset: i64) -> Result<Vec<User>, StoreError> {
        Ok(page(self.users.values().cloned(), limit, offset))
    }

    async fn update_user(&mut self, arg: &UpdateUserParams) -> Result<Option<User>, StoreError> {
        Ok(self.users.get_mut(&arg.username).map(|u| {
            if let Some(v) = &arg.hashed_password {
                u.hashed_password = v.clone();
            }
            if let Some(v) = &arg.full_name {
                u.full_name = v.clone();
            }
            if let Some(v) = &arg.email {
                u.email = v.clone();
            }
            if let Some(v) = arg.is_email_verified {
                u.is_email_verified = v;
            }
            u.updated_at = Utc::now();
            u.clone()
        }))
    }

    async fn delete_user(&mut self, username: &str) -> Result<bool, StoreError> {
        Ok(self.users.remove(username).is_some())
    }

    async fn insert_session(&mut self, arg: &NewSession) -> Result<Session, StoreError> {
        let session = Session {
            id: arg.id,
            username: arg.username.clone(),
            refresh_token: arg.refresh_token.clone(),
            user_agent: arg.user_agent.clone(),
            client_ip: arg.client_ip.clone(),
            is_blocked: false,
            expired_at: arg.expired_at,
            created_at: Utc::now(),
        };
        self.sessions.insert(arg.id, session.clone());
        Ok(session)
    }

    async fn get_session_by_id(&mut self, id: Uuid) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get(&id).cloned())
    }

    async fn block_session(&mut self, id: Uuid) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.get_mut(&id).map(|s| {
            s.is_blocked = true;
            s.clone()
        }))
    }

    async fn insert_verify_email(
        &mut self,
        arg: &NewVerifyEmail,
    ) -> Result<VerifyEmail, StoreError> {
        let id = self.next_id();
        let verify_email = VerifyEmail {
            id,
            username: arg.username.clone(),
            email: arg.email.clone(),
            secret_code: arg.secret_code.clone(),
            is_used: false,
            created_at: Utc::now(),
            expired_at: arg.expired_at,
        };
        self.verify_emails.insert(id, verify_email.clone());
        Ok(verify_email)
    }

    async fn get_verify_email_by_id(
        &mut self,
        id: i64,
    ) -> Result<Option<VerifyEmail>, StoreError> {
        Ok(self.verify_emails.get(&id).cloned())
    }

    async fn mark_verify_email_used(
        &mut self,
        id: i64,
        secret_code: &str,
    ) -> Result<(), StoreError> {
        match self.verify_emails.get_mut(&id) {
            Some(v) if v.is_consumable(secret_code, Utc::now()) => {
                v.is_used = true;
                Ok(())
            }
            _ => Err(StoreError::nothing_affected("mark_verify_email_used")),
        }
    }

    async fn insert_outbox_event(
        &mut self,
        arg: &NewOutboxEvent,
    ) -> Result<OutboxEvent, StoreError> {
        let id = self.next_id();
        let event = OutboxEvent {
            id,
            topic: arg.topic.clone(),
            payload: arg.payload.clone(),
            attempts: 0,
            last_error: None,
            created_at: Utc::now(),
            dispatched_at: None,
            next_attempt_at: Utc::now(),
        };
        self.outbox.insert(id, event.clone());
        Ok(event)
    }

    async fn claim_pending_outbox_events(
        &mut self,
        limit: i64,
        max_attempts: i32,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let now = Utc::now();
        let claimed: Vec<OutboxEvent> = page(
            self.outbox
                .values()
                .filter(|e| {
                    e.dispatched_at.is_none()
                        && e.attempts < max_attempts
                        && e.next_attempt_at <= now
                        && !self.claimed.contains(&e.id)
                })
                .cloned(),
            limit,
            0,
        );
        self.claimed.extend(claimed.iter().map(|e| e.id));
        Ok(claimed)
    }

    async fn mark_outbox_event_dispatched(&mut self, id: i64) -> Result<(), StoreError> {
        match self.outbox.get_mut(&id) {
            Some(e) if e.dispatched_at.is_none() => {
                e.dispatched_at = Some(Utc::now());
                Ok(())
            }
            _ => Err(StoreError::nothing_affected("mark_outbox_event_dispatched")),
        }
    }

    async fn record_outbox_event_failure(
        &mut self,
        id: i64,
        error: &str,
        retry_after: std::time::Duration,
    ) -> Result<(), StoreError> {
        if let Some(e) = self.outbox.get_mut(&id) {
            e.attempts += 1;
            e.last_error = Some(error.to_string());
            e.next_attempt_at = Utc::now() + chrono::Duration::from_std(retry_after).unwrap();
        }
        Ok(())
    }
}
