//! Transactional outbox
//!
//! Side effects recorded as `outbox_events` rows by
//! [`crate::store::Store::create_user_with_outbox`] are handed to the task
//! queue here, after the producing transaction has committed.

pub mod dispatcher;

pub use dispatcher::{DispatchReport, OutboxDispatcher, deliver, dispatch_batch};
