//! # unwalleted
//!
//! Daily social tasks that pay out reward tokens without the user ever touching a wallet.
//!
//! This library provides:
//! - A fixed catalog of daily tasks and a per-user, per-day completion ledger
//! - Session auth on top of Firebase ID tokens
//! - A background reward queue that provisions custodial accounts and mints tokens
//!
//! ## Completion Flow
//! 1. Client logs in with an ID token and receives a session JWT
//! 2. Client completes a task with a proof payload
//! 3. The ledger records it once per task per UTC day
//! 4. A reward job is queued; the worker creates the account, sets up the vault and mints

pub mod api;
pub mod catalog;
pub mod config;
pub mod identity;
pub mod rewards;
pub mod service;
pub mod store;

pub use config::Config;
