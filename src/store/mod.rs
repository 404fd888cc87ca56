//! User directory and completion ledger storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent)
//!
//! Both stores are injected into the task service as trait objects so a persistent
//! backend can be added without touching the service.

mod memory;

pub use memory::{InMemoryCompletionStore, InMemoryUserStore};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// A user known to the service, keyed by the identity provider's uid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    #[serde(rename = "uid")]
    pub id: String,
    pub email: Option<String>,
    pub display_name: Option<String>,
    /// Custodial wallet address on Flow, once one has been assigned
    #[serde(rename = "flowAccount")]
    pub external_wallet_address: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(rename = "lastLogin")]
    pub last_login_at: DateTime<Utc>,
}

/// Profile fields reported by the identity provider at login.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserProfile {
    pub id: String,
    pub email: Option<String>,
    pub name: Option<String>,
}

/// Proof that a user completed a catalog task on a given day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRecord {
    pub id: Uuid,
    pub user_id: String,
    pub date: NaiveDate,
    pub task_id: String,
    pub completed_at: DateTime<Utc>,
    /// Opaque client-supplied evidence
    pub proof: serde_json::Value,
    pub reward: u64,
}

/// All completions recorded for one user on one day, in insertion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayCompletions {
    pub date: NaiveDate,
    pub completions: Vec<CompletionRecord>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    /// A record already exists for the (user, date, task) triple.
    #[error("completion already recorded for task {task_id} on {date}")]
    Conflict { task_id: String, date: NaiveDate },

    #[error("storage backend failure: {0}")]
    Backend(String),
}

/// User directory.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<User>, StoreError>;

    /// Create the user on first login, otherwise refresh `last_login_at`.
    async fn upsert_login(&self, profile: &UserProfile) -> Result<User, StoreError>;

    /// Record the wallet address assigned to a user. Returns false if the user is unknown.
    async fn set_wallet_address(&self, id: &str, address: &str) -> Result<bool, StoreError>;
}

/// Completion ledger: user -> date -> task -> record.
#[async_trait]
pub trait CompletionStore: Send + Sync {
    async fn get(
        &self,
        user_id: &str,
        date: NaiveDate,
        task_id: &str,
    ) -> Result<Option<CompletionRecord>, StoreError>;

    /// Insert the record unless one exists for its (user, date, task) triple.
    ///
    /// The existence check and the insert are one atomic step.
    /// Returns `StoreError::Conflict` when a record is already present.
    async fn insert_if_absent(&self, record: CompletionRecord) -> Result<(), StoreError>;

    /// Every day bucket for a user, oldest date first.
    async fn list_by_user(&self, user_id: &str) -> Result<Vec<DayCompletions>, StoreError>;

    /// Completions for one user on one day.
    async fn list_day(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<CompletionRecord>, StoreError>;
}
