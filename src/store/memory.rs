//! In-memory stores (non-persistent).

use super::{
    CompletionRecord, CompletionStore, DayCompletions, StoreError, User, UserProfile, UserStore,
};
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Clone, Default)]
pub struct InMemoryUserStore {
    users: Arc<RwLock<HashMap<String, User>>>,
}

impl InMemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserStore for InMemoryUserStore {
    async fn get(&self, id: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.read().await.get(id).cloned())
    }

    async fn upsert_login(&self, profile: &UserProfile) -> Result<User, StoreError> {
        let now = Utc::now();
        let mut users = self.users.write().await;
        let user = users.entry(profile.id.clone()).or_insert_with(|| User {
            id: profile.id.clone(),
            email: profile.email.clone(),
            display_name: profile.name.clone().or_else(|| profile.email.clone()),
            external_wallet_address: None,
            created_at: now,
            last_login_at: now,
        });
        user.last_login_at = now;
        Ok(user.clone())
    }

    async fn set_wallet_address(&self, id: &str, address: &str) -> Result<bool, StoreError> {
        let mut users = self.users.write().await;
        match users.get_mut(id) {
            Some(user) => {
                user.external_wallet_address = Some(address.to_string());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

type UserLedger = BTreeMap<NaiveDate, Vec<CompletionRecord>>;

#[derive(Clone, Default)]
pub struct InMemoryCompletionStore {
    ledger: Arc<RwLock<HashMap<String, UserLedger>>>,
}

impl InMemoryCompletionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CompletionStore for InMemoryCompletionStore {
    async fn get(
        &self,
        user_id: &str,
        date: NaiveDate,
        task_id: &str,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .get(user_id)
            .and_then(|days| days.get(&date))
            .and_then(|day| day.iter().find(|r| r.task_id == task_id))
            .cloned())
    }

    async fn insert_if_absent(&self, record: CompletionRecord) -> Result<(), StoreError> {
        // Single write guard for check and insert.
        let mut ledger = self.ledger.write().await;
        let day = ledger
            .entry(record.user_id.clone())
            .or_default()
            .entry(record.date)
            .or_default();
        if day.iter().any(|r| r.task_id == record.task_id) {
            return Err(StoreError::Conflict {
                task_id: record.task_id,
                date: record.date,
            });
        }
        day.push(record);
        Ok(())
    }

    async fn list_by_user(&self, user_id: &str) -> Result<Vec<DayCompletions>, StoreError> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .get(user_id)
            .map(|days| {
                days.iter()
                    .filter(|(_, completions)| !completions.is_empty())
                    .map(|(date, completions)| DayCompletions {
                        date: *date,
                        completions: completions.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_day(
        &self,
        user_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<CompletionRecord>, StoreError> {
        let ledger = self.ledger.read().await;
        Ok(ledger
            .get(user_id)
            .and_then(|days| days.get(&date))
            .cloned()
            .unwrap_or_default())
    }
}
