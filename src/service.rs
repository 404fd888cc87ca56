//! Daily task service.
//!
//! Merges the catalog with the completion ledger, records completions (one per user,
//! day and task) and hands rewards to the reward queue. "Today" is the UTC calendar day.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use crate::catalog::{Catalog, TaskDefinition};
use crate::rewards::{RewardDispatcher, RewardJob, RewardQueue, REWARD_CURRENCY};
use crate::store::{
    CompletionRecord, CompletionStore, StoreError, User, UserProfile, UserStore,
};

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("{0}")]
    Validation(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("User not found: {0}")]
    UserNotFound(String),

    #[error("Task {task_id} already completed on {date}")]
    AlreadyCompleted { task_id: String, date: NaiveDate },

    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict { task_id, date } => TaskError::AlreadyCompleted { task_id, date },
            other => TaskError::Store(other),
        }
    }
}

/// A catalog task with today's completion state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyTask {
    #[serde(flatten)]
    pub definition: TaskDefinition,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DailyTasks {
    pub tasks: Vec<DailyTask>,
    pub date: NaiveDate,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub completion_id: Uuid,
    pub task_id: String,
    pub reward: u64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryDay {
    pub date: NaiveDate,
    pub completions: Vec<CompletionRecord>,
    pub total_reward: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct Balance {
    pub balance: f64,
    pub currency: &'static str,
}

/// Current task day (UTC).
pub fn current_day() -> NaiveDate {
    Utc::now().date_naive()
}

/// Whether a proof payload carries anything at all.
///
/// `null`, `false`, `0`, blank strings and empty arrays or objects count as missing.
fn is_proof_present(proof: &serde_json::Value) -> bool {
    match proof {
        serde_json::Value::Null => false,
        serde_json::Value::Bool(b) => *b,
        serde_json::Value::String(s) => !s.trim().is_empty(),
        serde_json::Value::Array(a) => !a.is_empty(),
        serde_json::Value::Object(o) => !o.is_empty(),
        serde_json::Value::Number(n) => n.as_f64().map_or(true, |v| v != 0.0),
    }
}

pub struct TaskService {
    catalog: Catalog,
    users: Arc<dyn UserStore>,
    completions: Arc<dyn CompletionStore>,
    dispatcher: Arc<dyn RewardDispatcher>,
    rewards: Option<RewardQueue>,
}

impl TaskService {
    pub fn new(
        catalog: Catalog,
        users: Arc<dyn UserStore>,
        completions: Arc<dyn CompletionStore>,
        dispatcher: Arc<dyn RewardDispatcher>,
    ) -> Self {
        Self {
            catalog,
            users,
            completions,
            dispatcher,
            rewards: None,
        }
    }

    /// Send a reward job for every new completion.
    pub fn with_reward_queue(mut self, queue: RewardQueue) -> Self {
        self.rewards = Some(queue);
        self
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Create or refresh the user behind a verified identity.
    pub async fn login(&self, profile: &UserProfile) -> Result<User, TaskError> {
        let user = self.users.upsert_login(profile).await?;
        tracing::info!(user_id = %user.id, "User logged in");
        Ok(user)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<User, TaskError> {
        self.users
            .get(user_id)
            .await?
            .ok_or_else(|| TaskError::UserNotFound(user_id.to_string()))
    }

    /// Catalog tasks annotated with the user's completions on `as_of`.
    pub async fn get_daily_tasks(
        &self,
        user_id: &str,
        as_of: NaiveDate,
    ) -> Result<DailyTasks, TaskError> {
        self.get_user(user_id).await?;
        let done = self.completions.list_day(user_id, as_of).await?;

        let tasks = self
            .catalog
            .tasks()
            .iter()
            .map(|definition| {
                let record = done.iter().find(|r| r.task_id == definition.id);
                DailyTask {
                    definition: *definition,
                    completed: record.is_some(),
                    completed_at: record.map(|r| r.completed_at),
                }
            })
            .collect();

        Ok(DailyTasks {
            tasks,
            date: as_of,
        })
    }

    /// Record a completion of `task_id` for `as_of` and queue its reward.
    pub async fn complete_task(
        &self,
        user_id: &str,
        task_id: &str,
        proof: serde_json::Value,
        as_of: NaiveDate,
    ) -> Result<CompletionOutcome, TaskError> {
        if task_id.trim().is_empty() || !is_proof_present(&proof) {
            return Err(TaskError::Validation(
                "Task ID and proof required".to_string(),
            ));
        }

        let definition = self
            .catalog
            .find(task_id)
            .ok_or_else(|| TaskError::TaskNotFound(task_id.to_string()))?;

        if self
            .completions
            .get(user_id, as_of, definition.id)
            .await?
            .is_some()
        {
            return Err(TaskError::AlreadyCompleted {
                task_id: definition.id.to_string(),
                date: as_of,
            });
        }

        self.get_user(user_id).await?;

        let record = CompletionRecord {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            date: as_of,
            task_id: definition.id.to_string(),
            completed_at: Utc::now(),
            proof,
            reward: definition.reward,
        };
        let completion_id = record.id;

        // A concurrent duplicate loses here and surfaces as AlreadyCompleted.
        self.completions.insert_if_absent(record).await?;

        tracing::info!(
            user_id,
            task_id = definition.id,
            reward = definition.reward,
            %as_of,
            "Task completed"
        );

        if let Some(queue) = &self.rewards {
            let job = RewardJob {
                completion_id,
                user_id: user_id.to_string(),
                task_id: definition.id.to_string(),
                amount: definition.reward,
            };
            if let Err(e) = queue.enqueue(job) {
                tracing::error!(user_id, %completion_id, "Failed to queue reward: {}", e);
            }
        }

        Ok(CompletionOutcome {
            completion_id,
            task_id: definition.id.to_string(),
            reward: definition.reward,
            message: format!(
                "Task completed! You earned {} {} tokens.",
                definition.reward, REWARD_CURRENCY
            ),
        })
    }

    /// Completions grouped by day, oldest first, with the day's reward total.
    pub async fn get_history(&self, user_id: &str) -> Result<Vec<HistoryDay>, TaskError> {
        let days = self.completions.list_by_user(user_id).await?;
        Ok(days
            .into_iter()
            .map(|day| HistoryDay {
                date: day.date,
                total_reward: day.completions.iter().map(|c| c.reward).sum(),
                completions: day.completions,
            })
            .collect())
    }

    /// Token balance of the user's reward account. Dispatcher failures read as zero.
    pub async fn get_balance(&self, user_id: &str) -> Result<Balance, TaskError> {
        let user = self.get_user(user_id).await?;
        let address = user
            .external_wallet_address
            .unwrap_or_else(|| self.dispatcher.account_for(&user.id));

        let balance = match self.dispatcher.get_balance(&address).await {
            Ok(balance) => balance,
            Err(e) => {
                tracing::warn!(user_id, %address, "Balance lookup failed: {}", e);
                0.0
            }
        };

        Ok(Balance {
            balance,
            currency: REWARD_CURRENCY,
        })
    }
}
