//! Asynchronous reward queue.
//!
//! The task service enqueues one job per recorded completion. A worker drains the channel
//! and runs each job on its own task: resolve account, set up the vault, mint. Transient
//! dispatcher errors are retried with exponential backoff. A completion id is claimed
//! before processing, so enqueueing the same completion twice mints once. The completion id
//! is also handed to the dispatcher as the mint reference, which covers retries after an
//! ambiguous failure and completions older than the in-memory mint history.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

use super::{backoff_delay, RewardDispatcher, RewardError};
use crate::store::UserStore;

/// A reward owed for one completion record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardJob {
    /// Completion record id (idempotency key)
    pub completion_id: Uuid,
    pub user_id: String,
    pub task_id: String,
    pub amount: u64,
}

#[derive(Debug, Clone)]
pub struct RewardQueueConfig {
    /// Attempts per dispatcher call, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Pending jobs before enqueue starts failing
    pub capacity: usize,
    /// Minted completions remembered for dedup and `transaction_for`
    pub history: usize,
}

impl Default for RewardQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            capacity: 1024,
            history: 10_000,
        }
    }
}

/// Completions in flight plus a bounded record of recent mints.
#[derive(Default)]
struct Ledger {
    in_flight: HashSet<Uuid>,
    minted: HashMap<Uuid, String>,
    /// Mint order, oldest first
    order: VecDeque<Uuid>,
}

impl Ledger {
    /// Returns false if the completion is in flight or recently minted.
    fn claim(&mut self, id: Uuid) -> bool {
        !self.minted.contains_key(&id) && self.in_flight.insert(id)
    }

    fn release(&mut self, id: &Uuid) {
        self.in_flight.remove(id);
    }

    fn record_mint(&mut self, id: Uuid, tx_id: String, history: usize) {
        self.in_flight.remove(&id);
        if self.minted.insert(id, tx_id).is_none() {
            self.order.push_back(id);
        }
        while self.order.len() > history.max(1) {
            if let Some(oldest) = self.order.pop_front() {
                self.minted.remove(&oldest);
            }
        }
    }
}

#[derive(Default)]
struct QueueState {
    ledger: Mutex<Ledger>,
}

/// Sender side of the reward queue. Cheap to clone.
#[derive(Clone)]
pub struct RewardQueue {
    tx: mpsc::Sender<RewardJob>,
    state: Arc<QueueState>,
}

impl RewardQueue {
    /// Start the worker. The returned handle completes once every `RewardQueue` clone has
    /// been dropped and in-flight jobs have finished.
    pub fn spawn(
        dispatcher: Arc<dyn RewardDispatcher>,
        users: Arc<dyn UserStore>,
        config: RewardQueueConfig,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.capacity.max(1));
        let state = Arc::new(QueueState::default());
        let worker = Worker {
            dispatcher,
            users,
            config,
            state: Arc::clone(&state),
        };
        let handle = tokio::spawn(worker.run(rx));
        (Self { tx, state }, handle)
    }

    /// Queue a reward. Never blocks; fails if the queue is full or the worker is gone.
    pub fn enqueue(&self, job: RewardJob) -> Result<(), RewardError> {
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(job) => RewardError::QueueUnavailable(format!(
                "reward queue full, dropping completion {}",
                job.completion_id
            )),
            mpsc::error::TrySendError::Closed(job) => RewardError::QueueUnavailable(format!(
                "reward worker stopped, dropping completion {}",
                job.completion_id
            )),
        })
    }

    /// Mint transaction id for a completion, once its reward has been dispatched.
    pub async fn transaction_for(&self, completion_id: Uuid) -> Option<String> {
        self.state.ledger.lock().await.minted.get(&completion_id).cloned()
    }
}

struct Worker {
    dispatcher: Arc<dyn RewardDispatcher>,
    users: Arc<dyn UserStore>,
    config: RewardQueueConfig,
    state: Arc<QueueState>,
}

impl Worker {
    async fn run(self, mut rx: mpsc::Receiver<RewardJob>) {
        let worker = Arc::new(self);
        let mut in_flight = JoinSet::new();

        loop {
            tokio::select! {
                next = rx.recv() => {
                    let Some(job) = next else { break };
                    if !worker.state.ledger.lock().await.claim(job.completion_id) {
                        tracing::debug!(
                            completion_id = %job.completion_id,
                            "Reward already dispatched or in flight, skipping"
                        );
                        continue;
                    }
                    let worker = Arc::clone(&worker);
                    in_flight.spawn(async move { worker.process(job).await });
                }
                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
            }
        }

        while in_flight.join_next().await.is_some() {}
        tracing::info!("Reward queue drained");
    }

    async fn process(&self, job: RewardJob) {
        match self.dispatch(&job).await {
            Ok(tx_id) => {
                tracing::info!(
                    completion_id = %job.completion_id,
                    user_id = %job.user_id,
                    task_id = %job.task_id,
                    amount = job.amount,
                    tx_id = %tx_id,
                    "Reward minted"
                );
                self.state
                    .ledger
                    .lock()
                    .await
                    .record_mint(job.completion_id, tx_id, self.config.history);
            }
            Err(e) => {
                tracing::error!(
                    completion_id = %job.completion_id,
                    user_id = %job.user_id,
                    "Reward dispatch failed: {}",
                    e
                );
                // Release the claim so a later enqueue may try again.
                self.state.ledger.lock().await.release(&job.completion_id);
            }
        }
    }

    async fn dispatch(&self, job: &RewardJob) -> Result<String, RewardError> {
        let dispatcher: &dyn RewardDispatcher = self.dispatcher.as_ref();
        let user_id = job.user_id.as_str();
        let amount = job.amount;
        let reference = job.completion_id;

        let address = self
            .with_retry("create_account", move || dispatcher.create_account(user_id))
            .await?;

        match self.users.set_wallet_address(user_id, &address).await {
            Ok(true) => {}
            Ok(false) => tracing::warn!(user_id, "Rewarded user not in directory"),
            Err(e) => tracing::warn!(user_id, "Failed to record wallet address: {}", e),
        }

        let address = address.as_str();
        self.with_retry("setup_receiving_vault", move || {
            dispatcher.setup_receiving_vault(address)
        })
        .await?;

        self.with_retry("mint", move || dispatcher.mint(address, amount, reference))
            .await
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> Result<T, RewardError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, RewardError>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    attempt += 1;
                    if !error.is_transient() || attempt >= max_attempts {
                        return Err(error);
                    }
                    let delay =
                        backoff_delay(attempt - 1, self.config.base_delay, self.config.max_delay);
                    tracing::warn!(
                        "{} attempt {} failed, retrying in {:?}: {}",
                        op,
                        attempt,
                        delay,
                        error
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
