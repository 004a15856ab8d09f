use crate::config::OutboxConfig;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::AuditEvent;
use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundTask {
    Audit(AuditEvent),
}

impl OutboundTask {
    pub fn audit(owner_id: &str, action: &str, entity_id: &str, detail: serde_json::Value) -> Self {
        Self::Audit(AuditEvent {
            id: Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            action: action.to_string(),
            entity_id: entity_id.to_string(),
            detail,
            created_at: Utc::now(),
        })
    }

    fn label(&self) -> &str {
        match self {
            Self::Audit(event) => &event.action,
        }
    }
}

type DeliveryFuture = Pin<Box<dyn Future<Output = AppResult<()>> + Send>>;
pub type Deliverer = Arc<dyn Fn(OutboundTask) -> DeliveryFuture + Send + Sync>;

/// Bounded queue for side effects that must not hold up the request path.
///
/// Delivery is at-most-`max_attempts` and unordered relative to the caller's response.
#[derive(Clone)]
pub struct Outbox {
    sender: mpsc::Sender<OutboundTask>,
    receiver: Arc<Mutex<Option<mpsc::Receiver<OutboundTask>>>>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    shutdown: Arc<Notify>,
    config: OutboxConfig,
}

impl Outbox {
    pub fn new(config: OutboxConfig) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        Self {
            sender,
            receiver: Arc::new(Mutex::new(Some(receiver))),
            worker: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(Notify::new()),
            config,
        }
    }

    /// Never blocks. Returns `false` when the task was dropped.
    pub fn enqueue(&self, task: OutboundTask) -> bool {
        match self.sender.try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Full(task)) => {
                tracing::warn!(task = %task.label(), capacity = self.config.capacity, "outbox full, dropping task");
                false
            }
            Err(TrySendError::Closed(task)) => {
                tracing::warn!(task = %task.label(), "outbox closed, dropping task");
                false
            }
        }
    }

    /// Spawns the delivery worker on the current tokio runtime.
    pub fn start(&self, deliverer: Deliverer) -> AppResult<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| AppError::Internal("outbox requires a tokio runtime".to_string()))?;
        let receiver = self
            .receiver
            .lock()
            .map_err(|_| AppError::Internal("outbox receiver lock poisoned".to_string()))?
            .take()
            .ok_or_else(|| AppError::Internal("outbox already started".to_string()))?;

        let shutdown = self.shutdown.clone();
        let config = self.config;
        let handle = runtime.spawn(async move {
            run_worker(receiver, deliverer, shutdown, config).await;
        });

        let mut worker = self
            .worker
            .lock()
            .map_err(|_| AppError::Internal("outbox worker lock poisoned".to_string()))?;
        *worker = Some(handle);
        Ok(())
    }

    /// Stops accepting tasks, delivers what is already queued, then waits for the worker.
    pub async fn shutdown(&self) {
        let handle = match self.worker.lock() {
            Ok(mut worker) => worker.take(),
            Err(_) => None,
        };
        let Some(handle) = handle else {
            return;
        };
        self.shutdown.notify_one();
        if let Err(error) = handle.await {
            tracing::error!(error = %error, "outbox worker terminated abnormally");
        }
    }
}

async fn run_worker(
    mut receiver: mpsc::Receiver<OutboundTask>,
    deliverer: Deliverer,
    shutdown: Arc<Notify>,
    config: OutboxConfig,
) {
    loop {
        tokio::select! {
            maybe_task = receiver.recv() => {
                let Some(task) = maybe_task else {
                    break;
                };
                deliver(&deliverer, task, config).await;
            }
            _ = shutdown.notified() => {
                receiver.close();
                while let Some(task) = receiver.recv().await {
                    deliver(&deliverer, task, config).await;
                }
                break;
            }
        }
    }
    tracing::debug!("outbox worker stopped");
}

async fn deliver(deliverer: &Deliverer, task: OutboundTask, config: OutboxConfig) {
    let max_attempts = config.max_attempts.max(1);
    let mut backoff = Duration::from_millis(config.retry_backoff_ms);
    for attempt in 1..=max_attempts {
        match deliverer(task.clone()).await {
            Ok(()) => return,
            Err(error) if attempt < max_attempts => {
                tracing::debug!(task = %task.label(), attempt, error = %error, "outbound delivery failed, retrying");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
            }
            Err(error) => {
                tracing::warn!(task = %task.label(), attempts = attempt, error = %error, "outbound task dropped");
            }
        }
    }
}

/// Persists audit events into the entity store.
pub fn store_deliverer(db: Arc<Database>) -> Deliverer {
    Arc::new(move |task: OutboundTask| {
        let db = db.clone();
        Box::pin(async move {
            match task {
                OutboundTask::Audit(event) => {
                    tokio::task::spawn_blocking(move || db.insert_audit_event(&event)).await?
                }
            }
        })
    })
}
