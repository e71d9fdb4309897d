//! In-process background task queue and mail transports.
//!
//! Requests enqueue a [`Task`] and return immediately; a single worker task
//! drains the channel. Delivery is at-least-once: on start the worker
//! replays every letter still marked unsent, and a letter that is already
//! sent is skipped when its task runs again.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MailConfig;
use crate::letters;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Task {
    SendLetter(String),
}

impl Task {
    pub fn name(&self) -> &'static str {
        match self {
            Task::SendLetter(_) => "send_letter",
        }
    }
}

/// Sending half of the queue. Cheap to clone.
#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Task>,
}

impl TaskQueue {
    /// A queue and the receiver a worker will drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Task>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, task: Task) -> Result<()> {
        debug!(task = task.name(), "enqueue");
        self.tx
            .send(task)
            .map_err(|e| anyhow!("task queue is closed, dropped {}", e.0.name()))
    }
}

/// A rendered email ready for delivery.
#[derive(Debug, Clone, Serialize)]
pub struct OutgoingMessage {
    pub id: String,
    pub from: String,
    pub to: String,
    pub subject: String,
    pub html: String,
    pub text: String,
}

/// Outbound email delivery.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn deliver(&self, message: &OutgoingMessage) -> Result<()>;
}

/// Writes each message as `{outbox_dir}/{letter_id}.json`.
pub struct OutboxTransport {
    dir: PathBuf,
}

impl OutboxTransport {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }
}

#[async_trait]
impl Transport for OutboxTransport {
    async fn deliver(&self, message: &OutgoingMessage) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create outbox: {}", self.dir.display()))?;
        let path = self.dir.join(format!("{}.json", message.id));
        let body = serde_json::to_vec_pretty(message)?;
        tokio::fs::write(&path, body)
            .await
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }
}

/// Logs messages instead of sending them.
pub struct LogTransport;

#[async_trait]
impl Transport for LogTransport {
    async fn deliver(&self, message: &OutgoingMessage) -> Result<()> {
        info!(to = %message.to, subject = %message.subject, "mail delivered to log");
        Ok(())
    }
}

pub fn transport_from_config(mail: &MailConfig) -> Arc<dyn Transport> {
    match mail.transport.as_str() {
        "outbox" => Arc::new(OutboxTransport::new(mail.outbox_dir.clone())),
        _ => Arc::new(LogTransport),
    }
}

/// Spawn the worker: replay unsent letters, then drain the channel until
/// every sender is dropped.
pub fn spawn_worker(
    mut rx: mpsc::UnboundedReceiver<Task>,
    pool: SqlitePool,
    transport: Arc<dyn Transport>,
    from: String,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        match letters::unsent_ids(&pool).await {
            Ok(ids) => {
                if !ids.is_empty() {
                    info!(count = ids.len(), "replaying unsent letters");
                }
                for id in ids {
                    run(&pool, transport.as_ref(), &from, Task::SendLetter(id)).await;
                }
            }
            Err(e) => warn!(error = %e, "failed to load unsent letters"),
        }

        while let Some(task) = rx.recv().await {
            run(&pool, transport.as_ref(), &from, task).await;
        }
        debug!("task queue closed");
    })
}

async fn run(pool: &SqlitePool, transport: &dyn Transport, from: &str, task: Task) {
    let name = task.name();
    let result = match &task {
        Task::SendLetter(id) => letters::deliver(pool, transport, from, id).await,
    };
    if let Err(e) = result {
        warn!(task = name, error = %e, "task failed");
    }
}
