//! Task event fan-out.
//!
//! Every [`TaskEvents`](crate::plugin::DriverPlugin::task_events) call gets its
//! own bounded queue. Publishing never waits: when a subscriber's queue is
//! full the event is dropped for that subscriber only.
//!
//! ```text
//!    emit(event)
//!        ├──► [queue 1] ─► caller 1
//!        ├──► [queue 2] ─► caller 2
//!        └──► [queue N] ─► caller N
//! ```

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::TaskConfig;

/// A notable occurrence in a task's life.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task_id: String,
    pub alloc_id: String,
    pub task_name: String,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub annotations: HashMap<String, String>,
    pub err: Option<String>,
}

impl TaskEvent {
    pub fn new(task: &TaskConfig, message: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            alloc_id: task.alloc_id.clone(),
            task_name: task.name.clone(),
            timestamp: Utc::now(),
            message: message.into(),
            annotations: HashMap::new(),
            err: None,
        }
    }

    pub fn annotate(mut self, key: &str, value: impl ToString) -> Self {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_err(mut self, err: impl Into<String>) -> Self {
        self.err = Some(err.into());
        self
    }
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<TaskEvent>,
}

/// Multiplexes task events onto per-caller streams.
pub struct Eventer {
    subscribers: Arc<Mutex<Vec<Subscriber>>>,
    buffer: usize,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl Eventer {
    /// Create a multiplexer that lives until `shutdown` fires.
    pub fn new(buffer: usize, shutdown: CancellationToken) -> Self {
        Self {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            buffer: buffer.max(1),
            next_id: AtomicU64::new(0),
            shutdown,
        }
    }

    /// Open a stream of events. It closes when `cancel` or the multiplexer's
    /// shutdown token fires; dropping it unsubscribes.
    pub async fn subscribe(&self, cancel: CancellationToken) -> ReceiverStream<TaskEvent> {
        let (tx, rx) = mpsc::channel(self.buffer);
        if self.shutdown.is_cancelled() || cancel.is_cancelled() {
            return ReceiverStream::new(rx);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let watch = tx.clone();
        self.subscribers
            .lock()
            .await
            .push(Subscriber { id, sender: tx });
        debug!(subscriber = id, "Task event subscriber added");

        let subscribers = Arc::clone(&self.subscribers);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = shutdown.cancelled() => {}
                _ = watch.closed() => {}
            }
            subscribers.lock().await.retain(|s| s.id != id);
            drop(watch);
            debug!(subscriber = id, "Task event subscriber removed");
        });

        ReceiverStream::new(rx)
    }

    /// Publish one event to every subscriber without waiting on any of them.
    pub async fn emit(&self, event: TaskEvent) {
        if self.shutdown.is_cancelled() {
            return;
        }

        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|subscriber| match subscriber.sender.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(
                    subscriber = subscriber.id,
                    task_id = %event.task_id,
                    "Dropped task event: subscriber queue full"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = subscriber.id, "Subscriber gone, removing");
                false
            }
        });
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}
