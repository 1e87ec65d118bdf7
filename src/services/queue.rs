use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

const QUEUE_KEY: &str = "artifact_jobs:queue";
const PROCESSING_KEY: &str = "artifact_jobs:processing";
/// Sorted set of revoked message ids scored by revocation time (unix seconds).
const REVOKED_KEY: &str = "artifact_jobs:revoked_at";
/// Revocations older than this are pruned. Any message still pending by then belongs
/// to a job the expiry sweep has already deleted, which the worker skips anyway.
const REVOKED_RETENTION_SECS: i64 = 24 * 60 * 60;

/// A queued reference to a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkItem {
    pub job_id: Uuid,
}

/// Payload serialized into the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Envelope {
    message_id: String,
    job_id: Uuid,
}

/// A dequeued work item awaiting acknowledgement.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message_id: String,
    pub item: WorkItem,
    payload: String,
}

/// At-least-once delivery channel between submission and workers.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Publish a work item, returning its message id.
    async fn publish(&self, item: &WorkItem) -> Result<String, QueueError>;

    /// Prevent a not-yet-delivered message from being handed to a worker.
    async fn revoke(&self, message_id: &str) -> Result<(), QueueError>;

    /// Take the next live work item, if any. Revoked messages are dropped here.
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError>;

    /// Mark a delivery as fully handled.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Number of messages waiting to be delivered.
    async fn depth(&self) -> Result<u64, QueueError>;

    async fn health_check(&self) -> Result<(), QueueError>;
}

fn envelope(item: &WorkItem) -> Result<(String, String), QueueError> {
    let message_id = Uuid::new_v4().to_string();
    let payload = serde_json::to_string(&Envelope {
        message_id: message_id.clone(),
        job_id: item.job_id,
    })?;
    Ok((message_id, payload))
}

fn open(payload: String) -> Result<Delivery, QueueError> {
    let envelope: Envelope = serde_json::from_str(&payload)?;
    Ok(Delivery {
        message_id: envelope.message_id,
        item: WorkItem {
            job_id: envelope.job_id,
        },
        payload,
    })
}

/// Redis list queue. Dequeued payloads move to a processing list until acked.
pub struct RedisTaskQueue {
    client: redis::Client,
}

impl RedisTaskQueue {
    pub fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url).map_err(QueueError::Redis)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(QueueError::Redis)
    }
}

#[async_trait]
impl TaskQueue for RedisTaskQueue {
    async fn publish(&self, item: &WorkItem) -> Result<String, QueueError> {
        let mut conn = self.connection().await?;
        let (message_id, payload) = envelope(item)?;
        conn.lpush::<_, _, ()>(QUEUE_KEY, &payload).await?;
        Ok(message_id)
    }

    async fn revoke(&self, message_id: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let now = chrono::Utc::now().timestamp();
        conn.zadd::<_, _, _, ()>(REVOKED_KEY, message_id, now).await?;
        // Ids revoked after their message was delivered are never matched by dequeue.
        conn.zrembyscore::<_, _, _, ()>(REVOKED_KEY, "-inf", now - REVOKED_RETENTION_SECS)
            .await?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let mut conn = self.connection().await?;
        loop {
            let payload: Option<String> = conn.rpoplpush(QUEUE_KEY, PROCESSING_KEY).await?;
            let Some(payload) = payload else {
                return Ok(None);
            };

            let delivery = match open(payload.clone()) {
                Ok(delivery) => delivery,
                Err(e) => {
                    tracing::error!(error = %e, "Dropping undecodable queue payload");
                    conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload).await?;
                    continue;
                }
            };

            let revoked: i64 = conn.zrem(REVOKED_KEY, &delivery.message_id).await?;
            if revoked > 0 {
                tracing::info!(
                    job_id = %delivery.item.job_id,
                    message_id = %delivery.message_id,
                    "Skipping revoked message"
                );
                conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &payload).await?;
                continue;
            }

            return Ok(Some(delivery));
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        conn.lrem::<_, _, ()>(PROCESSING_KEY, 1, &delivery.payload)
            .await?;
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        let mut conn = self.connection().await?;
        let depth: u64 = conn.llen(QUEUE_KEY).await?;
        Ok(depth)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .map_err(QueueError::Redis)?;
        Ok(())
    }
}

/// In-process queue for single-binary deployments and tests.
#[derive(Default)]
pub struct MemoryTaskQueue {
    state: Mutex<MemoryQueueState>,
}

#[derive(Default)]
struct MemoryQueueState {
    pending: VecDeque<String>,
    in_flight: Vec<String>,
}

impl MemoryTaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemoryQueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Number of delivered but unacknowledged messages.
    pub fn in_flight(&self) -> usize {
        self.state().in_flight.len()
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn publish(&self, item: &WorkItem) -> Result<String, QueueError> {
        let (message_id, payload) = envelope(item)?;
        self.state().pending.push_back(payload);
        Ok(message_id)
    }

    /// Removes the message from the pending list. Already delivered messages are untouched.
    async fn revoke(&self, message_id: &str) -> Result<(), QueueError> {
        self.state().pending.retain(|payload| {
            serde_json::from_str::<Envelope>(payload)
                .map_or(true, |envelope| envelope.message_id != message_id)
        });
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let mut state = self.state();
        let Some(payload) = state.pending.pop_front() else {
            return Ok(None);
        };
        let delivery = open(payload)?;
        state.in_flight.push(delivery.payload.clone());
        Ok(Some(delivery))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        let mut state = self.state();
        if let Some(pos) = state.in_flight.iter().position(|p| *p == delivery.payload) {
            state.in_flight.remove(pos);
        }
        Ok(())
    }

    async fn depth(&self) -> Result<u64, QueueError> {
        Ok(self.state().pending.len() as u64)
    }

    async fn health_check(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
