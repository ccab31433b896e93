use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::watch;

use crate::event_bus::{EventBus, EventHandler, Subscription};
use crate::events::{topics, EventEnvelope};
use crate::{AppError, EventBusConfig, RedisService};

const PUBLISH_ATTEMPTS: u32 = 3;
const MAX_READ_BACKOFF: Duration = Duration::from_secs(30);

/// Event bus on Redis Streams: one stream per topic, one consumer group per
/// subscribing service.
#[derive(Clone)]
pub struct RedisStreamEventBus {
    redis: RedisService,
    config: EventBusConfig,
    shutdown: watch::Receiver<bool>,
}

impl RedisStreamEventBus {
    pub fn new(redis: RedisService, config: EventBusConfig, shutdown: watch::Receiver<bool>) -> Self {
        Self {
            redis,
            config,
            shutdown,
        }
    }

    async fn ensure_group(conn: &mut MultiplexedConnection, topic: &str, group_id: &str) -> Result<(), AppError> {
        // "0" so a group created after the first publish still sees the backlog
        let created: redis::RedisResult<()> = conn.xgroup_create_mkstream(topic, group_id, "0").await;
        match created {
            Ok(()) => {
                tracing::info!(topic, group = group_id, "Created consumer group");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl EventBus for RedisStreamEventBus {
    async fn publish(
        &self,
        topic: &str,
        envelope: &EventEnvelope,
        partition_key: Option<&str>,
    ) -> Result<(), AppError> {
        let payload = envelope.encode()?;
        let key = partition_key
            .map(str::to_string)
            .unwrap_or_else(|| envelope.partition_key());
        let fields = [("key", key.as_str()), ("payload", payload.as_str())];

        let mut attempt = 1;
        loop {
            let mut conn = self.redis.connection();
            let result: redis::RedisResult<String> = conn
                .xadd_maxlen(topic, StreamMaxlen::Approx(self.config.stream_max_len), "*", &fields)
                .await;

            match result {
                Ok(entry_id) => {
                    tracing::debug!(topic, key = %key, entry_id = %entry_id, "Published event");
                    return Ok(());
                }
                Err(e) if attempt < PUBLISH_ATTEMPTS && (e.is_io_error() || e.is_connection_dropped()) => {
                    tracing::warn!(topic, attempt, error = %e, "Publish failed, retrying");
                    tokio::time::sleep(Duration::from_millis(100 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn subscribe(
        &self,
        group_id: &str,
        topic: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Subscription, AppError> {
        let mut conn = self.redis.dedicated_connection().await?;
        Self::ensure_group(&mut conn, topic, group_id).await?;

        let consumer = StreamConsumer {
            redis: self.redis.clone(),
            conn,
            topic: topic.to_string(),
            group: group_id.to_string(),
            consumer: self.config.consumer_name.clone(),
            batch: self.config.read_batch_size,
            block_ms: self.config.block_ms,
            dead_letter_max_len: self.config.stream_max_len,
            handler,
            shutdown: self.shutdown.clone(),
        };

        tracing::info!(
            topic,
            group = group_id,
            consumer = %self.config.consumer_name,
            "Subscribed stream consumer"
        );

        let task = tokio::spawn(consumer.run());
        Ok(Subscription::new(group_id, topic, Some(task)))
    }
}

/// Where the next `XREADGROUP` starts.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ReadCursor {
    /// Walking entries delivered before a restart and never acked.
    Pending(String),
    New,
}

impl ReadCursor {
    fn start() -> Self {
        ReadCursor::Pending("0".to_string())
    }

    fn id(&self) -> &str {
        match self {
            ReadCursor::Pending(id) => id,
            ReadCursor::New => ">",
        }
    }

    /// Pending entries are walked once, failed ones included, then only new
    /// entries are read.
    fn advance(self, last_read: Option<&str>) -> Self {
        match (self, last_read) {
            (ReadCursor::Pending(_), Some(id)) => ReadCursor::Pending(id.to_string()),
            (ReadCursor::Pending(_), None) => ReadCursor::New,
            (ReadCursor::New, _) => ReadCursor::New,
        }
    }
}

struct StreamConsumer {
    redis: RedisService,
    conn: MultiplexedConnection,
    topic: String,
    group: String,
    consumer: String,
    batch: usize,
    block_ms: usize,
    dead_letter_max_len: usize,
    handler: Arc<dyn EventHandler>,
    shutdown: watch::Receiver<bool>,
}

impl StreamConsumer {
    async fn run(mut self) {
        let mut cursor = ReadCursor::start();
        let mut backoff = Duration::from_millis(500);

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let options = StreamReadOptions::default()
                .group(&self.group, &self.consumer)
                .count(self.batch)
                .block(self.block_ms);

            let read = {
                let mut shutdown = self.shutdown.clone();
                let keys = [&self.topic];
                let ids = [cursor.id()];
                tokio::select! {
                    _ = shutdown.changed() => break,
                    read = self.conn.xread_options::<_, _, Option<StreamReadReply>>(&keys, &ids, &options) => read,
                }
            };

            let reply = match read {
                Ok(reply) => {
                    backoff = Duration::from_millis(500);
                    reply
                }
                Err(e) => {
                    tracing::warn!(topic = %self.topic, group = %self.group, error = %e, "Stream read failed");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_READ_BACKOFF);
                    match self.redis.dedicated_connection().await {
                        Ok(conn) => self.conn = conn,
                        Err(e) => tracing::warn!(error = %e, "Reconnect failed"),
                    }
                    continue;
                }
            };

            let entries: Vec<StreamId> = reply
                .map(|r| r.keys.into_iter().flat_map(|k| k.ids).collect())
                .unwrap_or_default();

            let last_read = entries.last().map(|entry| entry.id.clone());
            for entry in entries {
                self.process(entry).await;
            }

            let was_pending = cursor != ReadCursor::New;
            cursor = cursor.advance(last_read.as_deref());
            if was_pending && cursor == ReadCursor::New {
                tracing::debug!(topic = %self.topic, "Pending entries drained");
            }
        }

        tracing::info!(topic = %self.topic, group = %self.group, "Stream consumer stopped");
    }

    async fn process(&mut self, entry: StreamId) {
        let payload: Option<String> = entry.get("payload");

        let envelope = match payload.as_deref().map(EventEnvelope::decode) {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => {
                self.dead_letter_raw(&entry.id, payload.as_deref().unwrap_or_default(), &e.to_string())
                    .await;
                return;
            }
            None => {
                self.dead_letter_raw(&entry.id, "", "entry has no payload field").await;
                return;
            }
        };

        match self.handler.handle(&envelope).await {
            Ok(()) => self.ack(&entry.id).await,
            Err(e) => {
                // Left pending; retried after the next consumer restart.
                tracing::error!(
                    topic = %self.topic,
                    handler = self.handler.name(),
                    event_id = %envelope.event_id,
                    entry_id = %entry.id,
                    error = %e,
                    "Handler failed, entry left unacknowledged"
                );
            }
        }
    }

    async fn ack(&mut self, entry_id: &str) {
        let acked: redis::RedisResult<i64> = self.conn.xack(&self.topic, &self.group, &[entry_id]).await;
        if let Err(e) = acked {
            tracing::warn!(topic = %self.topic, entry_id, error = %e, "Failed to acknowledge entry");
        }
    }

    async fn dead_letter_raw(&mut self, entry_id: &str, payload: &str, error: &str) {
        let dlq = topics::dead_letter(&self.topic);
        let fields = [
            ("reason", "undecodable"),
            ("error", error),
            ("entryId", entry_id),
            ("payload", payload),
        ];
        let written: redis::RedisResult<String> = self
            .conn
            .xadd_maxlen(&dlq, StreamMaxlen::Approx(self.dead_letter_max_len), "*", &fields)
            .await;

        match written {
            Ok(_) => {
                tracing::error!(topic = %self.topic, entry_id, error, "Undecodable entry dead-lettered");
                self.ack(entry_id).await;
            }
            Err(e) => {
                tracing::error!(topic = %self.topic, entry_id, error = %e, "Failed to dead-letter undecodable entry");
            }
        }
    }
}
