use super::{FeedError, RecordSource};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Client};
use tokio::time::{timeout, Duration};

const CONNECT_TIMEOUT_SECS: u64 = 5;
/// Field holding the JSON payload of each stream entry
pub const PAYLOAD_FIELD: &str = "data";

/// Reads reference records from a Redis stream
///
/// The id of the last delivered entry is checkpointed under `checkpoint_key`
/// before the batch is handed out, so a restart resumes after it and never
/// redelivers a record (at-most-once).
pub struct RedisStreamSource {
    conn: ConnectionManager,
    stream_key: String,
    checkpoint_key: String,
    last_id: String,
    block_ms: usize,
    batch_size: usize,
}

impl RedisStreamSource {
    /// Connect and resume from the stored checkpoint, or from new entries only
    pub async fn connect(
        redis_url: &str,
        stream_key: &str,
        checkpoint_key: &str,
        block_ms: usize,
        batch_size: usize,
    ) -> Result<Self, FeedError> {
        let client = Client::open(redis_url)?;
        let mut conn = timeout(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            ConnectionManager::new(client),
        )
        .await
        .map_err(|_| FeedError::ConnectTimeout(CONNECT_TIMEOUT_SECS))??;

        let checkpoint: Option<String> = conn.get(checkpoint_key).await?;
        let last_id = checkpoint.unwrap_or_else(|| "$".to_string());

        tracing::info!(
            stream = stream_key,
            resume_from = %last_id,
            "Connected to reference stream at {}",
            redis_url
        );

        Ok(Self {
            conn,
            stream_key: stream_key.to_string(),
            checkpoint_key: checkpoint_key.to_string(),
            last_id,
            block_ms,
            batch_size,
        })
    }
}

#[async_trait]
impl RecordSource for RedisStreamSource {
    async fn next_batch(&mut self) -> Result<Vec<Vec<u8>>, FeedError> {
        let options = StreamReadOptions::default()
            .block(self.block_ms)
            .count(self.batch_size);

        let reply: Option<StreamReadReply> = self
            .conn
            .xread_options(&[&self.stream_key], &[&self.last_id], &options)
            .await?;

        let Some(reply) = reply else {
            return Ok(Vec::new()); // block timeout
        };

        let mut records = Vec::new();
        for entry in reply.keys.into_iter().flat_map(|k| k.ids) {
            match entry.get::<Vec<u8>>(PAYLOAD_FIELD) {
                Some(data) => records.push(data),
                None => tracing::warn!(id = %entry.id, "Stream entry without '{}' field", PAYLOAD_FIELD),
            }
            self.last_id = entry.id;
        }

        self.conn
            .set::<_, _, ()>(&self.checkpoint_key, &self.last_id)
            .await?;

        Ok(records)
    }
}
