// Reference price stream: decoding, throttling and hand-off to the price tracker
pub mod redis_stream;

pub use redis_stream::RedisStreamSource;

use crate::execution::PriceTracker;
use crate::models::ReferenceAverage;
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("failed to decode reference record: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("redis connection timeout after {0}s")]
    ConnectTimeout(u64),
    #[error("stream closed")]
    Closed,
}

/// Wire format of a book price average record
#[derive(Debug, Deserialize)]
pub struct BookPriceAverage {
    #[serde(rename = "PRODUCT_ID")]
    pub product_id: String,
    #[serde(rename = "TICKER_SYMBOL_AVG")]
    pub price: Decimal,
}

impl From<BookPriceAverage> for ReferenceAverage {
    fn from(record: BookPriceAverage) -> Self {
        Self {
            product_id: record.product_id,
            price: record.price,
        }
    }
}

pub fn decode_record(data: &[u8]) -> Result<ReferenceAverage, FeedError> {
    let record: BookPriceAverage = serde_json::from_slice(data)?;
    Ok(record.into())
}

/// Admits at most one record between two `reopen` calls
///
/// The scheduler reopens the gate every throttle tick; records arriving while
/// the gate is closed are dropped.
#[derive(Debug, Default)]
pub struct ThrottleGate {
    open: AtomicBool,
}

impl ThrottleGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reopen(&self) {
        self.open.store(true, Ordering::Release);
    }

    /// Consume the gate if it is open
    pub fn try_pass(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }
}

/// A source of raw reference records, delivered at the producer's pace
#[async_trait]
pub trait RecordSource: Send {
    /// Wait for the next batch of raw records. An empty batch means nothing arrived yet.
    async fn next_batch(&mut self) -> Result<Vec<Vec<u8>>, FeedError>;
}

/// Pump records from `source` into `tracker`, throttled by `gate`
///
/// Returns only on error. A record that fails to decode stops ingestion.
pub async fn ingest<S: RecordSource>(
    source: &mut S,
    gate: &ThrottleGate,
    tracker: &PriceTracker,
) -> Result<(), FeedError> {
    loop {
        let batch = source.next_batch().await?;
        for data in batch {
            if !gate.try_pass() {
                continue;
            }
            let average = decode_record(&data)?;
            tracing::debug!(
                product = %average.product_id,
                price = %average.price,
                "Accepted reference average"
            );
            tracker.accept_reference_average(average);
        }
    }
}
