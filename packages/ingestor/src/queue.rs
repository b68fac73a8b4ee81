//! Redis Transaction Queue
//!
//! Pops JSON-encoded transactions from a Redis list and forwards them to the
//! ingestion pipeline. Malformed payloads are logged and skipped; transient
//! Redis errors are retried with exponential backoff.
//!
//! Cancellation is only observed between pops, so a transaction already
//! taken off the list is always forwarded or pushed back.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::transaction::Transaction;

/// Default Redis list holding pending transactions
pub const DEFAULT_QUEUE_KEY: &str = "chaingraph:transactions";

/// Default BRPOP timeout in seconds
pub const DEFAULT_POP_TIMEOUT_SECS: u64 = 1;

/// Consecutive failed pops tolerated before the consumer gives up
pub const MAX_CONSECUTIVE_FAILURES: u32 = 10;

/// Initial backoff after a failed pop
pub const RETRY_INITIAL_BACKOFF_MS: u64 = 100;

/// Maximum backoff after a failed pop
pub const RETRY_MAX_BACKOFF_MS: u64 = 10_000;

/// Errors that can occur while consuming the queue
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Malformed transaction payload: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Pipeline channel closed")]
    ChannelClosed,
}

/// Parse one queued payload
pub fn parse_payload(payload: &str) -> Result<Transaction, QueueError> {
    Ok(serde_json::from_str(payload)?)
}

/// Backoff applied to failed pops
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_consecutive_failures: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_failures: MAX_CONSECUTIVE_FAILURES,
            initial_backoff_ms: RETRY_INITIAL_BACKOFF_MS,
            max_backoff_ms: RETRY_MAX_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `failures`-th consecutive failure (1-based)
    pub fn backoff_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(10);
        let delay_ms = self.initial_backoff_ms.saturating_mul(2u64.pow(exponent));
        Duration::from_millis(delay_ms.min(self.max_backoff_ms))
    }
}

/// Queue the consumer pops transactions from
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TransactionSource: Send + Sync {
    /// Next transaction, or `None` when nothing arrived within the pop timeout
    async fn pop(&self) -> Result<Option<Transaction>, QueueError>;

    /// Put a popped transaction back so the next pop returns it
    async fn requeue(&self, tx: &Transaction) -> Result<(), QueueError>;
}

/// Consumer of the Redis transaction list
pub struct RedisTransactionQueue {
    connection: MultiplexedConnection,
    key: String,
    pop_timeout_secs: u64,
    retry: RetryPolicy,
}

impl RedisTransactionQueue {
    pub fn new(connection: MultiplexedConnection, key: impl Into<String>, pop_timeout_secs: u64) -> Self {
        Self {
            connection,
            key: key.into(),
            pop_timeout_secs,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Push a transaction onto the list (producer side)
    pub async fn push(&self, tx: &Transaction) -> Result<(), QueueError> {
        let json = serde_json::to_string(tx)?;
        let mut connection = self.connection.clone();
        let _: i64 = connection.lpush(&self.key, json).await?;
        Ok(())
    }

    /// Pop the next transaction, waiting up to the pop timeout
    ///
    /// `Ok(None)` means the timeout elapsed with nothing queued.
    pub async fn pop(&self) -> Result<Option<Transaction>, QueueError> {
        let mut connection = self.connection.clone();
        let popped: Option<(String, String)> = connection
            .brpop(&self.key, self.pop_timeout_secs as f64)
            .await?;

        match popped {
            Some((_, payload)) => parse_payload(&payload).map(Some),
            None => Ok(None),
        }
    }

    /// Forward transactions into `sender` until cancelled
    ///
    /// # Returns
    /// The number of transactions forwarded
    pub async fn run(
        self,
        sender: mpsc::Sender<Transaction>,
        cancel: CancellationToken,
    ) -> Result<u64, QueueError> {
        info!("Consuming transactions from {}", self.key);
        let retry = self.retry;
        consume(&self, sender, cancel, retry).await
    }
}

#[async_trait]
impl TransactionSource for RedisTransactionQueue {
    async fn pop(&self) -> Result<Option<Transaction>, QueueError> {
        RedisTransactionQueue::pop(self).await
    }

    async fn requeue(&self, tx: &Transaction) -> Result<(), QueueError> {
        let json = serde_json::to_string(tx)?;
        let mut connection = self.connection.clone();
        // BRPOP takes from the tail
        let _: i64 = connection.rpush(&self.key, json).await?;
        Ok(())
    }
}

/// Forward transactions from `source` into `sender` until cancelled
///
/// Fails once `retry.max_consecutive_failures` pops in a row have failed, or
/// when the pipeline stops receiving before cancellation.
pub async fn consume<S: TransactionSource + ?Sized>(
    source: &S,
    sender: mpsc::Sender<Transaction>,
    cancel: CancellationToken,
    retry: RetryPolicy,
) -> Result<u64, QueueError> {
    let mut forwarded = 0u64;
    let mut failures = 0u32;

    while !cancel.is_cancelled() {
        match source.pop().await {
            Ok(Some(tx)) => {
                failures = 0;
                debug!("Queued transaction {}", tx.hash);
                if let Err(mpsc::error::SendError(tx)) = sender.send(tx).await {
                    if let Err(e) = source.requeue(&tx).await {
                        error!("Lost transaction {} while requeueing: {}", tx.hash, e);
                    }
                    if cancel.is_cancelled() {
                        break;
                    }
                    return Err(QueueError::ChannelClosed);
                }
                forwarded += 1;
            }
            Ok(None) => failures = 0,
            Err(QueueError::Malformed(e)) => {
                failures = 0;
                warn!("Skipping malformed payload: {}", e);
            }
            Err(e) => {
                failures += 1;
                if failures >= retry.max_consecutive_failures {
                    error!("Giving up after {} consecutive queue failures: {}", failures, e);
                    return Err(e);
                }
                let delay = retry.backoff_delay(failures);
                warn!(
                    "Queue pop failed ({}/{}), retrying in {:?}: {}",
                    failures, retry.max_consecutive_failures, delay, e
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    info!("Queue consumer stopped after {} transactions", forwarded);
    Ok(forwarded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_payload() {
        let tx = parse_payload(
            r#"{"hash":"0x1","from":"0xa","to":"0xb","value":"1000","data":"0x","blockNumber":1,"timestamp":2,"network":"ethereum"}"#,
        )
        .unwrap();
        assert_eq!(tx.value, "1000");
        assert_eq!(tx.network, "ethereum");
    }

    #[test]
    fn test_parse_payload_rejects_garbage() {
        assert!(matches!(parse_payload("not json"), Err(QueueError::Malformed(_))));
        assert!(matches!(parse_payload(r#"{"hash":"0x1"}"#), Err(QueueError::Malformed(_))));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(QueueError::ChannelClosed.to_string(), "Pipeline channel closed");
    }

    fn tx(hash: &str) -> Transaction {
        parse_payload(&format!(
            r#"{{"hash":"{hash}","from":"0xa","to":"0xb","value":"1","data":"0x","blockNumber":1,"timestamp":2,"network":"ethereum"}}"#
        ))
        .unwrap()
    }

    fn redis_error() -> QueueError {
        QueueError::Redis(redis::RedisError::from((redis::ErrorKind::IoError, "connection reset")))
    }

    fn fast_retry(max_consecutive_failures: u32) -> RetryPolicy {
        RetryPolicy {
            max_consecutive_failures,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        }
    }

    // ==================== retry policy tests ====================

    #[test]
    fn test_backoff_doubles_and_caps() {
        let retry = RetryPolicy::default();
        assert_eq!(retry.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(retry.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(retry.backoff_delay(30), Duration::from_millis(RETRY_MAX_BACKOFF_MS));
    }

    // ==================== consumer loop tests ====================

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let mut source = MockTransactionSource::new();
        let mut seq = mockall::Sequence::new();
        source.expect_pop().times(2).in_sequence(&mut seq).returning(|| Err(redis_error()));
        source.expect_pop().times(1).in_sequence(&mut seq).returning(|| Ok(Some(tx("0x1"))));

        let cancel = CancellationToken::new();
        let (sender, mut receiver) = mpsc::channel(4);
        let stop = cancel.clone();
        source.expect_pop().times(1).in_sequence(&mut seq).returning(move || {
            stop.cancel();
            Ok(None)
        });

        let forwarded = consume(&source, sender, cancel, fast_retry(3)).await.unwrap();
        assert_eq!(forwarded, 1);
        assert_eq!(receiver.recv().await.unwrap().hash, "0x1");
    }

    #[tokio::test]
    async fn test_persistent_errors_end_the_consumer() {
        let mut source = MockTransactionSource::new();
        source.expect_pop().times(3).returning(|| Err(redis_error()));

        let (sender, _receiver) = mpsc::channel(4);
        let result = consume(&source, sender, CancellationToken::new(), fast_retry(3)).await;
        assert!(matches!(result, Err(QueueError::Redis(_))));
    }

    #[tokio::test]
    async fn test_malformed_payloads_do_not_count_as_failures() {
        let mut source = MockTransactionSource::new();
        let mut seq = mockall::Sequence::new();
        source
            .expect_pop()
            .times(5)
            .in_sequence(&mut seq)
            .returning(|| Err(parse_payload("not json").unwrap_err()));

        let cancel = CancellationToken::new();
        let stop = cancel.clone();
        source.expect_pop().times(1).in_sequence(&mut seq).returning(move || {
            stop.cancel();
            Ok(None)
        });

        let (sender, _receiver) = mpsc::channel(4);
        assert_eq!(consume(&source, sender, cancel, fast_retry(2)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cancellation_never_drops_a_popped_transaction() {
        let cancel = CancellationToken::new();
        let (sender, receiver) = mpsc::channel(4);

        // The pipeline has stopped by the time the in-flight pop returns
        let mut source = MockTransactionSource::new();
        let stop = cancel.clone();
        let mut receiver = Some(receiver);
        source.expect_pop().times(1).returning(move || {
            stop.cancel();
            receiver.take();
            Ok(Some(tx("0x2")))
        });
        source
            .expect_requeue()
            .withf(|tx| tx.hash == "0x2")
            .times(1)
            .returning(|_| Ok(()));

        assert_eq!(consume(&source, sender, cancel, fast_retry(3)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_closed_pipeline_before_cancellation_is_error() {
        let (sender, receiver) = mpsc::channel(4);
        drop(receiver);

        let mut source = MockTransactionSource::new();
        source.expect_pop().times(1).returning(|| Ok(Some(tx("0x3"))));
        source.expect_requeue().times(1).returning(|_| Ok(()));

        let result = consume(&source, sender, CancellationToken::new(), fast_retry(3)).await;
        assert!(matches!(result, Err(QueueError::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_cancelled_consumer_does_not_pop() {
        let source = MockTransactionSource::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (sender, _receiver) = mpsc::channel(4);
        assert_eq!(consume(&source, sender, cancel, fast_retry(3)).await.unwrap(), 0);
    }
}
