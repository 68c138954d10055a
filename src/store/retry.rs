use super::{CircuitBreaker, Document, DocumentStore, Fields, Query, Snapshot, StoreOp, WriteBatch, WriteMode};
use crate::config::RetryConfig;
use crate::error::{StoreError, StoreResult};
use crate::layout::ShardLocation;
use crate::metrics::CounterMetrics;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Store decorator adding read retries and a circuit breaker.
///
/// Only idempotent operations (`read`, `list_children`, `query`) are retried,
/// and only on transient errors. Writes, increments and commits are issued
/// exactly once: a retried increment whose acknowledgment was lost would
/// apply its delta twice.
pub struct RetryingStore<S> {
    inner: S,
    max_retries: u32,
    retry_delay: Duration,
    breaker: CircuitBreaker,
    metrics: Option<Arc<CounterMetrics>>,
}

impl<S: DocumentStore> RetryingStore<S> {
    pub fn new(inner: S, max_retries: u32, retry_delay: Duration, breaker: CircuitBreaker) -> Self {
        Self {
            inner,
            max_retries,
            retry_delay,
            breaker,
            metrics: None,
        }
    }

    pub fn from_config(inner: S, config: &RetryConfig) -> Self {
        Self::new(
            inner,
            config.max_retries,
            Duration::from_millis(config.retry_delay_ms),
            CircuitBreaker::new(
                config.failure_threshold,
                Duration::from_secs(config.breaker_timeout_secs),
            ),
        )
    }

    pub fn with_metrics(mut self, metrics: Arc<CounterMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    async fn admit(&self, op: StoreOp) -> StoreResult<()> {
        if self.breaker.can_execute().await {
            Ok(())
        } else {
            debug!(store_op = %op, "circuit breaker open, rejecting call");
            Err(StoreError::Unavailable("circuit breaker open".to_string()))
        }
    }

    async fn settle<T>(&self, op: StoreOp, result: &StoreResult<T>) {
        match result {
            Ok(_) => self.breaker.record_success().await,
            Err(e) if e.is_transient() => {
                warn!(store_op = %op, error = %e, "transient store failure");
                self.breaker.record_failure().await;
            }
            // the backend answered; not a health signal
            Err(_) => {}
        }
    }

    /// Issue a non-idempotent call once.
    async fn once<T, Fut>(&self, op: StoreOp, call: Fut) -> StoreResult<T>
    where
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        self.admit(op).await?;
        let result = call.await;
        self.settle(op, &result).await;
        result
    }

    /// Issue an idempotent call, retrying transient failures.
    async fn with_retry<T, F, Fut>(&self, op: StoreOp, call: F) -> StoreResult<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = StoreResult<T>> + Send,
        T: Send,
    {
        debug_assert!(op.is_idempotent());
        let mut attempt = 0;
        loop {
            self.admit(op).await?;
            let result = call().await;
            self.settle(op, &result).await;
            match result {
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    if let Some(metrics) = &self.metrics {
                        metrics.record_retry(op, attempt);
                    }
                    debug!(
                        store_op = %op,
                        attempt = attempt,
                        delay_ms = self.retry_delay.as_millis() as u64,
                        "retrying"
                    );
                    sleep(self.retry_delay).await;
                }
                other => return other,
            }
        }
    }
}

#[async_trait]
impl<S: DocumentStore> DocumentStore for RetryingStore<S> {
    async fn read(&self, location: &ShardLocation) -> StoreResult<Snapshot> {
        self.with_retry(StoreOp::Read, || self.inner.read(location))
            .await
    }

    async fn write(
        &self,
        location: &ShardLocation,
        fields: Fields,
        mode: WriteMode,
    ) -> StoreResult<()> {
        self.once(StoreOp::Write, self.inner.write(location, fields, mode))
            .await
    }

    async fn increment_field(
        &self,
        location: &ShardLocation,
        field: &str,
        delta: i64,
    ) -> StoreResult<()> {
        self.once(
            StoreOp::IncrementField,
            self.inner.increment_field(location, field, delta),
        )
        .await
    }

    fn supports_upsert_increment(&self) -> bool {
        self.inner.supports_upsert_increment()
    }

    async fn upsert_increment(
        &self,
        location: &ShardLocation,
        field: &str,
        delta: i64,
    ) -> StoreResult<()> {
        self.once(
            StoreOp::UpsertIncrement,
            self.inner.upsert_increment(location, field, delta),
        )
        .await
    }

    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        self.once(StoreOp::Commit, self.inner.commit(batch)).await
    }

    async fn list_children(&self, parent: &str, collection: &str) -> StoreResult<Vec<Document>> {
        self.with_retry(StoreOp::ListChildren, || {
            self.inner.list_children(parent, collection)
        })
        .await
    }

    async fn query(&self, query: &Query) -> StoreResult<Vec<Document>> {
        self.with_retry(StoreOp::Query, || self.inner.query(query))
            .await
    }
}
