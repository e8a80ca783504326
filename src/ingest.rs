//! Ingestion client: persistent feed subscription, strict decode, and
//! reconnection with capped exponential backoff.
//!
//! Faults are contained: malformed messages are dropped and counted,
//! disconnects are retried indefinitely, and a run of consecutive failures
//! surfaces an "unavailable" status without terminating anything.

use crate::metrics::PipelineMetrics;
use crate::queue::TransactionQueue;
use crate::types::{decode_feed_message, FeedMessage};
use futures::StreamExt;
use rand::Rng;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ingestion health surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IngestionStatus {
    Connecting = 0,
    Connected = 1,
    /// Circuit breaker open: too many consecutive failures. The client
    /// keeps retrying; only the status escalates.
    Unavailable = 2,
}

impl IngestionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => IngestionStatus::Connected,
            2 => IngestionStatus::Unavailable,
            _ => IngestionStatus::Connecting,
        }
    }
}

/// Capped exponential backoff with full jitter.
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Next delay: `min(cap, base * 2^attempt)` plus up to 50% jitter.
    pub fn next_delay(&mut self, rng: &mut impl Rng) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let jitter_ms = rng.gen_range(0..=exp.as_millis() as u64 / 2);
        (exp + Duration::from_millis(jitter_ms)).min(self.cap)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Configuration for the ingestion client.
#[derive(Debug, Clone)]
pub struct IngestionOptions {
    pub url: String,
    pub subject: String,
    pub reconnect_base: Duration,
    pub reconnect_cap: Duration,
    /// Consecutive failures before the status escalates to `Unavailable`.
    pub failure_threshold: u32,
}

/// Maintains the feed subscription and pushes decoded records into the
/// buffering boundary.
pub struct IngestionClient {
    options: IngestionOptions,
    queue: Arc<TransactionQueue>,
    metrics: Arc<PipelineMetrics>,
    status: AtomicU8,
    consecutive_failures: AtomicU32,
}

impl IngestionClient {
    pub fn new(
        options: IngestionOptions,
        queue: Arc<TransactionQueue>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            options,
            queue,
            metrics,
            status: AtomicU8::new(IngestionStatus::Connecting as u8),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn status(&self) -> IngestionStatus {
        IngestionStatus::from_u8(self.status.load(Ordering::Relaxed))
    }

    /// Run the connect/subscribe/consume loop forever. Reconnects on every
    /// failure with capped backoff; never returns under normal operation.
    pub async fn run(self: Arc<Self>) {
        let mut backoff = Backoff::new(self.options.reconnect_base, self.options.reconnect_cap);

        loop {
            match self.connect_and_consume().await {
                Ok(()) => {
                    // The subscription was established, so the next outage
                    // starts backoff from the base again.
                    backoff.reset();
                    warn!(subject = %self.options.subject, "Feed subscription ended, reconnecting");
                }
                Err(e) => {
                    warn!(error = %e, "Feed connection failed");
                    self.record_failure();
                }
            }

            let delay = backoff.next_delay(&mut rand::thread_rng());
            self.set_status_if_not_unavailable(IngestionStatus::Connecting);
            debug!(delay_ms = delay.as_millis() as u64, "Reconnect backoff");
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_and_consume(&self) -> anyhow::Result<()> {
        info!(url = %self.options.url, "Connecting to feed");
        let client = async_nats::connect(&self.options.url).await?;

        let mut subscription = client.subscribe(self.options.subject.clone()).await?;
        info!(subject = %self.options.subject, "Subscribed to transaction feed");
        self.record_success();
        self.set_status(IngestionStatus::Connected);

        while let Some(message) = subscription.next().await {
            self.handle_payload(&message.payload);
        }

        Ok(())
    }

    /// Decode one feed payload and push the record into the boundary.
    /// Decode failures are drop-and-count, never fatal.
    pub fn handle_payload(&self, payload: &[u8]) {
        match decode_feed_message(payload) {
            Ok(FeedMessage::Transaction(record)) => {
                self.record_success();
                self.metrics.ingested_total.fetch_add(1, Ordering::Relaxed);
                self.queue.push(record);
                self.metrics
                    .dropped_total
                    .store(self.queue.dropped_total(), Ordering::Relaxed);
            }
            Ok(FeedMessage::Ignored(op)) => {
                debug!(op = %op, "Ignored feed message");
            }
            Err(e) => {
                debug!(error = %e, "Dropped malformed feed message");
                self.metrics
                    .decode_failures_total
                    .fetch_add(1, Ordering::Relaxed);
                self.record_failure();
            }
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures == self.options.failure_threshold {
            warn!(
                consecutive_failures = failures,
                "Ingestion circuit breaker open: marking ingestion unavailable"
            );
            self.set_status(IngestionStatus::Unavailable);
        }
    }

    fn record_success(&self) {
        let was = self.consecutive_failures.swap(0, Ordering::Relaxed);
        if was >= self.options.failure_threshold {
            info!("Ingestion recovered, circuit breaker closed");
            self.set_status(IngestionStatus::Connected);
        }
    }

    fn set_status(&self, status: IngestionStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    fn set_status_if_not_unavailable(&self, status: IngestionStatus) {
        let _ = self.status.compare_exchange(
            IngestionStatus::Connected as u8,
            status as u8,
            Ordering::Relaxed,
            Ordering::Relaxed,
        );
    }
}
