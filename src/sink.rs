//! Alert sinks: best-effort, fire-and-forget delivery of anomaly, whale,
//! and operational events.
//!
//! Sink failures are logged and buffered in a bounded local retry queue;
//! they never propagate into the hot path.

use crate::types::AlertEvent;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, warn};

/// Delivery contract for the external alert channel.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, event: &AlertEvent) -> Result<()>;
}

/// Publishes alerts to a NATS subject as JSON.
#[derive(Clone)]
pub struct NatsAlertSink {
    client: async_nats::Client,
    subject: String,
}

impl NatsAlertSink {
    pub fn new(client: async_nats::Client, subject: &str) -> Self {
        Self {
            client,
            subject: subject.to_string(),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }
}

#[async_trait]
impl AlertSink for NatsAlertSink {
    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        self.client
            .publish(self.subject.clone(), payload.into())
            .await?;

        debug!(kind = event.kind(), "Published alert");
        Ok(())
    }
}

/// Wraps any sink with a bounded retry queue. Failed events are parked and
/// retried ahead of the next delivery; when the queue is full the oldest
/// parked event is dropped.
pub struct RetryingSink {
    inner: Arc<dyn AlertSink>,
    pending: Mutex<VecDeque<AlertEvent>>,
    max_pending: usize,
}

impl RetryingSink {
    pub fn new(inner: Arc<dyn AlertSink>, max_pending: usize) -> Self {
        Self {
            inner,
            pending: Mutex::new(VecDeque::new()),
            max_pending: max_pending.max(1),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn park(&self, event: AlertEvent) {
        let mut pending = self.pending.lock();
        if pending.len() >= self.max_pending {
            pending.pop_front();
            warn!("Alert retry queue full, dropped oldest parked alert");
        }
        pending.push_back(event);
    }

    /// Retry parked events in order, stopping at the first failure.
    async fn flush_pending(&self) {
        loop {
            let Some(event) = self.pending.lock().pop_front() else {
                return;
            };
            if let Err(e) = self.inner.notify(&event).await {
                debug!(error = %e, "Retry delivery failed, re-parking alert");
                self.pending.lock().push_front(event);
                return;
            }
        }
    }
}

#[async_trait]
impl AlertSink for RetryingSink {
    async fn notify(&self, event: &AlertEvent) -> Result<()> {
        self.flush_pending().await;

        if let Err(e) = self.inner.notify(event).await {
            warn!(kind = event.kind(), error = %e, "Alert delivery failed, parking for retry");
            self.park(event.clone());
        }

        // Best-effort by contract: the caller never sees sink failures.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::WhaleEvent;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// Sink that fails while `broken` is set and records deliveries.
    #[derive(Default)]
    struct FlakySink {
        broken: AtomicBool,
        delivered: AtomicU64,
    }

    #[async_trait]
    impl AlertSink for FlakySink {
        async fn notify(&self, _event: &AlertEvent) -> Result<()> {
            if self.broken.load(Ordering::Relaxed) {
                anyhow::bail!("sink unavailable");
            }
            self.delivered.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn whale(id: &str) -> AlertEvent {
        AlertEvent::Whale(WhaleEvent::new(id, 2_000_000_000, 1_000_000_000))
    }

    #[tokio::test]
    async fn test_failures_are_parked_and_retried() {
        let flaky = Arc::new(FlakySink::default());
        let sink = RetryingSink::new(flaky.clone(), 16);

        flaky.broken.store(true, Ordering::Relaxed);
        sink.notify(&whale("tx1")).await.unwrap();
        sink.notify(&whale("tx2")).await.unwrap();
        assert_eq!(sink.pending_len(), 2);
        assert_eq!(flaky.delivered.load(Ordering::Relaxed), 0);

        flaky.broken.store(false, Ordering::Relaxed);
        sink.notify(&whale("tx3")).await.unwrap();

        // Parked events drained ahead of the new one.
        assert_eq!(sink.pending_len(), 0);
        assert_eq!(flaky.delivered.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_retry_queue_is_bounded() {
        let flaky = Arc::new(FlakySink::default());
        flaky.broken.store(true, Ordering::Relaxed);
        let sink = RetryingSink::new(flaky.clone(), 2);

        for i in 0..5 {
            sink.notify(&whale(&format!("tx{i}"))).await.unwrap();
        }
        assert_eq!(sink.pending_len(), 2);
    }

    #[tokio::test]
    async fn test_notify_never_propagates_sink_errors() {
        let flaky = Arc::new(FlakySink::default());
        flaky.broken.store(true, Ordering::Relaxed);
        let sink = RetryingSink::new(flaky, 4);

        assert!(sink.notify(&whale("tx1")).await.is_ok());
    }
}
