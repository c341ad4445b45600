//! Bounded FIFO of formatted records flowing to a sink.
//!
//! Producers hold a [`Publisher`]; a single [`Forwarder`] drains the
//! channel in receive order, prefixes each record with the namespace and
//! hands it to its [`Sink`]. Sends block when the channel is full, so a
//! stalled sink throttles the scheduler instead of records being dropped.

use crate::metrics::MetricsCollector;
use crate::sink::Sink;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Producer side of a publish queue.
#[derive(Debug, Clone)]
pub struct Publisher {
    tx: mpsc::Sender<String>,
}

impl Publisher {
    /// Creates a queue holding at most `depth` records.
    pub fn channel(depth: usize) -> (Publisher, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(depth.max(1));
        (Publisher { tx }, rx)
    }

    /// Enqueues a record from a non-async thread, blocking while full.
    ///
    /// Must not be called from inside the tokio runtime. Returns false once
    /// the forwarder has closed the queue.
    pub fn publish_blocking(&self, record: impl Into<String>) -> bool {
        let record = record.into();
        trace!(record = %record, "publish");
        self.tx.blocking_send(record).is_ok()
    }

    /// Enqueues a record, waiting while full.
    pub async fn publish(&self, record: impl Into<String>) -> bool {
        let record = record.into();
        trace!(record = %record, "publish");
        self.tx.send(record).await.is_ok()
    }

    /// Records currently waiting in the queue.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_depth(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side: forwards records to a sink.
pub struct Forwarder {
    name: &'static str,
    namespace: String,
    rx: mpsc::Receiver<String>,
    sink: Box<dyn Sink>,
    metrics: Option<Arc<MetricsCollector>>,
}

impl Forwarder {
    pub fn new(
        name: &'static str,
        namespace: impl Into<String>,
        rx: mpsc::Receiver<String>,
        sink: Box<dyn Sink>,
    ) -> Self {
        Self {
            name,
            namespace: namespace.into(),
            rx,
            sink,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Forwards until every publisher is gone or `shutdown` fires, then
    /// drains what is left. Returns the number of records forwarded.
    pub async fn run(mut self, shutdown: CancellationToken) -> u64 {
        info!(queue = self.name, "Forwarder started");
        let mut forwarded = 0u64;
        loop {
            let record = tokio::select! {
                record = self.rx.recv() => record,
                _ = shutdown.cancelled() => {
                    self.rx.close();
                    break;
                }
            };
            match record {
                Some(record) => {
                    self.forward(&record).await;
                    forwarded += 1;
                }
                None => break,
            }
        }
        // closed: drain whatever was accepted before the close
        while let Some(record) = self.rx.recv().await {
            self.forward(&record).await;
            forwarded += 1;
        }
        info!(queue = self.name, forwarded, "Forwarder stopped");
        forwarded
    }

    async fn forward(&mut self, record: &str) {
        let line = format!("{}{}", self.namespace, record);
        match self.sink.print(&line).await {
            Ok(()) => {
                debug!(queue = self.name, line = %line, "forwarded");
                if let Some(metrics) = &self.metrics {
                    metrics.record_published(self.name);
                }
            }
            Err(e) => {
                warn!(queue = self.name, error = %e, "sink write failed");
                if let Some(metrics) = &self.metrics {
                    metrics.record_sink_error(self.name);
                }
            }
        }
    }
}
