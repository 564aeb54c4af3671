//! Buffered request logging with a periodic batch flusher.
//!
//! Every handled request enqueues one [`RequestLogRecord`]; a background
//! task drains the buffer every few seconds into a [`LogSink`]. The default
//! sink emits structured tracing events; deployments that want a durable
//! trail can point the sink at a JSON-lines file. Sink failures are logged
//! and the batch is dropped; logging never blocks or fails a request.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Append-only record of one handled request.
#[derive(Debug, Clone, Serialize)]
pub struct RequestLogRecord {
    pub request_id: String,
    pub model_requested: String,
    pub model_used: String,
    pub provider: String,
    pub routing_strategy: String,
    pub routing_decision: String,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub latency_ms: u64,
    pub cost_usd: f64,
    pub cache_hit: bool,
    pub fallback_used: bool,
    pub status_code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[async_trait::async_trait]
pub trait LogSink: Send + Sync {
    async fn write_batch(&self, records: &[RequestLogRecord]) -> anyhow::Result<()>;
}

/// Default sink: one structured tracing event per record.
pub struct TracingSink;

#[async_trait::async_trait]
impl LogSink for TracingSink {
    async fn write_batch(&self, records: &[RequestLogRecord]) -> anyhow::Result<()> {
        for record in records {
            tracing::info!(
                target: "request_log",
                request_id = %record.request_id,
                provider = %record.provider,
                model = %record.model_used,
                status = record.status_code,
                latency_ms = record.latency_ms,
                total_tokens = record.total_tokens,
                cost_usd = record.cost_usd,
                cache_hit = record.cache_hit,
                fallback_used = record.fallback_used,
                "request"
            );
        }
        Ok(())
    }
}

/// JSON-lines file sink.
pub struct JsonlSink {
    path: String,
}

impl JsonlSink {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait::async_trait]
impl LogSink for JsonlSink {
    async fn write_batch(&self, records: &[RequestLogRecord]) -> anyhow::Result<()> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut buf = String::new();
        for record in records {
            buf.push_str(&serde_json::to_string(record)?);
            buf.push('\n');
        }
        file.write_all(buf.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

struct FlusherTask {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct RequestLogger {
    buffer: Mutex<Vec<RequestLogRecord>>,
    sink: Arc<dyn LogSink>,
    flusher: Mutex<Option<FlusherTask>>,
}

impl RequestLogger {
    pub fn new(sink: Arc<dyn LogSink>) -> Arc<Self> {
        Arc::new(Self {
            buffer: Mutex::new(Vec::new()),
            sink,
            flusher: Mutex::new(None),
        })
    }

    pub async fn enqueue(&self, record: RequestLogRecord) {
        self.buffer.lock().await.push(record);
    }

    /// Drains and writes the current buffer.
    pub async fn flush(&self) {
        let batch: Vec<RequestLogRecord> = {
            let mut buffer = self.buffer.lock().await;
            if buffer.is_empty() {
                return;
            }
            buffer.drain(..).collect()
        };

        if let Err(e) = self.sink.write_batch(&batch).await {
            tracing::warn!("request log flush failed ({} records dropped): {e}", batch.len());
        }
    }

    /// Starts the periodic flusher. Idempotent.
    pub async fn start_flusher(self: Arc<Self>, interval: Duration) {
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let logger = self.clone();

        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => logger.flush().await,
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            logger.flush().await;
                            break;
                        }
                    }
                }
            }
        });

        let mut flusher = self.flusher.lock().await;
        if let Some(previous) = flusher.take() {
            let _ = previous.stop.send(true);
            previous.handle.abort();
        }
        *flusher = Some(FlusherTask {
            stop: stop_tx,
            handle,
        });
    }

    /// Stops the flusher after a final flush.
    pub async fn shutdown(&self) {
        let task = self.flusher.lock().await.take();
        if let Some(task) = task {
            let _ = task.stop.send(true);
            let _ = task.handle.await;
        } else {
            self.flush().await;
        }
    }
}
