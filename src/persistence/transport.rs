//! # Collector Transport
//!
//! The outbound seam of the pipeline. [`ChunkTransport`] abstracts one
//! chunk delivery so the persister can be tested against mocks; the
//! production implementation is [`HttpTransport`] speaking the
//! collector's JSON API over `reqwest`.

use std::time::Duration;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::trace;

use crate::core::config::CollectorConfig;
use crate::core::error::{PipelineError, PipelineResult};
use crate::core::types::{LogEntry, MetricEntry};

/// Position of a chunk within one flushed batch
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkMetadata {
    pub total_chunks: usize,
    pub chunk_size: usize,
    pub chunk_index: usize,
}

/// Collector acknowledgement body
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportAck {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub batch_id: Option<String>,
}

/// One-chunk delivery to the collector
#[async_trait]
pub trait ChunkTransport<T>: Send + Sync {
    async fn send_chunk(&self, chunk: &[T], meta: &ChunkMetadata) -> PipelineResult<TransportAck>;
}

/// Choose the collector's retrieval window string for an elapsed
/// duration: `≤24h → Nh`, `≤30d → Nd`, otherwise `Nm` (months), each
/// `N` a ceiling.
pub fn format_time_window(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let hours = secs.div_ceil(3600).max(1);
    if hours <= 24 {
        return format!("{hours}h");
    }
    let days = hours.div_ceil(24);
    if days <= 30 {
        return format!("{days}d");
    }
    format!("{}m", days.div_ceil(30))
}

/// JSON-over-HTTP collector client
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    pub fn new(config: &CollectorConfig) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    /// Retrieve recently collected logs for an elapsed lookback window
    pub async fn fetch_recent_logs(&self, elapsed: Duration) -> PipelineResult<serde_json::Value> {
        let url = format!(
            "{}/api/logs?timeWindow={}",
            self.base_url,
            format_time_window(elapsed)
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(PipelineError::transport(format!(
                "log retrieval returned HTTP {}",
                response.status()
            )));
        }
        Ok(response.json().await?)
    }

    async fn post_payload(
        &self,
        path: &str,
        payload: serde_json::Value,
    ) -> PipelineResult<TransportAck> {
        let url = format!("{}{}", self.base_url, path);
        let response = self.client.post(&url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::transport(format!(
                "collector returned HTTP {status} for {path}"
            )));
        }

        let ack: TransportAck = response.json().await?;
        if !ack.success {
            return Err(PipelineError::transport(format!(
                "collector rejected payload: {}",
                ack.message
            )));
        }
        trace!(path, batch_id = ack.batch_id.as_deref(), "chunk accepted");
        Ok(ack)
    }
}

#[async_trait]
impl ChunkTransport<LogEntry> for HttpTransport {
    async fn send_chunk(
        &self,
        chunk: &[LogEntry],
        meta: &ChunkMetadata,
    ) -> PipelineResult<TransportAck> {
        self.post_payload("/api/logs", json!({ "logs": chunk, "metadata": meta }))
            .await
    }
}

#[async_trait]
impl ChunkTransport<MetricEntry> for HttpTransport {
    async fn send_chunk(
        &self,
        chunk: &[MetricEntry],
        _meta: &ChunkMetadata,
    ) -> PipelineResult<TransportAck> {
        self.post_payload("/api/metrics", json!({ "metrics": chunk }))
            .await
    }
}
