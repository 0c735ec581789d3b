//! Metrics delivery with retry, persistent buffering and ordered flush
//!
//! The client owns:
//! - The HTTP connection to the aggregation server (`/metrics`, `/metrics/bulk`, `/health`)
//! - The persistent buffer of batches that could not be sent
//!
//! Arrival order at the server always equals production order: buffered records go
//! first, the live batch only after the buffer drained.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::buffer::{PersistentBuffer, Retention};
use crate::config::{DeliveryConfig, ServerConfig};
use crate::error::DeliveryError;
use crate::models::{BufferRecord, MetricBatch, MetricsPayload};

/// Header names are lowercase: `HeaderName::from_static` rejects anything else
pub const API_KEY_HEADER: &str = "x-api-key";
pub const CLIENT_ID_HEADER: &str = "x-client-id";

/// What happened to a batch handed to `send`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Delivered, plus `flushed` previously buffered records
    Sent { flushed: usize },
    /// Stored locally, will go out with a later flush
    Buffered,
    /// Nothing to send
    Skipped,
}

/// Result of one flush pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub delivered: usize,
    pub remaining: usize,
    pub last_error: Option<String>,
}

impl FlushReport {
    pub fn drained(&self) -> bool {
        self.remaining == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Single,
    Bulk,
}

impl Endpoint {
    fn path(self) -> &'static str {
        match self {
            Endpoint::Single => "/metrics",
            Endpoint::Bulk => "/metrics/bulk",
        }
    }
}

fn is_bulk_rejection(error: &DeliveryError) -> bool {
    matches!(error, DeliveryError::Server { status: 404 | 405, .. })
}

/// Statuses saying the payload itself is wrong; resending it cannot help
fn is_permanent_rejection(status: StatusCode) -> bool {
    status == StatusCode::BAD_REQUEST
        || status == StatusCode::PAYLOAD_TOO_LARGE
        || status == StatusCode::UNPROCESSABLE_ENTITY
}

pub struct DeliveryClient {
    http: reqwest::Client,
    base_url: String,
    config: DeliveryConfig,
    buffer: Mutex<PersistentBuffer>,
    /// Serializes whole send/flush passes
    flush_guard: tokio::sync::Mutex<()>,
    bulk_supported: AtomicBool,
}

impl DeliveryClient {
    /// Build the HTTP client and open the buffer from `delivery.buffer_file()`
    pub fn new(server: &ServerConfig, delivery: DeliveryConfig, client_id: &str) -> Result<Self> {
        let path = delivery.buffer_file();
        let retention = Retention {
            max_records: delivery.buffer_max_records,
            max_age: delivery.buffer_max_age(),
        };
        let buffer = PersistentBuffer::open(&path, retention)
            .with_context(|| format!("Failed to open metrics buffer {}", path.display()))?;
        Self::with_buffer(server, delivery, client_id, buffer)
    }

    pub fn with_buffer(
        server: &ServerConfig,
        delivery: DeliveryConfig,
        client_id: &str,
        buffer: PersistentBuffer,
    ) -> Result<Self> {
        let http = http_client(server, client_id)?;
        let bulk_enabled = delivery.bulk_enabled;
        Ok(Self {
            http,
            base_url: server.base_url().to_string(),
            config: delivery,
            buffer: Mutex::new(buffer),
            flush_guard: tokio::sync::Mutex::new(()),
            bulk_supported: AtomicBool::new(bulk_enabled),
        })
    }

    pub fn buffered_count(&self) -> usize {
        self.buffer.lock().len()
    }

    /// `GET /health`; false on any failure
    pub async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.http.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!("Health check failed: {}", e);
                false
            }
        }
    }

    /// Deliver one batch, falling back to the buffer when the server is unreachable.
    ///
    /// Errors are reserved for batches that can never be delivered (malformed, or refused with
    /// 400/413/422) and for an unwritable buffer. Such batches are not buffered.
    pub async fn send(&self, batch: MetricBatch) -> Result<DeliveryOutcome, DeliveryError> {
        if batch.is_empty() {
            debug!("Empty batch, nothing to send");
            return Ok(DeliveryOutcome::Skipped);
        }
        batch.validate().map_err(DeliveryError::Serialization)?;

        let _guard = self.flush_guard.lock().await;
        let mut flushed = 0;

        if self.buffered_count() > 0 {
            let report = self.flush_locked().await?;
            flushed += report.delivered;
            if !report.drained() {
                debug!(
                    "Buffer still holds {} records, queueing live batch behind them",
                    report.remaining
                );
                self.buffer_batch(batch)?;
                return Ok(DeliveryOutcome::Buffered);
            }
        }

        match self.post_with_retry(Endpoint::Single, &MetricsPayload::single(&batch)).await {
            Ok(()) => {
                info!("Delivered batch of {} metrics", batch.len());
                let report = self.flush_locked().await?;
                flushed += report.delivered;
                Ok(DeliveryOutcome::Sent { flushed })
            }
            Err(e) if e.is_bufferable() => {
                self.log_failure(&e, "Delivery failed");
                self.buffer_batch(batch)?;
                Ok(DeliveryOutcome::Buffered)
            }
            Err(e) => {
                self.log_failure(&e, "Batch dropped");
                Err(e)
            }
        }
    }

    /// Drain the buffer in order, stopping at the first record that still fails
    pub async fn flush(&self) -> Result<FlushReport, DeliveryError> {
        let _guard = self.flush_guard.lock().await;
        self.flush_locked().await
    }

    async fn flush_locked(&self) -> Result<FlushReport, DeliveryError> {
        let mut report = FlushReport::default();

        loop {
            let run = {
                let buffer = self.buffer.lock();
                if self.bulk_supported.load(Ordering::Relaxed) {
                    buffer.peek_front_run(self.config.bulk_max_records)
                } else {
                    buffer.peek_front().into_iter().collect()
                }
            };
            if run.is_empty() {
                break;
            }

            match self.send_run(&run).await {
                Ok(sent) => {
                    let removed = self.buffer.lock().pop_front_n_if(&sent)?;
                    report.delivered += removed;
                    if removed == 0 {
                        break;
                    }
                }
                Err(e @ (DeliveryError::Serialization(_) | DeliveryError::Rejected { .. })) => {
                    // never deliverable; keeping it would block every later record
                    error!("Dropping undeliverable buffered batch {}: {}", run[0].id, e);
                    self.buffer.lock().pop_front_if(run[0].id)?;
                }
                Err(e) => {
                    let ids: Vec<Uuid> = run.iter().map(|r| r.id).collect();
                    self.buffer.lock().record_failed_attempt(&ids)?;
                    self.log_failure(&e, "Buffer flush stopped");
                    report.last_error = Some(e.to_string());
                    break;
                }
            }
        }

        report.remaining = self.buffered_count();
        if report.delivered > 0 {
            info!(
                "Flushed {} buffered batches ({} remaining)",
                report.delivered, report.remaining
            );
        }
        Ok(report)
    }

    /// Send the front run; returns ids actually delivered
    async fn send_run(&self, run: &[BufferRecord]) -> Result<Vec<Uuid>, DeliveryError> {
        // bulk only over the valid prefix; an invalid record is dropped once it reaches the front
        let valid = run
            .iter()
            .take_while(|r| r.batch.validate().is_ok())
            .count();
        let run_valid = &run[..valid];

        if run_valid.len() > 1 {
            if let Some(payload) = MetricsPayload::coalesced(run_valid) {
                match self.post_with_retry(Endpoint::Bulk, &payload).await {
                    Ok(()) => {
                        debug!("Bulk delivered {} buffered batches", run_valid.len());
                        return Ok(run_valid.iter().map(|r| r.id).collect());
                    }
                    Err(e) if is_bulk_rejection(&e) => {
                        warn!("Bulk endpoint unsupported ({}), using per-batch sends", e);
                        self.bulk_supported.store(false, Ordering::Relaxed);
                    }
                    Err(DeliveryError::Rejected { status, .. }) => {
                        // one of the records is unacceptable; find it by sending them one at a time
                        warn!("Bulk payload rejected (HTTP {}), sending front batch alone", status);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        let front = &run[0];
        front
            .batch
            .validate()
            .map_err(DeliveryError::Serialization)?;
        self.post_with_retry(Endpoint::Single, &MetricsPayload::single(&front.batch))
            .await?;
        Ok(vec![front.id])
    }

    async fn post_with_retry<T: Serialize>(
        &self,
        endpoint: Endpoint,
        payload: &T,
    ) -> Result<(), DeliveryError> {
        let attempts = self.config.max_retries + 1;
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.post_once(endpoint, payload).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    let retryable = e.is_retryable()
                        && !(endpoint == Endpoint::Bulk && is_bulk_rejection(&e));
                    if !retryable || attempt >= attempts {
                        return Err(e);
                    }
                    let delay = self.config.delay_before_retry(attempt);
                    debug!(
                        "POST {} attempt {}/{} failed, retrying in {:?}: {}",
                        endpoint.path(),
                        attempt,
                        attempts,
                        delay,
                        e
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn post_once<T: Serialize>(&self, endpoint: Endpoint, payload: &T) -> Result<(), DeliveryError> {
        let url = format!("{}{}", self.base_url, endpoint.path());
        let response = self
            .http
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| DeliveryError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            return Err(DeliveryError::Unauthorized(status.as_u16()));
        }
        let body = response.text().await.unwrap_or_default();
        if is_permanent_rejection(status) {
            return Err(DeliveryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Err(DeliveryError::Server {
            status: status.as_u16(),
            body,
        })
    }

    fn buffer_batch(&self, batch: MetricBatch) -> Result<(), DeliveryError> {
        let entries = batch.len();
        let mut buffer = self.buffer.lock();
        match buffer.enqueue(batch) {
            Ok(id) => {
                warn!(
                    "Buffered batch {} ({} metrics, {} batches pending)",
                    id,
                    entries,
                    buffer.len()
                );
                Ok(())
            }
            Err(e) => {
                error!("Failed to buffer batch, {} metrics lost: {}", entries, e);
                Err(e.into())
            }
        }
    }

    fn log_failure(&self, error: &DeliveryError, context: &str) {
        match error {
            DeliveryError::Unauthorized(status) => {
                error!("{}: server rejected API key (HTTP {})", context, status)
            }
            DeliveryError::Rejected { .. } | DeliveryError::Serialization(_) | DeliveryError::Storage(_) => {
                error!("{}: {}", context, error)
            }
            other => warn!("{}: {}", context, other),
        }
    }
}

pub(crate) fn http_client(server: &ServerConfig, client_id: &str) -> Result<reqwest::Client> {
    let mut headers = HeaderMap::new();
    if server.api_key.is_empty() {
        warn!("No API key configured, requests will be sent without {}", API_KEY_HEADER);
    } else {
        let mut key = HeaderValue::from_str(&server.api_key).context("API key is not a valid header value")?;
        key.set_sensitive(true);
        headers.insert(API_KEY_HEADER, key);
    }
    headers.insert(
        CLIENT_ID_HEADER,
        HeaderValue::from_str(client_id).context("Client id is not a valid header value")?,
    );

    reqwest::Client::builder()
        .timeout(server.request_timeout())
        .default_headers(headers)
        .build()
        .context("Failed to create HTTP client")
}
