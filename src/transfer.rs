//! Streaming file transfer with progress reporting and cooperative cancellation

use crate::error::{Result, UpdateError};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// Shared cancellation request, checked by the transfer loop between chunks.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub source_url: String,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { bytes: u64 },
    Cancelled,
}

/// Reports a percentage only when it rises. 100 is reserved for completion.
struct ProgressTracker {
    total: u64,
    last: u8,
}

impl ProgressTracker {
    fn new(total: u64) -> Self {
        Self { total, last: 0 }
    }

    fn advance(&mut self, done: u64) -> Option<u8> {
        if self.total == 0 {
            return None;
        }
        let percent = (done.saturating_mul(100) / self.total).min(100) as u8;
        if percent >= 100 || percent <= self.last {
            return None;
        }
        self.last = percent;
        Some(percent)
    }
}

#[derive(Debug, Clone)]
pub struct Transfer {
    client: reqwest::Client,
    chunk_size: usize,
    probe_timeout: Duration,
}

impl Transfer {
    pub fn new(client: reqwest::Client, chunk_size: usize, probe_timeout: Duration) -> Self {
        Self {
            client,
            chunk_size: chunk_size.max(1),
            probe_timeout,
        }
    }

    /// Download `request.source_url` into `request.destination`.
    ///
    /// `on_progress` receives a strictly increasing sequence of percentages
    /// ending with exactly one 100 on success. `cancel` is checked after every
    /// chunk; a cancelled transfer removes the partial destination file.
    pub async fn run<F>(
        &self,
        request: &TransferRequest,
        cancel: &CancelFlag,
        mut on_progress: F,
    ) -> Result<TransferOutcome>
    where
        F: FnMut(u8),
    {
        let url = request.source_url.as_str();

        if cancel.is_cancelled() {
            tracing::info!("Transfer of {} cancelled before start", url);
            return Ok(TransferOutcome::Cancelled);
        }

        let total = self.probe_size(url).await?;
        tracing::info!(
            "Downloading {} ({} bytes) to {}",
            url,
            total,
            request.destination.display()
        );

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateError::Transfer(format!("request for {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(UpdateError::Transfer(format!(
                "download of {} failed with status {}",
                url,
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(&request.destination)
            .await
            .map_err(|e| write_error(&request.destination, e))?;
        let mut stream = response.bytes_stream();
        let mut tracker = ProgressTracker::new(total);
        let mut pending: Vec<u8> = Vec::with_capacity(self.chunk_size);
        let mut written = 0u64;
        let mut exhausted = false;

        while !exhausted {
            match stream.next().await {
                Some(frame) => {
                    let frame = frame.map_err(|e| {
                        UpdateError::Transfer(format!("error while reading {}: {}", url, e))
                    })?;
                    pending.extend_from_slice(&frame);
                    if pending.len() < self.chunk_size {
                        continue;
                    }
                }
                None => {
                    exhausted = true;
                    if pending.is_empty() {
                        break;
                    }
                }
            }

            while pending.len() >= self.chunk_size || (exhausted && !pending.is_empty()) {
                let take = pending.len().min(self.chunk_size);
                let rest = pending.split_off(take);
                let chunk = std::mem::replace(&mut pending, rest);

                file.write_all(&chunk)
                    .await
                    .map_err(|e| write_error(&request.destination, e))?;
                written += chunk.len() as u64;

                if let Some(percent) = tracker.advance(written) {
                    on_progress(percent);
                }

                if cancel.is_cancelled() {
                    tracing::info!("Transfer of {} cancelled after {} bytes", url, written);
                    drop(file);
                    discard_partial(&request.destination).await;
                    return Ok(TransferOutcome::Cancelled);
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| write_error(&request.destination, e))?;
        drop(file);

        if written != total {
            return Err(UpdateError::Transfer(format!(
                "received {} bytes from {} but {} were announced",
                written, url, total
            )));
        }

        on_progress(100);
        tracing::info!("Download of {} complete", url);
        Ok(TransferOutcome::Completed { bytes: written })
    }

    async fn probe_size(&self, url: &str) -> Result<u64> {
        let response = self
            .client
            .head(url)
            .timeout(self.probe_timeout)
            .send()
            .await
            .map_err(|e| UpdateError::Transfer(format!("size probe for {} failed: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(UpdateError::Transfer(format!(
                "size probe for {} returned {}",
                url,
                response.status()
            )));
        }

        response
            .headers()
            .get(reqwest::header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .ok_or_else(|| UpdateError::Transfer(format!("{} did not report a content length", url)))
    }
}

fn write_error(path: &Path, e: std::io::Error) -> UpdateError {
    UpdateError::Transfer(format!("failed to write {}: {}", path.display(), e))
}

async fn discard_partial(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => tracing::debug!("Removed partial download {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!("Could not remove partial download {}: {}", path.display(), e),
    }
}
