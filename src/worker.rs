// pardl - worker.rs

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use http::header;
use reqwest::{Client, Response, StatusCode};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::metadata::{BlockRange, Meta, MetaError};
use crate::relay::proxy_url;
use crate::writer::{FileWriter, WriteOp};

/// Attempts per worker before it gives up and leaves the remaining blocks to
/// its peers.
const MAX_RETRIES: u32 = 3;

/// Errors from a single block fetch.
#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("network request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("server returned an unexpected status code: {0}")]
    Unexpected(StatusCode),
    #[error("the write loop is gone")]
    WriterGone,
    #[error("file write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("body ended {got} bytes into a {want} byte range")]
    Truncated { got: u64, want: u64 },
    #[error(transparent)]
    Meta(#[from] MetaError),
}

/// One download connection. Repeatedly claims the next pending block, issues
/// a ranged GET for it (through a relay when one is assigned), and streams
/// the body into the write loop. When the source does not accept ranges the
/// whole file is fetched in a single pass instead.
pub struct Worker {
    client: Client,
    meta: Arc<Meta>,
    ops: mpsc::Sender<WriteOp>,
    relay: Option<String>,
    headers: Arc<Vec<(String, String)>>,
    raw_read: Arc<AtomicU64>,
}

impl Worker {
    pub(crate) fn new(
        client: Client,
        meta: Arc<Meta>,
        ops: mpsc::Sender<WriteOp>,
        relay: Option<String>,
        headers: Arc<Vec<(String, String)>>,
        raw_read: Arc<AtomicU64>,
    ) -> Self {
        Worker {
            client,
            meta,
            ops,
            relay,
            headers,
            raw_read,
        }
    }

    pub(crate) async fn run(self) {
        if !self.meta.is_accept_range() {
            if let Err(err) = self.fetch_stream().await {
                tracing::error!(%err, "single-stream download failed");
            }
            return;
        }

        let mut hint = 0;
        let mut retry = 0u32;
        while let Some(range) = self.meta.alloc_block(hint).await {
            match self.fetch_block(&range).await {
                Ok(_) => {
                    hint = range.idx + 1;
                }
                Err(err) => {
                    // Hand the block back so it can be claimed again, by us
                    // or by another worker.
                    self.meta.mark_init(range.idx).await;
                    retry += 1;
                    if retry > MAX_RETRIES {
                        tracing::error!(%err, idx = range.idx, "worker giving up");
                        return;
                    }
                    tracing::debug!(%err, idx = range.idx, retry, "retrying block");
                }
            }
        }
    }

    /// Fetches `[range.start, range.end)` and streams it to the write loop.
    async fn fetch_block(&self, range: &BlockRange) -> Result<u64, DownloadError> {
        let request = match &self.relay {
            Some(host) => self.client.get(proxy_url(
                host,
                &self.meta.source,
                Some(range.start),
                Some(range.end),
            )),
            None => {
                let mut request = self.client.get(&self.meta.source).header(
                    header::RANGE,
                    format!("bytes={}-{}", range.start, range.end - 1),
                );
                for (key, value) in self.headers.iter() {
                    request = request.header(key.as_str(), value.as_str());
                }
                request
            }
        };

        let mut resp = request.send().await?;
        if resp.status() != StatusCode::OK && resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::Unexpected(resp.status()));
        }
        let content_length = resp.content_length();

        let want = range.end - range.start;
        let mut writer = FileWriter::new(
            Arc::clone(&self.meta),
            self.ops.clone(),
            range.start,
            true,
        );
        let mut written = 0u64;
        while written < want {
            let Some(chunk) = resp.chunk().await? else {
                break;
            };
            self.raw_read.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            let take = chunk.len().min((want - written) as usize);
            let n = writer.write(chunk.slice(..take)).await?;
            written += n as u64;
        }
        if written < want {
            return Err(DownloadError::Truncated { got: written, want });
        }
        if let Some(length) = content_length {
            if length != written {
                tracing::error!(
                    length,
                    written,
                    start = range.start,
                    end = range.end,
                    "Content-Length does not match the bytes streamed"
                );
            }
        }
        self.drain(&mut resp).await;
        Ok(written)
    }

    /// Single pass for sources without range support: plain GET from byte
    /// zero, counted through the stream accounting path.
    async fn fetch_stream(&self) -> Result<u64, DownloadError> {
        let mut request = self.client.get(&self.meta.source);
        for (key, value) in self.headers.iter() {
            request = request.header(key.as_str(), value.as_str());
        }
        let mut resp = request.send().await?;
        if resp.status() != StatusCode::OK && resp.status() != StatusCode::PARTIAL_CONTENT {
            return Err(DownloadError::Unexpected(resp.status()));
        }

        let mut writer = FileWriter::new(Arc::clone(&self.meta), self.ops.clone(), 0, false);
        let mut written = 0u64;
        while let Some(chunk) = resp.chunk().await? {
            self.raw_read.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            written += writer.write(chunk).await? as u64;
        }
        Ok(written)
    }

    /// Reads any bytes left after a bounded copy so the connection goes back
    /// to the pool clean. Errors here do not matter; the range is already on
    /// disk.
    async fn drain(&self, resp: &mut Response) {
        while let Ok(Some(chunk)) = resp.chunk().await {
            self.raw_read.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }
    }
}

/// Splits one `-H 'Key: Value'` argument at its first colon.
pub(crate) fn parse_header(raw: &str) -> Option<(String, String)> {
    let (key, value) = raw.split_once(':')?;
    let key = key.trim();
    if key.is_empty() {
        return None;
    }
    Some((key.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_split_at_first_colon() {
        assert_eq!(
            parse_header("Authorization: Bearer a:b:c"),
            Some(("Authorization".to_string(), "Bearer a:b:c".to_string()))
        );
        assert_eq!(
            parse_header("X-Empty:"),
            Some(("X-Empty".to_string(), String::new()))
        );
        assert_eq!(parse_header("no-colon-here"), None);
        assert_eq!(parse_header(": value"), None);
    }
}
