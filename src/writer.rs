// pardl - writer.rs
//
// All disk writes funnel through one IO task that owns the target file.
// Workers talk to it over a small bounded channel, which removes any locking
// around the file handle and gives the rate limiter a single choke point.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::metadata::Meta;
use crate::rate_limit::RateLimit;
use crate::worker::DownloadError;

/// Depth of the write-op channel feeding the IO loop.
pub const WRITE_QUEUE: usize = 8;

/// One positioned write: `buf` lands at `offset`, and the byte count comes
/// back on `reply`.
pub struct WriteOp {
    pub offset: u64,
    pub buf: Bytes,
    pub reply: oneshot::Sender<std::io::Result<usize>>,
}

pub(crate) async fn open_target(path: &std::path::Path) -> std::io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .await
}

/// Consumes write ops until the stop signal. A failed write closes and
/// reopens the target before reporting the error back; a target that cannot
/// be reopened is unrecoverable.
pub(crate) async fn io_loop(
    path: PathBuf,
    mut file: File,
    mut ops: mpsc::Receiver<WriteOp>,
    rate_limit: Option<Arc<RateLimit>>,
    stop: CancellationToken,
) {
    loop {
        let op = tokio::select! {
            op = ops.recv() => match op {
                Some(op) => op,
                None => return,
            },
            _ = stop.cancelled() => return,
        };

        let result = write_at(&mut file, op.offset, &op.buf).await;
        if result.is_err() {
            file = open_target(&path)
                .await
                .expect("cannot reopen the target file");
        }
        if let Some(limit) = &rate_limit {
            // A parked producer would never wake once the ticker stops
            // resetting the window, so the stop signal cuts in here too.
            tokio::select! {
                _ = limit.process(op.buf.len() as u64) => {}
                _ = stop.cancelled() => return,
            }
        }
        let _ = op.reply.send(result);
    }
}

async fn write_at(file: &mut File, offset: u64, buf: &[u8]) -> std::io::Result<usize> {
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(buf).await?;
    Ok(buf.len())
}

/// Adapter between one HTTP body stream and the IO loop. Keeps a running
/// absolute offset and reports every landed chunk to the manifest.
///
/// A ranged request never crosses a block boundary, so each write here marks
/// progress on exactly one block.
pub struct FileWriter {
    offset: u64,
    first: bool,
    ranged: bool,
    ops: mpsc::Sender<WriteOp>,
    meta: Arc<Meta>,
}

impl FileWriter {
    pub fn new(meta: Arc<Meta>, ops: mpsc::Sender<WriteOp>, offset: u64, ranged: bool) -> Self {
        FileWriter {
            offset,
            first: true,
            ranged,
            ops,
            meta,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Ships one chunk to the IO loop and waits for it to land, then records
    /// the progress. An empty very first chunk is ignored, a quirk of
    /// upstream buffered readers.
    pub async fn write(&mut self, buf: Bytes) -> Result<usize, DownloadError> {
        if self.first {
            self.first = false;
            if buf.is_empty() {
                return Ok(0);
            }
        }
        let (reply, replied) = oneshot::channel();
        let op = WriteOp {
            offset: self.offset,
            buf,
            reply,
        };
        self.ops
            .send(op)
            .await
            .map_err(|_| DownloadError::WriterGone)?;
        let n = replied.await.map_err(|_| DownloadError::WriterGone)??;
        self.offset += n as u64;
        if n == 0 {
            return Ok(0);
        }
        if self.ranged {
            self.meta.mark_finish_by_n(self.offset, n, true).await?;
        } else {
            self.meta.mark_finish_stream(n as u64);
        }
        Ok(n)
    }
}
