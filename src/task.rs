// pardl - task.rs

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use indicatif::{HumanBytes, ProgressBar, ProgressStyle};
use reqwest::Client;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::metadata::{Meta, MetaError};
use crate::rate_limit::RateLimit;
use crate::worker::{parse_header, Worker};
use crate::writer::{self, WriteOp, WRITE_QUEUE};
use crate::DEFAULT_USER_AGENT;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("url is empty")]
    EmptyUrl,
    #[error("http client: {0}")]
    Network(#[from] reqwest::Error),
    #[error("target file: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Meta(#[from] MetaError),
}

#[derive(Debug, Clone)]
pub struct TaskOptions {
    pub user_agent: String,
    /// Aggregate write throughput cap in bytes per second; 0 means no cap.
    pub max_speed: u64,
    /// Discard any partial download and start over.
    pub clean: bool,
    /// Draw the progress bar.
    pub progress: bool,
    /// Also show the raw bytes-read rate, which counts retried and drained
    /// bytes the write rate does not.
    pub show_read_speed: bool,
    /// Raw `Key: Value` headers for origin requests.
    pub headers: Vec<String>,
    /// Relay hosts to spread connections across.
    pub relays: Vec<String>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        TaskOptions {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            max_speed: 0,
            clean: false,
            progress: true,
            show_read_speed: false,
            headers: Vec::new(),
            relays: Vec::new(),
        }
    }
}

/// One download: probes the source, reconciles the manifest with disk,
/// owns the write loop and the progress ticker, and runs the workers.
pub struct DownloadTask {
    options: TaskOptions,
    pub meta: Arc<Meta>,
    client: Client,
    ops: mpsc::Sender<WriteOp>,
    stop: CancellationToken,
    raw_read: Arc<AtomicU64>,
    speed: Arc<AtomicU64>,
    background: Vec<JoinHandle<()>>,
}

impl DownloadTask {
    /// Like [`new`](DownloadTask::new), but a path to an existing manifest
    /// may stand in for the URL: the recorded source and block size are
    /// picked back up from it.
    pub async fn new_auto(
        url: &str,
        pwd: &Path,
        blk_bit: u32,
        options: TaskOptions,
    ) -> Result<Self, TaskError> {
        if !options.clean && Path::new(url).exists() {
            if let Ok(meta) = Meta::from_file(Path::new(url)) {
                tracing::info!(source = %meta.source, "resuming from manifest");
                let source = meta.source.clone();
                return Self::new(&source, pwd, meta.blk_bit, options).await;
            }
        }
        Self::new(url, pwd, blk_bit, options).await
    }

    pub async fn new(
        url: &str,
        pwd: &Path,
        blk_bit: u32,
        options: TaskOptions,
    ) -> Result<Self, TaskError> {
        if url.is_empty() {
            return Err(TaskError::EmptyUrl);
        }
        let client = Client::builder().user_agent(&options.user_agent).build()?;
        let mut meta = Meta::new(pwd, url, blk_bit, options.clean)?;
        if options.clean {
            let _ = std::fs::remove_file(meta.target_path());
        }

        if let Err(err) = meta.retrieve_from_disk(&client, &options.relays).await {
            let _ = meta.remove();
            return Err(err.into());
        }
        meta.sync().await?;

        let file = writer::open_target(&meta.target_path()).await?;
        let meta = Arc::new(meta);
        let (ops, rx) = mpsc::channel(WRITE_QUEUE);
        let stop = CancellationToken::new();
        let rate_limit = (options.max_speed > 0).then(|| Arc::new(RateLimit::new(options.max_speed)));
        let raw_read = Arc::new(AtomicU64::new(0));
        let speed = Arc::new(AtomicU64::new(0));

        let background = vec![
            tokio::spawn(writer::io_loop(
                meta.target_path(),
                file,
                rx,
                rate_limit.clone(),
                stop.clone(),
            )),
            tokio::spawn(progress_loop(
                Arc::clone(&meta),
                rate_limit,
                Arc::clone(&raw_read),
                Arc::clone(&speed),
                stop.clone(),
                options.progress,
                options.show_read_speed,
            )),
        ];

        Ok(DownloadTask {
            options,
            meta,
            client,
            ops,
            stop,
            raw_read,
            speed,
            background,
        })
    }

    /// Runs `n` workers to completion. Workers are dealt out round-robin
    /// across the configured relays plus a direct-to-origin slot, and all of
    /// them share the manifest's block allocator.
    pub async fn schedule(&self, n: usize) {
        let n = if self.meta.is_accept_range() {
            let blocks = self.meta.block_count();
            if n > blocks {
                tracing::info!(
                    connections = n,
                    blocks,
                    "remote file is small, lowering the connection count"
                );
                blocks
            } else {
                n
            }
        } else {
            1
        };

        let mut sources: Vec<Option<String>> =
            self.options.relays.iter().cloned().map(Some).collect();
        sources.push(None);
        let headers: Arc<Vec<(String, String)>> = Arc::new(
            self.options
                .headers
                .iter()
                .filter_map(|raw| parse_header(raw))
                .collect(),
        );

        let mut workers = Vec::with_capacity(n);
        for i in 0..n {
            let worker = Worker::new(
                self.client.clone(),
                Arc::clone(&self.meta),
                self.ops.clone(),
                sources[i % sources.len()].clone(),
                Arc::clone(&headers),
                Arc::clone(&self.raw_read),
            );
            workers.push(tokio::spawn(worker.run()));
        }
        join_all(workers).await;
    }

    /// Bytes persisted during the last whole second.
    pub fn written_per_second(&self) -> u64 {
        self.speed.load(Ordering::Relaxed)
    }

    /// Stops the write loop and the ticker and waits for them. Any worker
    /// still in flight errors out shortly after, once its writes have
    /// nowhere to go.
    pub async fn close(&mut self) {
        self.stop.cancel();
        for handle in self.background.drain(..) {
            let _ = handle.await;
        }
    }
}

/// Wakes every second until the stop signal: publishes the per-second write
/// delta, opens the next rate-limit window, and redraws the progress bar.
async fn progress_loop(
    meta: Arc<Meta>,
    rate_limit: Option<Arc<RateLimit>>,
    raw_read: Arc<AtomicU64>,
    speed: Arc<AtomicU64>,
    stop: CancellationToken,
    show: bool,
    show_read_speed: bool,
) {
    let bar = if show {
        let bar = ProgressBar::new(meta.file_size);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes:>12}/{total_bytes:<12} {bytes_per_sec:>12} {eta:>4} {msg}")
                .unwrap()
                .progress_chars("=>-"),
        );
        bar
    } else {
        ProgressBar::hidden()
    };
    bar.set_position(meta.written());

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await;
    let mut last = meta.written();
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.cancelled() => break,
        }
        let written = meta.written();
        // A retried block hands its bytes back, so the delta can dip below
        // zero for a tick.
        speed.store(written.saturating_sub(last), Ordering::Relaxed);
        last = written;
        if let Some(limit) = &rate_limit {
            limit.reset();
        }
        let raw = raw_read.swap(0, Ordering::Relaxed);
        bar.set_position(written);
        if show_read_speed {
            bar.set_message(format!("read {}/s", HumanBytes(raw)));
        }
    }

    bar.set_position(meta.written());
    if meta.is_finish() {
        bar.finish();
    } else {
        bar.abandon();
    }
}
