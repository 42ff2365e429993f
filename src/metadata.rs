// pardl - metadata.rs
//
// The download manifest: block states, the `.godl` sidecar next to the
// target file, and the HEAD probe that sizes a fresh download.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::future::FutureExt;
use futures_util::stream::{FuturesUnordered, StreamExt};
use http::header::{HeaderMap, ACCEPT_RANGES, CONTENT_DISPOSITION, CONTENT_LENGTH, ETAG};
use percent_encoding::percent_decode_str;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use url::Url;

use crate::relay::proxy_url;
use crate::X_SOURCE;

const SIDECAR_SUFFIX: &str = "godl";

#[derive(Error, Debug)]
pub enum MetaError {
    #[error("invalid url {url}: {source}")]
    InvalidUrl { url: String, source: url::ParseError },
    #[error("cannot derive a file name from {0}")]
    NoFileName(String),
    #[error("manifest i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed manifest record: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("manifest ends inside the header (missing {0})")]
    TruncatedHeader(&'static str),
    #[error("progress record names block {offset}, but the manifest only has {count}")]
    RecordOutOfRange { offset: usize, count: usize },
    #[error("every probe failed: {0}")]
    ProbeFailed(String),
    #[error("missing or unparseable Content-Length")]
    NoContentLength,
    #[error("block size bit {0} is out of range")]
    BlockBitOutOfRange(u32),
    #[error("block {idx} progress went backwards")]
    Regressed { idx: usize },
}

/// State of a single block of the target file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockState {
    /// Not yet attempted (or returned to the pool after a failure).
    #[default]
    Pending,
    /// Claimed by a worker.
    InProgress,
    /// Every byte of the block is on disk.
    Completed,
}

/// A fixed-size region of the target file. `written` counts payload bytes
/// already stored; the block is complete when it reaches the block capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Block {
    pub state: BlockState,
    pub written: u64,
}

impl Block {
    /// Raises `written` to the new value, completing the block when it hits
    /// `max`. Returns the added byte count, or `None` when the new value is
    /// behind what was already recorded.
    fn mark_finish(&mut self, written: u64, max: u64) -> Option<u64> {
        let change = written.checked_sub(self.written)?;
        self.written = written;
        if written == max {
            self.state = BlockState::Completed;
        }
        Some(change)
    }
}

/// One sidecar progress record: block `offset` now holds `written` bytes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy)]
pub struct BlockProgress {
    #[serde(rename = "o")]
    pub offset: usize,
    #[serde(rename = "w")]
    pub written: u64,
}

/// The byte range a worker should fetch next, `[start, end)`. `start`
/// already accounts for bytes persisted by an earlier attempt, so a resumed
/// block is fetched from the middle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub idx: usize,
    pub start: u64,
    pub end: u64,
}

#[derive(Debug)]
struct MetaState {
    blocks: Vec<Option<Block>>,
    sidecar: Option<std::fs::File>,
}

/// The download manifest. Scalar identity fields are fixed once the HEAD
/// probe and disk reconciliation finish; after that the manifest is shared
/// between workers and only the block table and the written counter change.
#[derive(Debug)]
pub struct Meta {
    pub pwd: PathBuf,
    pub name: String,
    pub etag: String,
    /// Current effective URL after redirects or relay resolution.
    pub source: String,
    /// The URL originally supplied by the user.
    pub endpoint: String,
    pub file_size: u64,
    pub blk_bit: u32,
    pub blk_size: u64,

    accept_ranges: bool,
    probed: bool,
    written: AtomicU64,
    state: Mutex<MetaState>,
}

impl Meta {
    /// Creates a manifest for `endpoint`, deriving the output name from the
    /// URL path and opening the sidecar in append mode (truncated when
    /// `clean`).
    pub fn new(pwd: &Path, endpoint: &str, blk_bit: u32, clean: bool) -> Result<Self, MetaError> {
        if blk_bit >= 64 {
            return Err(MetaError::BlockBitOutOfRange(blk_bit));
        }
        let url = Url::parse(endpoint).map_err(|source| MetaError::InvalidUrl {
            url: endpoint.to_string(),
            source,
        })?;
        let name = Path::new(url.path())
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .ok_or_else(|| MetaError::NoFileName(endpoint.to_string()))?;

        let mut meta = Meta {
            pwd: pwd.to_path_buf(),
            name,
            etag: String::new(),
            source: endpoint.to_string(),
            endpoint: endpoint.to_string(),
            file_size: 0,
            blk_bit,
            blk_size: 1 << blk_bit,
            accept_ranges: false,
            probed: false,
            written: AtomicU64::new(0),
            state: Mutex::new(MetaState {
                blocks: Vec::new(),
                sidecar: None,
            }),
        };
        let sidecar = meta.open_sidecar(clean)?;
        meta.state.get_mut().sidecar = Some(sidecar);
        Ok(meta)
    }

    /// Rebuilds a manifest from an existing sidecar file, without opening it
    /// for writing. Used to pick the source URL and block size back up when
    /// the caller hands us a manifest path instead of a URL.
    pub fn from_file(path: &Path) -> Result<Self, MetaError> {
        let file = std::fs::File::open(path)?;
        let decoded = decode_sidecar(BufReader::new(file))?;
        Ok(Self::from_decoded(decoded))
    }

    fn from_decoded(d: DecodedManifest) -> Self {
        Meta {
            pwd: PathBuf::from(d.pwd),
            name: d.name,
            etag: d.etag,
            source: d.source,
            endpoint: d.endpoint,
            file_size: d.file_size,
            blk_bit: d.blk_bit,
            blk_size: 1u64 << d.blk_bit,
            accept_ranges: false,
            probed: false,
            written: AtomicU64::new(d.written),
            state: Mutex::new(MetaState {
                blocks: d.blocks,
                sidecar: None,
            }),
        }
    }

    fn open_sidecar(&self, truncate: bool) -> Result<std::fs::File, MetaError> {
        // append and truncate cannot be combined in a single open.
        if truncate {
            let _ = std::fs::remove_file(self.sidecar_path());
        }
        let file = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.sidecar_path())?;
        Ok(file)
    }

    /// `<pwd>/<name>` - where the payload goes.
    pub fn target_path(&self) -> PathBuf {
        self.pwd.join(&self.name)
    }

    /// `<pwd>/<name>.godl` - where progress goes.
    pub fn sidecar_path(&self) -> PathBuf {
        self.pwd.join(format!("{}.{}", self.name, SIDECAR_SUFFIX))
    }

    pub fn is_accept_range(&self) -> bool {
        self.accept_ranges
    }

    /// Total payload bytes persisted so far.
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn is_finish(&self) -> bool {
        self.written() == self.file_size
    }

    pub fn block_count(&self) -> usize {
        let cnt = self.file_size >> self.blk_bit;
        if self.file_size & (self.blk_size - 1) == 0 {
            cnt as usize
        } else {
            cnt as usize + 1
        }
    }

    /// Snapshot of the block table, for inspection and tests.
    pub async fn blocks(&self) -> Vec<Option<Block>> {
        self.state.lock().await.blocks.clone()
    }

    pub(crate) fn set_file_size(&mut self, size: u64) {
        self.file_size = size;
        let cnt = self.block_count();
        self.state.get_mut().blocks = vec![None; cnt];
    }

    /// Issues HEAD requests in parallel: one straight to the source, one per
    /// relay. The first successful response wins and the rest are dropped.
    /// When a relay wins, its `X-Source` header names the resolved origin; a
    /// relay that omits the header leaves the source URL unchanged.
    async fn head_probe(
        &self,
        client: &Client,
        relays: &[String],
    ) -> Result<(HeaderMap, String), MetaError> {
        let mut probes = FuturesUnordered::new();

        let direct = {
            let client = client.clone();
            let url = self.source.clone();
            async move {
                let resp = client.head(&url).send().await.map_err(|e| e.to_string())?;
                let resp = resp.error_for_status().map_err(|e| e.to_string())?;
                let source = resp.url().to_string();
                Ok::<_, String>((resp.headers().clone(), source))
            }
        };
        probes.push(direct.boxed());

        for relay in relays {
            let client = client.clone();
            let url = self.source.clone();
            let probe_url = proxy_url(relay, &self.source, None, None);
            probes.push(
                async move {
                    let resp = client
                        .head(&probe_url)
                        .send()
                        .await
                        .map_err(|e| e.to_string())?;
                    let resp = resp.error_for_status().map_err(|e| e.to_string())?;
                    let source = resp
                        .headers()
                        .get(&X_SOURCE)
                        .and_then(|v| v.to_str().ok())
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .unwrap_or(url);
                    Ok((resp.headers().clone(), source))
                }
                .boxed(),
            );
        }

        let mut errors = Vec::new();
        while let Some(result) = probes.next().await {
            match result {
                Ok(won) => return Ok(won),
                Err(err) => errors.push(err),
            }
        }
        Err(MetaError::ProbeFailed(errors.join(";")))
    }

    /// Runs the HEAD probe and fills in everything the response tells us:
    /// file size, range support, ETag, and a Content-Disposition file name
    /// when the server supplies one.
    pub async fn retrieve_from_head(
        &mut self,
        client: &Client,
        relays: &[String],
    ) -> Result<(), MetaError> {
        let (headers, source) = self.head_probe(client, relays).await?;
        self.source = source;
        self.probed = true;

        let size: u64 = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .ok_or(MetaError::NoContentLength)?;
        if size > 0 {
            self.set_file_size(size);
        }
        if let Some(name) = headers
            .get_all(CONTENT_DISPOSITION)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(filename_from_disposition)
        {
            self.name = name;
        }
        self.etag = headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        self.accept_ranges = headers
            .get_all(ACCEPT_RANGES)
            .iter()
            .any(|v| v.as_bytes() == b"bytes");
        Ok(())
    }

    /// Probes the source, then reconciles with any sidecar already on disk.
    /// A sidecar with a matching ETag replaces our freshly-sized block table
    /// so only missing regions get fetched; a mismatched ETag abandons the
    /// on-disk progress. A missing sidecar is not an error.
    pub async fn retrieve_from_disk(
        &mut self,
        client: &Client,
        relays: &[String],
    ) -> Result<(), MetaError> {
        if !self.probed {
            self.retrieve_from_head(client, relays).await?;
        }
        if !self.accept_ranges {
            return Ok(());
        }

        let file = match std::fs::File::open(self.sidecar_path()) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        let decoded = match decode_sidecar(BufReader::new(file)) {
            Ok(d) => d,
            // An empty or half-written header means there is nothing to
            // resume; start fresh rather than failing the task.
            Err(MetaError::TruncatedHeader(_)) => return Ok(()),
            Err(err) => return Err(err),
        };

        if decoded.blk_bit != self.blk_bit {
            tracing::info!(blk_bit = decoded.blk_bit, "block size taken from manifest");
        }
        if decoded.etag != self.etag {
            tracing::info!(
                disk = %decoded.etag,
                remote = %self.etag,
                "etag changed, downloading from scratch"
            );
            return Ok(());
        }

        self.pwd = PathBuf::from(decoded.pwd);
        self.name = decoded.name;
        self.source = decoded.source;
        self.endpoint = decoded.endpoint;
        self.file_size = decoded.file_size;
        self.blk_bit = decoded.blk_bit;
        self.blk_size = 1 << decoded.blk_bit;
        self.written.store(decoded.written, Ordering::Relaxed);
        self.state.get_mut().blocks = decoded.blocks;
        Ok(())
    }

    /// Rewrites the sidecar atomically: full serialization to a `.tmp`
    /// neighbor, rename over the sidecar, reopen for appending. Compacts the
    /// progress log accumulated by per-chunk appends.
    pub async fn sync(&self) -> Result<(), MetaError> {
        let mut state = self.state.lock().await;
        let path = self.sidecar_path();
        let tmp = path.with_extension(format!("{SIDECAR_SUFFIX}.tmp"));
        let mut file = std::fs::File::create(&tmp)?;
        self.encode_into(&mut file, &state.blocks)?;
        std::fs::rename(&tmp, &path)?;
        state.sidecar = Some(self.open_sidecar(false)?);
        Ok(())
    }

    /// Deletes the sidecar. Called once the download is complete.
    pub fn remove(&self) -> Result<(), MetaError> {
        std::fs::remove_file(self.sidecar_path())?;
        Ok(())
    }

    fn encode_into<W: Write>(&self, w: &mut W, blocks: &[Option<Block>]) -> Result<(), MetaError> {
        let mut w = std::io::BufWriter::new(w);
        write_record(&mut w, &self.pwd.to_string_lossy())?;
        write_record(&mut w, &self.name)?;
        write_record(&mut w, &self.etag)?;
        write_record(&mut w, &self.source)?;
        write_record(&mut w, &self.file_size)?;
        write_record(&mut w, &self.blk_bit)?;
        write_record(&mut w, &self.endpoint)?;
        for (offset, blk) in blocks.iter().enumerate() {
            if let Some(blk) = blk {
                write_record(
                    &mut w,
                    &BlockProgress {
                        offset,
                        written: blk.written,
                    },
                )?;
            }
        }
        w.flush()?;
        Ok(())
    }

    /// Claims the first pending block at or after `hint` and returns the
    /// byte range a worker should fetch for it. `None` once nothing at or
    /// after `hint` is pending.
    pub async fn alloc_block(&self, hint: usize) -> Option<BlockRange> {
        let mut state = self.state.lock().await;
        for idx in hint..state.blocks.len() {
            let blk = state.blocks[idx].get_or_insert_with(Block::default);
            if blk.state != BlockState::Pending {
                continue;
            }
            blk.state = BlockState::InProgress;
            let offset = (idx as u64) << self.blk_bit;
            let start = offset + blk.written;
            let end = ((idx as u64 + 1) << self.blk_bit).min(self.file_size);
            return Some(BlockRange { idx, start, end });
        }
        None
    }

    /// Returns a block to the pending pool after a failed attempt, handing
    /// back its counted bytes so the running total keeps matching the block
    /// table.
    pub async fn mark_init(&self, idx: usize) {
        let mut state = self.state.lock().await;
        if let Some(slot) = state.blocks.get_mut(idx) {
            let blk = slot.get_or_insert_with(Block::default);
            self.written.fetch_sub(blk.written, Ordering::Relaxed);
            blk.written = 0;
            blk.state = BlockState::Pending;
        }
    }

    /// Records progress from a post-write absolute offset. A cursor landing
    /// exactly on a block boundary belongs to the block just finished, not
    /// the one about to start.
    pub async fn mark_finish_by_n(
        &self,
        offset: u64,
        last_written: usize,
        flush: bool,
    ) -> Result<(), MetaError> {
        let mut idx = (offset >> self.blk_bit) as usize;
        let mut written = offset - ((idx as u64) << self.blk_bit);
        if last_written > 0 && written == 0 {
            idx -= 1;
            written = self.blk_size;
        }
        if written == 0 {
            tracing::error!(idx, offset, last_written, "marking zero progress");
        }
        self.mark_finish(idx, written, flush).await
    }

    /// Raises block `idx` to `written` bytes, bumps the running total by the
    /// delta, and appends a progress record to the sidecar when `flush` is
    /// set.
    pub async fn mark_finish(
        &self,
        idx: usize,
        written: u64,
        flush: bool,
    ) -> Result<(), MetaError> {
        let mut state = self.state.lock().await;
        let max = self.block_capacity(idx);
        let count = state.blocks.len();
        let blk = state
            .blocks
            .get_mut(idx)
            .ok_or(MetaError::RecordOutOfRange { offset: idx, count })?
            .get_or_insert_with(Block::default);
        let change = blk
            .mark_finish(written, max)
            .ok_or(MetaError::Regressed { idx })?;
        self.written.fetch_add(change, Ordering::Relaxed);
        if flush {
            if let Some(sidecar) = state.sidecar.as_mut() {
                let mut buf = serde_json::to_vec(&BlockProgress { offset: idx, written })?;
                buf.push(b'\n');
                sidecar.write_all(&buf)?;
            }
        }
        Ok(())
    }

    /// Progress accounting for the single-stream (no ranges) mode, which has
    /// no block bookkeeping.
    pub fn mark_finish_stream(&self, written: u64) {
        self.written.fetch_add(written, Ordering::Relaxed);
    }

    fn block_capacity(&self, idx: usize) -> u64 {
        let offset = (idx as u64) << self.blk_bit;
        self.file_size.saturating_sub(offset).min(self.blk_size)
    }
}

#[derive(Debug)]
struct DecodedManifest {
    pwd: String,
    name: String,
    etag: String,
    source: String,
    endpoint: String,
    file_size: u64,
    blk_bit: u32,
    blocks: Vec<Option<Block>>,
    written: u64,
}

fn next_record<T, I>(lines: &mut I, field: &'static str) -> Result<T, MetaError>
where
    T: DeserializeOwned,
    I: Iterator<Item = std::io::Result<String>>,
{
    let line = lines.next().ok_or(MetaError::TruncatedHeader(field))??;
    Ok(serde_json::from_str(&line)?)
}

fn write_record<W: Write, T: Serialize + ?Sized>(w: &mut W, value: &T) -> Result<(), MetaError> {
    serde_json::to_writer(&mut *w, value)?;
    w.write_all(b"\n")?;
    Ok(())
}

/// Decodes the sidecar: seven header records, then any number of block
/// progress records which are replayed in order. Replaying the same block
/// twice counts only the delta against the earlier record. Running out of
/// input after the header is normal; a malformed record is not.
fn decode_sidecar<R: BufRead>(r: R) -> Result<DecodedManifest, MetaError> {
    let mut lines = r.lines();
    let pwd: String = next_record(&mut lines, "pwd")?;
    let name: String = next_record(&mut lines, "name")?;
    let etag: String = next_record(&mut lines, "etag")?;
    let source: String = next_record(&mut lines, "source")?;
    let file_size: u64 = next_record(&mut lines, "fileSize")?;
    let blk_bit: u32 = next_record(&mut lines, "blkBit")?;
    let endpoint: String = next_record(&mut lines, "endpoint")?;

    // A corrupt blkBit would overflow the shifts below and size the block
    // table per byte of the file.
    if blk_bit >= 64 {
        return Err(MetaError::BlockBitOutOfRange(blk_bit));
    }
    let blk_size = 1u64 << blk_bit;
    let count = {
        let cnt = file_size >> blk_bit;
        if file_size & (blk_size - 1) == 0 {
            cnt as usize
        } else {
            cnt as usize + 1
        }
    };
    let mut blocks: Vec<Option<Block>> = vec![None; count];
    let mut written: i64 = 0;

    for line in lines {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        let record: BlockProgress = serde_json::from_str(&line)?;
        if record.offset >= count {
            return Err(MetaError::RecordOutOfRange {
                offset: record.offset,
                count,
            });
        }
        let state = if record.written == blk_size {
            BlockState::Completed
        } else {
            BlockState::Pending
        };
        let old = blocks[record.offset].replace(Block {
            state,
            written: record.written,
        });
        match old {
            Some(old) => written += record.written as i64 - old.written as i64,
            None => written += record.written as i64,
        }
    }

    // The final block is full at `fileSize mod blkSize` bytes when the file
    // size is not an exact multiple of the block size.
    if let Some(blk) = blocks.last_mut().and_then(|b| b.as_mut()) {
        let remainder = file_size & (blk_size - 1);
        if blk.state != BlockState::Completed && remainder > 0 && blk.written == remainder {
            blk.state = BlockState::Completed;
        }
    }

    Ok(DecodedManifest {
        pwd,
        name,
        etag,
        source,
        endpoint,
        file_size,
        blk_bit,
        blocks,
        written: written.max(0) as u64,
    })
}

/// Pulls a file name out of a `Content-Disposition` value. Handles the bare,
/// quoted, and percent-encoded spellings of `filename=`.
fn filename_from_disposition(value: &str) -> Option<String> {
    let start = value.find("filename=")? + "filename=".len();
    let rest = &value[start..];
    let name = match rest.strip_prefix('"') {
        Some(quoted) => quoted.split('"').next().unwrap_or(""),
        None => rest.split(';').next().unwrap_or("").trim(),
    };
    if name.is_empty() {
        return None;
    }
    let decoded = percent_decode_str(name).decode_utf8().ok()?;
    Some(decoded.into_owned())
}
