// End-to-end download scenarios against an in-process origin server.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use http::{header, HeaderMap, Method, StatusCode};
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use pardl::{relay, DownloadTask, TaskOptions};

struct Origin {
    body: Vec<u8>,
    etag: String,
    accept_ranges: bool,
    /// Inclusive byte ranges requested so far.
    ranges: Mutex<Vec<(u64, u64)>>,
}

impl Origin {
    fn new(body: Vec<u8>, etag: &str, accept_ranges: bool) -> Arc<Origin> {
        Arc::new(Origin {
            body,
            etag: etag.to_string(),
            accept_ranges,
            ranges: Mutex::new(Vec::new()),
        })
    }
}

fn pattern_body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

fn parse_range(value: &str, len: u64) -> (u64, u64) {
    let spec = value.trim_start_matches("bytes=");
    let (start, end) = spec.split_once('-').expect("well-formed range");
    let start: u64 = start.parse().unwrap();
    let end: u64 = if end.is_empty() {
        len - 1
    } else {
        end.parse::<u64>().unwrap().min(len - 1)
    };
    (start, end)
}

async fn origin_handler(
    State(origin): State<Arc<Origin>>,
    method: Method,
    headers: HeaderMap,
) -> Response {
    let builder = Response::builder()
        .header(header::ETAG, &origin.etag)
        .header(
            header::ACCEPT_RANGES,
            if origin.accept_ranges { "bytes" } else { "none" },
        );

    if origin.accept_ranges {
        if let Some(range) = headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
            let (start, end) = parse_range(range, origin.body.len() as u64);
            origin.ranges.lock().await.push((start, end));
            let slice = origin.body[start as usize..=end as usize].to_vec();
            return builder
                .status(StatusCode::PARTIAL_CONTENT)
                .header(header::CONTENT_LENGTH, slice.len())
                .header(
                    header::CONTENT_RANGE,
                    format!("bytes {start}-{end}/{}", origin.body.len()),
                )
                .body(Body::from(slice))
                .unwrap();
        }
    }

    let builder = builder
        .status(StatusCode::OK)
        .header(header::CONTENT_LENGTH, origin.body.len());
    if method == Method::HEAD {
        builder.body(Body::empty()).unwrap()
    } else {
        builder.body(Body::from(origin.body.clone())).unwrap()
    }
}

async fn spawn_origin(origin: Arc<Origin>) -> SocketAddr {
    let app = Router::new()
        .route("/file.bin", get(origin_handler))
        .with_state(origin);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn quiet_options() -> TaskOptions {
    TaskOptions {
        progress: false,
        ..TaskOptions::default()
    }
}

fn write_sidecar(dir: &Path, url: &str, etag: &str, file_size: u64, blk_bit: u32, records: &[(usize, u64)]) {
    let mut lines = vec![
        serde_json::to_string(&dir.to_string_lossy()).unwrap(),
        serde_json::to_string("file.bin").unwrap(),
        serde_json::to_string(etag).unwrap(),
        serde_json::to_string(url).unwrap(),
        file_size.to_string(),
        blk_bit.to_string(),
        serde_json::to_string(url).unwrap(),
    ];
    for (offset, written) in records {
        lines.push(format!("{{\"o\":{offset},\"w\":{written}}}"));
    }
    let mut content = lines.join("\n");
    content.push('\n');
    std::fs::write(dir.join("file.bin.godl"), content).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fresh_download_covers_every_block() {
    let body = pattern_body(20_000);
    let origin = Origin::new(body.clone(), "\"v1\"", true);
    let addr = spawn_origin(Arc::clone(&origin)).await;
    let url = format!("http://{addr}/file.bin");
    let dir = tempfile::tempdir().unwrap();

    let mut task = DownloadTask::new(&url, dir.path(), 12, quiet_options())
        .await
        .unwrap();
    task.schedule(4).await;
    task.close().await;

    assert!(task.meta.is_finish());
    assert_eq!(task.meta.written(), 20_000);
    let stored = std::fs::read(dir.path().join("file.bin")).unwrap();
    assert_eq!(stored, body);

    let mut ranges = origin.ranges.lock().await.clone();
    ranges.sort_unstable();
    assert_eq!(
        ranges,
        vec![
            (0, 4095),
            (4096, 8191),
            (8192, 12287),
            (12288, 16383),
            (16384, 19999),
        ]
    );

    task.meta.remove().unwrap();
    assert!(!dir.path().join("file.bin.godl").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resume_requests_only_missing_ranges() {
    let body = pattern_body(20_000);
    let origin = Origin::new(body.clone(), "\"v1\"", true);
    let addr = spawn_origin(Arc::clone(&origin)).await;
    let url = format!("http://{addr}/file.bin");
    let dir = tempfile::tempdir().unwrap();

    // Blocks 0 and 1 are done, block 2 stopped 1000 bytes in.
    write_sidecar(
        dir.path(),
        &url,
        "\"v1\"",
        20_000,
        12,
        &[(0, 4096), (1, 4096), (2, 1000)],
    );
    let mut partial = body.clone();
    partial.truncate(2 * 4096 + 1000);
    std::fs::write(dir.path().join("file.bin"), &partial).unwrap();

    let mut task = DownloadTask::new(&url, dir.path(), 12, quiet_options())
        .await
        .unwrap();
    assert_eq!(task.meta.written(), 9192);
    task.schedule(4).await;
    task.close().await;

    assert!(task.meta.is_finish());
    let stored = std::fs::read(dir.path().join("file.bin")).unwrap();
    assert_eq!(stored, body);

    let mut ranges = origin.ranges.lock().await.clone();
    ranges.sort_unstable();
    assert_eq!(
        ranges,
        vec![(9192, 12287), (12288, 16383), (16384, 19999)],
        "completed regions must not be fetched again"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn changed_etag_abandons_disk_progress() {
    let body = pattern_body(20_000);
    let origin = Origin::new(body.clone(), "\"v2\"", true);
    let addr = spawn_origin(Arc::clone(&origin)).await;
    let url = format!("http://{addr}/file.bin");
    let dir = tempfile::tempdir().unwrap();

    write_sidecar(
        dir.path(),
        &url,
        "\"v1\"",
        20_000,
        12,
        &[(0, 4096), (1, 4096), (2, 4096), (3, 4096), (4, 3616)],
    );

    let mut task = DownloadTask::new(&url, dir.path(), 12, quiet_options())
        .await
        .unwrap();
    assert_eq!(task.meta.written(), 0);
    task.schedule(4).await;
    task.close().await;

    assert!(task.meta.is_finish());
    assert_eq!(origin.ranges.lock().await.len(), 5);
    let stored = std::fs::read(dir.path().join("file.bin")).unwrap();
    assert_eq!(stored, body);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_stream_when_ranges_unsupported() {
    let body = pattern_body(500);
    let origin = Origin::new(body.clone(), "\"v1\"", false);
    let addr = spawn_origin(Arc::clone(&origin)).await;
    let url = format!("http://{addr}/file.bin");
    let dir = tempfile::tempdir().unwrap();

    let mut task = DownloadTask::new(&url, dir.path(), 20, quiet_options())
        .await
        .unwrap();
    assert!(!task.meta.is_accept_range());
    task.schedule(3).await;
    task.close().await;

    assert!(task.meta.is_finish());
    assert_eq!(task.meta.written(), 500);
    let stored = std::fs::read(dir.path().join("file.bin")).unwrap();
    assert_eq!(stored, body);
    assert!(origin.ranges.lock().await.is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn relay_forwards_ranges_and_names_the_source() {
    let body = pattern_body(20_000);
    let origin = Origin::new(body.clone(), "\"v1\"", true);
    let origin_addr = spawn_origin(Arc::clone(&origin)).await;
    let origin_url = format!("http://{origin_addr}/file.bin");

    let relay_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay_listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(relay_listener, relay::router()).await.unwrap();
    });

    let client = reqwest::Client::new();
    let resp = client
        .get(relay::proxy_url(
            &relay_addr.to_string(),
            &origin_url,
            Some(4096),
            Some(8192),
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(
        resp.headers().get("x-source").unwrap().to_str().unwrap(),
        origin_url
    );
    assert_eq!(resp.bytes().await.unwrap().as_ref(), &body[4096..8192]);

    let resp = client
        .head(relay::proxy_url(
            &relay_addr.to_string(),
            &origin_url,
            None,
            None,
        ))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("x-source").is_some());
    assert_eq!(
        resp.headers().get(header::ETAG).unwrap().to_str().unwrap(),
        "\"v1\""
    );

    // A download spread across the relay and the direct path.
    let dir = tempfile::tempdir().unwrap();
    let options = TaskOptions {
        relays: vec![relay_addr.to_string()],
        ..quiet_options()
    };
    let mut task = DownloadTask::new(&origin_url, dir.path(), 12, options)
        .await
        .unwrap();
    assert_eq!(task.meta.source, origin_url);
    task.schedule(2).await;
    task.close().await;

    assert!(task.meta.is_finish());
    let stored = std::fs::read(dir.path().join("file.bin")).unwrap();
    assert_eq!(stored, body);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn small_files_use_fewer_connections_than_asked() {
    let body = pattern_body(5_000);
    let origin = Origin::new(body.clone(), "\"v1\"", true);
    let addr = spawn_origin(Arc::clone(&origin)).await;
    let url = format!("http://{addr}/file.bin");
    let dir = tempfile::tempdir().unwrap();

    let mut task = DownloadTask::new(&url, dir.path(), 12, quiet_options())
        .await
        .unwrap();
    // Two blocks; asking for eight connections must not oversubscribe.
    task.schedule(8).await;
    task.close().await;

    assert!(task.meta.is_finish());
    let mut ranges = origin.ranges.lock().await.clone();
    ranges.sort_unstable();
    assert_eq!(ranges, vec![(0, 4095), (4096, 4999)]);
}
