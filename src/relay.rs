// pardl - relay.rs
//
// Relay mode: a peer runs `pardl -s <addr>` and lends its network path to
// downloaders behind a restricted one. The endpoint forwards a (possibly
// ranged) request to the origin and streams the body back.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http::{header, HeaderValue, Method, StatusCode};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;

use crate::X_SOURCE;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("relay server: {0}")]
    Io(#[from] std::io::Error),
}

/// Builds the relay endpoint URL: `http://<host>/proxy?url=...` with `start`
/// and `end` appended when the caller wants a byte range. `end` is exclusive
/// and zero means unbounded, matching the download side.
pub fn proxy_url(host: &str, source: &str, start: Option<u64>, end: Option<u64>) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("url", source);
    if let Some(start) = start {
        query.append_pair("start", &start.to_string());
    }
    if let Some(end) = end.filter(|&end| end > 0) {
        query.append_pair("end", &end.to_string());
    }
    format!("http://{}/proxy?{}", host, query.finish())
}

#[derive(Deserialize, Debug)]
struct ProxyParams {
    url: String,
    start: Option<u64>,
    end: Option<u64>,
}

pub fn router() -> Router {
    Router::new()
        .route("/proxy", get(proxy_handler))
        .with_state(Client::new())
}

/// Binds `addr` and serves `/proxy` until the process is stopped.
pub async fn serve(addr: &str) -> Result<(), RelayError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "relay serving /proxy");
    axum::serve(listener, router()).await?;
    Ok(())
}

fn range_value(start: u64, end: Option<u64>) -> String {
    match end {
        Some(end) if end > 0 => format!("bytes={}-{}", start, end - 1),
        _ => format!("bytes={}-", start),
    }
}

/// Forwards the client's method to the requested origin, with a `Range`
/// header when `start` is given. Upstream headers are passed through, plus
/// `X-Source` naming the URL the origin resolved to, so a HEAD through the
/// relay stays redirect-transparent. 200 and 206 are the only successes.
async fn proxy_handler(
    State(client): State<Client>,
    method: Method,
    Query(params): Query<ProxyParams>,
) -> Response {
    let mut upstream = client.request(method, &params.url);
    if let Some(start) = params.start {
        upstream = upstream.header(header::RANGE, range_value(start, params.end));
    }
    let resp = match upstream.send().await {
        Ok(resp) => resp,
        Err(err) => return (StatusCode::BAD_GATEWAY, err.to_string()).into_response(),
    };

    let status = resp.status();
    if status != StatusCode::OK && status != StatusCode::PARTIAL_CONTENT {
        return (status, format!("remote error: {status}")).into_response();
    }

    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        for (name, value) in resp.headers() {
            if name == header::TRANSFER_ENCODING || name == header::CONNECTION {
                continue;
            }
            headers.append(name, value.clone());
        }
        if let Ok(value) = HeaderValue::from_str(resp.url().as_str()) {
            headers.insert(X_SOURCE, value);
        }
    }
    builder
        .body(Body::from_stream(resp.bytes_stream()))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_url_includes_only_requested_bounds() {
        assert_eq!(
            proxy_url("peer:8000", "http://o/f.bin", None, None),
            "http://peer:8000/proxy?url=http%3A%2F%2Fo%2Ff.bin"
        );
        assert_eq!(
            proxy_url("peer:8000", "http://o/f.bin", Some(0), Some(1024)),
            "http://peer:8000/proxy?url=http%3A%2F%2Fo%2Ff.bin&start=0&end=1024"
        );
        assert_eq!(
            proxy_url("peer:8000", "http://o/f.bin", Some(10), Some(0)),
            "http://peer:8000/proxy?url=http%3A%2F%2Fo%2Ff.bin&start=10"
        );
    }

    #[test]
    fn proxy_url_escapes_query_sources() {
        let url = proxy_url("peer", "http://o/f.bin?a=1&b=2", Some(5), None);
        assert_eq!(url, "http://peer/proxy?url=http%3A%2F%2Fo%2Ff.bin%3Fa%3D1%26b%3D2&start=5");
    }

    #[test]
    fn range_values() {
        assert_eq!(range_value(0, Some(1024)), "bytes=0-1023");
        assert_eq!(range_value(512, None), "bytes=512-");
        assert_eq!(range_value(512, Some(0)), "bytes=512-");
    }
}
