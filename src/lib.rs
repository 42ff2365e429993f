// pardl - parallel resumable HTTP downloader.

pub mod metadata;
pub mod rate_limit;
pub mod relay;
pub mod task;
pub mod worker;
pub mod writer;

pub use metadata::{Meta, MetaError};
pub use task::{DownloadTask, TaskError, TaskOptions};

use http::header::HeaderName;

/// Relay responses carry the resolved origin URL in this header so a client
/// downloading through a relay learns where redirects actually landed.
pub const X_SOURCE: HeaderName = HeaderName::from_static("x-source");

/// User agent sent when the caller does not configure one.
pub const DEFAULT_USER_AGENT: &str = concat!("pardl/", env!("CARGO_PKG_VERSION"));
