use std::io;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("no single-cell data found: {0}")]
    NoDataFound(String),

    #[error("transient I/O failure: {0}")]
    TransientIo(String),

    #[error("request failed: {0}")]
    Http(String),

    #[error("remote returned status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("gave up {what} after {attempts} attempt(s)")]
    RetriesExhausted {
        what: String,
        attempts: u32,
        #[source]
        source: Box<KiraError>,
    },

    #[error("{path} has unexpected size: expected {expected}, found {actual}")]
    UnexpectedSize {
        path: String,
        expected: String,
        actual: u64,
    },

    #[error("{0} is truncated")]
    Truncated(String),

    #[error("ambiguous match: {0}")]
    AmbiguousMatch(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("inconsistent download directory: {0}")]
    InconsistentCache(String),

    #[error("interrupted after {completed} completed task(s)")]
    Interrupted {
        completed: usize,
        /// Data that was fully downloaded before the interruption.
        downloaded: Vec<Utf8PathBuf>,
    },

    #[error("failed to download sample data: {0}")]
    SampleDownload(String),

    #[error("fetch task failed: {0}")]
    TaskFailed(String),

    #[error("invalid GEO series accession: {0}")]
    InvalidAccession(String),

    #[error("invalid GEO sample accession: {0}")]
    InvalidSampleAccession(String),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("GEO returned status {status}: {message}")]
    GeoStatus { status: u16, message: String },

    #[error("failed to parse cell type assignments: {0}")]
    CellTypeParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

impl KiraError {
    /// Whether the failure may go away by trying again.
    pub fn is_transient(&self) -> bool {
        match self {
            KiraError::TransientIo(_) | KiraError::Truncated(_) => true,
            KiraError::HttpStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    /// Maps an error raised while reading a remote stream.
    pub fn from_read(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::InvalidData | io::ErrorKind::InvalidInput => {
                KiraError::Filesystem(format!("corrupt stream: {err}"))
            }
            _ => KiraError::TransientIo(err.to_string()),
        }
    }

    /// Maps an error raised on the local filesystem.
    pub fn from_local(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::Interrupted
            | io::ErrorKind::UnexpectedEof => KiraError::TransientIo(err.to_string()),
            _ => KiraError::Filesystem(err.to_string()),
        }
    }

    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            return KiraError::TransientIo(err.to_string());
        }
        KiraError::Http(err.to_string())
    }

    pub fn interrupted(completed: usize) -> Self {
        KiraError::Interrupted {
            completed,
            downloaded: Vec::new(),
        }
    }

    pub fn is_no_data(&self) -> bool {
        matches!(self, KiraError::NoDataFound(_))
    }
}

pub(crate) fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}
