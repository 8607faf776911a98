//! Error types for zooweeper

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === ZTree Errors ===
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Record {0} already exists")]
    AlreadyExists(u64),

    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Metadata corrupted: {0}")]
    MetadataCorrupted(String),

    // === Zab Errors ===
    #[error("Not leader: current leader is {0}")]
    NotLeader(String),

    #[error("No leader elected yet")]
    NoLeader,

    #[error("Consensus timeout: {0}")]
    ConsensusTimeout(String),

    #[error("Rejected message from {actual}: expected {expected}")]
    WrongSender { expected: String, actual: String },

    // === Request Errors ===
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // === Network Errors ===
    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// No answer from the peer: refused, reset or timed out
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::Timeout(_) | Error::ConnectionFailed(_))
    }

    /// Convert to HTTP status code
    pub fn to_http_status(&self) -> StatusCode {
        match self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::NotLeader(_) | Error::NoLeader => StatusCode::SERVICE_UNAVAILABLE,
            Error::WrongSender { .. } => StatusCode::FORBIDDEN,
            Error::InvalidRequest(_) | Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::ConsensusTimeout(_) | Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::ConnectionFailed(_) | Error::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.to_http_status();
        if status.is_server_error() {
            tracing::error!(status = %status.as_u16(), "{}", self);
        }
        (status, axum::Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            Error::ConnectionFailed(e.to_string())
        } else if e.is_decode() {
            Error::InvalidRequest(e.to_string())
        } else {
            Error::Http(e.to_string())
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::InvalidRequest(e.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::MetadataCorrupted(e.to_string())
    }
}

impl From<config::ConfigError> for Error {
    fn from(e: config::ConfigError) -> Self {
        Error::InvalidConfig(e.to_string())
    }
}
