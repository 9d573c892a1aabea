// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the server.
/// Using `thiserror` allows for clean error definitions and automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum OpalError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Request timestamp outside the tolerated clock skew window")]
    ClockSkew,

    #[error("Replayed request nonce")]
    Replay,

    #[error("Rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Invalid cluster token")]
    BadToken,

    #[error("Cluster is already initialized on this node")]
    AlreadyInitialized,

    #[error("This node is already a member of a cluster")]
    AlreadyInCluster,

    #[error("This node is not a member of a cluster")]
    NotInCluster,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage quota exceeded for tenant '{0}'")]
    QuotaExceeded(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl OpalError {
    /// Maps each error kind to the HTTP status it surfaces as at the edge.
    pub fn http_status(&self) -> u16 {
        match self {
            OpalError::Validation(_) => 400,
            OpalError::Unauthorized(_)
            | OpalError::ClockSkew
            | OpalError::Replay
            | OpalError::BadToken => 401,
            OpalError::QuotaExceeded(_) => 403,
            OpalError::NotFound(_) => 404,
            OpalError::Conflict(_)
            | OpalError::AlreadyInitialized
            | OpalError::AlreadyInCluster
            | OpalError::NotInCluster => 409,
            OpalError::RateLimited(_) => 429,
            OpalError::HttpClient(_) | OpalError::Unreachable(_) => 502,
            OpalError::Timeout(_) => 504,
            _ => 500,
        }
    }
}

// Manual implementation of Clone because `std::io::Error` is not cloneable.
// We wrap it in an Arc to allow for cheap, shared cloning.
impl Clone for OpalError {
    fn clone(&self) -> Self {
        match self {
            OpalError::Io(e) => OpalError::Io(Arc::clone(e)),
            OpalError::HttpClient(s) => OpalError::HttpClient(s.clone()),
            OpalError::Unreachable(s) => OpalError::Unreachable(s.clone()),
            OpalError::Timeout(s) => OpalError::Timeout(s.clone()),
            OpalError::Unauthorized(s) => OpalError::Unauthorized(s.clone()),
            OpalError::ClockSkew => OpalError::ClockSkew,
            OpalError::Replay => OpalError::Replay,
            OpalError::RateLimited(s) => OpalError::RateLimited(s.clone()),
            OpalError::BadToken => OpalError::BadToken,
            OpalError::AlreadyInitialized => OpalError::AlreadyInitialized,
            OpalError::AlreadyInCluster => OpalError::AlreadyInCluster,
            OpalError::NotInCluster => OpalError::NotInCluster,
            OpalError::Validation(s) => OpalError::Validation(s.clone()),
            OpalError::NotFound(s) => OpalError::NotFound(s.clone()),
            OpalError::Conflict(s) => OpalError::Conflict(s.clone()),
            OpalError::QuotaExceeded(s) => OpalError::QuotaExceeded(s.clone()),
            OpalError::Integrity(s) => OpalError::Integrity(s.clone()),
            OpalError::Replication(s) => OpalError::Replication(s.clone()),
            OpalError::Migration(s) => OpalError::Migration(s.clone()),
            OpalError::Internal(s) => OpalError::Internal(s.clone()),
        }
    }
}

impl PartialEq for OpalError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (OpalError::Io(e1), OpalError::Io(e2)) => e1.to_string() == e2.to_string(),
            (OpalError::HttpClient(s1), OpalError::HttpClient(s2)) => s1 == s2,
            (OpalError::Unreachable(s1), OpalError::Unreachable(s2)) => s1 == s2,
            (OpalError::Timeout(s1), OpalError::Timeout(s2)) => s1 == s2,
            (OpalError::Unauthorized(s1), OpalError::Unauthorized(s2)) => s1 == s2,
            (OpalError::Validation(s1), OpalError::Validation(s2)) => s1 == s2,
            (OpalError::NotFound(s1), OpalError::NotFound(s2)) => s1 == s2,
            (OpalError::Conflict(s1), OpalError::Conflict(s2)) => s1 == s2,
            (OpalError::QuotaExceeded(s1), OpalError::QuotaExceeded(s2)) => s1 == s2,
            (OpalError::Integrity(s1), OpalError::Integrity(s2)) => s1 == s2,
            (OpalError::Replication(s1), OpalError::Replication(s2)) => s1 == s2,
            (OpalError::Migration(s1), OpalError::Migration(s2)) => s1 == s2,
            (OpalError::Internal(s1), OpalError::Internal(s2)) => s1 == s2,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for OpalError {
    fn from(e: std::io::Error) -> Self {
        OpalError::Io(Arc::new(e))
    }
}

impl From<reqwest::Error> for OpalError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            OpalError::Timeout(e.to_string())
        } else if e.is_connect() {
            OpalError::Unreachable(e.to_string())
        } else {
            OpalError::HttpClient(e.to_string())
        }
    }
}

impl From<serde_json::Error> for OpalError {
    fn from(e: serde_json::Error) -> Self {
        OpalError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<uuid::Error> for OpalError {
    fn from(e: uuid::Error) -> Self {
        OpalError::Internal(format!("Failed to generate UUID: {e}"))
    }
}

impl From<url::ParseError> for OpalError {
    fn from(e: url::ParseError) -> Self {
        OpalError::Validation(format!("invalid URL: {e}"))
    }
}
