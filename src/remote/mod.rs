//! Remote Object Store - Shared synchronization medium
//!
//! Every instance talks to the shared catalog copy through `RemoteStore`.
//! The lease protocol relies on two conditional primitives:
//! - `create_if_absent`: atomic create, fails if a live object exists
//! - `overwrite_if_match` / `delete_if_match`: compare-and-swap on the etag
//!
//! Backends:
//! - `MemoryStore`: in-process, shared between simulated instances (tests)
//! - `FsStore`: shared directory, CAS emulated with versioned object names
//! - `HttpStore`: HTTP object store with `If-None-Match` / `If-Match`

mod fs;
mod http;
mod memory;

pub use fs::FsStore;
pub use http::HttpStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Object body plus the etag it was read at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub data: Vec<u8>,
    pub etag: String,
}

/// Listing entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub etag: String,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read an object; `None` when absent
    async fn get(&self, key: &str) -> Result<Option<RemoteObject>, RemoteError>;

    /// Create an object only if none exists. Returns the new etag.
    async fn create_if_absent(&self, key: &str, data: Vec<u8>) -> Result<String, RemoteError>;

    /// Replace an object only if its current etag matches. Returns the new etag.
    async fn overwrite_if_match(
        &self,
        key: &str,
        data: Vec<u8>,
        etag: &str,
    ) -> Result<String, RemoteError>;

    /// Unconditional write. Returns the new etag.
    async fn put(&self, key: &str, data: Vec<u8>) -> Result<String, RemoteError>;

    /// Delete an object only if its current etag matches
    async fn delete_if_match(&self, key: &str, etag: &str) -> Result<(), RemoteError>;

    /// Unconditional delete; deleting an absent object is not an error
    async fn delete(&self, key: &str) -> Result<(), RemoteError>;

    /// List live objects whose key starts with `prefix`, sorted by key
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, RemoteError>;
}

/// Remote store errors
#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    #[error("Remote store unreachable: {0}")]
    Network(String),

    #[error("Precondition failed for {0}")]
    PreconditionFailed(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid response from remote store: {0}")]
    InvalidResponse(String),
}

impl RemoteError {
    /// Whether the error means the store could not be reached at all
    pub fn is_network(&self) -> bool {
        matches!(self, RemoteError::Network(_))
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() || e.is_request() {
            RemoteError::Network(e.to_string())
        } else {
            RemoteError::InvalidResponse(e.to_string())
        }
    }
}

/// Keys are relative, slash-separated, and never escape the store root
pub(crate) fn validate_key(key: &str) -> Result<(), RemoteError> {
    let bad = key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..");

    if bad {
        Err(RemoteError::InvalidKey(key.to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("catalog/lease.json").is_ok());
        assert!(validate_key("catalog/backups/catalog-1.json.gz").is_ok());

        assert!(validate_key("").is_err());
        assert!(validate_key("/abs").is_err());
        assert!(validate_key("catalog/../etc").is_err());
        assert!(validate_key("catalog//x").is_err());
    }

    #[test]
    fn test_network_classification() {
        assert!(RemoteError::Network("down".into()).is_network());
        assert!(!RemoteError::PreconditionFailed("k".into()).is_network());
    }
}
