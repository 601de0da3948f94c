//! Lock Manager - Remote lease over conditional writes
//!
//! At most one instance holds the catalog lease at a time. The lease is a
//! small JSON object (`LeaseRecord`) in the remote store:
//! - acquire: create-if-absent, or replace an expired lease on its etag
//! - renew: replace our own lease on its etag
//! - release: delete our own lease on its etag
//!
//! Acquisition fails closed: if the remote cannot be reached, the lease is
//! denied rather than assumed.
//!
//! Owner identities must be unique per running process. A live lease is never
//! reclaimed, not even by its own owner: a lease left behind by a crash
//! blocks everyone (the restarted owner included) until it expires.

use super::models::LeaseRecord;
use crate::remote::{RemoteError, RemoteStore};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// A lease we currently hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub record: LeaseRecord,

    /// Etag of the lease object as we last wrote it
    pub etag: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("Lease held by {holder} until {expires_at}")]
    Held {
        holder: String,
        expires_at: DateTime<Utc>,
    },

    #[error("Lease acquisition lost a race with another instance")]
    Contended,

    #[error("Remote unreachable while acquiring lease: {0}")]
    Unreachable(String),

    #[error("Lease expired or was taken over")]
    Expired,

    #[error("Invalid lease duration: {0}")]
    InvalidTtl(String),

    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),
}

impl LeaseError {
    /// Acquisition was refused (as opposed to a lease we held going away)
    pub fn is_denied(&self) -> bool {
        matches!(
            self,
            LeaseError::Held { .. } | LeaseError::Contended | LeaseError::Unreachable(_)
        )
    }

    pub fn holder(&self) -> Option<&str> {
        match self {
            LeaseError::Held { holder, .. } => Some(holder),
            _ => None,
        }
    }
}

/// Lease operations for one instance against one lease object
pub struct LockManager {
    store: Arc<dyn RemoteStore>,
    key: String,
    owner: String,
    network_timeout: Duration,
}

impl LockManager {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        key: impl Into<String>,
        owner: impl Into<String>,
        network_timeout: Duration,
    ) -> Self {
        Self {
            store,
            key: key.into(),
            owner: owner.into(),
            network_timeout,
        }
    }

    /// Try to take the lease for `ttl`
    pub async fn acquire(&self, ttl: Duration) -> Result<Lease, LeaseError> {
        let record = self.new_record(ttl, Utc::now(), None)?;
        let body = encode_record(&record)?;

        match self
            .bounded(self.store.create_if_absent(&self.key, body.clone()))
            .await
        {
            Ok(etag) => {
                log::debug!("Lease {} acquired by {}", self.key, self.owner);
                return Ok(Lease { record, etag });
            }
            Err(RemoteError::PreconditionFailed(_)) => {}
            Err(e) => return Err(LeaseError::Unreachable(e.to_string())),
        }

        // A lease object exists; only an expired one may be replaced
        let current = match self.bounded(self.store.get(&self.key)).await {
            Ok(Some(obj)) => obj,
            Ok(None) => return Err(LeaseError::Contended),
            Err(e) => return Err(LeaseError::Unreachable(e.to_string())),
        };

        match serde_json::from_slice::<LeaseRecord>(&current.data) {
            Ok(existing) if !existing.is_expired() => {
                return Err(LeaseError::Held {
                    holder: existing.owner,
                    expires_at: existing.expires_at,
                });
            }
            Ok(existing) => {
                log::info!(
                    "Reclaiming lease {} from {} (expired at {})",
                    self.key,
                    existing.owner,
                    existing.expires_at
                );
            }
            Err(e) => {
                log::warn!("Lease object {} unreadable ({}), treating as expired", self.key, e);
            }
        }

        match self
            .bounded(self.store.overwrite_if_match(&self.key, body, &current.etag))
            .await
        {
            Ok(etag) => Ok(Lease { record, etag }),
            Err(RemoteError::PreconditionFailed(_)) | Err(RemoteError::NotFound(_)) => {
                Err(LeaseError::Contended)
            }
            Err(e) => Err(LeaseError::Unreachable(e.to_string())),
        }
    }

    /// Extend a held lease. Fails with `Expired` if it lapsed or was taken over.
    pub async fn renew(&self, lease: &Lease, ttl: Duration) -> Result<Lease, LeaseError> {
        if lease.record.is_expired() {
            return Err(LeaseError::Expired);
        }

        let record = self.new_record(ttl, Utc::now(), Some(lease.record.acquired_at))?;
        let body = encode_record(&record)?;

        match self
            .bounded(self.store.overwrite_if_match(&self.key, body, &lease.etag))
            .await
        {
            Ok(etag) => Ok(Lease { record, etag }),
            Err(RemoteError::PreconditionFailed(_)) | Err(RemoteError::NotFound(_)) => {
                Err(LeaseError::Expired)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Give the lease back. A lease that was already reclaimed is left alone.
    pub async fn release(&self, lease: &Lease) -> Result<(), LeaseError> {
        match self
            .bounded(self.store.delete_if_match(&self.key, &lease.etag))
            .await
        {
            Ok(()) => {
                log::debug!("Lease {} released by {}", self.key, self.owner);
                Ok(())
            }
            Err(RemoteError::PreconditionFailed(_)) | Err(RemoteError::NotFound(_)) => {
                log::debug!("Lease {} no longer ours at release", self.key);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Current lease holder, if any
    pub async fn inspect(&self) -> Result<Option<LeaseRecord>, LeaseError> {
        match self.bounded(self.store.get(&self.key)).await? {
            Some(obj) => Ok(serde_json::from_slice(&obj.data).ok()),
            None => Ok(None),
        }
    }

    fn new_record(
        &self,
        ttl: Duration,
        now: DateTime<Utc>,
        acquired_at: Option<DateTime<Utc>>,
    ) -> Result<LeaseRecord, LeaseError> {
        let ttl = chrono::Duration::from_std(ttl).map_err(|e| LeaseError::InvalidTtl(e.to_string()))?;

        Ok(LeaseRecord {
            owner: self.owner.clone(),
            acquired_at: acquired_at.unwrap_or(now),
            expires_at: now + ttl,
        })
    }

    async fn bounded<T>(
        &self,
        fut: impl Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        tokio::time::timeout(self.network_timeout, fut)
            .await
            .map_err(|_| {
                RemoteError::Network(format!(
                    "lease operation timed out after {:?}",
                    self.network_timeout
                ))
            })?
    }
}

fn encode_record(record: &LeaseRecord) -> Result<Vec<u8>, LeaseError> {
    serde_json::to_vec(record)
        .map_err(|e| LeaseError::Remote(RemoteError::InvalidResponse(e.to_string())))
}
