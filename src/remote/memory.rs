//! In-process remote store
//!
//! Clones share the same objects, so several simulated instances can sync
//! against one `MemoryStore`. `set_offline` injects network failures.

use super::{validate_key, ObjectInfo, RemoteError, RemoteObject, RemoteStore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    etag: String,
}

#[derive(Default)]
struct MemoryInner {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    next_etag: AtomicU64,
    offline: AtomicBool,
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate losing (or regaining) connectivity
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn is_offline(&self) -> bool {
        self.inner.offline.load(Ordering::SeqCst)
    }

    fn check_online(&self) -> Result<(), RemoteError> {
        if self.is_offline() {
            Err(RemoteError::Network("memory store is offline".to_string()))
        } else {
            Ok(())
        }
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, StoredObject>> {
        // Critical sections never panic midway, so a poisoned map is still consistent
        self.inner.objects.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn fresh_etag(&self) -> String {
        let n = self.inner.next_etag.fetch_add(1, Ordering::SeqCst) + 1;
        format!("m{}", n)
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<RemoteObject>, RemoteError> {
        validate_key(key)?;
        self.check_online()?;

        Ok(self.objects().get(key).map(|o| RemoteObject {
            data: o.data.clone(),
            etag: o.etag.clone(),
        }))
    }

    async fn create_if_absent(&self, key: &str, data: Vec<u8>) -> Result<String, RemoteError> {
        validate_key(key)?;
        self.check_online()?;

        let mut objects = self.objects();
        if objects.contains_key(key) {
            return Err(RemoteError::PreconditionFailed(key.to_string()));
        }

        let etag = self.fresh_etag();
        objects.insert(key.to_string(), StoredObject { data, etag: etag.clone() });
        Ok(etag)
    }

    async fn overwrite_if_match(
        &self,
        key: &str,
        data: Vec<u8>,
        etag: &str,
    ) -> Result<String, RemoteError> {
        validate_key(key)?;
        self.check_online()?;

        let mut objects = self.objects();
        match objects.get(key) {
            Some(current) if current.etag == etag => {}
            _ => return Err(RemoteError::PreconditionFailed(key.to_string())),
        }

        let new_etag = self.fresh_etag();
        objects.insert(key.to_string(), StoredObject { data, etag: new_etag.clone() });
        Ok(new_etag)
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<String, RemoteError> {
        validate_key(key)?;
        self.check_online()?;

        let etag = self.fresh_etag();
        self.objects()
            .insert(key.to_string(), StoredObject { data, etag: etag.clone() });
        Ok(etag)
    }

    async fn delete_if_match(&self, key: &str, etag: &str) -> Result<(), RemoteError> {
        validate_key(key)?;
        self.check_online()?;

        let mut objects = self.objects();
        match objects.get(key) {
            Some(current) if current.etag == etag => {
                objects.remove(key);
                Ok(())
            }
            Some(_) => Err(RemoteError::PreconditionFailed(key.to_string())),
            None => Err(RemoteError::NotFound(key.to_string())),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        validate_key(key)?;
        self.check_online()?;

        self.objects().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, RemoteError> {
        self.check_online()?;

        Ok(self
            .objects()
            .iter()
            .filter(|(key, _)| key.starts_with(prefix))
            .map(|(key, o)| ObjectInfo {
                key: key.clone(),
                size: o.data.len() as u64,
                etag: o.etag.clone(),
            })
            .collect())
    }
}
