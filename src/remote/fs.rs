//! Shared-directory remote store
//!
//! A plain directory (NFS/SMB mount, synced volume) has atomic exclusive
//! create but no atomic compare-and-swap on overwrite. Writes are therefore
//! emulated with versioned object names: every write of `<key>` publishes a
//! new immutable file `<key>.g<generation>` via `hard_link`, which fails if
//! that generation already exists. The highest generation is the live value
//! and its number is the etag, so two writers racing from the same etag can
//! never both succeed.
//!
//! Each generation file starts with one marker byte: `D` (data) or `X`
//! (tombstone left by a delete).

use super::{validate_key, ObjectInfo, RemoteError, RemoteObject, RemoteStore};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

const DATA_MARKER: u8 = b'D';
const TOMBSTONE_MARKER: u8 = b'X';
const GENERATION_SEPARATOR: &str = ".g";
/// Superseded generations kept around for slow readers
const KEEP_GENERATIONS: u64 = 3;
const READ_ATTEMPTS: usize = 3;
const WRITE_ATTEMPTS: usize = 8;
const TMP_DIR: &str = ".tmp";

pub struct FsStore {
    root: PathBuf,
}

/// Latest generation of one logical object
struct Generation {
    number: u64,
    path: PathBuf,
}

impl FsStore {
    /// Open a store rooted at an existing (or creatable) directory
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, RemoteError> {
        let root = root.into();
        std::fs::create_dir_all(root.join(TMP_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A vanished root means the shared mount is gone
    async fn check_root(&self) -> Result<(), RemoteError> {
        match tokio::fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(RemoteError::Network(format!(
                "{} is not a directory",
                self.root.display()
            ))),
            Err(e) => Err(RemoteError::Network(format!(
                "shared directory {} unavailable: {}",
                self.root.display(),
                e
            ))),
        }
    }

    fn split_key(&self, key: &str) -> (PathBuf, String) {
        match key.rsplit_once('/') {
            Some((dir, name)) => (self.root.join(dir), name.to_string()),
            None => (self.root.clone(), key.to_string()),
        }
    }

    /// All generations per logical name in `dir`
    async fn scan(&self, dir: &Path) -> Result<BTreeMap<String, Vec<u64>>, RemoteError> {
        let mut names: BTreeMap<String, Vec<u64>> = BTreeMap::new();

        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if let Some((name, number)) = parse_generation(&file_name) {
                names.entry(name.to_string()).or_default().push(number);
            }
        }

        for generations in names.values_mut() {
            generations.sort_unstable();
        }
        Ok(names)
    }

    async fn latest(&self, dir: &Path, name: &str) -> Result<Option<Generation>, RemoteError> {
        let scanned = self.scan(dir).await?;
        Ok(scanned
            .get(name)
            .and_then(|g| g.last().copied())
            .map(|number| Generation {
                number,
                path: dir.join(generation_file(name, number)),
            }))
    }

    /// Latest generation and its body; `None` body for tombstones
    async fn read_latest(
        &self,
        dir: &Path,
        name: &str,
    ) -> Result<Option<(u64, Option<Vec<u8>>)>, RemoteError> {
        for _ in 0..READ_ATTEMPTS {
            let Some(generation) = self.latest(dir, name).await? else {
                return Ok(None);
            };

            match tokio::fs::read(&generation.path).await {
                Ok(raw) => return Ok(Some((generation.number, decode_body(&raw)))),
                // Pruned between scan and read; rescan
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(RemoteError::InvalidResponse(format!(
            "{}/{} kept changing while being read",
            dir.display(),
            name
        )))
    }

    /// Atomically publish generation `number`; `false` if it already exists
    async fn publish(
        &self,
        dir: &Path,
        name: &str,
        number: u64,
        body: &[u8],
    ) -> Result<bool, RemoteError> {
        tokio::fs::create_dir_all(dir).await?;

        let tmp = self
            .root
            .join(TMP_DIR)
            .join(format!("{}.tmp", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, body).await?;

        let target = dir.join(generation_file(name, number));
        let linked = tokio::fs::hard_link(&tmp, &target).await;
        let _ = tokio::fs::remove_file(&tmp).await;

        match linked {
            Ok(()) => {
                self.prune(dir, name, number).await;
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn prune(&self, dir: &Path, name: &str, newest: u64) {
        let Ok(scanned) = self.scan(dir).await else {
            return;
        };

        if let Some(generations) = scanned.get(name) {
            for number in generations {
                if *number + KEEP_GENERATIONS < newest {
                    let path = dir.join(generation_file(name, *number));
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        log::debug!("Failed to prune {}: {}", path.display(), e);
                    }
                }
            }
        }
    }

    /// Write a new generation on top of `expected` (the etag), or fail
    async fn conditional_write(
        &self,
        key: &str,
        expected: Expected<'_>,
        body: Vec<u8>,
    ) -> Result<String, RemoteError> {
        validate_key(key)?;
        self.check_root().await?;
        let (dir, name) = self.split_key(key);

        let current = self.read_latest(&dir, &name).await?;
        let next = match (&expected, &current) {
            (Expected::Absent, None) => 1,
            (Expected::Absent, Some((number, None))) => number + 1,
            (Expected::Etag(etag), Some((number, Some(_)))) if number.to_string() == *etag => {
                number + 1
            }
            _ => return Err(RemoteError::PreconditionFailed(key.to_string())),
        };

        if self.publish(&dir, &name, next, &body).await? {
            Ok(next.to_string())
        } else {
            Err(RemoteError::PreconditionFailed(key.to_string()))
        }
    }

    /// Write a new generation on top of whatever is current
    async fn unconditional_write(&self, key: &str, body: Vec<u8>) -> Result<String, RemoteError> {
        validate_key(key)?;
        self.check_root().await?;
        let (dir, name) = self.split_key(key);

        for _ in 0..WRITE_ATTEMPTS {
            let next = self
                .latest(&dir, &name)
                .await?
                .map(|g| g.number + 1)
                .unwrap_or(1);

            if self.publish(&dir, &name, next, &body).await? {
                return Ok(next.to_string());
            }
        }

        Err(RemoteError::PreconditionFailed(key.to_string()))
    }
}

enum Expected<'a> {
    Absent,
    Etag(&'a str),
}

fn generation_file(name: &str, number: u64) -> String {
    format!("{}{}{:020}", name, GENERATION_SEPARATOR, number)
}

fn parse_generation(file_name: &str) -> Option<(&str, u64)> {
    let (name, number) = file_name.rsplit_once(GENERATION_SEPARATOR)?;
    if number.len() != 20 {
        return None;
    }
    number.parse().ok().map(|n| (name, n))
}

fn encode_body(marker: u8, data: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(data.len() + 1);
    body.push(marker);
    body.extend_from_slice(data);
    body
}

fn decode_body(raw: &[u8]) -> Option<Vec<u8>> {
    match raw.split_first() {
        Some((&DATA_MARKER, data)) => Some(data.to_vec()),
        _ => None,
    }
}

#[async_trait]
impl RemoteStore for FsStore {
    async fn get(&self, key: &str) -> Result<Option<RemoteObject>, RemoteError> {
        validate_key(key)?;
        self.check_root().await?;
        let (dir, name) = self.split_key(key);

        Ok(match self.read_latest(&dir, &name).await? {
            Some((number, Some(data))) => Some(RemoteObject {
                data,
                etag: number.to_string(),
            }),
            _ => None,
        })
    }

    async fn create_if_absent(&self, key: &str, data: Vec<u8>) -> Result<String, RemoteError> {
        self.conditional_write(key, Expected::Absent, encode_body(DATA_MARKER, &data))
            .await
    }

    async fn overwrite_if_match(
        &self,
        key: &str,
        data: Vec<u8>,
        etag: &str,
    ) -> Result<String, RemoteError> {
        self.conditional_write(key, Expected::Etag(etag), encode_body(DATA_MARKER, &data))
            .await
    }

    async fn put(&self, key: &str, data: Vec<u8>) -> Result<String, RemoteError> {
        self.unconditional_write(key, encode_body(DATA_MARKER, &data))
            .await
    }

    async fn delete_if_match(&self, key: &str, etag: &str) -> Result<(), RemoteError> {
        match self
            .conditional_write(key, Expected::Etag(etag), vec![TOMBSTONE_MARKER])
            .await
        {
            Ok(_) => Ok(()),
            Err(RemoteError::PreconditionFailed(k)) => {
                // Distinguish "gone" from "changed"
                if self.get(key).await?.is_none() {
                    Err(RemoteError::NotFound(k))
                } else {
                    Err(RemoteError::PreconditionFailed(k))
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), RemoteError> {
        if self.get(key).await?.is_none() {
            return Ok(());
        }
        self.unconditional_write(key, vec![TOMBSTONE_MARKER])
            .await
            .map(|_| ())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, RemoteError> {
        self.check_root().await?;

        // Only the directory named by the prefix is listed (no recursion)
        let (dir_key, name_prefix) = match prefix.rsplit_once('/') {
            Some((dir, rest)) => (Some(dir), rest),
            None => (None, prefix),
        };
        let dir = match dir_key {
            Some(d) => {
                validate_key(d)?;
                self.root.join(d)
            }
            None => self.root.clone(),
        };

        let mut listed = Vec::new();
        for (name, generations) in self.scan(&dir).await? {
            if !name.starts_with(name_prefix) {
                continue;
            }
            let Some(&number) = generations.last() else {
                continue;
            };

            let path = dir.join(generation_file(&name, number));
            let raw = match tokio::fs::read(&path).await {
                Ok(raw) => raw,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            if let Some(data) = decode_body(&raw) {
                let key = match dir_key {
                    Some(d) => format!("{}/{}", d, name),
                    None => name,
                };
                listed.push(ObjectInfo {
                    key,
                    size: data.len() as u64,
                    etag: number.to_string(),
                });
            }
        }

        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_store() -> (FsStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = FsStore::new(temp_dir.path().join("shared")).unwrap();
        (store, temp_dir)
    }

    #[test]
    fn test_generation_file_names() {
        let file = generation_file("lease.json", 7);
        assert_eq!(parse_generation(&file), Some(("lease.json", 7)));
        assert_eq!(parse_generation("lease.json"), None);
        assert_eq!(parse_generation("x.g12"), None);
    }

    #[tokio::test]
    async fn test_create_if_absent_then_precondition() {
        let (store, _temp) = create_store();

        let etag = store.create_if_absent("cat/lease.json", b"a".to_vec()).await.unwrap();
        assert_eq!(etag, "1");

        let again = store.create_if_absent("cat/lease.json", b"b".to_vec()).await;
        assert!(matches!(again, Err(RemoteError::PreconditionFailed(_))));

        let obj = store.get("cat/lease.json").await.unwrap().unwrap();
        assert_eq!(obj.data, b"a");
    }

    #[tokio::test]
    async fn test_compare_and_swap_emulation() {
        let (store, _temp) = create_store();

        let etag = store.put("cat/catalog.json.gz", b"v1".to_vec()).await.unwrap();
        let new_etag = store
            .overwrite_if_match("cat/catalog.json.gz", b"v2".to_vec(), &etag)
            .await
            .unwrap();

        // A second writer still holding the old etag must lose
        let stale = store
            .overwrite_if_match("cat/catalog.json.gz", b"v3".to_vec(), &etag)
            .await;
        assert!(matches!(stale, Err(RemoteError::PreconditionFailed(_))));

        let obj = store.get("cat/catalog.json.gz").await.unwrap().unwrap();
        assert_eq!(obj.data, b"v2");
        assert_eq!(obj.etag, new_etag);
    }

    #[tokio::test]
    async fn test_delete_leaves_tombstone_and_allows_recreate() {
        let (store, _temp) = create_store();

        let etag = store.create_if_absent("cat/lease.json", b"a".to_vec()).await.unwrap();
        store.delete_if_match("cat/lease.json", &etag).await.unwrap();
        assert!(store.get("cat/lease.json").await.unwrap().is_none());

        let recreated = store.create_if_absent("cat/lease.json", b"b".to_vec()).await.unwrap();
        assert_eq!(recreated, "3");
    }

    #[tokio::test]
    async fn test_old_generations_are_pruned() {
        let (store, _temp) = create_store();

        for i in 0..10u8 {
            store.put("cat/obj", vec![i]).await.unwrap();
        }

        let scanned = store.scan(&store.root().join("cat")).await.unwrap();
        let generations = scanned.get("obj").unwrap();
        assert!(generations.len() as u64 <= KEEP_GENERATIONS + 1);
        assert_eq!(*generations.last().unwrap(), 10);
    }

    #[tokio::test]
    async fn test_list_skips_tombstones() {
        let (store, _temp) = create_store();

        store.put("cat/backups/catalog-1.json.gz", b"1".to_vec()).await.unwrap();
        store.put("cat/backups/catalog-2.json.gz", b"2".to_vec()).await.unwrap();
        store.delete("cat/backups/catalog-1.json.gz").await.unwrap();

        let listed = store.list("cat/backups/catalog-").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "cat/backups/catalog-2.json.gz");
    }

    #[tokio::test]
    async fn test_missing_root_is_network_failure() {
        let (store, temp) = create_store();
        drop(temp);

        let err = store.get("cat/lease.json").await.unwrap_err();
        assert!(err.is_network());
    }
}
