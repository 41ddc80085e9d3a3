//! Durable filesystem backend

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use memento_hash::HashValue;

use crate::{CheckpointRecord, Error, Result, Storage};

/// Durable backend addressing each entry by a path derived from
/// `(fn_key, call_hash)`.
///
/// Layout: `root/<fn_key>/<call_hash>.json` — one container directory per
/// identity and one record file per call. Bulk invalidation of a callable is
/// removing its container directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    /// Create a store rooted at the given directory
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create a store at the default location.
    ///
    /// Resolution order (first creatable wins):
    /// 1) `MEMENTO_CACHE_DIR` (explicit override)
    /// 2) OS cache dir `memento/checkpoints`
    /// 3) `~/.memento/checkpoints`
    /// 4) `TMPDIR/memento/checkpoints` (fallback)
    pub fn new_default() -> Result<Self> {
        let mut candidates: Vec<PathBuf> = Vec::new();
        if let Some(dir) = std::env::var_os("MEMENTO_CACHE_DIR").filter(|s| !s.is_empty()) {
            candidates.push(PathBuf::from(dir));
        }
        if let Some(cache) = dirs::cache_dir() {
            candidates.push(cache.join("memento/checkpoints"));
        }
        if let Some(home) = dirs::home_dir() {
            candidates.push(home.join(".memento/checkpoints"));
        }
        candidates.push(std::env::temp_dir().join("memento/checkpoints"));

        for path in candidates {
            if fs::create_dir_all(&path).is_ok() {
                tracing::debug!(root = %path.display(), "using checkpoint directory");
                return Ok(Self::new(path));
            }
            // Permission denied or read-only parent - try next candidate
        }
        Err(Error::configuration(
            "Failed to determine a writable checkpoint directory",
        ))
    }

    /// Root directory of the store
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn container_dir(&self, fn_key: &str) -> PathBuf {
        self.root.join(fn_key)
    }

    fn record_path(&self, fn_key: &str, call_hash: &HashValue) -> PathBuf {
        self.container_dir(fn_key)
            .join(format!("{}.json", call_hash.as_hex()))
    }

    fn read_record(&self, fn_key: &str, call_hash: &HashValue) -> Result<CheckpointRecord> {
        let path = self.record_path(fn_key, call_hash);
        let content = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::not_found(fn_key, call_hash)
            } else {
                Error::io(e, &path, "read")
            }
        })?;
        serde_json::from_str(&content).map_err(|e| {
            Error::serialization(format!("corrupt record at {}: {e}", path.display()))
        })
    }
}

impl Storage for FileStorage {
    fn exists(&self, fn_key: &str, call_hash: &HashValue) -> Result<bool> {
        Ok(self.record_path(fn_key, call_hash).exists())
    }

    fn checkpoint_date(&self, fn_key: &str, call_hash: &HashValue) -> Result<DateTime<Utc>> {
        Ok(self.read_record(fn_key, call_hash)?.created_at)
    }

    fn load(&self, fn_key: &str, call_hash: &HashValue) -> Result<serde_json::Value> {
        Ok(self.read_record(fn_key, call_hash)?.payload)
    }

    fn store(
        &self,
        fn_key: &str,
        call_hash: &HashValue,
        record: CheckpointRecord,
    ) -> Result<serde_json::Value> {
        let path = self.record_path(fn_key, call_hash);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::io(e, parent, "create_dir_all"))?;
        }

        let json = serde_json::to_vec_pretty(&record)
            .map_err(|e| Error::serialization(format!("failed to serialize record: {e}")))?;

        // Write via temp file + rename so readers never observe a torn record
        let tmp_path = path.with_extension("json.tmp");
        let mut file =
            fs::File::create(&tmp_path).map_err(|e| Error::io(e, &tmp_path, "create"))?;
        file.write_all(&json)
            .map_err(|e| Error::io(e, &tmp_path, "write"))?;
        file.sync_all()
            .map_err(|e| Error::io(e, &tmp_path, "sync"))?;
        drop(file);
        fs::rename(&tmp_path, &path).map_err(|e| Error::io(e, &path, "rename"))?;

        // Echo the round-tripped payload, not the caller's copy
        let stored: CheckpointRecord = serde_json::from_slice(&json)
            .map_err(|e| Error::serialization(format!("failed to re-read record: {e}")))?;
        Ok(stored.payload)
    }

    fn delete(&self, fn_key: &str, call_hash: &HashValue) -> Result<()> {
        let path = self.record_path(fn_key, call_hash);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, &path, "remove_file")),
        }
    }

    fn clear(&self, fn_key: &str) -> Result<()> {
        let dir = self.container_dir(fn_key);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {
                tracing::debug!(container = fn_key, "cleared checkpoint container");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::io(e, &dir, "remove_dir_all")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn hash(tag: &str) -> HashValue {
        memento_hash::hash_value(&memento_hash::Value::Str(tag.into())).unwrap()
    }

    #[test]
    fn store_creates_one_record_per_call() {
        let tmp = TempDir::new().unwrap();
        let store = FileStorage::new(tmp.path());
        let call = hash("call");

        store
            .store(
                "demo/f/abc",
                &call,
                CheckpointRecord::new(serde_json::json!({"n": 16})),
            )
            .unwrap();

        let expected = tmp
            .path()
            .join("demo/f/abc")
            .join(format!("{}.json", call.as_hex()));
        assert!(expected.exists());
        assert_eq!(
            store.load("demo/f/abc", &call).unwrap(),
            serde_json::json!({"n": 16})
        );
    }

    #[test]
    fn round_trip_through_full_serialize_cycle() {
        let tmp = TempDir::new().unwrap();
        let store = FileStorage::new(tmp.path());
        let call = hash("call");
        let payload = serde_json::json!({"list": [1, 2, 3], "text": "résultat"});

        let echoed = store
            .store("demo/f/abc", &call, CheckpointRecord::new(payload.clone()))
            .unwrap();
        assert_eq!(echoed, payload);

        // A fresh handle sees the same payload after deserialization from disk
        let reopened = FileStorage::new(tmp.path());
        assert_eq!(reopened.load("demo/f/abc", &call).unwrap(), payload);
    }

    #[test]
    fn load_absent_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let store = FileStorage::new(tmp.path());
        let err = store.load("demo/f/abc", &hash("missing")).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn corrupt_record_is_a_serialization_error() {
        let tmp = TempDir::new().unwrap();
        let store = FileStorage::new(tmp.path());
        let call = hash("call");
        store
            .store("demo/f/abc", &call, CheckpointRecord::new(serde_json::json!(1)))
            .unwrap();

        let path = store.record_path("demo/f/abc", &call);
        fs::write(&path, b"{ not json").unwrap();

        let err = store.load("demo/f/abc", &call).unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
    }

    #[test]
    fn delete_and_clear_are_noops_when_absent() {
        let tmp = TempDir::new().unwrap();
        let store = FileStorage::new(tmp.path());
        store.delete("demo/f/abc", &hash("missing")).unwrap();
        store.clear("demo/f/abc").unwrap();
    }

    #[test]
    fn clear_removes_the_whole_container() {
        let tmp = TempDir::new().unwrap();
        let store = FileStorage::new(tmp.path());
        let a = hash("a");
        let b = hash("b");
        store
            .store("demo/f/abc", &a, CheckpointRecord::new(serde_json::json!(1)))
            .unwrap();
        store
            .store("demo/f/abc", &b, CheckpointRecord::new(serde_json::json!(2)))
            .unwrap();

        store.clear("demo/f/abc").unwrap();
        assert!(!store.exists("demo/f/abc", &a).unwrap());
        assert!(!store.exists("demo/f/abc", &b).unwrap());
    }

    #[test]
    fn overwrite_replaces_payload_and_timestamp() {
        let tmp = TempDir::new().unwrap();
        let store = FileStorage::new(tmp.path());
        let call = hash("call");
        store
            .store("demo/f/abc", &call, CheckpointRecord::new(serde_json::json!(1)))
            .unwrap();
        let first = store.checkpoint_date("demo/f/abc", &call).unwrap();

        store
            .store("demo/f/abc", &call, CheckpointRecord::new(serde_json::json!(2)))
            .unwrap();
        assert_eq!(store.load("demo/f/abc", &call).unwrap(), serde_json::json!(2));
        assert!(store.checkpoint_date("demo/f/abc", &call).unwrap() >= first);
    }
}
