//! Cold-tier object archive.
//!
//! Archived entry bodies live as JSON objects under
//! `memories/{service_id}/{domain}/{id}.json` beneath the configured root.
//! The core never lists the archive: retrieval is by id only, and the
//! warm-tier stub supplies the scope fields needed to locate the key.
//!
//! The backend is a filesystem directory, which is what S3-compatible
//! deployments mount here; the key layout matches the object-store
//! convention so nothing changes when the mount does.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::error::{Result, StorageError};
use crate::memory::MemoryEntry;
use crate::types::MemoryId;

/// Filesystem-backed cold archive.
#[derive(Debug)]
pub struct ColdStore {
    /// Root directory of the archive.
    root: PathBuf,
}

impl ColdStore {
    /// Opens (and creates if missing) an archive rooted at `root`.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| StorageError::archive(format!("cannot create archive root: {}", e)))?;
        Ok(Self { root })
    }

    /// Returns the object key for an entry, relative to the root.
    pub fn key(service_id: &str, domain: &str, id: MemoryId) -> String {
        format!("memories/{}/{}/{}.json", service_id, domain, id)
    }

    fn object_path(&self, service_id: &str, domain: &str, id: MemoryId) -> PathBuf {
        self.root.join(Self::key(service_id, domain, id))
    }

    /// Writes an entry's full serialization to the archive.
    ///
    /// Writes to a temporary sibling first and renames into place, so a
    /// crash mid-write never leaves a truncated object.
    #[instrument(skip(self, entry), fields(id = %entry.id))]
    pub fn archive(&self, entry: &MemoryEntry) -> Result<()> {
        let path = self.object_path(entry.service_id.as_str(), &entry.domain, entry.id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StorageError::archive(format!("cannot create prefix: {}", e)))?;
        }

        let body = serde_json::to_vec_pretty(&entry.to_json_full())
            .map_err(|e| StorageError::serialization(e.to_string()))?;

        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, &body)
            .map_err(|e| StorageError::archive(format!("write failed: {}", e)))?;
        fs::rename(&tmp, &path)
            .map_err(|e| StorageError::archive(format!("rename failed: {}", e)))?;

        debug!(bytes = body.len(), "Entry archived to cold tier");
        Ok(())
    }

    /// Restores an entry from the archive. Returns `None` if no object
    /// exists under the entry's key.
    #[instrument(skip(self))]
    pub fn restore(&self, service_id: &str, domain: &str, id: MemoryId) -> Result<Option<MemoryEntry>> {
        let path = self.object_path(service_id, domain, id);
        let body = match fs::read(&path) {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::archive(format!("read failed: {}", e)).into()),
        };

        let value: serde_json::Value = serde_json::from_slice(&body)
            .map_err(|e| StorageError::archive(format!("corrupt object: {}", e)))?;
        let entry = MemoryEntry::from_json_full(&value)
            .ok_or_else(|| StorageError::archive("object missing entry record"))?;
        Ok(Some(entry))
    }

    /// Deletes an archived object. Returns `true` if it existed.
    pub fn delete(&self, service_id: &str, domain: &str, id: MemoryId) -> Result<bool> {
        let path = self.object_path(service_id, domain, id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::archive(format!("delete failed: {}", e)).into()),
        }
    }

    /// Returns true if an object exists under the entry's key.
    pub fn contains(&self, service_id: &str, domain: &str, id: MemoryId) -> bool {
        self.object_path(service_id, domain, id).exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryKind;
    use crate::types::{AgentId, ServiceId, Timestamp};
    use tempfile::tempdir;

    fn test_entry() -> MemoryEntry {
        MemoryEntry {
            id: MemoryId::new(),
            service_id: ServiceId::new("svc-a"),
            agent_id: AgentId::new("agent-1"),
            domain: "legal".to_string(),
            kind: MemoryKind::Semantic,
            payload: serde_json::json!({"clause": "liability"}),
            created_at: Timestamp::from_millis(1000),
            version: 2,
            tags: ["contracts".to_string()].into_iter().collect(),
            correlation_id: None,
            session_id: None,
            user_id: None,
            importance: 7.0,
            access_count: 4,
            last_accessed: Timestamp::from_millis(2000),
            expires_at: None,
            embedding: Some(vec![0.25, 0.75]),
            related_ids: Default::default(),
            cause_id: None,
            effect_ids: Default::default(),
            archived: false,
        }
    }

    #[test]
    fn test_key_layout() {
        let id = MemoryId::nil();
        assert_eq!(
            ColdStore::key("svc-a", "legal", id),
            format!("memories/svc-a/legal/{}.json", id)
        );
    }

    #[test]
    fn test_archive_restore_roundtrip() {
        let dir = tempdir().unwrap();
        let cold = ColdStore::open(dir.path()).unwrap();
        let entry = test_entry();

        cold.archive(&entry).unwrap();
        assert!(cold.contains("svc-a", "legal", entry.id));

        let restored = cold.restore("svc-a", "legal", entry.id).unwrap().unwrap();
        assert_eq!(restored.id, entry.id);
        assert_eq!(restored.payload, entry.payload);
        assert_eq!(restored.embedding, entry.embedding);
        assert_eq!(restored.version, entry.version);
    }

    #[test]
    fn test_restore_missing_is_none() {
        let dir = tempdir().unwrap();
        let cold = ColdStore::open(dir.path()).unwrap();
        assert!(cold.restore("svc-a", "legal", MemoryId::new()).unwrap().is_none());
    }

    #[test]
    fn test_delete() {
        let dir = tempdir().unwrap();
        let cold = ColdStore::open(dir.path()).unwrap();
        let entry = test_entry();

        cold.archive(&entry).unwrap();
        assert!(cold.delete("svc-a", "legal", entry.id).unwrap());
        assert!(!cold.delete("svc-a", "legal", entry.id).unwrap());
        assert!(!cold.contains("svc-a", "legal", entry.id));
    }

    #[test]
    fn test_no_truncated_object_left_behind() {
        let dir = tempdir().unwrap();
        let cold = ColdStore::open(dir.path()).unwrap();
        let entry = test_entry();
        cold.archive(&entry).unwrap();

        // The temporary sibling must not survive the rename
        let object_dir = dir.path().join("memories/svc-a/legal");
        let leftovers: Vec<_> = std::fs::read_dir(object_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
