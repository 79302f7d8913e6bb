//! Durable registry of locally installed models.
//!
//! The registry is a JSON file (`registry.json`) in the model directory,
//! mapping model ids to their [`ModelInfo`]. Every mutation rewrites the
//! file atomically: serialize to `registry.json.tmp`, fsync, rename. A crash
//! can therefore only ever leave the previous complete registry behind.

use crate::error::{ErrorCode, LyraError, Result};
use crate::models::types::{DOWNLOAD_TIMESTAMP_KEY, ModelInfo};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Registry filename inside the model directory.
pub const REGISTRY_FILE: &str = "registry.json";

/// Persistent `id → ModelInfo` store for installed models.
pub struct ManifestStore {
    model_dir: PathBuf,
    registry_path: PathBuf,
    entries: BTreeMap<String, ModelInfo>,
}

impl ManifestStore {
    /// Open (or create) the registry under `model_dir`.
    ///
    /// A missing registry file is an empty registry. A file that exists but
    /// cannot be parsed is a storage error: silently dropping a registry
    /// someone else wrote would orphan every installed model.
    ///
    /// # Errors
    ///
    /// Storage errors when the directory cannot be created or the file
    /// cannot be read/parsed.
    pub fn open(model_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(model_dir)
            .map_err(|e| LyraError::from_io(format!("creating {}", model_dir.display()), &e))?;

        let registry_path = model_dir.join(REGISTRY_FILE);
        let entries = if registry_path.exists() {
            let raw = std::fs::read_to_string(&registry_path)
                .map_err(|e| LyraError::from_io(format!("reading {}", registry_path.display()), &e))?;
            serde_json::from_str(&raw).map_err(|e| {
                LyraError::new(
                    ErrorCode::StorageReadError,
                    "model registry file is not valid JSON",
                    format!("parsing {} failed: {e}", registry_path.display()),
                )
                .with_recovery("remove registry.json to rebuild it (installed models are re-registered on download)")
            })?
        } else {
            BTreeMap::new()
        };

        debug!(
            dir = %model_dir.display(),
            entries = entries.len(),
            "manifest store opened"
        );
        Ok(Self {
            model_dir: model_dir.to_path_buf(),
            registry_path,
            entries,
        })
    }

    /// Absolute path where `info`'s weight file lives.
    pub fn model_path(&self, info: &ModelInfo) -> PathBuf {
        self.model_dir.join(info.file_name())
    }

    /// Insert or update an entry and persist the registry.
    ///
    /// The entry must carry a parseable `download_timestamp`; the manifest
    /// only describes models that were actually installed.
    ///
    /// # Errors
    ///
    /// Validation failures or storage errors from the atomic rewrite.
    pub fn insert(&mut self, info: ModelInfo) -> Result<()> {
        info.validate()?;
        if info.download_timestamp().is_none() {
            return Err(LyraError::new(
                ErrorCode::InvalidInputConfiguration,
                format!("manifest entry `{}` is missing its install time", info.id),
                format!(
                    "metadata key `{DOWNLOAD_TIMESTAMP_KEY}` must hold epoch seconds for `{}`",
                    info.id
                ),
            ));
        }
        self.entries.insert(info.id.clone(), info);
        self.persist()
    }

    /// Remove an entry and persist. Returns the removed entry, if any.
    ///
    /// # Errors
    ///
    /// Storage errors from the atomic rewrite.
    pub fn remove(&mut self, id: &str) -> Result<Option<ModelInfo>> {
        let removed = self.entries.remove(id);
        if removed.is_some() {
            self.persist()?;
        }
        Ok(removed)
    }

    /// Look up an entry without touching the filesystem.
    pub fn get(&self, id: &str) -> Option<&ModelInfo> {
        self.entries.get(id)
    }

    /// All entries whose weight files still exist on disk.
    ///
    /// Entries pointing at deleted files are skipped here and dropped for
    /// good on the next persist.
    pub fn list_installed(&self) -> Vec<ModelInfo> {
        self.entries
            .values()
            .filter(|info| {
                let present = self.model_path(info).is_file();
                if !present {
                    warn!(id = %info.id, "registry entry has no file on disk, hiding it");
                }
                present
            })
            .cloned()
            .collect()
    }

    /// Rewrite the registry atomically, pruning entries whose files are gone.
    fn persist(&mut self) -> Result<()> {
        self.entries = std::mem::take(&mut self.entries)
            .into_iter()
            .filter(|(_, info)| self.model_dir.join(info.file_name()).is_file())
            .collect();

        let json = serde_json::to_string_pretty(&self.entries).map_err(|e| {
            LyraError::new(
                ErrorCode::StorageWriteError,
                "model registry could not be serialized",
                format!("serde_json failure while writing registry: {e}"),
            )
        })?;

        let tmp = self.registry_path.with_extension("json.tmp");
        std::fs::write(&tmp, json.as_bytes())
            .map_err(|e| LyraError::from_io(format!("writing {}", tmp.display()), &e))?;
        std::fs::File::open(&tmp)
            .and_then(|f| f.sync_all())
            .map_err(|e| LyraError::from_io(format!("syncing {}", tmp.display()), &e))?;
        std::fs::rename(&tmp, &self.registry_path)
            .map_err(|e| LyraError::from_io(format!("publishing {}", self.registry_path.display()), &e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::expect_err;
    use crate::models::types::{ModelKind, ModelRequirements, ModelVersion};
    use std::collections::BTreeMap;

    fn installed_model(id: &str) -> ModelInfo {
        let mut metadata = BTreeMap::new();
        metadata.insert(DOWNLOAD_TIMESTAMP_KEY.to_owned(), "1734000000".to_owned());
        ModelInfo {
            id: id.to_owned(),
            name: format!("Model {id}"),
            kind: ModelKind::Llm,
            version: ModelVersion::new(1, 0, 0),
            size_bytes: 4,
            download_url: format!("https://models.example/{id}.bin"),
            checksum_sha256: crate::checksum::hash_bytes(id.as_bytes()),
            metadata,
            requirements: ModelRequirements::default(),
        }
    }

    fn touch_model_file(store: &ManifestStore, info: &ModelInfo) {
        std::fs::write(store.model_path(info), b"data").unwrap();
    }

    #[test]
    fn missing_registry_is_an_empty_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = ManifestStore::open(dir.path()).unwrap();
        assert!(store.list_installed().is_empty());
    }

    #[test]
    fn insert_then_reopen_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ManifestStore::open(dir.path()).unwrap();
        let info = installed_model("llm-7b");
        touch_model_file(&store, &info);
        store.insert(info.clone()).unwrap();

        let reopened = ManifestStore::open(dir.path()).unwrap();
        let listed = reopened.list_installed();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0], info);
        assert_eq!(listed[0].download_timestamp(), Some(1_734_000_000));
    }

    #[test]
    fn insert_without_timestamp_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ManifestStore::open(dir.path()).unwrap();
        let mut info = installed_model("no-ts");
        info.metadata.clear();
        assert!(store.insert(info).is_err());
    }

    #[test]
    fn entries_with_missing_files_are_hidden_and_pruned() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ManifestStore::open(dir.path()).unwrap();

        let keep = installed_model("keep");
        let vanish = installed_model("vanish");
        touch_model_file(&store, &keep);
        touch_model_file(&store, &vanish);
        store.insert(keep.clone()).unwrap();
        store.insert(vanish.clone()).unwrap();

        std::fs::remove_file(store.model_path(&vanish)).unwrap();
        let listed = store.list_installed();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "keep");

        // The next write drops the stale entry from the file itself.
        store.insert(keep).unwrap();
        let reopened = ManifestStore::open(dir.path()).unwrap();
        assert!(reopened.get("vanish").is_none());
    }

    #[test]
    fn remove_deletes_entry_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ManifestStore::open(dir.path()).unwrap();
        let info = installed_model("gone-soon");
        touch_model_file(&store, &info);
        store.insert(info.clone()).unwrap();

        let removed = store.remove("gone-soon").unwrap();
        assert_eq!(removed.map(|m| m.id), Some("gone-soon".to_owned()));

        let reopened = ManifestStore::open(dir.path()).unwrap();
        assert!(reopened.get("gone-soon").is_none());
    }

    #[test]
    fn corrupt_registry_is_a_storage_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(REGISTRY_FILE), b"{not json").unwrap();
        let err = expect_err(ManifestStore::open(dir.path()));
        assert_eq!(err.code(), ErrorCode::StorageReadError);
    }

    #[test]
    fn writes_never_leave_a_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = ManifestStore::open(dir.path()).unwrap();
        let info = installed_model("tidy");
        touch_model_file(&store, &info);
        store.insert(info).unwrap();
        assert!(dir.path().join(REGISTRY_FILE).exists());
        assert!(!dir.path().join("registry.json.tmp").exists());
    }
}
