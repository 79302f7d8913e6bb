//! Model discovery, download, and local bookkeeping.
//!
//! The [`ModelManager`] resolves models against a remote HTTPS catalog,
//! fetches them through the resumable downloader, and records installs in
//! the durable manifest. Catalog entries that fail validation (bad version,
//! bad checksum, non-HTTPS URL) are rejected at ingestion and never reach
//! callers.

pub mod types;

use crate::download::{self, DownloadRequest, DownloadSource};
use crate::error::{ErrorCode, LyraError, Result};
use crate::manifest::ManifestStore;
use crate::net::HttpClient;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use types::{DOWNLOAD_TIMESTAMP_KEY, DeviceCapabilities, ModelInfo, ModelKind, filter_models};

/// Where the remote catalog comes from. The production impl fetches JSON
/// over HTTPS; tests substitute a static provider.
pub trait CatalogProvider: Send + Sync {
    /// Fetch the full catalog. Entries are validated by the caller.
    ///
    /// # Errors
    ///
    /// Network errors from the transport.
    fn fetch(&self) -> Result<Vec<ModelInfo>>;
}

/// JSON catalog at a fixed HTTPS endpoint.
pub struct HttpCatalog {
    client: HttpClient,
    url: String,
}

impl HttpCatalog {
    pub fn new(url: impl Into<String>) -> Self {
        Self { client: HttpClient::default(), url: url.into() }
    }
}

impl CatalogProvider for HttpCatalog {
    fn fetch(&self) -> Result<Vec<ModelInfo>> {
        let body = self.client.get(&self.url)?;
        let mut text = String::new();
        use std::io::Read;
        let mut reader = body.reader;
        reader.read_to_string(&mut text).map_err(|e| {
            LyraError::new(
                ErrorCode::NetworkInterrupted,
                "catalog response could not be read",
                format!("reading catalog body from {} failed: {e}", self.url),
            )
            .with_recovery("check connectivity and retry")
        })?;

        // Parse entry by entry so one malformed record (bad version string,
        // missing field) cannot take the whole catalog down with it.
        let raw: Vec<serde_json::Value> = serde_json::from_str(&text).map_err(|e| {
            LyraError::new(
                ErrorCode::NetworkHttpError,
                "model catalog is not valid JSON",
                format!("parsing catalog from {} failed: {e}", self.url),
            )
            .with_recovery("verify the registry URL points at a model catalog")
        })?;
        let mut entries = Vec::with_capacity(raw.len());
        for value in raw {
            match serde_json::from_value::<ModelInfo>(value) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(error = %e, "dropping unparseable catalog entry"),
            }
        }
        Ok(entries)
    }
}

/// Orchestrates catalog lookups, downloads, and the local manifest.
pub struct ModelManager {
    model_dir: PathBuf,
    manifest: Mutex<ManifestStore>,
    catalog: Box<dyn CatalogProvider>,
    source: Box<dyn DownloadSource>,
    // Downloads hit the same disk and pipe; one at a time.
    io_lock: Mutex<()>,
}

impl ModelManager {
    /// Open the manager over `model_dir`, creating it if needed. Bytes come
    /// from the default HTTPS client.
    ///
    /// # Errors
    ///
    /// Storage errors opening the manifest.
    pub fn new(model_dir: &Path, catalog: Box<dyn CatalogProvider>) -> Result<Self> {
        Self::with_source(model_dir, catalog, Box::new(HttpClient::default()))
    }

    /// Open the manager with an explicit byte source (tests substitute an
    /// in-memory one).
    ///
    /// # Errors
    ///
    /// Storage errors opening the manifest.
    pub fn with_source(
        model_dir: &Path,
        catalog: Box<dyn CatalogProvider>,
        source: Box<dyn DownloadSource>,
    ) -> Result<Self> {
        let manifest = ManifestStore::open(model_dir)?;
        Ok(Self {
            model_dir: model_dir.to_path_buf(),
            manifest: Mutex::new(manifest),
            catalog,
            source,
            io_lock: Mutex::new(()),
        })
    }

    /// Fetch the remote catalog, drop invalid entries, and apply the
    /// capability filter.
    ///
    /// # Errors
    ///
    /// Network errors from the catalog fetch.
    pub fn list_available(
        &self,
        kind: Option<ModelKind>,
        device: &DeviceCapabilities,
    ) -> Result<Vec<ModelInfo>> {
        let raw = self.catalog.fetch()?;
        let mut valid = Vec::with_capacity(raw.len());
        for entry in raw {
            match entry.validate() {
                Ok(()) => valid.push(entry),
                Err(e) => warn!(id = %entry.id, error = %e, "dropping invalid catalog entry"),
            }
        }
        Ok(filter_models(valid, kind, device))
    }

    /// Installed models whose files are still present.
    pub fn list_downloaded(&self) -> Vec<ModelInfo> {
        self.manifest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .list_installed()
    }

    /// Resolve `id` in the catalog, download and verify it, and record the
    /// install in the manifest. Already-installed models return immediately
    /// after reporting full progress.
    ///
    /// # Errors
    ///
    /// - [`ErrorCode::ModelIdUnknown`] when the catalog has no such id
    /// - [`ErrorCode::StorageInsufficientSpace`] when the volume is too full
    /// - download errors per [`download::fetch`]
    pub fn download_model(
        &self,
        id: &str,
        progress: Option<&(dyn Fn(f32) + Send + Sync)>,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        if let Some(installed) = self.installed_entry(id) {
            let path = self.model_dir.join(installed.file_name());
            info!(id, path = %path.display(), "model already installed");
            if let Some(cb) = progress {
                cb(1.0);
            }
            return Ok(path);
        }

        let entry = self.resolve_remote(id)?;
        let destination = self.model_dir.join(entry.file_name());
        self.ensure_free_space(&entry)?;

        let request = DownloadRequest {
            url: entry.download_url.clone(),
            destination: destination.clone(),
            expected_size: entry.size_bytes,
            expected_sha256: entry.checksum_sha256.clone(),
        };

        {
            let _io = self.io_lock.lock().unwrap_or_else(|e| e.into_inner());
            info!(id, url = %entry.download_url, "downloading model");
            download::fetch(&request, self.source.as_ref(), progress, cancel)?;
        }

        let mut installed = entry;
        installed.metadata.insert(
            DOWNLOAD_TIMESTAMP_KEY.to_owned(),
            chrono::Utc::now().timestamp().to_string(),
        );
        self.manifest
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(installed)?;

        Ok(destination)
    }

    /// Delete an installed model's file and its manifest entry.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ModelIdUnknown`] when the model is not installed;
    /// storage errors from the delete.
    pub fn delete_model(&self, id: &str) -> Result<()> {
        let mut manifest = self.manifest.lock().unwrap_or_else(|e| e.into_inner());
        let Some(entry) = manifest.get(id).cloned() else {
            return Err(unknown_model(id));
        };
        let path = manifest.model_path(&entry);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| LyraError::from_io(format!("deleting {}", path.display()), &e))?;
        }
        manifest.remove(id)?;
        info!(id, "model deleted");
        Ok(())
    }

    /// Metadata for a model: the installed entry when present, else the
    /// catalog entry.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::ModelIdUnknown`] when neither source knows the id.
    pub fn get_model_info(&self, id: &str) -> Result<ModelInfo> {
        if let Some(entry) = self.installed_entry(id) {
            return Ok(entry);
        }
        self.resolve_remote(id)
    }

    /// Absolute path an installed model occupies (the file may not exist).
    pub fn model_path(&self, info: &ModelInfo) -> PathBuf {
        self.model_dir.join(info.file_name())
    }

    fn installed_entry(&self, id: &str) -> Option<ModelInfo> {
        let manifest = self.manifest.lock().unwrap_or_else(|e| e.into_inner());
        let entry = manifest.get(id)?.clone();
        manifest.model_path(&entry).is_file().then_some(entry)
    }

    fn resolve_remote(&self, id: &str) -> Result<ModelInfo> {
        let catalog = self.catalog.fetch()?;
        catalog
            .into_iter()
            .find(|m| m.id == id)
            .ok_or_else(|| unknown_model(id))
            .and_then(|m| {
                m.validate()?;
                Ok(m)
            })
    }

    fn ensure_free_space(&self, entry: &ModelInfo) -> Result<()> {
        if let Some(free) = types::free_storage_bytes(&self.model_dir)
            && free < entry.size_bytes
        {
            return Err(LyraError::new(
                ErrorCode::StorageInsufficientSpace,
                format!("not enough disk space for model `{}`", entry.id),
                format!(
                    "model needs {} bytes but only {free} bytes are free under {}",
                    entry.size_bytes,
                    self.model_dir.display()
                ),
            )
            .with_recovery("delete unused models or free disk space"));
        }
        Ok(())
    }
}

fn unknown_model(id: &str) -> LyraError {
    LyraError::new(
        ErrorCode::ModelIdUnknown,
        format!("no model with id `{id}` is known"),
        format!("`{id}` was found neither in the local manifest nor the remote catalog"),
    )
    .with_recovery("list available models and pick an existing id")
}
