//! Model metadata: catalog entries, versions, device capabilities, and the
//! capability filter applied to catalog listings.

use crate::checksum;
use crate::error::{ErrorCode, LyraError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Metadata key carrying the install time (epoch seconds) of a local model.
pub const DOWNLOAD_TIMESTAMP_KEY: &str = "download_timestamp";

/// Metadata key overriding the on-disk filename for an installed model.
pub const FILENAME_KEY: &str = "filename";

/// Platform tag that matches every device.
pub const PLATFORM_WILDCARD: &str = "all";

/// The three model families the runtime hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Llm,
    Stt,
    Tts,
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Llm => "llm",
            Self::Stt => "stt",
            Self::Tts => "tts",
        };
        f.write_str(name)
    }
}

/// Restricted semantic version: `MAJOR.MINOR.PATCH`, decimal integers, no
/// leading zeros. Anything else is rejected at ingestion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ModelVersion {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl ModelVersion {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }
}

impl fmt::Display for ModelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

impl FromStr for ModelVersion {
    type Err = LyraError;

    fn from_str(s: &str) -> Result<Self> {
        let reject = |why: &str| {
            Err(LyraError::new(
                ErrorCode::InvalidInputParameterValue,
                format!("invalid model version `{s}`"),
                format!("version `{s}` rejected: {why}"),
            )
            .with_recovery("use MAJOR.MINOR.PATCH with plain decimal integers"))
        };

        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 3 {
            return reject("expected exactly three dot-separated components");
        }
        let mut values = [0u32; 3];
        for (i, part) in parts.iter().enumerate() {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return reject("components must be non-empty decimal integers");
            }
            if part.len() > 1 && part.starts_with('0') {
                return reject("leading zeros are not allowed");
            }
            match part.parse::<u32>() {
                Ok(v) => values[i] = v,
                Err(_) => return reject("component does not fit in 32 bits"),
            }
        }
        Ok(Self::new(values[0], values[1], values[2]))
    }
}

impl Serialize for ModelVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ModelVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(|e: LyraError| serde::de::Error::custom(e.details().to_owned()))
    }
}

/// Minimum device requirements declared by a catalog entry.
///
/// Zero means "no requirement"; an empty platform list means the model runs
/// everywhere.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelRequirements {
    pub min_ram_bytes: u64,
    pub min_storage_bytes: u64,
    pub supported_platforms: Vec<String>,
}

impl ModelRequirements {
    /// Whether `platform` satisfies the platform list (empty list and the
    /// `"all"` wildcard are universal). Tags compare case-insensitively.
    pub fn supports_platform(&self, platform: &str) -> bool {
        if self.supported_platforms.is_empty() {
            return true;
        }
        self.supported_platforms
            .iter()
            .any(|p| p.eq_ignore_ascii_case(platform) || p.eq_ignore_ascii_case(PLATFORM_WILDCARD))
    }
}

/// One model as described by the catalog or the local manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Stable identifier, unique within the catalog.
    pub id: String,
    /// Human-readable display name.
    pub name: String,
    /// Model family.
    #[serde(rename = "type")]
    pub kind: ModelKind,
    /// Restricted semver.
    pub version: ModelVersion,
    /// Size of the weight file in bytes.
    pub size_bytes: u64,
    /// HTTPS source for the weight file.
    pub download_url: String,
    /// Lowercase SHA-256 hex digest of the weight file.
    pub checksum_sha256: String,
    /// Free-form string metadata (`download_timestamp` for installed entries).
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Minimum device requirements.
    #[serde(default)]
    pub requirements: ModelRequirements,
}

impl ModelInfo {
    /// Reject entries that could never be installed: empty ids, malformed
    /// checksums, non-HTTPS sources, zero sizes.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::InvalidInputConfiguration`] with the offending field named.
    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, why: String| {
            Err(LyraError::new(
                ErrorCode::InvalidInputConfiguration,
                format!("model entry `{}` has an invalid `{field}`", self.id),
                format!("catalog entry `{}`: {why}", self.id),
            )
            .with_recovery("fix the catalog entry before publishing it"))
        };

        if self.id.trim().is_empty() {
            return invalid("id", "identifier is empty".to_owned());
        }
        if self.name.trim().is_empty() {
            return invalid("name", "display name is empty".to_owned());
        }
        if self.size_bytes == 0 {
            return invalid("size_bytes", "declared size is zero".to_owned());
        }
        if !checksum::is_valid_digest(&self.checksum_sha256) {
            return invalid(
                "checksum_sha256",
                format!("`{}` is not a lowercase sha256 hex digest", self.checksum_sha256),
            );
        }
        crate::net::validate_https(&self.download_url)?;
        Ok(())
    }

    /// Install time recorded at download, if this entry is installed.
    pub fn download_timestamp(&self) -> Option<i64> {
        self.metadata
            .get(DOWNLOAD_TIMESTAMP_KEY)
            .and_then(|v| v.parse().ok())
    }

    /// On-disk filename: explicit `filename` metadata, else the id with
    /// path separators flattened.
    pub fn file_name(&self) -> String {
        if let Some(name) = self.metadata.get(FILENAME_KEY) {
            return name.clone();
        }
        self.id
            .chars()
            .map(|c| if c == '/' || c == '\\' || c == ':' { '_' } else { c })
            .collect()
    }
}

/// Snapshot of the host taken at startup; consumed only by filtering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceCapabilities {
    /// Total RAM in bytes (0 = unknown).
    pub ram_bytes: u64,
    /// Free bytes on the model volume (0 = unknown).
    pub storage_bytes: u64,
    /// Platform tag (`linux`, `macos`, ...).
    pub platform: String,
    /// Accelerator tags, informational only.
    pub accelerators: Vec<String>,
}

impl DeviceCapabilities {
    /// Probe the host. `storage_probe` is the directory whose volume will
    /// hold model files. Unknown values are reported as 0 so filtering
    /// skips the corresponding rule rather than excluding everything.
    pub fn detect(storage_probe: &Path) -> Self {
        Self {
            ram_bytes: crate::memory::host::total_ram_bytes().unwrap_or(0),
            storage_bytes: free_storage_bytes(storage_probe).unwrap_or(0),
            platform: std::env::consts::OS.to_owned(),
            accelerators: Vec::new(),
        }
    }
}

/// Free bytes on the volume containing `path`, via `statvfs`.
#[cfg(unix)]
pub fn free_storage_bytes(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) };
    if rc != 0 {
        return None;
    }
    Some((stats.f_bavail as u64).saturating_mul(stats.f_frsize as u64))
}

#[cfg(not(unix))]
pub fn free_storage_bytes(_path: &Path) -> Option<u64> {
    None
}

/// Apply the capability filter to a catalog listing.
///
/// Pure over `(models, kind, device)` and idempotent: filtering a filtered
/// list changes nothing. Rules, in order:
///
/// 1. a kind filter excludes other kinds
/// 2. a non-empty platform list without the device's platform (or `"all"`) excludes
/// 3. a RAM requirement above known device RAM excludes
/// 4. a storage requirement above known free storage excludes
pub fn filter_models(
    models: Vec<ModelInfo>,
    kind: Option<ModelKind>,
    device: &DeviceCapabilities,
) -> Vec<ModelInfo> {
    models
        .into_iter()
        .filter(|m| {
            if let Some(k) = kind
                && m.kind != k
            {
                return false;
            }
            if !m.requirements.supports_platform(&device.platform) {
                return false;
            }
            if m.requirements.min_ram_bytes > 0
                && device.ram_bytes > 0
                && m.requirements.min_ram_bytes > device.ram_bytes
            {
                return false;
            }
            if m.requirements.min_storage_bytes > 0
                && device.storage_bytes > 0
                && m.requirements.min_storage_bytes > device.storage_bytes
            {
                return false;
            }
            true
        })
        .collect()
}
