//! Resumable, checksum-verified file downloads.
//!
//! Bytes stream into `<destination>.tmp`; the destination is only touched by
//! the final atomic rename after the SHA-256 digest matches. Interrupted
//! transfers resume from the temp file's current size via a Range request.
//! Transient failures are retried with exponential backoff. Every exit path
//! either renames the temp file or removes it.

use crate::checksum;
use crate::error::{ErrorCode, LyraError, Result};
use crate::net::HttpClient;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Maximum number of retries after the initial attempt.
pub const MAX_RETRIES: u32 = 3;

/// Streaming buffer size; one progress callback fires per buffer.
pub const STREAM_BUF_SIZE: usize = 8 * 1024;

/// Ceiling on any single backoff delay.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Exponential backoff: `min(1000 · 2^attempt, 30000)` milliseconds.
pub fn backoff_delay_ms(attempt: u32) -> u64 {
    1000u64
        .saturating_mul(1u64 << attempt.min(15))
        .min(MAX_BACKOFF_MS)
}

/// A single download job.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    /// HTTPS source URL.
    pub url: String,
    /// Final path; `<destination>.tmp` is used while bytes are in flight.
    pub destination: PathBuf,
    /// Exact byte count the server must deliver.
    pub expected_size: u64,
    /// Lowercase SHA-256 hex digest the finished file must match.
    pub expected_sha256: String,
}

/// Byte stream opened at an offset into the remote resource.
pub struct SourceBody {
    /// The body bytes, starting at the requested offset when `resumed`.
    pub reader: Box<dyn Read + Send + 'static>,
    /// Whether the source honored the offset. When false the body starts
    /// at byte zero and the temp file must be truncated.
    pub resumed: bool,
}

/// Where download bytes come from. The production impl is [`HttpClient`];
/// tests substitute in-memory sources with injected failures.
pub trait DownloadSource: Send + Sync {
    /// Open the resource starting at `offset`.
    ///
    /// # Errors
    ///
    /// Network errors, mapped onto the taxonomy; retryable codes trigger
    /// the backoff loop.
    fn open(&self, url: &str, offset: u64) -> Result<SourceBody>;
}

impl DownloadSource for HttpClient {
    fn open(&self, url: &str, offset: u64) -> Result<SourceBody> {
        let body = self.get_from(url, offset)?;
        Ok(SourceBody {
            resumed: offset == 0 || body.status == 206,
            reader: body.reader,
        })
    }
}

/// Run a download to completion: stream, retry, verify, rename.
///
/// `progress` receives `bytes_so_far / expected_size` once per streamed
/// buffer; values are monotonically non-decreasing and the last one is 1.0.
///
/// # Errors
///
/// - [`ErrorCode::InvalidInputParameterValue`] for a zero size or malformed digest
/// - network errors once retries are exhausted
/// - [`ErrorCode::ModelFileCorrupted`] on digest mismatch (temp file removed)
/// - [`ErrorCode::OperationCancelled`] when the token fires (temp file removed)
pub fn fetch(
    request: &DownloadRequest,
    source: &dyn DownloadSource,
    progress: Option<&(dyn Fn(f32) + Send + Sync)>,
    cancel: &CancellationToken,
) -> Result<()> {
    fetch_with_sleep(request, source, progress, cancel, &|d| std::thread::sleep(d))
}

/// [`fetch`] with an injectable sleeper so tests can observe backoff without
/// waiting it out.
fn fetch_with_sleep(
    request: &DownloadRequest,
    source: &dyn DownloadSource,
    progress: Option<&(dyn Fn(f32) + Send + Sync)>,
    cancel: &CancellationToken,
    sleep: &dyn Fn(std::time::Duration),
) -> Result<()> {
    if request.expected_size == 0 {
        return Err(LyraError::invalid_parameter(
            "expected_size",
            "a download must declare a positive byte count",
        ));
    }
    if !checksum::is_valid_digest(&request.expected_sha256) {
        return Err(LyraError::invalid_parameter(
            "expected_sha256",
            format!(
                "`{}` is not a 64-character lowercase hex digest",
                request.expected_sha256
            ),
        ));
    }

    let tmp = temp_path(&request.destination);
    let guard = TempGuard::new(&tmp);

    let mut attempt = 0u32;
    loop {
        match stream_once(request, source, &tmp, progress, cancel) {
            Ok(()) => break,
            Err(err) if err.is_retryable() && attempt < MAX_RETRIES => {
                let delay = backoff_delay_ms(attempt);
                warn!(
                    url = %request.url,
                    attempt,
                    delay_ms = delay,
                    error = %err,
                    "download attempt failed, backing off"
                );
                sleep(std::time::Duration::from_millis(delay));
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }

    let actual = checksum::hash_file(&tmp)?;
    if actual != request.expected_sha256 {
        warn!(
            url = %request.url,
            expected = %request.expected_sha256,
            actual = %actual,
            "downloaded file failed checksum verification"
        );
        return Err(LyraError::new(
            ErrorCode::ModelFileCorrupted,
            "downloaded model failed checksum verification",
            format!(
                "sha256 of {} is {actual}, expected {}",
                tmp.display(),
                request.expected_sha256
            ),
        )
        .with_recovery("delete the model and download it again"));
    }

    // Ensure the verified bytes are durable before the rename publishes them.
    std::fs::File::open(&tmp)
        .and_then(|f| f.sync_all())
        .map_err(|e| LyraError::from_io(format!("syncing {}", tmp.display()), &e))?;
    std::fs::rename(&tmp, &request.destination)
        .map_err(|e| LyraError::from_io(format!("publishing {}", request.destination.display()), &e))?;
    guard.disarm();

    info!(url = %request.url, dest = %request.destination.display(), "download complete");
    Ok(())
}

/// One streaming pass: resume from the temp file's size, copy until the
/// expected byte count has arrived.
fn stream_once(
    request: &DownloadRequest,
    source: &dyn DownloadSource,
    tmp: &Path,
    progress: Option<&(dyn Fn(f32) + Send + Sync)>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut offset = std::fs::metadata(tmp).map(|m| m.len()).unwrap_or(0);
    if offset > request.expected_size {
        // Leftover temp from a different payload; start over.
        debug!(tmp = %tmp.display(), offset, "temp file larger than expected, restarting");
        offset = 0;
    }

    let body = source.open(&request.url, offset)?;
    if offset > 0 && !body.resumed {
        debug!(url = %request.url, "server ignored range request, restarting from zero");
        offset = 0;
    }

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(tmp)
        .map_err(|e| LyraError::from_io(format!("opening {}", tmp.display()), &e))?;
    file.set_len(offset)
        .map_err(|e| LyraError::from_io(format!("truncating {}", tmp.display()), &e))?;
    let mut file = {
        use std::io::Seek;
        file.seek(std::io::SeekFrom::End(0))
            .map_err(|e| LyraError::from_io(format!("seeking {}", tmp.display()), &e))?;
        file
    };

    let mut reader = body.reader;
    let mut bytes_so_far = offset;
    let mut buf = [0u8; STREAM_BUF_SIZE];
    loop {
        if cancel.is_cancelled() {
            return Err(LyraError::cancelled("model download"));
        }
        let n = reader.read(&mut buf).map_err(|e| {
            LyraError::new(
                ErrorCode::NetworkInterrupted,
                "download stream was interrupted",
                format!("read from {} failed mid-transfer: {e}", request.url),
            )
            .with_recovery("the transfer resumes automatically")
        })?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])
            .map_err(|e| LyraError::from_io(format!("writing {}", tmp.display()), &e))?;
        bytes_so_far += n as u64;
        if let Some(cb) = progress {
            let fraction = (bytes_so_far as f64 / request.expected_size as f64).min(1.0);
            cb(fraction as f32);
        }
    }

    if bytes_so_far < request.expected_size {
        return Err(LyraError::new(
            ErrorCode::NetworkInterrupted,
            "download ended before all bytes arrived",
            format!(
                "received {bytes_so_far} of {} bytes from {}",
                request.expected_size, request.url
            ),
        )
        .with_recovery("the transfer resumes automatically"));
    }
    if bytes_so_far > request.expected_size {
        return Err(LyraError::new(
            ErrorCode::ModelFileCorrupted,
            "server delivered more bytes than the catalog declared",
            format!(
                "received {bytes_so_far} bytes, catalog declared {} for {}",
                request.expected_size, request.url
            ),
        )
        .with_recovery("refresh the model catalog and retry the download"));
    }

    file.sync_all()
        .map_err(|e| LyraError::from_io(format!("syncing {}", tmp.display()), &e))?;
    Ok(())
}

/// `<destination>.tmp`, alongside the destination.
fn temp_path(destination: &Path) -> PathBuf {
    let mut os = destination.as_os_str().to_owned();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Removes the temp file on drop unless the download was published.
struct TempGuard<'a> {
    path: &'a Path,
    armed: std::cell::Cell<bool>,
}

impl<'a> TempGuard<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, armed: std::cell::Cell::new(true) }
    }

    fn disarm(&self) {
        self.armed.set(false);
    }
}

impl Drop for TempGuard<'_> {
    fn drop(&mut self) {
        if self.armed.get() {
            let _ = std::fs::remove_file(self.path);
        }
    }
}
