//! Error types for the Lyra runtime.
//!
//! Every public operation returns [`Result<T>`]. Failures carry a numeric
//! [`ErrorCode`] whose value range determines the [`ErrorCategory`], plus a
//! human-readable message, a technical detail string, and an optional
//! recovery suggestion. Codes are stable across releases so embedders can
//! switch on them.

use std::fmt;

/// Numeric error codes, partitioned into fixed ranges per category.
///
/// | Range | Category |
/// |-------|----------|
/// | 1000–1099 | model not found |
/// | 1100–1199 | model load |
/// | 1200–1299 | inference |
/// | 1300–1399 | network |
/// | 1400–1499 | storage |
/// | 1500–1599 | invalid input |
/// | 1600–1699 | resource exhausted |
/// | 1700–1799 | cancelled |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // 1000–1099: the requested model does not exist.
    ModelFileNotFound = 1000,
    ModelIdUnknown = 1001,
    ModelVersionNotAvailable = 1002,

    // 1100–1199: the model exists but could not be loaded.
    ModelFileCorrupted = 1100,
    ModelIncompatibleArchitecture = 1101,
    ModelInsufficientMemory = 1102,
    ModelUnsupportedQuantization = 1103,
    ModelFileLocked = 1104,

    // 1200–1299: loaded model failed to run.
    InferenceModelNotLoaded = 1200,
    InferenceInvalidInput = 1201,
    InferenceContextWindowExceeded = 1202,
    InferenceTimeout = 1203,
    InferenceHardwareAccelerationFailure = 1204,
    InferenceBackendFailure = 1205,

    // 1300–1399: network failures (transient ones are auto-retried).
    NetworkUnreachable = 1300,
    NetworkConnectionTimeout = 1301,
    NetworkDnsFailure = 1302,
    NetworkSslError = 1303,
    NetworkHttpError = 1304,
    NetworkInterrupted = 1305,

    // 1400–1499: local filesystem failures.
    StorageInsufficientSpace = 1400,
    StoragePermissionDenied = 1401,
    StorageReadError = 1402,
    StorageWriteError = 1403,
    StorageDiskFull = 1404,

    // 1500–1599: the caller passed something unusable.
    InvalidInputNullPointer = 1500,
    InvalidInputParameterValue = 1501,
    InvalidInputConfiguration = 1502,
    InvalidInputAudioFormat = 1503,
    InvalidInputModelHandle = 1504,

    // 1600–1699: a system resource ran out.
    ResourceOutOfMemory = 1600,
    ResourceTooManyOpenFiles = 1601,
    ResourceThreadPoolExhausted = 1602,
    ResourceGpuMemoryExhausted = 1603,

    // 1700–1799: the operation did not run to completion, by request.
    OperationCancelled = 1700,
    OperationTimeout = 1701,
    OperationInterrupted = 1702,
}

impl ErrorCode {
    /// Numeric value of the code.
    pub fn as_u16(self) -> u16 {
        self as u16
    }

    /// Category implied by the code's numeric range.
    pub fn category(self) -> ErrorCategory {
        ErrorCategory::from_code_value(self as u16)
    }

    /// Whether an operation failing with this code is worth retrying as-is.
    ///
    /// Restricted to transient network failures and resource exhaustion.
    /// HTTP errors are retryable only for transient status codes; see
    /// [`LyraError::is_retryable`], which also consults the recorded status.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::NetworkUnreachable
                | Self::NetworkConnectionTimeout
                | Self::NetworkDnsFailure
                | Self::NetworkInterrupted
                | Self::ResourceOutOfMemory
                | Self::ResourceTooManyOpenFiles
                | Self::ResourceThreadPoolExhausted
                | Self::ResourceGpuMemoryExhausted
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, *self as u16)
    }
}

/// Coarse failure category, derived from the code's numeric range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    ModelNotFound,
    ModelLoad,
    Inference,
    Network,
    Storage,
    InvalidInput,
    ResourceExhausted,
    Cancelled,
}

impl ErrorCategory {
    /// Map a raw code value onto its category range.
    pub fn from_code_value(code: u16) -> Self {
        match code {
            1000..=1099 => Self::ModelNotFound,
            1100..=1199 => Self::ModelLoad,
            1200..=1299 => Self::Inference,
            1300..=1399 => Self::Network,
            1400..=1499 => Self::Storage,
            1500..=1599 => Self::InvalidInput,
            1600..=1699 => Self::ResourceExhausted,
            _ => Self::Cancelled,
        }
    }

    /// Distinct non-zero process exit code for CLI-style embeddings.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::ModelNotFound => 2,
            Self::ModelLoad => 3,
            Self::Inference => 4,
            Self::Network => 5,
            Self::Storage => 6,
            Self::InvalidInput => 7,
            Self::ResourceExhausted => 8,
            Self::Cancelled => 9,
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ModelNotFound => "model not found",
            Self::ModelLoad => "model load error",
            Self::Inference => "inference error",
            Self::Network => "network error",
            Self::Storage => "storage error",
            Self::InvalidInput => "invalid input",
            Self::ResourceExhausted => "resource exhausted",
            Self::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Structured error carried by every fallible operation.
///
/// `message` is for humans, `details` for logs and bug reports. Both are
/// always non-empty and distinct from each other.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct LyraError {
    code: ErrorCode,
    message: String,
    details: String,
    recovery_suggestion: Option<String>,
    http_status: Option<u16>,
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, LyraError>;

/// Test helper: extract the error from a `Result` whose `Ok` type doesn't
/// implement `Debug` (so `.unwrap_err()` can't be used directly).
#[cfg(test)]
pub(crate) fn expect_err<T>(result: Result<T>) -> LyraError {
    match result {
        Ok(_) => panic!("expected an error, got Ok"),
        Err(e) => e,
    }
}

impl LyraError {
    /// Construct an error. `message` and `details` must each carry enough
    /// text to stand alone (the test suite enforces ≥ 10 characters).
    pub fn new(code: ErrorCode, message: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: details.into(),
            recovery_suggestion: None,
            http_status: None,
        }
    }

    /// Attach a recovery suggestion.
    #[must_use]
    pub fn with_recovery(mut self, suggestion: impl Into<String>) -> Self {
        self.recovery_suggestion = Some(suggestion.into());
        self
    }

    /// Record the HTTP status that produced a [`ErrorCode::NetworkHttpError`].
    #[must_use]
    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn details(&self) -> &str {
        &self.details
    }

    pub fn recovery_suggestion(&self) -> Option<&str> {
        self.recovery_suggestion.as_deref()
    }

    /// HTTP status for network errors, when one was observed.
    pub fn http_status(&self) -> Option<u16> {
        self.http_status
    }

    /// Whether retrying the same operation could plausibly succeed.
    ///
    /// True for transient network/resource codes, and for HTTP errors whose
    /// status indicates a server-side or rate-limit condition.
    pub fn is_retryable(&self) -> bool {
        if self.code.is_retryable() {
            return true;
        }
        if self.code == ErrorCode::NetworkHttpError {
            return matches!(self.http_status, Some(s) if s >= 500 || s == 429 || s == 408);
        }
        false
    }

    /// Map an I/O failure into the storage range, keeping the OS detail.
    pub fn from_io(context: impl Into<String>, err: &std::io::Error) -> Self {
        use std::io::ErrorKind;
        let code = match err.kind() {
            ErrorKind::PermissionDenied => ErrorCode::StoragePermissionDenied,
            ErrorKind::WriteZero => ErrorCode::StorageDiskFull,
            ErrorKind::NotFound | ErrorKind::UnexpectedEof => ErrorCode::StorageReadError,
            _ => ErrorCode::StorageWriteError,
        };
        let context = context.into();
        Self::new(
            code,
            format!("storage operation failed: {context}"),
            format!("{context}: {err} (os kind: {:?})", err.kind()),
        )
        .with_recovery("check filesystem permissions and free disk space")
    }

    /// Invalid-handle error shared by every engine entry point.
    pub fn invalid_handle(raw: u64) -> Self {
        Self::new(
            ErrorCode::InvalidInputModelHandle,
            format!("model handle {raw} is not valid"),
            format!("handle value {raw} was never issued by this engine or is zero"),
        )
        .with_recovery("pass a handle returned by a successful load_model call")
    }

    /// Not-loaded error for handles that were valid once but are gone.
    pub fn not_loaded(raw: u64) -> Self {
        Self::new(
            ErrorCode::InferenceModelNotLoaded,
            format!("no model is loaded for handle {raw}"),
            format!("handle {raw} does not refer to a currently loaded model in this engine"),
        )
        .with_recovery("load the model again and use the new handle")
    }

    /// Parameter-range error with the offending value spelled out.
    pub fn invalid_parameter(name: &str, detail: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::InvalidInputParameterValue,
            format!("parameter `{name}` is out of range"),
            format!("`{name}` rejected during validation: {detail}"),
        )
        .with_recovery(format!("adjust `{name}` to a documented value"))
    }

    /// Cancellation error; cancellations carry no recovery suggestion.
    pub fn cancelled(what: &str) -> Self {
        Self::new(
            ErrorCode::OperationCancelled,
            format!("{what} was cancelled before completion"),
            format!("cooperative cancellation observed during {what}"),
        )
    }
}

impl From<std::io::Error> for LyraError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io("filesystem access", &err)
    }
}
