//! Blocking HTTPS client for the model catalog and downloads.
//!
//! Plain `http://` URLs are rejected synchronously, before any socket is
//! opened; all transfers ride TLS. Supports ranged GET for resumed
//! downloads and maps transport failures onto the network error codes.

use crate::error::{ErrorCode, LyraError, Result};
use std::time::Duration;

/// `User-Agent` sent with every request.
pub const USER_AGENT: &str = concat!("lyra/", env!("CARGO_PKG_VERSION"));

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-read timeout.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Body stream plus the response metadata the download loop needs.
pub struct HttpBody {
    /// HTTP status (200 for full responses, 206 for ranged ones).
    pub status: u16,
    /// `Content-Length` of this response body, when the server sent one.
    pub content_length: Option<u64>,
    /// The body byte stream.
    pub reader: Box<dyn std::io::Read + Send + 'static>,
}

/// HTTPS-only blocking client.
pub struct HttpClient {
    agent: ureq::Agent,
}

impl HttpClient {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(read_timeout)
            .timeout_write(read_timeout)
            .build();
        Self { agent }
    }

    /// Fetch a complete resource.
    ///
    /// # Errors
    ///
    /// [`ErrorCode::NetworkSslError`] for non-HTTPS URLs, otherwise the
    /// mapped transport/status failure.
    pub fn get(&self, url: &str) -> Result<HttpBody> {
        self.get_from(url, 0)
    }

    /// Fetch a resource starting at `offset` via `Range: bytes=N-`.
    ///
    /// A server that ignores the range header answers 200 with the full
    /// body; callers must check [`HttpBody::status`] and restart from zero
    /// in that case.
    ///
    /// # Errors
    ///
    /// Same as [`HttpClient::get`].
    pub fn get_from(&self, url: &str, offset: u64) -> Result<HttpBody> {
        validate_https(url)?;

        let mut request = self.agent.get(url).set("User-Agent", USER_AGENT);
        if offset > 0 {
            request = request.set("Range", &format!("bytes={offset}-"));
        }

        let response = request.call().map_err(|e| map_ureq_error(url, e))?;
        let status = response.status();
        let content_length = response
            .header("Content-Length")
            .and_then(|v| v.parse::<u64>().ok());

        Ok(HttpBody {
            status,
            content_length,
            reader: Box::new(response.into_reader()),
        })
    }

    /// `Content-Length` via a HEAD request, when the server reports one.
    ///
    /// # Errors
    ///
    /// Same as [`HttpClient::get`].
    pub fn content_length(&self, url: &str) -> Result<Option<u64>> {
        validate_https(url)?;
        let response = self
            .agent
            .head(url)
            .set("User-Agent", USER_AGENT)
            .call()
            .map_err(|e| map_ureq_error(url, e))?;
        Ok(response
            .header("Content-Length")
            .and_then(|v| v.parse::<u64>().ok()))
    }
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT)
    }
}

/// Reject anything that is not syntactically a valid `https://` URL.
pub fn validate_https(raw: &str) -> Result<()> {
    let parsed = url::Url::parse(raw).map_err(|e| {
        LyraError::new(
            ErrorCode::InvalidInputParameterValue,
            format!("malformed URL: {raw}"),
            format!("URL parse failure for `{raw}`: {e}"),
        )
        .with_recovery("provide an absolute https:// URL")
    })?;
    if parsed.scheme() != "https" {
        return Err(LyraError::new(
            ErrorCode::NetworkSslError,
            format!("refusing non-HTTPS URL: {raw}"),
            format!(
                "scheme `{}` is not allowed; model data moves over TLS only",
                parsed.scheme()
            ),
        )
        .with_recovery("use an https:// URL for the model source"));
    }
    Ok(())
}

fn map_ureq_error(url: &str, err: ureq::Error) -> LyraError {
    match err {
        ureq::Error::Status(status, response) => {
            let reason = response.status_text().to_owned();
            LyraError::new(
                ErrorCode::NetworkHttpError,
                format!("server returned HTTP {status} for {url}"),
                format!("GET {url} failed with status {status} {reason}"),
            )
            .with_http_status(status)
            .with_recovery("verify the model id and registry availability")
        }
        ureq::Error::Transport(transport) => {
            let detail = transport.to_string();
            let code = match transport.kind() {
                ureq::ErrorKind::Dns => ErrorCode::NetworkDnsFailure,
                ureq::ErrorKind::ConnectionFailed => ErrorCode::NetworkUnreachable,
                ureq::ErrorKind::InsecureRequestHttpsOnly => ErrorCode::NetworkSslError,
                ureq::ErrorKind::Io if detail.contains("timed out") => {
                    ErrorCode::NetworkConnectionTimeout
                }
                ureq::ErrorKind::Io => ErrorCode::NetworkInterrupted,
                _ => ErrorCode::NetworkUnreachable,
            };
            LyraError::new(
                code,
                format!("network request to {url} failed"),
                format!("transport error for {url}: {detail}"),
            )
            .with_recovery("check connectivity and retry")
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;
    use crate::error::{ErrorCode, expect_err};

    #[test]
    fn plain_http_is_rejected_without_io() {
        let err = validate_https("http://registry.example/catalog.json").unwrap_err();
        assert_eq!(err.code(), ErrorCode::NetworkSslError);
    }

    #[test]
    fn other_schemes_are_rejected() {
        for url in ["ftp://host/file", "file:///tmp/model.bin"] {
            let err = validate_https(url).unwrap_err();
            assert_eq!(err.code(), ErrorCode::NetworkSslError, "{url}");
        }
    }

    #[test]
    fn garbage_urls_are_invalid_input() {
        let err = validate_https("not a url at all").unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidInputParameterValue);
    }

    #[test]
    fn https_urls_pass_validation() {
        assert!(validate_https("https://registry.example/models/catalog.json").is_ok());
    }

    #[test]
    fn client_rejects_http_before_connecting() {
        // No server exists at this address; a synchronous scheme rejection
        // proves no connection was attempted.
        let client = HttpClient::default();
        let err = expect_err(client.get("http://127.0.0.1:1/model.bin"));
        assert_eq!(err.code(), ErrorCode::NetworkSslError);
    }

    #[test]
    fn user_agent_names_the_product_and_version() {
        assert!(USER_AGENT.starts_with("lyra/"));
        assert!(USER_AGENT.len() > "lyra/".len());
    }
}
