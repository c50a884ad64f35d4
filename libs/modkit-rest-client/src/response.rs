use crate::error::HttpError;
use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use http::{HeaderMap, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use serde::de::DeserializeOwned;
use std::io::Read;
use std::time::Duration;
use url::Url;

/// Type alias for the boxed response body produced by a [`crate::Transport`].
pub type ResponseBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

/// Wrap in-memory bytes as a [`ResponseBody`].
#[must_use]
pub fn full_body(bytes: impl Into<Bytes>) -> ResponseBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}

enum BodyState {
    Unread(ResponseBody),
    Read(Bytes),
    Drained,
    Failed(BodyFailure),
}

/// Why the first read of a body failed; replayed on every later read.
#[derive(Debug, Clone)]
enum BodyFailure {
    TooLarge { limit: usize, actual: usize },
    Broken(String),
}

impl BodyFailure {
    fn of(err: &HttpError) -> Self {
        match err {
            HttpError::BodyTooLarge { limit, actual } => Self::TooLarge {
                limit: *limit,
                actual: *actual,
            },
            other => Self::Broken(other.to_string()),
        }
    }

    fn to_error(&self) -> HttpError {
        match self {
            Self::TooLarge { limit, actual } => HttpError::BodyTooLarge {
                limit: *limit,
                actual: *actual,
            },
            Self::Broken(reason) => HttpError::BodyUnavailable(reason.clone()),
        }
    }
}

/// Response envelope returned by every call.
///
/// The body is read lazily. [`read_body`](Self::read_body) reads the socket on
/// the first call and returns the cached bytes afterwards, so reading twice
/// never touches the connection again. `Content-Encoding: gzip` and `deflate`
/// bodies are decompressed when read.
///
/// All body reads enforce the configured `max_body_size` limit on the
/// decompressed size. Responses from the network also carry the socket
/// timeout as an idle limit between body frames.
pub struct HttpResponse {
    status: StatusCode,
    headers: HeaderMap,
    url: Url,
    body: BodyState,
    max_body_size: usize,
    read_timeout: Option<Duration>,
}

impl std::fmt::Debug for HttpResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let body = match &self.body {
            BodyState::Unread(_) => "unread",
            BodyState::Read(_) => "read",
            BodyState::Drained => "drained",
            BodyState::Failed(_) => "failed",
        };
        f.debug_struct("HttpResponse")
            .field("status", &self.status)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("body", &body)
            .finish_non_exhaustive()
    }
}

impl HttpResponse {
    pub(crate) fn new(response: Response<ResponseBody>, url: Url, max_body_size: usize) -> Self {
        let (parts, body) = response.into_parts();
        Self {
            status: parts.status,
            headers: parts.headers,
            url,
            body: BodyState::Unread(body),
            max_body_size,
            read_timeout: None,
        }
    }

    /// Fail body reads that wait longer than `timeout` for the next frame.
    #[must_use]
    pub(crate) fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Get the response status code
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Get the response headers
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// URL of the request that produced this response (the last redirect hop)
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// First value of a header as UTF-8, if present and valid
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Whether the body has been read (or drained) already
    #[must_use]
    pub fn is_body_read(&self) -> bool {
        !matches!(self.body, BodyState::Unread(_))
    }

    /// Read the whole body, caching it.
    ///
    /// The first call reads from the connection; later calls return the cached
    /// bytes. A drained body reads as empty. Once a read has failed, every
    /// later call fails too.
    ///
    /// # Errors
    /// Returns `HttpError::BodyTooLarge` if the (decompressed) body exceeds the limit.
    /// Returns `HttpError::Timeout` if no frame arrives within the socket timeout.
    /// Returns `HttpError::Transport` if the connection fails mid-body.
    /// Returns `HttpError::BodyUnavailable` when repeating an earlier failure.
    pub async fn read_body(&mut self) -> Result<Bytes, HttpError> {
        match std::mem::replace(&mut self.body, BodyState::Drained) {
            BodyState::Unread(body) => {
                let result = read_body_limited_impl(body, self.max_body_size, self.read_timeout)
                    .await
                    .and_then(|raw| decode_content(&self.headers, raw, self.max_body_size));
                match result {
                    Ok(bytes) => {
                        self.body = BodyState::Read(bytes.clone());
                        Ok(bytes)
                    }
                    Err(e) => {
                        self.body = BodyState::Failed(BodyFailure::of(&e));
                        Err(e)
                    }
                }
            }
            BodyState::Read(bytes) => {
                self.body = BodyState::Read(bytes.clone());
                Ok(bytes)
            }
            BodyState::Failed(failure) => {
                let err = failure.to_error();
                self.body = BodyState::Failed(failure);
                Err(err)
            }
            BodyState::Drained => Ok(Bytes::new()),
        }
    }

    /// Read the body into a `String`, caching the bytes.
    ///
    /// Invalid UTF-8 sequences are replaced with the Unicode replacement character.
    ///
    /// # Errors
    /// Same as [`read_body`](Self::read_body).
    pub async fn read_text(&mut self) -> Result<String, HttpError> {
        let bytes = self.read_body().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Read response body as bytes without status check
    ///
    /// # Errors
    /// Same as [`read_body`](Self::read_body).
    pub async fn bytes(mut self) -> Result<Bytes, HttpError> {
        self.read_body().await
    }

    /// Read response body as text (UTF-8) without status check
    ///
    /// # Errors
    /// Same as [`read_body`](Self::read_body).
    ///
    /// # Example
    ///
    /// ```ignore
    /// let body = client.get("https://example.com/text").await?.text().await?;
    /// println!("Response: {}", body);
    /// ```
    pub async fn text(mut self) -> Result<String, HttpError> {
        self.read_text().await
    }

    /// Parse response body as JSON without status check
    ///
    /// Use [`error_for_status`](Self::error_for_status) first when only 2xx
    /// bodies should be parsed.
    ///
    /// # Errors
    /// Returns `HttpError::BodyTooLarge` if body exceeds limit.
    /// Returns `HttpError::Json` if parsing fails.
    pub async fn json<T: DeserializeOwned>(mut self) -> Result<T, HttpError> {
        let bytes = self.read_body().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Check status and return error for non-2xx responses
    ///
    /// Does NOT read the response body.
    ///
    /// # Errors
    ///
    /// Returns `HttpError::HttpStatus` if the response status is not 2xx.
    pub fn error_for_status(self) -> Result<Self, HttpError> {
        if self.status.is_success() {
            return Ok(self);
        }
        Err(HttpError::HttpStatus {
            status: self.status,
            message: format!("Failed request: ({}) {}", self.status.as_u16(), self.url),
        })
    }

    /// Read and discard the body so the connection can go back to its pool.
    ///
    /// Stops after `limit` bytes or a stalled frame; past that the connection
    /// is dropped instead of reused. Errors while draining are ignored: the hop
    /// is being abandoned.
    pub async fn drain(&mut self, limit: usize) {
        if let BodyState::Unread(body) = std::mem::replace(&mut self.body, BodyState::Drained) {
            let mut body = std::pin::pin!(body);
            let mut drained = 0usize;

            while let Ok(Some(frame)) = next_frame(&mut body, self.read_timeout).await {
                let Ok(frame) = frame else {
                    break;
                };
                if let Some(chunk) = frame.data_ref() {
                    drained += chunk.len();
                    if drained >= limit {
                        break;
                    }
                }
            }
            tracing::trace!(drained, url = %self.url, "drained discarded response body");
        }
    }
}

type FrameResult = Result<http_body::Frame<Bytes>, Box<dyn std::error::Error + Send + Sync>>;

/// Next body frame, or `HttpError::Timeout` once `idle` passes without one.
async fn next_frame(
    body: &mut std::pin::Pin<&mut ResponseBody>,
    idle: Option<Duration>,
) -> Result<Option<FrameResult>, HttpError> {
    match idle {
        Some(idle) => tokio::time::timeout(idle, body.frame())
            .await
            .map_err(|_| HttpError::Timeout(idle)),
        None => Ok(body.frame().await),
    }
}

/// Read a body frame by frame, failing as soon as `limit` is exceeded.
async fn read_body_limited_impl(
    body: ResponseBody,
    limit: usize,
    idle: Option<Duration>,
) -> Result<Bytes, HttpError> {
    let mut collected = Vec::new();
    let mut body = std::pin::pin!(body);

    while let Some(frame) = next_frame(&mut body, idle).await? {
        let frame = frame.map_err(HttpError::Transport)?;
        if let Some(chunk) = frame.data_ref() {
            if collected.len() + chunk.len() > limit {
                return Err(HttpError::BodyTooLarge {
                    limit,
                    actual: collected.len() + chunk.len(),
                });
            }
            collected.extend_from_slice(chunk);
        }
    }

    Ok(Bytes::from(collected))
}

/// Undo `Content-Encoding`, enforcing `limit` on the decoded size.
fn decode_content(headers: &HeaderMap, raw: Bytes, limit: usize) -> Result<Bytes, HttpError> {
    let encoding = headers
        .get(http::header::CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase());

    let decoder: Box<dyn Read + '_> = match encoding.as_deref() {
        Some("gzip" | "x-gzip") if !raw.is_empty() => Box::new(GzDecoder::new(raw.as_ref())),
        Some("deflate") if !raw.is_empty() => Box::new(ZlibDecoder::new(raw.as_ref())),
        _ => return Ok(raw),
    };

    let mut decoded = Vec::new();
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    decoder
        .take(cap)
        .read_to_end(&mut decoded)
        .map_err(|e| HttpError::Transport(Box::new(e)))?;

    if decoded.len() > limit {
        return Err(HttpError::BodyTooLarge {
            limit,
            actual: decoded.len(),
        });
    }
    Ok(Bytes::from(decoded))
}
