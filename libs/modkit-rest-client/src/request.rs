use crate::agent::Agent;
use crate::client::HttpClient;
use crate::config::Verb;
use crate::error::{HttpError, InvalidUriKind};
use crate::response::HttpResponse;
use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use http::header::{CONTENT_TYPE, HeaderName, HeaderValue};
use http::{HeaderMap, Request};
use http_body::Frame;
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Empty, Full, StreamBody};
use parking_lot::Mutex;
use serde::Serialize;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use url::Url;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Body type put on the wire by a [`crate::Transport`].
pub type WireBody = UnsyncBoxBody<Bytes, BoxError>;

type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, BoxError>> + Send>>;

/// Single-use slot holding a streamed body. Clones share the slot.
#[derive(Clone)]
pub struct StreamSlot(Arc<Mutex<Option<BodyStream>>>);

impl fmt::Debug for StreamSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = if self.0.lock().is_some() {
            "pending"
        } else {
            "consumed"
        };
        f.debug_tuple("StreamSlot").field(&state).finish()
    }
}

/// Request body: nothing, in-memory bytes, or a lazy byte stream.
///
/// In-memory bodies are re-sent on every redirect hop, retry attempt and
/// handshake leg. A stream can be sent once; a second send fails with
/// [`HttpError::BodyNotReplayable`].
#[derive(Clone, Debug, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Bytes(Bytes),
    Stream(StreamSlot),
}

impl RequestBody {
    /// Wrap a byte stream (e.g. a file being uploaded).
    pub fn from_stream<S, E>(stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        let stream: BodyStream = stream.map_err(Into::into).boxed();
        RequestBody::Stream(StreamSlot(Arc::new(Mutex::new(Some(stream)))))
    }

    /// In-memory content, if any (streams have none).
    #[must_use]
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            RequestBody::Bytes(bytes) => Some(bytes),
            RequestBody::Empty | RequestBody::Stream(_) => None,
        }
    }

    /// Whether the body can be sent again.
    #[must_use]
    pub fn is_replayable(&self) -> bool {
        match self {
            RequestBody::Empty | RequestBody::Bytes(_) => true,
            RequestBody::Stream(slot) => slot.0.lock().is_some(),
        }
    }

    /// Body for one send. Consumes the stream of a streamed body.
    ///
    /// # Errors
    /// Returns `HttpError::BodyNotReplayable` if the stream was already sent.
    pub(crate) fn to_wire(&self) -> Result<WireBody, HttpError> {
        match self {
            RequestBody::Empty => Ok(Empty::new().map_err(|never| match never {}).boxed_unsync()),
            RequestBody::Bytes(bytes) => Ok(Full::new(bytes.clone())
                .map_err(|never| match never {})
                .boxed_unsync()),
            RequestBody::Stream(slot) => {
                let stream = slot.0.lock().take().ok_or(HttpError::BodyNotReplayable)?;
                Ok(StreamBody::new(stream.map_ok(Frame::data)).boxed_unsync())
            }
        }
    }
}

impl From<Bytes> for RequestBody {
    fn from(value: Bytes) -> Self {
        RequestBody::Bytes(value)
    }
}

impl From<String> for RequestBody {
    fn from(value: String) -> Self {
        RequestBody::Bytes(Bytes::from(value))
    }
}

impl From<&str> for RequestBody {
    fn from(value: &str) -> Self {
        RequestBody::Bytes(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<Vec<u8>> for RequestBody {
    fn from(value: Vec<u8>) -> Self {
        RequestBody::Bytes(Bytes::from(value))
    }
}

impl From<Option<String>> for RequestBody {
    fn from(value: Option<String>) -> Self {
        value.map_or(RequestBody::Empty, RequestBody::from)
    }
}

/// Everything needed to send one attempt.
///
/// Built fresh for the original send, every redirect hop and every retry
/// attempt, since headers and agent may change between them. Handlers mutate
/// it in `prepare_request`.
#[derive(Debug, Clone)]
pub struct RequestDescriptor {
    pub verb: Verb,
    pub url: Url,
    /// Case-insensitive; later inserts replace earlier values.
    pub headers: HeaderMap,
    pub body: RequestBody,
    /// Agent the request is sent through
    pub agent: Agent,
}

impl RequestDescriptor {
    /// Set a header, replacing any previous value.
    ///
    /// # Errors
    /// Returns an error if the name or value is not a valid header.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<(), HttpError> {
        let name = HeaderName::try_from(name)?;
        let value = HeaderValue::try_from(value)?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Build the `http::Request` for one send.
    pub(crate) fn to_request(&self) -> Result<Request<WireBody>, HttpError> {
        let uri = http::Uri::try_from(self.url.as_str()).map_err(|e| HttpError::InvalidUri {
            url: self.url.to_string(),
            kind: InvalidUriKind::ParseError,
            reason: e.to_string(),
        })?;

        let mut request = Request::builder()
            .method(self.verb.as_method())
            .uri(uri)
            .body(self.body.to_wire()?)?;
        request.headers_mut().extend(self.headers.clone());
        Ok(request)
    }
}

/// HTTP request builder with fluent API
///
/// Created by [`HttpClient::get`], [`HttpClient::post`], etc.
/// Supports chaining headers and body configuration before sending
/// with [`send()`](RequestBuilder::send).
///
/// # Example
///
/// ```ignore
/// use modkit_rest_client::HttpClient;
///
/// let client = HttpClient::builder().build()?;
///
/// // POST with JSON body
/// let resp = client
///     .post("https://api.example.com/users")
///     .header("x-request-id", "123")
///     .json(&NewUser { name: "Alice" })?
///     .send()
///     .await?;
///
/// // Upload a stream
/// let resp = client
///     .put("https://api.example.com/blobs/1")
///     .stream(file_chunks)
///     .send()
///     .await?;
/// ```
#[must_use = "RequestBuilder does nothing until .send() is called"]
pub struct RequestBuilder {
    client: HttpClient,
    verb: Verb,
    url: String,
    headers: HeaderMap,
    body: RequestBody,
    /// Error captured during building (deferred to `send()`)
    error: Option<HttpError>,
}

impl RequestBuilder {
    pub(crate) fn new(client: HttpClient, verb: Verb, url: String) -> Self {
        Self {
            client,
            verb,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
            error: None,
        }
    }

    /// Add a single header to the request (replaces an earlier value)
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if self.error.is_some() {
            return self;
        }

        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            (Err(e), _) => {
                self.error = Some(HttpError::InvalidHeaderName(e));
            }
            (_, Err(e)) => {
                self.error = Some(HttpError::InvalidHeaderValue(e));
            }
        }
        self
    }

    /// Add multiple headers to the request
    pub fn headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (name, value) in headers {
            self = self.header(name.as_ref(), value.as_ref());
        }
        self
    }

    /// Set request body as JSON
    ///
    /// Serializes the value using `serde_json` and sets Content-Type to
    /// `application/json; charset=utf-8` unless a Content-Type header was
    /// already provided.
    ///
    /// # Errors
    ///
    /// Returns `Err(HttpError::Json)` if serialization fails.
    pub fn json<T: Serialize>(mut self, body: &T) -> Result<Self, HttpError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }

        let json_bytes = serde_json::to_vec(body)?;
        self.body = RequestBody::Bytes(Bytes::from(json_bytes));
        if !self.headers.contains_key(CONTENT_TYPE) {
            self.headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/json; charset=utf-8"),
            );
        }
        Ok(self)
    }

    /// Set an in-memory request body
    pub fn body(mut self, body: impl Into<RequestBody>) -> Self {
        self.body = body.into();
        self
    }

    /// Set a streamed request body (cannot be replayed on redirects or retries)
    pub fn stream<S, E>(mut self, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.body = RequestBody::from_stream(stream);
        self
    }

    /// Send the request through the client's execution engine
    ///
    /// # Errors
    ///
    /// Returns the first error captured while building, or any error from
    /// [`HttpClient::execute`].
    pub async fn send(self) -> Result<HttpResponse, HttpError> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.client
            .execute(self.verb, &self.url, self.body, self.headers)
            .await
    }
}
