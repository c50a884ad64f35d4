//! JSON resource layer over [`HttpClient`].
//!
//! A `404` resolves to `result: None` rather than an error; any other status
//! above 299 becomes [`HttpError::HttpStatus`].

use crate::client::{HttpClient, parse_url};
use crate::config::Verb;
use crate::error::HttpError;
use crate::request::{BoxError, RequestBody};
use crate::response::HttpResponse;
use bytes::Bytes;
use futures::Stream;
use http::header::{ACCEPT, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::sync::Arc;
use url::Url;

const JSON: &str = "application/json";
const JSON_UTF8: &str = "application/json; charset=utf-8";

/// Rewrites a parsed JSON body before it is deserialized into the result type.
pub type ResponseProcessor = Arc<dyn Fn(serde_json::Value) -> serde_json::Value + Send + Sync>;

/// Per-call options for [`RestClient`] requests.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// `Accept` value (default: `application/json`)
    pub accept: Option<String>,
    /// Extra headers; an explicit `Content-Type` here wins over the JSON default
    pub headers: HeaderMap,
    /// Applied to successful bodies, e.g. to unwrap a `{"value": ...}` envelope
    pub response_processor: Option<ResponseProcessor>,
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("accept", &self.accept)
            .field("headers", &self.headers)
            .field("response_processor", &self.response_processor.is_some())
            .finish()
    }
}

impl RequestOptions {
    #[must_use]
    pub fn accept(mut self, accept: impl Into<String>) -> Self {
        self.accept = Some(accept.into());
        self
    }

    #[must_use]
    pub fn response_processor(
        mut self,
        processor: impl Fn(serde_json::Value) -> serde_json::Value + Send + Sync + 'static,
    ) -> Self {
        self.response_processor = Some(Arc::new(processor));
        self
    }

    /// Add a header.
    ///
    /// # Errors
    ///
    /// Returns `InvalidHeaderName`/`InvalidHeaderValue` if either part is malformed.
    pub fn header(mut self, name: &str, value: &str) -> Result<Self, HttpError> {
        self.headers.insert(
            http::HeaderName::from_bytes(name.as_bytes())?,
            HeaderValue::from_str(value)?,
        );
        Ok(self)
    }
}

/// Outcome of a [`RestClient`] call with a status below 300, or a 404.
#[derive(Debug, Clone)]
pub struct RestResponse<T> {
    pub status_code: StatusCode,
    /// `None` for a 404 or an empty body
    pub result: Option<T>,
    pub headers: HeaderMap,
}

/// Client for JSON resources, optionally rooted at a base URL.
///
/// # Example
///
/// ```ignore
/// let rest = RestClient::with_base_url(client, "https://api.example.com/v1/")?;
/// let item: RestResponse<Item> = rest.get("items/42", &RequestOptions::default()).await?;
/// ```
#[derive(Debug, Clone)]
pub struct RestClient {
    client: HttpClient,
    base_url: Option<Url>,
}

impl RestClient {
    /// Client that requires absolute URLs
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self {
            client,
            base_url: None,
        }
    }

    /// Client resolving relative resources against `base_url`
    ///
    /// # Errors
    ///
    /// Returns `HttpError::InvalidUri` if `base_url` is not an absolute http(s) URL.
    pub fn with_base_url(client: HttpClient, base_url: &str) -> Result<Self, HttpError> {
        Ok(Self {
            client,
            base_url: Some(parse_url(base_url)?),
        })
    }

    #[must_use]
    pub fn client(&self) -> &HttpClient {
        &self.client
    }

    /// Resolve `resource` against the base URL.
    ///
    /// An absolute `resource` is used as is; a relative path is resolved as a
    /// path below the base URL's path, so `items` under `/api/v1` is
    /// `/api/v1/items`. An empty `resource` is the base URL itself.
    ///
    /// # Errors
    ///
    /// Returns `HttpError::InvalidUri` if no absolute URL can be formed.
    pub fn get_url(&self, resource: &str) -> Result<Url, HttpError> {
        let Some(base) = &self.base_url else {
            return parse_url(resource);
        };
        if resource.is_empty() {
            return Ok(base.clone());
        }
        if let Ok(absolute) = Url::parse(resource) {
            return parse_url(absolute.as_str());
        }

        let mut directory = base.clone();
        if !directory.path().ends_with('/') {
            let path = format!("{}/", directory.path());
            directory.set_path(&path);
        }
        let joined = directory.join(resource).map_err(|e| HttpError::InvalidUri {
            url: resource.to_owned(),
            kind: crate::error::InvalidUriKind::ParseError,
            reason: e.to_string(),
        })?;
        parse_url(joined.as_str())
    }

    /// Get a resource. A 404 yields `result: None`.
    ///
    /// # Errors
    ///
    /// Engine errors, `HttpStatus` for other statuses above 299 and
    /// `InvalidResource` for a body that is not a `T`.
    pub async fn get<T: DeserializeOwned>(
        &self,
        resource: &str,
        options: &RequestOptions,
    ) -> Result<RestResponse<T>, HttpError> {
        self.send(Verb::Get, resource, RequestBody::Empty, options, false)
            .await
    }

    /// Delete a resource.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub async fn del<T: DeserializeOwned>(
        &self,
        resource: &str,
        options: &RequestOptions,
    ) -> Result<RestResponse<T>, HttpError> {
        self.send(Verb::Delete, resource, RequestBody::Empty, options, false)
            .await
    }

    /// OPTIONS on a resource.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub async fn options<T: DeserializeOwned>(
        &self,
        resource: &str,
        options: &RequestOptions,
    ) -> Result<RestResponse<T>, HttpError> {
        self.send(Verb::Options, resource, RequestBody::Empty, options, false)
            .await
    }

    /// POST `resource` as JSON.
    ///
    /// # Errors
    ///
    /// `Json` if `resource` cannot be serialized, otherwise same as [`get`](Self::get).
    pub async fn create<T: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        resource: &T,
        options: &RequestOptions,
    ) -> Result<RestResponse<R>, HttpError> {
        let body = serde_json::to_vec(resource)?;
        self.send(Verb::Post, url, body.into(), options, true).await
    }

    /// PATCH `resource` as JSON.
    ///
    /// # Errors
    ///
    /// Same as [`create`](Self::create).
    pub async fn update<T: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        resource: &T,
        options: &RequestOptions,
    ) -> Result<RestResponse<R>, HttpError> {
        let body = serde_json::to_vec(resource)?;
        self.send(Verb::Patch, url, body.into(), options, true).await
    }

    /// PUT `resource` as JSON.
    ///
    /// # Errors
    ///
    /// Same as [`create`](Self::create).
    pub async fn replace<T: Serialize, R: DeserializeOwned>(
        &self,
        url: &str,
        resource: &T,
        options: &RequestOptions,
    ) -> Result<RestResponse<R>, HttpError> {
        let body = serde_json::to_vec(resource)?;
        self.send(Verb::Put, url, body.into(), options, true).await
    }

    /// Send `stream` as the body and parse the JSON reply.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get), plus `BodyNotReplayable` if a redirect or
    /// retry needs the body again.
    pub async fn upload_stream<R, S, E>(
        &self,
        verb: Verb,
        url: &str,
        stream: S,
        options: &RequestOptions,
    ) -> Result<RestResponse<R>, HttpError>
    where
        R: DeserializeOwned,
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.send(verb, url, RequestBody::from_stream(stream), options, true)
            .await
    }

    async fn send<T: DeserializeOwned>(
        &self,
        verb: Verb,
        resource: &str,
        body: RequestBody,
        options: &RequestOptions,
        content_type: bool,
    ) -> Result<RestResponse<T>, HttpError> {
        let url = self.get_url(resource)?;
        let headers = headers_from_options(options, content_type)?;
        let response = self.client.execute(verb, url.as_str(), body, headers).await?;
        process_response(response, options).await
    }
}

fn headers_from_options(
    options: &RequestOptions,
    content_type: bool,
) -> Result<HeaderMap, HttpError> {
    let mut headers = options.headers.clone();
    let accept = options.accept.as_deref().unwrap_or(JSON);
    headers.insert(ACCEPT, HeaderValue::from_str(accept)?);
    if content_type && !headers.contains_key(CONTENT_TYPE) {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_UTF8));
    }
    Ok(headers)
}

async fn process_response<T: DeserializeOwned>(
    mut response: HttpResponse,
    options: &RequestOptions,
) -> Result<RestResponse<T>, HttpError> {
    let status_code = response.status();
    let headers = response.headers().clone();
    if status_code == StatusCode::NOT_FOUND {
        return Ok(RestResponse {
            status_code,
            result: None,
            headers,
        });
    }

    let body = response.read_body().await?;
    if status_code.as_u16() > 299 {
        return Err(HttpError::HttpStatus {
            status: status_code,
            message: error_message(&body)
                .unwrap_or_else(|| format!("Failed request: ({}) {}", status_code.as_u16(), response.url())),
        });
    }

    let result = if body.is_empty() {
        None
    } else if let Some(processor) = &options.response_processor {
        let value = serde_json::from_slice(&body).map_err(HttpError::InvalidResource)?;
        Some(serde_json::from_value(processor(value)).map_err(HttpError::InvalidResource)?)
    } else {
        Some(serde_json::from_slice(&body).map_err(HttpError::InvalidResource)?)
    };
    Ok(RestResponse {
        status_code,
        result,
        headers,
    })
}

/// `message` field of a JSON error body.
fn error_message(body: &[u8]) -> Option<String> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    value.get("message")?.as_str().map(str::to_owned)
}
