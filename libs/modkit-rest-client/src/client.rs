use crate::agent::{Agent, AgentResolver};
use crate::builder::HttpClientBuilder;
use crate::config::{HttpClientConfig, Verb};
use crate::error::{HttpError, InvalidUriKind};
use crate::handlers::{AuthOutcome, RequestHandler};
use crate::policy::{self, RedirectStep};
use crate::request::{BoxError, RequestBody, RequestBuilder, RequestDescriptor};
use crate::response::HttpResponse;
use crate::transport::Transport;
use bytes::Bytes;
use futures::Stream;
use http::header::USER_AGENT;
use http::{HeaderMap, HeaderValue, StatusCode};
use regex::Regex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use url::Url;

pub(crate) struct ClientInner {
    pub(crate) config: HttpClientConfig,
    pub(crate) user_agent: HeaderValue,
    pub(crate) default_headers: HeaderMap,
    pub(crate) handlers: Vec<Arc<dyn RequestHandler>>,
    pub(crate) presigned: Vec<Regex>,
    pub(crate) agents: AgentResolver,
    pub(crate) transport: Arc<dyn Transport>,
    pub(crate) disposed: AtomicBool,
}

/// How one attempt (initial send plus redirect hops) ended.
enum AttemptOutcome {
    /// A handler answered a 401; returned without retry.
    Authenticated(HttpResponse),
    /// Redirects settled; subject to retry.
    Settled(HttpResponse),
}

/// HTTP client with pluggable authentication, redirect following, retries and proxy tunnelling
///
/// Every call goes through one control loop: send, hand a `401` to the
/// first handler that claims it, follow redirects, and retry transient
/// statuses (502, 503, 504) for idempotent verbs. HTTP error statuses are
/// returned as responses; only connection failures, a blocked HTTPS -> HTTP
/// redirect and authentication handshake failures are raised as errors.
///
/// Use [`HttpClientBuilder`] to construct instances with custom configuration.
///
/// # Thread Safety
///
/// `HttpClient` is `Clone + Send + Sync`. Clones share configuration,
/// handlers and cached agents.
///
/// # Example
///
/// ```ignore
/// use modkit_rest_client::{BasicCredentialHandler, HttpClient};
///
/// let client = HttpClient::builder()
///     .handler(BasicCredentialHandler::new("johndoe", "password"))
///     .build()?;
///
/// let body = client.get("https://httpbin.org/get").send().await?.text().await?;
/// ```
#[derive(Clone)]
pub struct HttpClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("user_agent", &self.inner.user_agent)
            .field("handlers", &self.inner.handlers.len())
            .field("agents", &self.inner.agents)
            .field("disposed", &self.inner.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl HttpClient {
    /// Create a new HTTP client with default configuration
    ///
    /// # Errors
    /// Returns an error if TLS initialization fails
    pub fn new() -> Result<Self, HttpError> {
        HttpClientBuilder::new().build()
    }

    /// Create a builder for configuring the HTTP client
    #[must_use]
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    /// Configuration the client was built with
    #[must_use]
    pub fn config(&self) -> &HttpClientConfig {
        &self.inner.config
    }

    /// Create a request builder for any verb
    pub fn request(&self, verb: Verb, url: &str) -> RequestBuilder {
        RequestBuilder::new(self.clone(), verb, url.to_owned())
    }

    /// Create an OPTIONS request builder
    pub fn options(&self, url: &str) -> RequestBuilder {
        self.request(Verb::Options, url)
    }

    /// Create a GET request builder
    ///
    /// # Example
    ///
    /// ```ignore
    /// let resp = client
    ///     .get("https://api.example.com/data")
    ///     .header("accept", "application/json")
    ///     .send()
    ///     .await?;
    /// ```
    pub fn get(&self, url: &str) -> RequestBuilder {
        self.request(Verb::Get, url)
    }

    /// Create a DELETE request builder
    pub fn del(&self, url: &str) -> RequestBuilder {
        self.request(Verb::Delete, url)
    }

    /// Create a POST request builder
    ///
    /// POST is never retried, whatever the retry configuration.
    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Verb::Post, url)
    }

    /// Create a PATCH request builder
    pub fn patch(&self, url: &str) -> RequestBuilder {
        self.request(Verb::Patch, url)
    }

    /// Create a PUT request builder
    pub fn put(&self, url: &str) -> RequestBuilder {
        self.request(Verb::Put, url)
    }

    /// Create a HEAD request builder
    pub fn head(&self, url: &str) -> RequestBuilder {
        self.request(Verb::Head, url)
    }

    /// Create a request builder whose body is streamed from `stream`
    ///
    /// A streamed body is sent once; a redirect, retry or authentication leg
    /// that needs it again fails with [`HttpError::BodyNotReplayable`].
    pub fn send_stream<S, E>(&self, verb: Verb, url: &str, stream: S) -> RequestBuilder
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<BoxError> + 'static,
    {
        self.request(verb, url).stream(stream)
    }

    /// Release cached keep-alive and tunnelling agents.
    ///
    /// Later calls on this client (and its clones) fail with [`HttpError::Disposed`].
    pub fn dispose(&self) {
        if !self.inner.disposed.swap(true, Ordering::AcqRel) {
            self.inner.agents.clear();
            tracing::debug!("client disposed");
        }
    }

    fn ensure_active(&self) -> Result<(), HttpError> {
        if self.inner.disposed.load(Ordering::Acquire) {
            Err(HttpError::Disposed)
        } else {
            Ok(())
        }
    }

    /// Run one call through the authentication, redirect and retry loop.
    ///
    /// `headers` override the client's default headers.
    ///
    /// # Errors
    ///
    /// Connection failures (`Transport`, `Timeout`, `Tls`), `RedirectDowngrade`,
    /// `Authentication`, an invalid URL or header, `BodyNotReplayable`, and
    /// `Disposed`. HTTP statuses, including exhausted retries and redirects, are
    /// returned as responses.
    pub async fn execute(
        &self,
        verb: Verb,
        url: &str,
        body: impl Into<RequestBody>,
        headers: HeaderMap,
    ) -> Result<HttpResponse, HttpError> {
        self.ensure_active()?;
        let body = body.into();
        let retry = &self.inner.config.retry;
        let max_attempts = retry.max_attempts(verb);
        let mut target = parse_url(url)?;
        let mut attempt = 0;

        loop {
            attempt += 1;
            let mut response = match self.attempt(verb, &target, &headers, &body).await {
                Ok(AttemptOutcome::Authenticated(response)) => return Ok(response),
                Ok(AttemptOutcome::Settled(response)) => response,
                Err(e)
                    if e.is_connection_error()
                        && retry.retry_on_connection_error
                        && attempt < max_attempts =>
                {
                    let backoff = retry.backoff.delay(u32::try_from(attempt).unwrap_or(u32::MAX));
                    tracing::debug!(
                        method = verb.as_str(),
                        url = %target,
                        attempt,
                        backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                        error = %e,
                        "retrying after connection error"
                    );
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let Some(backoff) = policy::retry_delay(retry, &response, attempt, max_attempts) else {
                return Ok(response);
            };
            tracing::debug!(
                method = verb.as_str(),
                url = %response.url(),
                status = response.status().as_u16(),
                attempt,
                backoff_ms = u64::try_from(backoff.as_millis()).unwrap_or(u64::MAX),
                "retrying transient status"
            );
            response.drain(retry.drain_limit).await;
            // retries go to the last hop of the redirect chain
            target = response.url().clone();
            tokio::time::sleep(backoff).await;
        }
    }

    /// Initial send of one attempt, then challenge handling or redirect following.
    async fn attempt(
        &self,
        verb: Verb,
        url: &Url,
        headers: &HeaderMap,
        body: &RequestBody,
    ) -> Result<AttemptOutcome, HttpError> {
        let request = self.prepare_request(verb, url.clone(), headers, body.clone())?;
        let response = self.request_raw(&request).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            return self.authenticate(request, response).await.map(AttemptOutcome::Authenticated);
        }

        self.follow_redirects(request, response, headers, body)
            .await
            .map(AttemptOutcome::Settled)
    }

    async fn authenticate(
        &self,
        request: RequestDescriptor,
        challenge: HttpResponse,
    ) -> Result<HttpResponse, HttpError> {
        let Some(handler) = self
            .inner
            .handlers
            .iter()
            .find(|handler| handler.can_handle_authentication(&challenge))
        else {
            return Ok(challenge);
        };

        tracing::debug!(url = %request.url, "delegating 401 challenge to handler");
        match handler.handle_authentication(self, request, &challenge).await {
            AuthOutcome::Response(response) => Ok(response),
            AuthOutcome::Failure(e) => Err(e),
            AuthOutcome::NotApplicable => Ok(challenge),
        }
    }

    async fn follow_redirects(
        &self,
        mut request: RequestDescriptor,
        mut response: HttpResponse,
        headers: &HeaderMap,
        body: &RequestBody,
    ) -> Result<HttpResponse, HttpError> {
        let redirect = &self.inner.config.redirect;
        let mut remaining = redirect.max_redirects;

        while let RedirectStep::Follow(target) =
            policy::next_redirect(redirect, &request.url, &response, remaining)?
        {
            tracing::debug!(
                method = request.verb.as_str(),
                url = %request.url,
                status = response.status().as_u16(),
                location = %target,
                remaining,
                "following redirect"
            );
            response.drain(self.inner.config.retry.drain_limit).await;
            request = self.prepare_request(request.verb, target, headers, body.clone())?;
            response = self.request_raw(&request).await?;
            remaining -= 1;
        }
        Ok(response)
    }

    /// Build the descriptor for one send: merged headers, agent, handler mutation.
    ///
    /// Handlers are skipped for URLs matching a presigned pattern.
    ///
    /// # Errors
    ///
    /// Returns the first error raised by a handler.
    pub fn prepare_request(
        &self,
        verb: Verb,
        url: Url,
        headers: &HeaderMap,
        body: RequestBody,
    ) -> Result<RequestDescriptor, HttpError> {
        let mut merged = self.inner.default_headers.clone();
        for (name, value) in headers {
            merged.insert(name.clone(), value.clone());
        }
        if !merged.contains_key(USER_AGENT) {
            merged.insert(USER_AGENT, self.inner.user_agent.clone());
        }

        let agent = self.inner.agents.resolve(&url);
        let mut request = RequestDescriptor {
            verb,
            url,
            headers: merged,
            body,
            agent,
        };

        if self.is_presigned(&request.url) {
            tracing::trace!(url = %request.url, "presigned url, handlers skipped");
        } else {
            for handler in &self.inner.handlers {
                handler.prepare_request(&mut request)?;
            }
        }
        Ok(request)
    }

    fn is_presigned(&self, url: &Url) -> bool {
        self.inner
            .presigned
            .iter()
            .any(|pattern| pattern.is_match(url.as_str()))
    }

    /// Send one request exactly as described: no handlers, redirects or retries.
    ///
    /// # Errors
    ///
    /// Connection failures, `BodyNotReplayable` and `Disposed`.
    pub async fn request_raw(&self, request: &RequestDescriptor) -> Result<HttpResponse, HttpError> {
        self.ensure_active()?;
        let wire = request.to_request()?;

        let response = self.inner.transport.send(&request.agent, wire).await?;
        tracing::debug!(
            method = request.verb.as_str(),
            url = %request.url,
            status = response.status().as_u16(),
            agent = request.agent.id(),
            "round trip"
        );
        Ok(HttpResponse::new(
            response,
            request.url.clone(),
            self.inner.config.max_body_size,
        )
        .with_read_timeout(self.inner.config.socket_timeout))
    }

    /// Fresh single-connection agent for a handshake against the origin of `url`.
    ///
    /// # Errors
    ///
    /// Returns `HttpError::InvalidUri` if `url` has no usable origin.
    pub fn dedicated_agent(&self, url: &Url) -> Result<Agent, HttpError> {
        self.inner.agents.dedicated(url)
    }
}

/// Parse an absolute `http`/`https` URL.
pub(crate) fn parse_url(url: &str) -> Result<Url, HttpError> {
    let parsed = Url::parse(url).map_err(|e| HttpError::InvalidUri {
        url: url.to_owned(),
        kind: InvalidUriKind::ParseError,
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(HttpError::InvalidUri {
            url: url.to_owned(),
            kind: InvalidUriKind::UnsupportedScheme,
            reason: format!("scheme '{}' is not http or https", parsed.scheme()),
        });
    }
    if parsed.host_str().is_none_or(str::is_empty) {
        return Err(HttpError::InvalidUri {
            url: url.to_owned(),
            kind: InvalidUriKind::MissingAuthority,
            reason: "URL has no host".to_owned(),
        });
    }
    Ok(parsed)
}
