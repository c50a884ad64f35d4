use crate::agent::{AgentResolver, compile_patterns};
use crate::client::{ClientInner, HttpClient};
use crate::config::{
    CertConfig, DEFAULT_USER_AGENT, HttpClientConfig, ProxyConfig, RedirectConfig, RetryConfig,
    TlsRootConfig,
};
use crate::env::{EnvironmentLookup, ProcessEnvironment};
use crate::error::HttpError;
use crate::handlers::RequestHandler;
use crate::tls::TlsSettings;
use crate::transport::{HyperTransport, Transport};
use http::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

/// Builder for constructing an [`HttpClient`].
///
/// Handlers run in registration order when a request is prepared, and the
/// first handler claiming a `401` answers it.
pub struct HttpClientBuilder {
    config: HttpClientConfig,
    user_agent: String,
    handlers: Vec<Arc<dyn RequestHandler>>,
    environment: Arc<dyn EnvironmentLookup>,
    transport: Option<Arc<dyn Transport>>,
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClientBuilder {
    /// Create a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(HttpClientConfig::default())
    }

    /// Create a builder with a specific configuration
    #[must_use]
    pub fn with_config(config: HttpClientConfig) -> Self {
        Self {
            config,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            handlers: Vec::new(),
            environment: Arc::new(ProcessEnvironment),
            transport: None,
        }
    }

    /// Replace the whole configuration
    #[must_use]
    pub fn config(mut self, config: HttpClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the user agent string
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Register an authentication handler
    #[must_use]
    pub fn handler(self, handler: impl RequestHandler + 'static) -> Self {
        self.handler_arc(Arc::new(handler))
    }

    /// Register an authentication handler shared with other clients
    #[must_use]
    pub fn handler_arc(mut self, handler: Arc<dyn RequestHandler>) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Set the per round-trip socket timeout
    #[must_use]
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket_timeout = timeout;
        self
    }

    /// Set the retry configuration
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Set the redirect configuration
    #[must_use]
    pub fn redirect(mut self, redirect: RedirectConfig) -> Self {
        self.config.redirect = redirect;
        self
    }

    /// Disable redirect following
    ///
    /// 3xx responses are returned to the caller as they are.
    #[must_use]
    pub fn no_redirects(mut self) -> Self {
        self.config.redirect = RedirectConfig::disabled();
        self
    }

    /// Route requests through an explicit proxy
    ///
    /// Overrides `HTTPS_PROXY`, `HTTP_PROXY` and `NO_PROXY`.
    #[must_use]
    pub fn proxy(mut self, proxy: ProxyConfig) -> Self {
        self.config.proxy = Some(proxy);
        self
    }

    /// Extra CA bundle and client certificate
    #[must_use]
    pub fn cert(mut self, cert: CertConfig) -> Self {
        self.config.cert = Some(cert);
        self
    }

    /// Set the root certificate source
    #[must_use]
    pub fn tls_roots(mut self, roots: TlsRootConfig) -> Self {
        self.config.tls_roots = roots;
        self
    }

    /// Accept any server certificate
    ///
    /// **WARNING**: only for test servers with self-signed certificates.
    #[must_use]
    pub fn ignore_ssl_error(mut self, ignore: bool) -> Self {
        self.config.ignore_ssl_error = ignore;
        self
    }

    /// Reuse connections through cached keep-alive agents
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.config.keep_alive = keep_alive;
        self
    }

    /// Idle connections kept per host by keep-alive agents
    #[must_use]
    pub fn max_sockets(mut self, max: usize) -> Self {
        self.config.max_sockets = max;
        self
    }

    /// Set the maximum response body size
    #[must_use]
    pub fn max_body_size(mut self, size: usize) -> Self {
        self.config.max_body_size = size;
        self
    }

    /// Add a header sent with every request unless the request sets it
    #[must_use]
    pub fn default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(name.into(), value.into());
        self
    }

    /// URLs matching `pattern` (case-insensitive regex) skip every handler
    #[must_use]
    pub fn presigned_url_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.config.presigned_url_patterns.push(pattern.into());
        self
    }

    /// Where `HTTPS_PROXY`, `HTTP_PROXY` and `NO_PROXY` are read from
    ///
    /// Defaults to the process environment.
    #[must_use]
    pub fn environment(mut self, environment: impl EnvironmentLookup + 'static) -> Self {
        self.environment = Arc::new(environment);
        self
    }

    /// Replace the hyper transport
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the HTTP client
    ///
    /// # Errors
    ///
    /// - `HttpError::InvalidHeaderName` / `InvalidHeaderValue` for a bad user
    ///   agent or default header
    /// - `HttpError::Config` for an invalid pattern, proxy URL or certificate file
    /// - `HttpError::Tls` if rustls rejects the certificate material
    pub fn build(self) -> Result<HttpClient, HttpError> {
        let user_agent = HeaderValue::try_from(self.user_agent.as_str())?;
        let default_headers = default_headers(&self.config)?;
        let presigned = compile_patterns(&self.config.presigned_url_patterns, "presigned url")?;

        let tls = Arc::new(TlsSettings::new(
            self.config.tls_roots,
            self.config.ignore_ssl_error,
            self.config.cert.as_ref(),
        )?);
        let agents = AgentResolver::new(&self.config, self.environment.as_ref(), tls)?;
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(HyperTransport::new(self.config.socket_timeout)));

        tracing::debug!(
            handlers = self.handlers.len(),
            keep_alive = self.config.keep_alive,
            retries = self.config.retry.allow_retries,
            redirects = self.config.redirect.allow_redirects,
            "http client built"
        );

        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                config: self.config,
                user_agent,
                default_headers,
                handlers: self.handlers,
                presigned,
                agents,
                transport,
                disposed: AtomicBool::new(false),
            }),
        })
    }
}

fn default_headers(config: &HttpClientConfig) -> Result<HeaderMap, HttpError> {
    let mut headers = HeaderMap::with_capacity(config.headers.len());
    for (name, value) in &config.headers {
        headers.insert(
            HeaderName::from_bytes(name.as_bytes())?,
            HeaderValue::from_str(value)?,
        );
    }
    Ok(headers)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::env::StaticEnvironment;
    use crate::handlers::BearerCredentialHandler;

    #[test]
    fn test_builder_default() {
        let builder = HttpClientBuilder::new();
        assert_eq!(builder.config.socket_timeout, Duration::from_secs(180));
        assert_eq!(builder.user_agent, DEFAULT_USER_AGENT);
        assert!(!builder.config.retry.allow_retries);
        assert!(builder.config.redirect.allow_redirects);
        assert!(builder.handlers.is_empty());
    }

    #[test]
    fn test_builder_setters() {
        let builder = HttpClientBuilder::new()
            .socket_timeout(Duration::from_secs(5))
            .keep_alive(true)
            .max_sockets(8)
            .no_redirects()
            .default_header("X-Tenant", "acme")
            .presigned_url_pattern("X-Amz-Signature=")
            .handler(BearerCredentialHandler::new("t"));

        assert_eq!(builder.config.socket_timeout, Duration::from_secs(5));
        assert!(builder.config.keep_alive);
        assert_eq!(builder.config.max_sockets, 8);
        assert!(!builder.config.redirect.allow_redirects);
        assert_eq!(builder.config.headers["X-Tenant"], "acme");
        assert_eq!(builder.config.presigned_url_patterns.len(), 1);
        assert_eq!(builder.handlers.len(), 1);
    }

    #[test]
    fn test_build_rejects_invalid_presigned_pattern() {
        let err = HttpClientBuilder::new()
            .presigned_url_pattern("(unclosed")
            .build()
            .unwrap_err();
        assert!(matches!(err, HttpError::Config(ref msg) if msg.contains("presigned url")));
    }

    #[test]
    fn test_build_rejects_invalid_default_header() {
        let err = HttpClientBuilder::new()
            .default_header("bad header", "v")
            .build()
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidHeaderName(_)));

        let err = HttpClientBuilder::new()
            .user_agent("line\nbreak")
            .build()
            .unwrap_err();
        assert!(matches!(err, HttpError::InvalidHeaderValue(_)));
    }

    #[test]
    fn test_build_rejects_invalid_proxy_url() {
        let result = HttpClientBuilder::new()
            .proxy(ProxyConfig::new("not a url"))
            .build();
        assert!(matches!(result, Err(HttpError::Config(_))));
    }

    #[test]
    fn test_build_with_native_roots() {
        let result = HttpClientBuilder::new()
            .tls_roots(TlsRootConfig::Native)
            .build();
        // hosts without any native roots fail with Tls, never with a panic
        assert!(matches!(result, Ok(_) | Err(HttpError::Tls(_))));
    }

    #[tokio::test]
    async fn test_ignore_ssl_error_warning_emitted() {
        use std::sync::Mutex;
        use tracing_subscriber::layer::SubscriberExt;

        #[derive(Clone, Default)]
        struct WarningCapture {
            warnings: Arc<Mutex<Vec<String>>>,
        }

        impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarningCapture {
            fn on_event(
                &self,
                event: &tracing::Event<'_>,
                _ctx: tracing_subscriber::layer::Context<'_, S>,
            ) {
                if *event.metadata().level() == tracing::Level::WARN {
                    let mut visitor = MessageVisitor(String::new());
                    event.record(&mut visitor);
                    self.warnings.lock().unwrap().push(visitor.0);
                }
            }
        }

        struct MessageVisitor(String);
        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                if field.name() == "message" {
                    self.0 = format!("{value:?}");
                }
            }
        }

        let capture = WarningCapture::default();
        let warnings = Arc::clone(&capture.warnings);
        let subscriber = tracing_subscriber::registry().with(capture);

        tracing::subscriber::with_default(subscriber, || {
            _ = HttpClientBuilder::new()
                .environment(StaticEnvironment::new())
                .ignore_ssl_error(true)
                .build();
        });

        let captured = warnings.lock().unwrap();
        assert!(
            captured.iter().any(|w| w.contains("verification is disabled")),
            "expected an insecure TLS warning, got: {:?}",
            *captured
        );
    }
}
