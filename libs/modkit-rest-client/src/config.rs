use crate::credentials::SecretString;
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default User-Agent string for HTTP requests
pub const DEFAULT_USER_AGENT: &str = concat!("modkit-rest-client/", env!("CARGO_PKG_VERSION"));

/// Status codes that are followed as redirects
pub const REDIRECT_CODES: [u16; 5] = [301, 302, 303, 307, 308];

/// Status codes that trigger a retry for idempotent verbs
pub const RETRY_CODES: [u16; 3] = [502, 503, 504];

/// Maximum bytes read from a response body that is discarded between hops
pub const DEFAULT_DRAIN_LIMIT: usize = 64 * 1024;

/// HTTP verbs the client can send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Options,
    Get,
    Delete,
    Post,
    Patch,
    Put,
    Head,
}

impl Verb {
    /// Whether the verb can be retried without risking duplicate side effects.
    ///
    /// Retryable: OPTIONS, GET, DELETE, HEAD. POST, PATCH and PUT are never retried.
    #[must_use]
    pub fn is_idempotent(self) -> bool {
        matches!(self, Verb::Options | Verb::Get | Verb::Delete | Verb::Head)
    }

    #[must_use]
    pub fn as_method(self) -> http::Method {
        match self {
            Verb::Options => http::Method::OPTIONS,
            Verb::Get => http::Method::GET,
            Verb::Delete => http::Method::DELETE,
            Verb::Post => http::Method::POST,
            Verb::Patch => http::Method::PATCH,
            Verb::Put => http::Method::PUT,
            Verb::Head => http::Method::HEAD,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Options => "OPTIONS",
            Verb::Get => "GET",
            Verb::Delete => "DELETE",
            Verb::Post => "POST",
            Verb::Patch => "PATCH",
            Verb::Put => "PUT",
            Verb::Head => "HEAD",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff applied between retry attempts
///
/// Computes delay as: `slice * 2^min(ceiling, attempt)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExponentialBackoff {
    /// Base slice (default: 5ms)
    pub slice: Duration,

    /// Largest exponent applied to the slice (default: 10)
    pub ceiling: u32,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            slice: Duration::from_millis(5),
            ceiling: 10,
        }
    }
}

impl ExponentialBackoff {
    /// Create fast backoff for testing (no delay)
    #[must_use]
    pub fn fast() -> Self {
        Self {
            slice: Duration::ZERO,
            ceiling: 0,
        }
    }

    /// Delay to wait after `attempt` completed attempts.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = self.ceiling.min(attempt);
        self.slice.saturating_mul(1_u32 << exponent.min(31))
    }
}

/// Retry policy configuration
///
/// Only idempotent verbs are retried, and only when a transient status
/// (502, 503, 504) is received. Connection-level failures are retried only
/// when `retry_on_connection_error` is set.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Enable retries (default: false)
    pub allow_retries: bool,

    /// Maximum number of retries after the initial attempt (default: 1)
    /// Total attempts = 1 (initial) + `max_retries`
    #[serde(deserialize_with = "non_negative")]
    pub max_retries: usize,

    /// Also retry idempotent verbs whose attempt failed below the HTTP layer (default: false)
    pub retry_on_connection_error: bool,

    /// Backoff strategy configuration
    #[serde(skip)]
    pub backoff: ExponentialBackoff,

    /// Maximum bytes drained from a discarded response before the next attempt
    #[serde(skip, default = "default_drain_limit")]
    pub drain_limit: usize,
}

fn default_drain_limit() -> usize {
    DEFAULT_DRAIN_LIMIT
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            allow_retries: false,
            max_retries: 1,
            retry_on_connection_error: false,
            backoff: ExponentialBackoff::default(),
            drain_limit: DEFAULT_DRAIN_LIMIT,
        }
    }
}

impl RetryConfig {
    /// Create a retry configuration that retries idempotent verbs `max_retries` times
    #[must_use]
    pub fn enabled(max_retries: usize) -> Self {
        Self {
            allow_retries: true,
            max_retries,
            ..Default::default()
        }
    }

    /// Number of attempts a call with `verb` may make.
    ///
    /// `max_retries + 1` when retries are enabled and the verb is idempotent, otherwise 1.
    #[must_use]
    pub fn max_attempts(&self, verb: Verb) -> usize {
        if self.allow_retries && verb.is_idempotent() {
            self.max_retries.saturating_add(1)
        } else {
            1
        }
    }

    /// Whether a received status triggers another attempt
    #[must_use]
    pub fn is_retryable_status(status: http::StatusCode) -> bool {
        RETRY_CODES.contains(&status.as_u16())
    }
}

/// Redirect policy configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedirectConfig {
    /// Follow redirects (default: true)
    pub allow_redirects: bool,

    /// Allow HTTPS -> HTTP downgrades (default: false)
    ///
    /// When `false`, a redirect from an https URL to an http URL fails the call
    /// before the downgraded request is sent.
    pub allow_redirect_downgrade: bool,

    /// Maximum number of redirects to follow (default: 50, negative values clamp to 0)
    #[serde(deserialize_with = "non_negative")]
    pub max_redirects: usize,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            allow_redirects: true,
            allow_redirect_downgrade: false,
            max_redirects: 50,
        }
    }
}

impl RedirectConfig {
    /// Create a configuration that disables redirect following
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            allow_redirects: false,
            ..Default::default()
        }
    }

    /// Whether a status code is followed as a redirect
    #[must_use]
    pub fn is_redirect_status(status: http::StatusCode) -> bool {
        REDIRECT_CODES.contains(&status.as_u16())
    }
}

/// TLS root certificate configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Use Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// Use OS native root certificate store
    Native,
}

/// Explicit proxy configuration
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProxyConfig {
    /// Proxy URL, e.g. `http://proxy.corp:8080` or `https://proxy.corp`
    pub proxy_url: String,

    pub proxy_username: Option<String>,

    pub proxy_password: Option<SecretString>,

    /// Regular expressions matched against the target host; matches bypass the proxy
    pub proxy_bypass_hosts: Vec<String>,
}

impl ProxyConfig {
    #[must_use]
    pub fn new(proxy_url: impl Into<String>) -> Self {
        Self {
            proxy_url: proxy_url.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.proxy_username = Some(username.into());
        self.proxy_password = Some(SecretString::new(password));
        self
    }

    #[must_use]
    pub fn with_bypass_hosts<I, S>(mut self, hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.proxy_bypass_hosts = hosts.into_iter().map(Into::into).collect();
        self
    }
}

/// TLS trust and client identity material, loaded from PEM files at construction
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertConfig {
    /// Additional CA bundle trusted on top of the configured roots
    pub ca_file: Option<PathBuf>,

    /// Client certificate chain presented to servers
    pub cert_file: Option<PathBuf>,

    /// Private key for `cert_file`
    pub key_file: Option<PathBuf>,

    /// Passphrase for an encrypted `key_file` (encrypted keys are rejected, see `DESIGN.md`)
    pub passphrase: Option<SecretString>,
}

/// Overall REST client configuration
///
/// Deserializes from the camelCase option names (`ignoreSslError`,
/// `socketTimeoutMs`, `allowRedirects`, `maxRetries`, ...). Every field has a
/// default, so an empty object is a valid configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpClientConfig {
    /// Skip server certificate verification (default: false)
    ///
    /// **WARNING**: Only use against test servers with self-signed certificates.
    pub ignore_ssl_error: bool,

    /// Per round-trip socket timeout (default: 3 minutes)
    ///
    /// Each hop, retry attempt and NTLM leg gets its own timeout.
    #[serde(rename = "socketTimeoutMs", deserialize_with = "duration_from_ms")]
    pub socket_timeout: Duration,

    /// Explicit proxy; when absent `HTTPS_PROXY`/`HTTP_PROXY` are consulted
    pub proxy: Option<ProxyConfig>,

    /// TLS trust/identity material
    pub cert: Option<CertConfig>,

    /// Redirect policy configuration
    #[serde(flatten)]
    pub redirect: RedirectConfig,

    /// Retry policy configuration
    #[serde(flatten)]
    pub retry: RetryConfig,

    /// Maximum connections per host for keep-alive agents (default: 100)
    pub max_sockets: usize,

    /// Reuse connections through cached agents (default: false)
    pub keep_alive: bool,

    /// Regular expressions for URLs that already carry their own authorization.
    ///
    /// Requests to matching URLs skip every handler's `prepare_request`.
    pub presigned_url_patterns: Vec<String>,

    /// Headers added to every request (request headers win on conflict)
    pub headers: BTreeMap<String, String>,

    /// TLS root certificate strategy (default: `WebPki`)
    pub tls_roots: TlsRootConfig,

    /// Maximum response body size in bytes (default: 10 MB)
    pub max_body_size: usize,

    /// Timeout for idle connections in keep-alive pools (default: 90 seconds)
    #[serde(skip)]
    pub pool_idle_timeout: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            ignore_ssl_error: false,
            socket_timeout: Duration::from_secs(3 * 60),
            proxy: None,
            cert: None,
            redirect: RedirectConfig::default(),
            retry: RetryConfig::default(),
            max_sockets: 100,
            keep_alive: false,
            presigned_url_patterns: Vec::new(),
            headers: BTreeMap::new(),
            tls_roots: TlsRootConfig::default(),
            max_body_size: 10 * 1024 * 1024, // 10 MB
            pool_idle_timeout: Some(Duration::from_secs(90)),
        }
    }
}

impl HttpClientConfig {
    /// Create a configuration for testing against local mock servers
    ///
    /// Short timeout, downgrades allowed, no backoff delay.
    ///
    /// **WARNING**: Only use for local testing with mock servers.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            socket_timeout: Duration::from_secs(10),
            redirect: RedirectConfig {
                allow_redirect_downgrade: true,
                ..Default::default()
            },
            retry: RetryConfig {
                backoff: ExponentialBackoff::fast(),
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

fn non_negative<'de, D>(deserializer: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let value = i64::deserialize(deserializer)?;
    Ok(usize::try_from(value.max(0)).unwrap_or(usize::MAX))
}

fn duration_from_ms<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}
