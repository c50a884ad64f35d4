//! Agents (connection-pool policies) and the resolver that picks one per request.
//!
//! An [`Agent`] is what a request is sent through: the client's global pool,
//! a cached keep-alive pool, a proxy-tunnelling pool, or a dedicated single
//! connection reserved for a connection-oriented authentication handshake.
//!
//! [`AgentResolver`] caches keep-alive and tunnelling agents keyed by the full
//! `(scheme, keep-alive, proxy, TLS fingerprint)` tuple, so the TLS settings of
//! one target never leak into an agent used for another.

use crate::config::HttpClientConfig;
use crate::connector::{ProxyEndpoint, TunnelConnector};
use crate::env::{self, EnvironmentLookup};
use crate::error::{HttpError, InvalidUriKind};
use crate::request::WireBody;
use crate::tls::TlsSettings;
use http::{Request, Response, Uri};
use hyper::body::Incoming;
use hyper::client::conn::http1::SendRequest;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use parking_lot::Mutex;
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tower::ServiceExt;
use url::Url;

static NEXT_AGENT_ID: AtomicU64 = AtomicU64::new(1);

type PooledClient = Client<HttpsConnector<TunnelConnector>, WireBody>;

/// Connection-pool policy an agent implements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AgentKind {
    /// Client-wide pool without connection reuse
    Global,
    /// Cached pool reusing connections
    KeepAlive,
    /// Pool whose connections are CONNECT tunnels through a proxy
    Tunnel,
    /// One connection, reserved for a single handshake
    Dedicated,
}

#[derive(Clone)]
enum AgentInner {
    Pooled(PooledClient),
    Dedicated(Arc<DedicatedAgent>),
}

/// Handle to a connection-pool policy. Cheap to clone; clones are the same agent.
#[derive(Clone)]
pub struct Agent {
    id: u64,
    kind: AgentKind,
    inner: AgentInner,
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl Agent {
    fn pooled(kind: AgentKind, client: PooledClient) -> Self {
        Self {
            id: NEXT_AGENT_ID.fetch_add(1, Ordering::Relaxed),
            kind,
            inner: AgentInner::Pooled(client),
        }
    }

    fn dedicated(agent: DedicatedAgent) -> Self {
        Self {
            id: NEXT_AGENT_ID.fetch_add(1, Ordering::Relaxed),
            kind: AgentKind::Dedicated,
            inner: AgentInner::Dedicated(Arc::new(agent)),
        }
    }

    /// Process-unique identity of this agent.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[must_use]
    pub fn kind(&self) -> AgentKind {
        self.kind
    }

    /// Whether `other` is the very same agent (not merely the same kind).
    #[must_use]
    pub fn same_as(&self, other: &Agent) -> bool {
        self.id == other.id
    }

    /// For dedicated agents: whether the single connection has been opened and reserved.
    #[must_use]
    pub fn is_reserved(&self) -> bool {
        match &self.inner {
            AgentInner::Dedicated(agent) => agent.reserved.load(Ordering::Acquire),
            AgentInner::Pooled(_) => false,
        }
    }

    /// Stand-in for a transport that opened the dedicated connection.
    #[cfg(test)]
    pub(crate) fn mark_reserved(&self) {
        if let AgentInner::Dedicated(agent) = &self.inner {
            agent.reserved.store(true, Ordering::Release);
        }
    }

    /// Global agent of a throwaway resolver, for tests that never send through it.
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        let tls = Arc::new(
            TlsSettings::new(crate::config::TlsRootConfig::WebPki, false, None).unwrap(),
        );
        let env = crate::env::StaticEnvironment::new();
        AgentResolver::new(&HttpClientConfig::default(), &env, tls)
            .unwrap()
            .resolve(&Url::parse("http://localhost/").unwrap())
    }

    pub(crate) async fn send(
        &self,
        request: Request<WireBody>,
    ) -> Result<Response<Incoming>, HttpError> {
        match &self.inner {
            AgentInner::Pooled(client) => Ok(client.request(request).await?),
            AgentInner::Dedicated(agent) => agent.send(request).await,
        }
    }
}

/// Single HTTP/1.1 connection shared by every leg of one handshake.
///
/// The connection is opened lazily by the first request and then reserved:
/// later requests reuse it and never open a second one. If the peer closes
/// it, later legs fail instead of silently reconnecting.
struct DedicatedAgent {
    connector: HttpsConnector<TunnelConnector>,
    origin: Uri,
    sender: tokio::sync::Mutex<Option<SendRequest<WireBody>>>,
    reserved: AtomicBool,
}

impl DedicatedAgent {
    async fn send(&self, mut request: Request<WireBody>) -> Result<Response<Incoming>, HttpError> {
        let mut sender = self.sender.lock().await;

        if sender.as_ref().is_none_or(SendRequest::is_closed) {
            if self.reserved.load(Ordering::Acquire) {
                return Err(HttpError::authentication(
                    "dedicated connection was closed between handshake legs",
                ));
            }
            let io = self
                .connector
                .clone()
                .oneshot(self.origin.clone())
                .await
                .map_err(HttpError::Transport)?;
            let (send_request, connection) = hyper::client::conn::http1::handshake(io).await?;
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    tracing::debug!(error = %e, "dedicated connection ended with error");
                }
            });
            *sender = Some(send_request);
            self.reserved.store(true, Ordering::Release);
            tracing::trace!(origin = %self.origin, "dedicated connection opened and reserved");
        }

        let Some(send_request) = sender.as_mut() else {
            return Err(HttpError::authentication("dedicated connection unavailable"));
        };
        send_request.ready().await?;

        into_origin_form(&mut request)?;
        Ok(send_request.send_request(request).await?)
    }
}

/// Rewrite an absolute request URI into origin-form and set `Host`.
fn into_origin_form(request: &mut Request<WireBody>) -> Result<(), HttpError> {
    let uri = request.uri().clone();
    if let Some(authority) = uri.authority()
        && !request.headers().contains_key(http::header::HOST)
    {
        let host = http::HeaderValue::from_str(authority.as_str())?;
        request.headers_mut().insert(http::header::HOST, host);
    }
    let path = uri
        .path_and_query()
        .map_or("/", http::uri::PathAndQuery::as_str)
        .to_owned();
    *request.uri_mut() = Uri::try_from(path).map_err(http::Error::from)?;
    Ok(())
}

/// Cache key for keep-alive and tunnelling agents.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct AgentKey {
    https: bool,
    keep_alive: bool,
    proxy: Option<Arc<ProxyEndpoint>>,
    tls: Option<[u8; 32]>,
}

/// Selects or lazily constructs the agent for a target URL.
pub(crate) struct AgentResolver {
    keep_alive: bool,
    max_sockets: usize,
    socket_timeout: Duration,
    pool_idle_timeout: Option<Duration>,
    https_proxy: Option<Arc<ProxyEndpoint>>,
    http_proxy: Option<Arc<ProxyEndpoint>>,
    bypass: Vec<Regex>,
    tls: Arc<TlsSettings>,
    cache: Mutex<HashMap<AgentKey, Agent>>,
    global: OnceLock<Agent>,
}

impl fmt::Debug for AgentResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentResolver")
            .field("keep_alive", &self.keep_alive)
            .field("https_proxy", &self.https_proxy)
            .field("http_proxy", &self.http_proxy)
            .field("bypass", &self.bypass.len())
            .field("cached", &self.cache.lock().len())
            .finish_non_exhaustive()
    }
}

impl AgentResolver {
    /// Resolve proxy settings (explicit or from `env`) and compile bypass patterns.
    ///
    /// # Errors
    ///
    /// Returns `HttpError::Config` for an invalid proxy URL or bypass pattern.
    pub(crate) fn new(
        config: &HttpClientConfig,
        env: &dyn EnvironmentLookup,
        tls: Arc<TlsSettings>,
    ) -> Result<Self, HttpError> {
        let resolve = |https: bool| -> Result<Option<Arc<ProxyEndpoint>>, HttpError> {
            env::effective_proxy(config.proxy.as_ref(), env, https)
                .map(|proxy| ProxyEndpoint::from_config(&proxy))
                .transpose()
                .map(|endpoint| endpoint.flatten().map(Arc::new))
        };
        let https_proxy = resolve(true)?;
        let http_proxy = resolve(false)?;

        let configured_bypass = config
            .proxy
            .as_ref()
            .map(|p| p.proxy_bypass_hosts.clone())
            .unwrap_or_default();
        let patterns = if configured_bypass.is_empty() {
            env::no_proxy_patterns(env)
        } else {
            configured_bypass
        };
        let bypass = compile_patterns(&patterns, "proxy bypass")?;

        Ok(Self {
            keep_alive: config.keep_alive,
            max_sockets: config.max_sockets,
            socket_timeout: config.socket_timeout,
            pool_idle_timeout: config.pool_idle_timeout,
            https_proxy,
            http_proxy,
            bypass,
            tls,
            cache: Mutex::new(HashMap::new()),
            global: OnceLock::new(),
        })
    }

    fn is_bypassed(&self, url: &Url) -> bool {
        self.bypass.iter().any(|re| re.is_match(url.as_str()))
    }

    /// Agent for `url`.
    ///
    /// Decision order: a cached keep-alive agent for the same key; a tunnelling
    /// agent when a proxy applies and the URL is not bypassed; a new cached
    /// keep-alive agent; the client's global agent.
    pub(crate) fn resolve(&self, url: &Url) -> Agent {
        let https = url.scheme() == "https";
        let proxy = if https {
            self.https_proxy.as_ref()
        } else {
            self.http_proxy.as_ref()
        }
        .filter(|_| !self.is_bypassed(url))
        .cloned();

        let key = AgentKey {
            https,
            keep_alive: self.keep_alive,
            proxy: proxy.clone(),
            tls: https.then(|| self.tls.fingerprint()),
        };

        if self.keep_alive
            && let Some(agent) = self.cache.lock().get(&key)
        {
            tracing::trace!(agent = agent.id, kind = ?agent.kind, url = %url, "reusing cached agent");
            return agent.clone();
        }

        let agent = if let Some(proxy) = proxy {
            let agent = self.build_pooled(AgentKind::Tunnel, Some(proxy));
            if self.keep_alive {
                self.cache.lock().entry(key).or_insert(agent).clone()
            } else {
                agent
            }
        } else if self.keep_alive {
            let agent = self.build_pooled(AgentKind::KeepAlive, None);
            self.cache.lock().entry(key).or_insert(agent).clone()
        } else {
            self.global
                .get_or_init(|| self.build_pooled(AgentKind::Global, None))
                .clone()
        };

        tracing::trace!(agent = agent.id, kind = ?agent.kind, url = %url, "resolved agent");
        agent
    }

    /// Fresh dedicated agent for the origin of `url`. Always connects directly.
    pub(crate) fn dedicated(&self, url: &Url) -> Result<Agent, HttpError> {
        let origin = url.origin().ascii_serialization();
        let origin = Uri::try_from(origin.as_str()).map_err(|e| HttpError::InvalidUri {
            url: url.to_string(),
            kind: InvalidUriKind::MissingAuthority,
            reason: e.to_string(),
        })?;

        Ok(Agent::dedicated(DedicatedAgent {
            connector: self.https_connector(None),
            origin,
            sender: tokio::sync::Mutex::new(None),
            reserved: AtomicBool::new(false),
        }))
    }

    /// Drop every cached agent. Idle pooled connections close once the last clone is gone.
    pub(crate) fn clear(&self) {
        let dropped = {
            let mut cache = self.cache.lock();
            let count = cache.len();
            cache.clear();
            count
        };
        tracing::debug!(dropped, "cleared cached agents");
    }

    fn https_connector(&self, proxy: Option<Arc<ProxyEndpoint>>) -> HttpsConnector<TunnelConnector> {
        let tunnel =
            TunnelConnector::new(proxy, self.tls.proxy_client_config(), self.socket_timeout);
        hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config((*self.tls.client_config()).clone())
            .https_or_http()
            .enable_http1()
            .wrap_connector(tunnel)
    }

    fn build_pooled(&self, kind: AgentKind, proxy: Option<Arc<ProxyEndpoint>>) -> Agent {
        let mut builder = Client::builder(TokioExecutor::new());

        // pool_timer is required for pool_idle_timeout to take effect
        builder.pool_timer(TokioTimer::new());
        builder.pool_max_idle_per_host(match kind {
            AgentKind::Global => 0,
            _ => self.max_sockets,
        });
        if let Some(idle_timeout) = self.pool_idle_timeout {
            builder.pool_idle_timeout(idle_timeout);
        }

        let agent = Agent::pooled(kind, builder.build(self.https_connector(proxy)));
        tracing::debug!(agent = agent.id, kind = ?kind, "created agent");
        agent
    }

    #[cfg(test)]
    pub(crate) fn cached_agents(&self) -> usize {
        self.cache.lock().len()
    }
}

/// Compile case-insensitive patterns, failing on the first invalid one.
pub(crate) fn compile_patterns(patterns: &[String], what: &str) -> Result<Vec<Regex>, HttpError> {
    patterns
        .iter()
        .map(|pattern| {
            RegexBuilder::new(pattern)
                .case_insensitive(true)
                .build()
                .map_err(|e| HttpError::Config(format!("invalid {what} pattern '{pattern}': {e}")))
        })
        .collect()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::{ProxyConfig, TlsRootConfig};
    use crate::env::{HTTP_PROXY, HTTPS_PROXY, NO_PROXY, StaticEnvironment};

    fn resolver(config: &HttpClientConfig, env: &StaticEnvironment) -> AgentResolver {
        let tls = Arc::new(TlsSettings::new(TlsRootConfig::WebPki, false, None).unwrap());
        AgentResolver::new(config, env, tls).unwrap()
    }

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_global_agent_shared_without_keep_alive() {
        let r = resolver(&HttpClientConfig::default(), &StaticEnvironment::new());

        let a = r.resolve(&url("http://a.example/"));
        let b = r.resolve(&url("https://b.example/"));

        assert_eq!(a.kind(), AgentKind::Global);
        assert!(a.same_as(&b));
        assert_eq!(r.cached_agents(), 0);
    }

    #[tokio::test]
    async fn test_keep_alive_agents_cached_per_scheme() {
        let config = HttpClientConfig {
            keep_alive: true,
            ..Default::default()
        };
        let r = resolver(&config, &StaticEnvironment::new());

        let first = r.resolve(&url("https://a.example/x"));
        let second = r.resolve(&url("https://b.example/y"));
        let plain = r.resolve(&url("http://a.example/x"));

        assert_eq!(first.kind(), AgentKind::KeepAlive);
        assert!(first.same_as(&second));
        assert!(!first.same_as(&plain));
        assert_eq!(r.cached_agents(), 2);

        r.clear();
        assert_eq!(r.cached_agents(), 0);
        assert!(!r.resolve(&url("https://a.example/x")).same_as(&first));
    }

    #[tokio::test]
    async fn test_proxy_agent_fresh_without_keep_alive() {
        let config = HttpClientConfig {
            proxy: Some(ProxyConfig::new("http://proxy.local:3128")),
            ..Default::default()
        };
        let r = resolver(&config, &StaticEnvironment::new());

        let a = r.resolve(&url("https://api.example/"));
        let b = r.resolve(&url("https://api.example/"));
        assert_eq!(a.kind(), AgentKind::Tunnel);
        assert!(!a.same_as(&b));
    }

    #[tokio::test]
    async fn test_proxy_agent_cached_with_keep_alive() {
        let config = HttpClientConfig {
            keep_alive: true,
            proxy: Some(ProxyConfig::new("http://proxy.local:3128")),
            ..Default::default()
        };
        let r = resolver(&config, &StaticEnvironment::new());

        let a = r.resolve(&url("https://api.example/"));
        let b = r.resolve(&url("https://other.example/"));
        assert_eq!(a.kind(), AgentKind::Tunnel);
        assert!(a.same_as(&b));
    }

    #[tokio::test]
    async fn test_bypass_hosts_skip_proxy() {
        let config = HttpClientConfig {
            proxy: Some(
                ProxyConfig::new("http://proxy.local:3128").with_bypass_hosts([r"\.internal"]),
            ),
            ..Default::default()
        };
        let r = resolver(&config, &StaticEnvironment::new());

        assert_eq!(
            r.resolve(&url("https://svc.INTERNAL/health")).kind(),
            AgentKind::Global
        );
        assert_eq!(
            r.resolve(&url("https://api.example/")).kind(),
            AgentKind::Tunnel
        );
    }

    #[tokio::test]
    async fn test_environment_proxy_and_no_proxy() {
        let env = StaticEnvironment::new()
            .with(HTTPS_PROXY, "http://secure-proxy:3128")
            .with(NO_PROXY, "*.corp.example");
        let r = resolver(&HttpClientConfig::default(), &env);

        assert_eq!(
            r.resolve(&url("https://api.example/")).kind(),
            AgentKind::Tunnel
        );
        assert_eq!(
            r.resolve(&url("https://git.corp.example/")).kind(),
            AgentKind::Global
        );
        // HTTPS_PROXY does not apply to plain http targets
        assert_eq!(
            r.resolve(&url("http://api.example/")).kind(),
            AgentKind::Global
        );
    }

    #[tokio::test]
    async fn test_configured_bypass_wins_over_no_proxy() {
        let env = StaticEnvironment::new()
            .with(HTTP_PROXY, "http://env-proxy:3128")
            .with(NO_PROXY, "api.example");
        let config = HttpClientConfig {
            proxy: Some(ProxyConfig::new("http://proxy:1").with_bypass_hosts(["other"])),
            ..Default::default()
        };
        let r = resolver(&config, &env);

        assert_eq!(
            r.resolve(&url("http://api.example/")).kind(),
            AgentKind::Tunnel
        );
    }

    #[test]
    fn test_invalid_bypass_pattern_is_config_error() {
        let config = HttpClientConfig {
            proxy: Some(ProxyConfig::new("http://proxy:1").with_bypass_hosts(["(unclosed"])),
            ..Default::default()
        };
        let tls = Arc::new(TlsSettings::new(TlsRootConfig::WebPki, false, None).unwrap());
        let err = AgentResolver::new(&config, &StaticEnvironment::new(), tls).unwrap_err();
        assert!(matches!(err, HttpError::Config(_)));
    }

    #[tokio::test]
    async fn test_dedicated_agents_are_distinct_and_unreserved() {
        let r = resolver(&HttpClientConfig::default(), &StaticEnvironment::new());
        let a = r.dedicated(&url("https://ntlm.example/api")).unwrap();
        let b = r.dedicated(&url("https://ntlm.example/api")).unwrap();

        assert_eq!(a.kind(), AgentKind::Dedicated);
        assert!(!a.same_as(&b));
        assert!(!a.is_reserved());
    }

    #[test]
    fn test_origin_form_sets_host() {
        let mut request = Request::builder()
            .uri("http://example.com:8080/a/b?q=1")
            .body(crate::request::RequestBody::Empty.to_wire().unwrap())
            .unwrap();
        into_origin_form(&mut request).unwrap();

        assert_eq!(request.uri().to_string(), "/a/b?q=1");
        assert_eq!(request.headers()[http::header::HOST], "example.com:8080");
    }
}
