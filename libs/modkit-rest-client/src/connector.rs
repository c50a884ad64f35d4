//! TCP connector with optional HTTP CONNECT tunnelling through a proxy.
//!
//! [`TunnelConnector`] is the innermost `tower::Service<Uri>` of every agent.
//! Without a proxy it dials the target directly. With a proxy it dials the
//! proxy (over TLS when the proxy URL is `https:`), issues `CONNECT host:port`
//! and hands the established tunnel to `hyper-rustls`, which then performs the
//! TLS handshake with the target for `https:` URLs. Every scheme pair
//! (http-over-http, https-over-http, http-over-https, https-over-https) goes
//! through the same tunnel.

use crate::config::ProxyConfig;
use crate::error::{HttpError, InvalidUriKind};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::Uri;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::rt::TokioIo;
use rustls_pki_types::ServerName;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tower::ServiceExt;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Largest CONNECT response head accepted from a proxy.
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;

/// Resolved proxy: where to dial and how to authenticate.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ProxyEndpoint {
    host: String,
    port: u16,
    over_tls: bool,
    authorization: Option<String>,
}

impl fmt::Debug for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("over_tls", &self.over_tls)
            .field("authorization", &self.authorization.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl ProxyEndpoint {
    /// Resolve a proxy configuration.
    ///
    /// Returns `Ok(None)` when the proxy URL is empty or has no host, which
    /// means "no proxy" rather than an error.
    ///
    /// # Errors
    ///
    /// Returns `HttpError::Config` if the proxy URL cannot be parsed or uses a
    /// scheme other than `http`/`https`.
    pub fn from_config(config: &ProxyConfig) -> Result<Option<Self>, HttpError> {
        let raw = config.proxy_url.trim();
        if raw.is_empty() {
            return Ok(None);
        }

        let url = url::Url::parse(raw)
            .map_err(|e| HttpError::Config(format!("invalid proxy URL '{raw}': {e}")))?;
        let over_tls = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(HttpError::Config(format!(
                    "unsupported proxy scheme '{other}' in '{raw}'"
                )));
            }
        };
        let Some(host) = url.host_str().filter(|h| !h.is_empty()) else {
            return Ok(None);
        };
        let port = url
            .port_or_known_default()
            .unwrap_or(if over_tls { 443 } else { 80 });

        let username = config
            .proxy_username
            .clone()
            .or_else(|| (!url.username().is_empty()).then(|| url.username().to_owned()));
        let password = config
            .proxy_password
            .as_ref()
            .map(|p| p.expose().to_owned())
            .or_else(|| url.password().map(str::to_owned));
        let authorization = match (username, password) {
            (None, None) => None,
            (user, pass) => Some(format!(
                "Basic {}",
                STANDARD.encode(format!(
                    "{}:{}",
                    user.unwrap_or_default(),
                    pass.unwrap_or_default()
                ))
            )),
        };

        Ok(Some(Self {
            host: host.trim_matches(['[', ']']).to_owned(),
            port,
            over_tls,
            authorization,
        }))
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub fn is_over_tls(&self) -> bool {
        self.over_tls
    }

    fn dial_uri(&self) -> Result<Uri, HttpError> {
        let host = if self.host.contains(':') {
            format!("[{}]", self.host)
        } else {
            self.host.clone()
        };
        format!("http://{host}:{}", self.port)
            .parse()
            .map_err(|e: http::uri::InvalidUri| HttpError::InvalidUri {
                url: self.host.clone(),
                kind: InvalidUriKind::ParseError,
                reason: e.to_string(),
            })
    }
}

/// Byte stream to a target, either direct or through a proxy connection.
pub(crate) enum ProxyStream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for ProxyStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for ProxyStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_flush(cx),
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            ProxyStream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            ProxyStream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

/// Connection handed to hyper: a [`ProxyStream`] adapted to hyper's IO traits.
pub struct TunnelStream {
    inner: TokioIo<ProxyStream>,
}

impl TunnelStream {
    fn new(stream: ProxyStream) -> Self {
        Self {
            inner: TokioIo::new(stream),
        }
    }
}

impl Read for TunnelStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl Write for TunnelStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

impl Connection for TunnelStream {
    fn connected(&self) -> Connected {
        // Tunnelled connections speak origin-form to the target, so they are
        // not flagged as proxied.
        Connected::new()
    }
}

/// `tower::Service<Uri>` that opens direct or tunnelled TCP connections.
#[derive(Clone)]
pub(crate) struct TunnelConnector {
    http: HttpConnector,
    proxy: Option<Arc<ProxyEndpoint>>,
    proxy_tls: Arc<rustls::ClientConfig>,
}

impl TunnelConnector {
    pub(crate) fn new(
        proxy: Option<Arc<ProxyEndpoint>>,
        proxy_tls: Arc<rustls::ClientConfig>,
        connect_timeout: Duration,
    ) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(connect_timeout));
        Self {
            http,
            proxy,
            proxy_tls,
        }
    }
}

impl tower::Service<Uri> for TunnelConnector {
    type Response = TunnelStream;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let http = self.http.clone();
        let proxy = self.proxy.clone();
        let proxy_tls = Arc::clone(&self.proxy_tls);

        Box::pin(async move {
            let Some(proxy) = proxy else {
                let tcp = http.oneshot(dst).await?.into_inner();
                return Ok(TunnelStream::new(ProxyStream::Plain(tcp)));
            };

            tracing::trace!(
                proxy_host = %proxy.host,
                proxy_port = proxy.port,
                target = %dst,
                "opening proxy tunnel"
            );
            let tcp = http.oneshot(proxy.dial_uri()?).await?.into_inner();
            let stream = if proxy.over_tls {
                let server_name = ServerName::try_from(proxy.host.clone())?;
                let tls = TlsConnector::from(proxy_tls)
                    .connect(server_name, tcp)
                    .await?;
                ProxyStream::Tls(Box::new(tls))
            } else {
                ProxyStream::Plain(tcp)
            };

            let stream = establish_tunnel(stream, &dst, proxy.authorization.as_deref()).await?;
            Ok(TunnelStream::new(stream))
        })
    }
}

/// Issue `CONNECT host:port` on `stream` and wait for a 2xx answer.
async fn establish_tunnel(
    mut stream: ProxyStream,
    target: &Uri,
    authorization: Option<&str>,
) -> Result<ProxyStream, HttpError> {
    let host = target.host().ok_or_else(|| HttpError::InvalidUri {
        url: target.to_string(),
        kind: InvalidUriKind::MissingAuthority,
        reason: "tunnel target has no host".to_owned(),
    })?;
    let port = target
        .port_u16()
        .unwrap_or(if target.scheme_str() == Some("https") { 443 } else { 80 });

    let mut request = format!("CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n");
    if let Some(auth) = authorization {
        request.push_str("Proxy-Authorization: ");
        request.push_str(auth);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| HttpError::Transport(Box::new(e)))?;
    stream
        .flush()
        .await
        .map_err(|e| HttpError::Transport(Box::new(e)))?;

    let mut head = Vec::with_capacity(512);
    let mut chunk = [0_u8; 512];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| HttpError::Transport(Box::new(e)))?;
        if n == 0 {
            return Err(HttpError::Transport(
                "proxy closed the connection during CONNECT".into(),
            ));
        }
        head.extend_from_slice(&chunk[..n]);
        if head.len() > MAX_CONNECT_RESPONSE {
            return Err(HttpError::Transport(
                "proxy CONNECT response head too large".into(),
            ));
        }
    }

    let status_line = head
        .split(|&b| b == b'\n')
        .next()
        .map(|line| String::from_utf8_lossy(line).trim().to_owned())
        .unwrap_or_default();
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok());

    match status {
        Some(code) if (200..300).contains(&code) => Ok(stream),
        _ => Err(HttpError::Transport(
            format!("proxy refused CONNECT to {host}:{port}: {status_line}").into(),
        )),
    }
}
