use std::time::Duration;
use thiserror::Error;

/// Classification of URL validation failures.
///
/// Provides programmatic matching for different failure modes without
/// relying on unstable error message strings.
///
/// # Example
///
/// ```ignore
/// match &err {
///     HttpError::InvalidUri { kind, .. } => match kind {
///         InvalidUriKind::ParseError => println!("Malformed URL syntax"),
///         InvalidUriKind::MissingAuthority => println!("URL needs a host"),
///         InvalidUriKind::UnsupportedScheme => println!("URL needs http:// or https://"),
///         _ => println!("Other URI error"),
///     },
///     _ => {}
/// }
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum InvalidUriKind {
    /// URL could not be parsed (malformed syntax)
    ParseError,
    /// URL is missing required host/authority component
    MissingAuthority,
    /// URL scheme is neither `http` nor `https`
    UnsupportedScheme,
}

/// REST client error types
///
/// Only connection-level failures, policy violations and authentication
/// protocol failures are raised by the request engine. HTTP error statuses are
/// returned to the caller as regular responses; [`HttpError::HttpStatus`] is
/// produced by the REST layer and by [`crate::HttpResponse::error_for_status`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpError {
    /// Request building failed
    #[error("Failed to build request: {0}")]
    RequestBuild(#[from] http::Error),

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// A single round trip exceeded the socket timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// Transport error (DNS, connect, reset, proxy CONNECT failure)
    #[error("Transport error: {0}")]
    Transport(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Redirect from https to http without `allowRedirectDowngrade`
    #[error("Redirect from '{from}' to '{to}' is a protocol downgrade and is not allowed")]
    RedirectDowngrade {
        /// URL of the hop that returned the redirect
        from: String,
        /// Rejected redirect target
        to: String,
    },

    /// Authentication handshake failed (missing or undecodable challenge, lost connection)
    #[error("Authentication failed: {reason}")]
    Authentication {
        /// Diagnostic message
        reason: String,
    },

    /// Invalid URL (failed to parse)
    ///
    /// Use the `kind` field for programmatic matching. The `reason` field contains
    /// a diagnostic message intended for logging only; do not match on its contents
    /// as the format is unstable and may change between releases.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUri {
        /// The URL that failed to parse
        url: String,
        /// Structured failure classification for programmatic matching
        kind: InvalidUriKind,
        /// Diagnostic message (unstable format, for logging only)
        reason: String,
    },

    /// A streamed request body was already consumed and cannot be sent again
    #[error("Request body is a stream and was already sent; it cannot be replayed")]
    BodyNotReplayable,

    /// Response body exceeded size limit
    #[error("Response body too large: limit {limit} bytes, got {actual} bytes")]
    BodyTooLarge { limit: usize, actual: usize },

    /// An earlier read of this response body failed; the body is gone
    #[error("Response body unavailable after a failed read: {0}")]
    BodyUnavailable(String),

    /// The client was disposed
    #[error("Client has been disposed")]
    Disposed,

    /// Invalid client configuration (bad pattern, unreadable certificate, bad proxy URL)
    #[error("Invalid client configuration: {0}")]
    Config(String),

    /// JSON parsing error
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),


    /// Response body could not be deserialized into the requested resource type
    #[error("Invalid resource result: {0}")]
    InvalidResource(#[source] serde_json::Error),

    /// HTTP status above 299 surfaced as an error
    #[error("HTTP {status}: {message}")]
    HttpStatus {
        status: http::StatusCode,
        message: String,
    },
}

impl HttpError {
    /// Whether this error happened below the HTTP layer (DNS, connect, timeout, reset).
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        matches!(self, HttpError::Transport(_) | HttpError::Timeout(_))
    }

    pub(crate) fn authentication(reason: impl Into<String>) -> Self {
        HttpError::Authentication {
            reason: reason.into(),
        }
    }
}

impl From<hyper::Error> for HttpError {
    fn from(err: hyper::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

impl From<hyper_util::client::legacy::Error> for HttpError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        HttpError::Transport(Box::new(err))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::error::Error;
    use std::fmt;

    #[derive(Debug)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl Error for TestError {}

    #[test]
    fn test_transport_error_preserves_source() {
        let err = HttpError::Transport(Box::new(TestError("connection refused")));

        let source = err.source().expect("Transport error should have a source");
        let downcast = source
            .downcast_ref::<TestError>()
            .expect("Should be able to downcast to TestError");
        assert_eq!(downcast.0, "connection refused");
    }

    #[test]
    fn test_tls_error_preserves_source() {
        let err = HttpError::Tls(Box::new(TestError("certificate expired")));

        let source = err.source().expect("TLS error should have a source");
        let downcast = source.downcast_ref::<TestError>().unwrap();
        assert_eq!(downcast.0, "certificate expired");
    }

    #[test]
    fn test_error_chain_traversal() {
        let err = HttpError::Transport(Box::new(TestError("root cause")));

        let mut count = 0;
        let mut current: Option<&(dyn Error + 'static)> = Some(&err);
        while let Some(e) = current {
            count += 1;
            current = e.source();
        }

        assert_eq!(
            count, 2,
            "Should have 2 errors in chain: HttpError and TestError"
        );
    }

    #[test]
    fn test_connection_error_classification() {
        assert!(HttpError::Timeout(Duration::from_secs(1)).is_connection_error());
        assert!(HttpError::Transport(Box::new(TestError("reset"))).is_connection_error());
        assert!(
            !HttpError::RedirectDowngrade {
                from: "https://a".into(),
                to: "http://a".into(),
            }
            .is_connection_error()
        );
        assert!(!HttpError::authentication("no challenge").is_connection_error());
        assert!(!HttpError::Disposed.is_connection_error());
    }

    #[test]
    fn test_downgrade_message_names_both_urls() {
        let err = HttpError::RedirectDowngrade {
            from: "https://secure.example/a".into(),
            to: "http://plain.example/b".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("https://secure.example/a"));
        assert!(msg.contains("http://plain.example/b"));
    }
}
