use crate::agent::Agent;
use crate::error::HttpError;
use crate::request::WireBody;
use crate::response::ResponseBody;
use async_trait::async_trait;
use http::{Request, Response};
use http_body_util::BodyExt;
use std::time::Duration;

/// Transport binding: performs one round trip through an agent.
///
/// The execution engine never talks to sockets directly; everything below
/// "send this request through this agent" lives behind this trait, so the
/// engine can be driven by an in-memory transport in tests.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send `request` through `agent` and return the response head with a lazy body.
    ///
    /// # Errors
    ///
    /// Connection-level failures only (`Transport`, `Timeout`, `Tls`); HTTP
    /// error statuses are returned as responses.
    async fn send(
        &self,
        agent: &Agent,
        request: Request<WireBody>,
    ) -> Result<Response<ResponseBody>, HttpError>;
}

/// Production transport built on hyper.
///
/// Each round trip is bounded by the socket timeout; on expiry the in-flight
/// connection is dropped and the call fails with [`HttpError::Timeout`].
#[derive(Debug, Clone)]
pub struct HyperTransport {
    socket_timeout: Duration,
}

impl HyperTransport {
    #[must_use]
    pub fn new(socket_timeout: Duration) -> Self {
        Self { socket_timeout }
    }
}

#[async_trait]
impl Transport for HyperTransport {
    async fn send(
        &self,
        agent: &Agent,
        request: Request<WireBody>,
    ) -> Result<Response<ResponseBody>, HttpError> {
        let response = tokio::time::timeout(self.socket_timeout, agent.send(request))
            .await
            .map_err(|_| HttpError::Timeout(self.socket_timeout))??;

        let (parts, body) = response.into_parts();
        let body: ResponseBody = body.map_err(Into::into).boxed();
        Ok(Response::from_parts(parts, body))
    }
}
