//! NTLM challenge-response authentication.
//!
//! NTLM authenticates a TCP connection, not a request. After the server
//! answers `401` with `WWW-Authenticate: NTLM`, the handler opens a dedicated
//! single-connection agent and runs two more requests over it:
//!
//! 1. negotiate (type 1), answered by a `401` carrying the server challenge;
//! 2. authenticate (type 3), whose response is the result of the call.
//!
//! The second leg is only sent once the first leg's response body has been
//! read and the dedicated connection is reserved, so both legs share one socket.

mod crypto;
mod message;

pub use message::{ChallengeMessage, MessageError};

use super::{AuthOutcome, RequestHandler, sensitive_value};
use crate::agent::Agent;
use crate::client::HttpClient;
use crate::credentials::SecretString;
use crate::error::HttpError;
use crate::request::RequestDescriptor;
use crate::response::HttpResponse;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::header::{AUTHORIZATION, CONNECTION, WWW_AUTHENTICATE};
use http::{HeaderMap, HeaderValue, StatusCode};
use message::{ClientNonce, Identity};
use regex::Regex;
use std::sync::LazyLock;

#[allow(clippy::expect_used)] // good regex, it doesn't panic
static CHALLENGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^NTLM\s+(.+?)(,|\s+|$)").expect("static regex should not panic"));

/// Authenticates `401 WWW-Authenticate: NTLM` challenges.
///
/// Requests are sent without credentials; the handshake only starts once the
/// server asks for NTLM. The handshake always connects directly, never
/// through a proxy.
pub struct NtlmCredentialHandler {
    username: String,
    password: SecretString,
    workstation: String,
    domain: String,
}

impl NtlmCredentialHandler {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<SecretString>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            workstation: String::new(),
            domain: String::new(),
        }
    }

    #[must_use]
    pub fn with_workstation(mut self, workstation: impl Into<String>) -> Self {
        self.workstation = workstation.into();
        self
    }

    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    fn identity(&self) -> Identity<'_> {
        Identity {
            username: &self.username,
            password: self.password.expose(),
            domain: &self.domain,
            workstation: &self.workstation,
        }
    }
}

impl std::fmt::Debug for NtlmCredentialHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NtlmCredentialHandler")
            .field("username", &self.username)
            .field("password", &self.password)
            .field("workstation", &self.workstation)
            .field("domain", &self.domain)
            .finish()
    }
}

/// Whether any `WWW-Authenticate` value offers bare `NTLM`.
fn offers_ntlm(headers: &HeaderMap) -> bool {
    headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| value.split(", ").any(|mechanism| mechanism == "NTLM"))
}

/// Decode the type 2 message carried by a `WWW-Authenticate: NTLM <base64>` header.
fn parse_challenge(headers: &HeaderMap) -> Result<ChallengeMessage, HttpError> {
    let mut values = headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .peekable();
    if values.peek().is_none() {
        return Err(HttpError::authentication(
            "www-authenticate not found on response of second request",
        ));
    }

    let encoded = values
        .find_map(|value| CHALLENGE.captures(value).and_then(|c| c.get(1)))
        .map(|m| m.as_str())
        .ok_or_else(|| HttpError::authentication("www-authenticate carries no NTLM challenge"))?;

    let decoded = STANDARD.decode(encoded).map_err(|e| {
        HttpError::authentication(format!(
            "Decoding Server's Challenge to Obtain Type2Message failed with error: {e}"
        ))
    })?;
    ChallengeMessage::decode(&decoded).map_err(|e| {
        HttpError::authentication(format!(
            "Decoding Server's Challenge to Obtain Type2Message failed with error: {e}"
        ))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Init,
    Type1Sent,
    Type3Sent,
    Done,
}

/// One challenge sequence. Dropped once the type 3 response is returned.
struct NtlmSession<'a> {
    handler: &'a NtlmCredentialHandler,
    client: &'a HttpClient,
    request: RequestDescriptor,
    agent: Agent,
    state: SessionState,
}

impl<'a> NtlmSession<'a> {
    fn new(
        handler: &'a NtlmCredentialHandler,
        client: &'a HttpClient,
        request: RequestDescriptor,
    ) -> Result<Self, HttpError> {
        let agent = client.dedicated_agent(&request.url)?;
        Ok(Self {
            handler,
            client,
            request,
            agent,
            state: SessionState::Init,
        })
    }

    fn leg(&self, headers: HeaderMap) -> RequestDescriptor {
        RequestDescriptor {
            verb: self.request.verb,
            url: self.request.url.clone(),
            headers,
            body: self.request.body.clone(),
            agent: self.agent.clone(),
        }
    }

    /// `Init -> Type1Sent`: negotiate on the dedicated connection.
    async fn send_negotiate(&mut self) -> Result<HttpResponse, HttpError> {
        debug_assert_eq!(self.state, SessionState::Init);
        let negotiate = message::encode_negotiate(&self.handler.workstation, &self.handler.domain);

        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::try_from(format!("NTLM {}", STANDARD.encode(negotiate)))?,
        );

        let mut response = self.client.request_raw(&self.leg(headers)).await?;
        // the connection is idle again only once this body is consumed
        response.read_body().await?;
        self.state = SessionState::Type1Sent;
        tracing::debug!(status = response.status().as_u16(), agent = self.agent.id(), "ntlm negotiate answered");
        Ok(response)
    }

    /// `Type1Sent -> Type3Sent -> Done`: answer the challenge on the same connection.
    async fn send_authenticate(&mut self, challenge: &HttpResponse) -> Result<HttpResponse, HttpError> {
        debug_assert_eq!(self.state, SessionState::Type1Sent);
        if !self.agent.is_reserved() {
            return Err(HttpError::authentication(
                "ntlm connection was not established by the negotiate leg",
            ));
        }

        let challenge = parse_challenge(challenge.headers())?;
        let authenticate =
            message::encode_authenticate(&self.handler.identity(), &challenge, ClientNonce::generate());

        let mut headers = self.request.headers.clone();
        headers.insert(
            AUTHORIZATION,
            sensitive_value(&format!("NTLM {}", STANDARD.encode(authenticate)))?,
        );
        headers.insert(CONNECTION, HeaderValue::from_static("close"));

        self.state = SessionState::Type3Sent;
        let mut response = self.client.request_raw(&self.leg(headers)).await?;
        response.read_body().await?;
        self.state = SessionState::Done;
        tracing::debug!(status = response.status().as_u16(), agent = self.agent.id(), "ntlm authenticate answered");
        Ok(response)
    }

    async fn run(mut self) -> Result<HttpResponse, HttpError> {
        let negotiated = self.send_negotiate().await?;
        self.send_authenticate(&negotiated).await
    }
}

#[async_trait]
impl RequestHandler for NtlmCredentialHandler {
    fn prepare_request(&self, _request: &mut RequestDescriptor) -> Result<(), HttpError> {
        Ok(())
    }

    fn can_handle_authentication(&self, response: &HttpResponse) -> bool {
        response.status() == StatusCode::UNAUTHORIZED && offers_ntlm(response.headers())
    }

    async fn handle_authentication(
        &self,
        client: &HttpClient,
        request: RequestDescriptor,
        _challenge: &HttpResponse,
    ) -> AuthOutcome {
        let session = match NtlmSession::new(self, client, request) {
            Ok(session) => session,
            Err(e) => return AuthOutcome::Failure(e),
        };
        match session.run().await {
            Ok(response) => AuthOutcome::Response(response),
            Err(e) => {
                tracing::warn!(error = %e, "ntlm handshake failed");
                AuthOutcome::Failure(e)
            }
        }
    }
}
