//! Credential and signature handlers.
//!
//! A handler gets two chances to act on a request: [`RequestHandler::prepare_request`]
//! runs before every send (original request, redirect hops, retries) unless the
//! URL is presigned, and the challenge hooks run only when a send comes back
//! with `401`. Handlers run in registration order; the first one whose
//! [`RequestHandler::can_handle_authentication`] returns `true` owns the challenge.

mod basic;
mod bearer;
mod hmac_signature;
pub mod ntlm;
mod personal_access_token;
mod private_token;

pub use basic::BasicCredentialHandler;
pub use bearer::BearerCredentialHandler;
pub use hmac_signature::HmacSha256SignatureHandler;
pub use ntlm::NtlmCredentialHandler;
pub use personal_access_token::PersonalAccessTokenCredentialHandler;
pub use private_token::PrivateTokenCredentialHandler;

use crate::client::HttpClient;
use crate::error::HttpError;
use crate::request::RequestDescriptor;
use crate::response::HttpResponse;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use http::HeaderValue;
use http::header::{AUTHORIZATION, HeaderName};

/// Asks the server to answer with 401 rather than a federated sign-in redirect.
pub(crate) const FED_AUTH_REDIRECT: HeaderName = HeaderName::from_static("x-tfs-fedauthredirect");

/// Result of delegating a 401 challenge to a handler.
#[derive(Debug)]
pub enum AuthOutcome {
    /// The handler does not authenticate this challenge; the 401 goes back to the caller.
    NotApplicable,
    /// The handshake failed; the call fails with this error.
    Failure(HttpError),
    /// Final response of the handshake, returned as the call's result.
    Response(HttpResponse),
}

/// Hooks a handler exposes to the execution engine.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    /// Mutate the outgoing request. No I/O.
    ///
    /// # Errors
    ///
    /// Returns an error if a header cannot be built from the handler's credentials.
    fn prepare_request(&self, request: &mut RequestDescriptor) -> Result<(), HttpError>;

    /// Whether this handler can answer the challenge carried by a `401` response.
    fn can_handle_authentication(&self, _response: &HttpResponse) -> bool {
        false
    }

    /// Run the challenge exchange for `request`. Only called after
    /// [`can_handle_authentication`](Self::can_handle_authentication) returned `true`.
    async fn handle_authentication(
        &self,
        _client: &HttpClient,
        _request: RequestDescriptor,
        _challenge: &HttpResponse,
    ) -> AuthOutcome {
        AuthOutcome::NotApplicable
    }
}

/// `Basic base64(user:password)` as a sensitive header value.
pub(crate) fn basic_authorization(user: &str, password: &str) -> Result<HeaderValue, HttpError> {
    let encoded = STANDARD.encode(format!("{user}:{password}"));
    sensitive_value(&format!("Basic {encoded}"))
}

pub(crate) fn sensitive_value(value: &str) -> Result<HeaderValue, HttpError> {
    let mut value = HeaderValue::try_from(value)?;
    value.set_sensitive(true);
    Ok(value)
}

pub(crate) fn set_authorization(request: &mut RequestDescriptor, value: HeaderValue) {
    request.headers.insert(AUTHORIZATION, value);
}

pub(crate) fn suppress_fed_auth_redirect(request: &mut RequestDescriptor) {
    request
        .headers
        .insert(FED_AUTH_REDIRECT, HeaderValue::from_static("Suppress"));
}


#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_basic_authorization_is_sensitive() {
        let value = basic_authorization("johndoe", "password").unwrap();
        assert_eq!(value, "Basic am9obmRvZTpwYXNzd29yZA==");
        assert!(value.is_sensitive());
    }
}
