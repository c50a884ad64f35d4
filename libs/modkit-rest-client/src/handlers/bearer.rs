use super::{RequestHandler, sensitive_value, set_authorization, suppress_fed_auth_redirect};
use crate::credentials::SecretString;
use crate::error::HttpError;
use crate::request::RequestDescriptor;

/// Sends `Authorization: Bearer <token>` on every request.
#[derive(Debug)]
pub struct BearerCredentialHandler {
    token: SecretString,
}

impl BearerCredentialHandler {
    #[must_use]
    pub fn new(token: impl Into<SecretString>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl RequestHandler for BearerCredentialHandler {
    fn prepare_request(&self, request: &mut RequestDescriptor) -> Result<(), HttpError> {
        let value = sensitive_value(&format!("Bearer {}", self.token.expose()))?;
        set_authorization(request, value);
        suppress_fed_auth_redirect(request);
        Ok(())
    }
}
