use super::{RequestHandler, sensitive_value};
use crate::credentials::SecretString;
use crate::error::HttpError;
use crate::request::RequestDescriptor;
use http::HeaderName;

const PRIVATE_TOKEN: HeaderName = HeaderName::from_static("private-token");

/// Sends the token in a `Private-Token` header.
#[derive(Debug)]
pub struct PrivateTokenCredentialHandler {
    token: SecretString,
}

impl PrivateTokenCredentialHandler {
    #[must_use]
    pub fn new(token: impl Into<SecretString>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl RequestHandler for PrivateTokenCredentialHandler {
    fn prepare_request(&self, request: &mut RequestDescriptor) -> Result<(), HttpError> {
        request
            .headers
            .insert(PRIVATE_TOKEN, sensitive_value(self.token.expose())?);
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::config::Verb;
    use crate::handlers::test_support::descriptor;
    use crate::request::RequestBody;

    #[tokio::test]
    async fn test_sets_private_token_only() {
        let handler = PrivateTokenCredentialHandler::new("glpat-123");
        let mut request = descriptor(Verb::Get, "https://git.example/api/v4", RequestBody::Empty);

        handler.prepare_request(&mut request).unwrap();

        assert_eq!(request.headers["Private-Token"], "glpat-123");
        assert_eq!(request.headers.len(), 1);
    }
}
