use super::{RequestHandler, basic_authorization, set_authorization, suppress_fed_auth_redirect};
use crate::credentials::SecretString;
use crate::error::HttpError;
use crate::request::RequestDescriptor;

/// Sends a personal access token as `Basic base64("PAT:" + token)`.
#[derive(Debug)]
pub struct PersonalAccessTokenCredentialHandler {
    token: SecretString,
}

impl PersonalAccessTokenCredentialHandler {
    #[must_use]
    pub fn new(token: impl Into<SecretString>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl RequestHandler for PersonalAccessTokenCredentialHandler {
    fn prepare_request(&self, request: &mut RequestDescriptor) -> Result<(), HttpError> {
        set_authorization(request, basic_authorization("PAT", self.token.expose())?);
        suppress_fed_auth_redirect(request);
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
    use http::header::AUTHORIZATION;

    #[tokio::test]
    async fn test_encodes_pat_user() {
        let handler = PersonalAccessTokenCredentialHandler::new("secret");
        let mut request = descriptor(Verb::Get, "https://dev.example/_apis", RequestBody::Empty);

        handler.prepare_request(&mut request).unwrap();

        // base64("PAT:secret")
        assert_eq!(request.headers[AUTHORIZATION], "Basic UEFUOnNlY3JldA==");
        assert_eq!(request.headers["x-tfs-fedauthredirect"], "Suppress");
    }
}
