use super::{RequestHandler, basic_authorization, set_authorization, suppress_fed_auth_redirect};
use crate::credentials::SecretString;
use crate::error::HttpError;
use crate::request::RequestDescriptor;
use std::sync::OnceLock;

/// Sends `Authorization: Basic ...` to the first host it prepares a request for.
///
/// The origin is pinned on first use, so a redirect to another host does not
/// carry the credentials unless `allow_cross_origin` is set.
pub struct BasicCredentialHandler {
    username: String,
    password: SecretString,
    allow_cross_origin: bool,
    origin: OnceLock<String>,
}

impl BasicCredentialHandler {
    #[must_use]
    pub fn new(username: impl Into<String>, password: impl Into<SecretString>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            allow_cross_origin: false,
            origin: OnceLock::new(),
        }
    }

    /// Also authenticate requests to hosts other than the first one seen.
    #[must_use]
    pub fn allow_cross_origin(mut self, allow: bool) -> Self {
        self.allow_cross_origin = allow;
        self
    }
}

impl std::fmt::Debug for BasicCredentialHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BasicCredentialHandler")
            .field("username", &self.username)
            .field("password", &self.password)
            .field("allow_cross_origin", &self.allow_cross_origin)
            .field("origin", &self.origin.get())
            .finish()
    }
}

impl RequestHandler for BasicCredentialHandler {
    fn prepare_request(&self, request: &mut RequestDescriptor) -> Result<(), HttpError> {
        let host = request.url.host_str().unwrap_or_default();
        let origin = self.origin.get_or_init(|| host.to_owned());

        if origin.eq_ignore_ascii_case(host) || self.allow_cross_origin {
            let value = basic_authorization(&self.username, self.password.expose())?;
            set_authorization(request, value);
        } else {
            tracing::debug!(host, origin = %origin, "withholding basic credentials from cross-origin host");
        }
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
    async fn test_sets_basic_header_for_origin() {
        let handler = BasicCredentialHandler::new("johndoe", "password");
        let mut request = descriptor(Verb::Get, "https://httpbin.org/get", RequestBody::Empty);

        handler.prepare_request(&mut request).unwrap();

        assert_eq!(
            request.headers[AUTHORIZATION],
            "Basic am9obmRvZTpwYXNzd29yZA=="
        );
        assert_eq!(request.headers["x-tfs-fedauthredirect"], "Suppress");
    }

    #[tokio::test]
    async fn test_cross_origin_host_gets_no_credentials() {
        let handler = BasicCredentialHandler::new("johndoe", "password");
        let mut first = descriptor(Verb::Get, "https://origin.example/a", RequestBody::Empty);
        handler.prepare_request(&mut first).unwrap();

        let mut redirected = descriptor(Verb::Get, "https://other.example/b", RequestBody::Empty);
        handler.prepare_request(&mut redirected).unwrap();

        assert!(redirected.headers.get(AUTHORIZATION).is_none());
        assert_eq!(redirected.headers["x-tfs-fedauthredirect"], "Suppress");
    }

    #[tokio::test]
    async fn test_cross_origin_allowed() {
        let handler = BasicCredentialHandler::new("johndoe", "password").allow_cross_origin(true);
        let mut first = descriptor(Verb::Get, "https://origin.example/a", RequestBody::Empty);
        handler.prepare_request(&mut first).unwrap();

        let mut redirected = descriptor(Verb::Get, "https://other.example/b", RequestBody::Empty);
        handler.prepare_request(&mut redirected).unwrap();

        assert!(redirected.headers.get(AUTHORIZATION).is_some());
    }

    #[test]
    fn test_debug_redacts_password() {
        let handler = BasicCredentialHandler::new("johndoe", "hunter2");
        let debug = format!("{handler:?}");
        assert!(debug.contains("johndoe"));
        assert!(!debug.contains("hunter2"));
    }
}
