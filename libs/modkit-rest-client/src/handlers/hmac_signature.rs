use super::RequestHandler;
use crate::credentials::SecretString;
use crate::error::HttpError;
use crate::request::RequestDescriptor;
use hmac::{Hmac, Mac};
use http::{HeaderName, HeaderValue};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

/// Signs every request with HMAC-SHA256.
///
/// The signed text is `"{unix_seconds}\n{METHOD}\n{path}\n{query}\n{body}"`;
/// the hex digest goes into the signature header and the timestamp into the
/// timestamp header. Streamed bodies are signed as empty.
#[derive(Debug)]
pub struct HmacSha256SignatureHandler {
    secret: SecretString,
    signature_header: HeaderName,
    timestamp_header: HeaderName,
}

impl HmacSha256SignatureHandler {
    /// Handler using the `X-Signature` and `X-Timestamp` headers.
    #[must_use]
    pub fn new(secret: impl Into<SecretString>) -> Self {
        Self {
            secret: secret.into(),
            signature_header: HeaderName::from_static("x-signature"),
            timestamp_header: HeaderName::from_static("x-timestamp"),
        }
    }

    /// Override the header names.
    ///
    /// # Errors
    ///
    /// Returns `HttpError::InvalidHeaderName` if either name is not a valid header.
    pub fn with_headers(mut self, signature: &str, timestamp: &str) -> Result<Self, HttpError> {
        self.signature_header = HeaderName::try_from(signature)?;
        self.timestamp_header = HeaderName::try_from(timestamp)?;
        Ok(self)
    }

    /// Hex HMAC-SHA256 of the canonical request text.
    #[must_use]
    pub fn sign(&self, timestamp: u64, method: &str, path: &str, query: &str, body: &[u8]) -> String {
        // HMAC accepts keys of any length
        let Ok(mut mac) = HmacSha256::new_from_slice(self.secret.expose().as_bytes()) else {
            return String::new();
        };
        mac.update(format!("{timestamp}\n{method}\n{path}\n{query}\n").as_bytes());
        mac.update(body);
        hex::encode(mac.finalize().into_bytes())
    }
}

impl RequestHandler for HmacSha256SignatureHandler {
    fn prepare_request(&self, request: &mut RequestDescriptor) -> Result<(), HttpError> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |elapsed| elapsed.as_secs());
        let body: &[u8] = request.body.as_bytes().map_or(&[], |bytes| &bytes[..]);

        let signature = self.sign(
            timestamp,
            request.verb.as_str(),
            request.url.path(),
            request.url.query().unwrap_or_default(),
            body,
        );

        request
            .headers
            .insert(self.timestamp_header.clone(), HeaderValue::from(timestamp));
        request
            .headers
            .insert(self.signature_header.clone(), HeaderValue::try_from(signature)?);
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
    use bytes::Bytes;
    use futures::stream;

    #[test]
    fn test_sign_known_digest() {
        let handler = HmacSha256SignatureHandler::new("s3cr3t");
        assert_eq!(
            handler.sign(1_700_000_000, "POST", "/api/items", "a=1&b=2", br#"{"x":1}"#),
            "6caf84d8d00c4aef1f8b91f5eec3f725c108de430fbca192c531d35439f2adf4"
        );
        assert_eq!(
            handler.sign(1_700_000_000, "GET", "/", "", b""),
            "a0f46230c78a2087c9040836677243aff1b88968e39d74cd34db1bf50a30e19e"
        );
    }

    #[tokio::test]
    async fn test_prepare_sets_matching_headers() {
        let handler = HmacSha256SignatureHandler::new("s3cr3t");
        let mut request = descriptor(
            Verb::Post,
            "https://api.example/api/items?a=1&b=2",
            RequestBody::from(r#"{"x":1}"#),
        );

        handler.prepare_request(&mut request).unwrap();

        let timestamp: u64 = request.headers["x-timestamp"].to_str().unwrap().parse().unwrap();
        let expected = handler.sign(timestamp, "POST", "/api/items", "a=1&b=2", br#"{"x":1}"#);
        assert_eq!(request.headers["x-signature"], expected.as_str());
    }

    #[tokio::test]
    async fn test_stream_body_signed_as_empty() {
        let handler = HmacSha256SignatureHandler::new("k")
            .with_headers("X-Sig", "X-Ts")
            .unwrap();
        let body = RequestBody::from_stream(stream::iter(vec![Ok::<_, std::io::Error>(
            Bytes::from("ignored"),
        )]));
        let mut request = descriptor(Verb::Put, "https://api.example/blob", body);

        handler.prepare_request(&mut request).unwrap();

        let timestamp: u64 = request.headers["x-ts"].to_str().unwrap().parse().unwrap();
        let expected = handler.sign(timestamp, "PUT", "/blob", "", b"");
        assert_eq!(request.headers["x-sig"], expected.as_str());
        assert!(request.body.is_replayable());
    }
}
