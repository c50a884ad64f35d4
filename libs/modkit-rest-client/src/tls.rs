//! TLS utilities for the REST client.
//!
//! Trust roots, the optional CA bundle and the client identity are loaded once
//! at client construction into a [`TlsSettings`], which then hands out a shared
//! rustls `ClientConfig` to every HTTPS agent. Native root certificates are
//! cached process-wide to avoid repeated OS certificate store lookups.

use crate::config::{CertConfig, TlsRootConfig};
use crate::error::HttpError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{DigitallySignedStruct, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Cached native root certificates.
/// Always stores Ok; empty vec means no certs found (warned, not errored).
static NATIVE_ROOTS_CACHE: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

/// Counter for test verification that the loader only runs once.
#[cfg(test)]
static LOAD_COUNT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

fn load_native_certs_inner() -> Vec<CertificateDer<'static>> {
    #[cfg(test)]
    LOAD_COUNT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

    let result = rustls_native_certs::load_native_certs();

    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }

    let certs: Vec<CertificateDer<'static>> = result.certs;

    if certs.is_empty() {
        tracing::warn!("no native root CA certificates found");
    } else {
        tracing::debug!(count = certs.len(), "loaded native root certificates");
    }

    certs
}

/// Get cached native root certificates (loaded lazily, may be empty).
pub fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS_CACHE
        .get_or_init(load_native_certs_inner)
        .as_slice()
}

/// Get the crypto provider for TLS connections.
///
/// Uses the globally installed default provider when there is one, otherwise
/// creates an aws-lc-rs provider without installing it globally.
pub fn get_crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Accepts any server certificate. Used only with `ignoreSslError`.
#[derive(Debug)]
struct NoVerifier {
    schemes: Vec<SignatureScheme>,
}

impl ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

/// Client identity presented during the handshake.
struct ClientIdentity {
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
}

/// TLS trust and identity settings of one client.
///
/// Immutable after construction; every HTTPS agent of the client shares the
/// same `ClientConfig`. The origin config carries no ALPN list because
/// `hyper-rustls` installs its own; the proxy config pins `http/1.1`.
pub(crate) struct TlsSettings {
    config: Arc<rustls::ClientConfig>,
    proxy_config: Arc<rustls::ClientConfig>,
    fingerprint: [u8; 32],
    ignore_errors: bool,
}

impl std::fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsSettings")
            .field("fingerprint", &hex::encode(&self.fingerprint[..8]))
            .field("ignore_errors", &self.ignore_errors)
            .finish_non_exhaustive()
    }
}

impl TlsSettings {
    /// Load certificate material and build the rustls configuration.
    ///
    /// # Errors
    ///
    /// Returns `HttpError::Config` if a configured PEM file cannot be parsed or
    /// the key is encrypted, and `HttpError::Tls` if rustls rejects the roots
    /// or the client identity.
    pub(crate) fn new(
        roots: TlsRootConfig,
        ignore_errors: bool,
        cert: Option<&CertConfig>,
    ) -> Result<Self, HttpError> {
        let extra_ca = match cert.and_then(|c| c.ca_file.as_deref()) {
            Some(path) => load_ca_file(path)?,
            None => Vec::new(),
        };
        let identity = match cert {
            Some(cert) => load_identity(cert)?,
            None => None,
        };

        let mut hasher = Sha256::new();
        hasher.update(match roots {
            TlsRootConfig::WebPki => b"webpki".as_slice(),
            TlsRootConfig::Native => b"native".as_slice(),
        });
        hasher.update([u8::from(ignore_errors)]);
        for ca in &extra_ca {
            hasher.update(ca.as_ref());
        }
        if let Some(identity) = &identity {
            for cert in &identity.chain {
                hasher.update(cert.as_ref());
            }
        }
        let fingerprint: [u8; 32] = hasher.finalize().into();

        if ignore_errors {
            tracing::warn!("TLS certificate verification is disabled (ignoreSslError)");
        }

        let config = build_client_config(roots, ignore_errors, extra_ca, identity)?;
        let mut proxy_config = config.clone();
        proxy_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Self {
            config: Arc::new(config),
            proxy_config: Arc::new(proxy_config),
            fingerprint,
            ignore_errors,
        })
    }

    pub(crate) fn client_config(&self) -> Arc<rustls::ClientConfig> {
        Arc::clone(&self.config)
    }

    /// Configuration for TLS connections to the proxy itself.
    pub(crate) fn proxy_client_config(&self) -> Arc<rustls::ClientConfig> {
        Arc::clone(&self.proxy_config)
    }

    /// Digest of everything that shapes the TLS configuration; part of the agent cache key.
    pub(crate) fn fingerprint(&self) -> [u8; 32] {
        self.fingerprint
    }
}

fn build_client_config(
    roots: TlsRootConfig,
    ignore_errors: bool,
    extra_ca: Vec<CertificateDer<'static>>,
    identity: Option<ClientIdentity>,
) -> Result<rustls::ClientConfig, HttpError> {
    let provider = get_crypto_provider();
    let schemes = provider
        .signature_verification_algorithms
        .supported_schemes();

    let builder = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| HttpError::Tls(Box::new(e)))?;

    let builder = if ignore_errors {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier { schemes }))
    } else {
        builder.with_root_certificates(root_store(roots, extra_ca)?)
    };

    let config = match identity {
        Some(identity) => builder
            .with_client_auth_cert(identity.chain, identity.key)
            .map_err(|e| HttpError::Tls(Box::new(e)))?,
        None => builder.with_no_client_auth(),
    };
    Ok(config)
}

fn root_store(
    roots: TlsRootConfig,
    extra_ca: Vec<CertificateDer<'static>>,
) -> Result<rustls::RootCertStore, HttpError> {
    let mut store = match roots {
        TlsRootConfig::WebPki => {
            rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned())
        }
        TlsRootConfig::Native => {
            let mut store = rustls::RootCertStore::empty();
            let (added, ignored) =
                store.add_parsable_certificates(native_root_certs().iter().cloned());
            if ignored > 0 {
                tracing::warn!(
                    added = added,
                    ignored = ignored,
                    "some native root certificates could not be parsed"
                );
            }
            store
        }
    };

    let (added, ignored) = store.add_parsable_certificates(extra_ca);
    if ignored > 0 {
        tracing::warn!(added, ignored, "some CA file certificates could not be parsed");
    }

    if store.is_empty() {
        return Err(HttpError::Tls(
            "no root CA certificates available (OS store empty and no caFile)".into(),
        ));
    }
    Ok(store)
}

fn load_ca_file(path: &Path) -> Result<Vec<CertificateDer<'static>>, HttpError> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "caFile does not exist; ignoring");
        return Ok(Vec::new());
    }
    CertificateDer::pem_file_iter(path)
        .and_then(Iterator::collect::<Result<Vec<_>, _>>)
        .map_err(|e| HttpError::Config(format!("failed to read caFile {}: {e}", path.display())))
}

fn load_identity(cert: &CertConfig) -> Result<Option<ClientIdentity>, HttpError> {
    let (Some(cert_path), Some(key_path)) = (cert.cert_file.as_deref(), cert.key_file.as_deref())
    else {
        if cert.cert_file.is_some() || cert.key_file.is_some() {
            tracing::warn!("client certificate needs both certFile and keyFile; ignoring");
        }
        return Ok(None);
    };

    if !cert_path.exists() || !key_path.exists() {
        tracing::warn!(
            cert = %cert_path.display(),
            key = %key_path.display(),
            "client certificate or key file does not exist; ignoring"
        );
        return Ok(None);
    }

    let chain = CertificateDer::pem_file_iter(cert_path)
        .and_then(Iterator::collect::<Result<Vec<_>, _>>)
        .map_err(|e| {
            HttpError::Config(format!(
                "failed to read certFile {}: {e}",
                cert_path.display()
            ))
        })?;

    let key = PrivateKeyDer::from_pem_file(key_path).map_err(|e| {
        if cert.passphrase.is_some() {
            HttpError::Config(format!(
                "keyFile {} could not be read; passphrase-protected keys are not supported: {e}",
                key_path.display()
            ))
        } else {
            HttpError::Config(format!("failed to read keyFile {}: {e}", key_path.display()))
        }
    })?;

    Ok(Some(ClientIdentity { chain, key }))
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    /// Verifies "at most one load": `LOAD_COUNT` is shared by all tests, so the
    /// cache may already be initialized when this test runs.
    #[test]
    fn test_native_roots_cached() {
        let initial_count = LOAD_COUNT.load(Ordering::SeqCst);

        let result1 = native_root_certs();
        let result2 = native_root_certs();

        let final_count = LOAD_COUNT.load(Ordering::SeqCst);
        assert!(
            final_count <= initial_count + 1,
            "loader should run at most once, but ran {} times since test start",
            final_count - initial_count
        );
        assert!(std::ptr::eq(result1, result2), "should return same slice");
    }

    #[test]
    fn test_webpki_settings_build() {
        let settings = TlsSettings::new(TlsRootConfig::WebPki, false, None).unwrap();
        assert!(settings.client_config().alpn_protocols.is_empty());
        assert_eq!(
            settings.proxy_client_config().alpn_protocols,
            vec![b"http/1.1".to_vec()]
        );
    }

    #[test]
    fn test_fingerprint_tracks_ignore_flag() {
        let strict = TlsSettings::new(TlsRootConfig::WebPki, false, None).unwrap();
        let strict_again = TlsSettings::new(TlsRootConfig::WebPki, false, None).unwrap();
        let insecure = TlsSettings::new(TlsRootConfig::WebPki, true, None).unwrap();

        assert_eq!(strict.fingerprint(), strict_again.fingerprint());
        assert_ne!(strict.fingerprint(), insecure.fingerprint());
    }

    #[test]
    fn test_missing_files_are_ignored() {
        let cert = CertConfig {
            ca_file: Some("/nonexistent/ca.pem".into()),
            cert_file: Some("/nonexistent/cert.pem".into()),
            key_file: Some("/nonexistent/key.pem".into()),
            passphrase: None,
        };
        let settings = TlsSettings::new(TlsRootConfig::WebPki, false, Some(&cert));
        assert!(settings.is_ok());
    }

    #[test]
    fn test_invalid_ca_file_is_config_error() {
        let dir = std::env::temp_dir().join(format!("rest-client-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("broken-ca.pem");
        std::fs::write(
            &path,
            "-----BEGIN CERTIFICATE-----\n!!!not base64!!!\n-----END CERTIFICATE-----\n",
        )
        .unwrap();

        let cert = CertConfig {
            ca_file: Some(path.clone()),
            ..Default::default()
        };
        let err = TlsSettings::new(TlsRootConfig::WebPki, false, Some(&cert)).unwrap_err();
        assert!(matches!(err, HttpError::Config(_)), "got {err:?}");

        let _ = std::fs::remove_file(path);
    }
}
