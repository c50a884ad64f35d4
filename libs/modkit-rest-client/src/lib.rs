#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! REST client infrastructure for `ModKit`
//!
//! This crate provides a hyper-based HTTP/1.1 client with:
//! - Pluggable credential handlers (Basic, Bearer, PAT, private token,
//!   HMAC-SHA256 signatures, NTLM challenge-response)
//! - Redirect following with HTTPS -> HTTP downgrade protection
//! - Retries with exponential backoff for idempotent verbs on 502/503/504
//! - Explicit or environment (`HTTPS_PROXY`, `HTTP_PROXY`, `NO_PROXY`) proxies,
//!   tunnelled with `CONNECT`
//! - Keep-alive agents, client certificates and custom CA bundles via rustls
//! - A JSON resource layer ([`RestClient`])
//!
//! HTTP error statuses are returned as responses. Only connection failures,
//! blocked redirect downgrades and failed authentication handshakes surface
//! as [`HttpError`].
//!
//! # Example
//!
//! ```ignore
//! use modkit_rest_client::{HttpClient, NtlmCredentialHandler, RetryConfig};
//!
//! let client = HttpClient::builder()
//!     .handler(NtlmCredentialHandler::new("user", "secret").with_domain("CORP"))
//!     .retry(RetryConfig::enabled(3))
//!     .build()?;
//!
//! let body = client
//!     .get("https://intranet.example/api/status")
//!     .send()
//!     .await?
//!     .text()
//!     .await?;
//! ```

mod agent;
mod builder;
mod client;
mod config;
mod connector;
mod credentials;
pub mod env;
mod error;
pub mod handlers;
mod policy;
mod request;
mod response;
mod rest;
mod tls;
mod transport;

pub use agent::{Agent, AgentKind};
pub use builder::HttpClientBuilder;
pub use client::HttpClient;
pub use config::{
    CertConfig, DEFAULT_DRAIN_LIMIT, DEFAULT_USER_AGENT, ExponentialBackoff, HttpClientConfig,
    ProxyConfig, REDIRECT_CODES, RETRY_CODES, RedirectConfig, RetryConfig, TlsRootConfig, Verb,
};
pub use connector::ProxyEndpoint;
pub use credentials::SecretString;
pub use env::{EnvironmentLookup, ProcessEnvironment, StaticEnvironment};
pub use error::{HttpError, InvalidUriKind};
pub use handlers::{
    AuthOutcome, BasicCredentialHandler, BearerCredentialHandler, HmacSha256SignatureHandler,
    NtlmCredentialHandler, PersonalAccessTokenCredentialHandler, PrivateTokenCredentialHandler,
    RequestHandler,
};
pub use request::{BoxError, RequestBody, RequestBuilder, RequestDescriptor, StreamSlot, WireBody};
pub use response::{HttpResponse, ResponseBody, full_body};
pub use rest::{RequestOptions, ResponseProcessor, RestClient, RestResponse};
pub use tls::{get_crypto_provider, native_root_certs};
pub use transport::{HyperTransport, Transport};
