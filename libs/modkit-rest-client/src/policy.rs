//! Redirect and retry decisions taken between round trips.

use crate::config::{RedirectConfig, RetryConfig};
use crate::error::{HttpError, InvalidUriKind};
use crate::response::HttpResponse;
use http::header::LOCATION;
use std::time::Duration;
use url::Url;

/// What to do with a response that may be a redirect.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RedirectStep {
    /// Return the response as it is
    Stop,
    /// Send the request again to this URL
    Follow(Url),
}

/// Check if the redirect is an HTTPS -> HTTP downgrade
fn is_https_downgrade(current: &Url, target: &Url) -> bool {
    current.scheme() == "https" && target.scheme() == "http"
}

/// Decide whether `response` to a request for `current` is followed.
///
/// Stops on a non-redirect status, when redirects are disabled, when no hops
/// remain, or when `Location` is missing. A relative `Location` is resolved
/// against `current`.
///
/// # Errors
///
/// `RedirectDowngrade` for an https -> http hop without opt-in, `InvalidUri`
/// for an unparsable `Location`.
pub(crate) fn next_redirect(
    config: &RedirectConfig,
    current: &Url,
    response: &HttpResponse,
    remaining: usize,
) -> Result<RedirectStep, HttpError> {
    if !config.allow_redirects
        || remaining == 0
        || !RedirectConfig::is_redirect_status(response.status())
    {
        return Ok(RedirectStep::Stop);
    }
    let Some(location) = response.headers().get(LOCATION) else {
        tracing::debug!(status = response.status().as_u16(), url = %current, "redirect without location");
        return Ok(RedirectStep::Stop);
    };

    let location = location.to_str().map_err(|e| HttpError::InvalidUri {
        url: String::from_utf8_lossy(location.as_bytes()).into_owned(),
        kind: InvalidUriKind::ParseError,
        reason: e.to_string(),
    })?;
    let target = current.join(location).map_err(|e| HttpError::InvalidUri {
        url: location.to_owned(),
        kind: InvalidUriKind::ParseError,
        reason: e.to_string(),
    })?;

    if !config.allow_redirect_downgrade && is_https_downgrade(current, &target) {
        tracing::warn!(
            original = %current,
            target = %target,
            "Blocking HTTPS to HTTP downgrade redirect"
        );
        return Err(HttpError::RedirectDowngrade {
            from: current.to_string(),
            to: target.to_string(),
        });
    }

    Ok(RedirectStep::Follow(target))
}

/// Backoff before attempt `attempt + 1`, or `None` when `response` is final.
pub(crate) fn retry_delay(
    config: &RetryConfig,
    response: &HttpResponse,
    attempt: usize,
    max_attempts: usize,
) -> Option<Duration> {
    (attempt < max_attempts && RetryConfig::is_retryable_status(response.status()))
        .then(|| config.backoff.delay(u32::try_from(attempt).unwrap_or(u32::MAX)))
}
