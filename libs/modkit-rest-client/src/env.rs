//! Environment fallback for proxy settings.
//!
//! The client never reads process environment variables directly. An
//! [`EnvironmentLookup`] is injected at construction so tests and embedders
//! can supply their own values, and so two clients in one process can be
//! configured independently.

use crate::config::ProxyConfig;
use std::collections::HashMap;
use std::env;
use std::fmt;

/// Proxy used for `https:` targets; wins over [`HTTP_PROXY`] for those targets.
pub const HTTPS_PROXY: &str = "HTTPS_PROXY";

/// Proxy used for `http:` targets, and for `https:` targets when [`HTTPS_PROXY`] is unset.
pub const HTTP_PROXY: &str = "HTTP_PROXY";

/// Comma-separated hosts that bypass the proxy.
pub const NO_PROXY: &str = "NO_PROXY";

/// Read-only view of environment variables.
pub trait EnvironmentLookup: Send + Sync + fmt::Debug {
    /// Value of `name`, or `None` when unset or empty.
    fn var(&self, name: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnvironment;

impl EnvironmentLookup for ProcessEnvironment {
    fn var(&self, name: &str) -> Option<String> {
        env::var(name).ok().filter(|value| !value.is_empty())
    }
}

/// Map-backed environment.
///
/// # Example
///
/// ```ignore
/// let env = StaticEnvironment::new()
///     .with(HTTPS_PROXY, "http://proxy.corp:3128")
///     .with(NO_PROXY, "*.internal,localhost");
/// ```
#[derive(Debug, Clone, Default)]
pub struct StaticEnvironment {
    vars: HashMap<String, String>,
}

impl StaticEnvironment {
    /// Empty environment: no proxy fallback at all.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }
}

impl EnvironmentLookup for StaticEnvironment {
    fn var(&self, name: &str) -> Option<String> {
        self.vars.get(name).filter(|value| !value.is_empty()).cloned()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for StaticEnvironment {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        Self {
            vars: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Proxy configuration that applies to a target.
///
/// An explicit configuration always wins. Otherwise `HTTPS_PROXY` is used for
/// `https:` targets when set, then `HTTP_PROXY`.
pub(crate) fn effective_proxy(
    configured: Option<&ProxyConfig>,
    env: &dyn EnvironmentLookup,
    https: bool,
) -> Option<ProxyConfig> {
    if let Some(proxy) = configured {
        return Some(proxy.clone());
    }

    let from_env = if https {
        env.var(HTTPS_PROXY).or_else(|| env.var(HTTP_PROXY))
    } else {
        env.var(HTTP_PROXY)
    };

    from_env.map(ProxyConfig::new)
}

/// Bypass patterns derived from `NO_PROXY`, one per non-blank entry.
pub(crate) fn no_proxy_patterns(env: &dyn EnvironmentLookup) -> Vec<String> {
    env.var(NO_PROXY)
        .map(|value| {
            value
                .split(',')
                .map(str::trim)
                .filter(|entry| !entry.is_empty())
                .map(bypass_pattern_from_env)
                .collect()
        })
        .unwrap_or_default()
}

/// Turn one `NO_PROXY` entry into a regular expression matched against the full URL.
///
/// A leading `*` becomes `.*`. Every `.` that is neither escaped nor followed
/// by `*` is escaped, so `*.example.com` becomes `.*\.example\.com`.
#[must_use]
pub fn bypass_pattern_from_env(entry: &str) -> String {
    let entry = match entry.strip_prefix('*') {
        Some(rest) => format!(".*{rest}"),
        None => entry.to_owned(),
    };

    let chars: Vec<char> = entry.chars().collect();
    let mut pattern = String::with_capacity(entry.len() + 8);
    for (i, &c) in chars.iter().enumerate() {
        let escaped = i > 0 && chars[i - 1] == '\\';
        let before_star = chars.get(i + 1) == Some(&'*');
        if c == '.' && !escaped && !before_star {
            pattern.push('\\');
        }
        pattern.push(c);
    }
    pattern
}
