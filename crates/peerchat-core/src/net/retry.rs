//! Reconnection of dropped outbound Links.

use crate::config::ReconnectConfig;
use std::sync::Arc;

/// An outbound address the Node keeps redialing while it is down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectTarget {
    /// Remote host.
    pub host: String,
    /// Remote port.
    pub port: u16,
    /// Consecutive sweeps that found no Link.
    pub tries: u32,
}

impl ReconnectTarget {
    /// New target with no failed sweeps.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            tries: 0,
        }
    }

    /// Whether this target names `host:port`.
    pub fn matches(&self, host: &str, port: u16) -> bool {
        self.host == host && self.port == port
    }
}

/// Decides whether a missing target is redialed or dropped for good.
///
/// `tries` counts sweeps since the Link was last seen, starting at 1.
pub trait RetryPolicy: Send + Sync {
    /// `true` to redial, `false` to forget the target.
    fn should_retry(&self, host: &str, port: u16, tries: u32) -> bool;
}

impl<F> RetryPolicy for F
where
    F: Fn(&str, u16, u32) -> bool + Send + Sync,
{
    fn should_retry(&self, host: &str, port: u16, tries: u32) -> bool {
        self(host, port, tries)
    }
}

/// Redial forever.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl RetryPolicy for AlwaysRetry {
    fn should_retry(&self, _host: &str, _port: u16, _tries: u32) -> bool {
        true
    }
}

/// Redial until `tries` exceeds the limit.
#[derive(Debug, Clone, Copy)]
pub struct MaxAttempts(pub u32);

impl RetryPolicy for MaxAttempts {
    fn should_retry(&self, _host: &str, _port: u16, tries: u32) -> bool {
        tries <= self.0
    }
}

/// Build the policy a [`ReconnectConfig`] describes.
pub fn policy_from_config(config: &ReconnectConfig) -> Arc<dyn RetryPolicy> {
    match config.max_attempts {
        Some(limit) => Arc::new(MaxAttempts(limit)),
        None => Arc::new(AlwaysRetry),
    }
}
