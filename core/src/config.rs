//! Client configuration.

use std::time::Duration;

use crate::error::DEFAULT_ERROR_BODY_LIMIT;

/// Tunables for a `Client`.
///
/// There is no overall timeout by default: continuous feeds stay open for
/// as long as the caller keeps reading. Use a `Context` deadline or set
/// `timeout` to bound individual calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Upper bound on any single request, including reading its body.
    pub timeout: Option<Duration>,
    /// Value of the `User-Agent` header.
    pub user_agent: String,
    /// How many bytes of an error body are read when classifying it.
    pub error_body_limit: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            user_agent: concat!("couch-core/", env!("CARGO_PKG_VERSION")).to_string(),
            error_body_limit: DEFAULT_ERROR_BODY_LIMIT,
        }
    }
}
