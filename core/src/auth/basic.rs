use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use super::{Authenticator, Credential};
use crate::client::Client;
use crate::context::Context;
use crate::error::Error;

/// HTTP Basic authentication: every request carries the credentials.
#[derive(Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }

    fn header_value(&self) -> String {
        let raw = format!("{}:{}", self.username, self.password);
        format!("Basic {}", STANDARD.encode(raw))
    }
}

impl Authenticator for BasicAuth {
    fn authenticate(&self, _ctx: &Context, _client: &Client) -> Result<(), Error> {
        tracing::debug!(user = %self.username, "basic authentication installed");
        Ok(())
    }

    fn credential(&self, _client: &Client) -> Option<Credential> {
        Some(Credential::new("Authorization", self.header_value(), 0))
    }
}

impl fmt::Debug for BasicAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BasicAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}
