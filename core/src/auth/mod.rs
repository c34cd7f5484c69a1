//! Authentication strategies and the per-client session store.
//!
//! # Design
//! A strategy is installed on a `Client` with `Client::authenticate` and
//! stays there until `Client::logout`. The executor asks the installed
//! strategy for a `Credential` before each dispatch and, when the server
//! answers 401, gives it one chance to `refresh` before replaying.
//!
//! Session tokens live in the client's `SessionStore`, keyed by origin. Each
//! stored token gets a fresh generation number, which is how a request that
//! failed with a stale token tells whether somebody else already logged in
//! again.

mod basic;
mod cookie;

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::Deserialize;

use crate::client::Client;
use crate::context::Context;
use crate::error::Error;

pub use basic::BasicAuth;
pub use cookie::CookieAuth;

/// Path of the session endpoint.
pub const SESSION_PATH: &str = "/_session";

/// Name of the cookie carrying the session token.
pub const SESSION_COOKIE: &str = "AuthSession";

/// A way of authorizing requests on one `Client`.
pub trait Authenticator: fmt::Debug + Send + Sync {
    /// Establish authorization state on `client`. Called once, before the
    /// strategy is installed.
    fn authenticate(&self, ctx: &Context, client: &Client) -> Result<(), Error>;

    /// The header to attach to the next outgoing request, if any.
    fn credential(&self, client: &Client) -> Option<Credential>;

    /// Called after a request carrying `stale` was answered with 401.
    /// Returns `true` when the request should be replayed once.
    fn refresh(&self, _ctx: &Context, _client: &Client, _stale: Option<&Credential>) -> Result<bool, Error> {
        Ok(false)
    }

    /// Drop any authorization state held for `client`.
    fn logout(&self, _ctx: &Context, _client: &Client) -> Result<(), Error> {
        Ok(())
    }
}

/// A single authorization header plus the session generation it came from.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    name: &'static str,
    value: String,
    generation: u64,
}

impl Credential {
    pub(crate) fn new(name: &'static str, value: String, generation: u64) -> Self {
        Self {
            name,
            value,
            generation,
        }
    }

    pub(crate) fn cookie(token: &str, generation: u64) -> Self {
        Self::new("Cookie", format!("{SESSION_COOKIE}={token}"), generation)
    }

    pub fn header_name(&self) -> &'static str {
        self.name
    }

    pub fn header_value(&self) -> &str {
        &self.value
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("name", &self.name)
            .field("value", &"<redacted>")
            .field("generation", &self.generation)
            .finish()
    }
}

/// A session token issued by the server.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub token: String,
    pub user: String,
    pub generation: u64,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &"<redacted>")
            .field("user", &self.user)
            .field("generation", &self.generation)
            .finish()
    }
}

#[derive(Debug, Default)]
struct StoreInner {
    sessions: HashMap<String, Session>,
    next_generation: u64,
}

/// Session tokens keyed by origin (`scheme://host:port`).
#[derive(Debug, Default)]
pub struct SessionStore {
    inner: Mutex<StoreInner>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, origin: &str) -> Option<Session> {
        self.inner.lock().sessions.get(origin).cloned()
    }

    /// Store `token` for `origin`, replacing any previous one, and return
    /// its generation.
    pub fn insert(&self, origin: &str, token: String, user: String) -> u64 {
        let mut inner = self.inner.lock();
        inner.next_generation += 1;
        let generation = inner.next_generation;
        inner.sessions.insert(
            origin.to_string(),
            Session {
                token,
                user,
                generation,
            },
        );
        generation
    }

    pub fn remove(&self, origin: &str) -> Option<Session> {
        self.inner.lock().sessions.remove(origin)
    }

    /// Remove the entry for `origin` only if it is still `generation`.
    pub(crate) fn remove_if(&self, origin: &str, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.sessions.get(origin).is_some_and(|s| s.generation == generation) {
            inner.sessions.remove(origin);
        }
    }
}

/// The identity the server associates with the current request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct UserContext {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Body of `GET /_session`.
#[derive(Debug, Deserialize)]
pub(crate) struct SessionInfo {
    #[serde(rename = "userCtx")]
    pub(crate) user_ctx: UserContext,
}
