use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;
use ureq::http::header::{HeaderMap, SET_COOKIE};

use super::{Authenticator, Credential, SessionInfo, SESSION_COOKIE, SESSION_PATH};
use crate::client::Client;
use crate::context::Context;
use crate::error::{Error, ErrorKind};
use crate::http::{Method, Options};

/// Session (cookie) authentication.
///
/// Logs in once with `POST /_session`, keeps the issued token in the
/// client's session store, and logs in again when the server stops
/// accepting it. Concurrent requests that hit an expired session share a
/// single re-login, and share its failure too: a rejected token is only
/// ever answered with one login attempt.
pub struct CookieAuth {
    username: String,
    password: String,
    relogin: Mutex<Relogin>,
    /// Login attempts made by `refresh`, successful or not.
    attempts: AtomicU64,
}

/// State guarded by the re-login lock.
struct Relogin {
    /// Cleared by `logout`; a logged-out strategy never stores a token again.
    active: bool,
    failed: Option<Failure>,
}

/// The last re-login that did not succeed.
struct Failure {
    /// Generation of the token whose rejection triggered it.
    stale: Option<u64>,
    attempt: u64,
    error: Error,
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    name: &'a str,
    password: &'a str,
}

impl CookieAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            relogin: Mutex::new(Relogin {
                active: true,
                failed: None,
            }),
            attempts: AtomicU64::new(0),
        }
    }

    /// Log in, store the token, and confirm the server agrees on who we are.
    #[tracing::instrument(level = "debug", skip_all, fields(user = %self.username))]
    fn login(&self, ctx: &Context, client: &Client) -> Result<(), Error> {
        let body = LoginRequest {
            name: &self.username,
            password: &self.password,
        };
        let mut options = Options::new().json(&body)?;
        let response = client.dispatch(ctx, &Method::POST, SESSION_PATH, &mut options, None)?;
        let response = client.check(response)?;
        let token = session_token(response.headers())
            .ok_or_else(|| Error::bad_response("login response did not set a session cookie"))?;
        response.discard();

        let origin = client.origin();
        let generation = client.sessions().insert(origin, token.clone(), self.username.clone());

        let probe = Credential::cookie(&token, generation);
        let verified = client
            .dispatch(ctx, &Method::GET, SESSION_PATH, &mut Options::new(), Some(&probe))
            .and_then(|r| client.check(r))
            .and_then(|r| r.json::<SessionInfo>())
            .and_then(|info| match info.user_ctx.name {
                Some(name) if name == self.username => Ok(()),
                _ => Err(Error::bad_response("authentication response names an unexpected user")),
            });

        if let Err(e) = verified {
            client.sessions().remove_if(origin, generation);
            return Err(e);
        }
        tracing::info!(user = %self.username, "session established");
        Ok(())
    }
}

impl Authenticator for CookieAuth {
    fn authenticate(&self, ctx: &Context, client: &Client) -> Result<(), Error> {
        let mut relogin = self.relogin.lock();
        relogin.active = true;
        relogin.failed = None;
        self.login(ctx, client)
    }

    fn credential(&self, client: &Client) -> Option<Credential> {
        client
            .sessions()
            .get(client.origin())
            .map(|s| Credential::cookie(&s.token, s.generation))
    }

    fn refresh(&self, ctx: &Context, client: &Client, stale: Option<&Credential>) -> Result<bool, Error> {
        let seen = self.attempts.load(Ordering::Acquire);
        let mut relogin = self.relogin.lock();
        if !relogin.active {
            tracing::debug!("logged out, not renewing the session");
            return Ok(false);
        }

        let stale = stale.map(Credential::generation);
        let current = client.sessions().get(client.origin()).map(|s| s.generation);
        match (current, stale) {
            (Some(now), Some(then)) if now != then => {
                tracing::debug!("session already renewed by a concurrent request");
                return Ok(true);
            }
            (Some(_), None) => return Ok(true),
            _ => {}
        }

        // A login that failed for this token, or started after this request
        // began waiting, answers for it too.
        if let Some(failure) = &relogin.failed {
            if (stale.is_some() && failure.stale == stale) || failure.attempt > seen {
                tracing::debug!(error = %failure.error, "re-login already failed for this session");
                return Err(failure.error.clone());
            }
        }

        let attempt = self.attempts.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!(user = %self.username, attempt, "session rejected, logging in again");
        match self.login(ctx, client) {
            Ok(()) => {
                relogin.failed = None;
                Ok(true)
            }
            Err(e) => {
                if let Some(stale) = stale {
                    client.sessions().remove_if(client.origin(), stale);
                }
                if !matches!(e.kind(), ErrorKind::Canceled | ErrorKind::DeadlineExceeded) {
                    relogin.failed = Some(Failure {
                        stale,
                        attempt,
                        error: e.clone(),
                    });
                }
                Err(e)
            }
        }
    }

    fn logout(&self, _ctx: &Context, client: &Client) -> Result<(), Error> {
        let mut relogin = self.relogin.lock();
        relogin.active = false;
        relogin.failed = None;
        client.sessions().remove(client.origin());
        tracing::info!(user = %self.username, "session cleared");
        Ok(())
    }
}

impl fmt::Debug for CookieAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CookieAuth")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Value of the session cookie among the `Set-Cookie` headers.
fn session_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(SET_COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .filter_map(|v| v.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, value)| name.trim() == SESSION_COOKIE && !value.trim().is_empty())
        .map(|(_, value)| value.trim().to_string())
}
