//! Request executor: one `Client` per logical server.
//!
//! # Design
//! `Client` owns the transport (`ureq::Agent`), the server URL, the session
//! store and the installed authentication strategy. Every public call takes
//! a `Context` and blocks until the exchange completes; the client is `Sync`
//! so any number of threads may share it.
//!
//! A request goes through `do_request`, which attaches the current
//! credential, dispatches, and on a 401 gives the strategy a single chance
//! to re-authenticate before replaying. The `do_error`, `do_json` and
//! `do_rows` forms add status classification and body decoding on top.
//! Whenever one of them returns an error, the response body has already
//! been drained or dropped.
//!
//! The exchange itself runs on a short-lived worker thread and the body is
//! read through a pump thread, so a cancelled context releases the caller
//! at once even while the socket is quiet. The abandoned thread ends when
//! the server answers or the transport timeout fires.

use std::fmt;
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};
use url::Url;

use crate::auth::{Authenticator, Credential, SessionInfo, SessionStore, UserContext, SESSION_PATH};
use crate::config::ClientConfig;
use crate::context::Context;
use crate::error::{Error, ErrorKind};
use crate::http::{ContextReader, Method, Options, RequestBody, Response};
use crate::iter::{Rows, Shape};

pub struct Client {
    base: Url,
    origin: String,
    agent: ureq::Agent,
    config: ClientConfig,
    sessions: SessionStore,
    auth: RwLock<Option<Arc<dyn Authenticator>>>,
    install: Mutex<()>,
}

impl Client {
    /// Client for the server at `url` with default configuration.
    pub fn new(url: &str) -> Result<Self, Error> {
        Self::with_config(url, ClientConfig::default())
    }

    pub fn builder(url: &str) -> ClientBuilder {
        ClientBuilder {
            url: url.to_string(),
            config: ClientConfig::default(),
        }
    }

    pub fn with_config(url: &str, config: ClientConfig) -> Result<Self, Error> {
        let base = Url::parse(url)
            .map_err(|e| Error::bad_request(format!("invalid server URL {url:?}: {e}")).with_source(e))?;
        if !matches!(base.scheme(), "http" | "https") || !base.has_host() {
            return Err(Error::bad_request(format!("unsupported server URL {url:?}")));
        }
        let origin = base.origin().ascii_serialization();

        let agent = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .build()
            .new_agent();

        Ok(Self {
            base,
            origin,
            agent,
            config,
            sessions: SessionStore::new(),
            auth: RwLock::new(None),
            install: Mutex::new(()),
        })
    }

    /// `scheme://host:port` of the server; the key for stored sessions.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    /// The raw session token for this server, if one is stored. Never
    /// performs I/O.
    pub fn cookie(&self) -> Option<String> {
        self.sessions.get(&self.origin).map(|s| s.token)
    }

    pub fn is_authenticated(&self) -> bool {
        self.auth.read().is_some()
    }

    /// Install `auth` on this client.
    ///
    /// Fails with `Conflict` if a strategy is already installed; the
    /// existing session is left as it was.
    #[tracing::instrument(level = "debug", skip_all, fields(origin = %self.origin))]
    pub fn authenticate<A>(&self, ctx: &Context, auth: A) -> Result<(), Error>
    where
        A: Authenticator + 'static,
    {
        let _install = self.install.lock();
        if self.auth.read().is_some() {
            return Err(Error::conflict("client is already authenticated"));
        }
        auth.authenticate(ctx, self)?;
        info!(strategy = ?auth, "authenticated");
        *self.auth.write() = Some(Arc::new(auth));
        Ok(())
    }

    /// Remove the installed strategy and any session it holds. The server
    /// is not contacted.
    #[tracing::instrument(level = "debug", skip_all, fields(origin = %self.origin))]
    pub fn logout(&self, ctx: &Context) -> Result<(), Error> {
        let _install = self.install.lock();
        let auth = self
            .auth
            .write()
            .take()
            .ok_or_else(|| Error::unauthorized("client is not authenticated"))?;
        auth.logout(ctx, self)
    }

    /// Ask the server who the current credentials belong to.
    pub fn session(&self, ctx: &Context) -> Result<UserContext, Error> {
        let info: SessionInfo = self.do_json(ctx, Method::GET, SESSION_PATH, Options::new())?;
        Ok(info.user_ctx)
    }

    /// Perform a request and return the raw response, whatever its status.
    #[tracing::instrument(level = "debug", skip(self, ctx, method, options), fields(%method))]
    pub fn do_request(
        &self,
        ctx: &Context,
        method: Method,
        path: &str,
        mut options: Options,
    ) -> Result<Response, Error> {
        if path.is_empty() {
            return Err(Error::bad_request("request path required"));
        }
        if let Some(err) = ctx.err() {
            return Err(err);
        }

        let auth = self.auth.read().clone();
        let credential = auth.as_ref().and_then(|a| a.credential(self));
        let replayable = options.body_is_replayable();
        let response = self.dispatch(ctx, &method, path, &mut options, credential.as_ref())?;

        let auth = match auth {
            Some(auth) if response.status() == 401 => auth,
            _ => return Ok(response),
        };
        if !replayable {
            debug!("streamed request body cannot be replayed after 401");
            return Ok(response);
        }
        match auth.refresh(ctx, self, credential.as_ref()) {
            Ok(true) => {}
            Ok(false) => return Ok(response),
            Err(e) if matches!(e.kind(), ErrorKind::Canceled | ErrorKind::DeadlineExceeded) => {
                response.discard();
                return Err(e);
            }
            Err(e) => {
                warn!(error = %e, "re-authentication failed");
                return Ok(response);
            }
        }

        response.discard();
        let credential = auth.credential(self);
        debug!("replaying request with renewed credentials");
        self.dispatch(ctx, &method, path, &mut options, credential.as_ref())
    }

    /// Like `do_request`, but any status ≥ 400 becomes an error.
    pub fn do_error(&self, ctx: &Context, method: Method, path: &str, options: Options) -> Result<Response, Error> {
        let response = self.do_request(ctx, method, path, options)?;
        self.check(response)
    }

    /// Like `do_error`, then decode the body as JSON.
    pub fn do_json<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        method: Method,
        path: &str,
        options: Options,
    ) -> Result<T, Error> {
        self.do_error(ctx, method, path, options)?.json()
    }

    /// Like `do_error`, then stream the body as a sequence of `T`.
    pub fn do_rows<T: DeserializeOwned>(
        &self,
        ctx: &Context,
        method: Method,
        path: &str,
        options: Options,
        shape: Shape,
    ) -> Result<Rows<T>, Error> {
        let response = self.do_error(ctx, method, path, options)?;
        Ok(Rows::new(ctx, response.into_body(), shape))
    }

    pub(crate) fn check(&self, response: Response) -> Result<Response, Error> {
        if response.status() >= 400 {
            return Err(Error::from_response_limited(response, self.config.error_body_limit));
        }
        Ok(response)
    }

    /// One HTTP exchange with exactly the given credential; no retries.
    pub(crate) fn dispatch(
        &self,
        ctx: &Context,
        method: &Method,
        path: &str,
        options: &mut Options,
        credential: Option<&Credential>,
    ) -> Result<Response, Error> {
        if let Some(err) = ctx.err() {
            return Err(err);
        }
        let url = self.url_for(path, &options.query);

        let mut builder = ureq::http::Request::builder()
            .method(method.clone())
            .uri(url.as_str())
            .header("User-Agent", self.config.user_agent.as_str());
        for (name, value) in options.header_pairs() {
            builder = builder.header(name, value);
        }
        if let Some(credential) = credential {
            builder = builder.header(credential.header_name(), credential.header_value());
        }

        let payload = match options.body.take() {
            None => Payload::Empty,
            Some(RequestBody::Bytes(bytes)) => {
                let payload = Payload::Bytes(bytes.clone());
                options.body = Some(RequestBody::Bytes(bytes));
                payload
            }
            Some(RequestBody::Reader(reader)) => Payload::Reader(reader),
        };
        let request = builder.body(payload).map_err(invalid_request)?;

        debug!(%method, url = %url, "dispatching request");
        let agent = self.agent.clone();
        let timeout = effective_timeout(ctx.remaining(), self.config.timeout);
        let result = ctx.run("couch-request", move || send(&agent, request, timeout))?;
        if let Some(err) = ctx.err() {
            debug!("context ended while the request was in flight");
            return Err(err);
        }

        let response = result.map_err(|e| transport_error(ctx, e))?;
        let (parts, body) = response.into_parts();
        debug!(status = parts.status.as_u16(), "response received");
        let body = ContextReader::spawn(body.into_reader(), ctx.clone()).map_err(Error::network)?;
        Ok(Response::new(parts.status.as_u16(), parts.headers, body))
    }

    fn url_for(&self, path: &str, query: &[(String, String)]) -> Url {
        let mut url = self.base.clone();
        let joined = format!(
            "{}/{}",
            self.base.path().trim_end_matches('/'),
            path.trim_start_matches('/')
        );
        url.set_path(&joined);
        url.set_query(None);
        if !query.is_empty() {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                pairs.append_pair(key, value);
            }
        }
        url
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("base", &self.base.as_str())
            .field("config", &self.config)
            .field("auth", &*self.auth.read())
            .finish()
    }
}

/// Fluent construction of a `Client`.
#[derive(Debug, Clone)]
pub struct ClientBuilder {
    url: String,
    config: ClientConfig,
}

impl ClientBuilder {
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn error_body_limit(mut self, limit: u64) -> Self {
        self.config.error_body_limit = limit;
        self
    }

    pub fn build(self) -> Result<Client, Error> {
        Client::with_config(&self.url, self.config)
    }
}

/// Request body as handed to the worker thread.
enum Payload {
    Empty,
    Bytes(Vec<u8>),
    Reader(Box<dyn Read + Send + Sync>),
}

/// Runs one exchange on the calling thread.
fn send(
    agent: &ureq::Agent,
    request: ureq::http::Request<Payload>,
    timeout: Option<Duration>,
) -> Result<ureq::http::Response<ureq::Body>, ureq::Error> {
    let (parts, payload) = request.into_parts();
    match payload {
        Payload::Empty => run(agent, ureq::http::Request::from_parts(parts, ()), timeout),
        Payload::Bytes(bytes) => run(agent, ureq::http::Request::from_parts(parts, bytes), timeout),
        Payload::Reader(mut reader) => {
            let body = ureq::SendBody::from_reader(reader.as_mut());
            run(agent, ureq::http::Request::from_parts(parts, body), timeout)
        }
    }
}

fn run<S: ureq::AsSendBody>(
    agent: &ureq::Agent,
    request: ureq::http::Request<S>,
    timeout: Option<Duration>,
) -> Result<ureq::http::Response<ureq::Body>, ureq::Error> {
    let request = agent.configure_request(request).timeout_global(timeout).build();
    agent.run(request)
}

fn effective_timeout(remaining: Option<Duration>, configured: Option<Duration>) -> Option<Duration> {
    match (remaining, configured) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn invalid_request(e: ureq::http::Error) -> Error {
    Error::bad_request(format!("invalid request: {e}")).with_source(e)
}

fn transport_error(ctx: &Context, e: ureq::Error) -> Error {
    if let Some(err) = ctx.err() {
        return err.with_source(e);
    }
    if matches!(e, ureq::Error::Timeout(_)) {
        return Error::new(ErrorKind::DeadlineExceeded, format!("request timed out: {e}")).with_source(e);
    }
    Error::network(e)
}
