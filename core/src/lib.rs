//! Blocking HTTP transport for a CouchDB-style document database.
//!
//! # Overview
//! Three pieces carry all of the protocol logic that higher-level database
//! operations build on:
//!
//! - authentication strategies (`BasicAuth`, `CookieAuth`) that turn
//!   credentials into authorized requests and survive session expiry;
//! - the request executor (`Client::do_request` and friends) that dispatches
//!   requests and classifies failures into `ErrorKind`s;
//! - the streaming iterator (`Rows`) that decodes large or never-ending JSON
//!   bodies one item at a time.
//!
//! # Design
//! - Every blocking call takes a `Context` for cancellation and deadlines.
//! - A `Client` is shared across threads; its only mutable state is the
//!   session store and the installed strategy.
//! - The only automatic retry is a single re-login and replay after a 401.
//! - The library emits `tracing` events and never installs a subscriber.

pub mod auth;
pub mod changes;
pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod http;
pub mod iter;
mod scanner;

pub use auth::{Authenticator, BasicAuth, CookieAuth, Credential, Session, SessionStore, UserContext};
pub use changes::{Change, Changes, ChangesOptions, Feed, Seq};
pub use client::{Client, ClientBuilder};
pub use config::ClientConfig;
pub use context::Context;
pub use error::{Error, ErrorKind};
pub use http::{Method, Options, RequestBody, Response, FULL_COMMIT_HEADER, IF_NONE_MATCH_HEADER};
pub use iter::{CursorState, Rows, Shape};
