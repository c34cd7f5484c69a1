//! Request descriptors and responses.
//!
//! # Design
//! `Options` describes everything about a request except its method and
//! path: query parameters (ordered, repeatable), an optional body, and the
//! handful of headers this API cares about. A body is either buffered bytes,
//! which can be replayed after a re-login, or a caller-supplied reader that
//! is streamed to the server once.
//!
//! `Response` owns the body as a reader. On the success path the caller
//! consumes it; every error path inside the crate drains or drops it first.

use std::fmt;
use std::io::{self, Read};
use std::sync::mpsc::{self, Receiver};
use std::thread;

use serde::de::DeserializeOwned;
use serde::Serialize;
use ureq::http::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE, ETAG};

use crate::context::Context;
use crate::error::Error;

pub use ureq::http::Method;

/// Header set when `Options::full_commit` is given.
pub const FULL_COMMIT_HEADER: &str = "X-Couch-Full-Commit";

/// Header set when `Options::if_none_match` is given.
pub const IF_NONE_MATCH_HEADER: &str = "If-None-Match";

pub(crate) const JSON_CONTENT_TYPE: &str = "application/json";

/// How much of an unwanted body is read before giving up on connection reuse.
const DISCARD_LIMIT: u64 = 1024 * 1024;

/// Body of an outgoing request.
pub enum RequestBody {
    /// Fully buffered; may be sent again when a request is replayed.
    Bytes(Vec<u8>),
    /// Streamed to the server once, never buffered.
    Reader(Box<dyn Read + Send + Sync>),
}

impl RequestBody {
    pub fn is_replayable(&self) -> bool {
        matches!(self, Self::Bytes(_))
    }
}

impl fmt::Debug for RequestBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bytes(b) => f.debug_tuple("Bytes").field(&b.len()).finish(),
            Self::Reader(_) => f.write_str("Reader(..)"),
        }
    }
}

/// Per-call request options.
#[derive(Debug, Default)]
pub struct Options {
    pub(crate) query: Vec<(String, String)>,
    pub(crate) body: Option<RequestBody>,
    pub(crate) content_type: Option<String>,
    pub(crate) full_commit: Option<bool>,
    pub(crate) if_none_match: Option<String>,
    pub(crate) headers: Vec<(String, String)>,
}

impl Options {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a query parameter. Repeating a key keeps every value, in order.
    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    /// Serialize `value` as the JSON request body.
    pub fn json<T: Serialize + ?Sized>(mut self, value: &T) -> Result<Self, Error> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| Error::bad_request(format!("failed to encode request body: {e}")))?;
        self.body = Some(RequestBody::Bytes(bytes));
        Ok(self)
    }

    pub fn body_bytes(mut self, bytes: impl Into<Vec<u8>>) -> Self {
        self.body = Some(RequestBody::Bytes(bytes.into()));
        self
    }

    /// Stream `reader` as the request body.
    pub fn body_reader(mut self, reader: impl Read + Send + Sync + 'static) -> Self {
        self.body = Some(RequestBody::Reader(Box::new(reader)));
        self
    }

    /// Override the default `application/json` content type.
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn full_commit(mut self, full_commit: bool) -> Self {
        self.full_commit = Some(full_commit);
        self
    }

    pub fn if_none_match(mut self, etag: impl Into<String>) -> Self {
        self.if_none_match = Some(etag.into());
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub(crate) fn body_is_replayable(&self) -> bool {
        self.body.as_ref().map_or(true, RequestBody::is_replayable)
    }

    /// Every header this request carries, apart from authentication.
    pub(crate) fn header_pairs(&self) -> Vec<(String, String)> {
        let mut pairs = vec![("Accept".to_string(), JSON_CONTENT_TYPE.to_string())];
        if self.body.is_some() || self.content_type.is_some() {
            let ct = self.content_type.as_deref().unwrap_or(JSON_CONTENT_TYPE);
            pairs.push(("Content-Type".to_string(), ct.to_string()));
        }
        if let Some(full_commit) = self.full_commit {
            pairs.push((FULL_COMMIT_HEADER.to_string(), full_commit.to_string()));
        }
        if let Some(etag) = &self.if_none_match {
            pairs.push((IF_NONE_MATCH_HEADER.to_string(), quote_etag(etag)));
        }
        pairs.extend(self.headers.iter().cloned());
        pairs
    }
}

/// ETags go on the wire quoted; callers usually hold the bare revision.
fn quote_etag(etag: &str) -> String {
    if etag.starts_with('"') {
        etag.to_string()
    } else {
        format!("\"{etag}\"")
    }
}

/// A received HTTP response with a streaming body.
pub struct Response {
    status: u16,
    headers: HeaderMap,
    body: Option<Box<dyn Read + Send>>,
}

impl Response {
    pub fn new(status: u16, headers: HeaderMap, body: impl Read + Send + 'static) -> Self {
        Self {
            status,
            headers,
            body: Some(Box::new(body)),
        }
    }

    /// Build a response from plain data. Header pairs that are not valid
    /// HTTP are skipped.
    pub fn from_parts(status: u16, headers: &[(&str, &str)], body: Vec<u8>) -> Self {
        let mut map = HeaderMap::new();
        for (name, value) in headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                map.append(name, value);
            }
        }
        Self::new(status, map, io::Cursor::new(body))
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// First value of `name`, if present and valid text.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub(crate) fn is_json(&self) -> bool {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .is_some_and(|mime| mime.trim().eq_ignore_ascii_case(JSON_CONTENT_TYPE))
    }

    /// The `ETag` header with surrounding quotes removed.
    ///
    /// A missing ETag is always a `BadResponse`.
    pub fn etag(&self) -> Result<String, Error> {
        self.headers
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_matches('"').to_string())
            .ok_or_else(|| Error::bad_response("ETag header not found"))
    }

    pub(crate) fn take_body(&mut self) -> Option<Box<dyn Read + Send>> {
        self.body.take()
    }

    /// Hand the body over to the caller.
    pub fn into_body(mut self) -> Box<dyn Read + Send> {
        self.take_body().unwrap_or_else(|| Box::new(io::empty()))
    }

    /// Decode the whole body as JSON.
    pub fn json<T: DeserializeOwned>(self) -> Result<T, Error> {
        let mut raw = Vec::new();
        self.into_body().read_to_end(&mut raw)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn text(self) -> Result<String, Error> {
        let mut raw = Vec::new();
        self.into_body().read_to_end(&mut raw)?;
        String::from_utf8(raw).map_err(|e| Error::bad_response("response body is not UTF-8").with_source(e))
    }

    /// Read and drop whatever body is left. Failures are logged, not returned.
    pub fn discard(mut self) {
        if let Some(body) = self.take_body() {
            if let Err(e) = io::copy(&mut body.take(DISCARD_LIMIT), &mut io::sink()) {
                tracing::warn!(status = self.status, error = %e, "failed to drain response body");
            }
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .field("body_open", &self.body.is_some())
            .finish()
    }
}

/// Largest chunk the body pump hands over at a time.
const CHUNK_SIZE: usize = 8 * 1024;

/// Response body read on a pump thread, so a read blocked on a quiet socket
/// never holds the caller past its context.
///
/// Reads fail with the context's error once it is cancelled or its deadline
/// passes. The pump exits when the server closes the body or when it finds
/// this reader dropped.
pub(crate) struct ContextReader {
    chunks: Receiver<io::Result<Vec<u8>>>,
    ctx: Context,
    pending: Vec<u8>,
    pos: usize,
    done: bool,
}

impl ContextReader {
    pub(crate) fn spawn(mut inner: impl Read + Send + 'static, ctx: Context) -> io::Result<Self> {
        let (tx, chunks) = mpsc::sync_channel(0);
        thread::Builder::new()
            .name("couch-body".to_string())
            .spawn(move || loop {
                let mut chunk = vec![0u8; CHUNK_SIZE];
                let sent = match inner.read(&mut chunk) {
                    Ok(0) => return,
                    Ok(n) => {
                        chunk.truncate(n);
                        tx.send(Ok(chunk))
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = tx.send(Err(e));
                        return;
                    }
                };
                if sent.is_err() {
                    return;
                }
            })?;
        Ok(Self {
            chunks,
            ctx,
            pending: Vec::new(),
            pos: 0,
            done: false,
        })
    }
}

impl Read for ContextReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(err) = self.ctx.err() {
            return Err(io::Error::other(err));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        while self.pos == self.pending.len() {
            if self.done {
                return Ok(0);
            }
            match self.ctx.recv(&self.chunks).map_err(io::Error::other)? {
                Some(Ok(chunk)) => {
                    self.pending = chunk;
                    self.pos = 0;
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Err(e);
                }
                None => self.done = true,
            }
        }
        let n = (self.pending.len() - self.pos).min(buf.len());
        buf[..n].copy_from_slice(&self.pending[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}
