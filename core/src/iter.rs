//! Pull-based decoding of streamed JSON result sets.
//!
//! # Design
//! A response body arrives in one of two shapes:
//!
//! - **bounded**: `{"total_rows": 2, "rows": [ ... ], "offset": 0}`. One
//!   array-valued key holds the items and every other key is metadata, which
//!   may come before or after the array;
//! - **unbounded**: one JSON value per line until the connection closes, as
//!   sent by continuous feeds.
//!
//! `Rows` walks the body with `Scanner`, so only the current item is ever in
//! memory and a slow consumer simply reads the socket slowly. Metadata keys
//! are buffered as `serde_json::Value`s and exposed once the whole object has
//! been read.
//!
//! The cursor moves `BeforeFirst → Positioned → Exhausted`; any malformed
//! input, transport failure or context cancellation moves it to `Errored`,
//! after which the same error is returned forever. The body is dropped the
//! moment the cursor reaches `Exhausted` or `Errored`, on `close()`, or when
//! `Rows` itself is dropped, and never more than once.

use std::fmt;
use std::io::Read;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::context::Context;
use crate::error::Error;
use crate::scanner::{ScanError, Scanner};

/// Layout of a streamed response body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Shape {
    /// A JSON object whose `items` key holds the array of results.
    Bounded { items: String },
    /// Whitespace-separated JSON values, terminated by end of stream.
    Unbounded,
}

impl Shape {
    pub fn bounded(items: impl Into<String>) -> Self {
        Self::Bounded {
            items: items.into(),
        }
    }
}

/// Observable position of a `Rows` cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    BeforeFirst,
    Positioned,
    Exhausted,
    Errored,
}

enum State {
    BeforeFirst,
    Positioned,
    Exhausted,
    Errored(Error),
}

type Decoder<T> = Box<dyn FnMut(&[u8]) -> Result<T, Error> + Send>;

pub struct Rows<T> {
    scanner: Option<Scanner<Box<dyn Read + Send>>>,
    shape: Shape,
    state: State,
    ctx: Context,
    decode: Decoder<T>,
    buf: Vec<u8>,
    meta: Map<String, Value>,
    /// Bounded only: the item array has been entered.
    in_items: bool,
    /// Bounded only: no item has been read from the array yet.
    first_item: bool,
    /// The body was read to its natural end.
    completed: bool,
    error_yielded: bool,
    items_read: u64,
}

impl<T: DeserializeOwned> Rows<T> {
    /// Decode each item with serde.
    pub fn new(ctx: &Context, body: impl Read + Send + 'static, shape: Shape) -> Self {
        Self::with_decoder(ctx, body, shape, |raw: &[u8]| {
            serde_json::from_slice(raw).map_err(Error::from)
        })
    }
}

impl<T> Rows<T> {
    /// Decode each item's raw JSON bytes with `decode`.
    pub fn with_decoder<F>(ctx: &Context, body: impl Read + Send + 'static, shape: Shape, decode: F) -> Self
    where
        F: FnMut(&[u8]) -> Result<T, Error> + Send + 'static,
    {
        let body: Box<dyn Read + Send> = Box::new(body);
        Self {
            scanner: Some(Scanner::new(body)),
            shape,
            state: State::BeforeFirst,
            ctx: ctx.clone(),
            decode: Box::new(decode),
            buf: Vec::new(),
            meta: Map::new(),
            in_items: false,
            first_item: true,
            completed: false,
            error_yielded: false,
            items_read: 0,
        }
    }

    /// Advance to the next item.
    ///
    /// `Ok(None)` signals the end of the sequence and is returned again on
    /// every later call. After a failure every later call returns the same
    /// error.
    pub fn next_row(&mut self) -> Result<Option<T>, Error> {
        match &self.state {
            State::Exhausted => return Ok(None),
            State::Errored(e) => return Err(e.clone()),
            State::BeforeFirst | State::Positioned => {}
        }
        if let Some(err) = self.ctx.err() {
            return Err(self.fail(err));
        }

        let step = match self.scanner.as_mut() {
            Some(scanner) => match &self.shape {
                Shape::Unbounded => step_unbounded(scanner, &mut self.buf),
                Shape::Bounded { items } => step_bounded(
                    scanner,
                    &mut self.buf,
                    &mut self.meta,
                    items,
                    &mut self.in_items,
                    &mut self.first_item,
                ),
            },
            None => Ok(false),
        };

        match step {
            Ok(true) => match (self.decode)(&self.buf) {
                Ok(item) => {
                    self.state = State::Positioned;
                    self.items_read += 1;
                    Ok(Some(item))
                }
                Err(e) => Err(self.fail(e)),
            },
            Ok(false) => {
                self.completed = true;
                self.state = State::Exhausted;
                self.release();
                Ok(None)
            }
            Err(e) => {
                let err = self.classify(e);
                Err(self.fail(err))
            }
        }
    }

    /// Release the body. Later calls to `next_row` report end of sequence,
    /// or the terminal error if one was already hit.
    pub fn close(&mut self) {
        if matches!(self.state, State::BeforeFirst | State::Positioned) {
            self.state = State::Exhausted;
        }
        self.release();
    }

    pub fn state(&self) -> CursorState {
        match self.state {
            State::BeforeFirst => CursorState::BeforeFirst,
            State::Positioned => CursorState::Positioned,
            State::Exhausted => CursorState::Exhausted,
            State::Errored(_) => CursorState::Errored,
        }
    }

    /// Number of items returned so far.
    pub fn items_read(&self) -> u64 {
        self.items_read
    }

    /// Metadata accumulated from the bounded wrapper object.
    ///
    /// `None` until the body has been read to its end; always `None` for
    /// the unbounded shape.
    pub fn meta(&self) -> Option<&Map<String, Value>> {
        match self.shape {
            Shape::Bounded { .. } if self.completed => Some(&self.meta),
            _ => None,
        }
    }

    /// Decode one metadata value, or `None` when it is absent, not yet
    /// available, or of the wrong type.
    pub fn meta_value<M: DeserializeOwned>(&self, key: &str) -> Option<M> {
        let value = self.meta()?.get(key)?;
        serde_json::from_value(value.clone()).ok()
    }

    fn release(&mut self) {
        if self.scanner.take().is_some() {
            tracing::trace!(items = self.items_read, "response body released");
        }
    }

    fn fail(&mut self, err: Error) -> Error {
        tracing::debug!(error = %err, items = self.items_read, "result stream failed");
        self.state = State::Errored(err.clone());
        self.release();
        err
    }

    fn classify(&self, err: ScanError) -> Error {
        match err {
            ScanError::Syntax(msg) => Error::bad_response(msg),
            ScanError::Io(e) => {
                if let Some(ctx_err) = self.ctx.err() {
                    return ctx_err;
                }
                Error::from(e)
            }
        }
    }
}

impl<T> Iterator for Rows<T> {
    type Item = Result<T, Error>;

    /// Yields the terminal error once, then ends.
    fn next(&mut self) -> Option<Self::Item> {
        if self.error_yielded {
            return None;
        }
        match self.next_row() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => None,
            Err(e) => {
                self.error_yielded = true;
                Some(Err(e))
            }
        }
    }
}

impl<T> fmt::Debug for Rows<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rows")
            .field("shape", &self.shape)
            .field("state", &self.state())
            .field("items_read", &self.items_read)
            .field("body_open", &self.scanner.is_some())
            .finish()
    }
}

fn step_unbounded<R: Read>(scanner: &mut Scanner<R>, buf: &mut Vec<u8>) -> Result<bool, ScanError> {
    if scanner.peek_token()?.is_none() {
        return Ok(false);
    }
    scanner.read_value(buf)?;
    Ok(true)
}

fn step_bounded<R: Read>(
    scanner: &mut Scanner<R>,
    buf: &mut Vec<u8>,
    meta: &mut Map<String, Value>,
    items_key: &str,
    in_items: &mut bool,
    first_item: &mut bool,
) -> Result<bool, ScanError> {
    if !*in_items {
        if !enter_items(scanner, buf, meta, items_key)? {
            return Ok(false);
        }
        *in_items = true;
    }

    match scanner.peek_token()? {
        Some(b']') => {
            scanner.bump();
            finish_object(scanner, buf, meta, items_key)?;
            return Ok(false);
        }
        None => return Err(ScanError::Syntax("unexpected end of input inside result array".into())),
        Some(_) => {}
    }
    if !*first_item {
        scanner.expect(b',')?;
    }
    *first_item = false;
    scanner.read_value(buf)?;
    Ok(true)
}

/// Walk from the start of the wrapper object to just inside the item array,
/// collecting metadata on the way. `false` if the object has no item key.
fn enter_items<R: Read>(
    scanner: &mut Scanner<R>,
    buf: &mut Vec<u8>,
    meta: &mut Map<String, Value>,
    items_key: &str,
) -> Result<bool, ScanError> {
    scanner.expect(b'{')?;
    let mut first = true;
    loop {
        if scanner.peek_token()? == Some(b'}') {
            scanner.bump();
            return Ok(false);
        }
        if !first {
            scanner.expect(b',')?;
        }
        first = false;
        let key = scanner.read_key(buf)?;
        if key == items_key {
            scanner.expect(b'[')?;
            return Ok(true);
        }
        read_meta(scanner, buf, meta, key)?;
    }
}

/// Consume the metadata that follows the item array and the closing brace.
fn finish_object<R: Read>(
    scanner: &mut Scanner<R>,
    buf: &mut Vec<u8>,
    meta: &mut Map<String, Value>,
    items_key: &str,
) -> Result<(), ScanError> {
    loop {
        match scanner.peek_token()? {
            Some(b'}') => {
                scanner.bump();
                return Ok(());
            }
            Some(b',') => {
                scanner.bump();
                let key = scanner.read_key(buf)?;
                if key == items_key {
                    return Err(ScanError::Syntax(format!("duplicate result key \"{key}\"")));
                }
                read_meta(scanner, buf, meta, key)?;
            }
            Some(b) => {
                return Err(ScanError::Syntax(format!(
                    "unexpected character '{}' after result array",
                    b.escape_ascii()
                )))
            }
            None => return Err(ScanError::Syntax("unexpected end of input after result array".into())),
        }
    }
}

fn read_meta<R: Read>(
    scanner: &mut Scanner<R>,
    buf: &mut Vec<u8>,
    meta: &mut Map<String, Value>,
    key: String,
) -> Result<(), ScanError> {
    scanner.read_value(buf)?;
    let value = serde_json::from_slice(buf)
        .map_err(|e| ScanError::Syntax(format!("invalid value for \"{key}\": {e}")))?;
    meta.insert(key, value);
    Ok(())
}
