//! The `_changes` feed.
//!
//! Normal and long-poll feeds arrive as one object with a `results` array
//! plus `last_seq`/`pending`; continuous feeds arrive as one change per line,
//! optionally ending with a `{"last_seq": ..., "pending": ...}` line when the
//! server closes the feed. Both are read through `Rows`.

use std::fmt;

use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use crate::client::Client;
use crate::context::Context;
use crate::error::Error;
use crate::http::{Method, Options};
use crate::iter::{Rows, Shape};

/// Characters left unescaped in a database name used as a path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'-')
    .remove(b'.')
    .remove(b'~')
    .remove(b'$')
    .remove(b'(')
    .remove(b')')
    .remove(b'+');

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Feed {
    #[default]
    Normal,
    LongPoll,
    Continuous,
    EventSource,
}

impl Feed {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::LongPoll => "longpoll",
            Self::Continuous => "continuous",
            Self::EventSource => "eventsource",
        }
    }
}

/// Query options for `Client::changes`.
#[derive(Debug, Clone, Default)]
pub struct ChangesOptions {
    feed: Feed,
    params: Vec<(String, String)>,
}

impl ChangesOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(mut self, feed: Feed) -> Self {
        self.feed = feed;
        self
    }

    pub fn since(self, seq: impl Into<String>) -> Self {
        self.param("since", seq)
    }

    pub fn limit(self, limit: u64) -> Self {
        self.param("limit", limit.to_string())
    }

    pub fn include_docs(self, include: bool) -> Self {
        self.param("include_docs", include.to_string())
    }

    /// Milliseconds between empty heartbeat lines on continuous feeds.
    pub fn heartbeat(self, millis: u64) -> Self {
        self.param("heartbeat", millis.to_string())
    }

    /// Milliseconds the server waits for new changes before ending the feed.
    pub fn timeout(self, millis: u64) -> Self {
        self.param("timeout", millis.to_string())
    }

    /// Any other query parameter, passed through verbatim.
    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }
}

/// A sequence id. Older servers send integers, newer ones opaque strings;
/// both are kept as text.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Seq(pub String);

impl Seq {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for Seq {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match Value::deserialize(deserializer)? {
            Value::String(s) => Ok(Seq(s)),
            Value::Number(n) => Ok(Seq(n.to_string())),
            Value::Null => Ok(Seq::default()),
            other => Err(serde::de::Error::custom(format!("invalid sequence id: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Rev {
    pub rev: String,
}

/// One entry of the changes feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Change {
    pub id: String,
    pub seq: Seq,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub changes: Vec<Rev>,
    #[serde(default)]
    pub doc: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct Summary {
    last_seq: Seq,
    #[serde(default)]
    pending: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Line {
    Change(Change),
    Summary(Summary),
}

/// A live changes feed. Drop or `close` it to release the connection.
#[derive(Debug)]
pub struct Changes {
    rows: Rows<Line>,
    summary: Option<Summary>,
}

impl Changes {
    fn new(rows: Rows<Line>) -> Self {
        Self {
            rows,
            summary: None,
        }
    }

    /// The next change, or `None` once the feed has ended.
    pub fn next_change(&mut self) -> Result<Option<Change>, Error> {
        loop {
            match self.rows.next_row()? {
                Some(Line::Change(change)) => return Ok(Some(change)),
                Some(Line::Summary(summary)) => self.summary = Some(summary),
                None => return Ok(None),
            }
        }
    }

    pub fn close(&mut self) {
        self.rows.close();
    }

    /// Sequence id of the last change in the feed. Empty until the feed has
    /// been read to its end.
    pub fn last_seq(&self) -> String {
        if let Some(summary) = &self.summary {
            return summary.last_seq.0.clone();
        }
        self.rows
            .meta_value::<Seq>("last_seq")
            .map(|seq| seq.0)
            .unwrap_or_default()
    }

    /// Number of changes not included in this response. Zero until the
    /// feed has been read to its end.
    pub fn pending(&self) -> i64 {
        if let Some(pending) = self.summary.as_ref().and_then(|s| s.pending) {
            return pending;
        }
        self.rows.meta_value::<i64>("pending").unwrap_or_default()
    }
}

impl Iterator for Changes {
    type Item = Result<Change, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.rows.next()? {
                Ok(Line::Change(change)) => return Some(Ok(change)),
                Ok(Line::Summary(summary)) => self.summary = Some(summary),
                Err(e) => return Some(Err(e)),
            }
        }
    }
}

impl Client {
    /// Open the changes feed of database `db`.
    #[tracing::instrument(level = "debug", skip(self, ctx, options), fields(feed = options.feed.as_str()))]
    pub fn changes(&self, ctx: &Context, db: &str, options: ChangesOptions) -> Result<Changes, Error> {
        if db.is_empty() {
            return Err(Error::bad_request("database name required"));
        }
        let shape = match options.feed {
            Feed::EventSource => {
                return Err(Error::bad_request("eventsource feed not supported, use 'continuous'"));
            }
            Feed::Continuous => Shape::Unbounded,
            Feed::Normal | Feed::LongPoll => Shape::bounded("results"),
        };

        let mut query = Options::new();
        if options.feed != Feed::Normal {
            query = query.query("feed", options.feed.as_str());
        }
        for (key, value) in options.params {
            query = query.query(key, value);
        }

        let path = format!("/{}/_changes", db_path(db));
        let rows = self.do_rows(ctx, Method::GET, &path, query, shape)?;
        Ok(Changes::new(rows))
    }
}

/// Escape a database name for use as a single path segment.
pub fn db_path(db: &str) -> String {
    utf8_percent_encode(db, SEGMENT).to_string()
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::error::ErrorKind;

    fn changes(body: &str, shape: Shape) -> Changes {
        Changes::new(Rows::new(
            &Context::background(),
            Cursor::new(body.as_bytes().to_vec()),
            shape,
        ))
    }

    #[test]
    fn bounded_feed_reports_summary_after_end() {
        let mut feed = changes(
            r#"{"results":[{"seq":"1-a","id":"doc1","changes":[{"rev":"1-x"}]},{"seq":"2-b","id":"doc2","deleted":true,"changes":[{"rev":"2-y"}]}],"last_seq":"2-b","pending":3}"#,
            Shape::bounded("results"),
        );
        let first = feed.next_change().unwrap().unwrap();
        assert_eq!(first.id, "doc1");
        assert_eq!(first.changes, vec![Rev { rev: "1-x".into() }]);
        assert_eq!(feed.last_seq(), "");
        assert_eq!(feed.pending(), 0);

        let second = feed.next_change().unwrap().unwrap();
        assert!(second.deleted);
        assert!(feed.next_change().unwrap().is_none());
        assert_eq!(feed.last_seq(), "2-b");
        assert_eq!(feed.pending(), 3);
    }

    #[test]
    fn numeric_sequences_are_text() {
        let mut feed = changes(r#"{"last_seq":7,"results":[{"seq":7,"id":"a"}]}"#, Shape::bounded("results"));
        assert_eq!(feed.next_change().unwrap().unwrap().seq, Seq("7".into()));
        assert!(feed.next_change().unwrap().is_none());
        assert_eq!(feed.last_seq(), "7");
    }

    #[test]
    fn continuous_feed_picks_up_trailing_summary() {
        let feed = changes(
            "{\"seq\":\"1-a\",\"id\":\"a\",\"changes\":[]}\n\n{\"seq\":\"2-b\",\"id\":\"b\",\"changes\":[]}\n{\"last_seq\":\"2-b\",\"pending\":0}\n",
            Shape::Unbounded,
        );
        let mut feed = feed;
        let ids: Vec<String> = feed.by_ref().map(|c| c.unwrap().id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(feed.last_seq(), "2-b");
    }

    #[test]
    fn garbage_line_is_bad_response() {
        let mut feed = changes("{\"nope\":true}\n", Shape::Unbounded);
        assert_eq!(feed.next_change().unwrap_err().kind(), ErrorKind::BadResponse);
    }

    #[test]
    fn eventsource_is_rejected_without_io() {
        let client = Client::new("http://127.0.0.1:9").unwrap();
        let err = client
            .changes(
                &Context::background(),
                "db",
                ChangesOptions::new().feed(Feed::EventSource),
            )
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BadRequest);
    }

    #[test]
    fn database_names_are_escaped() {
        assert_eq!(db_path("a/b"), "a%2Fb");
        assert_eq!(db_path("my_db-1$(x)+"), "my_db-1$(x)+");
    }
}
