//! Error taxonomy and response classification.
//!
//! # Design
//! Every failure the transport can produce is a single `Error` value tagged
//! with an `ErrorKind`. Callers branch on the kind (or the HTTP status) and
//! show the message. `Error` is `Clone` so a streaming iterator can hand the
//! same terminal error back on every call after it fails.
//!
//! Classification of HTTP responses consumes the `Response`: the body is read
//! (up to a limit) to extract the server's `{"error", "reason"}` pair and then
//! dropped, so no caller is left holding an undrained body on the error path.

use std::error::Error as StdError;
use std::fmt;
use std::io::{self, Read};
use std::sync::Arc;

use serde::Deserialize;

use crate::http::Response;

/// Upper bound on how much of an error body is read for classification.
pub(crate) const DEFAULT_ERROR_BODY_LIMIT: u64 = 64 * 1024;

/// Stable classification of a failed operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No HTTP response was obtained.
    Network,
    /// The caller's context was cancelled.
    Canceled,
    /// The caller's context deadline (or the client timeout) passed.
    DeadlineExceeded,
    /// 401, or authentication misuse such as logging out twice.
    Unauthorized,
    /// 400, or an invalid caller-supplied argument.
    BadRequest,
    /// 403.
    Forbidden,
    /// 404.
    NotFound,
    /// 409, or authenticating a client that already has a strategy installed.
    Conflict,
    /// 412.
    PreconditionFailed,
    /// Any other 4xx status.
    ClientError,
    /// The server answered with something that could not be understood.
    BadResponse,
    /// 5xx.
    ServerError,
}

impl ErrorKind {
    /// Kind for an HTTP status code, or `None` below 400.
    pub fn from_status(status: u16) -> Option<Self> {
        let kind = match status {
            400 => Self::BadRequest,
            401 => Self::Unauthorized,
            403 => Self::Forbidden,
            404 => Self::NotFound,
            409 => Self::Conflict,
            412 => Self::PreconditionFailed,
            402..=499 => Self::ClientError,
            500..=599 => Self::ServerError,
            _ => return None,
        };
        Some(kind)
    }

    /// Short machine-usable name, used as the default reason.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network_error",
            Self::Canceled => "canceled",
            Self::DeadlineExceeded => "deadline_exceeded",
            Self::Unauthorized => "unauthorized",
            Self::BadRequest => "bad_request",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::PreconditionFailed => "precondition_failed",
            Self::ClientError => "client_error",
            Self::BadResponse => "bad_response",
            Self::ServerError => "server_error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Network => "network error",
            Self::Canceled => "canceled",
            Self::DeadlineExceeded => "deadline exceeded",
            Self::Unauthorized => "unauthorized",
            Self::BadRequest => "bad request",
            Self::Forbidden => "forbidden",
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::PreconditionFailed => "precondition failed",
            Self::ClientError => "client error",
            Self::BadResponse => "bad response",
            Self::ServerError => "server error",
        };
        f.write_str(text)
    }
}

/// A classified transport, HTTP or decoding failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    kind: ErrorKind,
    status: Option<u16>,
    reason: String,
    message: String,
    #[source]
    source: Option<Arc<dyn StdError + Send + Sync>>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            reason: kind.as_str().to_string(),
            message: message.into(),
            source: None,
        }
    }

    /// Transport-level failure: no HTTP exchange completed.
    pub fn network(cause: impl StdError + Send + Sync + 'static) -> Self {
        Self::new(ErrorKind::Network, cause.to_string()).with_source(cause)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn bad_response(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadResponse, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub(crate) fn canceled() -> Self {
        Self::new(ErrorKind::Canceled, "context canceled")
    }

    pub(crate) fn deadline_exceeded() -> Self {
        Self::new(ErrorKind::DeadlineExceeded, "context deadline exceeded")
    }

    pub fn with_source(mut self, cause: impl StdError + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(cause));
        self
    }

    pub(crate) fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// HTTP status of the response that produced this error, if any.
    pub fn status(&self) -> Option<u16> {
        self.status
    }

    /// Machine-usable reason: the server's `error` field, or the kind name.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Human-readable message: the server's `reason` field when available.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Classify a response with status ≥ 400, consuming it.
    ///
    /// A body declared as JSON must decode as `{"error", "reason"}`; if it
    /// does not, the result is a `BadResponse` error that still carries the
    /// original status. Any other body falls back to the status text.
    pub fn from_response(response: Response) -> Self {
        Self::from_response_limited(response, DEFAULT_ERROR_BODY_LIMIT)
    }

    pub(crate) fn from_response_limited(mut response: Response, limit: u64) -> Self {
        let status = response.status();
        let kind = ErrorKind::from_status(status).unwrap_or(ErrorKind::BadResponse);
        let is_json = response.is_json();

        let mut raw = Vec::new();
        let read = match response.take_body() {
            Some(body) => body.take(limit).read_to_end(&mut raw).map(|_| ()),
            None => Ok(()),
        };
        // Whatever remains past the limit is discarded when `response` drops.
        drop(response);

        if let Err(e) = read {
            tracing::warn!(status, error = %e, "failed to read error response body");
        }

        if is_json && !raw.is_empty() {
            return match serde_json::from_slice::<ErrorBody>(&raw) {
                Ok(body) => Self {
                    kind,
                    status: Some(status),
                    reason: body.error.unwrap_or_else(|| kind.as_str().to_string()),
                    message: body.reason.unwrap_or_else(|| status_text(status).to_string()),
                    source: None,
                },
                Err(e) => Self::bad_response(format!("malformed error body for HTTP {status}: {e}"))
                    .with_status(status)
                    .with_source(e),
            };
        }

        Self::new(kind, status_text(status)).with_status(status)
    }
}

impl From<io::Error> for Error {
    /// Body reads that stopped because the request's context ended carry
    /// that context's error; anything else is a network failure.
    fn from(e: io::Error) -> Self {
        match e.get_ref().and_then(|inner| inner.downcast_ref::<Error>()) {
            Some(inner) => inner.clone(),
            None => Self::network(e),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::bad_response(e.to_string()).with_source(e)
    }
}

/// `{"error": "...", "reason": "..."}` as returned by the server on failure.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    reason: Option<String>,
}

/// Canonical reason phrase for the statuses this API produces.
pub(crate) fn status_text(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        409 => "Conflict",
        412 => "Precondition Failed",
        413 => "Request Entity Too Large",
        415 => "Unsupported Media Type",
        416 => "Requested Range Not Satisfiable",
        417 => "Expectation Failed",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        _ => "Unexpected Status",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(status: u16, content_type: Option<&str>, body: &str) -> Response {
        let mut headers = Vec::new();
        if let Some(ct) = content_type {
            headers.push(("content-type", ct));
        }
        Response::from_parts(status, &headers, body.as_bytes().to_vec())
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ErrorKind::from_status(400), Some(ErrorKind::BadRequest));
        assert_eq!(ErrorKind::from_status(401), Some(ErrorKind::Unauthorized));
        assert_eq!(ErrorKind::from_status(404), Some(ErrorKind::NotFound));
        assert_eq!(ErrorKind::from_status(409), Some(ErrorKind::Conflict));
        assert_eq!(ErrorKind::from_status(418), Some(ErrorKind::ClientError));
        assert_eq!(ErrorKind::from_status(503), Some(ErrorKind::ServerError));
        assert_eq!(ErrorKind::from_status(200), None);
        assert_eq!(ErrorKind::from_status(304), None);
    }

    #[test]
    fn json_error_body_is_decoded() {
        let err = Error::from_response(response(
            404,
            Some("application/json"),
            r#"{"error":"not_found","reason":"missing"}"#,
        ));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.status(), Some(404));
        assert_eq!(err.reason(), "not_found");
        assert_eq!(err.message(), "missing");
        assert_eq!(err.to_string(), "not found: missing");
    }

    #[test]
    fn json_content_type_with_charset_is_recognised() {
        let err = Error::from_response(response(
            409,
            Some("application/json; charset=utf-8"),
            r#"{"error":"conflict","reason":"Document update conflict."}"#,
        ));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(err.message(), "Document update conflict.");
    }

    #[test]
    fn malformed_json_body_is_bad_response() {
        let err = Error::from_response(response(500, Some("application/json"), r#"{"error":"#));
        assert_eq!(err.kind(), ErrorKind::BadResponse);
        assert_eq!(err.status(), Some(500));
        assert!(err.source().is_some());
    }

    #[test]
    fn plain_body_falls_back_to_status_text() {
        let err = Error::from_response(response(401, Some("text/plain"), "nope"));
        assert_eq!(err.kind(), ErrorKind::Unauthorized);
        assert_eq!(err.reason(), "unauthorized");
        assert_eq!(err.message(), "Unauthorized");
    }

    #[test]
    fn empty_json_body_falls_back_to_status_text() {
        let err = Error::from_response(response(404, Some("application/json"), ""));
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.message(), "Not Found");
    }

    #[test]
    fn partial_error_body_keeps_defaults() {
        let err = Error::from_response(response(400, Some("application/json"), r#"{"reason":"bad ddoc"}"#));
        assert_eq!(err.kind(), ErrorKind::BadRequest);
        assert_eq!(err.reason(), "bad_request");
        assert_eq!(err.message(), "bad ddoc");
    }

    #[test]
    fn network_error_has_no_status() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = Error::network(io);
        assert_eq!(err.kind(), ErrorKind::Network);
        assert_eq!(err.status(), None);
        assert!(err.to_string().starts_with("network error: "));
    }

    #[test]
    fn errors_are_cloneable() {
        let err = Error::bad_response("broken").with_source(std::io::Error::other("x"));
        let copy = err.clone();
        assert_eq!(copy.kind(), ErrorKind::BadResponse);
        assert_eq!(copy.to_string(), err.to_string());
    }
}
