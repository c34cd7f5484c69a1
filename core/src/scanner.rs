//! Incremental JSON tokenizer over a byte stream.
//!
//! The scanner only understands JSON's structure: it finds object and array
//! punctuation, reads object keys, and isolates the raw bytes of one complete
//! value at a time. Validating and decoding those bytes is left to
//! `serde_json`, so at most one value is held in memory while a response body
//! of any length is walked.

use std::fmt;
use std::io::{self, BufRead, BufReader, Read};

#[derive(Debug)]
pub(crate) enum ScanError {
    Io(io::Error),
    Syntax(String),
}

impl ScanError {
    fn eof(expected: &str) -> Self {
        Self::Syntax(format!("unexpected end of input, expected {expected}"))
    }

    fn unexpected(byte: u8, expected: &str) -> Self {
        Self::Syntax(format!(
            "unexpected character '{}', expected {expected}",
            byte.escape_ascii()
        ))
    }
}

impl fmt::Display for ScanError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "read failed: {e}"),
            Self::Syntax(msg) => f.write_str(msg),
        }
    }
}

impl From<io::Error> for ScanError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub(crate) struct Scanner<R> {
    reader: BufReader<R>,
}

impl<R: Read> Scanner<R> {
    pub(crate) fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
        }
    }

    fn peek(&mut self) -> Result<Option<u8>, ScanError> {
        loop {
            match self.reader.fill_buf() {
                Ok(buf) => return Ok(buf.first().copied()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    pub(crate) fn bump(&mut self) {
        self.reader.consume(1);
    }

    fn next_byte(&mut self) -> Result<Option<u8>, ScanError> {
        let byte = self.peek()?;
        if byte.is_some() {
            self.bump();
        }
        Ok(byte)
    }

    /// Skip whitespace and return the next significant byte without
    /// consuming it. `None` at end of input.
    pub(crate) fn peek_token(&mut self) -> Result<Option<u8>, ScanError> {
        loop {
            match self.peek()? {
                Some(b' ' | b'\t' | b'\n' | b'\r') => self.bump(),
                other => return Ok(other),
            }
        }
    }

    pub(crate) fn expect(&mut self, wanted: u8) -> Result<(), ScanError> {
        let expected = format!("'{}'", wanted as char);
        match self.peek_token()? {
            Some(b) if b == wanted => {
                self.bump();
                Ok(())
            }
            Some(b) => Err(ScanError::unexpected(b, &expected)),
            None => Err(ScanError::eof(&expected)),
        }
    }

    /// Read an object key and the `:` that follows it.
    pub(crate) fn read_key(&mut self, scratch: &mut Vec<u8>) -> Result<String, ScanError> {
        match self.peek_token()? {
            Some(b'"') => {}
            Some(b) => return Err(ScanError::unexpected(b, "an object key")),
            None => return Err(ScanError::eof("an object key")),
        }
        scratch.clear();
        self.read_string(scratch)?;
        let key = serde_json::from_slice::<String>(scratch)
            .map_err(|e| ScanError::Syntax(format!("invalid object key: {e}")))?;
        self.expect(b':')?;
        Ok(key)
    }

    /// Copy the raw bytes of the next complete JSON value into `out`.
    pub(crate) fn read_value(&mut self, out: &mut Vec<u8>) -> Result<(), ScanError> {
        out.clear();
        match self.peek_token()? {
            None => Err(ScanError::eof("a value")),
            Some(b'"') => self.read_string(out),
            Some(b'{' | b'[') => self.read_container(out),
            Some(b @ (b'}' | b']' | b',' | b':')) => Err(ScanError::unexpected(b, "a value")),
            Some(_) => self.read_scalar(out),
        }
    }

    fn read_string(&mut self, out: &mut Vec<u8>) -> Result<(), ScanError> {
        // Opening quote.
        self.bump();
        out.push(b'"');
        loop {
            match self.next_byte()? {
                None => return Err(ScanError::eof("end of string")),
                Some(b'\\') => {
                    out.push(b'\\');
                    match self.next_byte()? {
                        Some(escaped) => out.push(escaped),
                        None => return Err(ScanError::eof("escape sequence")),
                    }
                }
                Some(b'"') => {
                    out.push(b'"');
                    return Ok(());
                }
                Some(b) => out.push(b),
            }
        }
    }

    fn read_container(&mut self, out: &mut Vec<u8>) -> Result<(), ScanError> {
        let mut depth = 0usize;
        loop {
            let byte = match self.peek()? {
                Some(b) => b,
                None => return Err(ScanError::eof("end of object or array")),
            };
            match byte {
                b'"' => {
                    self.read_string(out)?;
                    continue;
                }
                b'{' | b'[' => depth += 1,
                b'}' | b']' => depth -= 1,
                _ => {}
            }
            out.push(byte);
            self.bump();
            if depth == 0 {
                return Ok(());
            }
        }
    }

    fn read_scalar(&mut self, out: &mut Vec<u8>) -> Result<(), ScanError> {
        while let Some(b) = self.peek()? {
            if matches!(b, b' ' | b'\t' | b'\n' | b'\r' | b',' | b']' | b'}' | b':') {
                break;
            }
            out.push(b);
            self.bump();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scanner(input: &str) -> Scanner<io::Cursor<Vec<u8>>> {
        Scanner::new(io::Cursor::new(input.as_bytes().to_vec()))
    }

    fn values(input: &str) -> Vec<String> {
        let mut s = scanner(input);
        let mut buf = Vec::new();
        let mut out = Vec::new();
        while s.peek_token().unwrap().is_some() {
            s.read_value(&mut buf).unwrap();
            out.push(String::from_utf8(buf.clone()).unwrap());
        }
        out
    }

    #[test]
    fn splits_newline_delimited_values() {
        let got = values("{\"seq\":1}\n\n{\"seq\":2}\n");
        assert_eq!(got, vec![r#"{"seq":1}"#, r#"{"seq":2}"#]);
    }

    #[test]
    fn nested_brackets_inside_strings_are_ignored() {
        let got = values(r#"{"a":"}]\"{"} [1,"]"]"#);
        assert_eq!(got, vec![r#"{"a":"}]\"{"}"#, r#"[1,"]"]"#]);
    }

    #[test]
    fn scalars_end_at_delimiters() {
        let mut s = scanner("123,true]");
        let mut buf = Vec::new();
        s.read_value(&mut buf).unwrap();
        assert_eq!(buf, b"123");
        s.expect(b',').unwrap();
        s.read_value(&mut buf).unwrap();
        assert_eq!(buf, b"true");
        s.expect(b']').unwrap();
        assert!(s.peek_token().unwrap().is_none());
    }

    #[test]
    fn keys_are_unescaped() {
        let mut s = scanner(r#" "last_seq" : 5"#);
        let mut scratch = Vec::new();
        assert_eq!(s.read_key(&mut scratch).unwrap(), "last_seq");
    }

    #[test]
    fn truncated_container_is_an_error() {
        let mut s = scanner(r#"{"a":[1,2"#);
        let mut buf = Vec::new();
        assert!(matches!(s.read_value(&mut buf), Err(ScanError::Syntax(_))));
    }

    #[test]
    fn punctuation_is_not_a_value() {
        let mut s = scanner("]");
        let mut buf = Vec::new();
        assert!(matches!(s.read_value(&mut buf), Err(ScanError::Syntax(_))));
    }

    #[test]
    fn expect_reports_mismatch() {
        let mut s = scanner("[");
        let err = s.expect(b'{').unwrap_err();
        assert!(err.to_string().contains("expected '{'"));
    }
}
