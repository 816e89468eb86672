//! HTTP/1.1 message parsing for the WebSocket handshake.
//!
//! Implements the RFC 2616 subset the handshake needs: start-line
//! splitting, case-insensitive header names, linear-whitespace folding,
//! quoted-string values and duplicate-header joining. Input is one
//! complete header block (through the terminating blank line); the filter
//! accumulates bytes until that terminator before parsing.

use std::collections::BTreeMap;

use crate::error::{ProtocolError, Result};

const MAX_CONTROL_CHAR: u8 = 31;
const DELETE_CHAR: u8 = 127;

fn is_control(ch: u8) -> bool {
    ch <= MAX_CONTROL_CHAR || ch == DELETE_CHAR
}

fn is_separator(ch: u8) -> bool {
    matches!(
        ch,
        b'(' | b')'
            | b'<'
            | b'>'
            | b'@'
            | b','
            | b';'
            | b':'
            | b'\\'
            | b'"'
            | b'/'
            | b'['
            | b']'
            | b'?'
            | b'='
            | b'{'
            | b'}'
            | b' '
            | b'\t'
    )
}

fn is_token_char(ch: u8) -> bool {
    !is_control(ch) && !is_separator(ch)
}

fn parse_error(what: &str) -> ProtocolError {
    ProtocolError::HandshakeError(what.to_string())
}

/// Parses and validates an `HTTP/major.minor` version string.
pub fn parse_http_version(version: &str) -> Option<(u32, u32)> {
    let rest = version
        .get(..5)
        .filter(|prefix| prefix.eq_ignore_ascii_case("HTTP/"))
        .map(|_| &version[5..])?;
    let (major, minor) = rest.split_once('.')?;
    if major.is_empty() || minor.is_empty() {
        return None;
    }
    Some((major.parse().ok()?, minor.parse().ok()?))
}

/// Parsed header fields with case-insensitive names.
///
/// Multiple headers with the same name are joined with commas, the HTTP
/// equivalent of listing the values separately.
#[derive(Debug, Default)]
pub struct HttpHeaders {
    entries: BTreeMap<String, String>,
}

impl HttpHeaders {
    /// Parses header lines (already unfolded) into the map.
    fn insert_line(&mut self, line: &[u8]) -> Result<()> {
        let colon = line
            .iter()
            .position(|&c| c == b':')
            .ok_or_else(|| parse_error("header line missing ':'"))?;
        let name = &line[..colon];
        if name.is_empty() || !name.iter().all(|&c| is_token_char(c)) {
            return Err(parse_error("invalid header name"));
        }
        let value = normalize_value(&line[colon + 1..])?;

        let key = String::from_utf8_lossy(name).to_ascii_lowercase();
        self.entries
            .entry(key)
            .and_modify(|existing| {
                existing.push(',');
                existing.push_str(&value);
            })
            .or_insert(value);
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(&name.to_ascii_lowercase())
    }

    /// Value for the header, or the empty string if absent.
    pub fn value_for(&self, name: &str) -> &str {
        self.entries
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Case-insensitive equality against the header value. A missing
    /// header only equals the empty string.
    pub fn value_equals_ignore_case(&self, name: &str, expected: &str) -> bool {
        match self.entries.get(&name.to_ascii_lowercase()) {
            Some(value) => value.eq_ignore_ascii_case(expected),
            None => expected.is_empty(),
        }
    }

    /// Case-insensitive substring test against the header value.
    pub fn value_contains_ignore_case(&self, name: &str, needle: &str) -> bool {
        self.value_for(name)
            .to_ascii_lowercase()
            .contains(&needle.to_ascii_lowercase())
    }
}

/// Normalizes a header value: leading and trailing linear whitespace
/// dropped, interior runs collapsed to a single space, quoted strings
/// unescaped, control characters rejected.
fn normalize_value(raw: &[u8]) -> Result<String> {
    let mut out = String::new();
    let mut pending_space = false;
    let mut i = 0;

    while i < raw.len() {
        let ch = raw[i];
        if ch == b' ' || ch == b'\t' {
            pending_space = !out.is_empty();
            i += 1;
        } else if ch == b'"' {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            i += 1;
            let mut closed = false;
            while i < raw.len() {
                match raw[i] {
                    b'\\' => {
                        i += 1;
                        let escaped = *raw
                            .get(i)
                            .ok_or_else(|| parse_error("unterminated escape in quoted string"))?;
                        out.push(escaped as char);
                        i += 1;
                    }
                    b'"' => {
                        closed = true;
                        i += 1;
                        break;
                    }
                    c if is_control(c) => {
                        return Err(parse_error("control character in quoted string"))
                    }
                    c => {
                        out.push(c as char);
                        i += 1;
                    }
                }
            }
            if !closed {
                return Err(parse_error("unterminated quoted string"));
            }
        } else if is_control(ch) {
            return Err(parse_error("control character in header value"));
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(ch as char);
            i += 1;
        }
    }

    Ok(out)
}

/// Splits a complete message block into its start line and headers.
///
/// Empty lines before the start line are ignored, continuation lines
/// (starting with space or tab) are folded into the previous header, and
/// parsing stops at the blank line terminating the block.
fn parse_message(data: &[u8]) -> Result<(String, HttpHeaders)> {
    let mut lines = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i + 1 < data.len() {
        if data[i] == b'\r' && data[i + 1] == b'\n' {
            lines.push(&data[start..i]);
            start = i + 2;
            i += 2;
        } else {
            i += 1;
        }
    }
    if start < data.len() {
        lines.push(&data[start..]);
    }

    let mut iter = lines.into_iter().peekable();

    // Empty lines before the start line are tolerated per RFC 2616 4.1.
    while matches!(iter.peek(), Some(line) if line.is_empty()) {
        iter.next();
    }

    let start_line = iter
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| parse_error("missing start line"))?;
    if start_line.iter().any(|&c| is_control(c)) {
        return Err(parse_error("control character in start line"));
    }
    let start_line = String::from_utf8_lossy(start_line).into_owned();

    // Unfold continuations, then parse each header line.
    let mut unfolded: Vec<Vec<u8>> = Vec::new();
    for line in iter {
        if line.is_empty() {
            break;
        }
        if line[0] == b' ' || line[0] == b'\t' {
            let previous = unfolded
                .last_mut()
                .ok_or_else(|| parse_error("continuation line without a header"))?;
            previous.push(b' ');
            previous.extend_from_slice(line);
        } else {
            unfolded.push(line.to_vec());
        }
    }

    let mut headers = HttpHeaders::default();
    for line in &unfolded {
        headers.insert_line(line)?;
    }

    Ok((start_line, headers))
}

/// Splits a start line into `count` space-separated fields, with the last
/// field absorbing any remaining spaces (the response reason phrase).
fn split_start_line(line: &str, count: usize) -> Result<Vec<String>> {
    let mut fields: Vec<String> = Vec::with_capacity(count);
    let mut rest = line;
    for _ in 0..count - 1 {
        let (field, tail) = rest
            .split_once(' ')
            .ok_or_else(|| parse_error("malformed start line"))?;
        fields.push(field.to_string());
        rest = tail;
    }
    fields.push(rest.to_string());
    Ok(fields)
}

/// A parsed HTTP request (the client side of the handshake).
#[derive(Debug)]
pub struct HttpRequest {
    method: String,
    uri: String,
    version: String,
    headers: HttpHeaders,
}

impl HttpRequest {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (start_line, headers) = parse_message(data)?;
        let fields = split_start_line(&start_line, 3)?;
        let [method, uri, version] = <[String; 3]>::try_from(fields)
            .map_err(|_| parse_error("malformed request line"))?;

        if method.is_empty() || !method.bytes().all(is_token_char) {
            return Err(parse_error("invalid request method"));
        }
        if uri.bytes().any(is_control) {
            return Err(parse_error("invalid request URI"));
        }
        if parse_http_version(&version).is_none() {
            return Err(parse_error("invalid HTTP version"));
        }

        Ok(Self {
            method,
            uri,
            version,
            headers,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn http_version(&self) -> (u32, u32) {
        parse_http_version(&self.version).unwrap_or((0, 0))
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }
}

/// A parsed HTTP response (the server side of the handshake).
#[derive(Debug)]
pub struct HttpResponse {
    version: String,
    status_code: String,
    reason_phrase: String,
    headers: HttpHeaders,
}

impl HttpResponse {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let (start_line, headers) = parse_message(data)?;
        let fields = split_start_line(&start_line, 3)?;
        let [version, status_code, reason_phrase] = <[String; 3]>::try_from(fields)
            .map_err(|_| parse_error("malformed status line"))?;

        if status_code.is_empty() || !status_code.bytes().all(|c| c.is_ascii_digit()) {
            return Err(parse_error("invalid status code"));
        }
        if parse_http_version(&version).is_none() {
            return Err(parse_error("invalid HTTP version"));
        }

        Ok(Self {
            version,
            status_code,
            reason_phrase,
            headers,
        })
    }

    pub fn status_code(&self) -> &str {
        &self.status_code
    }

    pub fn reason_phrase(&self) -> &str {
        &self.reason_phrase
    }

    pub fn http_version(&self) -> (u32, u32) {
        parse_http_version(&self.version).unwrap_or((0, 0))
    }

    pub fn headers(&self) -> &HttpHeaders {
        &self.headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const REQUEST: &[u8] = b"GET /chat HTTP/1.1\r\n\
Host: server.example.com\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Origin: http://example.com\r\n\
Sec-WebSocket-Protocol: chat, superchat\r\n\
Sec-WebSocket-Version: 13\r\n\r\n";

    #[test]
    fn parses_request() {
        let request = HttpRequest::parse(REQUEST).unwrap();
        assert_eq!(request.method(), "GET");
        assert_eq!(request.uri(), "/chat");
        assert_eq!(request.http_version(), (1, 1));

        let headers = request.headers();
        assert!(headers.contains("Host"));
        assert_eq!(headers.value_for("Host"), "server.example.com");
        assert_eq!(headers.value_for("Sec-WebSocket-Version"), "13");

        // Case-insensitive lookups.
        assert!(headers.contains("sec-websocket-version"));
        assert_eq!(headers.value_for("sec-websocket-version"), "13");

        // Missing headers.
        assert!(!headers.contains(""));
        assert!(!headers.contains("random-string"));
        assert_eq!(headers.value_for("random-string"), "");
    }

    #[test]
    fn duplicate_headers_join_with_commas() {
        let raw = b"GET / HTTP/1.1\r\n\
Host: h\r\n\
Sec-WebSocket-Protocol: chat\r\n\
Sec-WebSocket-Protocol: superchat\r\n\r\n";
        let request = HttpRequest::parse(raw).unwrap();
        assert_eq!(
            request.headers().value_for("sec-websocket-protocol"),
            "chat,superchat"
        );
    }

    #[test]
    fn quoted_string_values() {
        let raw = b"GET / HTTP/1.1\r\n\
Test: \"quoted string\"\r\n\
Test-2: \"quoted \\\"string\\\\\"\r\n\r\n";
        let request = HttpRequest::parse(raw).unwrap();
        assert_eq!(request.headers().value_for("test"), "quoted string");
        assert_eq!(request.headers().value_for("test-2"), "quoted \"string\\");
    }

    #[test]
    fn folded_values_collapse_to_single_space() {
        let raw = b"GET / HTTP/1.1\r\n\
X-Folded: one\r\n two\t  three\r\n\r\n";
        let request = HttpRequest::parse(raw).unwrap();
        assert_eq!(request.headers().value_for("x-folded"), "one two three");
    }

    #[test]
    fn parses_response() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\n\
Upgrade: websocket\r\n\
Connection: Upgrade\r\n\
Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n";
        let response = HttpResponse::parse(raw).unwrap();
        assert_eq!(response.http_version(), (1, 1));
        assert_eq!(response.status_code(), "101");
        assert_eq!(response.reason_phrase(), "Switching Protocols");
        assert!(response
            .headers()
            .value_equals_ignore_case("upgrade", "WebSocket"));
    }

    #[test]
    fn rejects_malformed_start_lines() {
        assert!(HttpRequest::parse(b"GET/chat\r\n\r\n").is_err());
        assert!(HttpRequest::parse(b"GET /chat HTTP/one.one\r\n\r\n").is_err());
        assert!(HttpResponse::parse(b"HTTP/1.1 abc Bad\r\n\r\n").is_err());
        assert!(HttpRequest::parse(b"\r\n\r\n").is_err());
    }

    #[test]
    fn tolerates_empty_lines_before_start_line() {
        let raw = b"\r\n\r\nGET / HTTP/1.1\r\nHost: h\r\n\r\n";
        let request = HttpRequest::parse(raw).unwrap();
        assert_eq!(request.method(), "GET");
    }

    #[test]
    fn version_parsing() {
        assert_eq!(parse_http_version("HTTP/1.1"), Some((1, 1)));
        assert_eq!(parse_http_version("http/1.0"), Some((1, 0)));
        assert_eq!(parse_http_version("HTTP/2.0"), Some((2, 0)));
        assert_eq!(parse_http_version("HTTP/11"), None);
        assert_eq!(parse_http_version("SPDY/1.1"), None);
        assert_eq!(parse_http_version("HTTP/"), None);
    }
}
