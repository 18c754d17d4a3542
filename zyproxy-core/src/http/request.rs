// Copyright 2020 LEXUGE
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! HTTP/1.x request-head parsing, origin decomposition, and upstream rewriting.
//!
//! The parser is driven by an append-only buffer owned by the session: [`parse`] is
//! called again with more bytes appended whenever the previous call reported
//! [`ParseOutcome::Incomplete`]. It never re-scans bytes already consumed by a prior
//! complete parse; the caller is expected to drain `consumed` bytes from its buffer
//! after every [`ParseOutcome::Complete`].

use crate::error::HttpParseError;
use std::collections::HashMap;

const HEAD_DELIMITER: &[u8] = b"\r\n\r\n";
const DEFAULT_PORT: u16 = 80;

/// A parsed (and, for forwarding, rewritten) HTTP/1.x request head.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub host: String,
    pub port: u16,
    pub path: String,
    pub version: String,
    headers: HashMap<String, String>,
    /// The rewritten upstream request: request line + headers (with
    /// `Proxy-Connection` folded to `Connection: Keep-Alive`) + blank line + body.
    upstream_request: Vec<u8>,
}

impl HttpRequest {
    /// A parsed request is valid when both its method and host are non-empty.
    pub fn is_valid(&self) -> bool {
        !self.method.is_empty() && !self.host.is_empty()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(String::as_str)
    }

    /// The request as it should be sent to the origin: rewritten request line,
    /// verbatim headers (save the `Proxy-Connection` substitution), then the body.
    pub fn upstream_bytes(&self) -> &[u8] {
        &self.upstream_request
    }
}

/// Result of one parse attempt over the session's accumulated buffer.
pub enum ParseOutcome {
    /// The head (or, once the head is known, the body) is not fully buffered yet.
    /// Call [`parse`] again after appending more bytes.
    Incomplete,
    /// A full request head and body were consumed. `consumed` bytes should be
    /// drained from the front of the caller's buffer.
    Complete { request: HttpRequest, consumed: usize },
}

/// Parse one HTTP request head (and, once known, its body) from the front of `buf`.
///
/// Phase A scans for `\r\n\r\n`; until found, returns `Incomplete`. Once found, the
/// head is split into CRLF-delimited lines (first: request line; rest: `Name:
/// Value` headers, case-insensitive, last-write-wins on duplicates). Phase B reads
/// `Content-Length` (absent => 0, invalid => error) and waits for that many body
/// bytes to be buffered before returning `Complete`.
pub fn parse(buf: &[u8]) -> Result<ParseOutcome, HttpParseError> {
    let head_end = match find_subslice(buf, HEAD_DELIMITER) {
        Some(pos) => pos,
        None => return Ok(ParseOutcome::Incomplete),
    };
    let head = &buf[..head_end];
    let after_head = head_end + HEAD_DELIMITER.len();

    let mut lines = head.split(|&b| b == b'\n').map(strip_cr);
    let request_line = lines.next().ok_or(HttpParseError::MalformedRequestLine)?;
    let (method, url, version) = parse_request_line(request_line)?;
    let (host, port, path) = parse_url(&url)?;

    let mut headers = HashMap::new();
    let mut upstream = Vec::with_capacity(buf.len());
    upstream.extend_from_slice(method.as_bytes());
    upstream.push(b' ');
    upstream.extend_from_slice(path.as_bytes());
    upstream.push(b' ');
    upstream.extend_from_slice(version.as_bytes());
    upstream.extend_from_slice(b"\r\n");

    for line in lines {
        if line.is_empty() {
            continue;
        }
        let (name, value) = parse_header_line(line)?;
        let lower = name.to_ascii_lowercase();
        if lower == "proxy-connection" {
            upstream.extend_from_slice(b"Connection: Keep-Alive\r\n");
        } else {
            upstream.extend_from_slice(line);
            upstream.extend_from_slice(b"\r\n");
        }
        headers.insert(lower, value);
    }
    upstream.extend_from_slice(b"\r\n");

    let content_length = match headers.get("content-length") {
        None => 0usize,
        Some(v) => v
            .parse::<usize>()
            .map_err(|_| HttpParseError::InvalidContentLength(v.clone()))?,
    };

    let body_available = buf.len() - after_head;
    if body_available < content_length {
        return Ok(ParseOutcome::Incomplete);
    }

    let body = &buf[after_head..after_head + content_length];
    upstream.extend_from_slice(body);

    let request = HttpRequest {
        method,
        host,
        port,
        path,
        version,
        headers,
        upstream_request: upstream,
    };

    Ok(ParseOutcome::Complete {
        request,
        consumed: after_head + content_length,
    })
}

fn strip_cr(line: &[u8]) -> &[u8] {
    match line.strip_suffix(b"\r") {
        Some(rest) => rest,
        None => line,
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Tokenize `METHOD SP URL SP VERSION` by single ASCII spaces.
fn parse_request_line(line: &[u8]) -> Result<(String, String, String), HttpParseError> {
    let text = std::str::from_utf8(line).map_err(|_| HttpParseError::MalformedRequestLine)?;
    let mut parts = text.split(' ');
    let method = parts.next().filter(|s| !s.is_empty());
    let url = parts.next().filter(|s| !s.is_empty());
    let version = parts.next().filter(|s| !s.is_empty());
    if parts.next().is_some() {
        return Err(HttpParseError::MalformedRequestLine);
    }
    match (method, url, version) {
        (Some(m), Some(u), Some(v)) => Ok((m.to_string(), u.to_string(), v.to_string())),
        _ => Err(HttpParseError::MalformedRequestLine),
    }
}

/// Decompose an absolute URL (`http://host[:port]/path`) or a CONNECT authority
/// (`host:port`) into `(host, port, path)`.
fn parse_url(url: &str) -> Result<(String, u16, String), HttpParseError> {
    let rest = match url.find("://") {
        Some(pos) => &url[pos + 3..],
        None => url,
    };

    let (authority, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], rest[pos..].to_string()),
        None => (rest, "/".to_string()),
    };

    if authority.is_empty() {
        return Err(HttpParseError::MalformedAuthority(url.to_string()));
    }

    let mut segments = authority.split(':');
    let host = segments.next().unwrap_or_default();
    let port = match segments.next() {
        None => DEFAULT_PORT,
        Some(port_str) => {
            if segments.next().is_some() {
                return Err(HttpParseError::MalformedAuthority(url.to_string()));
            }
            port_str
                .parse::<u16>()
                .map_err(|_| HttpParseError::MalformedAuthority(url.to_string()))?
        }
    };

    if host.is_empty() {
        return Err(HttpParseError::MalformedAuthority(url.to_string()));
    }

    Ok((host.to_string(), port, path))
}

fn parse_header_line(line: &[u8]) -> Result<(String, String), HttpParseError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| HttpParseError::MalformedHeaderLine(String::from_utf8_lossy(line).into_owned()))?;
    let colon = text
        .find(':')
        .ok_or_else(|| HttpParseError::MalformedHeaderLine(text.to_string()))?;
    let name = &text[..colon];
    let value = text[colon + 1..].trim_start_matches(' ');
    if name.is_empty() || value.is_empty() {
        return Err(HttpParseError::MalformedHeaderLine(text.to_string()));
    }
    Ok((name.to_string(), value.to_string()))
}
