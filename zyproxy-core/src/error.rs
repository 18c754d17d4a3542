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

//! This module provides the universal error type used in the library. The error type uses
//! `thiserror`.

use thiserror::Error;

pub(crate) type Result<T> = std::result::Result<T, ProxyError>;

/// `ProxyError` enumerates all possible errors returned by this library.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The DNS wire codec or resolver failed.
    #[error(transparent)]
    Dns(#[from] DnsError),

    /// The HTTP request head could not be parsed or rewritten.
    #[error(transparent)]
    HttpParse(#[from] HttpParseError),

    /// Underlying I/O failure on a client or upstream socket.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Errors raised by the DNS wire codec and resolver.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DnsError {
    /// A hostname could not be encoded as a QNAME: an empty label, a label over 63
    /// bytes, a label with a leading/trailing `_`, an illegal character, or an
    /// encoded name over 255 bytes.
    #[error("hostname '{0}' cannot be encoded as a DNS name")]
    HostnameEncoding(String),

    /// No transaction id was free; the in-flight transaction table is full.
    #[error("no free DNS transaction id available")]
    TransactionTableFull,

    /// A UDP datagram did not parse as a well-formed DNS response, or its header
    /// fields (transaction id, QR, RCODE, RD, section counts) were invalid for the
    /// outstanding query.
    #[error("malformed DNS response: {0}")]
    MalformedResponse(&'static str),

    /// A resolved query had no answer whose TYPE and RDLENGTH matched the question.
    #[error("no matching answer in DNS response")]
    NoMatchingAnswer,

    /// All retry attempts were exhausted without a usable response.
    #[error("DNS query timed out after all retries")]
    TimeoutExhausted,
}

/// Errors raised while parsing or rewriting an HTTP request head.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HttpParseError {
    /// The request line did not tokenize into `METHOD SP URL SP VERSION`.
    #[error("malformed request line")]
    MalformedRequestLine,

    /// A header line was not `Name: Value`, or had an empty name.
    #[error("malformed header line: {0:?}")]
    MalformedHeaderLine(String),

    /// The authority portion of the URL (or CONNECT target) was empty, had more
    /// than one `:`, or had a non-numeric port.
    #[error("malformed authority: {0:?}")]
    MalformedAuthority(String),

    /// `Content-Length` was present but not a valid non-negative integer.
    #[error("invalid Content-Length: {0:?}")]
    InvalidContentLength(String),
}
