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

//! RFC 1035 query/response wire framing. No use of a DNS library: the spec requires
//! bit-exact control over flag, count, and label encoding, so this module builds and
//! parses packets directly against `bytes::{Buf, BufMut}`.

use crate::error::DnsError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::net::{Ipv4Addr, Ipv6Addr};

/// Standard query, recursion desired.
const FLAGS_QUERY: u16 = 0x0100;

/// QTYPE for an IPv4 address record.
pub const QTYPE_A: u16 = 1;
/// QTYPE for an IPv6 address record.
pub const QTYPE_AAAA: u16 = 28;
/// QCLASS IN.
const QCLASS_IN: u16 = 1;

const HEADER_LEN: usize = 12;

/// Address family a query is resolving for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    V4,
    V6,
}

impl Family {
    pub fn qtype(self) -> u16 {
        match self {
            Family::V4 => QTYPE_A,
            Family::V6 => QTYPE_AAAA,
        }
    }

    fn rdlength(self) -> u16 {
        match self {
            Family::V4 => 4,
            Family::V6 => 16,
        }
    }
}

/// The decoded result of a successful response parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Address {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

/// Encode a standard `IN A`/`IN AAAA` query for `hostname` under `transaction_id`.
///
/// Label rules (rejected with [`DnsError::HostnameEncoding`]): empty label (leading,
/// trailing, or doubled dot), a label over 63 bytes, a label starting or ending with
/// `_`, or a label containing anything outside `[A-Za-z0-9._]`. The hostname itself
/// must be at most 255 bytes.
pub fn encode_query(transaction_id: u16, hostname: &str, family: Family) -> Result<Bytes, DnsError> {
    if hostname.is_empty() || hostname.len() > 255 {
        return Err(DnsError::HostnameEncoding(hostname.to_string()));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + hostname.len() + 8);
    buf.put_u16(transaction_id);
    buf.put_u16(FLAGS_QUERY);
    buf.put_u16(1); // qdcount
    buf.put_u16(0); // ancount
    buf.put_u16(0); // nscount
    buf.put_u16(0); // arcount

    encode_qname(&mut buf, hostname)?;

    buf.put_u16(family.qtype());
    buf.put_u16(QCLASS_IN);

    Ok(buf.freeze())
}

fn encode_qname(buf: &mut BytesMut, hostname: &str) -> Result<(), DnsError> {
    let err = || DnsError::HostnameEncoding(hostname.to_string());

    for label in hostname.split('.') {
        if label.is_empty() || label.len() > 63 {
            return Err(err());
        }
        if label.starts_with('_') || label.ends_with('_') {
            return Err(err());
        }
        if !label
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_')
        {
            return Err(err());
        }
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    Ok(())
}

/// The parsed, validated contents of a DNS response relevant to this resolver.
pub struct ParsedResponse {
    pub transaction_id: u16,
    pub address: Option<Address>,
    /// TTL of the matched answer, in seconds. `None` when no answer matched.
    pub ttl: Option<u32>,
}

/// Parse and validate a UDP datagram as a response to `family`'s question.
///
/// Validates: header well-formed, QR=1, RCODE=0, RD set, and the section counts are
/// exactly `(qdcount=1, ancount=_, nscount=0, arcount=0)` -- a strict check, not the
/// loose `&&`-combination bug in the original source (see spec.md section 9). Consumes the
/// single question section (re-validating its QNAME against the label rules), then
/// scans answers for the first whose TYPE matches the query and whose RDLENGTH
/// matches the family; other answers are skipped by RDLENGTH.
pub fn parse_response(datagram: &[u8], family: Family) -> Result<ParsedResponse, DnsError> {
    if datagram.len() < HEADER_LEN {
        return Err(DnsError::MalformedResponse("datagram shorter than a header"));
    }

    let mut buf = datagram;
    let transaction_id = buf.get_u16();
    let flags = buf.get_u16();
    let qdcount = buf.get_u16();
    let ancount = buf.get_u16();
    let nscount = buf.get_u16();
    let arcount = buf.get_u16();

    let qr = (flags >> 15) & 1;
    let rd = (flags >> 8) & 1;
    let rcode = flags & 0xf;

    if qr != 1 {
        return Err(DnsError::MalformedResponse("QR bit not set"));
    }
    if rcode != 0 {
        return Err(DnsError::MalformedResponse("non-zero RCODE"));
    }
    if rd != 1 {
        return Err(DnsError::MalformedResponse("RD bit not echoed"));
    }
    if qdcount != 1 || nscount != 0 || arcount != 0 {
        return Err(DnsError::MalformedResponse(
            "section counts are not (1, _, 0, 0)",
        ));
    }

    skip_question(&mut buf)?;

    let expected_qtype = family.qtype();
    for _ in 0..ancount {
        skip_name(&mut buf)?;
        if buf.remaining() < 10 {
            return Err(DnsError::MalformedResponse("truncated resource record"));
        }
        let rtype = buf.get_u16();
        let _rclass = buf.get_u16();
        let ttl = buf.get_u32();
        let rdlength = buf.get_u16() as usize;
        if buf.remaining() < rdlength {
            return Err(DnsError::MalformedResponse("rdata shorter than rdlength"));
        }

        if rtype == expected_qtype && rdlength == family.rdlength() as usize {
            let rdata = &buf[..rdlength];
            let address = match family {
                Family::V4 => Address::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])),
                Family::V6 => {
                    let mut octets = [0u8; 16];
                    octets.copy_from_slice(rdata);
                    Address::V6(Ipv6Addr::from(octets))
                }
            };
            return Ok(ParsedResponse {
                transaction_id,
                address: Some(address),
                ttl: Some(ttl),
            });
        }

        buf.advance(rdlength);
    }

    Ok(ParsedResponse {
        transaction_id,
        address: None,
        ttl: None,
    })
}

/// Consume the question section: QNAME (re-validated per label rules), QTYPE, QCLASS.
fn skip_question(buf: &mut &[u8]) -> Result<(), DnsError> {
    skip_name(buf)?;
    if buf.remaining() < 4 {
        return Err(DnsError::MalformedResponse("truncated question"));
    }
    buf.advance(4);
    Ok(())
}

/// Consume one encoded name, honoring compression pointers: a length byte whose top
/// two bits are `11` begins a pointer -- consume one more byte and stop, since the
/// pointer's target is never needed by this resolver (it does not follow aliases).
fn skip_name(buf: &mut &[u8]) -> Result<(), DnsError> {
    loop {
        if buf.is_empty() {
            return Err(DnsError::MalformedResponse("name ran past end of packet"));
        }
        let len = buf[0];
        if len & 0xc0 == 0xc0 {
            if buf.remaining() < 2 {
                return Err(DnsError::MalformedResponse("truncated compression pointer"));
            }
            buf.advance(2);
            return Ok(());
        }
        buf.advance(1);
        if len == 0 {
            return Ok(());
        }
        if buf.remaining() < len as usize {
            return Err(DnsError::MalformedResponse("label runs past end of packet"));
        }
        buf.advance(len as usize);
    }
}
