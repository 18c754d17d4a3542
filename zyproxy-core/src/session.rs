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

//! The proxy session: the per-connection state machine of spec.md section 4.5,
//! driven as a single task that yields at each await point rather than as an
//! explicit state enum dispatched from callbacks (see spec.md's REDESIGN FLAGS;
//! a task suspended at an `.await` *is* the "Start"/"GotRequest"/"Resolved" state,
//! since nothing else can run on this connection's behalf until it resumes).
//!
//! | Spec state | Here |
//! |---|---|
//! | Start, GotRequest | the `read_request` loop below |
//! | Resolved | the `resolve` + `tunnel::connect` calls |
//! | TransportHttps | `tunnel.join().await` |
//! | TransportHttp | the `run_keep_alive` loop |

use crate::dns::{DnsResolver, Family};
use crate::http::{self, ParseOutcome};
use crate::tunnel::{self, Mode, Tunnel, TunnelConfig};
use bytes::Bytes;
use log::{debug, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

/// Byte sequences this proxy writes on its own behalf, per spec.md section 6.
const BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\nProxy-Agent: zy_https/0.1\r\n\r\n";
const GATEWAY_TIMEOUT: &[u8] = b"HTTP/1.1 504 Gateway Timeout\r\nProxy-Agent: zy_https/0.1\r\n\r\n";

/// Read buffer chunk size while accumulating a request head (or body).
const READ_CHUNK: usize = 8192;

/// Handles to the resources a session needs, shared across every connection the
/// listening socket accepts.
#[derive(Clone)]
pub struct SessionContext {
    pub resolver: DnsResolver,
    pub tunnel_config: TunnelConfig,
}

/// Drive one accepted client connection end to end. Never panics on a peer error
/// or malformed input; every failure path writes the appropriate reply (if the
/// connection is still in a state where one is owed) and returns.
pub async fn handle_connection(mut client: TcpStream, ctx: SessionContext, peer: SocketAddr) {
    let mut buf: Vec<u8> = Vec::new();
    let request = match read_request(&mut client, &mut buf).await {
        Ok(Some(request)) => request,
        Ok(None) => {
            debug!("{peer} disconnected before sending a complete request");
            return;
        }
        Err(()) => {
            let _ = client.write_all(BAD_REQUEST).await;
            return;
        }
    };

    if !request.is_valid() {
        warn!("{peer} sent a request with an empty method or host");
        let _ = client.write_all(BAD_REQUEST).await;
        return;
    }

    // CONNECT targets are resolved against AAAA, everything else against A: the
    // family split the original source keys off the request method (see DESIGN.md).
    let is_connect = request.method.eq_ignore_ascii_case("CONNECT");
    let family = if is_connect { Family::V6 } else { Family::V4 };

    let address = match ctx.resolver.resolve(&request.host, family).await {
        Ok(address) => address,
        Err(e) => {
            warn!("DNS resolution of '{}' for {peer} failed: {e}", request.host);
            let _ = client.write_all(GATEWAY_TIMEOUT).await;
            return;
        }
    };
    let target = SocketAddr::new(address, request.port);

    let upstream = match tunnel::connect(target, ctx.tunnel_config.connect_timeout).await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!("connecting {peer} to upstream {target} failed: {e}");
            let _ = client.write_all(GATEWAY_TIMEOUT).await;
            return;
        }
    };

    let mode = if is_connect {
        Mode::Https
    } else {
        Mode::Http {
            pending_request: Bytes::copy_from_slice(request.upstream_bytes()),
        }
    };

    let (tunnel, client_read) = match Tunnel::establish(client, upstream, mode, ctx.tunnel_config.highwater_bytes).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!("failed to establish tunnel for {peer} -> {target}: {e}");
            return;
        }
    };

    match client_read {
        None => {
            // TransportHttps: both directions are forwarded opaquely by the
            // tunnel itself; wait for it to run its course.
            tunnel.join().await;
        }
        Some(client_read) => {
            // TransportHttp: further client bytes are re-parsed here and pushed
            // upstream through the tunnel; its background pump only carries
            // upstream's replies back to the client.
            run_keep_alive(client_read, &tunnel, buf).await;
        }
    }

    tunnel.teardown().await;
}

/// Accumulate bytes from `client` until [`http::parse`] reports a complete
/// request, a malformed request (`Err(())`), or the client disconnects first
/// (`Ok(None)`). On success, any bytes already read past the consumed request
/// are left in `buf` for a keep-alive re-parse.
async fn read_request(
    client: &mut TcpStream,
    buf: &mut Vec<u8>,
) -> Result<Option<crate::http::HttpRequest>, ()> {
    loop {
        match http::parse(buf).map_err(|_| ())? {
            ParseOutcome::Complete { request, consumed } => {
                buf.drain(..consumed);
                return Ok(Some(request));
            }
            ParseOutcome::Incomplete => {
                let mut chunk = [0u8; READ_CHUNK];
                match client.read(&mut chunk).await {
                    Ok(0) => return Ok(None),
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        debug!("read error while awaiting a request head: {e}");
                        return Ok(None);
                    }
                }
            }
        }
    }
}

/// HTTP keep-alive loop: re-parse each subsequent request off `client_read` and
/// forward its rewritten bytes through the tunnel, per spec.md section 4.5. Ends
/// on client disconnect, a read error, or a parse failure (which also replies
/// `400 Bad Request` through the tunnel before returning).
async fn run_keep_alive(mut client_read: OwnedReadHalf, tunnel: &Arc<Tunnel>, mut buf: Vec<u8>) {
    loop {
        match http::parse(&buf) {
            Ok(ParseOutcome::Complete { request, consumed }) => {
                buf.drain(..consumed);
                if let Err(e) = tunnel.send_to_upstream(request.upstream_bytes()).await {
                    debug!("upstream write failed mid-keep-alive: {e}");
                    return;
                }
            }
            Ok(ParseOutcome::Incomplete) => {
                let mut chunk = [0u8; READ_CHUNK];
                match client_read.read(&mut chunk).await {
                    Ok(0) => return,
                    Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        debug!("read error mid-keep-alive: {e}");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!("malformed keep-alive request: {e}");
                let _ = tunnel.write_to_client(BAD_REQUEST).await;
                return;
            }
        }
    }
}
