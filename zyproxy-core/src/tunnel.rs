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

//! The tunnel: a connected upstream socket paired with the client socket, forwarding
//! bytes in both directions until either side closes.
//!
//! The source links two sockets by having each side's read callback hold a
//! non-owning (weak) reference to the other, upgraded just before every write, so a
//! torn-down tunnel silently stops forwarding instead of writing through a dangling
//! pointer. Plain task ownership gives the same guarantee for free here: each
//! forwarding task owns (or shares, via `Arc`) only what it needs, `JoinHandle::abort`
//! stands in for "upgrade fails, no-op", and dropping the `Tunnel` (or calling
//! [`Tunnel::teardown`]) aborts every task, which is "clear cross-references, shut
//! down both sockets."
//!
//! The per-direction high-water-mark callback is re-expressed as a bounded `mpsc`
//! channel standing in for the congested side's output buffer: the reader task
//! blocks in `Sender::send` once the channel is full, which is exactly "stop
//! reading the opposite side", and unblocks the instant the writer task drains a
//! slot, which is "resume reading" with no separate write-complete callback needed.

use crate::error::ProxyError;
use bytes::Bytes;
use log::debug;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Bytes moved per read syscall by a pump task. Small relative to
/// `highwater_bytes` so the channel capacity derived from it stays meaningful.
const CHUNK_SIZE: usize = 16 * 1024;

/// The exact reply the tunnel writes to the client once an HTTPS CONNECT upstream
/// comes up, per spec.md section 6's enumerated response lines.
pub const HTTPS_ESTABLISHED_RESPONSE: &[u8] =
    b"HTTP/1.1 200 Connection established\r\nProxy-Agent: zy_https/0.1\r\n\r\n";

/// Which greeting (if any) the tunnel writes once the upstream connection comes up.
pub enum Mode {
    /// HTTPS CONNECT: write [`HTTPS_ESTABLISHED_RESPONSE`] to the client, then
    /// forward both directions opaquely.
    Https,
    /// Plain HTTP: write `pending_request` upstream (the already-rewritten first
    /// request), then forward upstream's replies to the client. Further client
    /// bytes are re-parsed by the session, not forwarded raw by the tunnel.
    Http { pending_request: Bytes },
}

/// Tunable knobs, mirroring spec.md section 6's configuration table.
#[derive(Debug, Clone, Copy)]
pub struct TunnelConfig {
    pub connect_timeout: Duration,
    pub highwater_bytes: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(3),
            highwater_bytes: 1024 * 1024,
        }
    }
}

/// Connect to `target`, bounded by `connect_timeout`. A synchronous `connect(2)`
/// failure and a timed-out attempt both surface as `io::Error`; spec.md section
/// 4.5 treats either as a tunnel connect failure and replies `504 Gateway Timeout`.
pub async fn connect(target: SocketAddr, connect_timeout: Duration) -> Result<TcpStream, ProxyError> {
    let stream = timeout(connect_timeout, TcpStream::connect(target))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "upstream connect timed out"))??;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// A live, linked pair of sockets.
///
/// `client_write` is always shared: the upstream-to-client pump writes through it,
/// and in HTTP mode the session also writes an error reply through it directly
/// (e.g. `400 Bad Request` on a malformed keep-alive request) before closing.
/// `upstream_write` is `None` for an HTTPS tunnel, where the client-to-upstream
/// direction is forwarded by a pump task that owns the write half outright; it is
/// `Some` for an HTTP tunnel, whose session pushes rewritten requests through
/// [`Tunnel::send_to_upstream`] instead of a raw pump.
pub struct Tunnel {
    client_write: Arc<AsyncMutex<OwnedWriteHalf>>,
    upstream_write: Option<AsyncMutex<OwnedWriteHalf>>,
    handles: StdMutex<Vec<JoinHandle<()>>>,
    torn_down: AtomicBool,
}

impl Tunnel {
    /// Link `client` and `upstream`. Writes the HTTPS greeting or the pre-buffered
    /// HTTP request (per `mode`) before spawning the forwarding pumps, matching
    /// spec.md section 4.4's "on upstream-up" sequence.
    ///
    /// In [`Mode::Https`] the tunnel takes full ownership of the client socket and
    /// forwards both directions opaquely; the returned second element is `None`.
    /// In [`Mode::Http`] the caller keeps `client_read` (the session re-parses
    /// further requests off it per spec.md section 4.5), so it is handed back.
    pub async fn establish(
        client: TcpStream,
        upstream: TcpStream,
        mode: Mode,
        highwater_bytes: usize,
    ) -> Result<(Arc<Self>, Option<OwnedReadHalf>), ProxyError> {
        let (client_read, client_write) = client.into_split();
        let (upstream_read, mut upstream_write) = upstream.into_split();
        let client_write = Arc::new(AsyncMutex::new(client_write));

        let mut handles = Vec::with_capacity(4);
        let (retained_upstream_write, handed_back_read) = match mode {
            Mode::Https => {
                client_write.lock().await.write_all(HTTPS_ESTABLISHED_RESPONSE).await?;
                spawn_upstream_to_client(upstream_read, client_write.clone(), highwater_bytes, &mut handles);
                spawn_client_to_upstream(client_read, upstream_write, highwater_bytes, &mut handles);
                (None, None)
            }
            Mode::Http { pending_request } => {
                upstream_write.write_all(&pending_request).await?;
                spawn_upstream_to_client(upstream_read, client_write.clone(), highwater_bytes, &mut handles);
                (Some(AsyncMutex::new(upstream_write)), Some(client_read))
            }
        };

        let tunnel = Arc::new(Self {
            client_write,
            upstream_write: retained_upstream_write,
            handles: StdMutex::new(handles),
            torn_down: AtomicBool::new(false),
        });

        Ok((tunnel, handed_back_read))
    }

    /// Write already-rewritten request bytes upstream. Used by the session for
    /// keep-alive requests re-parsed off the client socket in HTTP mode. A no-op
    /// on an HTTPS tunnel, which forwards the client side raw instead.
    pub async fn send_to_upstream(&self, bytes: &[u8]) -> io::Result<()> {
        match &self.upstream_write {
            Some(w) => w.lock().await.write_all(bytes).await,
            None => Ok(()),
        }
    }

    /// Write bytes directly to the client, bypassing the upstream-to-client pump.
    /// Used by an HTTP-mode session to deliver an error reply (e.g. `400 Bad
    /// Request`) once the tunnel is already up.
    pub async fn write_to_client(&self, bytes: &[u8]) -> io::Result<()> {
        self.client_write.lock().await.write_all(bytes).await
    }

    /// Wait for every forwarding task to finish on its own (both sides reached
    /// EOF or errored out). Used by an HTTPS-mode session, which has no read loop
    /// of its own once the tunnel owns both directions.
    pub async fn join(&self) {
        let handles = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Idempotent teardown: abort every forwarding task and shut down both write
    /// halves. Safe to call more than once or concurrently.
    pub async fn teardown(&self) {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return;
        }
        for handle in self.handles.lock().unwrap().iter() {
            handle.abort();
        }
        let _ = self.client_write.lock().await.shutdown().await;
        if let Some(w) = &self.upstream_write {
            let _ = w.lock().await.shutdown().await;
        }
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        for handle in self.handles.lock().unwrap().iter() {
            handle.abort();
        }
    }
}

fn spawn_upstream_to_client(
    reader: OwnedReadHalf,
    writer: Arc<AsyncMutex<OwnedWriteHalf>>,
    highwater_bytes: usize,
    handles: &mut Vec<JoinHandle<()>>,
) {
    let capacity = (highwater_bytes / CHUNK_SIZE).max(1);
    let (tx, rx) = mpsc::channel(capacity);
    handles.push(tokio::spawn(pump_to_channel(reader, tx)));
    handles.push(tokio::spawn(drain_from_shared_writer(writer, rx)));
}

fn spawn_client_to_upstream(
    reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    highwater_bytes: usize,
    handles: &mut Vec<JoinHandle<()>>,
) {
    let capacity = (highwater_bytes / CHUNK_SIZE).max(1);
    let (tx, rx) = mpsc::channel(capacity);
    handles.push(tokio::spawn(pump_to_channel(reader, tx)));
    handles.push(tokio::spawn(drain_from_owned_writer(writer, rx)));
}

async fn pump_to_channel(mut reader: impl AsyncRead + Unpin, tx: mpsc::Sender<Bytes>) {
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("tunnel read error: {e}");
                break;
            }
        }
    }
}

async fn drain_from_owned_writer(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = writer.write_all(&chunk).await {
            debug!("tunnel write error: {e}");
            return;
        }
    }
    let _ = writer.shutdown().await;
}

async fn drain_from_shared_writer(writer: Arc<AsyncMutex<OwnedWriteHalf>>, mut rx: mpsc::Receiver<Bytes>) {
    while let Some(chunk) = rx.recv().await {
        if let Err(e) = writer.lock().await.write_all(&chunk).await {
            debug!("tunnel write error: {e}");
            return;
        }
    }
    let _ = writer.lock().await.shutdown().await;
}
