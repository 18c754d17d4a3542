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

//! The accept loop: bind the listening socket and spawn one task per accepted
//! connection, each running the proxy session to completion independently.

use anyhow::Result;
use log::warn;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use zyproxy_core::session::{handle_connection, SessionContext};

pub async fn accept_loop(addr: SocketAddr, ctx: SessionContext) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    loop {
        let (client, peer) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("accept failed: {e}");
                continue;
            }
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            handle_connection(client, ctx, peer).await;
        });
    }
}
