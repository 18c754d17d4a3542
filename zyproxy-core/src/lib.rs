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

#![deny(unsafe_code)]
// Documentation
//! This is the core library backing zyproxy. It implements the DNS stub resolver
//! and its TTL cache, the HTTP/1.x request parser and rewriter, the paired-socket
//! tunnel, and the per-connection proxy session built on top of them.

pub mod config;
pub mod dns;
pub mod error;
pub mod http;
pub mod session;
pub mod tunnel;

pub use config::ProxyConfig;
pub use session::{handle_connection, SessionContext};
