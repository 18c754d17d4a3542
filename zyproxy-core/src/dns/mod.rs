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

//! The DNS subsystem: wire codec, TTL cache, and the resolver that glues them
//! together over a single stub-resolver UDP socket.

mod cache;
mod resolver;
mod wire;

pub use resolver::{DnsResolver, ResolverConfig};
pub use wire::{Address, Family};
