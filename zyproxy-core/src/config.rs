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

//! The proxy's configuration, enumerated in full by spec.md section 6. Every field
//! has a default, so an empty YAML document (or no file at all) is a valid config.

use crate::dns::ResolverConfig;
use crate::tunnel::TunnelConfig;
use serde::Deserialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    8768
}

fn default_dns_addr() -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 1, 1)), 53)
}

fn default_dns_timeout_secs() -> u64 {
    2
}

fn default_dns_max_retries() -> u8 {
    2
}

fn default_dns_max_ttl() -> u32 {
    500
}

fn default_tunnel_connect_timeout_secs() -> u64 {
    3
}

fn default_highwater_bytes() -> usize {
    1024 * 1024
}

/// The proxy's full configuration, deserializable straight from YAML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Bind address for the listening socket.
    pub host: IpAddr,
    /// Bind port for the listening socket.
    pub port: u16,
    /// Address of the stub DNS resolver reachable over UDP.
    pub dns_addr: SocketAddr,
    /// Per-attempt UDP query timeout, in seconds.
    pub dns_timeout_secs: u64,
    /// Additional query attempts after the first.
    pub dns_max_retries: u8,
    /// Size, in seconds, of the DNS cache's eviction ring.
    pub dns_max_ttl: u32,
    /// Upstream TCP connect timeout, in seconds.
    pub tunnel_connect_timeout_secs: u64,
    /// Per-direction tunnel backpressure threshold, in bytes.
    pub highwater_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            dns_addr: default_dns_addr(),
            dns_timeout_secs: default_dns_timeout_secs(),
            dns_max_retries: default_dns_max_retries(),
            dns_max_ttl: default_dns_max_ttl(),
            tunnel_connect_timeout_secs: default_tunnel_connect_timeout_secs(),
            highwater_bytes: default_highwater_bytes(),
        }
    }
}

impl ProxyConfig {
    /// The listening socket address, combining `host` and `port`.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    /// The resolver's tunable knobs, derived from this configuration.
    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            timeout: Duration::from_secs(self.dns_timeout_secs),
            max_retries: self.dns_max_retries,
            max_ttl: self.dns_max_ttl,
        }
    }

    /// The tunnel's tunable knobs, derived from this configuration.
    pub fn tunnel_config(&self) -> TunnelConfig {
        TunnelConfig {
            connect_timeout: Duration::from_secs(self.tunnel_connect_timeout_secs),
            highwater_bytes: self.highwater_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.listen_addr().to_string(), "0.0.0.0:8768");
        assert_eq!(cfg.dns_addr.to_string(), "127.0.1.1:53");
        assert_eq!(cfg.highwater_bytes, 1024 * 1024);
    }

    #[test]
    fn resolver_and_tunnel_configs_are_derived_in_seconds() {
        let cfg = ProxyConfig::default();
        assert_eq!(cfg.resolver_config().timeout, Duration::from_secs(2));
        assert_eq!(cfg.tunnel_config().connect_timeout, Duration::from_secs(3));
    }
}
