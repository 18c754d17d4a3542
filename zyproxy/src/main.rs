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

mod worker;

use self::worker::accept_loop;
use anyhow::{Context, Result};
use log::info;
use simple_logger::SimpleLogger;
use std::path::PathBuf;
use structopt::StructOpt;
use zyproxy_core::config::ProxyConfig;
use zyproxy_core::dns::DnsResolver;
use zyproxy_core::session::SessionContext;

#[derive(StructOpt)]
#[structopt(name = "zyproxy", about = "A forward HTTP/HTTPS proxy with its own DNS resolver.")]
struct Cli {
    /// Path to a YAML configuration file. Falls back to built-in defaults if omitted.
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    /// Log verbosity.
    #[structopt(short, long, default_value = "info")]
    verbosity: log::LevelFilter,
}

async fn load_config(path: Option<PathBuf>) -> Result<ProxyConfig> {
    match path {
        Some(path) => {
            let raw = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("reading config file {}", path.display()))?;
            serde_yaml::from_str(&raw)
                .with_context(|| format!("parsing config file {}", path.display()))
        }
        None => Ok(ProxyConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();
    SimpleLogger::new().with_level(cli.verbosity).init()?;

    let config = load_config(cli.config).await?;
    let addr = config.listen_addr();

    let resolver = DnsResolver::connect(config.dns_addr, config.resolver_config()).await?;
    let ctx = SessionContext {
        resolver,
        tunnel_config: config.tunnel_config(),
    };

    info!("zyproxy ready, listening on {addr}");
    accept_loop(addr, ctx).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::block_on;

    #[test]
    fn missing_config_path_falls_back_to_defaults() {
        let config = block_on(load_config(None)).unwrap();
        assert_eq!(config.port, 8768);
    }

    #[test]
    fn yaml_file_overrides_defaults() {
        let dir = std::env::temp_dir().join("zyproxy-test-config.yaml");
        block_on(tokio::fs::write(&dir, "port: 3128\n")).unwrap();
        let config = block_on(load_config(Some(dir.clone()))).unwrap();
        assert_eq!(config.port, 3128);
        block_on(tokio::fs::remove_file(&dir)).unwrap();
    }
}
