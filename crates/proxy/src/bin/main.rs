// jrpc-proxy - a caching reverse proxy for JSON-RPC 2.0
// Copyright (C) 2025 jrpc-proxy contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! jrpc-proxy server binary
//!
//! Runs the caching JSON-RPC reverse proxy from a JSON config file or from
//! command-line flags.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use eyre::Result;
use jrpc_common::init_logging;
use jrpc_proxy::config::{CacheConfig, Config};
use jrpc_proxy::proxy::ProxyServerBuilder;
use tracing::info;

/// Caching reverse proxy for JSON-RPC 2.0
#[derive(Parser, Debug)]
#[command(name = "jrpc-proxy")]
#[command(about = "Caching reverse proxy for JSON-RPC 2.0")]
#[command(version)]
struct Args {
    /// Path of a JSON config file; the serving flags below are ignored when
    /// this is set
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8545")]
    listen: String,

    /// URL path of the JSON-RPC endpoint
    #[arg(long, default_value = "/")]
    path: String,

    /// Upstream JSON-RPC URLs (comma-separated)
    /// Example: --upstreams "http://10.0.0.1:4201,http://10.0.0.2:4201"
    #[arg(long, value_delimiter = ',')]
    upstreams: Vec<String>,

    /// Deadline for one upstream forward, retries included
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    upstream_request_timeout: Duration,

    /// TTL applied to cached error outcomes
    #[arg(long, default_value = "0s", value_parser = humantime::parse_duration)]
    err_for: Duration,

    /// Cache the listed methods (comma-separated) for --cache-for
    #[arg(long, value_delimiter = ',')]
    cache_methods: Vec<String>,

    /// Success TTL for --cache-methods
    #[arg(long, default_value = "1m", value_parser = humantime::parse_duration)]
    cache_for: Duration,

    /// Verbosity level (repeat for more: -v, -vv)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging("jrpc-proxy", args.verbose, true)?;

    let config = match &args.config {
        Some(path) => {
            info!("loading config from {}", path.display());
            Config::from_json_file(path)?
        }
        None => {
            let mut config = Config {
                listen: args.listen,
                path: args.path,
                upstreams: args.upstreams,
                upstream_request_timeout: args.upstream_request_timeout,
                err_for: args.err_for,
                ..Config::default()
            };
            if !args.cache_methods.is_empty() {
                config.cache_configs.push(CacheConfig {
                    methods: args.cache_methods,
                    ttl: args.cache_for,
                    err_for: args.err_for,
                });
            }
            config.normalize();
            config
        }
    };
    config.validate()?;

    let proxy = ProxyServerBuilder::new(config).build().await?;

    tokio::select! {
        result = proxy.clone().serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
            proxy.shutdown();
        }
    }
    Ok(())
}
