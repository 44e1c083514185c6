//! bucketlink - unified CLI entrypoint.
//!
//! Usage:
//!   bucketlink --hosts 10.0.0.1:8091 get <key>
//!   bucketlink --config client.toml set <key> <value> [--store add]
//!   bucketlink incr <key> [--delta N] [--initial N]
//!   bucketlink topology <key>...
//!   bucketlink config validate --config client.toml

use anyhow::Result;
use bucketlink::cli::{run, Cli};
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    run(Cli::parse()).await
}
