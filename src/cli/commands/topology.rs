//! Topology command implementation.

use crate::client::Client;
use anyhow::Result;
use clap::Args;
use std::time::Duration;

/// Show which partition and server own each key.
#[derive(Args, Debug)]
pub struct TopologyArgs {
    /// Keys to map.
    #[arg(required = true)]
    pub keys: Vec<String>,
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub async fn run_topology(client: &Client, args: TopologyArgs, wait: Duration) -> Result<()> {
    let deadline = tokio::time::Instant::now() + wait;
    for key in &args.keys {
        let info = loop {
            if let Some(info) = client.mapping_info(key).await? {
                break info;
            }
            if tokio::time::Instant::now() >= deadline {
                anyhow::bail!("no cluster topology received within {:?}", wait);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        };

        let server = info.server.as_deref().unwrap_or("-");
        println!("{}\tpartition={}\tserver={}", key, info.partition, server);
    }
    Ok(())
}
