use alloy::sol_types::SolEvent;
use alloy_primitives::Address;
use anyhow::{Context, Result};
use clap::Parser;
use std::collections::BTreeSet;
use std::path::PathBuf;
use tracing::info;
use transfer_watch::config::Config;
use transfer_watch::events::Transfer;
use transfer_watch::rpc::RpcClient;

/// Walks backwards from the chain head and records every address seen on
/// either side of a transfer, until enough are gathered for a watch file.
#[derive(Parser)]
#[command(name = "collect")]
#[command(about = "Collect recently active token addresses into a watch file", long_about = None)]
struct Cli {
    /// How many distinct addresses to gather
    #[arg(long, default_value = "1000")]
    target: usize,

    /// Blocks per log request
    #[arg(long, default_value = "100")]
    span: u64,

    /// Output file, one address per line
    #[arg(long, default_value = "addresses.txt")]
    output: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let client = RpcClient::new(&config.rpc_urls, config.token_address)?;
    let latest = client.get_latest_block().await?;
    info!(
        "Collecting up to {} active addresses of token {:?}, from block {} backwards",
        cli.target, config.token_address, latest
    );

    let mut addresses: BTreeSet<Address> = BTreeSet::new();
    let mut end = latest;
    loop {
        let start = end.saturating_sub(cli.span.saturating_sub(1));
        let logs = client.get_logs(start, end).await?;

        for log in &logs {
            if let Ok(event) = Transfer::decode_raw_log(log.topics(), &log.data().data) {
                addresses.insert(event.from);
                addresses.insert(event.to);
            }
        }
        info!(
            "Blocks {} to {}: {} address(es) so far",
            start,
            end,
            addresses.len()
        );

        if addresses.len() >= cli.target || start == 0 {
            break;
        }
        end = start - 1;
    }

    let mut out = String::new();
    for address in addresses.iter().take(cli.target) {
        out.push_str(&format!("{address:?}\n"));
    }
    std::fs::write(&cli.output, out)
        .with_context(|| format!("Failed to write {}", cli.output.display()))?;

    info!(
        "Wrote {} address(es) to {}",
        addresses.len().min(cli.target),
        cli.output.display()
    );
    Ok(())
}
