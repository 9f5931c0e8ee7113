//! talki-relay - development broadcast relay for Yeti Talki
//!
//! Runs the channel fan-out locally so clients can be exercised without the
//! production backend.

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::sync::Arc;
use yeti_talki::config::TalkiConfig;
use yeti_talki::relay::{ChannelRelay, StaticTokens};

fn main() -> Result<()> {
    // Parse command-line arguments and initialize logging
    let args = cli::Args::parse();
    cli::init_logging(&args);

    let mut config = match &args.config {
        Some(path) => TalkiConfig::load_from(path),
        None => TalkiConfig::load(),
    }
    .context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid relay settings")?;

    let tokens = StaticTokens::load(&args.tokens)?;
    info!("Loaded {} participant token(s)", tokens.len());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    runtime.block_on(async move {
        let relay = ChannelRelay::bind(&config.relay, Arc::new(tokens)).await?;
        let handle = relay.handle();

        tokio::select! {
            _ = relay.run() => {}
            signal = tokio::signal::ctrl_c() => {
                signal.context("Failed to listen for Ctrl-C")?;
                info!(
                    "Shutting down with {} participant(s) online",
                    handle.online_count().await
                );
            }
        }
        Ok::<_, anyhow::Error>(())
    })
}
