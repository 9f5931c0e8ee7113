//! Command-line interface for talki-relay
//!
//! Handles argument parsing and logging configuration.

use clap::Parser;
use log::LevelFilter;
use std::path::PathBuf;
use yeti_talki::config::TalkiConfig;

/// talki-relay - development broadcast channel for Yeti Talki clients
#[derive(Parser, Debug)]
#[command(name = "talki-relay")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Address to listen on (overrides the config file)
    #[arg(short, long)]
    pub listen: Option<String>,

    /// JSON token table mapping tokens to participants
    #[arg(short, long)]
    pub tokens: PathBuf,

    /// Longest accepted message in seconds (overrides the config file)
    #[arg(long)]
    pub max_duration: Option<f64>,

    /// Config file (defaults to the per-user config location)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Increase logging verbosity
    /// -v = info, -vv = debug, -vvv = trace, -vvvv = all deps
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Get the log level filter based on verbosity flags
    pub fn log_level(&self) -> LevelFilter {
        if self.quiet {
            LevelFilter::Error
        } else {
            match self.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                2 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }

    /// Apply command-line overrides on top of the loaded config
    pub fn apply(&self, config: &mut TalkiConfig) {
        if let Some(listen) = &self.listen {
            config.relay.listen_addr = listen.clone();
        }
        if let Some(max) = self.max_duration {
            config.relay.max_duration_secs = max;
        }
    }
}

/// Initialize the logging system based on CLI arguments
pub fn init_logging(args: &Args) {
    let mut builder = env_logger::Builder::new();

    // Base level for all modules - keep at warn to suppress noisy deps
    builder.filter_level(LevelFilter::Warn);

    builder.filter_module("yeti_talki", args.log_level());
    builder.filter_module("talki_relay", args.log_level());

    // WebSocket internals only at -vvvv
    if args.verbose >= 4 {
        builder.filter_module("tungstenite", args.log_level());
        builder.filter_module("tokio_tungstenite", args.log_level());
    }

    builder.format_timestamp_millis().init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verbosity_and_overrides() {
        let args = Args::parse_from(["talki-relay", "--tokens", "t.json", "-vv"]);
        assert_eq!(args.log_level(), LevelFilter::Debug);

        let args = Args::parse_from([
            "talki-relay",
            "-q",
            "-t",
            "t.json",
            "--listen",
            "0.0.0.0:9000",
            "--max-duration",
            "15",
        ]);
        assert_eq!(args.log_level(), LevelFilter::Error);

        let mut config = TalkiConfig::default();
        args.apply(&mut config);
        assert_eq!(config.relay.listen_addr, "0.0.0.0:9000");
        assert_eq!(config.relay.max_duration_secs, 15.0);
    }
}
