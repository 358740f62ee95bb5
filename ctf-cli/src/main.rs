//! CTF Command Line Interface
//!
//! Replays one or more Common Trace Format traces in timestamp order.
//!
//! # Commands
//!
//! - `ctf replay` - Print every event in global time order
//! - `ctf summary` - Count events per trace, stream and event name

mod output;
mod replay;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use replay::{ReplayArgs, SummaryArgs};

/// CTF - Common Trace Format reader
///
/// Decodes binary trace streams and merges them by timestamp.
#[derive(Parser)]
#[command(name = "ctf")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every event of the given traces in timestamp order
    ///
    /// Examples:
    ///   ctf replay ./kernel ./ust --limit 100
    ///   ctf replay ./kernel --read-ahead --format json
    Replay(ReplayArgs),

    /// Show per-trace, per-stream and per-event counts
    Summary(SummaryArgs),
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging; stdout carries the replayed events
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Replay(args) => replay::run_replay(args),
        Commands::Summary(args) => replay::run_summary(args),
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;
    use crate::output::OutputFormat;

    #[test]
    fn test_cli__replay_with_flags__then_parsed() {
        let cli = Cli::try_parse_from([
            "ctf",
            "replay",
            "a",
            "b",
            "--read-ahead",
            "--limit",
            "10",
            "--format",
            "json",
        ])
        .unwrap();

        match cli.command {
            Commands::Replay(args) => {
                assert_eq!(args.input.traces.len(), 2);
                assert!(args.input.read_ahead);
                assert_eq!(args.limit, Some(10));
                assert_eq!(args.format, OutputFormat::Json);
            }
            Commands::Summary(_) => panic!("expected replay"),
        }
    }

    #[test]
    fn test_cli__summary_verbose__then_global_flag_set() {
        let cli = Cli::try_parse_from(["ctf", "summary", "trace", "-v"]).unwrap();

        assert!(cli.verbose);
        match cli.command {
            Commands::Summary(args) => assert_eq!(args.format, OutputFormat::Text),
            Commands::Replay(_) => panic!("expected summary"),
        }
    }

    #[test]
    fn test_cli__missing_trace__then_error() {
        assert!(Cli::try_parse_from(["ctf", "replay"]).is_err());
    }

    #[test]
    fn test_cli__unknown_format__then_error() {
        assert!(Cli::try_parse_from(["ctf", "summary", "trace", "--format", "yaml"]).is_err());
    }
}
