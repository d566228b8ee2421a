//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::Parser;
use std::path::PathBuf;

/// CLI arguments for torrent-fetch
#[derive(Debug, Parser)]
#[command(name = "torrent-fetch")]
#[command(about = "Download a torrent through its UDP trackers", long_about = None)]
pub struct CliArgs {
    /// Path to the .torrent file
    #[arg(value_name = "FILE")]
    pub torrent_file: PathBuf,

    /// Download directory
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Port announced to the tracker
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Maximum number of peer connections
    #[arg(short, long, default_value_t = 30)]
    pub max_connections: usize,

    /// Outstanding block requests per peer
    #[arg(long, default_value_t = 5)]
    pub pipeline: usize,

    /// First tracker timeout in seconds, doubled on each retry
    #[arg(long, default_value_t = 15)]
    pub tracker_timeout: u64,

    /// Tracker retransmissions before giving up
    #[arg(long, default_value_t = 8)]
    pub tracker_retries: u32,

    /// Seconds before an unanswered block request is reassigned
    #[arg(long, default_value_t = 60)]
    pub request_timeout: u64,

    /// Seconds of peer silence before the connection is dropped
    #[arg(long, default_value_t = 120)]
    pub idle_timeout: u64,

    /// Skip the `completed` announce at the end
    #[arg(long)]
    pub no_completed_announce: bool,

    /// Print the download summary as JSON
    #[arg(long)]
    pub json: bool,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let args = CliArgs::try_parse_from(["torrent-fetch", "test.torrent"]).unwrap();

        assert_eq!(args.torrent_file, PathBuf::from("test.torrent"));
        assert_eq!(args.output_dir, None);
        assert_eq!(args.port, 6881);
        assert_eq!(args.max_connections, 30);
        assert_eq!(args.pipeline, 5);
        assert_eq!(args.tracker_timeout, 15);
        assert_eq!(args.tracker_retries, 8);
        assert!(!args.json);
        assert_eq!(args.log_level(), tracing::Level::INFO);
    }

    #[test]
    fn test_short_flags() {
        let args = CliArgs::try_parse_from([
            "torrent-fetch", "a.torrent", "-o", "/tmp/out", "-p", "7000", "-m", "4", "-v", "--json",
        ])
        .unwrap();

        assert_eq!(args.output_dir, Some(PathBuf::from("/tmp/out")));
        assert_eq!(args.port, 7000);
        assert_eq!(args.max_connections, 4);
        assert!(args.json);
        assert_eq!(args.log_level(), tracing::Level::DEBUG);
    }

    #[test]
    fn test_verbose_and_quiet_conflict() {
        assert!(CliArgs::try_parse_from(["torrent-fetch", "a.torrent", "-v", "-q"]).is_err());
    }
}
