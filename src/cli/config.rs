//! CLI configuration module
//!
//! Turns parsed arguments into the per-component configurations.

use crate::cli::args::CliArgs;
use crate::download::CoordinatorConfig;
use crate::error::TorrentError;
use crate::peer::PeerConfig;
use crate::storage::PieceManagerConfig;
use crate::tracker::{RetryPolicy, TrackerConfig};
use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one download
#[derive(Debug, Clone)]
pub struct Config {
    /// Download directory
    pub output_dir: PathBuf,
    /// Port announced to trackers
    pub port: u16,
    pub max_connections: usize,
    /// Outstanding block requests per peer
    pub pipeline: usize,
    pub tracker_timeout: Duration,
    pub tracker_retries: u32,
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
    pub announce_completed: bool,
    pub json: bool,
    pub verbose: bool,
    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./downloads"),
            port: 6881,
            max_connections: 30,
            pipeline: 5,
            tracker_timeout: Duration::from_secs(15),
            tracker_retries: 8,
            request_timeout: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(120),
            announce_completed: true,
            json: false,
            verbose: false,
            quiet: false,
        }
    }
}

impl Config {
    /// Create configuration from CLI arguments
    pub fn from_args(args: &CliArgs) -> Self {
        let output_dir = args.output_dir.clone().unwrap_or_else(|| PathBuf::from("./downloads"));

        Self {
            output_dir,
            port: args.port,
            max_connections: args.max_connections,
            pipeline: args.pipeline,
            tracker_timeout: Duration::from_secs(args.tracker_timeout),
            tracker_retries: args.tracker_retries,
            request_timeout: Duration::from_secs(args.request_timeout),
            idle_timeout: Duration::from_secs(args.idle_timeout),
            announce_completed: !args.no_completed_announce,
            json: args.json,
            verbose: args.verbose,
            quiet: args.quiet,
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(TorrentError::config_error_with_field("Port cannot be 0", "port").into());
        }
        if self.max_connections == 0 {
            return Err(TorrentError::config_error_with_field("Must allow at least one connection", "max_connections").into());
        }
        if self.pipeline == 0 {
            return Err(TorrentError::config_error_with_field("Pipeline depth must be at least 1", "pipeline").into());
        }
        if self.tracker_timeout.is_zero() {
            return Err(TorrentError::config_error_with_field("Tracker timeout cannot be 0", "tracker_timeout").into());
        }
        // 15 * 2^n overflows well before this
        if self.tracker_retries > 16 {
            return Err(TorrentError::config_error_with_field("At most 16 tracker retries", "tracker_retries").into());
        }
        if self.request_timeout.is_zero() || self.idle_timeout.is_zero() {
            return Err(TorrentError::config_error_with_field("Timeouts cannot be 0", "timeout").into());
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(TorrentError::config_error_with_field("Output directory cannot be empty", "output_dir").into());
        }
        Ok(())
    }

    pub fn tracker_config(&self) -> TrackerConfig {
        TrackerConfig {
            retry: RetryPolicy::new(self.tracker_timeout, self.tracker_retries),
            port: self.port,
        }
    }

    pub fn peer_config(&self) -> PeerConfig {
        PeerConfig {
            idle_timeout: self.idle_timeout,
            max_pipeline: self.pipeline,
            ..PeerConfig::default()
        }
    }

    pub fn piece_config(&self) -> PieceManagerConfig {
        PieceManagerConfig {
            max_pipeline: self.pipeline,
            request_timeout: self.request_timeout,
            ..PieceManagerConfig::default()
        }
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            max_connections: self.max_connections,
            announce_completed: self.announce_completed,
            peer: self.peer_config(),
            pieces: self.piece_config(),
            tracker: self.tracker_config(),
            ..CoordinatorConfig::default()
        }
    }
}
