//! torrent-fetch - Main entry point

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use torrent_fetch::{CliArgs, Config, DownloadCoordinator, DownloadSummary, FileStorage, TorrentInfo, TorrentParser};
use tracing::{debug, error, info};

/// Log panics through tracing before the process dies
fn setup_panic_handler() {
    std::panic::set_hook(Box::new(|panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();
        match panic_info.location() {
            Some(location) => error!("PANIC occurred at {}:{}:{}", location.file(), location.line(), location.column()),
            None => error!("PANIC occurred at unknown location"),
        }
        let payload = panic_info.payload();
        if let Some(s) = payload.downcast_ref::<&str>() {
            error!("Panic message: {}", s);
        } else if let Some(s) = payload.downcast_ref::<String>() {
            error!("Panic message: {}", s);
        } else {
            error!("Panic message: unknown");
        }
        error!("Backtrace:\n{:?}", backtrace);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse_args();
    init_logging(&args);
    setup_panic_handler();
    debug!("CLI arguments: {:?}", args);

    let config = Config::from_args(&args);
    config.validate().context("Invalid configuration")?;

    let torrent_info = load_torrent_file(&args.torrent_file).context("Failed to load torrent file")?;
    if !config.json && !config.quiet {
        display_torrent_info(&torrent_info, &config);
    }

    let info = Arc::new(torrent_info);
    let storage = FileStorage::new(config.output_dir.clone(), &info)
        .context("Failed to prepare output files")?;

    let mut coordinator = DownloadCoordinator::new(info, Arc::new(storage), config.coordinator_config());
    let summary = match coordinator.start().await {
        Ok(summary) => summary,
        Err(e) => {
            error!("Download failed: {}", e);
            return Err(e);
        }
    };

    print_summary(&summary, &config)?;
    info!("torrent-fetch finished");
    Ok(())
}

/// Initialize logging based on verbosity settings
fn init_logging(args: &CliArgs) {
    let subscriber = tracing_subscriber::fmt()
        .with_max_level(args.log_level())
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    if args.is_verbose() {
        subscriber.pretty().init();
    } else {
        subscriber.compact().init();
    }
    debug!("Logging initialized at {:?}", args.log_level());
}

fn load_torrent_file(path: &Path) -> Result<TorrentInfo> {
    let info = TorrentParser::parse_file(path)?;
    info!("Loaded torrent '{}' ({} pieces)", info.name, info.piece_count());
    Ok(info)
}

fn display_torrent_info(torrent_info: &TorrentInfo, config: &Config) {
    println!("Torrent Information:");
    println!("  Name: {}", torrent_info.name);
    println!("  Size: {} bytes", torrent_info.total_size());
    println!("  Pieces: {} x {} bytes", torrent_info.piece_count(), torrent_info.piece_length);
    println!("  Info hash: {}", torrent_info.info_hash_hex());
    println!("  Trackers: {}", torrent_info.announce_list.join(", "));
    println!();
    println!("Configuration:");
    println!("  Output directory: {}", config.output_dir.display());
    println!("  Announced port: {}", config.port);
    println!("  Max connections: {}", config.max_connections);
    println!();
}

fn print_summary(summary: &DownloadSummary, config: &Config) -> Result<()> {
    if config.json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else if !config.quiet {
        println!(
            "Downloaded '{}': {} bytes, {}/{} pieces from {} peers in {:.1}s ({} failed verifications)",
            summary.name,
            summary.total_bytes,
            summary.verified_pieces,
            summary.pieces,
            summary.peers_connected,
            summary.elapsed_secs,
            summary.failed_verifications
        );
    }
    Ok(())
}
