use std::path::PathBuf;
use std::process::exit;

use chrono::Local;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use storrent::config::cfg::Cfg;
use storrent::swarm::orchestrator::Swarm;
use storrent::torrent_parser::parser::TorrentParser;

/// Single-torrent BitTorrent client: downloads the torrent's payload while
/// seeding verified pieces back to the swarm.
#[derive(Parser, Debug)]
struct Args {
    /// Path to the .torrent file
    #[arg(short, long)]
    torrent: String,
    /// Optional KEY=VALUE config file; defaults apply without one
    #[arg(short, long)]
    config: Option<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let torrent = match TorrentParser::parse(&PathBuf::from(args.torrent.trim())) {
        Ok(torrent) => torrent,
        Err(err) => {
            error!("could not parse the torrent file: {:?}", err);
            exit(1);
        }
    };

    let config = match args.config {
        Some(path) => match Cfg::new(path.trim()) {
            Ok(config) => config,
            Err(err) => {
                error!("could not read the config file: {}", err);
                exit(1);
            }
        },
        None => Cfg::default(),
    };

    let swarm = match Swarm::new(torrent, config) {
        Ok(swarm) => swarm,
        Err(err) => {
            error!("could not set up the download: {:?}", err);
            exit(1);
        }
    };

    let started = Local::now();
    match swarm.run() {
        Ok(()) => {
            let elapsed = Local::now().signed_duration_since(started);
            let snapshot = swarm.progress_snapshot();
            info!(
                "done: {} bytes in {}s (uploaded {} bytes along the way)",
                snapshot.downloaded_bytes,
                elapsed.num_seconds(),
                snapshot.uploaded_bytes,
            );
        }
        Err(err) => {
            error!("download failed: {:?}", err);
            exit(1);
        }
    }
}
