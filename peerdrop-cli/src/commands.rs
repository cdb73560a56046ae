//! CLI command implementations

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Subcommand;
use peerdrop_core::config::PeerdropConfig;
use peerdrop_core::tracker::{HttpTrackerClient, TrackerClient};
use peerdrop_core::{FileDescriptor, PeerNode, PeerdropError, Result};
use peerdrop_tracker::spawn_tracker;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the tracker
    Tracker {
        /// Address to bind to
        #[arg(short, long)]
        bind: Option<SocketAddr>,
        /// Seconds without a heartbeat before a peer is evicted
        #[arg(long)]
        eviction_timeout: Option<u64>,
    },
    /// Share files with other peers until interrupted
    Share {
        /// Files to share
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Tracker address
        #[arg(short, long)]
        tracker: String,
        /// Address the piece server binds to
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
    },
    /// Download files from other peers
    Fetch {
        /// Names of the files to download
        #[arg(required = true)]
        files: Vec<String>,
        /// Tracker address
        #[arg(short, long)]
        tracker: String,
        /// Output directory for downloads
        #[arg(short, long, default_value = ".")]
        output: PathBuf,
        /// Address the piece server binds to
        #[arg(short, long, default_value = "0.0.0.0:0")]
        bind: SocketAddr,
    },
    /// List the files a tracker knows about
    Files {
        /// Tracker address
        #[arg(short, long)]
        tracker: String,
    },
    /// Write a descriptor for a local file
    Describe {
        /// File to describe
        file: PathBuf,
        /// Piece size in bytes
        #[arg(long)]
        piece_size: Option<u32>,
        /// Descriptor path (defaults to `<file>.json`)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

impl Commands {
    /// Process role, used to name the log file.
    pub fn role(&self) -> &'static str {
        match self {
            Commands::Tracker { .. } => "tracker",
            Commands::Share { .. } | Commands::Fetch { .. } => "peer",
            Commands::Describe { .. } => "describe",
            Commands::Files { .. } => "files",
        }
    }
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> Result<()> {
    let config = PeerdropConfig::from_env();
    match command {
        Commands::Tracker {
            bind,
            eviction_timeout,
        } => run_tracker(config, bind, eviction_timeout).await,
        Commands::Share {
            files,
            tracker,
            bind,
        } => share_files(config, files, tracker, bind).await,
        Commands::Fetch {
            files,
            tracker,
            output,
            bind,
        } => fetch_files(config, files, tracker, output, bind).await,
        Commands::Describe {
            file,
            piece_size,
            output,
        } => describe_file(config, file, piece_size, output).await,
        Commands::Files { tracker } => list_files(config, tracker).await,
    }
}

/// Run the tracker until Ctrl-C
///
/// # Errors
/// - `PeerdropError::Io` - Bind failed or signal handler unavailable
pub async fn run_tracker(
    mut config: PeerdropConfig,
    bind: Option<SocketAddr>,
    eviction_timeout: Option<u64>,
) -> Result<()> {
    if let Some(bind) = bind {
        config.tracker.bind_address = bind;
    }
    if let Some(seconds) = eviction_timeout {
        if seconds == 0 {
            return Err(PeerdropError::Configuration {
                reason: "eviction timeout must be positive".to_string(),
            });
        }
        config.tracker.eviction_timeout = Duration::from_secs(seconds);
    }

    let handle = spawn_tracker(&config.tracker).await?;
    println!("Peerdrop tracker running on http://{}", handle.local_addr());

    tokio::signal::ctrl_c().await?;
    println!("Shutting down tracker...");
    handle.close().await;
    Ok(())
}

/// Share files and serve pieces until Ctrl-C
///
/// # Errors
/// - `PeerdropError::Tracker` - Tracker unreachable or registration rejected
/// - `PeerdropError::Transfer` - File unreadable or piece server failed to bind
pub async fn share_files(
    config: PeerdropConfig,
    files: Vec<PathBuf>,
    tracker: String,
    bind: SocketAddr,
) -> Result<()> {
    let client = Arc::new(HttpTrackerClient::new(
        &tracker,
        config.tracker.request_timeout,
    )?);
    let node = PeerNode::start(config, client, bind).await?;

    for path in &files {
        let descriptor = node.share(path).await?;
        println!(
            "Sharing {} ({} bytes, {} pieces)",
            descriptor.name,
            descriptor.total_size,
            descriptor.piece_count()
        );
    }
    println!("Serving pieces on port {}. Press Ctrl-C to stop.", node.port());

    tokio::signal::ctrl_c().await?;
    node.disconnect().await
}

/// Download files from idle peers
///
/// # Errors
/// - `PeerdropError::Tracker` - Not enough idle peers or tracker unreachable
/// - `PeerdropError::Download` - A file could not be completed
pub async fn fetch_files(
    config: PeerdropConfig,
    files: Vec<String>,
    tracker: String,
    output: PathBuf,
    bind: SocketAddr,
) -> Result<()> {
    let client = Arc::new(HttpTrackerClient::new(
        &tracker,
        config.tracker.request_timeout,
    )?);
    let node = PeerNode::start(config, client, bind).await?;
    node.register().await?;

    let progress = |downloaded: u32, total: u32| {
        println!("  piece {downloaded}/{total}");
    };
    let result = node.fetch_files(&files, &output, Arc::new(progress)).await;

    match result {
        Ok(reports) => {
            for report in &reports {
                println!(
                    "Downloaded {} ({} bytes) to {} in {:.1}s from {} peer(s)",
                    report.filename,
                    report.bytes,
                    report.destination.display(),
                    report.elapsed.as_secs_f64(),
                    report.served_by.len()
                );
            }
            node.disconnect().await
        }
        Err(e) => {
            if let Err(disconnect_error) = node.disconnect().await {
                tracing::warn!(error = %disconnect_error, "Disconnect failed");
            }
            Err(e)
        }
    }
}

/// Hash a file and write its descriptor as JSON
///
/// # Errors
/// - `PeerdropError::Transfer` - File unreadable or descriptor not writable
pub async fn describe_file(
    config: PeerdropConfig,
    file: PathBuf,
    piece_size: Option<u32>,
    output: Option<PathBuf>,
) -> Result<()> {
    let piece_size = piece_size.unwrap_or(config.transfer.piece_size);
    let descriptor = FileDescriptor::from_file(&file, piece_size).await?;

    let output = output.unwrap_or_else(|| {
        let mut name = file.clone().into_os_string();
        name.push(".json");
        PathBuf::from(name)
    });
    descriptor.save(&output).await?;

    println!(
        "Described {} ({} bytes, {} pieces of {} bytes) -> {}",
        descriptor.name,
        descriptor.total_size,
        descriptor.piece_count(),
        descriptor.piece_size,
        output.display()
    );
    Ok(())
}

/// Print the tracker's file listing
///
/// # Errors
/// - `PeerdropError::Tracker` - Tracker unreachable
pub async fn list_files(config: PeerdropConfig, tracker: String) -> Result<()> {
    let client = HttpTrackerClient::new(&tracker, config.tracker.request_timeout)?;
    let files = client.files().await?;

    if files.is_empty() {
        println!("No files tracked");
        return Ok(());
    }
    for file in &files {
        println!(
            "{:<40} {:>12} bytes  {} holder(s){}",
            file.name,
            file.size,
            file.holders,
            if file.described { "" } else { "  (no descriptor)" }
        );
    }
    Ok(())
}
