//! CLI command implementations

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, bail};
use chrono::DateTime;
use clap::Subcommand;
use tideshift_core::playlist::{Playlist, PlaylistBufferDelegate};
use tideshift_core::{
    ChannelPlayer, HttpSourceOpener, LogNotifier, ReadOutcome, SourceOpener,
    TemplateArchiveDelegate, TideshiftConfig,
};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info};

const READ_TIMEOUT: Duration = Duration::from_secs(1);
const RECORD_BUFFER_SIZE: usize = 64 * 1024;

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Record a channel to a file, failing over between stream URLs
    Record {
        /// Stream URLs in order of preference
        #[arg(required = true)]
        urls: Vec<String>,
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        /// Stop after this many seconds
        #[arg(short, long)]
        duration: Option<u64>,
        /// Channel name used in logs and notifications
        #[arg(short, long, default_value = "channel")]
        name: String,
    },
    /// Download a recorded programme, optionally starting part way in
    Archive {
        /// Recording URL, or an archive URL template with {utc}, {offset}, ... placeholders
        url: String,
        /// Output file
        #[arg(short, long)]
        output: PathBuf,
        /// Programme start as unix seconds; enables seeking in playlist archives
        #[arg(long, requires = "length")]
        start: Option<i64>,
        /// Programme length in seconds
        #[arg(long, requires = "start")]
        length: Option<u64>,
        /// Start this many seconds into the programme
        #[arg(long, requires = "start")]
        offset: Option<u64>,
        /// Programme name used in logs and notifications
        #[arg(short, long, default_value = "archive")]
        name: String,
    },
    /// Show the variant and segments of an HLS playlist
    Probe {
        /// Playlist URL or path
        url: String,
    },
}

/// Handle the CLI command
///
/// # Errors
/// Returns the error of the command that failed
pub async fn handle_command(command: Commands, config: TideshiftConfig) -> anyhow::Result<()> {
    match command {
        Commands::Record {
            urls,
            output,
            duration,
            name,
        } => record(&name, &urls, output, duration.map(Duration::from_secs), config).await,
        Commands::Archive {
            url,
            output,
            start,
            length,
            offset,
            name,
        } => {
            let programme = start.zip(length).map(|(start, length)| Programme {
                start,
                length: Duration::from_secs(length),
            });
            archive(&name, &url, programme, offset.unwrap_or(0), output, config).await
        }
        Commands::Probe { url } => probe(&url, &config).await,
    }
}

fn opener(config: &TideshiftConfig) -> anyhow::Result<Arc<dyn SourceOpener>> {
    let opener = HttpSourceOpener::new(&config.network).context("Cannot create HTTP client")?;
    Ok(Arc::new(opener))
}

/// Record a live channel into `output`, then print the cache summary.
///
/// # Errors
/// - No stream URL produced data
/// - The output file cannot be written
/// - The source failed mid-stream
pub async fn record(
    name: &str,
    urls: &[String],
    output: PathBuf,
    limit: Option<Duration>,
    config: TideshiftConfig,
) -> anyhow::Result<()> {
    let window_size = config.cache.timeshift_buffer_size;
    let player = ChannelPlayer::new(opener(&config)?, Arc::new(LogNotifier), config)?;
    player
        .open_channel(name, urls)
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    println!(
        "Recording {} from {} to {}",
        name,
        player.stream_url().unwrap_or_default(),
        output.display()
    );
    let written = copy_to_file(&player, name, &output, limit).await?;

    let stats = player.cache_stats()?;
    player.close_channel();
    println!("Wrote {:.2} MB", written as f64 / 1_048_576.0);
    println!("{}", stats.format_summary(window_size));
    Ok(())
}

/// Bounds of a recorded programme.
pub struct Programme {
    /// Start as unix seconds
    pub start: i64,
    /// Full programme length
    pub length: Duration,
}

/// Download a recording into `output`.
///
/// With a `programme`, `url` is treated as an archive template and playback
/// starts at the archive entry point `offset` seconds in. Otherwise `url` is
/// played from its first byte.
///
/// # Errors
/// - The programme start is not a valid timestamp
/// - The recording cannot be opened
/// - The output file cannot be written
pub async fn archive(
    name: &str,
    url: &str,
    programme: Option<Programme>,
    offset: u64,
    output: PathBuf,
    config: TideshiftConfig,
) -> anyhow::Result<()> {
    let delegate = match programme {
        Some(Programme { start, length }) => {
            let start = DateTime::from_timestamp(start, 0)
                .with_context(|| format!("Invalid programme start {start}"))?;
            Some(TemplateArchiveDelegate::from_config(url, start, length, &config.playlist))
        }
        None => None,
    };
    let entry = match &delegate {
        Some(delegate) => {
            let entry = delegate.url_for_timeshift(Duration::from_secs(offset));
            debug!("Archive entry point {:?} for offset {}s", entry.adjusted_offset, offset);
            entry.url
        }
        None => url.to_string(),
    };

    let player = ChannelPlayer::new(opener(&config)?, Arc::new(LogNotifier), config)?;
    player
        .open_archive(
            name,
            &entry,
            delegate.map(|d| Arc::new(d) as Arc<dyn PlaylistBufferDelegate>),
        )
        .await
        .map_err(|e| anyhow::anyhow!(e.user_message()))?;

    println!("Downloading {} from {} to {}", name, entry, output.display());
    let written = copy_to_file(&player, name, &output, None).await?;
    player.close_channel();
    println!("Wrote {:.2} MB", written as f64 / 1_048_576.0);
    Ok(())
}

/// Copy the open channel into `output` until the stream ends, `limit`
/// elapses or Ctrl-C is pressed. Returns the bytes written.
async fn copy_to_file(
    player: &ChannelPlayer,
    name: &str,
    output: &Path,
    limit: Option<Duration>,
) -> anyhow::Result<u64> {
    let mut file = File::create(output)
        .await
        .with_context(|| format!("Cannot create {}", output.display()))?;
    let deadline = limit.map(|limit| Instant::now() + limit);
    let mut buf = vec![0u8; RECORD_BUFFER_SIZE];
    let mut written = 0u64;

    loop {
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            info!("Recording time limit reached");
            break;
        }

        let outcome = tokio::select! {
            outcome = player.read(&mut buf, READ_TIMEOUT) => outcome?,
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        };

        match outcome {
            ReadOutcome::Data(n) => {
                file.write_all(&buf[..n]).await?;
                written += n as u64;
            }
            ReadOutcome::Stalled => debug!("No data within {:?}", READ_TIMEOUT),
            ReadOutcome::Eof => {
                info!("Stream ended");
                break;
            }
            ReadOutcome::Error(kind) => {
                player.close_channel();
                bail!("Recording of {name} failed: {kind:?}");
            }
        }
    }

    file.flush().await?;
    Ok(written)
}

/// Print what a playlist offers.
///
/// # Errors
/// - The playlist cannot be fetched or parsed
pub async fn probe(url: &str, config: &TideshiftConfig) -> anyhow::Result<()> {
    let playlist = Playlist::load(url, opener(config)?, &config.playlist)
        .await
        .with_context(|| format!("Cannot load {url}"))?;

    println!("Playlist: {}", playlist.url());
    if playlist.media_url() != playlist.url() {
        println!("  Media playlist: {}", playlist.media_url());
    }
    if let Some(bandwidth) = playlist.variant_bandwidth() {
        println!("  Variant bandwidth: {bandwidth} bit/s");
    }
    println!("  Type: {}", if playlist.is_vod() { "VOD" } else { "live" });
    println!("  Target duration: {:?}", playlist.target_duration());

    println!("{:-<60}", "");
    let mut total = Duration::ZERO;
    for segment in playlist.remaining() {
        total += segment.duration;
        println!(
            "{:>8} {:>7.2}s  {}",
            segment.media_index,
            segment.duration.as_secs_f64(),
            segment.url
        );
    }
    println!("{:-<60}", "");
    println!("Total: {:.1}s", total.as_secs_f64());
    Ok(())
}
