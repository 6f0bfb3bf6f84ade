use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use catalog_client::{filter_unchanged, parse_page, CatalogClient};
use clap::{Parser, Subcommand};
use common::Song;
use library::config::{config_path_from_env, load_or_create_config, resolve_path};
use library::{GainBatcher, Mp3Gain, ScanOverrides, ScanState, Scanner};
use metadata::{LoftyDecoder, TagDecoder};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Scans the music directory and sends new or changed songs to the catalog server.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file (defaults to $UPDATE_MUSIC_CONFIG or update_music.yaml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Print songs instead of sending them, and leave the scan state alone.
    #[arg(long)]
    dry_run: bool,

    /// Reprocess every file whose relative path matches this glob.
    #[arg(long)]
    force_glob: Option<String>,

    /// Process only the relative paths listed in this file, one per line.
    #[arg(long)]
    song_paths_file: Option<PathBuf>,

    /// Earlier dump_music output; songs it already has unchanged are skipped
    /// and its gain values are reused.
    #[arg(long)]
    compare_dump: Option<PathBuf>,

    #[command(subcommand)]
    op: Option<Op>,
}

#[derive(Subcommand, Debug)]
enum Op {
    /// Print one song with its plays.
    DumpSong { id: String },
    /// Delete one song.
    DeleteSong { id: String },
    /// Fold SRC's rating, tags and plays into DST.
    MergeSongs {
        src: String,
        dst: String,
        /// Delete SRC afterwards.
        #[arg(long)]
        delete_src: bool,
    },
    /// Recompute search fields for every stored song.
    Reindex,
    /// Set a song's rating (0.0 to 1.0) and/or its space-separated tags.
    Rate {
        id: String,
        #[arg(long)]
        rating: Option<f64>,
        #[arg(long)]
        tags: Option<String>,
    },
    /// Report a play, at the given RFC 3339 time or now.
    Played {
        id: String,
        #[arg(long)]
        start_time: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(config_path_from_env);
    let (config, created) = load_or_create_config(&config_path)?;
    if created {
        info!("Created default config at {:?}", config_path);
    }
    let client = CatalogClient::new(&config.server_url, config.push_batch_size);

    if let Some(op) = args.op {
        return run_op(&client, op).await;
    }

    if config.music_dir.trim().is_empty() {
        return Err(format!("music_dir is not set in {:?}", config_path).into());
    }
    let scan_config = config.scan_config(&config_path);
    let dump = match &args.compare_dump {
        Some(path) => read_dump(path)?,
        None => Vec::new(),
    };

    let decoder: Arc<dyn TagDecoder> = Arc::new(LoftyDecoder);
    let gains = if config.compute_gains {
        let batcher = GainBatcher::new(
            Arc::new(Mp3Gain::new(&config.mp3gain_path)),
            Arc::clone(&decoder),
        );
        let seeded = batcher.seed(&scan_config.music_dir, &dump);
        if seeded > 0 {
            info!("Reusing gains for {} song(s) from dump", seeded);
        }
        Some(Arc::new(batcher))
    } else {
        None
    };

    let overrides = ScanOverrides {
        force_glob: args.force_glob.clone(),
        paths: match &args.song_paths_file {
            Some(path) => Some(ScanOverrides::paths_from_file(path)?),
            None => None,
        },
    };
    let state_path = resolve_path(&config_path, &config.state_path);
    let prior = ScanState::load(&state_path)?;
    let scanner = Scanner::new(scan_config, decoder, gains);
    let outcome =
        tokio::task::spawn_blocking(move || scanner.scan(prior.as_ref(), &overrides)).await??;

    let next_state = outcome.next_state();
    let failed = outcome.failures.len();
    let scanned = outcome.songs.len();
    let songs = if dump.is_empty() {
        outcome.songs
    } else {
        filter_unchanged(outcome.songs, &dump)
    };
    info!("{} of {} scanned song(s) need sending", songs.len(), scanned);

    if args.dry_run {
        for song in &songs {
            println!("{}", serde_json::to_string(song)?);
        }
    } else {
        if !songs.is_empty() {
            client.push_songs(&songs, false, None).await?;
        }
        match next_state {
            Some(state) => {
                state.save(&state_path)?;
                info!("Saved scan state to {:?}", state_path);
            }
            None => info!("Leaving scan state unchanged"),
        }
    }

    if failed > 0 {
        warn!("{} file(s) could not be read", failed);
        return Err(format!("{} file(s) failed", failed).into());
    }
    Ok(())
}

async fn run_op(client: &CatalogClient, op: Op) -> Result<(), Box<dyn std::error::Error>> {
    match op {
        Op::DumpSong { id } => {
            let song = client.dump_song(&id).await?;
            println!("{}", serde_json::to_string(&song)?);
        }
        Op::DeleteSong { id } => {
            client.delete_song(&id).await?;
            info!("Deleted song {}", id);
        }
        Op::MergeSongs {
            src,
            dst,
            delete_src,
        } => {
            let merged = client.merge_songs(&src, &dst, delete_src).await?;
            info!(
                "Merged {} into {}: {} tag(s), {} play(s)",
                src,
                dst,
                merged.tags.len(),
                merged.plays.len()
            );
        }
        Op::Reindex => {
            let total = client.reindex().await?;
            info!("Reindex done: {} scanned, {} updated", total.scanned, total.updated);
        }
        Op::Rate { id, rating, tags } => {
            if rating.is_none() && tags.is_none() {
                return Err("pass --rating and/or --tags".into());
            }
            let tags: Option<Vec<String>> = tags
                .as_deref()
                .map(|tags| tags.split_whitespace().map(str::to_string).collect());
            client.rate_and_tag(&id, rating, tags.as_deref()).await?;
        }
        Op::Played { id, start_time } => {
            let start_time = match start_time {
                Some(value) => OffsetDateTime::parse(&value, &Rfc3339)?,
                None => OffsetDateTime::now_utc(),
            };
            client.report_play(&id, start_time).await?;
        }
    }
    Ok(())
}

fn read_dump(path: &Path) -> Result<Vec<Song>, Box<dyn std::error::Error>> {
    let text = fs::read_to_string(path)?;
    let (songs, _) = parse_page::<Song>(&text)?;
    info!("Read {} song(s) from {:?}", songs.len(), path);
    Ok(songs)
}
