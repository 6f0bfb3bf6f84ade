use std::path::PathBuf;

use catalog_client::{CatalogClient, ExportOptions};
use clap::Parser;
use library::config::{config_path_from_env, load_or_create_config};
use time::OffsetDateTime;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Writes the catalog's songs (or plays) to stdout, one JSON object per line.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Config file (defaults to $UPDATE_MUSIC_CONFIG or update_music.yaml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Dump plays, each tagged with its song ID, instead of songs.
    #[arg(long)]
    plays: bool,

    /// Dump deleted songs instead of live ones.
    #[arg(long)]
    deleted: bool,

    /// Only songs modified at or after this Unix time in nanoseconds.
    #[arg(long)]
    since_nsec: Option<i64>,

    /// Page size to request.
    #[arg(long)]
    max: Option<usize>,

    /// Comma-separated song fields to leave out (plays, coverFilename, sha1).
    #[arg(long, value_delimiter = ',')]
    omit: Vec<String>,
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
    let (config, _) = load_or_create_config(&config_path)?;
    let client = CatalogClient::new(&config.server_url, config.push_batch_size);

    // Pass this back as --since-nsec to pick up only later changes.
    let server_time = client.server_time().await?;
    info!("Server time is {}", server_time);

    if args.plays {
        let plays = client.export_plays().await?;
        for play in &plays {
            println!("{}", serde_json::to_string(play)?);
        }
        info!("Dumped {} play(s)", plays.len());
        return Ok(());
    }

    let min_last_modified = match args.since_nsec {
        Some(ns) if ns > 0 => Some(OffsetDateTime::from_unix_timestamp_nanos(i128::from(ns))?),
        _ => None,
    };
    let options = ExportOptions {
        deleted: args.deleted,
        min_last_modified,
        max: args.max,
        omit: args.omit,
    };
    let songs = client.export_songs(&options).await?;
    for song in &songs {
        println!("{}", serde_json::to_string(song)?);
    }
    info!("Dumped {} song(s)", songs.len());
    Ok(())
}
