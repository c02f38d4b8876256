//! # tabletop
//!
//! Operator tools for tabletop rooms:
//! - `upload`: push a recorded file through the configured upload provider
//! - `ice`: show the STUN/TURN servers the application server hands out for a room
//!
//! Settings come from `config.toml`, `.env` and `TABLETOP__*` variables, the
//! same way the room runtime reads them.

mod file_recorder;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tabletop_common::http::ApiClient;
use tabletop_common::models::{RecordingMetadata, UploadProviderKind};
use tabletop_room::ice::IceNegotiationConfig;
use tabletop_room::media::{MediaStream, MediaTrack, TrackKind};
use tabletop_room::recording::{RecordingController, RecordingTuning};
use tabletop_upload::{UploadTuning, providers};

use crate::file_recorder::FileRecorder;

#[derive(Parser, Debug)]
#[command(name = "tabletop", version)]
#[command(about = "Tools for tabletop companion rooms")]
struct Cli {
    /// Application server base URL (overrides `app.base_url`).
    #[arg(long, global = true, env = "TABLETOP_BASE_URL")]
    base_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Upload a recording file for a room.
    Upload {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long)]
        room: String,
        #[arg(long)]
        user: String,
        /// local, multipart_cloud or resumable_direct.
        #[arg(long, default_value_t = UploadProviderKind::Local)]
        provider: UploadProviderKind,
        /// Bytes per recorder chunk.
        #[arg(long, default_value_t = 256 * 1024)]
        chunk_size: usize,
    },
    /// Fetch the ICE servers for a room.
    Ice {
        #[arg(long)]
        room: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = tabletop_common::config::init()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tabletop=debug".into()),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let base_url = cli.base_url.as_deref().unwrap_or(&config.app.base_url);
    let api = ApiClient::new(base_url, &config.app.csrf_token)?;
    tracing::debug!(base_url, "Application server client ready");

    match cli.command {
        Command::Upload { file, room, user, provider, chunk_size } => {
            let provider = providers::create(provider, api, &UploadTuning::from(&config.upload));
            let recorder = Arc::new(FileRecorder::new(&file, chunk_size));
            let mut metadata = RecordingMetadata::new(&room, &user);
            if let Some(name) = file.file_name().and_then(|n| n.to_str()) {
                metadata.filename = name.to_owned();
            }
            let stream = Arc::new(MediaStream::new(
                metadata.filename.clone(),
                vec![MediaTrack::new("file", TrackKind::Video)],
            ));

            tracing::info!(room = %room, file = %file.display(), provider = %provider.kind(), "Uploading recording");
            let controller = RecordingController::start(
                recorder,
                provider,
                metadata,
                stream,
                RecordingTuning::from(&config.upload),
            )
            .await?;

            match controller.stop().await? {
                Some(receipt) => println!("{}", serde_json::to_string_pretty(&receipt)?),
                None => anyhow::bail!("{} is empty, nothing uploaded", file.display()),
            }
        }
        Command::Ice { room } => {
            let ice = IceNegotiationConfig::new(api, room, Duration::from_secs(config.ice.ttl_secs));
            let servers = ice.fetch().await?;
            println!("{}", serde_json::to_string_pretty(&servers)?);
        }
    }

    Ok(())
}
