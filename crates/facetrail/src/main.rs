use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod render;

use config::Config;

#[derive(Parser)]
#[command(name = "facetrail", about = "Live webcam face tracking and recognition")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Track and label faces from the camera until `q` in the window or Ctrl-C
    Run {
        /// Directory of known-face images (overrides FACETRAIL_GALLERY_DIR)
        #[arg(short, long)]
        gallery: Option<PathBuf>,
        /// Write the annotated frame here every frame (overrides FACETRAIL_PREVIEW_PATH)
        #[arg(short, long)]
        preview: Option<PathBuf>,
        /// Do not open the preview window (overrides FACETRAIL_WINDOW)
        #[arg(long)]
        headless: bool,
    },
    /// Encode the gallery directory and print its identities as JSON
    Gallery {
        /// Directory of known-face images (overrides FACETRAIL_GALLERY_DIR)
        #[arg(short, long)]
        gallery: Option<PathBuf>,
    },
    /// List V4L2 capture devices
    Devices,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let mut config = Config::load().context("loading configuration")?;

    match cli.command {
        Commands::Run { gallery, preview, headless } => {
            if let Some(dir) = gallery {
                config.gallery_dir = dir;
            }
            if preview.is_some() {
                config.preview_path = preview;
            }
            if headless {
                config.window = false;
            }
            run(config).await?;
        }
        Commands::Gallery { gallery } => {
            if let Some(dir) = gallery {
                config.gallery_dir = dir;
            }
            let (_, gallery) = engine::load_gallery(&config)
                .with_context(|| format!("loading gallery from {}", config.gallery_dir.display()))?;
            let identities: Vec<_> = gallery
                .entries()
                .iter()
                .map(|e| {
                    serde_json::json!({
                        "label": e.label,
                        "dimensions": e.embedding.values.len(),
                        "model_version": e.embedding.model_version,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&identities)?);
        }
        Commands::Devices => {
            let devices = facetrail_hw::Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
        }
    }

    Ok(())
}

/// Run the engine thread until it fails, or the quit key or Ctrl-C stops it after the current frame.
async fn run(config: Config) -> Result<()> {
    tracing::info!(
        camera = %config.camera_device,
        gallery = %config.gallery_dir.display(),
        preview = ?config.preview_path,
        window = config.window,
        "facetrail starting"
    );

    let stop = Arc::new(AtomicBool::new(false));
    let engine = engine::spawn_engine(config, stop.clone());
    let mut join = tokio::task::spawn_blocking(move || engine.join());

    let joined = tokio::select! {
        joined = &mut join => joined,
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for Ctrl-C")?;
            tracing::info!("facetrail shutting down");
            stop.store(true, Ordering::Relaxed);
            join.await
        }
    };

    let frames = joined
        .context("joining engine task")?
        .map_err(|_| anyhow!("engine thread panicked"))??;
    tracing::info!(frames, "facetrail stopped");
    Ok(())
}
