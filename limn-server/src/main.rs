use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use limn_core::chat::ChatLoader;
use limn_core::diffusion::DiffusionLoader;
use limn_core::{portrait, DeviceMap, Loader, WeightsCache};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod api;

#[derive(Parser, Debug)]
#[command(author, version, about = "Character portrait generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long, global = true)]
    cpu: bool,

    /// Shared model weight cache directory
    #[arg(long, global = true, default_value = "/vol/cache")]
    cache_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Download both model snapshots into the weight cache
    Fetch {
        /// Hugging Face access token (the chat snapshot is gated)
        #[arg(long, env = "HUGGINGFACE_TOKEN")]
        token: String,
    },
    /// Load both models and start the HTTP server
    Serve {
        /// Host address to bind the server to
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Port to bind the server to
        #[arg(long, default_value_t = 8000)]
        port: u16,
    },
    /// Describe a character and render a batch of portraits locally
    Run {
        #[arg(long, default_value = "Remains of the Day")]
        book: String,

        #[arg(long, default_value = "Stevens")]
        character: String,

        /// Write the generated PNGs here instead of discarding them
        #[arg(long)]
        output_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let weights = WeightsCache::new(args.cache_dir);
    let device_map = if args.cpu {
        DeviceMap::ForceCpu
    } else {
        DeviceMap::default()
    };

    match args.command {
        Command::Fetch { token } => {
            weights
                .fetch(token)
                .await
                .context("failed to provision weight cache")?;
        }
        Command::Serve { host, port } => {
            let image = DiffusionLoader::load(&weights, device_map)?;
            let chat = ChatLoader::load(&weights, device_map)?;
            let state = api::AppState {
                image: Arc::new(image),
                chat: Arc::new(chat),
            };

            let app = api::router(state);
            let bind_address = format!("{host}:{port}");
            let listener = TcpListener::bind(&bind_address)
                .await
                .with_context(|| format!("failed to bind {bind_address}"))?;
            info!("listening on {}", listener.local_addr()?);
            axum::serve(listener, app.into_make_service()).await?;
        }
        Command::Run {
            book,
            character,
            output_dir,
        } => {
            let image = DiffusionLoader::load(&weights, device_map)?;
            let chat = ChatLoader::load(&weights, device_map)?;
            let images =
                portrait::run_end_to_end(&chat, &image, &book, &character, output_dir.as_deref())?;
            info!(images = images.len(), "portrait batch complete");
        }
    }

    Ok(())
}
