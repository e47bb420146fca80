use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use hf_hub::api::tokio::{Api, ApiBuilder, ApiError};
use hf_hub::Cache;
use tracing::info;

use crate::{Error, Result};

/// Diffusion snapshot. The fp16 weight files are the ones published for this
/// repo, matching the reduced-precision runtime configuration.
pub const DIFFUSION_MODEL_ID: &str = "runwayml/stable-diffusion-v1-5";
/// Tokenizer repo for the CLIP text encoder used by SD v1.5.
pub const CLIP_TOKENIZER_ID: &str = "openai/clip-vit-base-patch32";
/// Chat model snapshot.
pub const CHAT_MODEL_ID: &str = "meta-llama/Llama-2-13b-chat-hf";

pub const CLIP_TOKENIZER_FILE: &str = "tokenizer.json";
pub const TEXT_ENCODER_FILE: &str = "text_encoder/model.fp16.safetensors";
pub const UNET_FILE: &str = "unet/diffusion_pytorch_model.fp16.safetensors";
pub const VAE_FILE: &str = "vae/diffusion_pytorch_model.fp16.safetensors";

const CHAT_INDEX_FILE: &str = "model.safetensors.index.json";

/// A single shared directory holding every model snapshot.
///
/// `fetch` is the only writer and runs once, ahead of serving; everything else
/// is a cache-only lookup that never touches the network.
pub struct WeightsCache {
    root: PathBuf,
    cache: Cache,
}

impl WeightsCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let cache = Cache::new(root.clone());
        Self { root, cache }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a cached file, failing if the cache was never provisioned.
    pub fn get(&self, model_id: &str, filename: &str) -> Result<PathBuf> {
        self.cache
            .model(model_id.to_string())
            .get(filename)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "{model_id}/{filename} not found under {}; run `limn-server fetch` first",
                    self.root.display()
                ))
            })
    }

    /// One-time provisioning: download pinned snapshots of both models into
    /// the cache directory. Requires a hub access token (the chat snapshot is
    /// gated). Any failure aborts; a failed fetch is simply re-run.
    pub async fn fetch(&self, token: String) -> Result<()> {
        let api = ApiBuilder::new()
            .with_cache_dir(self.root.clone())
            .with_token(Some(token))
            .build()
            .map_err(hub_err)?;

        self.fetch_diffusion(&api).await?;
        self.fetch_chat(&api).await?;
        info!(cache = %self.root.display(), "weight cache provisioned");
        Ok(())
    }

    async fn fetch_diffusion(&self, api: &Api) -> Result<()> {
        info!(model = DIFFUSION_MODEL_ID, "fetching diffusion snapshot");
        api.model(CLIP_TOKENIZER_ID.to_string())
            .get(CLIP_TOKENIZER_FILE)
            .await
            .map_err(hub_err)?;
        let repo = api.model(DIFFUSION_MODEL_ID.to_string());
        for file in [TEXT_ENCODER_FILE, UNET_FILE, VAE_FILE] {
            repo.get(file).await.map_err(hub_err)?;
        }
        Ok(())
    }

    async fn fetch_chat(&self, api: &Api) -> Result<()> {
        info!(model = CHAT_MODEL_ID, "fetching chat snapshot");
        let repo = api.model(CHAT_MODEL_ID.to_string());
        repo.get("config.json").await.map_err(hub_err)?;
        repo.get("tokenizer.json").await.map_err(hub_err)?;
        let index_file = repo.get(CHAT_INDEX_FILE).await.map_err(hub_err)?;
        for shard in read_shard_names(&index_file)? {
            repo.get(&shard).await.map_err(hub_err)?;
        }
        Ok(())
    }

    /// Cached paths of every weight shard of the chat snapshot.
    pub(crate) fn chat_shards(&self) -> Result<Vec<PathBuf>> {
        let index_file = self.get(CHAT_MODEL_ID, CHAT_INDEX_FILE)?;
        read_shard_names(&index_file)?
            .iter()
            .map(|name| self.get(CHAT_MODEL_ID, name))
            .collect()
    }
}

fn hub_err(err: ApiError) -> Error {
    Error::Configuration(format!("hub download failed: {err}"))
}

fn read_shard_names(index_file: &Path) -> Result<Vec<String>> {
    let bytes = std::fs::read(index_file).map_err(|e| {
        Error::Configuration(format!("read {}: {e}", index_file.display()))
    })?;
    let index: serde_json::Value = serde_json::from_slice(&bytes).map_err(|e| {
        Error::Configuration(format!("malformed safetensors index: {e}"))
    })?;
    shard_names(&index)
}

/// Distinct shard filenames referenced by a `model.safetensors.index.json`.
fn shard_names(index: &serde_json::Value) -> Result<Vec<String>> {
    let weight_map = index["weight_map"]
        .as_object()
        .ok_or_else(|| Error::Configuration("safetensors index has no weight_map".into()))?;
    let names: BTreeSet<String> = weight_map
        .values()
        .filter_map(|v| v.as_str())
        .map(str::to_string)
        .collect();
    Ok(names.into_iter().collect())
}
