use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{self, clip, unet_2d, vae, StableDiffusionConfig};
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

use crate::cache::{self, WeightsCache};
use crate::device::{dtype_for, select_best_device};
use crate::{DeviceMap, Error, ImageModelLike, Loader, Result};

/// Classifier-free guidance strength, fixed for every request.
const GUIDANCE_SCALE: f64 = 8.0;
/// Scale between the vae latent space and the unet latent space (SD v1.x).
const VAE_SCALE: f64 = 0.18215;
/// Latent channels expected by the SD v1.5 unet.
const LATENT_CHANNELS: usize = 4;

pub struct DiffusionModel {
    config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    text_encoder: clip::ClipTextTransformer,
    unet: unet_2d::UNet2DConditionModel,
    vae: vae::AutoEncoderKL,
    device: Device,
    dtype: DType,
}

impl DiffusionModel {
    /// CLIP embedding of `prompt`, fitted to the encoder's context length.
    /// Shape (1, seq, dim).
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let pad_id = match &self.config.clip.pad_with {
            Some(padding) => self.token_id(padding)?,
            None => self.token_id("<|endoftext|>")?,
        };
        let tokens = self.tokenizer.encode(prompt, true)?.get_ids().to_vec();
        if tokens.len() > self.config.clip.max_position_embeddings {
            warn!(
                tokens = tokens.len(),
                limit = self.config.clip.max_position_embeddings,
                "prompt exceeds clip context, truncating"
            );
        }
        let tokens = fit_context(tokens, self.config.clip.max_position_embeddings, pad_id);

        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_encoder.forward(&tokens)?)
    }

    fn token_id(&self, token: &str) -> Result<u32> {
        self.tokenizer
            .get_vocab(true)
            .get(token)
            .copied()
            .ok_or_else(|| Error::Configuration(format!("token {token:?} missing from clip vocab")))
    }
}

impl ImageModelLike for DiffusionModel {
    fn run(&self, prompt: &str, steps: usize, batch_size: usize) -> Result<Vec<DynamicImage>> {
        let mut scheduler = self.config.build_scheduler(steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        // Conditional and unconditional embeddings for classifier-free
        // guidance, tiled across the batch.
        let cond = self.encode_prompt(prompt)?.repeat((batch_size, 1, 1))?;
        let uncond = self.encode_prompt("")?.repeat((batch_size, 1, 1))?;
        let text_embeddings = Tensor::cat(&[&uncond, &cond], 0)?.to_dtype(self.dtype)?;

        // Seeding is left to the device rng; outputs are not reproducible
        // across calls.
        let latents = Tensor::randn(
            0f32,
            1f32,
            (
                batch_size,
                LATENT_CHANNELS,
                self.config.height / 8,
                self.config.width / 8,
            ),
            &self.device,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        for &timestep in &timesteps {
            let latent_model_input = Tensor::cat(&[&latents, &latents], 0)?;
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = noise_pred.chunk(2, 0)?;
            let (uncond_pred, cond_pred) = (&noise_pred[0], &noise_pred[1]);
            let noise_pred = (uncond_pred + ((cond_pred - uncond_pred)? * GUIDANCE_SCALE)?)?;
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(timestep, "denoising step");
        }

        let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let decoded = ((decoded / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let decoded = (decoded.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;

        let mut images = Vec::with_capacity(batch_size);
        for i in 0..batch_size {
            images.push(tensor_to_image(&decoded.i(i)?)?);
        }
        Ok(images)
    }
}

pub struct DiffusionLoader;

impl Loader for DiffusionLoader {
    type Model = DiffusionModel;

    fn load(weights: &WeightsCache, device_map: DeviceMap) -> Result<Self::Model> {
        let device = select_best_device(device_map)?;
        let dtype = dtype_for(&device);
        let config = StableDiffusionConfig::v1_5(None, None, None);

        let tokenizer_file = weights.get(cache::CLIP_TOKENIZER_ID, cache::CLIP_TOKENIZER_FILE)?;
        let tokenizer = Tokenizer::from_file(&tokenizer_file)
            .map_err(|e| Error::Configuration(format!("malformed clip tokenizer: {e}")))?;

        info!(model = cache::DIFFUSION_MODEL_ID, ?device, "loading diffusion pipeline");

        let clip_weights = weights.get(cache::DIFFUSION_MODEL_ID, cache::TEXT_ENCODER_FILE)?;
        let text_encoder =
            stable_diffusion::build_clip_transformer(&config.clip, clip_weights, &device, dtype)?;

        let vae_weights = weights.get(cache::DIFFUSION_MODEL_ID, cache::VAE_FILE)?;
        let vae = config.build_vae(vae_weights, &device, dtype)?;

        let unet_weights = weights.get(cache::DIFFUSION_MODEL_ID, cache::UNET_FILE)?;
        let unet = config.build_unet(
            unet_weights,
            &device,
            LATENT_CHANNELS,
            cfg!(feature = "flash-attn"),
            dtype,
        )?;

        Ok(DiffusionModel {
            config,
            tokenizer,
            text_encoder,
            unet,
            vae,
            device,
            dtype,
        })
    }
}

/// Truncates or pads `tokens` to exactly `limit` entries. Over-long prompts
/// lose their tail, matching how diffusers-style pipelines handle them.
fn fit_context(mut tokens: Vec<u32>, limit: usize, pad_id: u32) -> Vec<u32> {
    tokens.truncate(limit);
    tokens.resize(limit, pad_id);
    tokens
}

/// Converts a (3, height, width) u8 tensor into an rgb image.
fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        return Err(Error::Inference(format!(
            "expected 3 image channels, got {channels}"
        )));
    }
    let pixels = img.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| Error::Inference("image buffer size mismatch".into()))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

#[cfg(test)]
mod tests {
    use super::{fit_context, tensor_to_image};
    use candle_core::{DType, Device, Tensor};

    #[test]
    fn short_prompts_are_padded_to_the_context_length() {
        assert_eq!(fit_context(vec![1, 2, 3], 5, 0), vec![1, 2, 3, 0, 0]);
    }

    #[test]
    fn long_prompts_are_truncated_not_rejected() {
        assert_eq!(fit_context(vec![1, 2, 3, 4, 5, 6], 4, 0), vec![1, 2, 3, 4]);
    }

    #[test]
    fn converts_chw_tensor_to_image() {
        let tensor = Tensor::zeros((3, 2, 4), DType::U8, &Device::Cpu).unwrap();
        let image = tensor_to_image(&tensor).unwrap();
        assert_eq!(image.width(), 4);
        assert_eq!(image.height(), 2);
    }

    #[test]
    fn rejects_non_rgb_tensors() {
        let tensor = Tensor::zeros((1, 2, 2), DType::U8, &Device::Cpu).unwrap();
        assert!(tensor_to_image(&tensor).is_err());
    }
}
