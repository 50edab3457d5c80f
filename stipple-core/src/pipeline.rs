//! The denoising pipeline shared by the SD v1 and SDXL models.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_transformers::models::stable_diffusion::{
    self, clip, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL, StableDiffusionConfig,
};
use image::DynamicImage;
use tokenizers::Tokenizer;

use crate::assets::{find_lora_weights, AssetStore};
use crate::sampler::{uses_guidance, NoiseSchedule, NoiseSource, Sampler, SamplerKind};
use crate::{
    enable_fast_matmul, lora, precision_for, select_best_device, tensor_to_image,
    GenerationRequest, LcmLora, LoadOptions, ModelDefaults, ModelSpec, WeightVariant,
};

/// What an unconditional branch looks like when no negative prompt is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EmptyNegative {
    Zeros,
    EncodeEmpty,
}

/// Static description of a pipeline family.
pub(crate) struct Flavor {
    pub name: &'static str,
    pub config: fn(Option<usize>) -> StableDiffusionConfig,
    /// `(component directory, tokenizer repo)` per text encoder.
    pub text_encoders: &'static [(&'static str, &'static str)],
    pub vae_scale: f64,
    pub defaults: ModelDefaults,
    pub default_variant: WeightVariant,
    pub default_lcm_lora: Option<&'static str>,
    pub empty_negative: EmptyNegative,
}

/// CLIP tokenizer plus text transformer.
pub(crate) struct PromptEncoder {
    tokenizer: Tokenizer,
    model: clip::ClipTextTransformer,
    pad_id: u32,
    max_len: usize,
    device: Device,
}

impl PromptEncoder {
    fn load(config: &clip::Config, tokenizer_file: &Path, weights: &Path, device: &Device) -> Result<Self> {
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(anyhow::Error::msg)
            .with_context(|| format!("failed to load tokenizer {}", tokenizer_file.display()))?;
        let pad_token = config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .with_context(|| format!("tokenizer has no {pad_token} token"))?;
        let model = stable_diffusion::build_clip_transformer(config, weights, device, DType::F32)
            .with_context(|| format!("failed to load text encoder {}", weights.display()))?;
        Ok(Self {
            tokenizer,
            model,
            pad_id,
            max_len: config.max_position_embeddings,
            device: device.clone(),
        })
    }

    fn encode(&self, prompt: &str) -> Result<Tensor> {
        let ids = self
            .tokenizer
            .encode(prompt, true)
            .map_err(anyhow::Error::msg)?
            .get_ids()
            .to_vec();
        let ids = fit_tokens(ids, self.max_len, self.pad_id);
        let tokens = Tensor::new(ids.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

/// Truncates to `max_len` keeping the end-of-text token, then pads.
fn fit_tokens(mut ids: Vec<u32>, max_len: usize, pad_id: u32) -> Vec<u32> {
    if ids.len() > max_len {
        tracing::warn!(tokens = ids.len(), max_len, "prompt truncated");
        let last = ids[ids.len() - 1];
        ids.truncate(max_len - 1);
        ids.push(last);
    }
    ids.resize(max_len, pad_id);
    ids
}

pub(crate) fn check_dims(width: usize, height: usize) -> Result<()> {
    if width == 0 || height == 0 || width % 8 != 0 || height % 8 != 0 {
        bail!("width and height must be positive multiples of 8, got {width}x{height}");
    }
    Ok(())
}

/// Base UNet weights plus an adapter, fused into a second UNet on first use.
struct LcmUnet {
    unet_file: PathBuf,
    lora_file: PathBuf,
    fused_file: PathBuf,
    unet: Option<UNet2DConditionModel>,
}

pub(crate) struct Pipeline {
    name: String,
    device: Device,
    dtype: DType,
    config: StableDiffusionConfig,
    use_flash_attn: bool,
    encoders: Vec<PromptEncoder>,
    empty_negative: EmptyNegative,
    unet: UNet2DConditionModel,
    lcm: Option<LcmUnet>,
    vae: AutoEncoderKL,
    vae_scale: f64,
    schedule: NoiseSchedule,
    defaults: ModelDefaults,
}

fn cache_name(id: &str) -> String {
    id.replace('/', "--")
}

fn fused_file_name(model_id: &str, lora_id: &str, variant: WeightVariant) -> String {
    format!(
        "{}__{}__{variant}.safetensors",
        cache_name(model_id),
        cache_name(lora_id)
    )
}

impl Pipeline {
    pub(crate) async fn assemble(
        flavor: &Flavor,
        spec: &ModelSpec,
        assets: &AssetStore,
        options: &LoadOptions,
    ) -> Result<Self> {
        let device = select_best_device(options.device_map).context("failed to set up device")?;
        let dtype = precision_for(&device, options.use_f16);
        enable_fast_matmul();
        let variant = spec.variant.unwrap_or(flavor.default_variant);
        let config = (flavor.config)(options.sliced_attention_size);
        let model_id = spec.model_id.as_str();
        tracing::info!(model_id, flavor = flavor.name, ?dtype, ?variant, store = %assets, "loading pipeline");

        assets.prepare(model_id).await?;

        let clip_configs = [Some(&config.clip), config.clip2.as_ref()];
        let mut encoders = Vec::with_capacity(flavor.text_encoders.len());
        for (index, (component, tokenizer_repo)) in flavor.text_encoders.iter().enumerate() {
            let clip_config = clip_configs
                .get(index)
                .copied()
                .flatten()
                .with_context(|| format!("{} has no config for {component}", flavor.name))?;
            let tokenizer = assets.get(tokenizer_repo, "tokenizer.json").await?;
            let weights = assets.get(model_id, &variant.file(component, "model")).await?;
            encoders.push(PromptEncoder::load(clip_config, &tokenizer, &weights, &device)?);
            tracing::info!(component, "loaded text encoder");
        }

        let unet_file = assets
            .get(model_id, &variant.file("unet", "diffusion_pytorch_model"))
            .await?;
        let unet = config
            .build_unet(&unet_file, &device, 4, options.use_flash_attn, dtype)
            .context("failed to load unet")?;
        tracing::info!("loaded unet");

        // The VAE overflows in f16, so it always decodes in f32.
        let vae_file = assets
            .get(model_id, &variant.file("vae", "diffusion_pytorch_model"))
            .await?;
        let vae = config
            .build_vae(&vae_file, &device, DType::F32)
            .context("failed to load vae")?;
        tracing::info!("loaded vae");

        let lora_id = match &spec.lcm_lora {
            LcmLora::Default => flavor.default_lcm_lora.map(str::to_string),
            LcmLora::Disabled => None,
            LcmLora::Repo(id) => Some(id.clone()),
        };
        let lcm = match lora_id {
            Some(lora_id) => {
                assets.prepare(&lora_id).await?;
                let files = assets.list(&lora_id).await?;
                let weights = find_lora_weights(&files)
                    .with_context(|| format!("failed to pick weights from {lora_id}"))?;
                let lora_file = assets.get(&lora_id, &weights).await?;
                let fused_file = options
                    .fused_dir
                    .join(fused_file_name(model_id, &lora_id, variant));
                tracing::info!(%lora_id, path = %lora_file.display(), "lcm lora available");
                Some(LcmUnet {
                    unet_file,
                    lora_file,
                    fused_file,
                    unet: None,
                })
            }
            None => None,
        };

        let mut pipeline = Self {
            name: model_id.to_string(),
            device,
            dtype,
            config,
            use_flash_attn: options.use_flash_attn,
            encoders,
            empty_negative: flavor.empty_negative,
            unet,
            lcm,
            vae,
            vae_scale: flavor.vae_scale,
            schedule: NoiseSchedule::stable_diffusion(),
            defaults: flavor.defaults,
        };
        if options.preload_lcm && pipeline.lcm.is_some() {
            pipeline.ensure_lcm_unet()?;
        }
        Ok(pipeline)
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn defaults(&self) -> ModelDefaults {
        self.defaults
    }

    pub(crate) fn supports_lcm(&self) -> bool {
        self.lcm.is_some()
    }

    fn ensure_lcm_unet(&mut self) -> Result<()> {
        let lcm = self
            .lcm
            .as_mut()
            .context("no LCM LoRA is configured for this model")?;
        if lcm.unet.is_some() {
            return Ok(());
        }
        tracing::info!(lora = %lcm.lora_file.display(), "loading lcm lora");
        let fused = lora::fuse_file(&lcm.unet_file, &lcm.lora_file, 1.0, &lcm.fused_file)?;
        let unet = self
            .config
            .build_unet(&fused, &self.device, 4, self.use_flash_attn, self.dtype)
            .context("failed to load lcm unet")?;
        lcm.unet = Some(unet);
        Ok(())
    }

    /// Text embeddings, with the unconditional batch first under guidance.
    fn conditioning(&self, prompt: &str, negative: Option<&str>, guided: bool) -> Result<Tensor> {
        let encode_all = |text: &str| -> Result<Tensor> {
            let parts = self
                .encoders
                .iter()
                .map(|encoder| encoder.encode(text))
                .collect::<Result<Vec<_>>>()?;
            Ok(Tensor::cat(&parts, D::Minus1)?)
        };

        let cond = encode_all(prompt)?;
        let embeddings = if guided {
            let uncond = unconditional(&cond, negative, self.empty_negative, encode_all)?;
            guidance_batch(uncond, cond)?
        } else {
            cond
        };
        Ok(embeddings.to_dtype(self.dtype)?)
    }

    pub(crate) fn run(&mut self, request: &GenerationRequest) -> Result<DynamicImage> {
        check_dims(request.width, request.height)?;
        let span = tracing::info_span!(
            "generate",
            sampler = %request.sampler,
            steps = request.steps,
            guidance = request.guidance,
            width = request.width,
            height = request.height,
        );
        let _enter = span.enter();

        if request.sampler == SamplerKind::Lcm {
            self.ensure_lcm_unet()?;
        }
        let unet = match request.sampler {
            SamplerKind::Lcm => self
                .lcm
                .as_ref()
                .and_then(|lcm| lcm.unet.as_ref())
                .context("lcm unet is not loaded")?,
            _ => &self.unet,
        };

        let mut noise = NoiseSource::new(request.seed);
        let guided = uses_guidance(request.guidance);
        let embeddings = self.conditioning(
            &request.prompt,
            request.negative_prompt.as_deref(),
            guided,
        )?;

        let mut sampler = request.sampler.build(request.steps, &self.schedule)?;
        let latents = noise.randn(
            (1, 4, request.height / 8, request.width / 8),
            &self.device,
            DType::F32,
        )?;
        let latents = (latents * sampler.init_noise_sigma())?.to_dtype(self.dtype)?;

        let latents = denoise(
            unet,
            sampler.as_mut(),
            &embeddings,
            latents,
            request.guidance,
            guided,
            &mut noise,
        )?;
        tracing::debug!("generated latent image");

        let image = decode(&self.vae, &latents, self.vae_scale)?;
        tracing::info!("decoded image");
        Ok(image)
    }
}

fn denoise(
    unet: &UNet2DConditionModel,
    sampler: &mut dyn Sampler,
    embeddings: &Tensor,
    mut latents: Tensor,
    guidance: f64,
    guided: bool,
    noise: &mut NoiseSource,
) -> Result<Tensor> {
    let timesteps = sampler.timesteps().to_vec();
    for (index, &timestep) in timesteps.iter().enumerate() {
        let input = if guided {
            Tensor::cat(&[&latents, &latents], 0)?
        } else {
            latents.clone()
        };
        let input = sampler.scale_model_input(input, index)?;
        let noise_pred = unet.forward(&input, timestep as f64, embeddings)?;
        let noise_pred = if guided {
            apply_guidance(&noise_pred, guidance)?
        } else {
            noise_pred
        };
        latents = sampler.step(&noise_pred, index, &latents, noise)?;
        tracing::debug!(step = index + 1, total = timesteps.len(), timestep, "denoising step");
    }
    Ok(latents)
}

/// Embedding for the unconditional branch.
fn unconditional(
    cond: &Tensor,
    negative: Option<&str>,
    empty: EmptyNegative,
    encode: impl Fn(&str) -> Result<Tensor>,
) -> Result<Tensor> {
    match (negative, empty) {
        (Some(negative), _) => encode(negative),
        (None, EmptyNegative::Zeros) => Ok(cond.zeros_like()?),
        (None, EmptyNegative::EncodeEmpty) => encode(""),
    }
}

/// Stacks the unconditional batch ahead of the conditional one.
fn guidance_batch(uncond: Tensor, cond: Tensor) -> Result<Tensor> {
    Ok(Tensor::cat(&[uncond, cond], 0)?)
}

/// `uncond + guidance * (cond - uncond)` over a prediction batched by [`guidance_batch`].
fn apply_guidance(noise_pred: &Tensor, guidance: f64) -> Result<Tensor> {
    let chunks = noise_pred.chunk(2, 0)?;
    let (uncond, cond) = (&chunks[0], &chunks[1]);
    Ok((uncond + ((cond - uncond)? * guidance)?)?)
}

fn decode(vae: &AutoEncoderKL, latents: &Tensor, scale: f64) -> Result<DynamicImage> {
    let latents = (latents.to_dtype(DType::F32)? / scale)?;
    let image = vae.decode(&latents)?;
    let image = ((image / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
    let image = (image.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?.i(0)?;
    tensor_to_image(&image)
}
