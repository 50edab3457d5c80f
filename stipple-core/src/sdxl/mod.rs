use anyhow::Result;
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use image::DynamicImage;

use crate::pipeline::{EmptyNegative, Flavor, Pipeline};
use crate::{
    AssetStore, GenerationRequest, LoadOptions, Loader, ModelDefaults, ModelLike, ModelSpec,
    WeightVariant,
};

pub const SDXL_BASE: &str = "stabilityai/stable-diffusion-xl-base-1.0";
pub const SDXL_LCM_LORA: &str = "latent-consistency/lcm-lora-sdxl";

fn sdxl_config(sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
    StableDiffusionConfig::sdxl(sliced_attention_size, None, None)
}

pub(crate) static SDXL: Flavor = Flavor {
    name: "sdxl",
    config: sdxl_config,
    text_encoders: &[
        ("text_encoder", "openai/clip-vit-large-patch14"),
        ("text_encoder_2", "laion/CLIP-ViT-bigG-14-laion2B-39B-b160k"),
    ],
    vae_scale: 0.13025,
    defaults: ModelDefaults {
        width: 1024,
        height: 1024,
        steps: 30,
        guidance: 6.0,
    },
    default_variant: WeightVariant::Fp16,
    default_lcm_lora: Some(SDXL_LCM_LORA),
    // SDXL zeroes the unconditional embedding when there is no negative prompt.
    empty_negative: EmptyNegative::Zeros,
};

pub struct SdxlModel {
    pipeline: Pipeline,
}

impl ModelLike for SdxlModel {
    fn name(&self) -> &str {
        self.pipeline.name()
    }

    fn defaults(&self) -> ModelDefaults {
        self.pipeline.defaults()
    }

    fn supports_lcm(&self) -> bool {
        self.pipeline.supports_lcm()
    }

    fn run(&mut self, request: &GenerationRequest) -> Result<DynamicImage> {
        self.pipeline.run(request)
    }
}

pub struct SdxlLoader;

impl Loader for SdxlLoader {
    type Model = SdxlModel;

    async fn load(spec: &ModelSpec, assets: &AssetStore, options: &LoadOptions) -> Result<Self::Model> {
        let pipeline = Pipeline::assemble(&SDXL, spec, assets, options).await?;
        Ok(SdxlModel { pipeline })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_text_encoders_match_config() {
        let config = (SDXL.config)(None);
        assert_eq!(SDXL.text_encoders.len(), 2);
        assert!(config.clip2.is_some());
        assert_eq!(config.height, 1024);
        assert_eq!(config.width, 1024);
    }

    #[test]
    fn native_defaults() {
        assert_eq!(SDXL.defaults.width, 1024);
        assert_eq!(SDXL.defaults.steps, 30);
        assert_eq!(SDXL.default_variant, WeightVariant::Fp16);
        assert_eq!(SDXL.empty_negative, EmptyNegative::Zeros);
    }
}
