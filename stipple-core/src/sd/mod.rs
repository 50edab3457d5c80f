use anyhow::Result;
use candle_transformers::models::stable_diffusion::StableDiffusionConfig;
use image::DynamicImage;

use crate::pipeline::{EmptyNegative, Flavor, Pipeline};
use crate::{
    AssetStore, GenerationRequest, LoadOptions, Loader, ModelDefaults, ModelLike, ModelSpec,
    WeightVariant,
};

pub const SD_V1_4: &str = "CompVis/stable-diffusion-v1-4";

fn v1_config(sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
    // v1.4 and v1.5 share an architecture.
    StableDiffusionConfig::v1_5(sliced_attention_size, None, None)
}

pub(crate) static SD_V1: Flavor = Flavor {
    name: "sd-v1",
    config: v1_config,
    text_encoders: &[("text_encoder", "openai/clip-vit-base-patch32")],
    vae_scale: 0.18215,
    defaults: ModelDefaults {
        width: 512,
        height: 512,
        steps: 50,
        guidance: 7.5,
    },
    default_variant: WeightVariant::Full,
    default_lcm_lora: None,
    empty_negative: EmptyNegative::EncodeEmpty,
};

/// Stable Diffusion v1.x. LCM is only available when a LoRA is named explicitly.
pub struct SdV1Model {
    pipeline: Pipeline,
}

impl ModelLike for SdV1Model {
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

pub struct SdV1Loader;

impl Loader for SdV1Loader {
    type Model = SdV1Model;

    async fn load(spec: &ModelSpec, assets: &AssetStore, options: &LoadOptions) -> Result<Self::Model> {
        let pipeline = Pipeline::assemble(&SD_V1, spec, assets, options).await?;
        Ok(SdV1Model { pipeline })
    }
}
