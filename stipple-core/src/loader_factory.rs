use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::pipeline::Flavor;
use crate::{sd, sdxl};
use crate::{AssetStore, LoadOptions, Loader, ModelLike, ModelSpec, SdV1Loader, SdxlLoader};

/// Enum of supported pipeline families
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelType {
    Sdxl,
    StableDiffusionV1,
}

#[derive(Deserialize)]
struct ModelIndex {
    #[serde(rename = "_class_name")]
    class_name: String,
}

impl ModelType {
    /// Detect model type from the repo id
    pub fn from_name(model_id: &str) -> Option<Self> {
        let name = model_id.to_lowercase();

        if name.contains("xl") {
            Some(ModelType::Sdxl)
        } else if name.contains("stable-diffusion-v1") || name.contains("sd-v1") || name.contains("sdv1") {
            Some(ModelType::StableDiffusionV1)
        } else {
            None
        }
    }

    /// Detect model type from the `_class_name` of a diffusers `model_index.json`
    pub fn from_model_index(contents: &str) -> Result<Self> {
        let index: ModelIndex =
            serde_json::from_str(contents).context("failed to parse model_index.json")?;
        match index.class_name.as_str() {
            "StableDiffusionXLPipeline" => Ok(ModelType::Sdxl),
            "StableDiffusionPipeline" => Ok(ModelType::StableDiffusionV1),
            other => Err(anyhow!("unsupported pipeline class {other}")),
        }
    }

    fn flavor(self) -> &'static Flavor {
        match self {
            ModelType::Sdxl => &sdxl::SDXL,
            ModelType::StableDiffusionV1 => &sd::SD_V1,
        }
    }

    /// Repos holding the `tokenizer.json` of each text encoder.
    pub fn tokenizer_repos(self) -> Vec<&'static str> {
        self.flavor()
            .text_encoders
            .iter()
            .map(|(_, repo)| *repo)
            .collect()
    }

    pub fn default_lcm_lora(self) -> Option<&'static str> {
        self.flavor().default_lcm_lora
    }

    async fn detect(model_id: &str, assets: &AssetStore) -> Result<Self> {
        if let Some(model_type) = Self::from_name(model_id) {
            return Ok(model_type);
        }
        let index = assets
            .get(model_id, "model_index.json")
            .await
            .with_context(|| format!("unsupported model {model_id}"))?;
        let contents = tokio::fs::read_to_string(&index)
            .await
            .with_context(|| format!("failed to read {}", index.display()))?;
        Self::from_model_index(&contents)
    }
}

/// Load a pipeline, detecting its family from the repo id or its model index
pub async fn load_model(
    spec: &ModelSpec,
    assets: &AssetStore,
    options: &LoadOptions,
) -> Result<Box<dyn ModelLike>> {
    assets.prepare(&spec.model_id).await?;
    let model_type = ModelType::detect(&spec.model_id, assets).await?;

    tracing::info!(
        model_id = %spec.model_id,
        ?model_type,
        lcm_lora = %spec.lcm_lora,
        device = %options.device_map,
        "loading model"
    );

    match model_type {
        ModelType::Sdxl => {
            let model = SdxlLoader::load(spec, assets, options).await?;
            Ok(Box::new(model))
        }
        ModelType::StableDiffusionV1 => {
            let model = SdV1Loader::load(spec, assets, options).await?;
            Ok(Box::new(model))
        }
    }
}
