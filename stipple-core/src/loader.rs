use std::fmt;
use std::future::Future;
use std::path::PathBuf;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::{AssetStore, DeviceMap, ModelLike};

/// Which weight files of a pipeline repo to load.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightVariant {
    #[serde(rename = "fp16")]
    Fp16,
    #[serde(rename = "full")]
    Full,
}

serde_plain::derive_display_from_serialize!(WeightVariant);
serde_plain::derive_fromstr_from_deserialize!(WeightVariant);

impl WeightVariant {
    /// Repo-relative path of `stem` in `component`, e.g. `unet/diffusion_pytorch_model.fp16.safetensors`.
    pub fn file(self, component: &str, stem: &str) -> String {
        match self {
            Self::Fp16 => format!("{component}/{stem}.fp16.safetensors"),
            Self::Full => format!("{component}/{stem}.safetensors"),
        }
    }
}

/// The LCM LoRA to attach, if any.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum LcmLora {
    /// The adapter published for the pipeline family, if there is one.
    #[default]
    Default,
    Disabled,
    Repo(String),
}

impl fmt::Display for LcmLora {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => write!(f, "default"),
            Self::Disabled => write!(f, "none"),
            Self::Repo(id) => write!(f, "{id}"),
        }
    }
}

impl std::str::FromStr for LcmLora {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim() {
            "" | "default" => Self::Default,
            "none" | "off" => Self::Disabled,
            id => Self::Repo(id.to_string()),
        })
    }
}

/// What to load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub model_id: String,
    pub lcm_lora: LcmLora,
    /// `None` picks the family's usual weights.
    pub variant: Option<WeightVariant>,
}

impl ModelSpec {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            lcm_lora: LcmLora::Default,
            variant: None,
        }
    }
}

/// How to load it.
#[derive(Debug, Clone)]
pub struct LoadOptions {
    pub device_map: DeviceMap,
    pub use_f16: bool,
    pub sliced_attention_size: Option<usize>,
    pub use_flash_attn: bool,
    /// Where UNets with a fused LoRA are cached.
    pub fused_dir: PathBuf,
    /// Fuse and load the LCM UNet at startup instead of on first use.
    pub preload_lcm: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            device_map: DeviceMap::default(),
            use_f16: true,
            sliced_attention_size: None,
            use_flash_attn: false,
            fused_dir: std::env::temp_dir().join("stipple-fused"),
            preload_lcm: false,
        }
    }
}

pub trait Loader {
    type Model: ModelLike;

    fn load(
        spec: &ModelSpec,
        assets: &AssetStore,
        options: &LoadOptions,
    ) -> impl Future<Output = Result<Self::Model>>
    where
        Self: Sized;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_file_names() {
        assert_eq!(
            WeightVariant::Fp16.file("unet", "diffusion_pytorch_model"),
            "unet/diffusion_pytorch_model.fp16.safetensors"
        );
        assert_eq!(
            WeightVariant::Full.file("text_encoder", "model"),
            "text_encoder/model.safetensors"
        );
        assert_eq!("fp16".parse::<WeightVariant>().ok(), Some(WeightVariant::Fp16));
        assert_eq!(WeightVariant::Full.to_string(), "full");
    }

    #[test]
    fn lcm_lora_parsing() {
        assert_eq!("".parse::<LcmLora>(), Ok(LcmLora::Default));
        assert_eq!("none".parse::<LcmLora>(), Ok(LcmLora::Disabled));
        assert_eq!(
            "latent-consistency/lcm-lora-sdv1-5".parse::<LcmLora>(),
            Ok(LcmLora::Repo("latent-consistency/lcm-lora-sdv1-5".to_string()))
        );
        assert_eq!(LcmLora::Disabled.to_string(), "none");
    }
}
