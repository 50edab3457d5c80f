#[cfg(feature = "accelerate")]
extern crate accelerate_src;

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod assets;
pub mod device_map;
pub mod loader;
pub mod lora;
pub mod sampler;
mod loader_factory;
mod util;

mod pipeline;
mod sd;
mod sdxl;

pub use assets::AssetStore;
pub use device_map::*;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use sampler::{SamplerKind, SamplerPlan};
pub use sd::{SdV1Loader, SdV1Model, SD_V1_4};
pub use sdxl::{SdxlLoader, SdxlModel, SDXL_BASE, SDXL_LCM_LORA};
use serde::{Deserialize, Serialize};
pub use util::{enable_fast_matmul, image_to_png, precision_for, select_best_device, tensor_to_image};

/// A fully resolved generation request. Defaults and the sampler plan have
/// already been applied by the caller.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    pub seed: Option<u64>,
    pub sampler: SamplerKind,
}

/// Native defaults of a loaded pipeline, used when neither the request nor
/// the service configuration supplies a value.
#[derive(Serialize, Debug, Clone, Copy, PartialEq)]
pub struct ModelDefaults {
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
}

pub trait ModelLike: Send {
    fn name(&self) -> &str;

    fn defaults(&self) -> ModelDefaults;

    /// Whether an LCM LoRA is configured for this pipeline.
    fn supports_lcm(&self) -> bool;

    fn run(&mut self, request: &GenerationRequest) -> anyhow::Result<DynamicImage>;
}
