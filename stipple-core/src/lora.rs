//! Low-rank adapter loading and fusion into UNet weights.
//!
//! Supports Kohya (`lora_unet_*`), PEFT (`*.lora_A.weight`) and the older
//! diffusers attention-processor layout. Adapters are merged into the base
//! weights ahead of time so the fused UNet runs at base-model speed.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Target {
    /// Kohya name: the module path with `.` flattened to `_`.
    Flat(String),
    /// Dotted module path relative to the UNet root.
    Module(String),
}

#[derive(Debug, Default)]
struct Parts {
    down: Option<Tensor>,
    up: Option<Tensor>,
    alpha: Option<f64>,
}

#[derive(Debug)]
struct Adapter {
    down: Tensor,
    up: Tensor,
    alpha: Option<f64>,
}

impl Adapter {
    fn rank(&self) -> Result<usize> {
        Ok(self.down.dim(0)?)
    }

    /// `up · down`, with convolution kernels flattened into the input axis.
    fn delta(&self) -> Result<Tensor> {
        let up = self.up.to_dtype(DType::F32)?.flatten_from(1)?;
        let down = self.down.to_dtype(DType::F32)?.flatten_from(1)?;
        Ok(up.matmul(&down)?)
    }
}

enum Part {
    Down,
    Up,
    Alpha,
}

/// Adapter weights for the UNet, keyed by the module they patch.
#[derive(Debug)]
pub struct LoraWeights {
    adapters: BTreeMap<Target, Adapter>,
}

/// Outcome of [`LoraWeights::fuse_into`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuseReport {
    pub fused: usize,
    pub unmatched: Vec<String>,
}

impl LoraWeights {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("failed to read lora weights {}", path.display()))?;
        Self::from_tensors(tensors)
    }

    pub fn from_tensors(tensors: HashMap<String, Tensor>) -> Result<Self> {
        let mut parts: BTreeMap<Target, Parts> = BTreeMap::new();
        for (key, tensor) in tensors {
            let Some((target, part)) = parse_key(&key) else {
                continue;
            };
            let entry = parts.entry(target).or_default();
            match part {
                Part::Down => entry.down = Some(tensor),
                Part::Up => entry.up = Some(tensor),
                Part::Alpha => {
                    let alpha = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
                    entry.alpha = alpha.first().copied();
                }
            }
        }

        let adapters: BTreeMap<Target, Adapter> = parts
            .into_iter()
            .filter_map(|(target, parts)| match (parts.down, parts.up) {
                (Some(down), Some(up)) => Some((
                    target,
                    Adapter {
                        down,
                        up,
                        alpha: parts.alpha,
                    },
                )),
                _ => {
                    tracing::debug!(?target, "skipping incomplete lora pair");
                    None
                }
            })
            .collect();

        if adapters.is_empty() {
            bail!("no unet lora adapters found");
        }
        Ok(Self { adapters })
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Adds `scale * (alpha / rank) * up · down` to every matching `<module>.weight`.
    pub fn fuse_into(&self, base: &mut HashMap<String, Tensor>, scale: f64) -> Result<FuseReport> {
        let flat_index: HashMap<String, String> = base
            .keys()
            .filter_map(|key| key.strip_suffix(".weight"))
            .map(|module| (module.replace('.', "_"), module.to_string()))
            .collect();

        let mut fused = 0;
        let mut unmatched = Vec::new();
        for (target, adapter) in &self.adapters {
            let module = match target {
                Target::Flat(flat) => flat_index.get(flat).cloned(),
                Target::Module(module) => Some(module.clone()),
            };
            let key = module.map(|m| format!("{m}.weight"));
            let Some((key, weight)) = key.and_then(|k| base.get(&k).cloned().map(|w| (k, w))) else {
                unmatched.push(match target {
                    Target::Flat(name) | Target::Module(name) => name.clone(),
                });
                continue;
            };

            let rank = adapter.rank()?;
            let alpha = adapter.alpha.unwrap_or(rank as f64);
            let factor = scale * alpha / rank as f64;
            let delta = adapter.delta()?;
            if delta.elem_count() != weight.elem_count() {
                bail!(
                    "lora shape {:?} does not fit {key} with shape {:?}",
                    delta.shape(),
                    weight.shape()
                );
            }
            let delta = (delta.reshape(weight.shape())? * factor)?;
            let merged = (weight.to_dtype(DType::F32)? + delta)?.to_dtype(weight.dtype())?;
            base.insert(key, merged);
            fused += 1;
        }

        if fused == 0 {
            bail!("none of the {} lora adapters matched the unet weights", self.len());
        }
        Ok(FuseReport { fused, unmatched })
    }
}

fn parse_key(key: &str) -> Option<(Target, Part)> {
    if key.starts_with("lora_te") {
        return None;
    }
    if let Some(rest) = key.strip_prefix("lora_unet_") {
        for (suffix, part) in [
            (".lora_down.weight", Part::Down),
            (".lora_up.weight", Part::Up),
            (".alpha", Part::Alpha),
        ] {
            if let Some(name) = rest.strip_suffix(suffix) {
                return Some((Target::Flat(name.to_string()), part));
            }
        }
        return None;
    }

    let rest = match key.strip_prefix("unet.") {
        Some(rest) => rest,
        None if key.starts_with("text_encoder") => return None,
        None => key,
    };
    for (suffix, part) in [
        (".lora_A.weight", Part::Down),
        (".lora_B.weight", Part::Up),
        (".lora.down.weight", Part::Down),
        (".lora.up.weight", Part::Up),
        ("_lora.down.weight", Part::Down),
        ("_lora.up.weight", Part::Up),
        (".alpha", Part::Alpha),
    ] {
        if let Some(module) = rest.strip_suffix(suffix) {
            return Some((Target::Module(normalize_module(module)), part));
        }
    }
    None
}

/// Maps attention-processor paths (`attn1.processor.to_out`) onto the module
/// that owns the weight (`attn1.to_out.0`).
fn normalize_module(module: &str) -> String {
    let module = module.replace(".processor.", ".");
    match module.strip_suffix(".to_out") {
        Some(prefix) => format!("{prefix}.to_out.0"),
        None => module,
    }
}

/// Fuses `lora_file` into `unet_file` and writes the result to `out_file`.
/// An existing `out_file` is reused as is.
pub fn fuse_file(unet_file: &Path, lora_file: &Path, scale: f64, out_file: &Path) -> Result<PathBuf> {
    if out_file.exists() {
        tracing::info!(path = %out_file.display(), "reusing fused unet weights");
        return Ok(out_file.to_path_buf());
    }

    let lora = LoraWeights::load(lora_file)?;
    let mut base = candle_core::safetensors::load(unet_file, &Device::Cpu)
        .with_context(|| format!("failed to read unet weights {}", unet_file.display()))?;
    let report = lora.fuse_into(&mut base, scale)?;
    tracing::info!(fused = report.fused, unmatched = report.unmatched.len(), "fused lora into unet");
    if !report.unmatched.is_empty() {
        tracing::warn!(modules = ?report.unmatched, "lora adapters without a matching unet weight");
    }

    if let Some(parent) = out_file.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let partial = out_file.with_extension("partial");
    candle_core::safetensors::save(&base, &partial).context("failed to write fused unet weights")?;
    std::fs::rename(&partial, out_file).context("failed to move fused unet weights into place")?;
    Ok(out_file.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(values: &[f32], shape: &[usize]) -> Tensor {
        Tensor::from_vec(values.to_vec(), shape, &Device::Cpu).unwrap()
    }

    fn base() -> HashMap<String, Tensor> {
        HashMap::from([
            (
                "down_blocks.1.attentions.0.proj_in.weight".to_string(),
                Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap(),
            ),
            (
                "down_blocks.1.attentions.0.proj_in.bias".to_string(),
                Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap(),
            ),
            (
                "mid_block.attentions.0.transformer_blocks.0.attn1.to_out.0.weight".to_string(),
                Tensor::ones((2, 2), DType::F32, &Device::Cpu).unwrap(),
            ),
        ])
    }

    #[test]
    fn kohya_adapter_fuses_with_alpha() -> anyhow::Result<()> {
        let lora = LoraWeights::from_tensors(HashMap::from([
            (
                "lora_unet_down_blocks_1_attentions_0_proj_in.lora_down.weight".to_string(),
                t(&[1.0, 2.0, 3.0], &[1, 3]),
            ),
            (
                "lora_unet_down_blocks_1_attentions_0_proj_in.lora_up.weight".to_string(),
                t(&[1.0, -1.0], &[2, 1]),
            ),
            (
                "lora_unet_down_blocks_1_attentions_0_proj_in.alpha".to_string(),
                Tensor::new(0.5f32, &Device::Cpu)?,
            ),
            ("lora_te_text_model_encoder_layers_0.alpha".to_string(), Tensor::new(1f32, &Device::Cpu)?),
        ]))?;
        assert_eq!(lora.len(), 1);

        let mut weights = base();
        let report = lora.fuse_into(&mut weights, 2.0)?;
        assert_eq!(report, FuseReport { fused: 1, unmatched: vec![] });

        // scale 2 * alpha 0.5 / rank 1 = 1
        let fused = weights["down_blocks.1.attentions.0.proj_in.weight"].to_vec2::<f32>()?;
        assert_eq!(fused, [[1.0, 2.0, 3.0], [-1.0, -2.0, -3.0]]);
        Ok(())
    }

    #[test]
    fn peft_adapter_defaults_alpha_to_rank() -> anyhow::Result<()> {
        let lora = LoraWeights::from_tensors(HashMap::from([
            (
                "unet.mid_block.attentions.0.transformer_blocks.0.attn1.to_out.0.lora_A.weight"
                    .to_string(),
                t(&[1.0, 0.0, 0.0, 1.0], &[2, 2]),
            ),
            (
                "unet.mid_block.attentions.0.transformer_blocks.0.attn1.to_out.0.lora_B.weight"
                    .to_string(),
                t(&[1.0, 0.0, 0.0, 1.0], &[2, 2]),
            ),
        ]))?;
        let mut weights = base();
        lora.fuse_into(&mut weights, 1.0)?;
        let fused = weights["mid_block.attentions.0.transformer_blocks.0.attn1.to_out.0.weight"]
            .to_vec2::<f32>()?;
        assert_eq!(fused, [[2.0, 1.0], [1.0, 2.0]]);
        Ok(())
    }

    #[test]
    fn legacy_processor_keys_resolve() {
        let (target, _) = parse_key(
            "unet.mid_block.attentions.0.transformer_blocks.0.attn1.processor.to_out_lora.up.weight",
        )
        .unwrap();
        assert_eq!(
            target,
            Target::Module("mid_block.attentions.0.transformer_blocks.0.attn1.to_out.0".into())
        );
        let (target, _) =
            parse_key("unet.down_blocks.0.attentions.0.transformer_blocks.0.attn2.processor.to_k_lora.down.weight")
                .unwrap();
        assert_eq!(
            target,
            Target::Module("down_blocks.0.attentions.0.transformer_blocks.0.attn2.to_k".into())
        );
    }

    #[test]
    fn conv_adapters_reshape_to_kernel() -> anyhow::Result<()> {
        let mut weights = HashMap::from([(
            "conv_in.weight".to_string(),
            Tensor::zeros((2, 1, 3, 3), DType::F32, &Device::Cpu)?,
        )]);
        let lora = LoraWeights::from_tensors(HashMap::from([
            ("lora_unet_conv_in.lora_down.weight".to_string(), Tensor::ones((1, 1, 3, 3), DType::F32, &Device::Cpu)?),
            ("lora_unet_conv_in.lora_up.weight".to_string(), Tensor::ones((2, 1, 1, 1), DType::F32, &Device::Cpu)?),
        ]))?;
        lora.fuse_into(&mut weights, 0.5)?;
        let fused = weights["conv_in.weight"].flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(fused.len(), 18);
        assert!(fused.iter().all(|&v| v == 0.5));
        Ok(())
    }

    #[test]
    fn unmatched_adapters_are_reported() -> anyhow::Result<()> {
        let lora = LoraWeights::from_tensors(HashMap::from([
            ("lora_unet_down_blocks_1_attentions_0_proj_in.lora_down.weight".to_string(), t(&[0.0; 3], &[1, 3])),
            ("lora_unet_down_blocks_1_attentions_0_proj_in.lora_up.weight".to_string(), t(&[0.0; 2], &[2, 1])),
            ("lora_unet_up_blocks_9_proj_out.lora_down.weight".to_string(), t(&[0.0; 3], &[1, 3])),
            ("lora_unet_up_blocks_9_proj_out.lora_up.weight".to_string(), t(&[0.0; 2], &[2, 1])),
        ]))?;
        let report = lora.fuse_into(&mut base(), 1.0)?;
        assert_eq!(report.fused, 1);
        assert_eq!(report.unmatched, ["up_blocks_9_proj_out"]);
        Ok(())
    }

    #[test]
    fn shape_mismatch_is_an_error() -> anyhow::Result<()> {
        let lora = LoraWeights::from_tensors(HashMap::from([
            ("lora_unet_down_blocks_1_attentions_0_proj_in.lora_down.weight".to_string(), t(&[0.0; 4], &[1, 4])),
            ("lora_unet_down_blocks_1_attentions_0_proj_in.lora_up.weight".to_string(), t(&[0.0; 2], &[2, 1])),
        ]))?;
        assert!(lora.fuse_into(&mut base(), 1.0).is_err());
        Ok(())
    }

    #[test]
    fn text_encoder_only_files_are_rejected() {
        let result = LoraWeights::from_tensors(HashMap::from([
            ("lora_te1_text_model_encoder_layers_0_mlp_fc1.lora_down.weight".to_string(), t(&[0.0; 2], &[1, 2])),
            ("lora_te1_text_model_encoder_layers_0_mlp_fc1.lora_up.weight".to_string(), t(&[0.0; 2], &[2, 1])),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn fused_file_round_trips_through_disk() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("stipple-lora-{}", std::process::id()));
        std::fs::create_dir_all(&dir)?;
        let unet_file = dir.join("unet.safetensors");
        let lora_file = dir.join("lora.safetensors");
        let out_file = dir.join("fused").join("unet-lcm.safetensors");

        candle_core::safetensors::save(&base(), &unet_file)?;
        candle_core::safetensors::save(
            &HashMap::from([
                ("lora_unet_down_blocks_1_attentions_0_proj_in.lora_down.weight", t(&[1.0, 1.0, 1.0], &[1, 3])),
                ("lora_unet_down_blocks_1_attentions_0_proj_in.lora_up.weight", t(&[1.0, 1.0], &[2, 1])),
            ]),
            &lora_file,
        )?;

        let written = fuse_file(&unet_file, &lora_file, 1.0, &out_file)?;
        let fused = candle_core::safetensors::load(&written, &Device::Cpu)?;
        assert_eq!(
            fused["down_blocks.1.attentions.0.proj_in.weight"].to_vec2::<f32>()?,
            [[1.0; 3], [1.0; 3]]
        );
        assert!(!out_file.with_extension("partial").exists());

        // A second call must not touch the cached file even if the inputs vanish.
        std::fs::remove_file(&lora_file)?;
        assert_eq!(fuse_file(&unet_file, &lora_file, 1.0, &out_file)?, out_file);

        std::fs::remove_dir_all(&dir)?;
        Ok(())
    }
}
