//! Staging of model weights onto local disk.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use hf_hub::api::tokio::{Api, ApiBuilder};
use regex::Regex;
use tokio::process::Command;

/// Where weight files come from.
#[derive(Debug, Clone)]
pub enum AssetStore {
    /// Individual files fetched from the Hugging Face hub into its cache.
    Hub(Api),
    /// Repos mirrored under `<bucket>/models/<repo_id>`, copied to `<root>/<repo_id>` on first use.
    Bucket { bucket: String, root: PathBuf },
    /// Repos already present under `<root>/<repo_id>`.
    Local { root: PathBuf },
}

impl fmt::Display for AssetStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Hub(_) => write!(f, "hub"),
            Self::Bucket { bucket, root } => write!(f, "bucket {bucket} via {}", root.display()),
            Self::Local { root } => write!(f, "local {}", root.display()),
        }
    }
}

pub fn hub_api(token: Option<String>) -> Result<Api> {
    ApiBuilder::new()
        .with_token(token)
        .build()
        .context("failed to create hf hub api")
}

impl AssetStore {
    pub fn hub(token: Option<String>) -> Result<Self> {
        Ok(Self::Hub(hub_api(token)?))
    }

    fn repo_dir(root: &Path, repo_id: &str) -> PathBuf {
        root.join(repo_id)
    }

    /// Makes `repo_id` available locally. Only the bucket store does any work here.
    pub async fn prepare(&self, repo_id: &str) -> Result<()> {
        let Self::Bucket { bucket, root } = self else {
            return Ok(());
        };
        let local = Self::repo_dir(root, repo_id);
        if local.exists() {
            tracing::info!(repo_id, path = %local.display(), "already cached locally");
            return Ok(());
        }

        let parent = local
            .parent()
            .with_context(|| format!("{} has no parent directory", local.display()))?;
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let source = format!("{}/models/{repo_id}", bucket.trim_end_matches('/'));
        let target = format!("{}/", parent.display());
        tracing::info!(%source, %target, "copying from bucket");
        let status = Command::new("gsutil")
            .args(["-m", "cp", "-r"])
            .arg(&source)
            .arg(&target)
            .status()
            .await
            .context("failed to run gsutil")?;
        if !status.success() {
            bail!("gsutil cp {source} exited with {status}");
        }
        tracing::info!(repo_id, "downloaded from bucket");
        Ok(())
    }

    /// Local path of `file` inside `repo_id`.
    pub async fn get(&self, repo_id: &str, file: &str) -> Result<PathBuf> {
        match self {
            Self::Hub(api) => api
                .model(repo_id.to_string())
                .get(file)
                .await
                .with_context(|| format!("failed to get {file} from {repo_id}")),
            Self::Bucket { root, .. } | Self::Local { root } => {
                self.prepare(repo_id).await?;
                let path = Self::repo_dir(root, repo_id).join(file);
                if !path.is_file() {
                    bail!("{file} is missing from the local copy of {repo_id} ({})", path.display());
                }
                Ok(path)
            }
        }
    }

    /// Relative names of every file in `repo_id`, `/`-separated.
    pub async fn list(&self, repo_id: &str) -> Result<Vec<String>> {
        match self {
            Self::Hub(api) => {
                let info = api
                    .model(repo_id.to_string())
                    .info()
                    .await
                    .with_context(|| format!("failed to list {repo_id}"))?;
                Ok(info.siblings.into_iter().map(|s| s.rfilename).collect())
            }
            Self::Bucket { root, .. } | Self::Local { root } => {
                self.prepare(repo_id).await?;
                let dir = Self::repo_dir(root, repo_id);
                if !dir.is_dir() {
                    bail!("{} does not exist", dir.display());
                }
                let mut files = Vec::new();
                for entry in walkdir::WalkDir::new(&dir) {
                    let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
                    if !entry.file_type().is_file() {
                        continue;
                    }
                    let relative = entry.path().strip_prefix(&dir)?;
                    let parts: Vec<_> = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect();
                    files.push(parts.join("/"));
                }
                files.sort();
                Ok(files)
            }
        }
    }
}

/// Translates an `fnmatch` pattern to an anchored regex. `*` also matches `/`.
fn glob_to_regex(pattern: &str) -> String {
    let pattern = if pattern.ends_with('/') {
        format!("{pattern}*")
    } else {
        pattern.to_string()
    };
    let mut out = String::from("^");
    for c in pattern.chars() {
        match c {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(c.encode_utf8(&mut [0; 4]))),
        }
    }
    out.push('$');
    out
}

/// Allow/ignore filters over repo file names.
#[derive(Debug, Clone)]
pub struct FilePatterns {
    allow: Vec<Regex>,
    ignore: Vec<Regex>,
}

impl FilePatterns {
    pub fn new(allow: &[&str], ignore: &[&str]) -> Result<Self> {
        let compile = |patterns: &[&str]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| Regex::new(&glob_to_regex(p)).with_context(|| format!("bad pattern {p}")))
                .collect()
        };
        Ok(Self {
            allow: compile(allow)?,
            ignore: compile(ignore)?,
        })
    }

    /// Half-precision pipeline weights plus configs and tokenizer files.
    pub fn fp16_pipeline() -> Result<Self> {
        Self::new(
            &["*.json", "*.txt", "**/*.fp16.safetensors", "tokenizer/*"],
            &[
                "*.onnx*",
                "*openvino*",
                "*.bin",
                "*.msgpack",
                "*.h5",
                "*.ckpt",
                "**/diffusion_pytorch_model.safetensors",
                "**/model.safetensors",
            ],
        )
    }

    pub fn full_pipeline() -> Result<Self> {
        Self::new(
            &["*.json", "*.txt", "**/*.safetensors", "tokenizer/*"],
            &[
                "*.fp16.safetensors",
                "*.onnx*",
                "*openvino*",
                "*.bin",
                "*.msgpack",
                "*.h5",
                "*.ckpt",
            ],
        )
    }

    pub fn lora() -> Result<Self> {
        Self::new(&["*.json", "*.txt", "*.safetensors"], &["*.bin", "*.onnx*"])
    }

    pub fn tokenizer() -> Result<Self> {
        Self::new(&["tokenizer.json"], &[])
    }

    pub fn matches(&self, name: &str) -> bool {
        let allowed = self.allow.is_empty() || self.allow.iter().any(|r| r.is_match(name));
        allowed && !self.ignore.iter().any(|r| r.is_match(name))
    }
}

/// Downloads the files of `repo_id` selected by `patterns` into `<dest>/<repo_id>`.
pub async fn snapshot(
    api: &Api,
    repo_id: &str,
    dest: &Path,
    patterns: &FilePatterns,
) -> Result<Vec<PathBuf>> {
    let repo = api.model(repo_id.to_string());
    let info = repo
        .info()
        .await
        .with_context(|| format!("failed to list {repo_id}"))?;
    let target_dir = dest.join(repo_id);

    let mut written = Vec::new();
    for name in info.siblings.iter().map(|s| s.rfilename.as_str()) {
        if !patterns.matches(name) {
            tracing::debug!(repo_id, name, "skipping");
            continue;
        }
        let target = target_dir.join(name);
        if target.exists() {
            tracing::debug!(repo_id, name, "already present");
            continue;
        }
        let cached = repo
            .get(name)
            .await
            .with_context(|| format!("failed to download {name} from {repo_id}"))?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        tokio::fs::copy(&cached, &target)
            .await
            .with_context(|| format!("failed to copy {name} to {}", target.display()))?;
        tracing::info!(repo_id, name, "downloaded");
        written.push(target);
    }
    Ok(written)
}

/// Picks the adapter weights out of a LoRA repo listing.
pub fn find_lora_weights(files: &[String]) -> Result<String> {
    if let Some(name) = files.iter().find(|f| *f == "pytorch_lora_weights.safetensors") {
        return Ok(name.clone());
    }
    let candidates: Vec<&String> = files.iter().filter(|f| f.ends_with(".safetensors")).collect();
    match candidates.as_slice() {
        [single] => Ok((*single).clone()),
        [] => bail!("no .safetensors lora weights found"),
        many => bail!("ambiguous lora weights: {many:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("stipple-assets-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn star_crosses_directories() -> Result<()> {
        let patterns = FilePatterns::new(&["*.json"], &[])?;
        assert!(patterns.matches("model_index.json"));
        assert!(patterns.matches("unet/config.json"));
        assert!(!patterns.matches("unet/config.json.lock"));
        Ok(())
    }

    #[test]
    fn fp16_preset_selects_variant_files() -> Result<()> {
        let patterns = FilePatterns::fp16_pipeline()?;
        for name in [
            "model_index.json",
            "unet/diffusion_pytorch_model.fp16.safetensors",
            "text_encoder_2/model.fp16.safetensors",
            "tokenizer/merges.txt",
            "tokenizer/vocab.json",
        ] {
            assert!(patterns.matches(name), "{name} should be selected");
        }
        for name in [
            "unet/diffusion_pytorch_model.safetensors",
            "text_encoder/model.safetensors",
            "unet/diffusion_pytorch_model.fp16.bin",
            "text_encoder/model.onnx",
            "unet/openvino_model.xml",
            "sd_xl_base_1.0.safetensors",
        ] {
            assert!(!patterns.matches(name), "{name} should be skipped");
        }
        Ok(())
    }

    #[test]
    fn full_preset_skips_variant_files() -> Result<()> {
        let patterns = FilePatterns::full_pipeline()?;
        assert!(patterns.matches("unet/diffusion_pytorch_model.safetensors"));
        assert!(!patterns.matches("unet/diffusion_pytorch_model.fp16.safetensors"));
        assert!(!patterns.matches("vae/diffusion_pytorch_model.bin"));
        Ok(())
    }

    #[test]
    fn lora_and_tokenizer_presets() -> Result<()> {
        let lora = FilePatterns::lora()?;
        assert!(lora.matches("pytorch_lora_weights.safetensors"));
        assert!(!lora.matches("pytorch_lora_weights.bin"));
        let tokenizer = FilePatterns::tokenizer()?;
        assert!(tokenizer.matches("tokenizer.json"));
        assert!(!tokenizer.matches("vocab.json"));
        Ok(())
    }

    #[test]
    fn question_mark_and_trailing_slash() -> Result<()> {
        let patterns = FilePatterns::new(&["unet/", "model.?.bin"], &[])?;
        assert!(patterns.matches("unet/config.json"));
        assert!(patterns.matches("model.1.bin"));
        assert!(!patterns.matches("model.12.bin"));
        Ok(())
    }

    #[test]
    fn lora_weight_selection() -> Result<()> {
        let files = |names: &[&str]| names.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(
            find_lora_weights(&files(&["README.md", "pytorch_lora_weights.safetensors", "other.safetensors"]))?,
            "pytorch_lora_weights.safetensors"
        );
        assert_eq!(find_lora_weights(&files(&["a.json", "lcm.safetensors"]))?, "lcm.safetensors");
        assert!(find_lora_weights(&files(&["a.safetensors", "b.safetensors"])).is_err());
        assert!(find_lora_weights(&files(&["pytorch_lora_weights.bin"])).is_err());
        Ok(())
    }

    #[tokio::test]
    async fn local_store_lists_and_resolves() -> Result<()> {
        let root = scratch("local");
        let repo = root.join("acme/tiny-model");
        std::fs::create_dir_all(repo.join("unet"))?;
        std::fs::write(repo.join("model_index.json"), "{}")?;
        std::fs::write(repo.join("unet/config.json"), "{}")?;

        let store = AssetStore::Local { root: root.clone() };
        assert_eq!(
            store.list("acme/tiny-model").await?,
            ["model_index.json", "unet/config.json"]
        );
        assert_eq!(
            store.get("acme/tiny-model", "unet/config.json").await?,
            repo.join("unet/config.json")
        );
        assert!(store.get("acme/tiny-model", "vae/config.json").await.is_err());
        assert!(store.list("acme/missing").await.is_err());

        std::fs::remove_dir_all(&root)?;
        Ok(())
    }

    #[tokio::test]
    async fn bucket_store_skips_copy_when_cached() -> Result<()> {
        let root = scratch("bucket");
        let repo = root.join("acme/tiny-lora");
        std::fs::create_dir_all(&repo)?;
        std::fs::write(repo.join("pytorch_lora_weights.safetensors"), b"")?;

        let store = AssetStore::Bucket {
            bucket: "gs://stipple-does-not-exist".to_string(),
            root: root.clone(),
        };
        let path = store
            .get("acme/tiny-lora", "pytorch_lora_weights.safetensors")
            .await?;
        assert!(path.is_file());

        std::fs::remove_dir_all(&root)?;
        Ok(())
    }

    #[tokio::test]
    async fn bucket_store_fails_when_copy_fails() {
        let root = scratch("bucket-missing");
        let store = AssetStore::Bucket {
            bucket: "gs://stipple-does-not-exist".to_string(),
            root: root.clone(),
        };
        assert!(store.prepare("acme/absent").await.is_err());
        let _ = std::fs::remove_dir_all(&root);
    }
}
