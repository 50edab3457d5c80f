use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;
use stipple_core::assets::{hub_api, snapshot, FilePatterns};
use stipple_core::{LcmLora, ModelType, SDXL_BASE};

/// Options of the `fetch` subcommand.
#[derive(Args, Debug)]
pub struct FetchArgs {
    /// Pipeline repo to download
    #[arg(long, env = "MODEL_ID", default_value = SDXL_BASE)]
    pub model: String,

    /// LCM LoRA repo, `default` for the family's adapter or `none`
    #[arg(long, env = "LCM_LORA_ID", default_value = "default")]
    pub lcm_lora: LcmLora,

    /// Download full precision weights instead of the fp16 variant
    #[arg(long)]
    pub full: bool,

    /// Directory the repos are written to, one subdirectory per repo id
    #[arg(long, default_value = "./models")]
    pub out: PathBuf,

    /// Bucket named in the upload hint
    #[arg(long, env = "GCS_BUCKET", default_value = crate::DEFAULT_BUCKET)]
    pub gcs_bucket: String,

    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    pub hf_token: Option<String>,
}

pub async fn run(args: FetchArgs) -> Result<()> {
    let api = hub_api(args.hf_token.clone())?;

    let patterns = if args.full {
        FilePatterns::full_pipeline()?
    } else {
        FilePatterns::fp16_pipeline()?
    };
    tracing::info!(model = %args.model, full = args.full, "downloading pipeline");
    let written = snapshot(&api, &args.model, &args.out, &patterns).await?;
    tracing::info!(model = %args.model, files = written.len(), "pipeline downloaded");

    let model_type = match ModelType::from_name(&args.model) {
        Some(model_type) => model_type,
        None => {
            let index = args.out.join(&args.model).join("model_index.json");
            let contents = tokio::fs::read_to_string(&index)
                .await
                .with_context(|| format!("failed to read {}", index.display()))?;
            ModelType::from_model_index(&contents)?
        }
    };

    let lora = match &args.lcm_lora {
        LcmLora::Default => model_type.default_lcm_lora().map(str::to_string),
        LcmLora::Disabled => None,
        LcmLora::Repo(id) => Some(id.clone()),
    };
    if let Some(lora) = lora {
        tracing::info!(%lora, "downloading lcm lora");
        snapshot(&api, &lora, &args.out, &FilePatterns::lora()?).await?;
    }

    let tokenizer = FilePatterns::tokenizer()?;
    for repo in model_type.tokenizer_repos() {
        tracing::info!(repo, "downloading tokenizer");
        snapshot(&api, repo, &args.out, &tokenizer).await?;
    }

    tracing::info!(
        "all models downloaded, upload with: gsutil -m cp -r {}/* {}/models/",
        args.out.display(),
        args.gcs_bucket.trim_end_matches('/')
    );
    Ok(())
}
