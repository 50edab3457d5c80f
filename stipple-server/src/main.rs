use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use stipple_core::{
    load_model, AssetStore, DeviceMap, LcmLora, LoadOptions, ModelDefaults, ModelSpec,
    WeightVariant, SDXL_BASE,
};
use tokio::net::TcpListener;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

mod api;
mod error;
mod fetch;

const DEFAULT_BUCKET: &str = "gs://ai-labs-474813-models";

#[derive(Parser, Debug)]
#[command(author, version, about = "Stipple image generation server")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Load the pipeline and serve the HTTP API
    Serve(ServeArgs),
    /// Download pipeline, LoRA and tokenizer repos for staging in a bucket
    Fetch(fetch::FetchArgs),
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
enum AssetSource {
    Hub,
    Bucket,
    Local,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Pipeline repo id
    #[arg(long, env = "MODEL_ID", default_value = SDXL_BASE)]
    model: String,

    /// LCM LoRA repo, `default` for the family's adapter or `none`
    #[arg(long, env = "LCM_LORA_ID", default_value = "default")]
    lcm_lora: LcmLora,

    /// Weight files to load; defaults to fp16 for SDXL and full for SD v1
    #[arg(long)]
    variant: Option<WeightVariant>,

    #[arg(long, env = "DEFAULT_STEPS")]
    default_steps: Option<usize>,

    #[arg(long, env = "DEFAULT_WIDTH")]
    default_width: Option<usize>,

    #[arg(long, env = "DEFAULT_HEIGHT")]
    default_height: Option<usize>,

    #[arg(long, env = "DEFAULT_GUIDANCE")]
    default_guidance: Option<f64>,

    /// Where model files come from
    #[arg(long, env = "ASSET_SOURCE", value_enum, default_value_t = AssetSource::Hub)]
    source: AssetSource,

    #[arg(long, env = "GCS_BUCKET", default_value = DEFAULT_BUCKET)]
    gcs_bucket: String,

    /// Local model root for the `bucket` and `local` sources
    #[arg(long, env = "LOCAL_MODEL_DIR", default_value = "/tmp/models")]
    model_dir: PathBuf,

    #[arg(long, env = "HF_TOKEN", hide_env_values = true)]
    hf_token: Option<String>,

    /// Host address to bind the server to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port to bind the server to
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Accelerator ordinal
    #[arg(long, default_value_t = 0)]
    device: usize,

    /// Run in f32 even on an accelerator
    #[arg(long)]
    full_precision: bool,

    /// Attention slice size, trades speed for memory
    #[arg(long)]
    sliced_attention_size: Option<usize>,

    #[arg(long)]
    use_flash_attn: bool,

    /// Fuse and load the LCM UNet at startup
    #[arg(long)]
    preload_lcm: bool,

    /// Cache directory for UNets with a fused LoRA
    #[arg(long, default_value = "/tmp/stipple-fused")]
    fused_dir: PathBuf,
}

impl ServeArgs {
    fn store(&self) -> Result<AssetStore> {
        Ok(match self.source {
            AssetSource::Hub => AssetStore::hub(self.hf_token.clone())?,
            AssetSource::Bucket => AssetStore::Bucket {
                bucket: self.gcs_bucket.clone(),
                root: self.model_dir.clone(),
            },
            AssetSource::Local => AssetStore::Local {
                root: self.model_dir.clone(),
            },
        })
    }

    /// Configured defaults layered over the pipeline's own.
    fn defaults(&self, native: ModelDefaults) -> ModelDefaults {
        ModelDefaults {
            width: self.default_width.unwrap_or(native.width),
            height: self.default_height.unwrap_or(native.height),
            steps: self.default_steps.unwrap_or(native.steps),
            guidance: self.default_guidance.unwrap_or(native.guidance),
        }
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let assets = args.store()?;
    let spec = ModelSpec {
        model_id: args.model.clone(),
        lcm_lora: args.lcm_lora.clone(),
        variant: args.variant,
    };
    let options = LoadOptions {
        device_map: DeviceMap::new(args.cpu, args.device),
        use_f16: !args.full_precision,
        sliced_attention_size: args.sliced_attention_size,
        use_flash_attn: args.use_flash_attn,
        fused_dir: args.fused_dir.clone(),
        preload_lcm: args.preload_lcm,
    };

    let model = load_model(&spec, &assets, &options)
        .await
        .with_context(|| format!("failed to load {}", spec.model_id))?;
    let defaults = args.defaults(model.defaults());
    api::check_parameters(defaults.width, defaults.height, defaults.steps, defaults.guidance)
        .context("invalid default generation parameters")?;
    tracing::info!(
        model = model.name(),
        lcm = model.supports_lcm(),
        ?defaults,
        "model ready"
    );

    // --- Build axum router with shared state ---
    let app = api::router(api::AppState::new(model, defaults));

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    tracing::info!(address = %listener.local_addr()?, "started server");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        return;
    }
    tracing::info!("shutting down");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Fetch(args) => fetch::run(args).await,
    }
}
