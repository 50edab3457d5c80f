use std::sync::{Arc, Mutex};

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    http::header,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use base64::{prelude::BASE64_STANDARD, Engine};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stipple_core::{image_to_png, GenerationRequest, ModelDefaults, ModelLike, SamplerKind, SamplerPlan};

use crate::error::ApiError;

const DIMENSION_RANGE: std::ops::RangeInclusive<usize> = 256..=1536;
const STEPS_RANGE: std::ops::RangeInclusive<usize> = 1..=50;
const GUIDANCE_RANGE: std::ops::RangeInclusive<f64> = 0.0..=15.0;
const DEFAULT_PROMPT: &str = "A beautiful landscape";

/// Shared state: the loaded pipeline and the defaults requests fall back to.
#[derive(Clone)]
pub struct AppState {
    model: Arc<Mutex<Box<dyn ModelLike>>>,
    model_name: Arc<str>,
    defaults: ModelDefaults,
    supports_lcm: bool,
}

impl AppState {
    pub fn new(model: Box<dyn ModelLike>, defaults: ModelDefaults) -> Self {
        Self {
            model_name: model.name().into(),
            supports_lcm: model.supports_lcm(),
            model: Arc::new(Mutex::new(model)),
            defaults,
        }
    }
}

#[derive(Deserialize, Debug, Default)]
pub struct GenerateBody {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub steps: Option<usize>,
    pub guidance: Option<f64>,
    pub seed: Option<u64>,
    #[serde(default)]
    pub use_lcm: bool,
    pub scheduler: Option<String>,
}

#[derive(Serialize, Deserialize, Debug)]
pub struct GenerateResponse {
    pub image_base64: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    pub scheduler: SamplerKind,
    pub seed: Option<u64>,
}

#[derive(Deserialize, Debug, Default)]
pub struct PromptQuery {
    pub prompt: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/generate", get(generate_png).post(generate_json))
        .with_state(state)
}

/// Checks sizes, step count and guidance against the accepted ranges.
pub fn check_parameters(width: usize, height: usize, steps: usize, guidance: f64) -> Result<(), ApiError> {
    for (name, value) in [("width", width), ("height", height)] {
        if !DIMENSION_RANGE.contains(&value) {
            return Err(ApiError::Validation(format!(
                "{name} must be between {} and {}, got {value}",
                DIMENSION_RANGE.start(),
                DIMENSION_RANGE.end()
            )));
        }
        if value % 8 != 0 {
            return Err(ApiError::Validation(format!(
                "{name} must be a multiple of 8, got {value}"
            )));
        }
    }
    if !STEPS_RANGE.contains(&steps) {
        return Err(ApiError::Validation(format!(
            "steps must be between {} and {}, got {steps}",
            STEPS_RANGE.start(),
            STEPS_RANGE.end()
        )));
    }
    if !GUIDANCE_RANGE.contains(&guidance) {
        return Err(ApiError::Validation(format!(
            "guidance must be between {} and {}, got {guidance}",
            GUIDANCE_RANGE.start(),
            GUIDANCE_RANGE.end()
        )));
    }
    Ok(())
}

impl AppState {
    /// Applies defaults, validates, and picks the sampler plan.
    fn resolve(&self, body: GenerateBody) -> Result<GenerationRequest, ApiError> {
        let width = body.width.unwrap_or(self.defaults.width);
        let height = body.height.unwrap_or(self.defaults.height);
        let steps = body.steps.unwrap_or(self.defaults.steps);
        let guidance = body.guidance.unwrap_or(self.defaults.guidance);
        check_parameters(width, height, steps, guidance)?;

        let scheduler = body
            .scheduler
            .as_deref()
            .map(|name| {
                name.parse::<SamplerKind>().map_err(|_| {
                    let known: Vec<String> = SamplerKind::ALL.iter().map(|k| k.to_string()).collect();
                    ApiError::Validation(format!(
                        "unknown scheduler {name:?}, expected one of {}",
                        known.join(", ")
                    ))
                })
            })
            .transpose()?;

        let plan = SamplerPlan::resolve(body.use_lcm, scheduler, steps, guidance);
        if plan.kind == SamplerKind::Lcm && !self.supports_lcm {
            return Err(ApiError::LcmUnavailable(self.model_name.to_string()));
        }

        Ok(GenerationRequest {
            prompt: body.prompt,
            negative_prompt: body.negative_prompt.filter(|n| !n.trim().is_empty()),
            width,
            height,
            steps: plan.steps,
            guidance: plan.guidance,
            seed: body.seed,
            sampler: plan.kind,
        })
    }

    async fn generate(&self, request: GenerationRequest) -> Result<DynamicImage, ApiError> {
        tracing::info!(
            sampler = %request.sampler,
            steps = request.steps,
            guidance = request.guidance,
            width = request.width,
            height = request.height,
            seed = ?request.seed,
            "generating"
        );
        let model = self.model.clone();
        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| ApiError::Internal("model lock poisoned".to_string()))?;
            model.run(&request).map_err(ApiError::Generation)
        })
        .await
        .map_err(|e| ApiError::Internal(format!("generation task failed: {e}")))?
    }
}

async fn healthz() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn generate_json(
    State(state): State<AppState>,
    payload: Result<Json<GenerateBody>, JsonRejection>,
) -> Result<Json<GenerateResponse>, ApiError> {
    let Json(body) = payload.map_err(|rejection| ApiError::Validation(rejection.body_text()))?;
    let request = state.resolve(body)?;
    let (width, height, steps, guidance, scheduler, seed) = (
        request.width,
        request.height,
        request.steps,
        request.guidance,
        request.sampler,
        request.seed,
    );

    let image = state.generate(request).await?;
    let png = image_to_png(&image).map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    Ok(Json(GenerateResponse {
        image_base64: BASE64_STANDARD.encode(&png),
        width,
        height,
        steps,
        guidance,
        scheduler,
        seed,
    }))
}

async fn generate_png(
    State(state): State<AppState>,
    Query(query): Query<PromptQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let prompt = query
        .prompt
        .unwrap_or_else(|| DEFAULT_PROMPT.to_string())
        .replace('-', " ");
    let request = state.resolve(GenerateBody {
        prompt,
        ..Default::default()
    })?;
    let image = state.generate(request).await?;
    let png = image_to_png(&image).map_err(|e| ApiError::Internal(format!("{e:#}")))?;
    Ok(([(header::CONTENT_TYPE, "image/png")], png))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::{body::to_bytes, http::StatusCode, response::Response};
    use image::GenericImageView;

    use super::*;

    struct StubModel {
        lcm: bool,
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<GenerationRequest>>>,
        fail: bool,
    }

    impl ModelLike for StubModel {
        fn name(&self) -> &str {
            "stub/model"
        }

        fn defaults(&self) -> ModelDefaults {
            DEFAULTS
        }

        fn supports_lcm(&self) -> bool {
            self.lcm
        }

        fn run(&mut self, request: &GenerationRequest) -> anyhow::Result<DynamicImage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("device out of memory");
            }
            if let Ok(mut seen) = self.seen.lock() {
                seen.push(request.clone());
            }
            Ok(DynamicImage::new_rgb8(request.width as u32, request.height as u32))
        }
    }

    const DEFAULTS: ModelDefaults = ModelDefaults {
        width: 512,
        height: 256,
        steps: 20,
        guidance: 6.0,
    };

    struct Harness {
        state: AppState,
        calls: Arc<AtomicUsize>,
        seen: Arc<Mutex<Vec<GenerationRequest>>>,
    }

    fn harness(lcm: bool, fail: bool) -> Harness {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let model = StubModel {
            lcm,
            calls: calls.clone(),
            seen: seen.clone(),
            fail,
        };
        Harness {
            state: AppState::new(Box::new(model), DEFAULTS),
            calls,
            seen,
        }
    }

    fn body(prompt: &str) -> GenerateBody {
        GenerateBody {
            prompt: prompt.to_string(),
            ..Default::default()
        }
    }

    async fn post(state: &AppState, body: GenerateBody) -> Response {
        generate_json(State(state.clone()), Ok(Json(body)))
            .await
            .into_response()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn healthz_reports_ok() {
        let Json(value) = healthz().await;
        assert_eq!(value, json!({ "status": "ok" }));
    }

    #[tokio::test]
    async fn post_uses_service_defaults() {
        let h = harness(false, false);
        let response = post(&h.state, body("a lighthouse")).await;
        assert_eq!(response.status(), StatusCode::OK);

        let value = json_body(response).await;
        assert_eq!(value["width"], 512);
        assert_eq!(value["height"], 256);
        assert_eq!(value["steps"], 20);
        assert_eq!(value["guidance"], 6.0);
        assert_eq!(value["scheduler"], "dpmpp2m");
        assert_eq!(value["seed"], Value::Null);

        let png = BASE64_STANDARD
            .decode(value["image_base64"].as_str().unwrap())
            .unwrap();
        let image = image::load_from_memory(&png).unwrap();
        assert_eq!(image.dimensions(), (512, 256));
    }

    #[tokio::test]
    async fn lcm_flag_caps_steps_and_guidance() {
        let h = harness(true, false);
        let mut request = body("a fox");
        request.use_lcm = true;
        request.steps = Some(30);
        request.guidance = Some(7.0);
        request.seed = Some(42);
        let value = json_body(post(&h.state, request).await).await;
        assert_eq!(value["steps"], 8);
        assert_eq!(value["guidance"], 1.0);
        assert_eq!(value["scheduler"], "lcm");
        assert_eq!(value["seed"], 42);

        let seen = h.seen.lock().unwrap();
        assert_eq!(seen[0].sampler, SamplerKind::Lcm);
        assert_eq!(seen[0].steps, 8);
        assert_eq!(seen[0].seed, Some(42));
    }

    #[tokio::test]
    async fn explicit_scheduler_is_honoured() {
        let h = harness(false, false);
        let mut request = body("a fox");
        request.scheduler = Some("Euler_A".to_string());
        request.negative_prompt = Some("  ".to_string());
        let value = json_body(post(&h.state, request).await).await;
        assert_eq!(value["scheduler"], "euler_a");
        let seen = h.seen.lock().unwrap();
        assert_eq!(seen[0].sampler, SamplerKind::EulerAncestral);
        assert_eq!(seen[0].negative_prompt, None);
    }

    #[tokio::test]
    async fn lcm_without_lora_is_rejected() {
        let h = harness(false, false);
        let mut request = body("a fox");
        request.scheduler = Some("lcm".to_string());
        let response = post(&h.state, request).await;
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let value = json_body(response).await;
        assert!(value["detail"].as_str().unwrap().contains("stub/model"));
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn invalid_parameters_never_reach_the_model() {
        let h = harness(true, false);
        let cases: Vec<GenerateBody> = vec![
            GenerateBody { width: Some(250), ..body("x") },
            GenerateBody { height: Some(2048), ..body("x") },
            GenerateBody { width: Some(260), ..body("x") },
            GenerateBody { steps: Some(0), ..body("x") },
            GenerateBody { steps: Some(51), ..body("x") },
            GenerateBody { guidance: Some(15.5), ..body("x") },
            GenerateBody { scheduler: Some("ddim".to_string()), ..body("x") },
        ];
        for case in cases {
            let response = post(&h.state, case).await;
            assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
            let value = json_body(response).await;
            assert!(value["detail"].is_string());
        }
        assert_eq!(h.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_prompt_is_generated() {
        let h = harness(false, false);
        let response = post(&h.state, body("")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.seen.lock().unwrap()[0].prompt, "");
    }

    #[tokio::test]
    async fn unknown_scheduler_lists_choices() {
        let h = harness(false, false);
        let value = json_body(
            post(&h.state, GenerateBody { scheduler: Some("pndm".to_string()), ..body("x") }).await,
        )
        .await;
        assert_eq!(
            value["detail"],
            "unknown scheduler \"pndm\", expected one of dpmpp2m, euler_a, lcm"
        );
    }

    #[tokio::test]
    async fn generation_failure_is_500() {
        let h = harness(false, true);
        let response = post(&h.state, body("a fox")).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let value = json_body(response).await;
        assert_eq!(value["detail"], "generation failed: device out of memory");
        assert_eq!(h.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn get_returns_png_with_dashes_replaced() {
        let h = harness(false, false);
        let response = generate_png(
            State(h.state.clone()),
            Query(PromptQuery {
                prompt: Some("red-barn-at-dusk".to_string()),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "image/png");
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(image::load_from_memory(&bytes).unwrap().dimensions(), (512, 256));

        let seen = h.seen.lock().unwrap();
        assert_eq!(seen[0].prompt, "red barn at dusk");
        assert_eq!(seen[0].sampler, SamplerKind::DpmSolverPlusPlus2M);
        assert_eq!(seen[0].steps, 20);
    }

    #[tokio::test]
    async fn get_without_prompt_uses_default() {
        let h = harness(false, false);
        let response = generate_png(State(h.state.clone()), Query(PromptQuery::default()))
            .await
            .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.seen.lock().unwrap()[0].prompt, DEFAULT_PROMPT);
    }

    #[tokio::test]
    async fn get_with_empty_prompt_keeps_it_empty() {
        let h = harness(false, false);
        let response = generate_png(
            State(h.state.clone()),
            Query(PromptQuery {
                prompt: Some(String::new()),
            }),
        )
        .await
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(h.seen.lock().unwrap()[0].prompt, "");
    }

    #[test]
    fn parameter_bounds_are_inclusive() {
        assert!(check_parameters(256, 1536, 1, 0.0).is_ok());
        assert!(check_parameters(1536, 256, 50, 15.0).is_ok());
        assert!(check_parameters(1544, 256, 50, 15.0).is_err());
    }
}
