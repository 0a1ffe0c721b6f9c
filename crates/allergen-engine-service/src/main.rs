//! Local HTTP front end for the allergen flag engine.
//!
//! Wraps the api facade in a small axum service. Every success response
//! carries the service and api contract versions alongside the payload so
//! clients can detect drift without a separate version endpoint.

use std::net::SocketAddr;
use std::path::PathBuf;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};

use allergen_engine_api::{FlagEngineApi, SuggestionInputs, API_CONTRACT_VERSION};
use allergen_engine_core::{CategoryId, EngineError, FlagId, IngredientId};

const SERVICE_CONTRACT_VERSION: &str = "allergen-engine-service/v1";

#[derive(Parser, Debug)]
#[command(name = "afe-service", about = "Allergen flag engine HTTP service", version)]
struct Args {
    /// Path to the engine database.
    #[arg(long, default_value = "allergen.db")]
    db: PathBuf,
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:8787")]
    bind: SocketAddr,
}

#[derive(Clone)]
struct AppState {
    api: FlagEngineApi,
}

#[derive(Debug, Deserialize)]
struct ToggleFlagRequest {
    flag_id: i64,
}

#[derive(Debug, Deserialize)]
struct ToggleNoneRequest {
    category_id: i64,
}

#[derive(Debug, Deserialize, Default)]
struct SuggestionsRequest {
    name_text: Option<String>,
    product_text: Option<String>,
    line_item_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DismissRequest {
    flag_id: i64,
    dismissed_by: String,
    reason: Option<String>,
    matched_keyword: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct AutoApplyRequest {
    #[serde(default)]
    flag_ids: Vec<i64>,
    #[serde(default)]
    none_category_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct RecipeVerdictsRequest {
    ingredient_ids: Vec<i64>,
}

/// Error payload in the same envelope shape as successes. Conflict
/// rejections map to 409 with the blocking flag named; everything else from
/// the facade is a 400.
struct ApiError {
    status: StatusCode,
    body: Value,
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::Conflict { rejected, blocking }) => Self {
                status: StatusCode::CONFLICT,
                body: json!({
                    "error": "conflict",
                    "rejected": rejected,
                    "blocking": blocking,
                }),
            },
            _ => Self {
                status: StatusCode::BAD_REQUEST,
                body: json!({ "error": format!("{err:#}") }),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(envelope(self.body))).into_response()
    }
}

fn envelope(data: Value) -> Value {
    json!({
        "service_contract_version": SERVICE_CONTRACT_VERSION,
        "api_contract_version": API_CONTRACT_VERSION,
        "data": data,
    })
}

fn ok(data: Value) -> Json<Value> {
    Json(envelope(data))
}

type ApiResult = Result<Json<Value>, ApiError>;

async fn health() -> Json<Value> {
    ok(json!({ "status": "ok" }))
}

async fn get_taxonomy(State(state): State<AppState>) -> ApiResult {
    let taxonomy = state.api.taxonomy()?;
    Ok(ok(serde_json::to_value(taxonomy).map_err(anyhow::Error::from)?))
}

async fn get_ingredient(State(state): State<AppState>, Path(id): Path<i64>) -> ApiResult {
    let view = state.api.ingredient(IngredientId(id))?;
    Ok(ok(serde_json::to_value(view).map_err(anyhow::Error::from)?))
}

async fn toggle_flag(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<ToggleFlagRequest>,
) -> ApiResult {
    let report = state.api.toggle_flag(IngredientId(id), FlagId(request.flag_id))?;
    Ok(ok(serde_json::to_value(report).map_err(anyhow::Error::from)?))
}

async fn toggle_none(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<ToggleNoneRequest>,
) -> ApiResult {
    let report = state.api.toggle_none(IngredientId(id), CategoryId(request.category_id))?;
    Ok(ok(serde_json::to_value(report).map_err(anyhow::Error::from)?))
}

async fn suggestions(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<SuggestionsRequest>,
) -> ApiResult {
    let inputs = SuggestionInputs {
        name_text: request.name_text,
        product_text: request.product_text,
        line_item_text: request.line_item_text,
    };
    let pending = state.api.suggestions(IngredientId(id), &inputs)?;
    Ok(ok(json!({ "pending": pending })))
}

async fn dismiss(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<DismissRequest>,
) -> ApiResult {
    let dismissal_id = state.api.dismiss(
        IngredientId(id),
        FlagId(request.flag_id),
        &request.dismissed_by,
        request.reason,
        request.matched_keyword,
    )?;
    Ok(ok(json!({
        "dismissed": dismissal_id.is_some(),
        "dismissal_id": dismissal_id,
    })))
}

async fn undo_dismissal(
    State(state): State<AppState>,
    Path((id, flag_id)): Path<(i64, i64)>,
) -> ApiResult {
    let removed = state.api.undo_dismissal(IngredientId(id), FlagId(flag_id))?;
    Ok(ok(json!({ "removed": removed })))
}

async fn auto_apply(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(request): Json<AutoApplyRequest>,
) -> ApiResult {
    let flag_ids: Vec<FlagId> = request.flag_ids.into_iter().map(FlagId).collect();
    let none_ids: Vec<CategoryId> =
        request.none_category_ids.into_iter().map(CategoryId).collect();
    let report = state.api.auto_apply(IngredientId(id), &flag_ids, &none_ids)?;
    Ok(ok(serde_json::to_value(report).map_err(anyhow::Error::from)?))
}

async fn recipe_verdicts(
    State(state): State<AppState>,
    Json(request): Json<RecipeVerdictsRequest>,
) -> ApiResult {
    let ingredient_ids: Vec<IngredientId> =
        request.ingredient_ids.into_iter().map(IngredientId).collect();
    let verdicts = state.api.recipe_verdicts(&ingredient_ids)?;
    Ok(ok(json!({ "verdicts": verdicts })))
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/health", get(health))
        .route("/v1/taxonomy", get(get_taxonomy))
        .route("/v1/ingredients/:id/flags", get(get_ingredient))
        .route("/v1/ingredients/:id/flags/toggle", post(toggle_flag))
        .route("/v1/ingredients/:id/none/toggle", post(toggle_none))
        .route("/v1/ingredients/:id/suggestions", post(suggestions))
        .route("/v1/ingredients/:id/dismissals", post(dismiss))
        .route(
            "/v1/ingredients/:id/dismissals/:flag_id",
            axum::routing::delete(undo_dismissal),
        )
        .route("/v1/ingredients/:id/auto-apply", post(auto_apply))
        .route("/v1/recipes/verdicts", post(recipe_verdicts))
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let api = FlagEngineApi::new(&args.db);
    api.migrate()?;
    let app = build_router(AppState { api });

    tracing::info!(bind = %args.bind, db = %args.db.display(), "allergen engine service listening");
    let listener = tokio::net::TcpListener::bind(args.bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
