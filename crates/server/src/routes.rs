use std::sync::Arc;

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        Path, Query, State,
    },
    http::{header, HeaderValue, Method, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{de::DeserializeOwned, Deserialize};
use shared::{
    domain::{
        Account, AccountId, Kanban, KanbanChain, KanbanChainId, KanbanHistory, KanbanId, Product,
        ProductCode, Status, StatusChain, StatusChainEntry, StatusChainId, StatusId,
    },
    error::{ApiError, ErrorCode},
    protocol::{
        AccountInput, CreateKanbanChainRequest, Dashboard, KanbanChainFieldMask,
        KanbanChainSummary, KanbanChainWithKanbans, KanbanFieldMask, NewStatusChain,
        ProductInput, RenameStatusChain, StatusChainDetail, StatusChainEntryInput, StatusInput,
        TopUpRequest,
    },
};
use tower_http::{cors::CorsLayer, limit::RequestBodyLimitLayer};
use tracing::warn;

use crate::app_state::AppState;

const MAX_BODY_BYTES: usize = 1024 * 1024;

type HttpError = (StatusCode, Json<ApiError>);
type HttpResult<T> = Result<Json<T>, HttpError>;
type Created<T> = Result<(StatusCode, Json<T>), HttpError>;

#[derive(Debug, Deserialize)]
pub(crate) struct ProductRename {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct KanbanListQuery {
    kanban_chain_id: Option<i64>,
    #[serde(default)]
    include_inactive: bool,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ChainKanbansQuery {
    #[serde(default)]
    include_inactive: bool,
}

pub(crate) fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/accounts", get(list_accounts).post(create_account))
        .route(
            "/api/accounts/:id",
            get(get_account).put(update_account).delete(delete_account),
        )
        .route("/api/products", get(list_products).post(create_product))
        .route(
            "/api/products/:code",
            get(get_product).put(rename_product).delete(delete_product),
        )
        .route("/api/statuses", get(list_statuses).post(create_status))
        .route(
            "/api/statuses/:id",
            get(get_status).put(update_status).delete(delete_status),
        )
        .route(
            "/api/status-chains",
            get(list_status_chains).post(create_status_chain),
        )
        .route(
            "/api/status-chains/:id",
            get(get_status_chain)
                .put(rename_status_chain)
                .delete(delete_status_chain),
        )
        .route(
            "/api/status-chains/:id/statuses",
            get(list_status_chain_entries)
                .post(attach_status_chain_entries)
                .put(update_status_chain_entries),
        )
        .route(
            "/api/kanban-chains",
            get(list_kanban_chains).post(create_kanban_chain),
        )
        .route(
            "/api/kanban-chains/:id",
            get(get_kanban_chain)
                .patch(update_kanban_chain)
                .delete(delete_kanban_chain),
        )
        .route(
            "/api/kanban-chains/:id/kanbans",
            get(list_chain_kanbans).post(top_up_kanban_chain),
        )
        .route("/api/kanbans", get(list_kanbans))
        .route(
            "/api/kanbans/:id",
            get(get_kanban)
                .patch(update_kanban_fields)
                .delete(deactivate_kanban),
        )
        .route("/api/kanbans/:id/advance", post(advance_kanban))
        .route("/api/kanbans/:id/history", get(kanban_history))
        .route("/api/dashboards/customer/:id", get(customer_dashboard))
        .route("/api/dashboards/supplier/:id", get(supplier_dashboard))
        .layer(RequestBodyLimitLayer::new(MAX_BODY_BYTES))
        .with_state(state)
}

pub(crate) fn cors_layer(allowed_origin: &str) -> anyhow::Result<CorsLayer> {
    let origin: HeaderValue = allowed_origin.parse()?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, HttpError> {
    state.api.storage.health_check().await.map_err(|error| {
        warn!(%error, "health check failed");
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiError::new(ErrorCode::StoreFailure, error.to_string())),
        )
    })?;
    Ok("ok")
}

async fn list_accounts(State(state): State<Arc<AppState>>) -> HttpResult<Vec<Account>> {
    kanban_api::list_accounts(&state.api)
        .await
        .map(Json)
        .map_err(reject)
}

async fn create_account(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<AccountInput>, JsonRejection>,
) -> Created<Account> {
    let input = decode(payload)?;
    let account = kanban_api::create_account(&state.api, &input)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(account)))
}

async fn get_account(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> HttpResult<Account> {
    let id = path_param(path)?;
    kanban_api::get_account(&state.api, AccountId(id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn update_account(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<AccountInput>, JsonRejection>,
) -> HttpResult<Account> {
    let id = path_param(path)?;
    let input = decode(payload)?;
    kanban_api::update_account(&state.api, AccountId(id), &input)
        .await
        .map(Json)
        .map_err(reject)
}

async fn delete_account(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<StatusCode, HttpError> {
    let id = path_param(path)?;
    kanban_api::delete_account(&state.api, AccountId(id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_products(State(state): State<Arc<AppState>>) -> HttpResult<Vec<Product>> {
    kanban_api::list_products(&state.api)
        .await
        .map(Json)
        .map_err(reject)
}

async fn create_product(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ProductInput>, JsonRejection>,
) -> Created<Product> {
    let input = decode(payload)?;
    let product = kanban_api::create_product(&state.api, &input)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(product)))
}

async fn get_product(
    State(state): State<Arc<AppState>>,
    path: Result<Path<String>, PathRejection>,
) -> HttpResult<Product> {
    let code = path_param(path)?;
    kanban_api::get_product(&state.api, &ProductCode(code))
        .await
        .map(Json)
        .map_err(reject)
}

async fn rename_product(
    State(state): State<Arc<AppState>>,
    path: Result<Path<String>, PathRejection>,
    payload: Result<Json<ProductRename>, JsonRejection>,
) -> HttpResult<Product> {
    let code = path_param(path)?;
    let rename = decode(payload)?;
    kanban_api::rename_product(&state.api, &ProductCode(code), &rename.name)
        .await
        .map(Json)
        .map_err(reject)
}

async fn delete_product(
    State(state): State<Arc<AppState>>,
    path: Result<Path<String>, PathRejection>,
) -> Result<StatusCode, HttpError> {
    let code = path_param(path)?;
    kanban_api::delete_product(&state.api, &ProductCode(code))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_statuses(State(state): State<Arc<AppState>>) -> HttpResult<Vec<Status>> {
    kanban_api::list_statuses(&state.api)
        .await
        .map(Json)
        .map_err(reject)
}

async fn create_status(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<StatusInput>, JsonRejection>,
) -> Created<Status> {
    let input = decode(payload)?;
    let status = kanban_api::create_status(&state.api, &input)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(status)))
}

async fn get_status(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> HttpResult<Status> {
    let id = path_param(path)?;
    kanban_api::get_status(&state.api, StatusId(id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<StatusInput>, JsonRejection>,
) -> HttpResult<Status> {
    let id = path_param(path)?;
    let input = decode(payload)?;
    kanban_api::update_status(&state.api, StatusId(id), &input)
        .await
        .map(Json)
        .map_err(reject)
}

async fn delete_status(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<StatusCode, HttpError> {
    let id = path_param(path)?;
    kanban_api::delete_status(&state.api, StatusId(id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_status_chains(State(state): State<Arc<AppState>>) -> HttpResult<Vec<StatusChain>> {
    kanban_api::list_status_chains(&state.api)
        .await
        .map(Json)
        .map_err(reject)
}

async fn create_status_chain(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<NewStatusChain>, JsonRejection>,
) -> Created<StatusChainDetail> {
    let input = decode(payload)?;
    let detail = kanban_api::create_status_chain(&state.api, &input)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(detail)))
}

async fn get_status_chain(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> HttpResult<StatusChainDetail> {
    let id = path_param(path)?;
    kanban_api::get_status_chain(&state.api, StatusChainId(id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn rename_status_chain(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<RenameStatusChain>, JsonRejection>,
) -> HttpResult<StatusChain> {
    let id = path_param(path)?;
    let rename = decode(payload)?;
    kanban_api::rename_status_chain(&state.api, StatusChainId(id), &rename.name)
        .await
        .map(Json)
        .map_err(reject)
}

async fn delete_status_chain(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<StatusCode, HttpError> {
    let id = path_param(path)?;
    kanban_api::delete_status_chain(&state.api, StatusChainId(id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_status_chain_entries(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> HttpResult<Vec<StatusChainEntry>> {
    let id = path_param(path)?;
    kanban_api::list_status_chain_entries(&state.api, StatusChainId(id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn attach_status_chain_entries(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<Vec<StatusChainEntryInput>>, JsonRejection>,
) -> Created<Vec<StatusChainEntry>> {
    let id = path_param(path)?;
    let entries = decode(payload)?;
    let ordered = kanban_api::attach_status_chain_entries(&state.api, StatusChainId(id), &entries)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(ordered)))
}

async fn update_status_chain_entries(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<Vec<StatusChainEntryInput>>, JsonRejection>,
) -> HttpResult<Vec<StatusChainEntry>> {
    let id = path_param(path)?;
    let entries = decode(payload)?;
    kanban_api::update_status_chain_entries(&state.api, StatusChainId(id), &entries)
        .await
        .map(Json)
        .map_err(reject)
}

async fn list_kanban_chains(
    State(state): State<Arc<AppState>>,
) -> HttpResult<Vec<KanbanChainSummary>> {
    kanban_api::list_kanban_chains(&state.api)
        .await
        .map(Json)
        .map_err(reject)
}

async fn create_kanban_chain(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreateKanbanChainRequest>, JsonRejection>,
) -> Created<KanbanChainWithKanbans> {
    let request = decode(payload)?;
    let created =
        kanban_api::create_kanban_chain(&state.api, &request.kanban_chain, request.initial_kanbans)
            .await
            .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn get_kanban_chain(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> HttpResult<KanbanChain> {
    let id = path_param(path)?;
    kanban_api::get_kanban_chain(&state.api, KanbanChainId(id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn update_kanban_chain(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<KanbanChainFieldMask>, JsonRejection>,
) -> HttpResult<KanbanChain> {
    let id = path_param(path)?;
    let mask = decode(payload)?;
    kanban_api::update_kanban_chain(&state.api, KanbanChainId(id), &mask)
        .await
        .map(Json)
        .map_err(reject)
}

async fn delete_kanban_chain(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> Result<StatusCode, HttpError> {
    let id = path_param(path)?;
    kanban_api::delete_kanban_chain(&state.api, KanbanChainId(id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_chain_kanbans(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
    Query(q): Query<ChainKanbansQuery>,
) -> HttpResult<Vec<Kanban>> {
    let id = path_param(path)?;
    kanban_api::list_kanbans(&state.api, Some(KanbanChainId(id)), q.include_inactive)
        .await
        .map(Json)
        .map_err(reject)
}

async fn top_up_kanban_chain(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<TopUpRequest>, JsonRejection>,
) -> Created<Vec<Kanban>> {
    let id = path_param(path)?;
    let request = decode(payload)?;
    let added = kanban_api::add_kanbans_to_chain(&state.api, KanbanChainId(id), request.count)
        .await
        .map_err(reject)?;
    Ok((StatusCode::CREATED, Json(added)))
}

async fn list_kanbans(
    State(state): State<Arc<AppState>>,
    Query(q): Query<KanbanListQuery>,
) -> HttpResult<Vec<Kanban>> {
    kanban_api::list_kanbans(
        &state.api,
        q.kanban_chain_id.map(KanbanChainId),
        q.include_inactive,
    )
    .await
    .map(Json)
    .map_err(reject)
}

async fn get_kanban(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> HttpResult<Kanban> {
    let id = path_param(path)?;
    kanban_api::get_kanban(&state.api, KanbanId(id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn update_kanban_fields(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
    payload: Result<Json<KanbanFieldMask>, JsonRejection>,
) -> HttpResult<Kanban> {
    let id = path_param(path)?;
    let mask = decode(payload)?;
    kanban_api::update_kanban_fields(&state.api, KanbanId(id), &mask)
        .await
        .map(Json)
        .map_err(reject)
}

async fn deactivate_kanban(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> HttpResult<Kanban> {
    let id = path_param(path)?;
    kanban_api::deactivate_kanban(&state.api, KanbanId(id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn advance_kanban(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> HttpResult<Kanban> {
    let id = path_param(path)?;
    kanban_api::advance_kanban(&state.api, KanbanId(id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn kanban_history(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> HttpResult<Vec<KanbanHistory>> {
    let id = path_param(path)?;
    kanban_api::kanban_history(&state.api, KanbanId(id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn customer_dashboard(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> HttpResult<Dashboard> {
    let id = path_param(path)?;
    kanban_api::customer_dashboard(&state.api, AccountId(id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn supplier_dashboard(
    State(state): State<Arc<AppState>>,
    path: Result<Path<i64>, PathRejection>,
) -> HttpResult<Dashboard> {
    let id = path_param(path)?;
    kanban_api::supplier_dashboard(&state.api, AccountId(id))
        .await
        .map(Json)
        .map_err(reject)
}

/// Malformed bodies, including unknown field-mask keys, are validation errors.
fn decode<T: DeserializeOwned>(payload: Result<Json<T>, JsonRejection>) -> Result<T, HttpError> {
    match payload {
        Ok(Json(value)) => Ok(value),
        Err(rejection) => Err(reject(ApiError::validation(rejection.body_text()))),
    }
}

/// Unparseable path segments, such as a non-numeric id, are validation errors.
fn path_param<T>(path: Result<Path<T>, PathRejection>) -> Result<T, HttpError> {
    match path {
        Ok(Path(value)) => Ok(value),
        Err(rejection) => Err(reject(ApiError::validation(rejection.body_text()))),
    }
}

fn reject(err: ApiError) -> HttpError {
    let status = match err.code {
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Conflict => StatusCode::CONFLICT,
        ErrorCode::InvalidState | ErrorCode::StoreFailure => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

#[cfg(test)]
#[path = "tests/routes_tests.rs"]
mod tests;
