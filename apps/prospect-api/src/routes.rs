use axum::{
	Json, Router,
	extract::{Path, Query, Request, State},
	http::{StatusCode, header},
	middleware::{self, Next},
	response::{IntoResponse, Response},
	routing::{delete, get, post, put},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use prospect_domain::session::{self, SessionCookie, SessionCookies};
use prospect_service::{
	AddProxyRequest, CreateJobRequest, Error as ServiceError, ExportFormat, HealthCheckReport,
	HealthStats, JobView, ProxyView,
};
use prospect_storage::credits;

use crate::state::AppState;

const DEFAULT_LIST_LIMIT: u32 = 50;

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/health", get(health))
		.route("/v1/jobs", post(create_job).get(list_jobs))
		.route("/v1/jobs/{job_id}", get(get_job))
		.route("/v1/jobs/{job_id}/pause", post(pause_job))
		.route("/v1/jobs/{job_id}/resume", post(resume_job))
		.route("/v1/jobs/{job_id}/cancel", post(cancel_job))
		.route("/v1/jobs/{job_id}/restart", post(restart_job))
		.route("/v1/jobs/{job_id}/export", get(export_job))
		.route("/v1/accounts/{workspace_id}/{account_id}/health", get(account_health))
		.with_state(state)
}

pub fn admin_router(state: AppState) -> Router {
	Router::new()
		.route("/v1/admin/proxies", get(list_proxies).post(add_proxy))
		.route("/v1/admin/proxies/health_check", post(check_proxies))
		.route("/v1/admin/proxies/{proxy_id}", delete(remove_proxy))
		.route("/v1/admin/proxies/{proxy_id}/disable", post(disable_proxy))
		.route("/v1/admin/proxies/{proxy_id}/enable", post(enable_proxy))
		.route("/v1/admin/allocations/rotate", post(rotate_allocation))
		.route("/v1/admin/allocations/rotate_due", post(rotate_due))
		.route("/v1/admin/sessions/{workspace_id}/{account_id}", put(store_session))
		.route("/v1/admin/credits/{workspace_id}", post(grant_credits))
		.route_layer(middleware::from_fn_with_state(state.clone(), require_admin_token))
		.with_state(state)
}

async fn health() -> StatusCode {
	StatusCode::OK
}

#[derive(Debug, Deserialize)]
struct ListJobsQuery {
	workspace_id: String,
	limit: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ListJobsResponse {
	jobs: Vec<JobView>,
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
	format: Option<String>,
}

#[derive(Debug, Serialize)]
struct ProxiesResponse {
	proxies: Vec<ProxyView>,
}

#[derive(Debug, Deserialize)]
struct RotateRequest {
	proxy_id: Uuid,
	workspace_id: String,
	account_id: String,
}

#[derive(Debug, Serialize)]
struct RotateResponse {
	proxy_id: Uuid,
	allocation_id: Uuid,
	sticky_session_id: String,
	exclusive: bool,
}

#[derive(Debug, Serialize)]
struct RotateDueResponse {
	rotated: u32,
}

#[derive(Debug, Deserialize)]
struct StoreSessionRequest {
	cookies: Vec<SessionCookie>,
	#[serde(default)]
	ip_bound: bool,
}

#[derive(Debug, Deserialize)]
struct GrantCreditsRequest {
	amount: i64,
	note: Option<String>,
}

#[derive(Debug, Serialize)]
struct BalanceResponse {
	workspace_id: String,
	balance: i64,
}

async fn create_job(
	State(state): State<AppState>,
	Json(payload): Json<CreateJobRequest>,
) -> Result<(StatusCode, Json<JobView>), ApiError> {
	let job = state.service.jobs.create_job(payload).await?;

	Ok((StatusCode::CREATED, Json(job)))
}

async fn list_jobs(
	State(state): State<AppState>,
	Query(query): Query<ListJobsQuery>,
) -> Result<Json<ListJobsResponse>, ApiError> {
	let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
	let jobs = state.service.jobs.list(&query.workspace_id, limit).await?;

	Ok(Json(ListJobsResponse { jobs }))
}

async fn get_job(
	State(state): State<AppState>,
	Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
	Ok(Json(state.service.jobs.get(job_id).await?))
}

async fn pause_job(
	State(state): State<AppState>,
	Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
	Ok(Json(state.service.jobs.pause(job_id).await?))
}

async fn resume_job(
	State(state): State<AppState>,
	Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
	Ok(Json(state.service.jobs.resume(job_id).await?))
}

async fn cancel_job(
	State(state): State<AppState>,
	Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
	Ok(Json(state.service.jobs.cancel(job_id).await?))
}

async fn restart_job(
	State(state): State<AppState>,
	Path(job_id): Path<Uuid>,
) -> Result<Json<JobView>, ApiError> {
	Ok(Json(state.service.recovery.restart(job_id).await?))
}

async fn export_job(
	State(state): State<AppState>,
	Path(job_id): Path<Uuid>,
	Query(query): Query<ExportQuery>,
) -> Result<Response, ApiError> {
	let format = match query.format.as_deref() {
		Some(raw) => raw.parse::<ExportFormat>()?,
		None => ExportFormat::default(),
	};
	let export = state.service.jobs.export(job_id, format).await?;

	Ok(([(header::CONTENT_TYPE, export.content_type())], export.body).into_response())
}

async fn account_health(
	State(state): State<AppState>,
	Path((workspace_id, account_id)): Path<(String, String)>,
) -> Result<Json<HealthStats>, ApiError> {
	Ok(Json(state.service.health.stats(&workspace_id, &account_id).await?))
}

async fn list_proxies(State(state): State<AppState>) -> Result<Json<ProxiesResponse>, ApiError> {
	let proxies = state.service.proxy_pool.list_proxies().await?;

	Ok(Json(ProxiesResponse { proxies }))
}

async fn add_proxy(
	State(state): State<AppState>,
	Json(payload): Json<AddProxyRequest>,
) -> Result<(StatusCode, Json<ProxyView>), ApiError> {
	let proxy = state.service.proxy_pool.add_proxy(payload).await?;

	Ok((StatusCode::CREATED, Json(proxy)))
}

async fn remove_proxy(
	State(state): State<AppState>,
	Path(proxy_id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
	state.service.proxy_pool.remove_proxy(proxy_id).await?;

	Ok(StatusCode::NO_CONTENT)
}

async fn disable_proxy(
	State(state): State<AppState>,
	Path(proxy_id): Path<Uuid>,
) -> Result<Json<ProxyView>, ApiError> {
	Ok(Json(state.service.proxy_pool.set_proxy_disabled(proxy_id, true).await?))
}

async fn enable_proxy(
	State(state): State<AppState>,
	Path(proxy_id): Path<Uuid>,
) -> Result<Json<ProxyView>, ApiError> {
	Ok(Json(state.service.proxy_pool.set_proxy_disabled(proxy_id, false).await?))
}

async fn check_proxies(State(state): State<AppState>) -> Result<Json<HealthCheckReport>, ApiError> {
	let probe = state.service.providers.probe.clone();
	let report = state.service.proxy_pool.health_check(probe.as_ref()).await?;

	Ok(Json(report))
}

async fn rotate_allocation(
	State(state): State<AppState>,
	Json(payload): Json<RotateRequest>,
) -> Result<Json<RotateResponse>, ApiError> {
	let assignment = state
		.service
		.proxy_pool
		.rotate_sticky_session(payload.proxy_id, &payload.workspace_id, &payload.account_id)
		.await?;

	Ok(Json(RotateResponse {
		proxy_id: assignment.proxy_id,
		allocation_id: assignment.allocation_id,
		sticky_session_id: assignment.sticky_session_id,
		exclusive: assignment.exclusive,
	}))
}

async fn rotate_due(State(state): State<AppState>) -> Result<Json<RotateDueResponse>, ApiError> {
	let rotated = state.service.proxy_pool.rotate_due(OffsetDateTime::now_utc()).await?;

	Ok(Json(RotateDueResponse { rotated }))
}

async fn store_session(
	State(state): State<AppState>,
	Path((workspace_id, account_id)): Path<(String, String)>,
	Json(payload): Json<StoreSessionRequest>,
) -> Result<StatusCode, ApiError> {
	let session = SessionCookies {
		cookies: session::sanitize(payload.cookies, OffsetDateTime::now_utc()),
		ip_bound: payload.ip_bound,
	};

	if !session.has_auth(&state.service.cfg.session.auth_cookie) {
		return Err(json_error(
			StatusCode::BAD_REQUEST,
			"INVALID_REQUEST",
			format!("Session is missing the {} cookie.", state.service.cfg.session.auth_cookie),
		));
	}

	state.service.providers.credentials.store(&workspace_id, &account_id, &session).await?;

	tracing::info!(%workspace_id, %account_id, "Stored account session.");

	Ok(StatusCode::NO_CONTENT)
}

async fn grant_credits(
	State(state): State<AppState>,
	Path(workspace_id): Path<String>,
	Json(payload): Json<GrantCreditsRequest>,
) -> Result<Json<BalanceResponse>, ApiError> {
	if payload.amount <= 0 {
		return Err(json_error(
			StatusCode::BAD_REQUEST,
			"INVALID_REQUEST",
			"amount must be greater than zero.",
		));
	}

	let meta = json!({ "note": payload.note });
	let balance = credits::credit(
		&state.service.db,
		&workspace_id,
		"grant",
		payload.amount,
		&meta,
		OffsetDateTime::now_utc(),
	)
	.await
	.map_err(ServiceError::from)?;

	Ok(Json(BalanceResponse { workspace_id, balance }))
}

async fn require_admin_token(
	State(state): State<AppState>,
	req: Request,
	next: Next,
) -> Result<Response, ApiError> {
	let Some(expected) = state.service.cfg.security.admin_auth_token.as_deref() else {
		return Ok(next.run(req).await);
	};
	let presented = req
		.headers()
		.get(header::AUTHORIZATION)
		.and_then(|value| value.to_str().ok())
		.and_then(|value| value.strip_prefix("Bearer "));

	if presented != Some(expected) {
		return Err(json_error(
			StatusCode::UNAUTHORIZED,
			"UNAUTHORIZED",
			"A valid admin bearer token is required.",
		));
	}

	Ok(next.run(req).await)
}

#[derive(Debug, Serialize)]
struct ErrorBody {
	error_code: String,
	message: String,
}

#[derive(Debug)]
pub struct ApiError {
	status: StatusCode,
	error_code: String,
	message: String,
}
impl ApiError {
	fn new(status: StatusCode, error_code: impl Into<String>, message: impl Into<String>) -> Self {
		Self { status, error_code: error_code.into(), message: message.into() }
	}
}
impl From<ServiceError> for ApiError {
	fn from(err: ServiceError) -> Self {
		let status = match &err {
			ServiceError::InvalidRequest { .. } => StatusCode::BAD_REQUEST,
			ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,
			ServiceError::Conflict { .. }
			| ServiceError::InvalidTransition { .. }
			| ServiceError::AccountBusy { .. } => StatusCode::CONFLICT,
			ServiceError::QuotaExceeded { .. } | ServiceError::RateLimited { .. } =>
				StatusCode::TOO_MANY_REQUESTS,
			ServiceError::SessionInvalid { .. } => StatusCode::UNPROCESSABLE_ENTITY,
			ServiceError::ProxyUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
			_ => StatusCode::INTERNAL_SERVER_ERROR,
		};

		if status.is_server_error() {
			tracing::error!(error = %err, "Request failed.");
		}

		Self::new(status, err.code(), err.to_string())
	}
}
impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let body = ErrorBody { error_code: self.error_code, message: self.message };

		(self.status, Json(body)).into_response()
	}
}

pub fn json_error(status: StatusCode, code: &str, message: impl Into<String>) -> ApiError {
	ApiError::new(status, code, message)
}
