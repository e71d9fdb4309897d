//! JSON HTTP API.
//!
//! Every route except `/health`, registration, verification, login and the
//! password-reset pair requires `Authorization: Bearer {session_token}`.
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "quota_exceeded", "message": "Storage limit reached" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `validation_error`, `token_invalid`, `token_expired`, `token_used` | 400 |
//! | `unauthenticated` | 401 |
//! | `quota_exceeded`, `permission_denied` | 403 |
//! | `not_found` | 404 |
//! | `internal` | 500 |
//!
//! # CORS
//!
//! All origins, methods and headers are permitted.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Path, Query, State},
    handler::Handler,
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

use handout_desk_core::error::DeskError;
use handout_desk_core::hierarchy::SectionNode;
use handout_desk_core::markup::percent_encode;
use handout_desk_core::models::{
    Account, Handout, HandoutPatch, NewHandout, NewSection, ReorderEntry, SectionPatch,
};
use handout_desk_core::quota::UsageReport;
use handout_desk_core::service::ContentService;

use crate::accounts::{AccountService, LoginRequest, ProfilePatch, RegisterRequest};
use crate::attachments::{Attachment, Attachments, NewAttachment};
use crate::config::Config;
use crate::db;
use crate::export::{Artifact, Exporter};
use crate::letters::{Letters, TemplateInput};
use crate::migrate;
use crate::projects::{NewFolder, NewProject, NewTag, ProjectPatch, Projects};
use crate::queue::{self, TaskQueue};
use crate::sqlite_store::SqliteStore;

/// Services shared by the HTTP handlers and the CLI.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: SqlitePool,
    pub content: ContentService<SqliteStore, Letters>,
    pub accounts: AccountService,
    pub letters: Letters,
    pub projects: Projects,
    pub attachments: Attachments,
    pub exporter: Exporter,
}

impl AppState {
    pub fn build(config: &Config, pool: SqlitePool, queue: TaskQueue) -> Self {
        let letters = Letters::new(pool.clone(), queue, &config.mail);
        let content = ContentService::new(
            Arc::new(SqliteStore::new(pool.clone())),
            Arc::new(letters.clone()),
        );
        let accounts = AccountService::new(
            pool.clone(),
            config.auth.clone(),
            &config.mail,
            letters.clone(),
        );
        let projects = Projects::new(pool.clone());
        let attachments = Attachments::new(pool.clone(), content.clone(), config.export.clone());
        let exporter = Exporter::new(content.clone(), projects.clone(), config.export.clone());
        Self {
            config: Arc::new(config.clone()),
            pool,
            content,
            accounts,
            letters,
            projects,
            attachments,
            exporter,
        }
    }

    /// Resolve the bearer token in `headers` to an active account.
    async fn account(&self, headers: &HeaderMap) -> Result<Account, AppError> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| {
                AppError::from(DeskError::Unauthenticated(
                    "Authentication credentials were not provided.".into(),
                ))
            })?;
        Ok(self.accounts.authenticate(token).await?)
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let upload_limit = DefaultBodyLimit::max(state.config.export.max_upload_bytes);

    Router::new()
        .route("/health", get(handle_health))
        .route("/accounts/register", post(handle_register))
        .route("/accounts/verify-email", post(handle_verify_email))
        .route("/accounts/login", post(handle_login))
        .route("/accounts/password-reset", post(handle_reset_request))
        .route("/accounts/password-reset/confirm", post(handle_reset_confirm))
        .route("/accounts/me", get(handle_me).patch(handle_update_me))
        .route("/accounts/change-password", post(handle_change_password))
        .route("/projects", get(handle_list_projects).post(handle_create_project))
        .route(
            "/projects/{id}",
            get(handle_get_project)
                .patch(handle_update_project)
                .delete(handle_delete_project),
        )
        .route("/tags", get(handle_list_tags).post(handle_create_tag))
        .route("/tags/{id}", axum::routing::delete(handle_delete_tag))
        .route("/projects/{id}/download-zip", get(handle_project_zip))
        .route("/folders", post(handle_create_folder))
        .route("/folders/{id}", axum::routing::delete(handle_delete_folder))
        .route("/handouts", get(handle_list_handouts).post(handle_create_handout))
        .route(
            "/handouts/{id}",
            get(handle_get_handout)
                .patch(handle_update_handout)
                .delete(handle_delete_handout),
        )
        .route("/handouts/{id}/reorder-sections", post(handle_reorder))
        .route("/handouts/{id}/outline", get(handle_outline))
        .route("/handouts/{id}/export-pdf", get(handle_export_pdf))
        .route("/handouts/{id}/export-html", get(handle_export_html))
        .route("/sections", get(handle_list_sections).post(handle_create_section))
        .route(
            "/sections/{id}",
            get(handle_get_section)
                .patch(handle_update_section)
                .delete(handle_delete_section),
        )
        .route(
            "/attachments",
            get(handle_list_attachments).post(handle_upload_attachment.layer(upload_limit)),
        )
        .route(
            "/attachments/{id}",
            get(handle_get_attachment).delete(handle_delete_attachment),
        )
        .route("/letters", get(handle_list_letters))
        .route("/letters/{id}/send", post(handle_send_letter))
        .route("/email-templates", put(handle_upsert_template))
        .layer(cors)
        .with_state(state)
}

/// Migrate the database, start the mail worker and serve the API on
/// `[server].bind` until the process ends.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let pool = db::connect(config).await?;
    migrate::apply(&pool).await?;

    let (queue, rx) = TaskQueue::channel();
    queue::spawn_worker(
        rx,
        pool.clone(),
        queue::transport_from_config(&config.mail),
        config.mail.from.clone(),
    );

    let app = router(AppState::build(config, pool, queue));

    let bind_addr = config.server.bind.clone();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(bind = %bind_addr, transport = %config.mail.transport, "server listening");
    println!("Handout Desk listening on http://{}", bind_addr);

    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn status_for(kind: &DeskError) -> StatusCode {
    match kind {
        DeskError::Validation(_)
        | DeskError::TokenInvalid(_)
        | DeskError::TokenExpired(_)
        | DeskError::TokenUsed(_) => StatusCode::BAD_REQUEST,
        DeskError::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
        DeskError::QuotaExceeded(_) | DeskError::PermissionDenied(_) => StatusCode::FORBIDDEN,
        DeskError::NotFound(_) => StatusCode::NOT_FOUND,
    }
}

impl From<DeskError> for AppError {
    fn from(kind: DeskError) -> Self {
        AppError {
            status: status_for(&kind),
            code: kind.code().to_string(),
            message: kind.to_string(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(kind) = DeskError::find(&err) {
            return kind.clone().into();
        }
        let detail = format!("{:#}", err);
        error!(error = %detail, "request failed");
        AppError {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            code: "internal".to_string(),
            message: "Internal server error".to_string(),
        }
    }
}

type ApiResult<T> = Result<T, AppError>;

fn download(artifact: Artifact, content_type: &'static str) -> Response {
    let disposition = format!(
        "attachment; filename*=UTF-8''{}",
        percent_encode(&artifact.filename)
    );
    (
        [
            (header::CONTENT_TYPE, content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        artifact.bytes,
    )
        .into_response()
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Accounts ============

async fn handle_register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<(StatusCode, Json<Account>)> {
    let account = state.accounts.register(req).await?;
    Ok((StatusCode::CREATED, Json(account)))
}

#[derive(Deserialize)]
struct TokenRequest {
    token: String,
}

async fn handle_verify_email(
    State(state): State<AppState>,
    Json(req): Json<TokenRequest>,
) -> ApiResult<Json<Value>> {
    let outcome = state.accounts.verify_email(&req.token).await?;
    Ok(Json(json!({ "status": outcome })))
}

async fn handle_login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> ApiResult<Json<Value>> {
    let session = state.accounts.login(req).await?;
    Ok(Json(json!(session)))
}

#[derive(Deserialize)]
struct ResetRequest {
    email: String,
}

async fn handle_reset_request(
    State(state): State<AppState>,
    Json(req): Json<ResetRequest>,
) -> ApiResult<StatusCode> {
    state.accounts.request_password_reset(&req.email).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
struct ResetConfirm {
    token: String,
    otp: String,
    new_password: String,
}

async fn handle_reset_confirm(
    State(state): State<AppState>,
    Json(req): Json<ResetConfirm>,
) -> ApiResult<StatusCode> {
    state
        .accounts
        .confirm_password_reset(&req.token, &req.otp, &req.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct MeResponse {
    account: Account,
    usage: UsageReport,
}

async fn handle_me(State(state): State<AppState>, headers: HeaderMap) -> ApiResult<Json<MeResponse>> {
    let account = state.account(&headers).await?;
    let usage = state.content.usage_report(&account.id).await?;
    Ok(Json(MeResponse { account, usage }))
}

async fn handle_update_me(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(patch): Json<ProfilePatch>,
) -> ApiResult<Json<Account>> {
    let account = state.account(&headers).await?;
    Ok(Json(state.accounts.update_profile(&account.id, patch).await?))
}

#[derive(Deserialize)]
struct ChangePassword {
    old_password: String,
    new_password: String,
}

async fn handle_change_password(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ChangePassword>,
) -> ApiResult<StatusCode> {
    let account = state.account(&headers).await?;
    state
        .accounts
        .change_password(&account.id, &req.old_password, &req.new_password)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Projects & folders ============

async fn handle_list_projects(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let account = state.account(&headers).await?;
    Ok(Json(json!(state.projects.list(&account.id).await?)))
}

async fn handle_create_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewProject>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let account = state.account(&headers).await?;
    let project = state.projects.create(&account.id, new).await?;
    Ok((StatusCode::CREATED, Json(json!(project))))
}

async fn handle_get_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let account = state.account(&headers).await?;
    Ok(Json(json!(state.projects.detail(&account.id, &id).await?)))
}

async fn handle_delete_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let account = state.account(&headers).await?;
    state.projects.delete(&account.id, &id).await?;
    state.content.refresh_usage(&account.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_update_project(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<ProjectPatch>,
) -> ApiResult<Json<Value>> {
    let account = state.account(&headers).await?;
    Ok(Json(json!(state.projects.update(&account.id, &id, patch).await?)))
}

async fn handle_project_zip(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let account = state.account(&headers).await?;
    let artifact = state.exporter.export_project_zip(&account.id, &id).await?;
    Ok(download(artifact, "application/zip"))
}

async fn handle_create_folder(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewFolder>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let account = state.account(&headers).await?;
    let folder = state.projects.create_folder(&account.id, new).await?;
    Ok((StatusCode::CREATED, Json(json!(folder))))
}

async fn handle_delete_folder(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let account = state.account(&headers).await?;
    state.projects.delete_folder(&account.id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn handle_list_tags(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let account = state.account(&headers).await?;
    Ok(Json(json!(state.projects.list_tags(&account.id).await?)))
}

async fn handle_create_tag(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewTag>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let account = state.account(&headers).await?;
    let tag = state.projects.create_tag(&account.id, new).await?;
    Ok((StatusCode::CREATED, Json(json!(tag))))
}

async fn handle_delete_tag(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let account = state.account(&headers).await?;
    state.projects.delete_tag(&account.id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Handouts ============

#[derive(Deserialize)]
struct HandoutFilter {
    project: Option<String>,
    folder: Option<String>,
}

async fn handle_list_handouts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<HandoutFilter>,
) -> ApiResult<Json<Vec<Handout>>> {
    let account = state.account(&headers).await?;
    let handouts = state
        .projects
        .list_handouts(
            &account.id,
            filter.project.as_deref(),
            filter.folder.as_deref(),
        )
        .await?;
    Ok(Json(handouts))
}

async fn handle_create_handout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewHandout>,
) -> ApiResult<(StatusCode, Json<Handout>)> {
    let account = state.account(&headers).await?;
    let handout = state.content.create_handout(&account.id, new).await?;
    Ok((StatusCode::CREATED, Json(handout)))
}

#[derive(Serialize)]
struct HandoutDetail {
    #[serde(flatten)]
    handout: Handout,
    sections: Vec<SectionNode>,
}

async fn handle_get_handout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<HandoutDetail>> {
    let account = state.account(&headers).await?;
    let handout = state.content.owned_handout(&account.id, &id).await?;
    let sections = state.content.tree(&account.id, &id).await?;
    Ok(Json(HandoutDetail { handout, sections }))
}

async fn handle_update_handout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<HandoutPatch>,
) -> ApiResult<Json<Handout>> {
    let account = state.account(&headers).await?;
    Ok(Json(
        state.content.update_handout(&account.id, &id, patch).await?,
    ))
}

async fn handle_delete_handout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let account = state.account(&headers).await?;
    state.content.delete_handout(&account.id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct ReorderRequest {
    sections: Vec<ReorderEntry>,
}

async fn handle_reorder(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(req): Json<ReorderRequest>,
) -> ApiResult<Json<Value>> {
    let account = state.account(&headers).await?;
    let sections = state
        .content
        .reorder_sections(&account.id, &id, &req.sections)
        .await?;
    Ok(Json(json!(sections)))
}

async fn handle_outline(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let account = state.account(&headers).await?;
    Ok(Json(json!(state.content.outline(&account.id, &id).await?)))
}

async fn handle_export_pdf(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let account = state.account(&headers).await?;
    let artifact = state.exporter.export_pdf(&account.id, &id).await?;
    Ok(download(artifact, "application/pdf"))
}

async fn handle_export_html(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Html<String>> {
    let account = state.account(&headers).await?;
    Ok(Html(state.exporter.export_html(&account.id, &id).await?))
}

// ============ Sections ============

#[derive(Deserialize)]
struct SectionFilter {
    handout: Option<String>,
}

async fn handle_list_sections(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(filter): Query<SectionFilter>,
) -> ApiResult<Json<Value>> {
    let account = state.account(&headers).await?;
    let handout = filter.handout.ok_or_else(|| {
        AppError::from(DeskError::Validation(
            "The handout query parameter is required.".into(),
        ))
    })?;
    Ok(Json(json!(
        state.content.outline(&account.id, &handout).await?
    )))
}

async fn handle_create_section(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(new): Json<NewSection>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let account = state.account(&headers).await?;
    let section = state.content.create_section(&account.id, new).await?;
    Ok((StatusCode::CREATED, Json(json!(section))))
}

async fn handle_get_section(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let account = state.account(&headers).await?;
    Ok(Json(json!(state.content.get_section(&account.id, &id).await?)))
}

async fn handle_update_section(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(patch): Json<SectionPatch>,
) -> ApiResult<Json<Value>> {
    let account = state.account(&headers).await?;
    Ok(Json(json!(
        state.content.update_section(&account.id, &id, patch).await?
    )))
}

async fn handle_delete_section(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let account = state.account(&headers).await?;
    state.content.delete_section(&account.id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Attachments ============

#[derive(Deserialize)]
struct UploadParams {
    file_name: String,
    #[serde(default)]
    caption: String,
    #[serde(default)]
    alt_text: String,
}

/// The raw request body is the file; the mime type comes from
/// `Content-Type`.
async fn handle_upload_attachment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<UploadParams>,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Attachment>)> {
    let account = state.account(&headers).await?;
    let mime_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let new = NewAttachment {
        file_name: params.file_name,
        caption: params.caption,
        alt_text: params.alt_text,
        mime_type,
    };
    let attachment = state.attachments.upload(&account.id, new, &body).await?;
    Ok((StatusCode::CREATED, Json(attachment)))
}

async fn handle_list_attachments(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Vec<Attachment>>> {
    let account = state.account(&headers).await?;
    Ok(Json(state.attachments.list(&account.id).await?))
}

async fn handle_get_attachment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<Json<Attachment>> {
    let account = state.account(&headers).await?;
    Ok(Json(state.attachments.get_owned(&account.id, &id).await?))
}

async fn handle_delete_attachment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let account = state.account(&headers).await?;
    state.attachments.delete(&account.id, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============ Letters & templates ============

async fn handle_list_letters(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> ApiResult<Json<Value>> {
    let account = state.account(&headers).await?;
    Ok(Json(json!(
        state.letters.list_for_account(&account.id).await?
    )))
}

async fn handle_send_letter(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let account = state.account(&headers).await?;
    let letter = state.letters.resend(&account.id, &id).await?;
    Ok((StatusCode::ACCEPTED, Json(json!(letter))))
}

async fn handle_upsert_template(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<TemplateInput>,
) -> ApiResult<Json<Value>> {
    let account = state.account(&headers).await?;
    if !account.role.is_admin() {
        return Err(DeskError::PermissionDenied(
            "Only administrators can edit email templates.".into(),
        )
        .into());
    }
    Ok(Json(json!(state.letters.upsert_template(input).await?)))
}
