use std::{convert::Infallible, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, get_service, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::services::ServeDir;

use crate::{
    catalog,
    context::{is_auth_failure, AppContext},
    error::{RunError, ValidationError, GATEWAY_FAILURE_MESSAGE},
    export,
    gateway::GatewayClient,
    models::{ModelDescriptor, Prompt, TestResult},
    runner::ProgressEvent,
    snippet::{self, SnippetLanguage, SNIPPET_SECRET_WARNING},
    telemetry,
};

type SharedContext = Arc<AppContext<GatewayClient>>;
type ApiError = (StatusCode, String);

/**
 * \brief 启动本地 HTTP 服务，提供静态前端与 API。
 * \param addr 监听地址，如 "127.0.0.1:5173"
 */
pub async fn run(ctx: AppContext<GatewayClient>, addr: &str) -> Result<()> {
    let static_handler =
        ServeDir::new(ctx.settings.ui_dir.clone()).append_index_html_on_directories(true);
    let app = router(Arc::new(ctx)).fallback_service(get_service(static_handler));

    let listener = tokio::net::TcpListener::bind(addr).await?;
    println!("Server listening on http://{}", addr);
    telemetry::log_event("server", &format!("listening addr={}", addr));
    axum::serve(listener, app).await?;
    Ok(())
}

/**
 * \brief API 路由表。
 */
pub fn router(ctx: SharedContext) -> Router {
    Router::new()
        .route(
            "/api/credential",
            get(credential_status)
                .post(set_credential)
                .delete(clear_credential),
        )
        .route("/api/config", get(get_config).post(set_config))
        .route("/api/models", get(list_models))
        .route("/api/prompts", get(list_prompts).post(save_prompt))
        .route("/api/prompts/{id}", get(get_prompt).delete(delete_prompt))
        .route("/api/results", get(list_results))
        .route("/api/results/{id}", get(get_result).delete(delete_result))
        .route("/api/results/{id}/download", get(download_result))
        .route("/api/results/{id}/snippet", get(result_snippet))
        .route("/api/results/{id}/config", get(result_config))
        .route("/api/runs", post(run_tests))
        .route("/api/runs/sse", post(run_tests_sse))
        .route("/api/health", get(health_check))
        .with_state(ctx)
}

#[derive(Serialize, Debug)]
struct CredentialStatus {
    /** \brief 是否已设置凭证（从不返回明文） */
    set: bool,
}

#[derive(Deserialize, Debug)]
struct CredentialInput {
    api_key: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct ConfigState {
    telemetry_enabled: bool,
}

#[derive(Deserialize, Debug)]
struct ModelQuery {
    search: Option<String>,
    provider: Option<String>,
}

#[derive(Serialize, Debug)]
struct ModelsResponse {
    models: Vec<ModelDescriptor>,
    providers: Vec<String>,
}

#[derive(Deserialize, Debug)]
struct ResultQuery {
    prompt_id: Option<String>,
}

#[derive(Deserialize, Debug)]
struct SnippetQuery {
    lang: Option<String>,
}

#[derive(Serialize, Debug)]
struct SnippetResponse {
    language: SnippetLanguage,
    code: String,
    warning: &'static str,
}

#[derive(Deserialize, Debug)]
struct RunRequest {
    /** \brief 已保存 Prompt 的 ID */
    prompt_id: Option<String>,
    /** \brief 未保存的 Prompt（优先于 prompt_id） */
    prompt: Option<Prompt>,
    /** \brief 选中的模型描述（含价格） */
    #[serde(default)]
    models: Vec<ModelDescriptor>,
}

#[derive(Serialize, Debug)]
struct RunResponse {
    results: Vec<TestResult>,
}

fn internal_err<E: std::fmt::Display>(e: E) -> ApiError {
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

fn not_found(what: &str, id: &str) -> ApiError {
    (StatusCode::NOT_FOUND, format!("{} {} not found", what, id))
}

/**
 * \brief 网关错误对用户只给统一提示，细节写日志。
 */
fn gateway_err(category: &str, err: anyhow::Error) -> ApiError {
    telemetry::log_error(category, &format!("{:#}", err));
    let status = if is_auth_failure(&err) {
        StatusCode::UNAUTHORIZED
    } else {
        StatusCode::BAD_GATEWAY
    };
    (status, GATEWAY_FAILURE_MESSAGE.to_string())
}

fn run_err(err: RunError) -> ApiError {
    match err {
        RunError::Validation(v) => (StatusCode::BAD_REQUEST, v.to_string()),
        RunError::AllFailed { .. } => (StatusCode::BAD_GATEWAY, err.to_string()),
    }
}

async fn credential_status(
    State(ctx): State<SharedContext>,
) -> Result<Json<CredentialStatus>, ApiError> {
    let set = ctx.credential.is_set().map_err(internal_err)?;
    Ok(Json(CredentialStatus { set }))
}

async fn set_credential(
    State(ctx): State<SharedContext>,
    Json(input): Json<CredentialInput>,
) -> Result<Json<CredentialStatus>, ApiError> {
    ctx.credential
        .set(&input.api_key)
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    telemetry::log_event("server.credential", "set");
    Ok(Json(CredentialStatus { set: true }))
}

async fn clear_credential(
    State(ctx): State<SharedContext>,
) -> Result<Json<CredentialStatus>, ApiError> {
    ctx.credential.clear().map_err(internal_err)?;
    telemetry::log_event("server.credential", "clear");
    Ok(Json(CredentialStatus { set: false }))
}

async fn get_config(State(ctx): State<SharedContext>) -> Result<Json<ConfigState>, ApiError> {
    let telemetry_enabled = ctx.telemetry_enabled().map_err(internal_err)?;
    Ok(Json(ConfigState { telemetry_enabled }))
}

async fn set_config(
    State(ctx): State<SharedContext>,
    Json(input): Json<ConfigState>,
) -> Result<Json<ConfigState>, ApiError> {
    ctx.set_telemetry_enabled(input.telemetry_enabled)
        .map_err(internal_err)?;
    Ok(Json(input))
}

/**
 * \brief 获取模型目录，可按关键字与 provider 过滤。
 */
async fn list_models(
    State(ctx): State<SharedContext>,
    Query(q): Query<ModelQuery>,
) -> Result<Json<ModelsResponse>, ApiError> {
    if !ctx.credential.is_set().map_err(internal_err)? {
        return Err((
            StatusCode::BAD_REQUEST,
            ValidationError::MissingCredential.to_string(),
        ));
    }
    let models = ctx
        .fetch_catalog()
        .await
        .map_err(|e| gateway_err("server.models", e))?;
    let providers = catalog::provider_names(&models);
    let models = catalog::filter_models(&models, q.search.as_deref(), q.provider.as_deref())
        .into_iter()
        .cloned()
        .collect();
    Ok(Json(ModelsResponse { models, providers }))
}

async fn list_prompts(State(ctx): State<SharedContext>) -> Result<Json<Vec<Prompt>>, ApiError> {
    let prompts = ctx.prompts.list().map_err(internal_err)?;
    Ok(Json(prompts))
}

/**
 * \brief 保存 Prompt：ID 已存在则替换，否则新增；保存时刷新 updated_at。
 */
async fn save_prompt(
    State(ctx): State<SharedContext>,
    Json(mut prompt): Json<Prompt>,
) -> Result<Json<Prompt>, ApiError> {
    if prompt.id.trim().is_empty() {
        prompt.id = crate::models::generate_id();
    }
    prompt.touch();
    ctx.prompts.save(&prompt).map_err(internal_err)?;
    telemetry::log_event(
        "server.prompt",
        &format!("save id={} msgs={}", prompt.id, prompt.messages.len()),
    );
    Ok(Json(prompt))
}

async fn get_prompt(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
) -> Result<Json<Prompt>, ApiError> {
    ctx.prompts
        .get(&id)
        .map_err(internal_err)?
        .map(Json)
        .ok_or_else(|| not_found("prompt", &id))
}

async fn delete_prompt(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Prompt>>, ApiError> {
    if !ctx.prompts.delete(&id).map_err(internal_err)? {
        return Err(not_found("prompt", &id));
    }
    telemetry::log_event("server.prompt", &format!("delete id={}", id));
    let prompts = ctx.prompts.list().map_err(internal_err)?;
    Ok(Json(prompts))
}

async fn list_results(
    State(ctx): State<SharedContext>,
    Query(q): Query<ResultQuery>,
) -> Result<Json<Vec<TestResult>>, ApiError> {
    let results = match q.prompt_id {
        Some(prompt_id) => ctx.results.for_prompt(&prompt_id),
        None => ctx.results.list(),
    }
    .map_err(internal_err)?;
    Ok(Json(results))
}

fn load_result(ctx: &SharedContext, id: &str) -> Result<TestResult, ApiError> {
    ctx.results
        .get(id)
        .map_err(internal_err)?
        .ok_or_else(|| not_found("result", id))
}

async fn get_result(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
) -> Result<Json<TestResult>, ApiError> {
    load_result(&ctx, &id).map(Json)
}

async fn delete_result(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if !ctx.results.delete(&id).map_err(internal_err)? {
        return Err(not_found("result", &id));
    }
    telemetry::log_event("server.result", &format!("delete id={}", id));
    Ok(StatusCode::NO_CONTENT)
}

/**
 * \brief 以附件形式下载单个结果。
 */
async fn download_result(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let result = load_result(&ctx, &id)?;
    let body = export::to_pretty_json(&result).map_err(internal_err)?;
    let disposition = format!(
        "attachment; filename=\"{}\"",
        export::export_file_name(&result)
    );
    Ok((
        [
            (header::CONTENT_TYPE, "application/json".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        body,
    )
        .into_response())
}

/**
 * \brief 生成复现请求的代码片段（内嵌明文凭证）。
 */
async fn result_snippet(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
    Query(q): Query<SnippetQuery>,
) -> Result<Json<SnippetResponse>, ApiError> {
    let language = match q.lang.as_deref() {
        Some(lang) => lang
            .parse::<SnippetLanguage>()
            .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?,
        None => SnippetLanguage::Javascript,
    };
    let credential = ctx
        .credential
        .current()
        .map_err(internal_err)?
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                ValidationError::MissingCredential.to_string(),
            )
        })?;
    let result = load_result(&ctx, &id)?;
    let code = snippet::generate_snippet(
        &credential,
        ctx.gateway.base_url(),
        &result.model_id,
        &result.prompt,
        language,
    )
    .map_err(internal_err)?;
    Ok(Json(SnippetResponse {
        language,
        code,
        warning: SNIPPET_SECRET_WARNING,
    }))
}

async fn result_config(
    State(ctx): State<SharedContext>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let result = load_result(&ctx, &id)?;
    Ok(Json(export::prompt_config(&result)))
}

fn resolve_prompt(
    ctx: &SharedContext,
    req: RunRequest,
) -> Result<(Option<Prompt>, Vec<ModelDescriptor>), ApiError> {
    let prompt = match (req.prompt, req.prompt_id) {
        (Some(prompt), _) => Some(prompt),
        (None, Some(id)) => ctx.prompts.get(&id).map_err(internal_err)?,
        (None, None) => None,
    };
    Ok((prompt, req.models))
}

/**
 * \brief 执行测试并一次性返回全部成功结果。
 */
async fn run_tests(
    State(ctx): State<SharedContext>,
    Json(req): Json<RunRequest>,
) -> Result<Json<RunResponse>, ApiError> {
    let (prompt, models) = resolve_prompt(&ctx, req)?;
    let report = ctx
        .run_tests(prompt.as_ref(), &models, None)
        .await
        .map_err(run_err)?;
    Ok(Json(RunResponse {
        results: report.into_results(),
    }))
}

/**
 * \brief 执行测试并通过 SSE 推送进度：progress 事件，最后是 results 或 error。
 */
async fn run_tests_sse(
    State(ctx): State<SharedContext>,
    Json(req): Json<RunRequest>,
) -> Result<Sse<impl tokio_stream::Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (prompt, models) = resolve_prompt(&ctx, req)?;
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ProgressEvent>();

    let task = tokio::spawn(async move {
        ctx.run_tests(prompt.as_ref(), &models, Some(tx)).await
    });

    let stream = async_stream::stream! {
        while let Some(progress) = rx.recv().await {
            yield Ok::<Event, Infallible>(json_event("progress", &progress));
        }
        let final_event = match task.await {
            Ok(Ok(report)) => json_event(
                "results",
                &RunResponse { results: report.into_results() },
            ),
            Ok(Err(err)) => Event::default().event("error").data(err.to_string()),
            Err(join_err) => {
                telemetry::log_error("server.run", &format!("run task failed: {}", join_err));
                Event::default().event("error").data("run task failed")
            }
        };
        yield Ok::<Event, Infallible>(final_event);
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::new()))
}

fn json_event<T: Serialize>(name: &str, payload: &T) -> Event {
    Event::default()
        .event(name)
        .data(serde_json::to_string(payload).unwrap_or_default())
}

/**
 * \brief 健康检查：尝试用当前凭证拉取模型目录。
 */
async fn health_check(State(ctx): State<SharedContext>) -> Json<serde_json::Value> {
    match ctx.fetch_catalog().await {
        Ok(list) => Json(serde_json::json!({
            "ok": true,
            "base": ctx.gateway.base_url(),
            "models": list.len()
        })),
        Err(e) => {
            telemetry::log_error("server.health", &format!("{:#}", e));
            let message = e
                .downcast_ref::<ValidationError>()
                .map(|v| v.to_string())
                .unwrap_or_else(|| GATEWAY_FAILURE_MESSAGE.to_string());
            Json(serde_json::json!({
                "ok": false,
                "base": ctx.gateway.base_url(),
                "error": message
            }))
        }
    }
}
