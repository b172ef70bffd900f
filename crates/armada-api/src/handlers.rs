//! Request handlers.
//!
//! Mutating endpoints spool the payload, create a task and answer
//! `302 Location: /tasks/{id}`; reads serve JSON from the state store.
//! Content-type gating happens here: a mismatched type is a 404, as if
//! the route did not exist.

use std::path::PathBuf;

use axum::body::Bytes;
use axum::extract::{Extension, Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use armada_core::DirectorError;
use armada_state::{TaskKind, TaskRecord, TaskState};

use crate::auth::{new_user_record, CurrentUser};
use crate::error::ApiResult;
use crate::ApiState;

const CONTENT_COMPRESSED: &str = "application/x-compressed";
const CONTENT_YAML: &str = "text/yaml";
const CONTENT_JSON: &str = "application/json";

fn content_type_is(headers: &HeaderMap, expected: &str) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.split(';').next().map(str::trim) == Some(expected))
}

/// Mismatched content type looks like a missing route.
fn wrong_media_type() -> Response {
    StatusCode::NOT_FOUND.into_response()
}

fn spool(state: &ApiState, prefix: &str, bytes: &Bytes) -> anyhow::Result<PathBuf> {
    std::fs::create_dir_all(&state.spool_dir)?;
    let path = state
        .spool_dir
        .join(format!("{prefix}-{}", Uuid::new_v4()));
    std::fs::write(&path, bytes)?;
    Ok(path)
}

fn redirect_to_task(task: &TaskRecord) -> Response {
    debug!(task_id = task.id, kind = %task.kind, "task enqueued via api");
    (
        StatusCode::FOUND,
        [(header::LOCATION, format!("/tasks/{}", task.id))],
    )
        .into_response()
}

// ── Users ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct UserBody {
    pub username: String,
    pub password: String,
}

/// POST /users
pub async fn create_user(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    if !content_type_is(&headers, CONTENT_JSON) {
        return Ok(wrong_media_type());
    }
    let user: UserBody = serde_json::from_slice(&body)
        .map_err(|e| DirectorError::ValidationFailed(vec![format!("bad user body: {e}")]))?;
    state
        .store
        .put_user(&new_user_record(&user.username, &user.password))?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// PUT /users/{username}
pub async fn update_user(
    State(state): State<ApiState>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    if !content_type_is(&headers, CONTENT_JSON) {
        return Ok(wrong_media_type());
    }
    let user: UserBody = serde_json::from_slice(&body)
        .map_err(|e| DirectorError::ValidationFailed(vec![format!("bad user body: {e}")]))?;
    if user.username != username {
        return Err(DirectorError::UserImmutableUsername.into());
    }
    if state.store.get_user(&username)?.is_none() {
        return Err(DirectorError::not_found("user", &username).into());
    }
    state
        .store
        .put_user(&new_user_record(&user.username, &user.password))?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// DELETE /users/{username}
pub async fn delete_user(
    State(state): State<ApiState>,
    Path(username): Path<String>,
) -> ApiResult<Response> {
    if !state.store.delete_user(&username)? {
        return Err(DirectorError::not_found("user", &username).into());
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

// ── Releases ───────────────────────────────────────────────────────

/// POST /releases
pub async fn upload_release(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    if !content_type_is(&headers, CONTENT_COMPRESSED) {
        return Ok(wrong_media_type());
    }
    let path = spool(&state, "release", &body)?;
    let task = state.tasks.create(
        TaskKind::UpdateRelease,
        "create release",
        json!({"bundle_path": path.to_string_lossy()}),
    )?;
    Ok(redirect_to_task(&task))
}

/// GET /releases
pub async fn list_releases(State(state): State<ApiState>) -> ApiResult<Response> {
    let mut out = Vec::new();
    for release in state.store.list_releases()? {
        let versions: Vec<String> = state
            .store
            .list_release_versions(&release.name)?
            .into_iter()
            .map(|v| v.version)
            .collect();
        out.push(json!({"name": release.name, "versions": versions}));
    }
    Ok(Json(out).into_response())
}

#[derive(Deserialize, Default)]
pub struct DeleteReleaseQuery {
    #[serde(default)]
    pub force: bool,
}

/// DELETE /releases/{name}?force=
pub async fn delete_release(
    State(state): State<ApiState>,
    Path(name): Path<String>,
    Query(query): Query<DeleteReleaseQuery>,
) -> ApiResult<Response> {
    let task = state.tasks.create(
        TaskKind::DeleteRelease,
        &format!("delete release {name}"),
        json!({"name": name, "force": query.force}),
    )?;
    Ok(redirect_to_task(&task))
}

// ── Deployments ────────────────────────────────────────────────────

/// POST /deployments
pub async fn create_deployment(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    if !content_type_is(&headers, CONTENT_YAML) {
        return Ok(wrong_media_type());
    }
    let path = spool(&state, "manifest", &body)?;
    let task = state.tasks.create(
        TaskKind::UpdateDeployment,
        "create deployment",
        json!({"manifest_path": path.to_string_lossy()}),
    )?;
    Ok(redirect_to_task(&task))
}

/// GET /deployments
pub async fn list_deployments(State(state): State<ApiState>) -> ApiResult<Response> {
    let out: Vec<_> = state
        .store
        .list_deployments()?
        .into_iter()
        .map(|d| json!({"name": d.name}))
        .collect();
    Ok(Json(out).into_response())
}

/// DELETE /deployments/{name}
pub async fn delete_deployment(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> ApiResult<Response> {
    let task = state.tasks.create(
        TaskKind::DeleteDeployment,
        &format!("delete deployment {name}"),
        json!({"name": name}),
    )?;
    Ok(redirect_to_task(&task))
}

// ── Stemcells ──────────────────────────────────────────────────────

/// POST /stemcells
pub async fn upload_stemcell(
    State(state): State<ApiState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Response> {
    if !content_type_is(&headers, CONTENT_COMPRESSED) {
        return Ok(wrong_media_type());
    }
    let path = spool(&state, "stemcell", &body)?;
    let task = state.tasks.create(
        TaskKind::UpdateStemcell,
        "create stemcell",
        json!({"bundle_path": path.to_string_lossy()}),
    )?;
    Ok(redirect_to_task(&task))
}

/// GET /stemcells
pub async fn list_stemcells(State(state): State<ApiState>) -> ApiResult<Response> {
    let out: Vec<_> = state
        .store
        .list_stemcells()?
        .into_iter()
        .map(|s| json!({"name": s.name, "version": s.version, "cid": s.cid}))
        .collect();
    Ok(Json(out).into_response())
}

/// DELETE /stemcells/{name}/{version}
pub async fn delete_stemcell(
    State(state): State<ApiState>,
    Path((name, version)): Path<(String, String)>,
) -> ApiResult<Response> {
    let task = state.tasks.create(
        TaskKind::DeleteStemcell,
        &format!("delete stemcell {name}/{version}"),
        json!({"name": name, "version": version}),
    )?;
    Ok(redirect_to_task(&task))
}

// ── Tasks ──────────────────────────────────────────────────────────

fn task_view(task: &TaskRecord) -> serde_json::Value {
    json!({
        "id": task.id,
        "kind": task.kind,
        "state": task.state,
        "timestamp": task.timestamp,
        "description": task.description,
        "result": task.result,
    })
}

#[derive(Deserialize, Default)]
pub struct TasksQuery {
    pub limit: Option<usize>,
    pub state: Option<String>,
}

fn parse_task_state(text: &str) -> Result<TaskState, DirectorError> {
    serde_json::from_value(json!(text))
        .map_err(|_| DirectorError::ValidationFailed(vec![format!("unknown task state: {text}")]))
}

/// GET /tasks?limit=&state=
pub async fn list_tasks(
    State(state): State<ApiState>,
    Query(query): Query<TasksQuery>,
) -> ApiResult<Response> {
    let filter = query.state.as_deref().map(parse_task_state).transpose()?;
    let tasks = state
        .store
        .list_tasks(query.limit.unwrap_or(100), filter)?;
    let out: Vec<_> = tasks.iter().map(task_view).collect();
    Ok(Json(out).into_response())
}

/// GET /tasks/{id}
pub async fn get_task(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    let task = state
        .store
        .get_task(id)?
        .ok_or_else(|| DirectorError::not_found("task", id.to_string()))?;
    Ok(Json(task_view(&task)).into_response())
}

/// DELETE /tasks/{id} — request cooperative cancellation.
pub async fn cancel_task(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
) -> ApiResult<Response> {
    if state.store.get_task(id)?.is_none() {
        return Err(DirectorError::not_found("task", id.to_string()).into());
    }
    state.tasks.cancel(id)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}

#[derive(Deserialize, Default)]
pub struct OutputQuery {
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

/// GET /tasks/{id}/output?type=debug|event|result
pub async fn task_output(
    State(state): State<ApiState>,
    Path(id): Path<u64>,
    Query(query): Query<OutputQuery>,
) -> ApiResult<Response> {
    let kind = query.kind.as_deref().unwrap_or("debug");
    if !matches!(kind, "debug" | "event" | "result") {
        return Err(
            DirectorError::ValidationFailed(vec![format!("unknown output type: {kind}")]).into(),
        );
    }
    let task = state
        .store
        .get_task(id)?
        .ok_or_else(|| DirectorError::not_found("task", id.to_string()))?;
    let Some(dir) = task.output_dir else {
        return Ok(StatusCode::NO_CONTENT.into_response());
    };
    match std::fs::read_to_string(std::path::Path::new(&dir).join(kind)) {
        Ok(content) => Ok((
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain")],
            content,
        )
            .into_response()),
        Err(_) => Ok(StatusCode::NO_CONTENT.into_response()),
    }
}

// ── Status ─────────────────────────────────────────────────────────

/// GET /status
pub async fn status(
    State(state): State<ApiState>,
    Extension(CurrentUser(user)): Extension<CurrentUser>,
) -> ApiResult<Response> {
    Ok(Json(json!({
        "status": format!("{} (user: {user})", state.director_name),
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth;
    use armada_state::StateStore;
    use axum::body::Body;
    use axum::http::Request;
    use base64::Engine;
    use tower::ServiceExt;

    fn test_state(dir: &std::path::Path) -> ApiState {
        let store = StateStore::open_in_memory().unwrap();
        store
            .put_user(&auth::new_user_record("admin", "secret"))
            .unwrap();
        ApiState {
            store: store.clone(),
            tasks: armada_tasks::TaskManager::new(store, dir.join("tasks")),
            spool_dir: dir.join("spool"),
            director_name: "Armada Director".to_string(),
        }
    }

    fn basic_auth() -> String {
        let encoded = base64::engine::general_purpose::STANDARD.encode("admin:secret");
        format!("Basic {encoded}")
    }

    async fn send(
        router: axum::Router,
        request: Request<Body>,
    ) -> axum::http::Response<Body> {
        router.oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn requests_without_credentials_get_401() {
        let dir = tempfile::tempdir().unwrap();
        let router = crate::build_router(test_state(dir.path()));

        let response = send(
            router,
            Request::get("/deployments").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_password_gets_401() {
        let dir = tempfile::tempdir().unwrap();
        let router = crate::build_router(test_state(dir.path()));

        let bad = base64::engine::general_purpose::STANDARD.encode("admin:nope");
        let response = send(
            router,
            Request::get("/deployments")
                .header(header::AUTHORIZATION, format!("Basic {bad}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn deployment_upload_redirects_to_task() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let router = crate::build_router(state.clone());

        let response = send(
            router,
            Request::post("/deployments")
                .header(header::AUTHORIZATION, basic_auth())
                .header(header::CONTENT_TYPE, "text/yaml")
                .body(Body::from("name: prod"))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FOUND);
        let location = response.headers()[header::LOCATION].to_str().unwrap();
        assert!(location.starts_with("/tasks/"));

        let id: u64 = location.trim_start_matches("/tasks/").parse().unwrap();
        let task = state.store.get_task(id).unwrap().unwrap();
        assert_eq!(task.kind, TaskKind::UpdateDeployment);
        assert_eq!(task.state, TaskState::Queued);
    }

    #[tokio::test]
    async fn wrong_content_type_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let router = crate::build_router(test_state(dir.path()));

        let response = send(
            router,
            Request::post("/deployments")
                .header(header::AUTHORIZATION, basic_auth())
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_reports_the_authenticated_user() {
        let dir = tempfile::tempdir().unwrap();
        let router = crate::build_router(test_state(dir.path()));

        let response = send(
            router,
            Request::get("/status")
                .header(header::AUTHORIZATION, basic_auth())
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "Armada Director (user: admin)");
    }

    #[tokio::test]
    async fn user_rename_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, CONTENT_JSON.parse().unwrap());
        let body = Bytes::from(r#"{"username": "other", "password": "x"}"#);
        let response = update_user(
            State(state),
            Path("admin".to_string()),
            headers,
            body,
        )
        .await
        .map(|r| r.into_response())
        .unwrap_or_else(|e| e.into_response());
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn task_listing_orders_and_filters() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        state
            .tasks
            .create(TaskKind::UpdateRelease, "first", json!({}))
            .unwrap();
        let second = state
            .tasks
            .create(TaskKind::UpdateRelease, "second", json!({}))
            .unwrap();
        state
            .store
            .finish_task(second.id, TaskState::Done, "ok")
            .unwrap();

        let response = list_tasks(
            State(state.clone()),
            Query(TasksQuery {
                limit: None,
                state: Some("done".into()),
            }),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 64 * 1024)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["description"], "second");
    }

    #[tokio::test]
    async fn task_output_serves_debug_stream_or_204() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let task = state
            .tasks
            .create(TaskKind::UpdateDeployment, "deploy", json!({}))
            .unwrap();

        // Nothing written yet.
        let response = task_output(
            State(state.clone()),
            Path(task.id),
            Query(OutputQuery { kind: None }),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let out_dir = task.output_dir.as_ref().unwrap();
        std::fs::write(std::path::Path::new(out_dir).join("debug"), "line one\n").unwrap();
        let response = task_output(
            State(state),
            Path(task.id),
            Query(OutputQuery { kind: None }),
        )
        .await
        .unwrap()
        .into_response();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn cancel_unknown_task_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let response = cancel_task(State(state), Path(99))
            .await
            .map(|r| r.into_response())
            .unwrap_or_else(|e| e.into_response());
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
