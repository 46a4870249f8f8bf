use axum::{body::Bytes, extract::State, Json};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::instance::EditorInstance;

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
pub(super) struct HealthResponse {
    status: &'static str,
}

pub(super) async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

#[derive(Serialize)]
pub(super) struct InstanceResponse {
    instance: EditorInstance,
}

pub(super) async fn instances(State(state): State<AppState>) -> Json<InstanceResponse> {
    Json(InstanceResponse {
        instance: state.dispatcher.instance(),
    })
}

#[derive(Serialize)]
pub(super) struct CommandsResponse {
    commands: Vec<String>,
}

pub(super) async fn commands_list(
    State(state): State<AppState>,
) -> Result<Json<CommandsResponse>, ApiError> {
    let commands = state.dispatcher.list_commands().await?;
    Ok(Json(CommandsResponse { commands }))
}

#[derive(Deserialize, Default)]
pub(super) struct ExecuteRequest {
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    args: Option<Vec<Value>>,
}

#[derive(Serialize)]
pub(super) struct ExecuteResponse {
    success: bool,
    result: Value,
}

pub(super) async fn commands_execute(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ExecuteResponse>, ApiError> {
    let req: ExecuteRequest = parse_body(&body)?;
    let command = req
        .command
        .filter(|c| !c.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("command name is required".into()))?;
    let result = state
        .dispatcher
        .invoke(&command, req.args.unwrap_or_default())
        .await?;
    Ok(Json(ExecuteResponse {
        success: true,
        result,
    }))
}

#[derive(Serialize)]
pub(super) struct ToggleResponse {
    success: bool,
    #[serde(rename = "devToolsOpen")]
    dev_tools_open: bool,
}

pub(super) async fn devtools_toggle(
    State(state): State<AppState>,
) -> Result<Json<ToggleResponse>, ApiError> {
    let open = state.dispatcher.toggle_devtools(None).await?;
    Ok(Json(ToggleResponse {
        success: true,
        dev_tools_open: open,
    }))
}

#[derive(Deserialize, Default)]
pub(super) struct ScriptRequest {
    #[serde(default)]
    script: Option<String>,
}

#[derive(Serialize)]
pub(super) struct ScriptResponse {
    success: bool,
    message: &'static str,
}

pub(super) async fn devtools_execute(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<ScriptResponse>, ApiError> {
    let req: ScriptRequest = parse_body(&body)?;
    let script = req
        .script
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("script is required".into()))?;
    state.dispatcher.execute_in_devtools(&script).await?;
    Ok(Json(ScriptResponse {
        success: true,
        message: "Script execution started",
    }))
}

pub(super) async fn not_found() -> ApiError {
    ApiError::NotFound
}

/// Parse a JSON body, treating an empty body as `{}`.
fn parse_body<T: DeserializeOwned + Default>(body: &[u8]) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("invalid JSON body: {}", e)))
}
