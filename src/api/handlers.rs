//! HTTP request handlers

use super::sse::sse_stream;
use super::types::{
    CancelResponse, ChatRequest, ChatResponse, ConversationListResponse, ConversationResponse,
    ConversationWithMessagesResponse, CreateConversationRequest, ErrorResponse, ModelInfo,
    ModelsResponse, SuccessResponse,
};
use super::AppState;
use crate::db::DbError;
use crate::runtime::TurnRequest;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::Value;

type ApiError = (StatusCode, Json<ErrorResponse>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(message)))
}

fn map_db_error(e: DbError) -> ApiError {
    let status = match e {
        DbError::ConversationNotFound(_) => StatusCode::NOT_FOUND,
        DbError::Sqlite(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(ErrorResponse::new(e.to_string())))
}

fn internal_error(message: impl Into<String>) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ErrorResponse::new(message)),
    )
}

fn to_json(value: &impl serde::Serialize) -> Value {
    serde_json::to_value(value).unwrap_or(Value::Null)
}

pub async fn list_conversations(
    State(state): State<AppState>,
) -> Result<Json<ConversationListResponse>, ApiError> {
    let conversations = state
        .runtime
        .db()
        .list_conversations()
        .map_err(map_db_error)?;
    Ok(Json(ConversationListResponse {
        conversations: conversations.iter().map(to_json).collect(),
    }))
}

pub async fn create_conversation(
    State(state): State<AppState>,
    Json(request): Json<CreateConversationRequest>,
) -> Result<Json<ConversationResponse>, ApiError> {
    if !request.cwd.starts_with('/') {
        return Err(bad_request("cwd must be an absolute path"));
    }

    let registry = state.runtime.llm_registry();
    let model = match request.model.filter(|m| !m.is_empty()) {
        Some(model) => {
            if registry.has_models() {
                registry.validate_model(&model).map_err(|known| {
                    bad_request(format!(
                        "model '{}' is not available; known models: {}",
                        model,
                        known.join(", ")
                    ))
                })?;
            }
            model
        }
        None => registry.default_model_id().to_string(),
    };

    let id = uuid::Uuid::new_v4().to_string();
    let conversation = state
        .runtime
        .db()
        .create_conversation(&id, &request.cwd, &model, true, None, None)
        .map_err(map_db_error)?;

    Ok(Json(ConversationResponse {
        conversation: to_json(&conversation),
    }))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationWithMessagesResponse>, ApiError> {
    let conversation = state.runtime.db().get_conversation(&id).map_err(map_db_error)?;
    let messages = state.runtime.db().get_messages(&id).map_err(map_db_error)?;

    Ok(Json(ConversationWithMessagesResponse {
        agent_working: conversation.is_agent_working(),
        conversation: to_json(&conversation),
        messages: messages.iter().map(to_json).collect(),
    }))
}

pub async fn chat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ChatRequest>,
) -> Result<Json<ChatResponse>, ApiError> {
    if request.text.is_empty() {
        return Err(bad_request("text is required"));
    }

    state.runtime.db().get_conversation(&id).map_err(map_db_error)?;

    state
        .runtime
        .send_turn(&id, TurnRequest::new(request.text))
        .await
        .map_err(internal_error)?;

    Ok(Json(ChatResponse { queued: true }))
}

pub async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<CancelResponse>, ApiError> {
    state.runtime.cancel(&id).await.map_err(internal_error)?;
    Ok(Json(CancelResponse { ok: true }))
}

pub async fn archive(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SuccessResponse>, ApiError> {
    state
        .runtime
        .db()
        .archive_conversation(&id)
        .map_err(map_db_error)?;
    Ok(Json(SuccessResponse { success: true }))
}

pub async fn list_subagents(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationListResponse>, ApiError> {
    // 404 for unknown parents rather than an empty list
    state.runtime.db().get_conversation(&id).map_err(map_db_error)?;

    let children = state.runtime.db().list_subagents(&id).map_err(map_db_error)?;
    Ok(Json(ConversationListResponse {
        conversations: children.iter().map(to_json).collect(),
    }))
}

pub async fn models(State(state): State<AppState>) -> Json<ModelsResponse> {
    let registry = state.runtime.llm_registry();
    Json(ModelsResponse {
        models: registry
            .available_models()
            .into_iter()
            .map(|m| ModelInfo {
                id: m.id,
                display_name: m.display_name,
            })
            .collect(),
        default: registry.default_model_id().to_string(),
    })
}

pub async fn stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation = state.runtime.db().get_conversation(&id).map_err(map_db_error)?;
    let messages = state.runtime.db().get_messages(&id).map_err(map_db_error)?;
    let last_sequence_id = state
        .runtime
        .db()
        .get_last_sequence_id(&id)
        .map_err(map_db_error)?;

    let init = serde_json::json!({
        "type": "init",
        "conversation": to_json(&conversation),
        "messages": messages.iter().map(to_json).collect::<Vec<_>>(),
        "agent_working": conversation.is_agent_working(),
        "last_sequence_id": last_sequence_id,
    });

    let rx = state.runtime.subscribe(&id).await.map_err(internal_error)?;
    Ok(sse_stream(init, rx))
}
