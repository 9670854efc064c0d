use axum::{
    Json,
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde_json::json;

use super::schemas::{ConversationsQuery, SendMessageRequest, StartConversationRequest};
use crate::{
    apex::{state::AppState, utils::VerboseHTTPError},
    auth::schemas::Participant,
};

fn require_self(participant: &Participant, user_id: &str) -> Result<(), VerboseHTTPError> {
    if participant.id != user_id {
        return Err(VerboseHTTPError::Standard(
            StatusCode::FORBIDDEN,
            "Cannot read another participant's conversations".to_string(),
        ));
    }
    Ok(())
}

pub(crate) async fn send_message_endpoint(
    State(state): State<AppState>,
    Extension(participant): Extension<Participant>,
    Json(request): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, VerboseHTTPError> {
    let message = state.messaging.send_message(request, &participant).await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "ok",
            "message": message
        })),
    ))
}

pub(crate) async fn start_conversation_endpoint(
    State(state): State<AppState>,
    Extension(participant): Extension<Participant>,
    Json(request): Json<StartConversationRequest>,
) -> Result<impl IntoResponse, VerboseHTTPError> {
    let conversation = state
        .messaging
        .start_conversation(request, &participant)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "ok",
            "conversation": conversation
        })),
    ))
}

pub(crate) async fn get_conversations_endpoint(
    State(state): State<AppState>,
    Extension(participant): Extension<Participant>,
    Path(user_id): Path<String>,
    Query(query): Query<ConversationsQuery>,
) -> Result<impl IntoResponse, VerboseHTTPError> {
    require_self(&participant, &user_id)?;

    let role = query.role.unwrap_or(participant.role);
    let conversations = state.messaging.get_conversations(&user_id, role).await?;

    Ok(Json(json!({
        "status": "ok",
        "conversations": conversations
    })))
}

pub(crate) async fn get_unread_endpoint(
    State(state): State<AppState>,
    Extension(participant): Extension<Participant>,
    Path(user_id): Path<String>,
    Query(query): Query<ConversationsQuery>,
) -> Result<impl IntoResponse, VerboseHTTPError> {
    require_self(&participant, &user_id)?;

    let role = query.role.unwrap_or(participant.role);
    let unread = state.messaging.unread_total(&user_id, role).await?;

    Ok(Json(json!({
        "status": "ok",
        "unread": unread
    })))
}

pub(crate) async fn get_conversation_endpoint(
    State(state): State<AppState>,
    Extension(participant): Extension<Participant>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, VerboseHTTPError> {
    let conversation = state
        .messaging
        .get_conversation(&conversation_id, &participant.id)
        .await?;

    Ok(Json(json!({
        "status": "ok",
        "conversation": conversation
    })))
}

pub(crate) async fn get_messages_endpoint(
    State(state): State<AppState>,
    Extension(participant): Extension<Participant>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, VerboseHTTPError> {
    state
        .messaging
        .ensure_member(&conversation_id, &participant.id)
        .await?;
    let messages = state.messaging.get_messages(&conversation_id).await?;

    Ok(Json(json!({
        "status": "ok",
        "messages": messages
    })))
}

pub(crate) async fn get_message_days_endpoint(
    State(state): State<AppState>,
    Extension(participant): Extension<Participant>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, VerboseHTTPError> {
    state
        .messaging
        .ensure_member(&conversation_id, &participant.id)
        .await?;
    let days = state.messaging.get_message_days(&conversation_id).await?;

    Ok(Json(json!({
        "status": "ok",
        "days": days
    })))
}

pub(crate) async fn mark_as_read_endpoint(
    State(state): State<AppState>,
    Extension(participant): Extension<Participant>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, VerboseHTTPError> {
    state
        .messaging
        .ensure_member(&conversation_id, &participant.id)
        .await?;
    let marked = state
        .messaging
        .mark_as_read(&conversation_id, &participant.id)
        .await?;

    Ok(Json(json!({
        "status": "ok",
        "marked": marked
    })))
}
