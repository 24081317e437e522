use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap},
    Json,
};
use parley_common::{CallConfigResponse, CallStatusResponse, StartCallRequest, StartCallResponse};
use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::info;

use crate::auth::{self, AuthUser};
use crate::credentials::CredentialIssuer;
use crate::db::{self, ConversationKind};
use crate::error::ApiError;

pub async fn start_call(
    State(pool): State<SqlitePool>,
    user: AuthUser,
    Json(payload): Json<StartCallRequest>,
) -> Result<Json<StartCallResponse>, ApiError> {
    let conversation = db::get_conversation(&pool, payload.conversation_id)
        .await?
        .ok_or(ApiError::NotFound("conversation"))?;

    if conversation.kind != ConversationKind::Dm {
        return Err(ApiError::bad_request(
            "calls are only supported in direct conversations",
        ));
    }
    if !db::is_participant(&pool, conversation.id, user.user_id).await? {
        return Err(ApiError::Forbidden);
    }
    if db::get_active_call(&pool, conversation.id).await?.is_some() {
        return Err(ApiError::conflict("a call is already active in this conversation"));
    }

    let call = match db::start_call(&pool, conversation.id, user.user_id).await {
        Ok(call) => call,
        // Lost a race with a concurrent start.
        Err(err) if db::is_unique_violation(&err) => {
            return Err(ApiError::conflict("a call is already active in this conversation"))
        }
        Err(err) => return Err(err.into()),
    };

    info!(
        call_id = call.id,
        conversation_id = conversation.id,
        user_id = user.user_id,
        "call started"
    );
    Ok(Json(StartCallResponse {
        call_id: call.id,
        message_id: call.message_id,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(rename = "messageId")]
    message_id: Option<String>,
}

pub async fn call_status(
    State(pool): State<SqlitePool>,
    user: AuthUser,
    Query(query): Query<StatusQuery>,
) -> Result<Json<CallStatusResponse>, ApiError> {
    let message_id = auth::parse_message_id(query.message_id.as_deref())?;
    let Some(call) = db::get_call_by_message_id(&pool, message_id).await? else {
        return Ok(Json(CallStatusResponse { active: false }));
    };
    if !db::is_participant(&pool, call.conversation_id, user.user_id).await? {
        return Err(ApiError::Forbidden);
    }
    Ok(Json(CallStatusResponse {
        active: call.is_active(),
    }))
}

pub async fn call_config(
    State(issuer): State<Arc<CredentialIssuer>>,
    user: AuthUser,
    headers: HeaderMap,
) -> Result<Json<CallConfigResponse>, ApiError> {
    let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
    let config = issuer.issue(Some(&user.token), host)?;
    Ok(Json(config))
}
