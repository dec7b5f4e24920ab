use axum::{
    extract::{multipart::MultipartError, Multipart, Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::chat::{SessionHandle, TurnReply, TurnRequest};
use crate::context::Profile;
use crate::conversation::ConversationTurn;
use crate::documents::{Attachment, AttachmentKind, SourceFormat};
use crate::errors::AppError;
use crate::state::AppState;

#[derive(Serialize)]
pub struct SessionCreated {
    pub session_id: Uuid,
}

#[derive(Serialize)]
pub struct HistoryResponse {
    pub session_id: Uuid,
    pub turns: Vec<ConversationTurn>,
}

#[derive(Deserialize)]
pub struct MessageRequest {
    pub query: String,
    #[serde(default)]
    pub profile: Profile,
}

#[derive(Deserialize, Default)]
pub struct ActionRequest {
    #[serde(default)]
    pub query: Option<String>,
    #[serde(default)]
    pub profile: Profile,
}

async fn find_session(state: &AppState, id: Uuid) -> Result<SessionHandle, AppError> {
    state
        .sessions
        .get(id)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Session {id} not found")))
}

/// Runs the turn on its own task. If the client goes away the handler future is
/// dropped, which cancels the turn through the drop guard.
async fn run_turn_detached(
    state: &AppState,
    session: SessionHandle,
    request: TurnRequest,
) -> Result<Json<TurnReply>, AppError> {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let chat = state.chat.clone();

    let reply = tokio::spawn(async move { chat.run_turn(&session, request, cancel).await })
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("turn task failed: {e}")))?;
    guard.disarm();

    Ok(Json(reply?))
}

/// POST /api/v1/sessions
pub async fn handle_create_session(
    State(state): State<AppState>,
) -> (StatusCode, Json<SessionCreated>) {
    let session_id = state.sessions.create().await;
    (StatusCode::CREATED, Json(SessionCreated { session_id }))
}

/// DELETE /api/v1/sessions/:id
pub async fn handle_end_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    if state.sessions.end(id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(format!("Session {id} not found")))
    }
}

/// GET /api/v1/sessions/:id/history
pub async fn handle_get_history(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<HistoryResponse>, AppError> {
    let session = find_session(&state, id).await?;
    let turns = state.chat.history(&session).await;
    Ok(Json(HistoryResponse {
        session_id: id,
        turns,
    }))
}

/// POST /api/v1/sessions/:id/attachments
///
/// Multipart fields: `file` (required) and `kind` (`document` or `image`, optional;
/// inferred from the file name or content type when absent).
pub async fn handle_upload_attachment(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Attachment>), AppError> {
    let session = find_session(&state, id).await?;

    let mut file: Option<(String, String, bytes::Bytes)> = None;
    let mut declared_kind: Option<AttachmentKind> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| multipart_error("Invalid multipart body", e))?
    {
        match field.name() {
            Some("file") => {
                let name = field.file_name().unwrap_or("upload").to_string();
                let declared_format = match SourceFormat::from_declared(&name) {
                    Some(_) => name.clone(),
                    None => field.content_type().unwrap_or_default().to_string(),
                };
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| multipart_error("Could not read upload", e))?;
                file = Some((name, declared_format, data));
            }
            Some("kind") => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| multipart_error("Invalid kind field", e))?;
                declared_kind = Some(parse_kind(&text)?);
            }
            _ => {}
        }
    }

    let (name, declared_format, data) =
        file.ok_or_else(|| AppError::Validation("Missing multipart field 'file'".to_string()))?;
    let kind = match declared_kind {
        Some(kind) => kind,
        None => SourceFormat::from_declared(&declared_format)
            .map(|format| format.kind())
            .ok_or_else(|| {
                AppError::UnsupportedMedia(format!("Unsupported file type: {name}"))
            })?,
    };

    let normalizer = state.normalizer.clone();
    let attachment = tokio::task::spawn_blocking(move || {
        normalizer.normalize(&name, &data, kind, &declared_format)
    })
    .await
    .map_err(|e| AppError::Internal(anyhow::anyhow!("normalization task failed: {e}")))??;

    state.chat.stage_attachment(&session, attachment.clone()).await;
    Ok((StatusCode::CREATED, Json(attachment)))
}

/// Body-limit rejections surface as 413; anything else is a malformed request.
fn multipart_error(context: &str, e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(format!("{context}: {}", e.body_text()))
    } else {
        AppError::Validation(format!("{context}: {}", e.body_text()))
    }
}

fn parse_kind(raw: &str) -> Result<AttachmentKind, AppError> {
    match raw.trim().to_lowercase().as_str() {
        "document" => Ok(AttachmentKind::Document),
        "image" => Ok(AttachmentKind::Image),
        other => Err(AppError::Validation(format!(
            "kind must be 'document' or 'image', got '{other}'"
        ))),
    }
}

/// POST /api/v1/sessions/:id/messages
pub async fn handle_send_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<TurnReply>, AppError> {
    let session = find_session(&state, id).await?;
    let request = TurnRequest {
        profile: req.profile,
        query: Some(req.query),
        action_id: None,
    };
    run_turn_detached(&state, session, request).await
}

/// POST /api/v1/sessions/:id/actions/:action_id
///
/// Unknown action ids are answered as free text, with a notice in the reply.
pub async fn handle_quick_action(
    State(state): State<AppState>,
    Path((id, action_id)): Path<(Uuid, String)>,
    body: Option<Json<ActionRequest>>,
) -> Result<Json<TurnReply>, AppError> {
    let session = find_session(&state, id).await?;
    let Json(req) = body.unwrap_or_default();
    let request = TurnRequest {
        profile: req.profile,
        query: req.query,
        action_id: Some(action_id),
    };
    run_turn_detached(&state, session, request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kind() {
        assert_eq!(parse_kind(" Image ").unwrap(), AttachmentKind::Image);
        assert_eq!(parse_kind("document").unwrap(), AttachmentKind::Document);
        assert!(parse_kind("video").is_err());
    }
}
