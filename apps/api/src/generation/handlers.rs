//! Axum route handlers for the CV generation API.

use axum::{extract::State, Json};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;

use crate::context::Profile;
use crate::errors::AppError;
use crate::generation::generator::{generate_cv, CvDraft};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateCvRequest {
    #[serde(default)]
    pub profile: Profile,
    #[serde(default)]
    pub jd_text: String,
}

/// POST /api/v1/cv/generate
///
/// Drafts a CV from the supplied profile, targeted at `jd_text` (or the profile's JD).
pub async fn handle_generate_cv(
    State(state): State<AppState>,
    Json(request): Json<GenerateCvRequest>,
) -> Result<Json<CvDraft>, AppError> {
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let dispatcher = state.dispatcher.clone();
    let turn_timeout = state.config.turn_timeout;

    let draft = tokio::spawn(async move {
        generate_cv(
            &dispatcher,
            &request.profile,
            &request.jd_text,
            turn_timeout,
            &cancel,
        )
        .await
    })
    .await
    .map_err(|e| AppError::Internal(anyhow::anyhow!("generation task failed: {e}")))?;
    guard.disarm();

    Ok(Json(draft?))
}
