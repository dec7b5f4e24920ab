//! CV generation: one model call that turns a profile and a job description into a
//! draft CV.
//!
//! Flow: validate → build request (system prompt, few-shot example, JSON payload) →
//!       dispatch → return the text.
//!
//! The draft is free text and is never appended to a conversation.

use std::time::Duration;

use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::chat::service::{
    CONFIGURATION_FAILURE_MESSAGE, TEMPORARY_FAILURE_MESSAGE, TURN_TIMEOUT_MESSAGE,
};
use crate::chat::TurnError;
use crate::context::models::{present, Profile};
use crate::conversation::Role;
use crate::dispatcher::{DispatchStatus, Dispatcher};
use crate::generation::prompts::{FEW_SHOT_EXAMPLE, GENERATION_SYSTEM};
use crate::llm_client::{ModelMessage, ModelRequest, GENERATION_SAMPLING};

#[derive(Debug, Clone, Serialize)]
pub struct CvDraft {
    pub content: String,
    pub attempts: u32,
}

/// Builds the generation request. Blank profile entries are left out of the payload.
pub fn build_request(profile: &Profile, jd_text: &str) -> ModelRequest {
    let payload = json!({
        "user_profile": {
            "full_name": profile.full_name(),
            "skills": present(&profile.skills),
            "experiences": present(&profile.experiences),
            "projects": present(&profile.projects),
        },
        "job_description": { "text": jd_text.trim() },
    });
    let payload = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());

    ModelRequest {
        system: GENERATION_SYSTEM.to_string(),
        messages: vec![
            ModelMessage::text(Role::User, FEW_SHOT_EXAMPLE),
            ModelMessage::text(Role::User, payload),
        ],
        function: None,
        sampling: GENERATION_SAMPLING,
    }
}

/// Drafts a CV for `profile`, targeted at `jd_text` when one is given.
///
/// The job description falls back to the profile's own when `jd_text` is blank.
/// Fails with `EmptyQuery` when there is nothing to write about. The whole call,
/// retries included, is bounded by `turn_timeout`.
pub async fn generate_cv(
    dispatcher: &Dispatcher,
    profile: &Profile,
    jd_text: &str,
    turn_timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CvDraft, TurnError> {
    let jd_text = match jd_text.trim() {
        "" => profile.jd_text().unwrap_or_default(),
        text => text,
    };
    if profile.is_empty() && jd_text.is_empty() {
        return Err(TurnError::EmptyQuery);
    }

    info!(
        "Generating CV ({} skills, jd {} chars)",
        present(&profile.skills).len(),
        jd_text.chars().count()
    );
    let request = build_request(profile, jd_text);

    let bounded = cancel.child_token();
    let deadline = bounded.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = deadline.cancelled() => {}
            _ = tokio::time::sleep(turn_timeout) => deadline.cancel(),
        }
    });
    let _stop_deadline = bounded.clone().drop_guard();

    let outcome = dispatcher.dispatch_request(&request, &bounded).await;

    match (outcome.status, outcome.raw_response) {
        (DispatchStatus::Success, Some(reply)) => {
            info!("CV generated in {} attempt(s)", outcome.attempt_count);
            Ok(CvDraft {
                content: reply.raw_text().trim().to_string(),
                attempts: outcome.attempt_count,
            })
        }
        (DispatchStatus::Cancelled, _) if cancel.is_cancelled() => Err(TurnError::Cancelled),
        (DispatchStatus::Cancelled, _) => {
            warn!("CV generation exceeded {}s", turn_timeout.as_secs());
            Err(TurnError::Temporary(TURN_TIMEOUT_MESSAGE.to_string()))
        }
        (DispatchStatus::FatalError, _) => {
            error!(
                "CV generation failed permanently: {}",
                outcome.error_detail.unwrap_or_default()
            );
            Err(TurnError::Configuration(
                CONFIGURATION_FAILURE_MESSAGE.to_string(),
            ))
        }
        (status, _) => {
            warn!(
                "CV generation failed after {} attempt(s) ({:?}): {}",
                outcome.attempt_count,
                status,
                outcome.error_detail.unwrap_or_default()
            );
            Err(TurnError::Temporary(TEMPORARY_FAILURE_MESSAGE.to_string()))
        }
    }
}
