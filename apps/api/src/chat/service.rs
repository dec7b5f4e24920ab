//! One conversational turn, end to end: intent → assembly → dispatch →
//! interpretation → history.
//!
//! The session lock is held only while reading or writing session state, never
//! across the dispatch. Each turn reserves a sequence number up front, so history is
//! written in request order even when replies arrive out of order.

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::context::{assemble, effective_query, user_turn_text, AssemblySettings, Profile};
use crate::conversation::{ConversationError, ConversationTurn};
use crate::dispatcher::{DispatchStatus, Dispatcher};
use crate::documents::Attachment;
use crate::interpreter::{interpret, Degradation, StructuredResult};
use crate::quick_actions::{resolve_intent, IntentSpec};

use super::session::SessionHandle;

pub const TEMPORARY_FAILURE_MESSAGE: &str =
    "The assistant is temporarily unavailable. Please try again in a moment.";
pub const CONFIGURATION_FAILURE_MESSAGE: &str =
    "The assistant is not configured correctly. Please contact the administrator.";
pub const TURN_TIMEOUT_MESSAGE: &str =
    "The assistant took too long to answer. Please try again.";
pub const DEGRADED_REPLY_NOTICE: &str =
    "The answer could not be shown in its usual format and is displayed as plain text.";

#[derive(Debug, Clone, Default)]
pub struct TurnRequest {
    pub profile: Profile,
    pub query: Option<String>,
    /// Quick action id; `None` for a free-text message.
    pub action_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TurnReply {
    pub result: StructuredResult,
    pub degradation: Option<Degradation>,
    /// Recoverable problems the user should know about (unreadable files, unknown actions).
    pub notices: Vec<String>,
    pub status: DispatchStatus,
    pub attempts: u32,
    pub batched: bool,
}

/// Non-recoverable turn failures. Messages are safe to show to the user.
#[derive(Debug, Error, PartialEq)]
pub enum TurnError {
    #[error("a message is required")]
    EmptyQuery,

    #[error("the request was cancelled")]
    Cancelled,

    #[error("{0}")]
    Temporary(String),

    #[error("{0}")]
    Configuration(String),
}

#[derive(Clone)]
pub struct ChatService {
    dispatcher: Dispatcher,
    assembly: AssemblySettings,
    turn_timeout: Duration,
}

impl ChatService {
    pub fn new(dispatcher: Dispatcher, assembly: AssemblySettings, turn_timeout: Duration) -> Self {
        Self {
            dispatcher,
            assembly,
            turn_timeout,
        }
    }

    pub fn from_config(dispatcher: Dispatcher, config: &Config) -> Self {
        Self::new(dispatcher, AssemblySettings::from(config), config.turn_timeout)
    }

    pub async fn stage_attachment(&self, session: &SessionHandle, attachment: Attachment) {
        session.lock().await.staged.push(attachment);
    }

    pub async fn history(&self, session: &SessionHandle) -> Vec<ConversationTurn> {
        session.lock().await.conversation.turns().to_vec()
    }

    /// Runs one turn. Recoverable problems are reported in `TurnReply::notices`;
    /// only failures that leave no answer at all are returned as errors.
    ///
    /// A failed or cancelled turn adds nothing to history and keeps its staged
    /// attachments for the next attempt.
    pub async fn run_turn(
        &self,
        session: &SessionHandle,
        request: TurnRequest,
        cancel: CancellationToken,
    ) -> Result<TurnReply, TurnError> {
        let mut notices = Vec::new();
        let intent = match request.action_id.as_deref() {
            Some(action_id) => resolve_intent(action_id).unwrap_or_else(|e| {
                warn!("{e}; falling back to free text");
                notices.push(format!("{e}. Your message was answered as a normal question."));
                IntentSpec::free_text()
            }),
            None => IntentSpec::free_text(),
        };

        let query = effective_query(request.query.as_deref(), &intent);
        if query.is_empty() {
            return Err(TurnError::EmptyQuery);
        }

        let (sequence, envelope, attachments) = {
            let mut guard = session.lock().await;
            let attachments = std::mem::take(&mut guard.staged);
            let sequence = guard.conversation.reserve();
            let envelope = assemble(
                &request.profile,
                &attachments,
                &guard.conversation,
                Some(&query),
                &intent,
                &self.assembly,
            )
            .with_sequence(sequence);
            (sequence, envelope, attachments)
        };

        notices.extend(
            attachments
                .iter()
                .filter_map(|a| a.warning.as_ref().map(|w| format!("{}: {w}", a.name))),
        );

        let turn_cancel = cancel.child_token();
        let deadline = turn_cancel.clone();
        let turn_timeout = self.turn_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = deadline.cancelled() => {}
                _ = tokio::time::sleep(turn_timeout) => deadline.cancel(),
            }
        });
        let _stop_deadline = turn_cancel.clone().drop_guard();

        debug!("Dispatching turn {} ({:?})", sequence.0, intent.shape);
        let outcome = self.dispatcher.dispatch(&envelope, &turn_cancel).await;

        let mut guard = session.lock().await;
        let reply = match (&outcome.status, &outcome.raw_response) {
            (DispatchStatus::Success, Some(raw)) => {
                let interpretation = interpret(raw, envelope.expected_shape);
                if interpretation.is_degraded() {
                    notices.push(DEGRADED_REPLY_NOTICE.to_string());
                }

                let turns = vec![
                    ConversationTurn::user(user_turn_text(&query, &attachments)),
                    ConversationTurn::assistant(interpretation.result.clone()),
                ];
                log_settle(guard.conversation.commit(sequence, turns), sequence.0);

                info!(
                    "Turn {} answered in {} attempt(s) (batched={})",
                    sequence.0, outcome.attempt_count, outcome.batched
                );
                return Ok(TurnReply {
                    result: interpretation.result,
                    degradation: interpretation.degradation,
                    notices,
                    status: outcome.status,
                    attempts: outcome.attempt_count,
                    batched: outcome.batched,
                });
            }
            (DispatchStatus::Cancelled, _) if cancel.is_cancelled() => Err(TurnError::Cancelled),
            (DispatchStatus::Cancelled, _) => {
                warn!("Turn {} exceeded {}s", sequence.0, turn_timeout.as_secs());
                Err(TurnError::Temporary(TURN_TIMEOUT_MESSAGE.to_string()))
            }
            (DispatchStatus::FatalError, _) => {
                error!(
                    "Turn {} failed permanently: {}",
                    sequence.0,
                    outcome.error_detail.as_deref().unwrap_or_default()
                );
                Err(TurnError::Configuration(
                    CONFIGURATION_FAILURE_MESSAGE.to_string(),
                ))
            }
            _ => {
                warn!(
                    "Turn {} failed after {} attempt(s): {}",
                    sequence.0,
                    outcome.attempt_count,
                    outcome.error_detail.as_deref().unwrap_or_default()
                );
                Err(TurnError::Temporary(TEMPORARY_FAILURE_MESSAGE.to_string()))
            }
        };

        log_settle(guard.conversation.release(sequence), sequence.0);
        let mut restored = attachments;
        restored.append(&mut guard.staged);
        guard.staged = restored;
        reply
    }
}

fn log_settle(result: Result<usize, ConversationError>, sequence: u64) {
    match result {
        Ok(0) => debug!("Turn {sequence} queued behind an earlier turn"),
        Ok(_) => {}
        // The session was reset while the turn was in flight.
        Err(e) => debug!("Turn {sequence} not recorded: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use serde_json::json;
    use tokio::sync::Mutex as AsyncMutex;

    use crate::chat::session::ChatSession;
    use crate::config::tests::test_config;
    use crate::conversation::{ConversationState, Role, TurnContent};
    use crate::dispatcher::tests::{settings, ScriptedEndpoint};
    use crate::documents::{AttachmentKind, BuiltinExtractor, DocumentNormalizer, NormalizerLimits};
    use crate::interpreter::DegradationKind;
    use crate::llm_client::{
        EndpointError, MessagePart, ModelEndpoint, ModelReply, ModelRequest,
    };
    use uuid::Uuid;

    const KEYWORDS: [&str; 5] = ["Python", "Django", "PostgreSQL", "Kubernetes", "Rust"];

    /// Compares the CV and JD blocks of a request by keyword, like a very literal recruiter.
    struct KeywordEndpoint {
        requests: Mutex<Vec<ModelRequest>>,
    }

    fn document_block<'a>(parts: &'a [MessagePart], name: &str) -> &'a str {
        parts
            .iter()
            .find_map(|p| match p {
                MessagePart::Text(t) if t.starts_with(&format!("Document: {name}")) => {
                    Some(t.as_str())
                }
                _ => None,
            })
            .unwrap_or_default()
    }

    #[async_trait]
    impl ModelEndpoint for KeywordEndpoint {
        async fn send(&self, request: &ModelRequest) -> Result<ModelReply, EndpointError> {
            self.requests.lock().unwrap().push(request.clone());
            let parts = &request.messages.last().unwrap().parts;
            let cv = document_block(parts, "cv.txt");
            let jd = document_block(parts, "jd.txt");

            let required: Vec<&str> = KEYWORDS.into_iter().filter(|k| jd.contains(k)).collect();
            let matches: Vec<&str> = required.iter().copied().filter(|k| cv.contains(k)).collect();
            let gaps: Vec<&str> = required.iter().copied().filter(|k| !cv.contains(k)).collect();

            Ok(ModelReply::FunctionCall {
                name: request.function.as_ref().unwrap().name.clone(),
                arguments: json!({"matches": matches, "gaps": gaps}).to_string(),
            })
        }
    }

    fn service(endpoint: Arc<dyn ModelEndpoint>, max_attempts: u32) -> ChatService {
        let dispatcher = Dispatcher::new(endpoint, settings(max_attempts));
        ChatService::from_config(dispatcher, &test_config())
    }

    fn session() -> SessionHandle {
        let config = test_config();
        Arc::new(AsyncMutex::new(ChatSession {
            id: Uuid::new_v4(),
            conversation: ConversationState::new(config.conversation_budget),
            staged: Vec::new(),
            created_at: chrono::Utc::now(),
        }))
    }

    fn normalizer() -> DocumentNormalizer {
        DocumentNormalizer::new(
            Arc::new(BuiltinExtractor),
            NormalizerLimits::from(&test_config()),
        )
    }

    fn text_reply(text: &str) -> Result<ModelReply, EndpointError> {
        Ok(ModelReply::Text {
            text: text.to_string(),
        })
    }

    fn free_text(query: &str) -> TurnRequest {
        TurnRequest {
            query: Some(query.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_large_cv_and_jd_comparison_finds_python() {
        let cv = format!(
            "Nguyen Van A\nBackend engineer. Skills: Python, Django, REST APIs.\n{}",
            "Built internal tooling and maintained services. ".repeat(1100)
        );
        assert!(cv.len() > 50_000);
        let jd = "Python Developer\nRequired: Python, Django, PostgreSQL. Nice to have: Kubernetes.";

        let normalizer = normalizer();
        let cv = normalizer
            .normalize("cv.txt", cv.as_bytes(), AttachmentKind::Document, "txt")
            .unwrap();
        assert!(cv.truncated);
        let jd = normalizer
            .normalize("jd.txt", jd.as_bytes(), AttachmentKind::Document, "txt")
            .unwrap();

        let endpoint = Arc::new(KeywordEndpoint {
            requests: Mutex::new(Vec::new()),
        });
        let service = service(endpoint.clone(), 3);
        let session = session();
        service.stage_attachment(&session, cv).await;
        service.stage_attachment(&session, jd).await;

        let reply = service
            .run_turn(
                &session,
                TurnRequest {
                    action_id: Some("compare_cv_jd".to_string()),
                    ..Default::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        match &reply.result {
            StructuredResult::Comparison { matches, gaps } => {
                assert!(matches.contains(&"Python".to_string()));
                assert!(gaps.contains(&"PostgreSQL".to_string()));
            }
            other => panic!("expected a comparison, got {other:?}"),
        }
        assert!(reply.degradation.is_none());
        assert_eq!(reply.attempts, 1);

        let history = service.history(&session).await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::User);
        let user_text = history[0].prompt_text();
        assert!(user_text.contains("[Uploaded: cv.txt, jd.txt]"));
        assert!(!user_text.contains("Built internal tooling"));
        assert!(matches!(history[1].content, TurnContent::Structured(_)));
        assert!(session.lock().await.staged.is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_pdf_turn_completes_with_free_text_and_notice() {
        let normalizer = normalizer();
        let pdf = normalizer
            .normalize(
                "cv.pdf",
                b"\x00\x01 not really a pdf",
                AttachmentKind::Document,
                "pdf",
            )
            .unwrap();
        assert!(pdf.extracted_text.is_none());

        let endpoint = Arc::new(ScriptedEndpoint::new(vec![text_reply(
            "I could not read cv.pdf. Could you upload it as text?",
        )]));
        let service = service(endpoint, 3);
        let session = session();
        service.stage_attachment(&session, pdf).await;

        let reply = service
            .run_turn(&session, free_text("Review my CV"), CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(reply.result, StructuredResult::FreeText { .. }));
        assert!(reply.notices.iter().any(|n| n.starts_with("cv.pdf:")));
        let history = service.history(&session).await;
        assert!(history[0].prompt_text().contains("cv.pdf (unreadable)"));
    }

    #[tokio::test]
    async fn test_unknown_action_falls_back_to_free_text() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![text_reply("Sure!")]));
        let service = service(endpoint, 3);
        let session = session();

        let reply = service
            .run_turn(
                &session,
                TurnRequest {
                    query: Some("Write me a cover letter".to_string()),
                    action_id: Some("cover_letter".to_string()),
                    ..Default::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(reply.result, StructuredResult::free_text("Sure!"));
        assert!(reply.notices[0].contains("cover_letter"));
    }

    #[tokio::test]
    async fn test_malformed_structured_output_degrades_to_free_text() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![Ok(ModelReply::FunctionCall {
            name: "extract_skill_gap".to_string(),
            arguments: r#"{"missing": ["Go"]}"#.to_string(),
        })]));
        let service = service(endpoint, 3);
        let session = session();

        let reply = service
            .run_turn(
                &session,
                TurnRequest {
                    action_id: Some("skill_gap".to_string()),
                    ..Default::default()
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(matches!(reply.result, StructuredResult::FreeText { .. }));
        assert_eq!(
            reply.degradation.map(|d| d.kind),
            Some(DegradationKind::MalformedStructuredOutput)
        );
        assert!(reply.notices.contains(&DEGRADED_REPLY_NOTICE.to_string()));
    }

    #[tokio::test]
    async fn test_free_text_turn_requires_a_query() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![]));
        let service = service(endpoint.clone(), 3);
        let result = service
            .run_turn(&session(), free_text("   "), CancellationToken::new())
            .await;
        assert_eq!(result.unwrap_err(), TurnError::EmptyQuery);
        assert_eq!(endpoint.call_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_is_a_configuration_problem_and_keeps_history_clean() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![Err(EndpointError::Auth {
            status: 401,
            message: "invalid api key sk-123".to_string(),
        })]));
        let service = service(endpoint.clone(), 5);
        let session = session();
        let doc = normalizer()
            .normalize("jd.txt", b"Rust engineer", AttachmentKind::Document, "txt")
            .unwrap();
        service.stage_attachment(&session, doc).await;

        let err = service
            .run_turn(&session, free_text("hello"), CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            TurnError::Configuration(CONFIGURATION_FAILURE_MESSAGE.to_string())
        );
        assert!(!err.to_string().contains("sk-123"));
        assert_eq!(endpoint.call_count(), 1);
        let guard = session.lock().await;
        assert!(guard.conversation.is_empty());
        assert_eq!(guard.staged.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_rate_limits_are_temporary() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            Err(EndpointError::RateLimited("quota".to_string())),
            Err(EndpointError::RateLimited("quota".to_string())),
        ]));
        let service = service(endpoint, 2);
        let err = service
            .run_turn(&session(), free_text("hello"), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TurnError::Temporary(TEMPORARY_FAILURE_MESSAGE.to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_turn_timeout_cancels_retries() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            Err(EndpointError::Server {
                status: 503,
                message: "busy".to_string(),
            }),
            text_reply("too late"),
        ]));
        let mut dispatch_settings = settings(3);
        dispatch_settings.retry.base_delay = Duration::from_secs(120);
        dispatch_settings.retry.max_delay = Duration::from_secs(120);
        let service = ChatService::from_config(
            Dispatcher::new(endpoint.clone(), dispatch_settings),
            &test_config(),
        );

        let err = service
            .run_turn(&session(), free_text("hello"), CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, TurnError::Temporary(TURN_TIMEOUT_MESSAGE.to_string()));
        assert_eq!(endpoint.call_count(), 1);
    }

    #[tokio::test]
    async fn test_user_cancellation_is_reported_as_cancelled() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![text_reply("unused")]));
        let service = service(endpoint.clone(), 3);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = service
            .run_turn(&session(), free_text("hello"), cancel)
            .await
            .unwrap_err();
        assert_eq!(err, TurnError::Cancelled);
        assert_eq!(endpoint.call_count(), 0);
    }

    #[tokio::test]
    async fn test_history_accumulates_in_order() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            text_reply("first answer"),
            text_reply("second answer"),
        ]));
        let service = service(endpoint, 3);
        let session = session();
        for query in ["first", "second"] {
            service
                .run_turn(&session, free_text(query), CancellationToken::new())
                .await
                .unwrap();
        }
        let texts: Vec<String> = service
            .history(&session)
            .await
            .iter()
            .map(|t| t.prompt_text())
            .collect();
        assert_eq!(
            texts,
            vec!["first", "first answer", "second", "second answer"]
        );
    }
}
