//! Context Assembler: builds the `RequestEnvelope` for one dispatch from the profile,
//! the staged attachments, the conversation history and the user's query.
//!
//! Assembly is a pure function of its inputs. Nothing here reads the clock or any
//! shared state, so identical inputs always produce identical envelopes.

pub mod models;
pub mod prompts;

use crate::config::Config;
use crate::conversation::{ConversationState, ConversationTurn, Role, Sequence, TurnBudget};
use crate::documents::{Attachment, AttachmentKind};
use crate::interpreter::ResponseShape;
use crate::llm_client::prompts::{language_instruction, FUNCTION_CALL_INSTRUCTION};
use crate::llm_client::{FunctionSchema, MessagePart, ModelMessage, ModelRequest, Sampling, CHAT_SAMPLING};
use crate::quick_actions::IntentSpec;

pub use models::Profile;

/// Everything one dispatch needs. Built fresh per request and never mutated once sent.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub system_instructions: String,
    /// History suffix, oldest first.
    pub context_turns: Vec<ConversationTurn>,
    pub user_content: Vec<MessagePart>,
    pub expected_shape: ResponseShape,
    pub function: Option<FunctionSchema>,
    pub sampling: Sampling,
    /// Ordering ticket of the session request this envelope belongs to.
    pub sequence: Option<Sequence>,
}

impl RequestEnvelope {
    pub fn with_sequence(mut self, sequence: Sequence) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn has_images(&self) -> bool {
        self.user_content
            .iter()
            .any(|part| matches!(part, MessagePart::Image { .. }))
    }

    pub fn to_model_request(&self) -> ModelRequest {
        let mut messages: Vec<ModelMessage> = self
            .context_turns
            .iter()
            .map(|turn| ModelMessage::text(turn.role, turn.prompt_text()))
            .collect();
        messages.push(ModelMessage {
            role: Role::User,
            parts: self.user_content.clone(),
        });

        ModelRequest {
            system: self.system_instructions.clone(),
            messages,
            function: self.function.clone(),
            sampling: self.sampling,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AssemblySettings {
    /// Bound on the history suffix carried by each request.
    pub context_budget: TurnBudget,
    pub reply_language: String,
}

impl From<&Config> for AssemblySettings {
    fn from(config: &Config) -> Self {
        Self {
            context_budget: config.context_budget,
            reply_language: config.reply_language.clone(),
        }
    }
}

/// Builds the envelope for one turn.
///
/// A blank `query` falls back to the quick action's default query. Free-text turns
/// are expected to carry a query; the caller validates that.
pub fn assemble(
    profile: &Profile,
    attachments: &[Attachment],
    state: &ConversationState,
    query: Option<&str>,
    intent: &IntentSpec,
    settings: &AssemblySettings,
) -> RequestEnvelope {
    let mut user_content: Vec<MessagePart> = attachments.iter().flat_map(attachment_parts).collect();
    user_content.push(MessagePart::Text(effective_query(query, intent)));

    RequestEnvelope {
        system_instructions: system_block(profile, intent, &settings.reply_language),
        context_turns: state.current_suffix(settings.context_budget),
        user_content,
        expected_shape: intent.shape,
        function: intent.shape.function_schema(),
        sampling: CHAT_SAMPLING,
        sequence: None,
    }
}

/// The query actually sent: the caller's text, or the action's default when blank.
pub fn effective_query(query: Option<&str>, intent: &IntentSpec) -> String {
    match (query.map(str::trim).filter(|q| !q.is_empty()), intent.action) {
        (Some(query), _) => query.to_string(),
        (None, Some(action)) => action.default_query().to_string(),
        (None, None) => String::new(),
    }
}

fn system_block(profile: &Profile, intent: &IntentSpec, language: &str) -> String {
    let mut block = format!("{}\n\n{}", intent.instructions, language_instruction(language));
    if intent.shape.is_structured() {
        block.push_str("\n\n");
        block.push_str(FUNCTION_CALL_INSTRUCTION);
    }
    if let Some(profile_block) = profile_block(profile) {
        block.push_str("\n\n");
        block.push_str(&profile_block);
    }
    block
}

/// Profile lines, one per field that is present. `None` when the profile is empty.
pub fn profile_block(profile: &Profile) -> Option<String> {
    if profile.is_empty() {
        return None;
    }

    let mut lines = vec![prompts::PROFILE_HEADER.to_string()];
    if let Some(name) = profile.full_name() {
        lines.push(format!("- {}: {name}", prompts::NAME_LABEL));
    }
    for (label, items) in [
        (prompts::SKILLS_LABEL, &profile.skills),
        (prompts::EXPERIENCE_LABEL, &profile.experiences),
        (prompts::PROJECTS_LABEL, &profile.projects),
    ] {
        let items = models::present(items);
        if !items.is_empty() {
            lines.push(format!("- {label}: {}", items.join(", ")));
        }
    }
    if let Some(jd) = profile.jd_text() {
        lines.push(format!("- {}: {}", prompts::JD_LABEL, jd_excerpt(jd)));
    }
    Some(lines.join("\n"))
}

fn jd_excerpt(jd: &str) -> String {
    let excerpt: String = jd.chars().take(prompts::JD_EXCERPT_CHARS).collect();
    format!("{excerpt}...")
}

fn attachment_parts(attachment: &Attachment) -> Vec<MessagePart> {
    let label = attachment.source_format.label();
    match (attachment.kind, &attachment.extracted_text, &attachment.image) {
        (AttachmentKind::Document, Some(text), _) => vec![MessagePart::Text(format!(
            "Document: {} ({label})\n{text}",
            attachment.name
        ))],
        (AttachmentKind::Image, _, Some(data)) => vec![
            MessagePart::Text(format!("Image: {} ({label})", attachment.name)),
            MessagePart::Image {
                media_type: attachment.source_format.media_type().to_string(),
                data: data.clone(),
            },
        ],
        (AttachmentKind::Document, None, _) => vec![MessagePart::Text(format!(
            "Document: {} ({label})\n{}",
            attachment.name,
            prompts::UNREADABLE_DOCUMENT
        ))],
        (AttachmentKind::Image, _, None) => vec![MessagePart::Text(format!(
            "Image: {} ({label})\n{}",
            attachment.name,
            prompts::UNREADABLE_IMAGE
        ))],
    }
}

/// The user turn stored in history: the query plus the names of uploaded files.
/// Attachment content itself is never stored.
pub fn user_turn_text(query: &str, attachments: &[Attachment]) -> String {
    if attachments.is_empty() {
        return query.to_string();
    }
    let names: Vec<String> = attachments
        .iter()
        .map(|a| {
            if a.is_unreadable() {
                format!("{} {}", a.name, prompts::UNREADABLE_MARK)
            } else {
                a.name.clone()
            }
        })
        .collect();
    format!("{query}\n[{} {}]", prompts::UPLOAD_NOTE_PREFIX, names.join(", "))
}
