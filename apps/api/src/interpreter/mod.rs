//! Response Interpreter: turns raw model replies into typed results the UI can render.
//!
//! `interpret` never fails: anything that does not fit the expected shape degrades
//! to `StructuredResult::FreeText` with a `Degradation` attached.

pub mod schemas;

use std::collections::HashSet;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::warn;

use crate::llm_client::{strip_json_fences, FunctionSchema, ModelReply};

// ────────────────────────────────────────────────────────────────────────────
// Shapes and results
// ────────────────────────────────────────────────────────────────────────────

/// What kind of answer a request expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseShape {
    FreeText,
    StructuredComparison,
    StructuredSkillGap,
    StructuredSuggestions,
}

impl ResponseShape {
    pub fn is_structured(&self) -> bool {
        !matches!(self, ResponseShape::FreeText)
    }

    /// The function the endpoint is asked to call for this shape, if any.
    pub fn function_schema(&self) -> Option<FunctionSchema> {
        match self {
            ResponseShape::FreeText => None,
            ResponseShape::StructuredComparison => Some(schemas::comparison_schema()),
            ResponseShape::StructuredSkillGap => Some(schemas::skill_gap_schema()),
            ResponseShape::StructuredSuggestions => Some(schemas::suggestions_schema()),
        }
    }

    pub fn function_name(&self) -> Option<&'static str> {
        match self {
            ResponseShape::FreeText => None,
            ResponseShape::StructuredComparison => Some(schemas::COMPARISON_FUNCTION),
            ResponseShape::StructuredSkillGap => Some(schemas::SKILL_GAP_FUNCTION),
            ResponseShape::StructuredSuggestions => Some(schemas::SUGGESTIONS_FUNCTION),
        }
    }
}

/// A typed assistant answer. Closed set; the variant always corresponds to a `ResponseShape`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StructuredResult {
    Suggestions { items: Vec<String> },
    Comparison { matches: Vec<String>, gaps: Vec<String> },
    SkillGap { missing: Vec<String>, present: Vec<String> },
    FreeText { text: String },
}

impl StructuredResult {
    pub fn free_text(text: impl Into<String>) -> Self {
        StructuredResult::FreeText { text: text.into() }
    }

    #[cfg(test)]
    pub fn shape(&self) -> ResponseShape {
        match self {
            StructuredResult::Suggestions { .. } => ResponseShape::StructuredSuggestions,
            StructuredResult::Comparison { .. } => ResponseShape::StructuredComparison,
            StructuredResult::SkillGap { .. } => ResponseShape::StructuredSkillGap,
            StructuredResult::FreeText { .. } => ResponseShape::FreeText,
        }
    }

    /// Plain-text rendering used when the result is replayed as conversation history.
    pub fn render_text(&self) -> String {
        match self {
            StructuredResult::Suggestions { items } => bullet_block("Suggestions", items),
            StructuredResult::Comparison { matches, gaps } => format!(
                "{}\n{}",
                bullet_block("Matches", matches),
                bullet_block("Gaps", gaps)
            ),
            StructuredResult::SkillGap { missing, present } => format!(
                "{}\n{}",
                bullet_block("Skills to develop", missing),
                bullet_block("Skills already present", present)
            ),
            StructuredResult::FreeText { text } => text.clone(),
        }
    }
}

fn bullet_block(title: &str, items: &[String]) -> String {
    if items.is_empty() {
        return format!("{title}: none");
    }
    let lines: Vec<String> = items.iter().map(|i| format!("- {i}")).collect();
    format!("{title}:\n{}", lines.join("\n"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationKind {
    /// The function-call payload was missing required fields or was not valid JSON.
    MalformedStructuredOutput,
    /// The reply kind did not match the expected shape (text vs. function call).
    ShapeMismatch,
}

/// Marks a result that was produced despite a recoverable failure.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Degradation {
    pub kind: DegradationKind,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Interpretation {
    pub result: StructuredResult,
    pub degradation: Option<Degradation>,
}

impl Interpretation {
    fn clean(result: StructuredResult) -> Self {
        Self {
            result,
            degradation: None,
        }
    }

    fn degraded(raw: &str, kind: DegradationKind, note: String) -> Self {
        warn!("Degrading model reply to free text ({kind:?}): {note}");
        Self {
            result: StructuredResult::free_text(raw),
            degradation: Some(Degradation { kind, note }),
        }
    }

    pub fn is_degraded(&self) -> bool {
        self.degradation.is_some()
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Function-call payloads (all fields required)
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct SuggestionsPayload {
    suggestions: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ComparisonPayload {
    matches: Vec<String>,
    gaps: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SkillGapPayload {
    missing: Vec<String>,
    present: Vec<String>,
}

// ────────────────────────────────────────────────────────────────────────────
// Interpretation
// ────────────────────────────────────────────────────────────────────────────

/// Interprets a model reply against the shape the request asked for.
pub fn interpret(reply: &ModelReply, shape: ResponseShape) -> Interpretation {
    match (reply, shape) {
        (ModelReply::Text { text }, ResponseShape::FreeText) => {
            Interpretation::clean(StructuredResult::free_text(text.as_str()))
        }
        (ModelReply::FunctionCall { name, arguments }, ResponseShape::FreeText) => {
            Interpretation::degraded(
                arguments,
                DegradationKind::ShapeMismatch,
                format!("expected a text answer but the model called `{name}`"),
            )
        }
        (ModelReply::FunctionCall { name, arguments }, shape) => {
            let expected = shape.function_name().unwrap_or_default();
            if name != expected {
                return Interpretation::degraded(
                    arguments,
                    DegradationKind::ShapeMismatch,
                    format!("expected a call to `{expected}` but the model called `{name}`"),
                );
            }
            match parse_structured(arguments, shape) {
                Ok(result) => Interpretation::clean(result),
                Err(reason) => Interpretation::degraded(
                    arguments,
                    DegradationKind::MalformedStructuredOutput,
                    format!("malformed structured output: {reason}"),
                ),
            }
        }
        // Some models answer a forced function call with JSON in the text body.
        (ModelReply::Text { text }, shape) => match parse_structured(text, shape) {
            Ok(result) => Interpretation::clean(result),
            Err(_) => Interpretation::degraded(
                text,
                DegradationKind::ShapeMismatch,
                "expected structured output but the model answered in plain text".to_string(),
            ),
        },
    }
}

fn parse_structured(raw: &str, shape: ResponseShape) -> Result<StructuredResult, String> {
    let raw = strip_json_fences(raw);
    match shape {
        ResponseShape::StructuredSuggestions => {
            let payload: SuggestionsPayload = parse_payload(raw)?;
            Ok(StructuredResult::Suggestions {
                items: normalize_list(payload.suggestions),
            })
        }
        ResponseShape::StructuredComparison => {
            let payload: ComparisonPayload = parse_payload(raw)?;
            let (matches, gaps) = partition_sets(payload.matches, payload.gaps);
            Ok(StructuredResult::Comparison { matches, gaps })
        }
        ResponseShape::StructuredSkillGap => {
            let payload: SkillGapPayload = parse_payload(raw)?;
            let (present, missing) = partition_sets(payload.present, payload.missing);
            Ok(StructuredResult::SkillGap { missing, present })
        }
        ResponseShape::FreeText => Ok(StructuredResult::free_text(raw)),
    }
}

fn parse_payload<T: DeserializeOwned>(raw: &str) -> Result<T, String> {
    serde_json::from_str(raw).map_err(|e| e.to_string())
}

/// Trims items, drops empties, and removes case-insensitive duplicates (first spelling wins).
pub fn normalize_list(items: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(|i| i.trim().to_string())
        .filter(|i| !i.is_empty())
        .filter(|i| seen.insert(i.to_lowercase()))
        .collect()
}

/// Normalizes both lists; anything in `covered` is removed from `uncovered`.
fn partition_sets(covered: Vec<String>, uncovered: Vec<String>) -> (Vec<String>, Vec<String>) {
    let covered = normalize_list(covered);
    let covered_keys: HashSet<String> = covered.iter().map(|c| c.to_lowercase()).collect();
    let uncovered = normalize_list(uncovered)
        .into_iter()
        .filter(|u| !covered_keys.contains(&u.to_lowercase()))
        .collect();
    (covered, uncovered)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
