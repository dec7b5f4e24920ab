// Quick-Action Controller: a static mapping from action ids to the system
// instructions and the response shape the action expects.

pub mod prompts;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interpreter::ResponseShape;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuickAction {
    CvAdvice,
    JdAnalysis,
    CvJdComparison,
    SkillGap,
}

impl QuickAction {
    pub const ALL: [QuickAction; 4] = [
        QuickAction::CvAdvice,
        QuickAction::JdAnalysis,
        QuickAction::CvJdComparison,
        QuickAction::SkillGap,
    ];

    pub fn id(&self) -> &'static str {
        match self {
            QuickAction::CvAdvice => "cv_advice",
            QuickAction::JdAnalysis => "jd_analysis",
            QuickAction::CvJdComparison => "compare_cv_jd",
            QuickAction::SkillGap => "skill_gap",
        }
    }

    pub fn from_id(id: &str) -> Option<Self> {
        let id = id.trim();
        Self::ALL
            .into_iter()
            .find(|action| action.id().eq_ignore_ascii_case(id))
    }

    pub fn instructions(&self) -> &'static str {
        match self {
            QuickAction::CvAdvice => prompts::CV_ADVICE_SYSTEM,
            QuickAction::JdAnalysis => prompts::JD_ANALYSIS_SYSTEM,
            QuickAction::CvJdComparison => prompts::COMPARISON_SYSTEM,
            QuickAction::SkillGap => prompts::SKILL_GAP_SYSTEM,
        }
    }

    pub fn shape(&self) -> ResponseShape {
        match self {
            QuickAction::CvAdvice | QuickAction::JdAnalysis => ResponseShape::StructuredSuggestions,
            QuickAction::CvJdComparison => ResponseShape::StructuredComparison,
            QuickAction::SkillGap => ResponseShape::StructuredSkillGap,
        }
    }

    /// The user message recorded when the action is triggered without a query.
    pub fn default_query(&self) -> &'static str {
        match self {
            QuickAction::CvAdvice => prompts::CV_ADVICE_QUERY,
            QuickAction::JdAnalysis => prompts::JD_ANALYSIS_QUERY,
            QuickAction::CvJdComparison => prompts::COMPARISON_QUERY,
            QuickAction::SkillGap => prompts::SKILL_GAP_QUERY,
        }
    }
}

/// What the assembler needs to know about the user's intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntentSpec {
    pub action: Option<QuickAction>,
    pub instructions: &'static str,
    pub shape: ResponseShape,
}

impl IntentSpec {
    pub fn free_text() -> Self {
        Self {
            action: None,
            instructions: prompts::ASSISTANT_PREAMBLE,
            shape: ResponseShape::FreeText,
        }
    }
}

impl From<QuickAction> for IntentSpec {
    fn from(action: QuickAction) -> Self {
        Self {
            action: Some(action),
            instructions: action.instructions(),
            shape: action.shape(),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
#[error("unknown quick action '{0}'")]
pub struct UnknownIntent(pub String);

pub fn resolve_intent(action_id: &str) -> Result<IntentSpec, UnknownIntent> {
    QuickAction::from_id(action_id)
        .map(IntentSpec::from)
        .ok_or_else(|| UnknownIntent(action_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_action_resolves_to_its_own_template_and_shape() {
        for action in QuickAction::ALL {
            let intent = resolve_intent(action.id()).unwrap();
            assert_eq!(intent.action, Some(action));
            assert_eq!(intent.shape, action.shape());
            assert!(intent.shape.is_structured());
            assert_eq!(intent.instructions, action.instructions());
        }
    }

    #[test]
    fn test_compare_maps_to_comparison_shape() {
        let intent = resolve_intent("compare_cv_jd").unwrap();
        assert_eq!(intent.shape, ResponseShape::StructuredComparison);
        assert_eq!(
            resolve_intent("skill_gap").unwrap().shape,
            ResponseShape::StructuredSkillGap
        );
    }

    #[test]
    fn test_ids_are_trimmed_and_case_insensitive() {
        assert_eq!(
            resolve_intent("  CV_Advice ").unwrap().action,
            Some(QuickAction::CvAdvice)
        );
    }

    #[test]
    fn test_unknown_id_is_reported() {
        assert_eq!(
            resolve_intent("write_cover_letter"),
            Err(UnknownIntent("write_cover_letter".to_string()))
        );
    }

    #[test]
    fn test_free_text_intent_uses_the_assistant_preamble() {
        let intent = IntentSpec::free_text();
        assert_eq!(intent.action, None);
        assert_eq!(intent.shape, ResponseShape::FreeText);
        assert_eq!(intent.instructions, prompts::ASSISTANT_PREAMBLE);
    }
}
