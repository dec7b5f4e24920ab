// Function-call schemas sent with structured requests.
// One schema per structured response shape; the endpoint is asked to call it.

use serde_json::json;

use crate::llm_client::FunctionSchema;

pub const SUGGESTIONS_FUNCTION: &str = "suggest_cv_improvements";
pub const COMPARISON_FUNCTION: &str = "compare_cv_jd";
pub const SKILL_GAP_FUNCTION: &str = "extract_skill_gap";

pub fn suggestions_schema() -> FunctionSchema {
    FunctionSchema {
        name: SUGGESTIONS_FUNCTION.to_string(),
        description: "Return concrete, actionable suggestions for the user's CV or job search"
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "suggestions": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "One suggestion per item, most important first"
                }
            },
            "required": ["suggestions"]
        }),
    }
}

pub fn comparison_schema() -> FunctionSchema {
    FunctionSchema {
        name: COMPARISON_FUNCTION.to_string(),
        description: "Compare the CV with the job description and list matching and missing skills"
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "matches": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Skills or requirements from the JD that the CV covers"
                },
                "gaps": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Skills or requirements from the JD that the CV does not cover"
                }
            },
            "required": ["matches", "gaps"]
        }),
    }
}

pub fn skill_gap_schema() -> FunctionSchema {
    FunctionSchema {
        name: SKILL_GAP_FUNCTION.to_string(),
        description: "List the skills the user should develop for the job, and those they already have"
            .to_string(),
        parameters: json!({
            "type": "object",
            "properties": {
                "missing": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Skills required by the JD that the user lacks"
                },
                "present": {
                    "type": "array",
                    "items": {"type": "string"},
                    "description": "Skills required by the JD that the user already has"
                }
            },
            "required": ["missing", "present"]
        }),
    }
}
