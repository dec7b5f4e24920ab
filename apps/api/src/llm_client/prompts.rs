// Shared prompt constants and prompt-building utilities.
// Each module that talks to the model defines its own prompts.rs alongside it.
// This file contains cross-cutting prompt fragments.

/// Instruction that pins the reply language.
pub fn language_instruction(language: &str) -> String {
    format!(
        "Always answer in {language}, in a friendly and helpful tone, \
        even when the uploaded documents are written in another language."
    )
}

/// Instruction appended whenever the model is asked to call a function.
pub const FUNCTION_CALL_INSTRUCTION: &str = "\
    Answer by calling the provided function. \
    Fill every required field; use an empty list when nothing applies. \
    Keep each list item short: a skill, requirement or single actionable sentence.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_language_instruction_names_the_language() {
        let instruction = language_instruction("Vietnamese");
        assert!(instruction.starts_with("Always answer in Vietnamese"));
    }
}
