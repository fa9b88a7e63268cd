//! Prompt validation.

use crate::error::{DomainError, DomainResult};

/// Longest prompt accepted, in characters.
pub const MAX_PROMPT_CHARS: usize = 1000;

/// Validate a prompt before it is sent to the synthesis adapter.
///
/// A prompt that fails here is a permanent fault: no remote call is made.
pub fn validate_prompt(prompt: &str) -> DomainResult<&str> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Err(DomainError::validation("prompt is empty"));
    }

    let len = trimmed.chars().count();
    if len > MAX_PROMPT_CHARS {
        return Err(DomainError::validation(format!(
            "prompt is {len} characters; limit is {MAX_PROMPT_CHARS}"
        )));
    }

    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_prompt_at_limit() {
        let prompt = "a".repeat(MAX_PROMPT_CHARS);
        assert_eq!(validate_prompt(&prompt).unwrap().len(), MAX_PROMPT_CHARS);
        assert_eq!(validate_prompt("  a red fox  ").unwrap(), "a red fox");
    }

    #[test]
    fn rejects_empty_and_oversized_prompts() {
        assert!(matches!(validate_prompt("   "), Err(DomainError::Validation(_))));

        let prompt = "ü".repeat(MAX_PROMPT_CHARS + 1);
        let err = validate_prompt(&prompt).unwrap_err();
        assert!(err.to_string().contains("limit is 1000"));
    }
}
