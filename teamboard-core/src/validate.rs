/// Validation of user-typed names and texts. Runs before any store access.
use regex::Regex;
use std::sync::LazyLock;

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("name pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Name cannot be empty")]
    Empty,

    #[error("Name {0:?} contains invalid characters (allowed: letters, digits, underscore)")]
    InvalidCharacters(String),

    #[error("Text cannot be empty")]
    EmptyText,
}

/// Trim a user-supplied name and check it against `[A-Za-z0-9_]+`.
/// Returns the trimmed name.
pub fn validate_name(raw: &str) -> Result<String, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }
    if !NAME_RE.is_match(trimmed) {
        return Err(ValidationError::InvalidCharacters(trimmed.to_string()));
    }
    Ok(trimmed.to_string())
}

/// Free text (todo items) only has to be non-blank. The text itself is kept
/// as typed.
pub fn validate_text(raw: &str) -> Result<&str, ValidationError> {
    if raw.trim().is_empty() {
        Err(ValidationError::EmptyText)
    } else {
        Ok(raw)
    }
}
