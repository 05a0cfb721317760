//! Input validation and sanitization
//!
//! Every validator returns `None` on success or a [`ValidationError`] naming
//! the offending field, so handlers can collect all problems with
//! [`batch_validate`] and answer with a single 400.
//!
//! The sanitizer is defense in depth for free text that ends up in tenant
//! records. It does not replace output encoding in whatever renders the data.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;

/// Hard ceiling applied by the sanitizer regardless of the caller's limit
pub const MAX_SANITIZED_LENGTH: usize = 10_000;

#[allow(clippy::expect_used)] // Static patterns, covered by tests
static EMAIL_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@<>]+@[^\s@<>]+\.[^\s@<>.]{2,}$").expect("valid email pattern")
});

#[allow(clippy::expect_used)]
static UUID_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$")
        .expect("valid uuid pattern")
});

#[allow(clippy::expect_used)]
static SCRIPT_SCHEME_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)javascript\s*:").expect("valid scheme pattern"));

#[allow(clippy::expect_used)]
static EVENT_HANDLER_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bon[a-z]+\s*=").expect("valid handler pattern"));

/// A single failed check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

pub fn validate_email(field: &str, value: &str) -> Option<ValidationError> {
    if value.len() > 254 {
        return Some(ValidationError::new(field, "must be at most 254 characters"));
    }
    if !EMAIL_PATTERN.is_match(value) {
        return Some(ValidationError::new(field, "must be a valid email address"));
    }
    None
}

/// Length bounds are counted in characters, not bytes
pub fn validate_string_length(
    field: &str,
    value: &str,
    min: usize,
    max: usize,
) -> Option<ValidationError> {
    let len = value.trim().chars().count();
    if len < min {
        return Some(ValidationError::new(
            field,
            format!("must be at least {} characters", min),
        ));
    }
    if len > max {
        return Some(ValidationError::new(
            field,
            format!("must be at most {} characters", max),
        ));
    }
    None
}

pub fn validate_uuid(field: &str, value: &str) -> Option<ValidationError> {
    if UUID_PATTERN.is_match(value) {
        None
    } else {
        Some(ValidationError::new(field, "must be a valid UUID"))
    }
}

pub fn validate_amount(field: &str, amount: f64, max: f64) -> Option<ValidationError> {
    if !amount.is_finite() {
        return Some(ValidationError::new(field, "must be a finite number"));
    }
    if amount < 0.0 {
        return Some(ValidationError::new(field, "must not be negative"));
    }
    if amount > max {
        return Some(ValidationError::new(
            field,
            format!("must be at most {}", max),
        ));
    }
    None
}

pub fn validate_items<T>(field: &str, items: &[T], max_items: usize) -> Option<ValidationError> {
    if items.is_empty() {
        return Some(ValidationError::new(field, "must contain at least one item"));
    }
    if items.len() > max_items {
        return Some(ValidationError::new(
            field,
            format!("must contain at most {} items", max_items),
        ));
    }
    None
}

/// Collect every failed check. `Ok(())` when all passed.
pub fn batch_validate<I>(checks: I) -> Result<(), Vec<ValidationError>>
where
    I: IntoIterator<Item = Option<ValidationError>>,
{
    let errors: Vec<ValidationError> = checks.into_iter().flatten().collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

/// Strip markup-ish content from free text and bound its length.
///
/// Removes angle brackets, `javascript:` schemes and inline `on<event>=`
/// handlers, trims, then truncates to `min(max_len, MAX_SANITIZED_LENGTH)`
/// characters.
pub fn sanitize_string(input: &str, max_len: usize) -> String {
    let mut cleaned: String = input.chars().filter(|c| *c != '<' && *c != '>').collect();

    // Removal can splice a new match together ("javajavascript:script:"), repeat until stable
    loop {
        let next = EVENT_HANDLER_PATTERN
            .replace_all(&SCRIPT_SCHEME_PATTERN.replace_all(&cleaned, ""), "")
            .into_owned();
        if next == cleaned {
            break;
        }
        cleaned = next;
    }

    let limit = max_len.min(MAX_SANITIZED_LENGTH);
    cleaned.trim().chars().take(limit).collect()
}

/// Apply [`sanitize_string`] to every string leaf of a JSON document
pub fn sanitize_json(value: &serde_json::Value, max_len: usize) -> serde_json::Value {
    use serde_json::Value;

    match value {
        Value::String(s) => Value::String(sanitize_string(s, max_len)),
        Value::Array(items) => Value::Array(items.iter().map(|v| sanitize_json(v, max_len)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (sanitize_string(k, 128), sanitize_json(v, max_len)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_validation() {
        assert!(validate_email("email", "ana@example.com").is_none());
        assert!(validate_email("email", "ana.maria+loja@sub.example.com.br").is_none());
        assert!(validate_email("email", "not-an-email").is_some());
        assert!(validate_email("email", "a@b").is_some());
        assert!(validate_email("email", "a b@example.com").is_some());
        assert!(validate_email("email", "<a>@example.com").is_some());
    }

    #[test]
    fn test_string_length_counts_chars() {
        assert!(validate_string_length("name", "João", 1, 4).is_none());
        assert!(validate_string_length("name", "   ", 1, 10).is_some());
        let err = validate_string_length("name", "abcdef", 1, 5).unwrap();
        assert_eq!(err.field, "name");
        assert_eq!(err.message, "must be at most 5 characters");
    }

    #[test]
    fn test_uuid_shape() {
        assert!(validate_uuid("id", "3f2b8c1e-9a4d-4e6f-8b2a-1c3d5e7f9a0b").is_none());
        assert!(validate_uuid("id", "3F2B8C1E-9A4D-4E6F-8B2A-1C3D5E7F9A0B").is_none());
        assert!(validate_uuid("id", "3f2b8c1e9a4d4e6f8b2a1c3d5e7f9a0b").is_some());
        assert!(validate_uuid("id", "O1").is_some());
    }

    #[test]
    fn test_amount_bounds() {
        assert!(validate_amount("total", 0.0, 1000.0).is_none());
        assert!(validate_amount("total", 1000.0, 1000.0).is_none());
        assert!(validate_amount("total", -0.01, 1000.0).is_some());
        assert!(validate_amount("total", 1000.01, 1000.0).is_some());
        assert!(validate_amount("total", f64::NAN, 1000.0).is_some());
        assert!(validate_amount("total", f64::INFINITY, 1000.0).is_some());
    }

    #[test]
    fn test_items_bounds() {
        let empty: Vec<u8> = vec![];
        assert!(validate_items("items", &empty, 10).is_some());
        assert!(validate_items("items", &[1, 2, 3], 3).is_none());
        assert!(validate_items("items", &[1, 2, 3, 4], 3).is_some());
    }

    #[test]
    fn test_batch_validate_collects_all_failures() {
        let result = batch_validate([
            validate_email("email", "bad"),
            validate_string_length("name", "ok", 1, 10),
            validate_amount("total", -1.0, 10.0),
        ]);
        let errors = result.unwrap_err();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].field, "email");
        assert_eq!(errors[1].field, "total");

        assert!(batch_validate([None, None]).is_ok());
    }

    #[test]
    fn test_sanitize_strips_markup() {
        assert_eq!(sanitize_string("<b>bold</b>", 100), "bbold/b");
        assert_eq!(sanitize_string("JavaScript:alert(1)", 100), "alert(1)");
        assert_eq!(sanitize_string("img onerror=alert(1)", 100), "img alert(1)");
        assert_eq!(sanitize_string("  plain text  ", 100), "plain text");
    }

    #[test]
    fn test_sanitize_handles_spliced_patterns() {
        assert_eq!(sanitize_string("javajavascript:script:go", 100), "go");
    }

    #[test]
    fn test_sanitize_truncates_on_char_boundary() {
        assert_eq!(sanitize_string("ééééé", 3), "ééé");
        let long = "a".repeat(MAX_SANITIZED_LENGTH + 50);
        assert_eq!(sanitize_string(&long, usize::MAX).len(), MAX_SANITIZED_LENGTH);
    }

    #[test]
    fn test_sanitize_json_leaves() {
        let value = serde_json::json!({
            "descricao": "<script>x</script>",
            "valor": 10.5,
            "tags": ["ok", "onclick=boom"],
        });
        let cleaned = sanitize_json(&value, 100);
        assert_eq!(cleaned["descricao"], "scriptx/script");
        assert_eq!(cleaned["valor"], 10.5);
        assert_eq!(cleaned["tags"][1], "boom");
    }
}
