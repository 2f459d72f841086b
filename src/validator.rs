//! Response assertions.
//!
//! Every check either returns `Ok(())` or fails with
//! [`Error::ValidationFailed`] describing expected vs actual. Checks that
//! look at several things (fields, array items) report every problem, not
//! just the first.

use std::fmt;
use std::time::Duration;

use serde_json::Value;

use crate::api::ApiResponse;
use crate::error::{Error, Result};

/// JSON type expected for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JsonKind {
    String,
    Number,
    /// A number with no fractional part.
    Integer,
    Boolean,
    Array,
    Object,
    Null,
    /// Any type; only presence is checked.
    Any,
}

impl JsonKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            JsonKind::String => value.is_string(),
            JsonKind::Number => value.is_number(),
            JsonKind::Integer => value.is_i64() || value.is_u64(),
            JsonKind::Boolean => value.is_boolean(),
            JsonKind::Array => value.is_array(),
            JsonKind::Object => value.is_object(),
            JsonKind::Null => value.is_null(),
            JsonKind::Any => true,
        }
    }

    fn of(value: &Value) -> JsonKind {
        match value {
            Value::Null => JsonKind::Null,
            Value::Bool(_) => JsonKind::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => JsonKind::Integer,
            Value::Number(_) => JsonKind::Number,
            Value::String(_) => JsonKind::String,
            Value::Array(_) => JsonKind::Array,
            Value::Object(_) => JsonKind::Object,
        }
    }
}

impl fmt::Display for JsonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JsonKind::String => "string",
            JsonKind::Number => "number",
            JsonKind::Integer => "integer",
            JsonKind::Boolean => "boolean",
            JsonKind::Array => "array",
            JsonKind::Object => "object",
            JsonKind::Null => "null",
            JsonKind::Any => "any",
        };
        write!(f, "{}", name)
    }
}

/// Rule for one object field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldRule {
    pub name: String,
    pub kind: JsonKind,
    pub required: bool,
}

/// Field rules for one entity shape.
///
/// Domain validators are built by composing rules, e.g.
/// `EntityRules::user().required("role", JsonKind::String)`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityRules {
    rules: Vec<FieldRule>,
}

impl EntityRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Field must be present and of `kind`.
    pub fn required(mut self, name: impl Into<String>, kind: JsonKind) -> Self {
        self.push(name.into(), kind, true);
        self
    }

    /// Field may be absent or null; if present it must be of `kind`.
    pub fn optional(mut self, name: impl Into<String>, kind: JsonKind) -> Self {
        self.push(name.into(), kind, false);
        self
    }

    fn push(&mut self, name: String, kind: JsonKind, required: bool) {
        self.rules.retain(|r| r.name != name);
        self.rules.push(FieldRule { name, kind, required });
    }

    pub fn rules(&self) -> &[FieldRule] {
        &self.rules
    }

    /// Checks `value` against every rule.
    pub fn validate(&self, value: &Value) -> Result<()> {
        ResponseValidator::validate_fields(value, &self.rules)
    }

    /// `id` and `name` required; contact fields optional.
    pub fn user() -> Self {
        Self::new()
            .required("id", JsonKind::Integer)
            .required("name", JsonKind::String)
            .optional("username", JsonKind::String)
            .optional("email", JsonKind::String)
            .optional("phone", JsonKind::String)
            .optional("website", JsonKind::String)
    }

    pub fn post() -> Self {
        Self::new()
            .required("id", JsonKind::Integer)
            .required("title", JsonKind::String)
            .required("body", JsonKind::String)
            .optional("userId", JsonKind::Integer)
    }

    pub fn comment() -> Self {
        Self::new()
            .required("id", JsonKind::Integer)
            .required("body", JsonKind::String)
            .optional("postId", JsonKind::Integer)
            .optional("name", JsonKind::String)
            .optional("email", JsonKind::String)
    }

    pub fn todo() -> Self {
        Self::new()
            .required("id", JsonKind::Integer)
            .required("title", JsonKind::String)
            .required("completed", JsonKind::Boolean)
            .optional("userId", JsonKind::Integer)
    }
}

/// Stateless response checks.
pub struct ResponseValidator;

impl ResponseValidator {
    /// Status must equal `expected` exactly.
    pub fn validate_status_code<T>(response: &ApiResponse<T>, expected: u16) -> Result<()> {
        if response.status == expected {
            Ok(())
        } else {
            fail(format!(
                "expected status {}, got {} (body: {})",
                expected,
                response.status,
                truncate(&response.raw_body, 200)
            ))
        }
    }

    /// Status must be 2xx.
    pub fn validate_success<T>(response: &ApiResponse<T>) -> Result<()> {
        if response.is_success() {
            Ok(())
        } else {
            fail(format!("expected 2xx status, got {}", response.status))
        }
    }

    /// `Content-Type` must start with `expected_mime`; parameters such as
    /// charset are ignored.
    pub fn validate_content_type<T>(response: &ApiResponse<T>, expected_mime: &str) -> Result<()> {
        match response.content_type() {
            Some(actual) if actual.to_ascii_lowercase().starts_with(&expected_mime.to_ascii_lowercase()) => {
                Ok(())
            }
            Some(actual) => fail(format!(
                "expected content type '{}', got '{}'",
                expected_mime, actual
            )),
            None => fail(format!(
                "expected content type '{}', got no Content-Type header",
                expected_mime
            )),
        }
    }

    /// Header `name` must be present.
    pub fn validate_header_present<T>(response: &ApiResponse<T>, name: &str) -> Result<()> {
        if response.headers.contains_key(name) {
            Ok(())
        } else {
            fail(format!("expected header '{}' to be present", name))
        }
    }

    /// Response must have arrived within `max`.
    pub fn validate_response_time<T>(response: &ApiResponse<T>, max: Duration) -> Result<()> {
        if response.elapsed <= max {
            Ok(())
        } else {
            fail(format!(
                "expected response within {} ms, took {} ms",
                max.as_millis(),
                response.elapsed.as_millis()
            ))
        }
    }

    /// Checks each rule against an object and reports all mismatches.
    pub fn validate_fields(value: &Value, rules: &[FieldRule]) -> Result<()> {
        let object = match value.as_object() {
            Some(object) => object,
            None => return fail(format!("expected object, got {}", JsonKind::of(value))),
        };

        let mut problems = Vec::new();
        for rule in rules {
            match object.get(&rule.name) {
                None if rule.required => {
                    problems.push(format!("field '{}': missing (expected {})", rule.name, rule.kind));
                }
                None => {}
                Some(Value::Null) if !rule.required && rule.kind != JsonKind::Null => {}
                Some(field) if !rule.kind.matches(field) => problems.push(format!(
                    "field '{}': expected {}, got {}",
                    rule.name,
                    rule.kind,
                    JsonKind::of(field)
                )),
                Some(_) => {}
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            fail(problems.join("; "))
        }
    }

    pub fn validate_user(value: &Value) -> Result<()> {
        EntityRules::user().validate(value)
    }

    pub fn validate_post(value: &Value) -> Result<()> {
        EntityRules::post().validate(value)
    }

    pub fn validate_comment(value: &Value) -> Result<()> {
        EntityRules::comment().validate(value)
    }

    pub fn validate_todo(value: &Value) -> Result<()> {
        EntityRules::todo().validate(value)
    }

    /// `data` must be an array with length in `[min, max]` inclusive, and
    /// every element must pass `item_validator`.
    ///
    /// All failing elements are reported with their index.
    pub fn validate_array_response<F>(data: &Value, min: usize, max: usize, item_validator: F) -> Result<()>
    where
        F: Fn(&Value) -> Result<()>,
    {
        let items = match data.as_array() {
            Some(items) => items,
            None => return fail(format!("expected array, got {}", JsonKind::of(data))),
        };

        if items.len() < min || items.len() > max {
            return fail(format!(
                "expected array length in [{}, {}], got {}",
                min,
                max,
                items.len()
            ));
        }

        let failures: Vec<String> = items
            .iter()
            .enumerate()
            .filter_map(|(index, item)| {
                item_validator(item)
                    .err()
                    .map(|e| format!("[{}] {}", index, describe(&e)))
            })
            .collect();

        if failures.is_empty() {
            Ok(())
        } else {
            fail(format!(
                "{} of {} items failed: {}",
                failures.len(),
                items.len(),
                failures.join("; ")
            ))
        }
    }
}

fn fail(message: String) -> Result<()> {
    Err(Error::ValidationFailed(message))
}

fn describe(error: &Error) -> String {
    match error {
        Error::ValidationFailed(message) => message.clone(),
        other => other.to_string(),
    }
}

fn truncate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        let head: String = text.chars().take(max_chars).collect();
        format!("{}...", head)
    }
}
