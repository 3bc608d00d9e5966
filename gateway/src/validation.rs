//! Inbound request validation.
//!
//! Pure functions from an untyped JSON body to a validated
//! [`InferenceRequest`]. Nothing here touches the rate limiter or the
//! provider.

use inference_gateway_common::{ChatMessage, GenerationParameters, InferenceRequest, Role};
use serde_json::{Map, Value};

use crate::config::Config;

const KNOWN_FIELDS: [&str; 6] = ["prompt", "messages", "max_tokens", "temperature", "top_p", "stream"];
const MESSAGE_FIELDS: [&str; 2] = ["role", "content"];

/// Bounds applied to every request.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationLimits {
    pub max_prompt_length: usize,
    pub max_tokens_limit: u32,
    pub default_max_tokens: u32,
    pub default_temperature: f32,
}

impl From<&Config> for ValidationLimits {
    fn from(config: &Config) -> Self {
        Self {
            max_prompt_length: config.max_prompt_length,
            max_tokens_limit: config.max_tokens_limit,
            default_max_tokens: config.default_max_tokens,
            default_temperature: config.default_temperature,
        }
    }
}

impl Default for ValidationLimits {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

/// Why a request was refused before admission.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("request body is not valid JSON: {0}")]
    MalformedJson(String),
    #[error("request body must be a JSON object")]
    NotAnObject,
    #[error("unknown field: {0}")]
    UnknownField(String),
    #[error("either prompt or messages is required")]
    MissingPrompt,
    #[error("prompt and messages cannot both be set")]
    AmbiguousPrompt,
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("prompt is {length} characters, maximum is {max}")]
    PromptTooLong { length: usize, max: usize },
    #[error("invalid {field}: {reason}")]
    InvalidField { field: String, reason: String },
}

impl ValidationError {
    fn field(field: impl Into<String>, reason: impl Into<String>) -> Self {
        ValidationError::InvalidField {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// Parse and validate a raw request body.
pub fn parse_and_validate(
    body: &[u8],
    limits: &ValidationLimits,
) -> Result<InferenceRequest, ValidationError> {
    let raw: Value =
        serde_json::from_slice(body).map_err(|e| ValidationError::MalformedJson(e.to_string()))?;
    validate(&raw, limits)
}

/// Validate an already-decoded request body.
pub fn validate(raw: &Value, limits: &ValidationLimits) -> Result<InferenceRequest, ValidationError> {
    let object = raw.as_object().ok_or(ValidationError::NotAnObject)?;

    // Fail closed on fields we do not understand
    if let Some(unknown) = object.keys().find(|k| !KNOWN_FIELDS.contains(&k.as_str())) {
        return Err(ValidationError::UnknownField(unknown.clone()));
    }

    let messages = match (present(object, "prompt"), present(object, "messages")) {
        (Some(_), Some(_)) => return Err(ValidationError::AmbiguousPrompt),
        (None, None) => return Err(ValidationError::MissingPrompt),
        (Some(prompt), None) => {
            let text = prompt
                .as_str()
                .ok_or_else(|| ValidationError::field("prompt", "must be a string"))?;
            vec![ChatMessage::user(text)]
        }
        (None, Some(messages)) => parse_messages(messages)?,
    };

    let length: usize = messages.iter().map(|m| m.content.chars().count()).sum();
    if messages.iter().all(|m| m.content.trim().is_empty()) {
        return Err(ValidationError::EmptyPrompt);
    }
    if length > limits.max_prompt_length {
        return Err(ValidationError::PromptTooLong {
            length,
            max: limits.max_prompt_length,
        });
    }

    let max_tokens = match present(object, "max_tokens") {
        None => limits.default_max_tokens,
        Some(value) => {
            let tokens = value
                .as_u64()
                .filter(|t| *t > 0)
                .ok_or_else(|| ValidationError::field("max_tokens", "must be a positive integer"))?;
            if tokens > u64::from(limits.max_tokens_limit) {
                return Err(ValidationError::field(
                    "max_tokens",
                    format!("must be at most {}", limits.max_tokens_limit),
                ));
            }
            tokens as u32
        }
    };

    let temperature = match present(object, "temperature") {
        None => limits.default_temperature,
        Some(value) => number_in(value, "temperature", |t| (0.0..=2.0).contains(&t), "must be between 0 and 2")?,
    };

    let top_p = present(object, "top_p")
        .map(|value| number_in(value, "top_p", |p| p > 0.0 && p <= 1.0, "must be greater than 0 and at most 1"))
        .transpose()?;

    let stream = match present(object, "stream") {
        None => false,
        Some(value) => value
            .as_bool()
            .ok_or_else(|| ValidationError::field("stream", "must be a boolean"))?,
    };

    Ok(InferenceRequest {
        messages,
        parameters: GenerationParameters {
            max_tokens,
            temperature,
            top_p,
        },
        stream,
    })
}

/// Field value, treating explicit `null` as absent.
fn present<'a>(object: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    object.get(key).filter(|v| !v.is_null())
}

fn number_in(
    value: &Value,
    field: &str,
    accept: impl Fn(f64) -> bool,
    reason: &str,
) -> Result<f32, ValidationError> {
    let number = value
        .as_f64()
        .ok_or_else(|| ValidationError::field(field, "must be a number"))?;
    if !number.is_finite() || !accept(number) {
        return Err(ValidationError::field(field, reason));
    }
    Ok(number as f32)
}

fn parse_messages(value: &Value) -> Result<Vec<ChatMessage>, ValidationError> {
    let items = value
        .as_array()
        .ok_or_else(|| ValidationError::field("messages", "must be an array"))?;
    if items.is_empty() {
        return Err(ValidationError::EmptyPrompt);
    }

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let field = format!("messages[{}]", i);
            let object = item
                .as_object()
                .ok_or_else(|| ValidationError::field(&field, "must be an object"))?;
            if let Some(unknown) = object.keys().find(|k| !MESSAGE_FIELDS.contains(&k.as_str())) {
                return Err(ValidationError::field(&field, format!("unknown field {}", unknown)));
            }

            let role = object
                .get("role")
                .and_then(Value::as_str)
                .and_then(Role::parse)
                .ok_or_else(|| {
                    ValidationError::field(&field, "role must be one of system, user, assistant")
                })?;
            let content = object
                .get("content")
                .and_then(Value::as_str)
                .ok_or_else(|| ValidationError::field(&field, "content must be a string"))?;
            if content.trim().is_empty() {
                return Err(ValidationError::field(&field, "content must not be empty"));
            }

            Ok(ChatMessage {
                role,
                content: content.to_string(),
            })
        })
        .collect()
}
