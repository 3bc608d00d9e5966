//! Inference request and completion types.

use serde::{Deserialize, Serialize};

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    /// Parse a role name as sent by clients.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "system" => Some(Role::System),
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::System => write!(f, "system"),
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Generation options forwarded to the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParameters {
    pub max_tokens: u32,
    pub temperature: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
}

/// A validated inference request.
///
/// Only the gateway's validator builds these, so every instance already
/// satisfies the configured limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub messages: Vec<ChatMessage>,
    pub parameters: GenerationParameters,
    #[serde(default)]
    pub stream: bool,
}

impl InferenceRequest {
    /// Total number of characters across all message contents.
    pub fn prompt_chars(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl Usage {
    pub fn new(prompt_tokens: u32, completion_tokens: u32) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// A single-shot completion returned by `POST /inference`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Completion {
    pub id: String,
    /// Unix timestamp (seconds) at which the completion was assembled.
    pub created: i64,
    pub model: String,
    pub content: String,
    pub finish_reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Wall-clock time spent in the gateway, filled in before the response is sent.
    #[serde(default)]
    pub latency_ms: u64,
}

impl Completion {
    pub fn new(model: impl Into<String>, content: impl Into<String>, finish_reason: impl Into<String>) -> Self {
        Self {
            id: format!("cmpl-{}", uuid::Uuid::new_v4()),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            content: content.into(),
            finish_reason: finish_reason.into(),
            usage: None,
            latency_ms: 0,
        }
    }

    pub fn with_usage(mut self, prompt_tokens: u32, completion_tokens: u32) -> Self {
        self.usage = Some(Usage::new(prompt_tokens, completion_tokens));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("user"), Some(Role::User));
        assert_eq!(Role::parse("system"), Some(Role::System));
        assert_eq!(Role::parse("assistant"), Some(Role::Assistant));
        assert_eq!(Role::parse("tool"), None);
        assert_eq!(Role::parse("User"), None);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let json = serde_json::to_string(&ChatMessage::user("hi")).unwrap();
        assert_eq!(json, r#"{"role":"user","content":"hi"}"#);
    }

    #[test]
    fn test_prompt_chars_counts_characters_not_bytes() {
        let request = InferenceRequest {
            messages: vec![
                ChatMessage::user("héllo"),
                ChatMessage {
                    role: Role::System,
                    content: "ab".to_string(),
                },
            ],
            parameters: GenerationParameters {
                max_tokens: 10,
                temperature: 0.7,
                top_p: None,
            },
            stream: false,
        };
        assert_eq!(request.prompt_chars(), 7);
    }

    #[test]
    fn test_completion_new() {
        let completion = Completion::new("test-model", "Hello!", "stop");
        assert!(completion.id.starts_with("cmpl-"));
        assert!(completion.created > 0);
        assert_eq!(completion.model, "test-model");
        assert_eq!(completion.finish_reason, "stop");
        assert!(completion.usage.is_none());
        assert_eq!(completion.latency_ms, 0);
    }

    #[test]
    fn test_completion_with_usage() {
        let completion = Completion::new("m", "x", "stop").with_usage(10, 5);
        let usage = completion.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 10);
        assert_eq!(usage.completion_tokens, 5);
        assert_eq!(usage.total_tokens, 15);
    }

    #[test]
    fn test_completion_omits_missing_usage() {
        let json = serde_json::to_value(Completion::new("m", "x", "stop")).unwrap();
        assert!(json.get("usage").is_none());
        assert_eq!(json["content"], "x");
    }

    #[test]
    fn test_parameters_omit_missing_top_p() {
        let params = GenerationParameters {
            max_tokens: 100,
            temperature: 0.5,
            top_p: None,
        };
        let json = serde_json::to_value(&params).unwrap();
        assert!(json.get("top_p").is_none());
        assert_eq!(json["max_tokens"], 100);
    }
}
