use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Function advertised to the model in a chat-completion request
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct FunctionDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

/// A completed function call as it is sent back to the API
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Message in the wire format of the chat-completion endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: String,
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

/// Provider independent request for one streamed turn
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    /// Concrete model (or Azure deployment) name
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub functions: Option<Vec<FunctionDefinition>>,
}

/// One incremental unit of a streamed response
#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ChatChunk {
    #[serde(default)]
    pub choices: Vec<ChunkChoice>,
}

impl ChatChunk {
    /// Only the first choice of a chunk carries state for the conversation
    pub fn first_choice(&self) -> Option<&ChunkChoice> {
        self.choices.first()
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ChunkChoice {
    #[serde(default)]
    pub delta: ChunkDelta,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct ChunkDelta {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub function_call: Option<FunctionCallDelta>,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq)]
pub struct FunctionCallDelta {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub arguments: Option<String>,
}

/// Why the model stopped streaming a turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    FunctionCall,
    Length,
    ContentFilter,
    /// New user input was appended, the driver should resume streaming
    NewInput,
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::FunctionCall => "function_call",
            FinishReason::Length => "length",
            FinishReason::ContentFilter => "content_filter",
            FinishReason::NewInput => "new_input",
            FinishReason::Other(reason) => reason,
        }
    }
}

impl From<&str> for FinishReason {
    fn from(value: &str) -> Self {
        match value {
            "stop" => FinishReason::Stop,
            "function_call" => FinishReason::FunctionCall,
            "length" => FinishReason::Length,
            "content_filter" => FinishReason::ContentFilter,
            "new_input" => FinishReason::NewInput,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FinishReason {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(FinishReason::from(value.as_str()))
    }
}

/// Common error types for the chat-completion API
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Rate limit exceeded: {0}")]
    RateLimit(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("Service overloaded: {0}")]
    Overloaded(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl ApiError {
    /// Whether sending the same request again may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ApiError::RateLimit(_)
                | ApiError::ServiceError(_)
                | ApiError::NetworkError(_)
                | ApiError::Overloaded(_)
        )
    }
}

/// Errors raised while a response is being streamed
#[derive(Debug, thiserror::Error)]
pub enum StreamingError {
    #[error("Invalid UTF-8 in response stream")]
    InvalidUtf8,

    #[error("Playback exhausted - no recorded session left")]
    PlaybackExhausted,
}

/// API error of a rejected request, with the delay the server asked for
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct ApiErrorContext {
    pub error: ApiError,
    pub retry_after: Option<Duration>,
}
