use thiserror::Error;

/// Reasons a session ends in the terminated state or refuses to send
#[derive(Debug, Error)]
pub enum SessionError {
    /// Complete-mode extraction of the function arguments failed
    #[error("malformed function arguments: {0}")]
    MalformedArguments(String),

    #[error("code execution failed: {0}")]
    Execution(String),

    /// Chosen model is unknown or disabled; no request was sent
    #[error("model '{0}' is not available")]
    ModelUnavailable(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("stream ended without a finish reason")]
    IncompleteStream,

    #[error("session was terminated: {0}")]
    Terminated(String),
}
