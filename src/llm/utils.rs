use crate::llm::{ApiError, ApiErrorContext};
use anyhow::Result;
use reqwest::header::HeaderMap;
use reqwest::{Response, StatusCode};
use std::time::Duration;
use tracing::debug;

/// Passes successful responses through; anything else becomes an
/// `ApiErrorContext` carrying the server's retry hint.
pub async fn check_response_error(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let retry_after = retry_after(response.headers());
    let body = response
        .text()
        .await
        .map_err(|e| ApiError::NetworkError(e.to_string()))?;

    Err(ApiErrorContext {
        error: api_error(status, &body),
        retry_after,
    }
    .into())
}

pub fn api_error(status: StatusCode, body: &str) -> ApiError {
    let message = error_message(body);
    match status {
        StatusCode::TOO_MANY_REQUESTS => ApiError::RateLimit(message),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ApiError::Authentication(message),
        // Azure answers 404 for an unknown deployment
        StatusCode::BAD_REQUEST | StatusCode::NOT_FOUND => ApiError::InvalidRequest(message),
        StatusCode::SERVICE_UNAVAILABLE => ApiError::Overloaded(message),
        status if status.is_server_error() => ApiError::ServiceError(message),
        _ => ApiError::Unknown(format!("Status {status}: {message}")),
    }
}

/// Message of an `{"error": {"message": ..}}` body, or the trimmed body itself
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or_else(|| body.trim().to_string())
}

/// Delay the server asks for before the next attempt.
///
/// Azure sends `retry-after-ms` / `retry-after`, OpenAI the
/// `x-ratelimit-reset-*` pair, of which the longer one wins.
pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let header = |name: &str| headers.get(name).and_then(|h| h.to_str().ok());

    if let Some(ms) = header("retry-after-ms").and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_millis(ms));
    }
    if let Some(secs) = header("retry-after").and_then(|v| v.parse::<u64>().ok()) {
        return Some(Duration::from_secs(secs));
    }
    ["x-ratelimit-reset-requests", "x-ratelimit-reset-tokens"]
        .iter()
        .filter_map(|name| header(name).map(parse_reset_duration))
        .max()
}

/// Logs the remaining request and token budget of a successful response
pub fn log_rate_limits(headers: &HeaderMap) {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("?")
            .to_string()
    };
    debug!(
        "Rate limits - Requests: {}/{}, Tokens: {}/{}",
        header("x-ratelimit-remaining-requests"),
        header("x-ratelimit-limit-requests"),
        header("x-ratelimit-remaining-tokens"),
        header("x-ratelimit-limit-tokens"),
    );
}

/// Parses OpenAI's duration format (e.g., "1s", "6m0s", "20ms")
fn parse_reset_duration(value: &str) -> Duration {
    let mut millis = 0u64;
    let mut current_num = String::new();
    let mut chars = value.chars().peekable();

    while let Some(c) = chars.next() {
        let factor = match c {
            '0'..='9' | '.' => {
                current_num.push(c);
                continue;
            }
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1.0
            }
            'm' => 60_000.0,
            's' => 1000.0,
            _ => 0.0,
        };
        millis += (current_num.parse::<f64>().unwrap_or(0.0) * factor) as u64;
        current_num.clear();
    }
    Duration::from_millis(millis)
}

/// How long to wait before retrying a failed request, or `None` when the
/// error is final or the retry budget is spent.
pub fn retry_delay(error: &anyhow::Error, attempts: u32, max_retries: u32) -> Option<Duration> {
    if attempts >= max_retries {
        return None;
    }

    let (api_error, hint) = match error.downcast_ref::<ApiErrorContext>() {
        Some(ctx) => (&ctx.error, ctx.retry_after),
        None => (error.downcast_ref::<ApiError>()?, None),
    };
    if !api_error.is_retryable() {
        return None;
    }
    Some(hint.unwrap_or_else(|| backoff_delay(attempts)))
}

fn backoff_delay(attempts: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempts.min(6)))
}
