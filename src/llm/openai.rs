use crate::config::{ApiType, Config};
use crate::llm::streaming::{HttpByteSource, SseChunkStream};
use crate::llm::{
    utils, APIRecorder, ApiError, ChatMessage, ChatRequest, ChatTransport, ChunkStream,
    FunctionDefinition,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Trait for providing authentication headers
#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn get_auth_headers(&self) -> Result<Vec<(String, String)>>;
}

/// Trait for customizing requests before sending
pub trait RequestCustomizer: Send + Sync {
    fn customize_request(&self, request: &mut serde_json::Value) -> Result<()>;
    fn get_additional_headers(&self) -> Vec<(String, String)>;
    fn customize_url(&self, base_url: &str, model: &str) -> String;
}

/// Default API key authentication provider
pub struct ApiKeyAuth {
    api_key: String,
}

impl ApiKeyAuth {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }
}

#[async_trait]
impl AuthProvider for ApiKeyAuth {
    async fn get_auth_headers(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![(
            "Authorization".to_string(),
            format!("Bearer {}", self.api_key),
        )])
    }
}

/// Azure OpenAI expects the key in its own header
pub struct AzureKeyAuth {
    api_key: String,
}

impl AzureKeyAuth {
    pub fn new(api_key: String) -> Self {
        Self { api_key }
    }
}

#[async_trait]
impl AuthProvider for AzureKeyAuth {
    async fn get_auth_headers(&self) -> Result<Vec<(String, String)>> {
        Ok(vec![("api-key".to_string(), self.api_key.clone())])
    }
}

/// Default request customizer for the OpenAI API
pub struct DefaultRequestCustomizer;

impl RequestCustomizer for DefaultRequestCustomizer {
    fn customize_request(&self, _request: &mut serde_json::Value) -> Result<()> {
        Ok(())
    }

    fn get_additional_headers(&self) -> Vec<(String, String)> {
        vec![("Content-Type".to_string(), "application/json".to_string())]
    }

    fn customize_url(&self, base_url: &str, _model: &str) -> String {
        format!("{}/chat/completions", base_url.trim_end_matches('/'))
    }
}

/// Azure deployments are addressed by URL, the model name acts as deployment
pub struct AzureRequestCustomizer {
    api_version: String,
}

impl AzureRequestCustomizer {
    pub fn new(api_version: String) -> Self {
        Self { api_version }
    }
}

impl RequestCustomizer for AzureRequestCustomizer {
    fn customize_request(&self, request: &mut serde_json::Value) -> Result<()> {
        if let Some(object) = request.as_object_mut() {
            object.remove("model");
        }
        Ok(())
    }

    fn get_additional_headers(&self) -> Vec<(String, String)> {
        vec![("Content-Type".to_string(), "application/json".to_string())]
    }

    fn customize_url(&self, base_url: &str, model: &str) -> String {
        format!(
            "{}/openai/deployments/{}/chat/completions?api-version={}",
            base_url.trim_end_matches('/'),
            model,
            self.api_version
        )
    }
}

#[derive(Debug, Serialize, Clone)]
struct OpenAIRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    functions: Option<Vec<FunctionDefinition>>,
}

pub struct OpenAIClient {
    client: Client,
    base_url: String,
    max_retries: u32,
    recorder: Option<Arc<APIRecorder>>,
    // Customization points
    auth_provider: Box<dyn AuthProvider>,
    request_customizer: Box<dyn RequestCustomizer>,
}

impl OpenAIClient {
    pub fn default_base_url() -> String {
        "https://api.openai.com/v1".to_string()
    }

    pub fn new(api_key: String, base_url: String) -> Self {
        Self::with_customization(
            base_url,
            Box::new(ApiKeyAuth::new(api_key)),
            Box::new(DefaultRequestCustomizer),
        )
    }

    pub fn with_customization(
        base_url: String,
        auth_provider: Box<dyn AuthProvider>,
        request_customizer: Box<dyn RequestCustomizer>,
    ) -> Self {
        Self {
            client: Client::new(),
            base_url,
            max_retries: 3,
            recorder: None,
            auth_provider,
            request_customizer,
        }
    }

    /// Builds the client for the configured API flavour.
    /// Fails before any request is sent when no API key is available.
    pub fn from_config(config: &Config) -> Result<Self> {
        let api_key = config.resolve_api_key()?;
        let client = match config.api_type {
            ApiType::OpenAi => Self::new(api_key, config.api_base.clone()),
            ApiType::Azure => {
                let api_version = config
                    .api_version
                    .clone()
                    .context("Azure configuration requires an api_version")?;
                Self::with_customization(
                    config.api_base.clone(),
                    Box::new(AzureKeyAuth::new(api_key)),
                    Box::new(AzureRequestCustomizer::new(api_version)),
                )
            }
        };
        Ok(client)
    }

    pub fn with_recorder(mut self, recorder: Arc<APIRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    fn build_request_json(&self, request: ChatRequest) -> Result<serde_json::Value> {
        let openai_request = OpenAIRequest {
            model: request.model,
            messages: request.messages,
            stream: true,
            functions: request.functions,
        };
        let mut request_json = serde_json::to_value(openai_request)?;
        self.request_customizer
            .customize_request(&mut request_json)?;
        Ok(request_json)
    }

    /// Retries happen only here, before any chunk of the response is consumed
    async fn send_with_retry(&self, url: &str, request_json: &serde_json::Value) -> Result<Response> {
        let mut attempts = 0;

        loop {
            match self.try_send_request(url, request_json).await {
                Ok(response) => {
                    utils::log_rate_limits(response.headers());
                    return Ok(response);
                }
                Err(e) => {
                    let Some(delay) = utils::retry_delay(&e, attempts, self.max_retries) else {
                        return Err(e);
                    };
                    warn!(
                        "{} (attempt {}/{}), retrying in {} ms",
                        e,
                        attempts + 1,
                        self.max_retries,
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                    attempts += 1;
                }
            }
        }
    }

    async fn try_send_request(
        &self,
        url: &str,
        request_json: &serde_json::Value,
    ) -> Result<Response> {
        let auth_headers = self.auth_provider.get_auth_headers().await?;

        let mut request_builder = self.client.post(url);
        for (key, value) in auth_headers {
            request_builder = request_builder.header(key, value);
        }
        for (key, value) in self.request_customizer.get_additional_headers() {
            request_builder = request_builder.header(key, value);
        }

        let response = request_builder
            .json(request_json)
            .send()
            .await
            .map_err(|e| ApiError::NetworkError(e.to_string()))?;

        utils::check_response_error(response).await
    }
}

#[async_trait]
impl ChatTransport for OpenAIClient {
    async fn stream_chat(&self, request: ChatRequest) -> Result<Box<dyn ChunkStream>> {
        let url = self
            .request_customizer
            .customize_url(&self.base_url, &request.model);
        let request_json = self.build_request_json(request)?;

        info!("Sending streaming request to {}", url);
        debug!("Request body: {}", request_json);

        let response = self.send_with_retry(&url, &request_json).await?;

        let stream = SseChunkStream::new(HttpByteSource::new(response));
        match &self.recorder {
            Some(recorder) => {
                recorder.start_recording(request_json)?;
                Ok(Box::new(stream.with_recorder(recorder.clone())))
            }
            None => Ok(Box::new(stream)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_per_api_type() {
        assert_eq!(
            DefaultRequestCustomizer.customize_url("https://api.openai.com/v1/", "gpt-4"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            AzureRequestCustomizer::new("2023-07-01-preview".to_string())
                .customize_url("https://example.openai.azure.com", "gpt4-deploy"),
            "https://example.openai.azure.com/openai/deployments/gpt4-deploy/chat/completions?api-version=2023-07-01-preview"
        );
    }

    #[test]
    fn test_azure_request_drops_model_field() {
        let client = OpenAIClient::with_customization(
            "https://example.openai.azure.com".to_string(),
            Box::new(AzureKeyAuth::new("key".to_string())),
            Box::new(AzureRequestCustomizer::new("2023-07-01-preview".to_string())),
        );
        let json = client
            .build_request_json(ChatRequest {
                model: "gpt4-deploy".to_string(),
                messages: Vec::new(),
                functions: None,
            })
            .unwrap();
        assert!(json.get("model").is_none());
        assert_eq!(json["stream"], serde_json::json!(true));
        assert!(json.get("functions").is_none());
    }
}
