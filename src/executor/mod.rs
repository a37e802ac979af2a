//! Code-execution boundary
//!
//! The model requests code execution through a pseudo function call. The
//! registry maps function names to a `CodeExecutor`, whose output is split
//! into the text fed back to the model and tagged items shown in the
//! transcript.

mod process;

pub use process::ProcessExecutor;

use crate::llm::FunctionDefinition;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

pub const EXECUTE_CODE_FUNCTION: &str = "execute_code";

/// Kind of a displayable execution output item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputTag {
    Stdout,
    ExecuteResultText,
    DisplayText,
    ExecuteResultPng,
    ExecuteResultJpeg,
    DisplayPng,
    DisplayJpeg,
    Error,
}

/// Image encoding of an image-tagged item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }
}

impl OutputTag {
    pub fn is_text(&self) -> bool {
        matches!(
            self,
            OutputTag::Stdout | OutputTag::ExecuteResultText | OutputTag::DisplayText
        )
    }

    pub fn image_format(&self) -> Option<ImageFormat> {
        match self {
            OutputTag::ExecuteResultPng | OutputTag::DisplayPng => Some(ImageFormat::Png),
            OutputTag::ExecuteResultJpeg | OutputTag::DisplayJpeg => Some(ImageFormat::Jpeg),
            _ => None,
        }
    }
}

/// One tagged output item; image payloads are base64 encoded
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisplayItem {
    pub tag: OutputTag,
    pub payload: String,
}

impl DisplayItem {
    pub fn new(tag: OutputTag, payload: impl Into<String>) -> Self {
        Self {
            tag,
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionOutput {
    /// Text returned to the model as the function result
    pub text_for_model: String,
    /// Items rendered into the transcript, in order
    pub display: Vec<DisplayItem>,
}

#[async_trait]
pub trait CodeExecutor: Send + Sync {
    async fn execute(&self, code: &str) -> Result<ExecutionOutput>;
}

/// Executor used when no interpreter is configured
pub struct DisabledExecutor;

#[async_trait]
impl CodeExecutor for DisabledExecutor {
    async fn execute(&self, _code: &str) -> Result<ExecutionOutput> {
        anyhow::bail!("code execution is not enabled in the configuration")
    }
}

/// Functions the model may call, keyed by name
pub struct FunctionRegistry {
    handlers: HashMap<String, Arc<dyn CodeExecutor>>,
    definitions: Vec<FunctionDefinition>,
}

impl FunctionRegistry {
    /// Registers `execute_code` and routes calls named after the worker
    /// language (a common model hallucination) to the same executor
    pub fn for_code_execution(executor: Arc<dyn CodeExecutor>, worker_language: &str) -> Self {
        let mut handlers: HashMap<String, Arc<dyn CodeExecutor>> = HashMap::new();
        handlers.insert(EXECUTE_CODE_FUNCTION.to_string(), executor.clone());
        handlers.insert(worker_language.to_lowercase(), executor);

        Self {
            handlers,
            definitions: vec![execute_code_definition(worker_language)],
        }
    }

    /// Functions advertised to the model
    pub fn definitions(&self) -> &[FunctionDefinition] {
        &self.definitions
    }

    pub async fn invoke(&self, function_name: &str, code: &str) -> Result<ExecutionOutput> {
        let handler = self
            .handlers
            .get(function_name)
            .or_else(|| self.handlers.get(&function_name.to_lowercase()))
            .ok_or_else(|| anyhow::anyhow!("unknown function '{}'", function_name))?;
        handler.execute(code).await
    }
}

fn execute_code_definition(worker_language: &str) -> FunctionDefinition {
    FunctionDefinition {
        name: EXECUTE_CODE_FUNCTION.to_string(),
        description: format!(
            "This function allows you to execute {worker_language} code and retrieve the \
             terminal output. If the code generates image output, the function will return \
             the text '[image]'."
        ),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "code": {
                    "type": "string",
                    "description": "The code text"
                }
            },
            "required": ["code"],
        }),
    }
}
