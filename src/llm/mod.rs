//! Transport boundary to the remote chat-completion API
//!
//! This module implements:
//! - The `ChatTransport` / `ChunkStream` traits the turn driver pulls chunks from
//! - An OpenAI compatible streaming client (OpenAI and Azure endpoints)
//! - SSE line decoding shared by live and recorded streams
//! - Recording of raw streams and their playback

#[cfg(test)]
mod tests;

mod utils;

pub mod openai;
pub mod recording;
pub mod streaming;
pub mod types;

pub use openai::OpenAIClient;
pub use recording::{APIRecorder, PlaybackTransport};
pub use types::*;

use anyhow::Result;
use async_trait::async_trait;

/// Source of parsed chunks for one streamed turn, consumed in arrival order
#[async_trait]
pub trait ChunkStream: Send {
    /// Returns the next chunk, or `None` once the stream is exhausted
    async fn next_chunk(&mut self) -> Result<Option<ChatChunk>>;
}

/// Trait for the chat-completion transport
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Sends the request and returns the stream of response chunks
    async fn stream_chat(&self, request: ChatRequest) -> Result<Box<dyn ChunkStream>>;
}
