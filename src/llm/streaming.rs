//! Common streaming infrastructure for the chat-completion transport
//!
//! Raw bytes arrive either from a live HTTP response or from a recorded
//! session. Both are decoded by the same SSE line handling, so playback
//! behaves exactly like the live stream it was captured from.

use crate::llm::recording::{APIRecorder, RecordedChunk};
use crate::llm::{ChatChunk, ChunkStream, StreamingError};
use anyhow::Result;
use async_trait::async_trait;
use reqwest::Response;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Source of raw response bytes (real HTTP response or recorded playback)
#[async_trait]
pub trait ByteSource: Send {
    async fn next_bytes(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Real HTTP response byte source
pub struct HttpByteSource {
    pub response: Response,
}

impl HttpByteSource {
    pub fn new(response: Response) -> Self {
        Self { response }
    }
}

#[async_trait]
impl ByteSource for HttpByteSource {
    async fn next_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        match self.response.chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("HTTP chunk error: {}", e)),
        }
    }
}

/// Recorded byte source for playback
pub struct PlaybackByteSource {
    chunks: Vec<RecordedChunk>,
    current_index: usize,
    start_time: Instant,
    fast_mode: bool,
}

impl PlaybackByteSource {
    pub fn new(chunks: Vec<RecordedChunk>, fast_mode: bool) -> Self {
        Self {
            chunks,
            current_index: 0,
            start_time: Instant::now(),
            fast_mode,
        }
    }
}

#[async_trait]
impl ByteSource for PlaybackByteSource {
    async fn next_bytes(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(chunk) = self.chunks.get(self.current_index) else {
            return Ok(None);
        };

        if !self.fast_mode {
            let elapsed = self.start_time.elapsed();
            let expected_time = Duration::from_millis(chunk.timestamp_ms);
            if elapsed < expected_time {
                tokio::time::sleep(expected_time - elapsed).await;
            }
        }

        let sse_line = format!("data: {}\n", chunk.data);
        self.current_index += 1;

        Ok(Some(sse_line.into_bytes()))
    }
}

/// Splits a byte stream into lines.
///
/// Bytes are buffered until a newline arrives, so multi-byte characters that
/// are split across network chunks are decoded only once they are complete.
#[derive(Default)]
pub struct LineBuffer {
    buffer: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends bytes and returns every line completed by them
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>> {
        let mut lines = Vec::new();
        for &byte in bytes {
            if byte == b'\n' {
                if let Some(line) = self.take_line()? {
                    lines.push(line);
                }
            } else {
                self.buffer.push(byte);
            }
        }
        Ok(lines)
    }

    /// Returns whatever is left in the buffer as a final line
    pub fn flush(&mut self) -> Result<Option<String>> {
        self.take_line()
    }

    fn take_line(&mut self) -> Result<Option<String>> {
        let bytes = std::mem::take(&mut self.buffer);
        let line = String::from_utf8(bytes).map_err(|_| StreamingError::InvalidUtf8)?;
        let line = line.trim_end_matches('\r');
        if line.is_empty() {
            Ok(None)
        } else {
            Ok(Some(line.to_string()))
        }
    }
}

/// Result of decoding one SSE line
#[derive(Debug, PartialEq)]
pub enum SseLine {
    Chunk(ChatChunk),
    Done,
    /// Comments, other fields and undecodable data
    Ignored,
}

/// Returns the payload of a `data:` line
pub fn sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(|data| data.trim_start())
}

pub fn parse_sse_line(line: &str) -> SseLine {
    let Some(data) = sse_data(line) else {
        trace!("Skipping non-data SSE line: '{}'", line);
        return SseLine::Ignored;
    };
    if data == "[DONE]" {
        return SseLine::Done;
    }
    match serde_json::from_str::<ChatChunk>(data) {
        Ok(chunk) => SseLine::Chunk(chunk),
        Err(e) => {
            warn!("Failed to parse stream event '{}': {}", data, e);
            SseLine::Ignored
        }
    }
}

/// Chunk stream decoding server-sent events from a byte source
pub struct SseChunkStream<S: ByteSource> {
    source: S,
    lines: LineBuffer,
    pending: VecDeque<ChatChunk>,
    finished: bool,
    recorder: Option<Arc<APIRecorder>>,
}

impl<S: ByteSource> SseChunkStream<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            lines: LineBuffer::new(),
            pending: VecDeque::new(),
            finished: false,
            recorder: None,
        }
    }

    /// Records every data payload; the recording session must already be started
    pub fn with_recorder(mut self, recorder: Arc<APIRecorder>) -> Self {
        self.recorder = Some(recorder);
        self
    }

    fn handle_line(&mut self, line: &str) -> Result<()> {
        if self.finished {
            return Ok(());
        }
        if let (Some(recorder), Some(data)) = (&self.recorder, sse_data(line)) {
            recorder.record_chunk(data)?;
        }
        match parse_sse_line(line) {
            SseLine::Chunk(chunk) => {
                debug!("Received stream event: '{}'", line);
                self.pending.push_back(chunk);
            }
            SseLine::Done => self.finish()?,
            SseLine::Ignored => {}
        }
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        if !self.finished {
            self.finished = true;
            if let Some(recorder) = &self.recorder {
                recorder.end_recording()?;
            }
        }
        Ok(())
    }
}

// The driver stops pulling at the finish chunk, usually before `[DONE]` is read
impl<S: ByteSource> Drop for SseChunkStream<S> {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("Failed to save recorded stream: {}", e);
        }
    }
}

#[async_trait]
impl<S: ByteSource> ChunkStream for SseChunkStream<S> {
    async fn next_chunk(&mut self) -> Result<Option<ChatChunk>> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Ok(Some(chunk));
            }
            if self.finished {
                return Ok(None);
            }
            match self.source.next_bytes().await? {
                Some(bytes) => {
                    for line in self.lines.push(&bytes)? {
                        self.handle_line(&line)?;
                    }
                }
                None => {
                    if let Some(line) = self.lines.flush()? {
                        self.handle_line(&line)?;
                    }
                    self.finish()?;
                }
            }
        }
    }
}
