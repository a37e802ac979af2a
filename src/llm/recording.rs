use crate::llm::streaming::{PlaybackByteSource, SseChunkStream};
use crate::llm::{ChatRequest, ChatTransport, ChunkStream, StreamingError};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use tracing::debug;

/// Recording session that contains the original request and all chunks
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordingSession {
    /// The request that was sent
    pub request: serde_json::Value,
    /// Timestamp of when the recording was started
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Raw data payloads as received from the API
    pub chunks: Vec<RecordedChunk>,
}

/// Single recorded chunk with timing info
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct RecordedChunk {
    /// Raw content of the data part of the SSE
    pub data: String,
    /// Milliseconds since recording start
    pub timestamp_ms: u64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Recorder for API responses, appending one session per request to a JSON array
pub struct APIRecorder {
    file_path: PathBuf,
    current_session: Mutex<Option<RecordingSession>>,
    start_time: Mutex<Option<Instant>>,
}

impl APIRecorder {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            file_path: path.as_ref().to_path_buf(),
            current_session: Mutex::new(None),
            start_time: Mutex::new(None),
        }
    }

    /// Start a new recording session
    pub fn start_recording(&self, request: serde_json::Value) -> Result<()> {
        *lock(&self.current_session) = Some(RecordingSession {
            request,
            timestamp: chrono::Utc::now(),
            chunks: Vec::new(),
        });
        *lock(&self.start_time) = Some(Instant::now());
        Ok(())
    }

    /// Record an incoming data payload
    pub fn record_chunk(&self, data: &str) -> Result<()> {
        let mut session_guard = lock(&self.current_session);
        let start_guard = lock(&self.start_time);

        if let (Some(session), Some(start_time)) = (session_guard.as_mut(), *start_guard) {
            session.chunks.push(RecordedChunk {
                data: data.to_string(),
                timestamp_ms: start_time.elapsed().as_millis() as u64,
            });
        }
        Ok(())
    }

    /// End the current recording session and save it to disk
    pub fn end_recording(&self) -> Result<()> {
        let session = lock(&self.current_session).take();
        *lock(&self.start_time) = None;

        let Some(session) = session else {
            return Ok(());
        };

        let json = serde_json::to_string_pretty(&session)?;
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.file_path)
            .context("Failed to open recording file")?;

        let file_size = file.metadata()?.len();
        if file_size == 0 {
            writeln!(file, "[")?;
        } else {
            // Drop the trailing "\n]\n" of the existing array
            file.set_len(file_size.saturating_sub(3))?;
            file.seek(std::io::SeekFrom::End(0))?;
            writeln!(file, ",")?;
        }
        writeln!(file, "{json}")?;
        writeln!(file, "]")?;

        debug!(
            "Recorded {} chunks to {}",
            session.chunks.len(),
            self.file_path.display()
        );
        Ok(())
    }
}

/// Recorded sessions handed out one per request
#[derive(Clone)]
pub struct PlaybackState {
    sessions: Arc<Vec<RecordingSession>>,
    index: Arc<Mutex<usize>>,
    pub fast: bool,
}

impl PlaybackState {
    pub fn from_file<P: AsRef<Path>>(path: P, fast: bool) -> Result<Self> {
        let mut file = File::open(path).context("Failed to open recording file")?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .context("Failed to read recording file")?;
        let sessions: Vec<RecordingSession> =
            serde_json::from_str(&contents).context("Failed to parse recording file")?;
        Ok(Self {
            sessions: Arc::new(sessions),
            index: Arc::new(Mutex::new(0)),
            fast,
        })
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Take the next session, or None if exhausted
    pub fn next_session(&self) -> Option<RecordingSession> {
        let mut idx = lock(&self.index);
        let session = self.sessions.get(*idx).cloned()?;
        *idx += 1;
        Some(session)
    }
}

/// Transport replaying recorded sessions instead of calling the API
pub struct PlaybackTransport {
    state: PlaybackState,
}

impl PlaybackTransport {
    pub fn new(state: PlaybackState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl ChatTransport for PlaybackTransport {
    async fn stream_chat(&self, request: ChatRequest) -> Result<Box<dyn ChunkStream>> {
        let session = self
            .state
            .next_session()
            .ok_or(StreamingError::PlaybackExhausted)?;
        debug!(
            "Playing back recorded session with {} chunks for model '{}'",
            session.chunks.len(),
            request.model
        );
        let source = PlaybackByteSource::new(session.chunks, self.state.fast);
        Ok(Box::new(SseChunkStream::new(source)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FinishReason;

    fn record_session(recorder: &APIRecorder, payloads: &[&str]) {
        recorder
            .start_recording(serde_json::json!({"model": "gpt-4"}))
            .unwrap();
        for payload in payloads {
            recorder.record_chunk(payload).unwrap();
        }
        recorder.end_recording().unwrap();
    }

    #[test]
    fn test_recorder_appends_sessions_to_json_array() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording.json");
        let recorder = APIRecorder::new(&path);

        record_session(&recorder, &[r#"{"choices":[]}"#]);
        record_session(&recorder, &[r#"{"choices":[]}"#, "[DONE]"]);

        let state = PlaybackState::from_file(&path, true).unwrap();
        assert_eq!(state.session_count(), 2);
        assert_eq!(state.next_session().unwrap().chunks.len(), 1);
        assert_eq!(state.next_session().unwrap().chunks.len(), 2);
        assert!(state.next_session().is_none());
    }

    #[test]
    fn test_end_without_session_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recording.json");
        let recorder = APIRecorder::new(&path);
        recorder.end_recording().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_playback_transport_replays_chunks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("recording.json");
        let recorder = APIRecorder::new(&path);
        record_session(
            &recorder,
            &[
                r#"{"choices":[{"delta":{"content":"Hi"}}]}"#,
                r#"{"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
                "[DONE]",
            ],
        );

        let transport = PlaybackTransport::new(PlaybackState::from_file(&path, true)?);
        let mut stream = transport.stream_chat(ChatRequest::default()).await?;
        let first = stream.next_chunk().await?.unwrap();
        assert_eq!(first.choices[0].delta.content.as_deref(), Some("Hi"));
        let second = stream.next_chunk().await?.unwrap();
        assert_eq!(second.choices[0].finish_reason, Some(FinishReason::Stop));
        assert!(stream.next_chunk().await?.is_none());

        assert!(transport.stream_chat(ChatRequest::default()).await.is_err());
        Ok(())
    }
}
