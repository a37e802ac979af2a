pub mod terminal;

use crate::session::TranscriptEntry;
use thiserror::Error;

pub use terminal::TerminalView;

#[derive(Error, Debug)]
pub enum UIError {
    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}

/// Observer of the visible transcript.
///
/// `render` is called after every applied chunk. The last entry's assistant
/// text may be rewritten between calls, not only extended.
pub trait TranscriptView: Send + Sync {
    fn render(&self, transcript: &[TranscriptEntry]) -> Result<(), UIError>;

    /// Called once the driver stops streaming for this user message
    fn turn_complete(&self, transcript: &[TranscriptEntry]) -> Result<(), UIError> {
        self.render(transcript)
    }

    /// Called after the session was restarted
    fn clear(&self) -> Result<(), UIError> {
        Ok(())
    }
}
