use super::{TranscriptView, UIError};
use crate::session::TranscriptEntry;
use std::io::{self, Write};
use std::sync::Mutex;

const CLOSING_FENCE: &str = "\n```";

// ANSI color codes for terminal formatting
struct Colors {
    reset: &'static str,
    red: &'static str,
}

impl Colors {
    fn new() -> Self {
        Colors {
            reset: "\x1b[0m",
            red: "\x1b[31m",
        }
    }
}

#[derive(Default)]
struct PrintState {
    // Index of the transcript entry currently being printed
    entry: usize,
    // Assistant text of that entry already written out
    shown: String,
}

/// Prints the transcript incrementally to a terminal.
///
/// Text is written as it grows. A trailing closing fence of the entry still
/// streaming is held back, because the code block in front of it is
/// re-rendered with every argument fragment.
pub struct TerminalView {
    colors: Colors,
    out: Mutex<Box<dyn Write + Send>>,
    state: Mutex<PrintState>,
}

impl TerminalView {
    pub fn new(out: Box<dyn Write + Send>) -> Self {
        Self {
            colors: Colors::new(),
            out: Mutex::new(out),
            state: Mutex::new(PrintState::default()),
        }
    }

    pub fn stdout() -> Self {
        Self::new(Box::new(io::stdout()))
    }

    fn print(&self, transcript: &[TranscriptEntry], streaming: bool) -> Result<(), UIError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let mut text = String::new();

        while state.entry < transcript.len() {
            let is_last = state.entry + 1 == transcript.len();
            let assistant = transcript[state.entry].assistant.as_deref().unwrap_or("");
            let visible = if is_last && streaming {
                assistant.strip_suffix(CLOSING_FENCE).unwrap_or(assistant)
            } else {
                assistant
            };

            self.append_delta(&mut text, &mut state.shown, visible);
            if is_last && streaming {
                break;
            }
            if !state.shown.is_empty() {
                text.push('\n');
            }
            state.entry += 1;
            state.shown.clear();
        }

        if !text.is_empty() {
            let mut out = self.out.lock().unwrap_or_else(|e| e.into_inner());
            write!(out, "{}", text)?;
            out.flush()?;
        }
        Ok(())
    }

    fn append_delta(&self, text: &mut String, shown: &mut String, visible: &str) {
        match visible.strip_prefix(shown.as_str()) {
            Some(delta) => text.push_str(delta),
            None => {
                // Rewritten behind what was printed; start over on a new line
                text.push('\n');
                text.push_str(visible);
            }
        }
        if shown.is_empty() && is_error_entry(visible) {
            text.insert_str(text.len() - visible.len(), self.colors.red);
            text.push_str(self.colors.reset);
        }
        *shown = visible.to_string();
    }
}

fn is_error_entry(text: &str) -> bool {
    ["Backend error:", "GPT generate wrong function args:", "Error:"]
        .iter()
        .any(|prefix| text.starts_with(prefix))
}

impl TranscriptView for TerminalView {
    fn render(&self, transcript: &[TranscriptEntry]) -> Result<(), UIError> {
        self.print(transcript, true)
    }

    fn turn_complete(&self, transcript: &[TranscriptEntry]) -> Result<(), UIError> {
        self.print(transcript, false)
    }

    fn clear(&self) -> Result<(), UIError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = PrintState::default();
        Ok(())
    }
}
