//! Conversation sessions
//!
//! A session owns its conversation, the visible transcript and the assistant
//! turn currently being streamed. The dispatcher folds streamed chunks into
//! that state; the driver runs request/stream/execute cycles on top of it.

pub mod dispatch;
mod driver;
mod error;
pub mod extract;
pub mod render;
mod state;


pub use driver::{DriverState, TurnDriver};
pub use error::SessionError;
pub use extract::extract_code;
pub use render::ImageCache;
pub use state::{
    CompletionSignal, ConversationState, InProgressTurn, Message, Role, SessionId, SessionState,
    Transcript, TranscriptEntry,
};
