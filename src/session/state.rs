use crate::llm::{ChatMessage, FinishReason, FunctionCall};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

const SYSTEM_MESSAGE: &str = include_str!("../../resources/system_message.md");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    /// Result of a function call fed back to the model
    Function,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Function => "function",
        }
    }

    /// Maps the role label streamed by the API, defaulting to assistant
    pub fn from_label(label: &str) -> Self {
        match label {
            "system" => Role::System,
            "user" => Role::User,
            "function" => Role::Function,
            _ => Role::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub role: Role,
    pub text: Option<String>,
    /// Function name for function results
    pub name: Option<String>,
    /// Set on assistant messages that requested a function call
    pub function_call: Option<FunctionCall>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            text: Some(text.into()),
            name: None,
            function_call: None,
        }
    }

    pub fn to_chat_message(&self) -> ChatMessage {
        ChatMessage {
            role: self.role.as_str().to_string(),
            content: self.text.clone(),
            name: self.name.clone(),
            function_call: self.function_call.clone(),
        }
    }
}

/// Messages sent to the model. The system message is always first and
/// present exactly once.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationState {
    messages: Vec<Message>,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::new(SYSTEM_MESSAGE)
    }
}

impl ConversationState {
    pub fn new(system_message: &str) -> Self {
        Self {
            messages: vec![Message::text(Role::System, system_message)],
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Appends a message; system messages after the first one are dropped
    pub fn push(&mut self, message: Message) {
        if message.role == Role::System {
            warn!("Ignoring additional system message");
            return;
        }
        self.messages.push(message);
    }

    /// Drops everything but the system message
    pub fn reset(&mut self) {
        self.messages.truncate(1);
    }

    pub fn to_chat_messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().map(Message::to_chat_message).collect()
    }
}

/// One visible transcript row: the user side and the assistant side
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub user: Option<String>,
    pub assistant: Option<String>,
}

impl TranscriptEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            user: Some(text.into()),
            assistant: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            user: None,
            assistant: Some(text.into()),
        }
    }
}

pub type Transcript = Vec<TranscriptEntry>;

/// Where the current turn stands after the last applied chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionSignal {
    /// A request is due or in flight (new user input, resume marker)
    Streaming,
    /// A function call finished; its result must be sent to the model
    AwaitingFunctionResult,
    /// The model stopped naturally
    UserInputRequired,
    /// A fatal error ended the session
    Error,
}

impl From<&FinishReason> for CompletionSignal {
    fn from(reason: &FinishReason) -> Self {
        match reason {
            FinishReason::FunctionCall => CompletionSignal::AwaitingFunctionResult,
            FinishReason::NewInput => CompletionSignal::Streaming,
            _ => CompletionSignal::UserInputRequired,
        }
    }
}

impl CompletionSignal {
    /// Whether the driver has to issue another completion request
    pub fn requires_request(&self) -> bool {
        matches!(
            self,
            CompletionSignal::Streaming | CompletionSignal::AwaitingFunctionResult
        )
    }
}

/// Accumulated state of the assistant turn currently being streamed
#[derive(Debug, Clone, PartialEq)]
pub struct InProgressTurn {
    pub content: String,
    pub role: Option<Role>,
    pub function_name: Option<String>,
    pub function_args: String,
    /// Transcript as it was when the function call began
    pub snapshot: Option<Transcript>,
    pub signal: CompletionSignal,
}

impl Default for InProgressTurn {
    fn default() -> Self {
        Self::with_signal(CompletionSignal::UserInputRequired)
    }
}

impl InProgressTurn {
    /// Fresh turn that only keeps the completion signal
    pub fn with_signal(signal: CompletionSignal) -> Self {
        Self {
            content: String::new(),
            role: None,
            function_name: None,
            function_args: String::new(),
            snapshot: None,
            signal,
        }
    }

    pub fn role_or_assistant(&self) -> Role {
        self.role.unwrap_or(Role::Assistant)
    }
}

/// Everything one end user's session owns. Sessions never share this value.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub id: String,
    pub conversation: ConversationState,
    pub turn: InProgressTurn,
    pub transcript: Transcript,
    pub model_choice: String,
    pub worker_language: String,
    /// Set by a fatal rule outcome; the driver stops pulling chunks
    pub fatal: Option<String>,
}

impl SessionState {
    pub fn new(model_choice: impl Into<String>, worker_language: impl Into<String>) -> Self {
        Self::with_conversation(ConversationState::default(), model_choice, worker_language)
    }

    pub fn with_conversation(
        conversation: ConversationState,
        model_choice: impl Into<String>,
        worker_language: impl Into<String>,
    ) -> Self {
        Self {
            id: SessionId::random().to_string(),
            conversation,
            turn: InProgressTurn::default(),
            transcript: Transcript::new(),
            model_choice: model_choice.into(),
            worker_language: worker_language.into(),
            fatal: None,
        }
    }

    /// Records a user message and marks the turn for a new request
    pub fn add_user_text(&mut self, text: &str) {
        self.conversation.push(Message::text(Role::User, text));
        self.transcript.push(TranscriptEntry::user(text));
        self.turn.signal = CompletionSignal::Streaming;
    }

    /// Makes room for the streamed reply before each request: after function
    /// output a new row is started, otherwise the user row is answered
    pub fn prepare_reply_entry(&mut self) {
        match self.transcript.last_mut() {
            Some(entry) if entry.user.is_some() => entry.assistant = Some(String::new()),
            _ => self.transcript.push(TranscriptEntry::assistant("")),
        }
    }

    /// Assistant text of the last transcript row
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.transcript.last().and_then(|e| e.assistant.as_deref())
    }

    pub fn is_function_call_by_language(&self) -> bool {
        self.turn
            .function_name
            .as_deref()
            .is_some_and(|name| name.eq_ignore_ascii_case(&self.worker_language))
    }

    /// Back to the state right after initialization
    pub fn restart(&mut self) {
        self.conversation.reset();
        self.transcript.clear();
        self.turn = InProgressTurn::default();
        self.fatal = None;
    }
}

/// Random session identifier, used to namespace per-session files
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionId(u64);

impl SessionId {
    pub fn random() -> Self {
        Self(rand::thread_rng().gen())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
