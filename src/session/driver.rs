use super::dispatch::{self, PendingCall, Step};
use super::error::SessionError;
use super::render::ImageCache;
use super::state::{CompletionSignal, InProgressTurn, SessionState, TranscriptEntry};
use crate::config::Config;
use crate::executor::FunctionRegistry;
use crate::llm::{ChatRequest, ChatTransport, ChunkStream};
use crate::ui::TranscriptView;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverState {
    AwaitingUserInput,
    StreamingReply,
    /// The model requested a function call which is being executed
    AwaitingFunctionResult,
    Terminated(String),
}

/// Runs the turns of one session against the transport.
///
/// Every request streams until a finish reason arrives. A completed function
/// call is executed and its result sent back in a follow-up request, until
/// the model stops on its own. Fatal errors end the session; only a restart
/// brings it back.
pub struct TurnDriver {
    session: SessionState,
    state: DriverState,
    images: ImageCache,
    transport: Arc<dyn ChatTransport>,
    functions: Arc<FunctionRegistry>,
    config: Arc<Config>,
    view: Arc<dyn TranscriptView>,
}

impl TurnDriver {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        functions: Arc<FunctionRegistry>,
        config: Arc<Config>,
        view: Arc<dyn TranscriptView>,
    ) -> Self {
        let session = SessionState::new(config.default_model.clone(), config.worker_language.clone());
        let images = ImageCache::for_session(&session.id);
        Self {
            session,
            state: DriverState::AwaitingUserInput,
            images,
            transport,
            functions,
            config,
            view,
        }
    }

    /// Keeps decoded images under `root` instead of the user cache directory
    pub fn with_image_root(mut self, root: &Path) -> Self {
        self.images = ImageCache::new(root, &self.session.id);
        self
    }

    pub fn session(&self) -> &SessionState {
        &self.session
    }

    pub fn state(&self) -> &DriverState {
        &self.state
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.session.transcript
    }

    pub fn set_model_choice(&mut self, choice: &str) -> Result<(), SessionError> {
        self.model_name(choice)?;
        info!("Switching model to {}", choice);
        self.session.model_choice = choice.to_string();
        Ok(())
    }

    /// Appends the user's text and streams until the model waits for input
    /// again
    pub async fn submit_user_text(&mut self, text: &str) -> Result<(), SessionError> {
        if let DriverState::Terminated(reason) = &self.state {
            return Err(SessionError::Terminated(reason.clone()));
        }
        self.model_name(&self.session.model_choice)?;

        self.session.add_user_text(text);
        self.state = DriverState::StreamingReply;
        self.run().await
    }

    /// Back to a fresh conversation with the same model choice
    pub fn restart(&mut self) {
        info!("Restarting session {}", self.session.id);
        self.session.restart();
        if let Err(e) = self.images.clear() {
            warn!("Failed to clear image cache: {:#}", e);
        }
        self.state = DriverState::AwaitingUserInput;
        if let Err(e) = self.view.clear() {
            warn!("Failed to clear view: {}", e);
        }
    }

    async fn run(&mut self) -> Result<(), SessionError> {
        while self.session.turn.signal.requires_request() {
            let model = match self.model_name(&self.session.model_choice) {
                Ok(model) => model,
                Err(e) => {
                    self.session.turn = InProgressTurn::default();
                    self.state = DriverState::AwaitingUserInput;
                    return Err(e);
                }
            };

            self.state = DriverState::StreamingReply;
            self.session.prepare_reply_entry();
            self.render();

            let request = ChatRequest {
                model,
                messages: self.session.conversation.to_chat_messages(),
                functions: Some(self.functions.definitions().to_vec()),
            };
            info!(
                "Sending request with {} messages to {}",
                request.messages.len(),
                request.model
            );

            let mut stream = match self.transport.stream_chat(request).await {
                Ok(stream) => stream,
                Err(e) => return Err(self.fail(SessionError::Transport(format!("{:#}", e)))),
            };
            self.stream_turn(stream.as_mut()).await?;
        }

        self.state = DriverState::AwaitingUserInput;
        if let Err(e) = self.view.turn_complete(&self.session.transcript) {
            warn!("Failed to render transcript: {}", e);
        }
        Ok(())
    }

    /// Pulls chunks until the turn completes. Stops at the first fatal step
    /// without draining the stream.
    async fn stream_turn(&mut self, stream: &mut dyn ChunkStream) -> Result<(), SessionError> {
        loop {
            let chunk = match stream.next_chunk().await {
                Ok(Some(chunk)) => chunk,
                Ok(None) => return Err(self.fail(SessionError::IncompleteStream)),
                Err(e) => return Err(self.fail(SessionError::Transport(format!("{:#}", e)))),
            };

            let finished = chunk
                .first_choice()
                .is_some_and(|choice| choice.finish_reason.is_some());
            let step = dispatch::apply_chunk(&chunk, &mut self.session);
            self.render();

            match step {
                Step::Continue if finished => return Ok(()),
                Step::Continue => {}
                Step::Execute(call) => return self.execute(call).await,
                Step::Fatal(e) => return Err(self.terminate(e)),
            }
        }
    }

    async fn execute(&mut self, call: PendingCall) -> Result<(), SessionError> {
        self.state = DriverState::AwaitingFunctionResult;
        info!("Executing function '{}'", call.name);
        debug!("Code:\n{}", call.code);

        let result = self.functions.invoke(&call.name, &call.code).await;
        let step = dispatch::finish_function_call(&mut self.session, &call, result, &mut self.images);
        self.render();

        match step {
            Step::Fatal(e) => Err(self.terminate(e)),
            _ => Ok(()),
        }
    }

    fn model_name(&self, choice: &str) -> Result<String, SessionError> {
        match self.config.model(choice) {
            Some(model) if model.available => Ok(model.model_name.clone()),
            _ => Err(SessionError::ModelUnavailable(choice.to_string())),
        }
    }

    /// Ends the session for an error raised outside the dispatcher, keeping
    /// everything shown so far and appending the error
    fn fail(&mut self, error: SessionError) -> SessionError {
        self.session
            .transcript
            .push(TranscriptEntry::assistant(format!("Error: {error}")));
        self.session.turn = InProgressTurn::with_signal(CompletionSignal::Error);
        self.session.fatal = Some(error.to_string());
        self.terminate(error)
    }

    fn terminate(&mut self, error: SessionError) -> SessionError {
        error!("Session {} terminated: {}", self.session.id, error);
        self.state = DriverState::Terminated(error.to_string());
        if let Err(e) = self.view.turn_complete(&self.session.transcript) {
            warn!("Failed to render transcript: {}", e);
        }
        error
    }

    fn render(&self) {
        if let Err(e) = self.view.render(&self.session.transcript) {
            warn!("Failed to render transcript: {}", e);
        }
    }
}
