//! Chunk dispatcher
//!
//! Each streamed chunk is folded into the session through an ordered table of
//! rules. A rule is a guard over the chunk and the current state plus an
//! update applied when the guard holds. Every rule is evaluated for every
//! chunk, in table order, so one chunk may fire several of them.

use super::error::SessionError;
use super::extract::extract_code;
use super::render::{code_block, function_output_entries, ImageCache};
use super::state::{CompletionSignal, InProgressTurn, Message, Role, SessionState, TranscriptEntry};
use crate::executor::{ExecutionOutput, EXECUTE_CODE_FUNCTION};
use crate::llm::{ChatChunk, ChunkChoice, FinishReason, FunctionCall};
use tracing::{debug, error, trace};

/// Function call resolved at the end of a turn, waiting to be executed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    pub name: String,
    /// Raw argument string as streamed by the model
    pub arguments: String,
    pub code: String,
}

#[derive(Debug)]
pub enum Step {
    Continue,
    Execute(PendingCall),
    Fatal(SessionError),
}

type Guard = fn(&ChunkChoice, &SessionState) -> bool;
type Apply = fn(&ChunkChoice, &mut SessionState) -> Step;

pub struct Rule {
    pub name: &'static str,
    guard: Guard,
    apply: Apply,
}

impl Rule {
    pub fn matches(&self, choice: &ChunkChoice, state: &SessionState) -> bool {
        (self.guard)(choice, state)
    }

    pub fn apply(&self, choice: &ChunkChoice, state: &mut SessionState) -> Step {
        (self.apply)(choice, state)
    }
}

pub static RULES: [Rule; 5] = [
    Rule {
        name: "role",
        guard: has_new_role,
        apply: apply_role,
    },
    Rule {
        name: "content",
        guard: has_content,
        apply: apply_content,
    },
    Rule {
        name: "function_name",
        guard: has_new_function_name,
        apply: apply_function_name,
    },
    Rule {
        name: "function_arguments",
        guard: has_function_arguments,
        apply: apply_function_arguments,
    },
    Rule {
        name: "completion",
        guard: has_finish_reason,
        apply: apply_completion,
    },
];

fn has_new_role(choice: &ChunkChoice, state: &SessionState) -> bool {
    choice.delta.role.is_some() && state.turn.role.is_none()
}

fn has_content(choice: &ChunkChoice, _: &SessionState) -> bool {
    choice.delta.content.is_some()
}

fn has_new_function_name(choice: &ChunkChoice, state: &SessionState) -> bool {
    state.turn.function_name.is_none()
        && choice
            .delta
            .function_call
            .as_ref()
            .is_some_and(|call| call.name.is_some())
}

fn has_function_arguments(choice: &ChunkChoice, _: &SessionState) -> bool {
    choice
        .delta
        .function_call
        .as_ref()
        .is_some_and(|call| call.arguments.is_some())
}

fn has_finish_reason(choice: &ChunkChoice, _: &SessionState) -> bool {
    choice.finish_reason.is_some()
}

/// Applies one chunk to the session. Chunks without choices are skipped.
pub fn apply_chunk(chunk: &ChatChunk, state: &mut SessionState) -> Step {
    let Some(choice) = chunk.first_choice() else {
        trace!("Skipping chunk without choices");
        return Step::Continue;
    };

    let mut outcome = Step::Continue;
    for rule in RULES.iter() {
        if !rule.matches(choice, state) {
            continue;
        }
        trace!("Applying rule '{}'", rule.name);
        match rule.apply(choice, state) {
            Step::Continue => {}
            Step::Fatal(e) => return Step::Fatal(e),
            step => outcome = step,
        }
    }
    outcome
}

fn apply_role(choice: &ChunkChoice, state: &mut SessionState) -> Step {
    if let Some(label) = &choice.delta.role {
        state.turn.role = Some(Role::from_label(label));
    }
    Step::Continue
}

fn apply_content(choice: &ChunkChoice, state: &mut SessionState) -> Step {
    if let Some(content) = &choice.delta.content {
        state.turn.content.push_str(content);
        let full = state.turn.content.clone();
        set_last_assistant(state, full);
    }
    Step::Continue
}

fn apply_function_name(choice: &ChunkChoice, state: &mut SessionState) -> Step {
    let name = choice
        .delta
        .function_call
        .as_ref()
        .and_then(|call| call.name.clone());
    debug!("Function call started: {:?}", name);
    state.turn.function_name = name;
    state.turn.snapshot = Some(state.transcript.clone());
    Step::Continue
}

fn apply_function_arguments(choice: &ChunkChoice, state: &mut SessionState) -> Step {
    let Some(fragment) = choice
        .delta
        .function_call
        .as_ref()
        .and_then(|call| call.arguments.as_deref())
    else {
        return Step::Continue;
    };
    state.turn.function_args.push_str(fragment);

    let code = if state.is_function_call_by_language() {
        Some(state.turn.function_args.clone())
    } else {
        extract_code(&state.turn.function_args, false)
    };

    if let Some(code) = code {
        show_code(state, &code);
    }
    Step::Continue
}

fn apply_completion(choice: &ChunkChoice, state: &mut SessionState) -> Step {
    let Some(reason) = &choice.finish_reason else {
        return Step::Continue;
    };
    debug!("Turn finished: {}", reason);

    if !state.turn.content.is_empty() {
        let message = Message::text(state.turn.role_or_assistant(), state.turn.content.clone());
        state.conversation.push(message);
    }
    state.turn.signal = CompletionSignal::from(reason);

    if *reason != FinishReason::FunctionCall {
        state.turn = InProgressTurn::with_signal(state.turn.signal.clone());
        return Step::Continue;
    }

    let arguments = state.turn.function_args.clone();
    let code = if state.is_function_call_by_language() {
        Some(arguments.clone())
    } else {
        extract_code(&arguments, true)
    };

    let Some(code) = code else {
        error!("Malformed function arguments: {}", arguments);
        state
            .transcript
            .push(TranscriptEntry::assistant(format!(
                "GPT generate wrong function args: {arguments}"
            )));
        terminate(state, format!("malformed function arguments: {arguments}"));
        return Step::Fatal(SessionError::MalformedArguments(arguments));
    };

    show_code(state, &code);
    let name = state
        .turn
        .function_name
        .clone()
        .unwrap_or_else(|| EXECUTE_CODE_FUNCTION.to_string());
    state.turn = InProgressTurn::with_signal(CompletionSignal::AwaitingFunctionResult);

    Step::Execute(PendingCall {
        name,
        arguments,
        code,
    })
}

/// Folds the executor's answer for `call` into the session.
///
/// On success the terminal output (and any images) is appended to the
/// transcript, and the call plus its result are added to the conversation
/// so the next request carries them. A failure ends the session.
pub fn finish_function_call(
    state: &mut SessionState,
    call: &PendingCall,
    result: anyhow::Result<ExecutionOutput>,
    images: &mut ImageCache,
) -> Step {
    match result {
        Ok(output) => {
            let entries = function_output_entries(&output, images);
            state.transcript.extend(entries);

            state.conversation.push(Message {
                role: Role::Assistant,
                text: None,
                name: None,
                function_call: Some(FunctionCall {
                    name: call.name.clone(),
                    arguments: call.arguments.clone(),
                }),
            });
            state.conversation.push(Message {
                role: Role::Function,
                text: Some(output.text_for_model),
                name: Some(call.name.clone()),
                function_call: None,
            });
            Step::Continue
        }
        Err(e) => {
            error!("Function '{}' failed: {:#}", call.name, e);
            state
                .transcript
                .push(TranscriptEntry::assistant(format!("Backend error: {e}")));
            terminate(state, format!("backend error: {e}"));
            Step::Fatal(SessionError::Execution(e.to_string()))
        }
    }
}

fn terminate(state: &mut SessionState, reason: String) {
    state.turn = InProgressTurn::with_signal(CompletionSignal::Error);
    state.fatal = Some(reason);
}

/// Restores the transcript from the function-call snapshot and appends the
/// current code block to its last entry
fn show_code(state: &mut SessionState, code: &str) {
    let snapshot = state
        .turn
        .snapshot
        .get_or_insert_with(|| state.transcript.clone())
        .clone();
    state.transcript = snapshot;

    let block = code_block(&state.worker_language, code);
    match state.transcript.last_mut() {
        Some(entry) => entry.assistant.get_or_insert_with(String::new).push_str(&block),
        None => state.transcript.push(TranscriptEntry::assistant(block)),
    }
}

fn set_last_assistant(state: &mut SessionState, text: String) {
    match state.transcript.last_mut() {
        Some(entry) => entry.assistant = Some(text),
        None => state.transcript.push(TranscriptEntry::assistant(text)),
    }
}
