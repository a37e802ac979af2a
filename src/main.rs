use anyhow::{Context, Result};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::sync::Arc;
use std::time::Duration;
use synapse_chat::cli::{Args, ReplCommand};
use synapse_chat::config::Config;
use synapse_chat::executor::{CodeExecutor, DisabledExecutor, FunctionRegistry, ProcessExecutor};
use synapse_chat::llm::recording::PlaybackState;
use synapse_chat::llm::{APIRecorder, ChatTransport, OpenAIClient, PlaybackTransport};
use synapse_chat::logging::{setup_logging, setup_logging_for_terminal_ui};
use synapse_chat::session::{SessionError, TurnDriver};
use synapse_chat::ui::TerminalView;
use tracing::info;

fn create_transport(args: &Args, config: &Config) -> Result<Arc<dyn ChatTransport>> {
    // Playback replaces the network entirely
    if let Some(path) = &args.playback {
        let state = PlaybackState::from_file(path, args.fast_playback)?;
        if state.session_count() == 0 {
            anyhow::bail!("Recording file contains no sessions");
        }
        info!("Playing back {} recorded sessions", state.session_count());
        return Ok(Arc::new(PlaybackTransport::new(state)));
    }

    let mut client = OpenAIClient::from_config(config).context("Failed to set up the API client")?;
    if let Some(path) = &args.record {
        client = client.with_recorder(Arc::new(APIRecorder::new(path)));
    }
    Ok(Arc::new(client))
}

fn create_functions(config: &Config) -> FunctionRegistry {
    let executor: Arc<dyn CodeExecutor> = match &config.code_execution {
        Some(execution) => Arc::new(ProcessExecutor::new(
            &execution.interpreter,
            Duration::from_secs(execution.timeout_secs),
        )),
        None => Arc::new(DisabledExecutor),
    };
    FunctionRegistry::for_code_execution(executor, &config.worker_language)
}

async fn run_interactive(driver: &mut TurnDriver) -> Result<()> {
    let mut editor = DefaultEditor::new().context("Failed to initialize the line editor")?;
    println!(
        "Chatting with {}. Type /model <choice> to switch models, /restart to start over.",
        driver.session().model_choice
    );

    loop {
        let line = match editor.readline("> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        };
        if line.trim().is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line.as_str());

        match ReplCommand::parse(&line) {
            ReplCommand::Restart => {
                driver.restart();
                println!("Session restarted.");
            }
            ReplCommand::Model(choice) => match driver.set_model_choice(choice) {
                Ok(()) => println!("Using {}.", choice),
                Err(e) => eprintln!("{}", e),
            },
            ReplCommand::Message(text) => {
                if let Err(e) = driver.submit_user_text(text).await {
                    eprintln!("{}", e);
                    if !matches!(e, SessionError::ModelUnavailable(_)) {
                        eprintln!("Type /restart to begin a new session.");
                    }
                }
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();

    if args.task.is_some() {
        setup_logging(args.verbose);
    } else {
        setup_logging_for_terminal_ui(args.verbose);
    }

    let config = Config::load(args.config.as_deref())?;
    let transport = create_transport(&args, &config)?;
    let functions = Arc::new(create_functions(&config));
    let mut driver = TurnDriver::new(
        transport,
        functions,
        Arc::new(config),
        Arc::new(TerminalView::stdout()),
    );

    if let Some(model) = &args.model {
        driver.set_model_choice(model)?;
    }

    match &args.task {
        Some(task) => {
            driver.submit_user_text(task).await?;
            Ok(())
        }
        None => run_interactive(&mut driver).await,
    }
}
