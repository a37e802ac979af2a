use std::fs::OpenOptions;
use std::io;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Log to stderr, filtered by `RUST_LOG` or the verbosity count
pub fn setup_logging(verbose_level: u8) {
    setup_logging_with_file(verbose_level, None);
}

/// For the interactive terminal, log to a file so output does not interleave
/// with the streamed transcript
pub fn setup_logging_for_terminal_ui(verbose_level: u8) {
    let log_file_path = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("synapse-chat")
        .join("terminal-ui.log");

    if let Some(parent) = log_file_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    setup_logging_with_file(verbose_level, Some(log_file_path));
}

fn filter_for(verbose_level: u8) -> EnvFilter {
    if std::env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }
    let filter_str = match verbose_level {
        0 => "warn,synapse_chat=info",
        1 => "info,synapse_chat=debug",
        _ => "debug,synapse_chat=trace",
    };
    EnvFilter::new(filter_str)
}

fn setup_logging_with_file(verbose_level: u8, log_file: Option<PathBuf>) {
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter_for(verbose_level))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_level(true);

    let file = log_file.and_then(|path| {
        match OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => Some(file),
            Err(e) => {
                eprintln!(
                    "Warning: Could not open log file {:?} ({}), falling back to stderr",
                    path, e
                );
                None
            }
        }
    });

    match file {
        Some(file) => subscriber
            .with_ansi(false)
            .with_writer(move || -> Box<dyn io::Write + Send> {
                match file.try_clone() {
                    Ok(handle) => Box::new(handle),
                    Err(_) => Box::new(io::stderr()),
                }
            })
            .init(),
        None => subscriber.with_writer(io::stderr).init(),
    }
}
