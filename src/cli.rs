use clap::Parser;
use std::path::PathBuf;

/// Define the application arguments
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Model choice from the configuration (e.g. "GPT-4")
    #[arg(short = 'm', long)]
    pub model: Option<String>,

    /// Send a single message, print the transcript and exit
    #[arg(short, long)]
    pub task: Option<String>,

    /// Enable verbose logging (use multiple times for more verbosity)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Record API responses to a file
    #[arg(long)]
    pub record: Option<PathBuf>,

    /// Play back a recorded session from a file instead of calling the API
    #[arg(long, conflicts_with = "record")]
    pub playback: Option<PathBuf>,

    /// Fast playback mode - ignore chunk timing when playing recordings
    #[arg(long, requires = "playback")]
    pub fast_playback: bool,
}

impl Args {
    pub fn parse() -> Self {
        <Args as Parser>::parse()
    }
}

/// A line typed at the interactive prompt
#[derive(Debug, PartialEq, Eq)]
pub enum ReplCommand<'a> {
    /// `/restart`
    Restart,
    /// `/model <choice>`
    Model(&'a str),
    Message(&'a str),
}

impl<'a> ReplCommand<'a> {
    pub fn parse(line: &'a str) -> Self {
        let line = line.trim();
        if line == "/restart" {
            return ReplCommand::Restart;
        }
        match line.strip_prefix("/model") {
            Some(rest) if rest.is_empty() || rest.starts_with(char::is_whitespace) => {
                ReplCommand::Model(rest.trim())
            }
            _ => ReplCommand::Message(line),
        }
    }
}
