pub mod cli;
pub mod config;
pub mod executor;
pub mod llm;
pub mod logging;
pub mod session;
pub mod ui;
