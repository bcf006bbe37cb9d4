//! Command-line interface built on clap.
//!
//! [`Cli`] carries the subcommands [`Command`] (run, transcribe) and the
//! global flags (--config, --verbose, --json-logs).

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// voxbot: transcribes Telegram voice messages with Yandex SpeechKit.
#[derive(Debug, Parser)]
#[command(name = "voxbot", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Path to the TOML configuration file.
    #[arg(long, global = true, default_value = "voxbot.toml")]
    pub config: PathBuf,

    /// Enable debug output.
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long, global = true, default_value_t = false)]
    pub json_logs: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the Telegram bot until interrupted.
    Run,

    /// Transcribe a local audio file through the full pipeline.
    Transcribe {
        /// Path to an OGG/Opus or MP3 file.
        file: PathBuf,

        /// Recognition language, overriding the configured one.
        #[arg(long)]
        language: Option<String>,
    },
}
