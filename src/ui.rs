//! Terminal output for the `transcribe` command: spinner and colored results.
//!
//! [`JobProgress`] follows a single job in the terminal, and
//! [`ConsoleMessenger`] lets the supervisor deliver the transcript to stdout
//! without tearing the spinner.

use std::time::Duration;

use async_trait::async_trait;
use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::error::GatewayError;
use crate::gateway::Messenger;
use crate::job::{ChatRef, JobReport, JobState};

/// Chat reference used for jobs started from the command line.
pub const CONSOLE_CHAT: &str = "console";

pub struct JobProgress {
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
}

impl JobProgress {
    /// Start the spinner for the given audio file.
    pub fn start(file_name: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.set_message(format!("{}: {file_name}", JobState::Admitted));
        pb.enable_steady_tick(Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
        }
    }

    pub fn update_state(&self, state: JobState) {
        self.pb.set_message(format!("{state}"));
    }

    /// A messenger that prints above the spinner.
    pub fn messenger(&self) -> ConsoleMessenger {
        ConsoleMessenger {
            pb: self.pb.clone(),
            heading: self.yellow.clone(),
        }
    }

    /// Stop the spinner and print a one-line verdict.
    pub fn complete(&self, report: &JobReport) {
        self.pb.finish_and_clear();
        match (report.state, report.failure) {
            (JobState::Succeeded, _) => println!(
                "  {} Transcribed in {} ms",
                self.green.apply_to("✓"),
                report.duration_ms
            ),
            (state, Some(kind)) => println!("  {} Job {state}: {kind}", self.red.apply_to("✗")),
            (state, None) => println!("  {} Job {state}", self.red.apply_to("✗")),
        }
    }

    pub fn print_report(&self, report: &JobReport) {
        let style = if report.state == JobState::Succeeded {
            &self.green
        } else {
            &self.red
        };
        println!();
        println!("{}", style.apply_to("─── Job Report ───"));
        println!("{}", serde_json::to_string_pretty(report).unwrap_or_default());
    }
}

/// Prints dispatched messages instead of sending them anywhere.
pub struct ConsoleMessenger {
    pb: ProgressBar,
    heading: Style,
}

#[async_trait]
impl Messenger for ConsoleMessenger {
    async fn send(&self, chat: &ChatRef, text: &str) -> Result<(), GatewayError> {
        self.pb.println(format!("{}\n{text}", self.heading.apply_to(format!("[{chat}]"))));
        Ok(())
    }
}
