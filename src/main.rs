mod cli;
mod config;
mod error;
mod gateway;
mod job;
mod logging;
mod stages;
mod supervisor;
mod telegram;
mod ui;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::Parser;
use teloxide::Bot;
use tracing::info;

use cli::{Cli, Command};
use config::BotConfig;
use error::BotError;
use gateway::{S3Store, SpeechKitClient};
use job::{AudioPayload, ChatRef, JobState};
use supervisor::{Gateways, Supervisor, SupervisorSettings};
use telegram::{FileDownloader, Ingress, TelegramMessenger};
use ui::{CONSOLE_CHAT, JobProgress};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.json_logs);

    let mut config = BotConfig::load(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;

    match cli.command {
        Command::Run => run_bot(config).await,
        Command::Transcribe { file, language } => {
            if let Some(language) = language {
                config.speechkit.language = language;
            }
            transcribe(config, &file).await
        }
    }
}

async fn run_bot(config: BotConfig) -> Result<()> {
    if config.telegram.bot_token.is_empty() {
        return Err(BotError::MissingCredentials("Telegram bot token (TELEGRAM_BOT_TOKEN)").into());
    }
    let bot = Bot::new(&config.telegram.bot_token);

    let gateways = Gateways {
        store: Arc::new(S3Store::new(&config.storage)?),
        recognizer: Arc::new(SpeechKitClient::new(&config.speechkit)?),
        messenger: Arc::new(TelegramMessenger::new(bot.clone())),
    };
    let supervisor = Supervisor::new(SupervisorSettings::from_config(&config), gateways);
    let ingress = Arc::new(Ingress {
        supervisor,
        downloader: FileDownloader::new(telegram::DOWNLOAD_TIMEOUT)?,
        max_payload_bytes: config.supervisor.max_payload_bytes,
    });

    info!(
        capacity = config.supervisor.capacity,
        bucket = %config.storage.bucket,
        language = %config.speechkit.language,
        "voxbot started"
    );
    telegram::run(bot, ingress).await;
    info!("voxbot stopped");
    Ok(())
}

async fn transcribe(config: BotConfig, file: &Path) -> Result<()> {
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;
    let file_name = file
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "audio".to_string());

    let store = Arc::new(S3Store::new(&config.storage)?);
    let recognizer = Arc::new(SpeechKitClient::new(&config.speechkit)?);

    let progress = JobProgress::start(&file_name);
    let gateways = Gateways {
        store,
        recognizer,
        messenger: Arc::new(progress.messenger()),
    };
    let (supervisor, mut reports) =
        Supervisor::with_reports(SupervisorSettings::from_config(&config), gateways);

    let job_id = supervisor
        .admit(ChatRef(CONSOLE_CHAT.to_string()), AudioPayload::new(bytes, file_name))
        .await?;

    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let report = loop {
        tokio::select! {
            report = reports.recv() => break report,
            _ = ticker.tick() => {
                if let Some(state) = supervisor.status(job_id).await {
                    progress.update_state(state);
                }
            }
        }
    };
    let report = report.context("supervisor stopped before reporting the job")?;

    progress.complete(&report);
    progress.print_report(&report);
    if report.state != JobState::Succeeded {
        bail!("job {job_id} ended in {}", report.state);
    }
    Ok(())
}
