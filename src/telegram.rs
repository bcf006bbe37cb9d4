//! Telegram ingress and outbound messenger.
//!
//! Voice messages, audio files and `audio/*` documents are downloaded and
//! admitted into the [`Supervisor`]; the user gets an acknowledgment right
//! away and the transcript later through [`TelegramMessenger`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use teloxide::RequestError;
use teloxide::payloads::SendMessageSetters;
use teloxide::prelude::*;
use teloxide::types::{FileMeta, ReplyParameters};
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

use crate::error::{AdmitError, BotError, GatewayError};
use crate::gateway::Messenger;
use crate::job::{AudioPayload, ChatRef, JobId, JobState};
use crate::supervisor::Supervisor;

/// Telegram's limit on a single text message, in characters.
const MESSAGE_LIMIT: usize = 4096;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase", description = "Supported commands:")]
pub enum Command {
    #[command(description = "how to use this bot")]
    Start,
    #[command(description = "show the state of a job: /status [job id]")]
    Status(String),
}

/// Upper bound on one file download from Telegram.
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Shared state of the message handlers.
pub struct Ingress {
    pub supervisor: Supervisor,
    pub downloader: FileDownloader,
    pub max_payload_bytes: usize,
}

/// Fetches file contents from the Telegram file API.
pub struct FileDownloader {
    http: reqwest::Client,
}

impl FileDownloader {
    pub fn new(timeout: Duration) -> Result<Self, BotError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(timeout)
            .build()?;
        Ok(Self { http })
    }

    async fn fetch(&self, url: &str) -> Result<Bytes, GatewayError> {
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(GatewayError::from_status(status.as_u16(), "file download failed"));
        }
        Ok(response.bytes().await?)
    }
}

/// An audio file attached to an incoming message.
#[derive(Debug, Clone)]
struct AudioAttachment {
    file: FileMeta,
    file_name: String,
    mime_type: Option<String>,
}

impl AudioAttachment {
    fn from_message(msg: &Message) -> Option<Self> {
        if let Some(voice) = msg.voice() {
            return Some(Self {
                file: voice.file.clone(),
                file_name: "voice.ogg".to_string(),
                mime_type: Some(
                    voice
                        .mime_type
                        .as_ref()
                        .map(|m| m.essence_str().to_owned())
                        .unwrap_or_else(|| "audio/ogg".to_string()),
                ),
            });
        }
        if let Some(audio) = msg.audio() {
            return Some(Self {
                file: audio.file.clone(),
                file_name: audio.file_name.clone().unwrap_or_else(|| "audio".to_string()),
                mime_type: audio.mime_type.as_ref().map(|m| m.essence_str().to_owned()),
            });
        }
        let document = msg.document()?;
        let mime = document.mime_type.as_ref()?.essence_str().to_owned();
        if !mime.starts_with("audio/") {
            return None;
        }
        Some(Self {
            file: document.file.clone(),
            file_name: document.file_name.clone().unwrap_or_else(|| "audio".to_string()),
            mime_type: Some(mime),
        })
    }

    /// Size as reported by Telegram, before anything is downloaded.
    fn exceeds(&self, limit: usize) -> bool {
        self.file.size as usize > limit
    }
}

impl Ingress {
    async fn download(&self, bot: &Bot, attachment: &AudioAttachment) -> Result<AudioPayload, GatewayError> {
        let file = bot
            .get_file(attachment.file.id.clone())
            .await
            .map_err(classify_request_error)?;
        let url = format!("https://api.telegram.org/file/bot{}/{}", bot.token(), file.path);
        let bytes = self.downloader.fetch(&url).await?;

        let payload = AudioPayload::new(bytes, attachment.file_name.clone());
        Ok(match &attachment.mime_type {
            Some(mime) => payload.with_mime_type(mime.clone()),
            None => payload,
        })
    }
}

/// Run the long-polling dispatcher until Ctrl-C.
pub async fn run(bot: Bot, ingress: Arc<Ingress>) {
    if let Err(err) = bot.set_my_commands(Command::bot_commands()).await {
        warn!(%err, "failed to register bot commands");
    }

    let handler = dptree::entry()
        .branch(
            Update::filter_message()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(Update::filter_message().endpoint(handle_audio));

    info!("starting Telegram dispatcher");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![ingress])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
}

async fn handle_command(bot: Bot, msg: Message, cmd: Command, ingress: Arc<Ingress>) -> ResponseResult<()> {
    let text = match cmd {
        Command::Start => format!(
            "Send me a voice message and I'll reply with its transcript.\n\n{}",
            Command::descriptions()
        ),
        Command::Status(arg) if arg.trim().is_empty() => {
            format!("Jobs in progress: {}", ingress.supervisor.in_flight().await)
        }
        Command::Status(arg) => match JobId::parse(&arg) {
            Some(job_id) => status_reply(job_id, ingress.supervisor.status(job_id).await),
            None => "Usage: /status [job id]".to_string(),
        },
    };
    bot.send_message(msg.chat.id, text)
        .reply_parameters(ReplyParameters::new(msg.id))
        .await?;
    Ok(())
}

async fn handle_audio(bot: Bot, msg: Message, ingress: Arc<Ingress>) -> ResponseResult<()> {
    let Some(attachment) = AudioAttachment::from_message(&msg) else {
        return Ok(());
    };
    let chat = ChatRef(msg.chat.id.0.to_string());

    if attachment.exceeds(ingress.max_payload_bytes) {
        bot.send_message(msg.chat.id, "This file is too large to transcribe.")
            .reply_parameters(ReplyParameters::new(msg.id))
            .await?;
        return Ok(());
    }

    let payload = match ingress.download(&bot, &attachment).await {
        Ok(payload) => payload,
        Err(err) => {
            error!(%err, %chat, "failed to download audio");
            bot.send_message(msg.chat.id, "Couldn't fetch this audio from Telegram. Please send it again.")
                .reply_parameters(ReplyParameters::new(msg.id))
                .await?;
            return Ok(());
        }
    };

    let reply = match ingress.supervisor.admit(chat, payload).await {
        Ok(job_id) => format!("Got it, transcribing. Job id: {job_id}"),
        Err(AdmitError::CapacityRejected { .. }) => {
            "I'm busy with other messages right now. Please try again in a few minutes.".to_string()
        }
    };
    bot.send_message(msg.chat.id, reply)
        .reply_parameters(ReplyParameters::new(msg.id))
        .await?;
    Ok(())
}

fn status_reply(job_id: JobId, state: Option<JobState>) -> String {
    match state {
        Some(state) => format!("Job {job_id}: {state}"),
        None => format!("Job {job_id} is not in progress. It may have finished already."),
    }
}

fn classify_request_error(err: RequestError) -> GatewayError {
    match err {
        RequestError::RetryAfter(_) | RequestError::Network(_) | RequestError::Io(_) => {
            GatewayError::Transient(err.to_string())
        }
        other => GatewayError::Permanent(other.to_string()),
    }
}

/// Split `text` into pieces of at most `limit` characters, preferring to
/// break at newlines, then at spaces.
fn split_message(text: &str, limit: usize) -> Vec<String> {
    let mut parts = Vec::new();
    let mut rest = text.trim();
    while rest.chars().count() > limit {
        let hard_end = rest
            .char_indices()
            .nth(limit)
            .map(|(i, _)| i)
            .unwrap_or(rest.len());
        let window = &rest[..hard_end];
        let cut = window
            .rfind('\n')
            .or_else(|| window.rfind(' '))
            .filter(|&i| i > 0)
            .unwrap_or(hard_end);
        parts.push(rest[..cut].trim_end().to_string());
        rest = rest[cut..].trim_start();
    }
    if !rest.is_empty() || parts.is_empty() {
        parts.push(rest.to_string());
    }
    parts
}

/// Delivers dispatch messages as Telegram chat messages. `ChatRef` holds the
/// numeric chat id.
pub struct TelegramMessenger {
    bot: Bot,
}

impl TelegramMessenger {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl Messenger for TelegramMessenger {
    async fn send(&self, chat: &ChatRef, text: &str) -> Result<(), GatewayError> {
        let chat_id: i64 = chat
            .0
            .parse()
            .map_err(|_| GatewayError::Permanent(format!("invalid chat id: {chat}")))?;
        for part in split_message(text, MESSAGE_LIMIT) {
            self.bot
                .send_message(ChatId(chat_id), part)
                .await
                .map_err(classify_request_error)?;
        }
        Ok(())
    }
}
