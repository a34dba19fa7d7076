//! Kestrel Telegram Adapter
//!
//! Telegram Bot API long-polling with offset persistence, client recreation,
//! Markdown-with-fallback sending, message chunking and file download

use anyhow::{anyhow, Result};
use kestrel_config::TelegramAccount;
use kestrel_ipc::{Envelope, EventBus, MessageKind, OutboundMessage};
use reqwest::{Client, ClientBuilder};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

pub const TELEGRAM_MAX_MESSAGE_LEN: usize = 4096;
pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Bot API refuses getFile downloads above 20 MB.
pub const MAX_DOWNLOAD_BYTES: usize = 20 * 1024 * 1024;

const BOT_COMMANDS: &[(&str, &str)] = &[
    ("start", "Welcome message"),
    ("help", "List commands"),
    ("analyze", "Fetch a page and explain it"),
    ("capture", "Record a page's network traffic"),
    ("cache", "Cache statistics (/cache clear)"),
    ("kb", "List knowledge-base files"),
    ("stats", "Usage statistics"),
    ("history", "Recent captures"),
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramMessage {
    pub message_id: i64,
    pub text: Option<String>,
    pub caption: Option<String>,
    #[serde(default)]
    pub document: Option<TelegramDocument>,
    pub chat: TelegramChat,
    pub from: Option<TelegramUser>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramDocument {
    pub file_id: String,
    #[serde(default)]
    pub mime_type: Option<String>,
    #[serde(default)]
    pub file_name: Option<String>,
    #[serde(default)]
    pub file_size: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
    #[serde(rename = "type")]
    pub chat_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: Option<bool>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct TelegramFile {
    file_path: Option<String>,
    #[serde(default)]
    file_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

impl<T> ApiResponse<T> {
    fn into_result(self, endpoint: &str) -> Result<T> {
        if !self.ok {
            return Err(anyhow!(
                "telegram {} returned ok=false: {}",
                endpoint,
                self.description.unwrap_or_default()
            ));
        }
        self.result
            .ok_or_else(|| anyhow!("telegram {} response has no result", endpoint))
    }
}

/// A Bot API call that Telegram did not accept.
#[derive(Debug, thiserror::Error)]
enum Rejection {
    #[error("telegram {method} request failed: {reason}")]
    Unanswered { method: String, reason: String },

    #[error("telegram {method} HTTP {status}: {description}")]
    Refused {
        method: String,
        status: u16,
        description: String,
    },
}

impl Rejection {
    fn reply_target_missing(&self) -> bool {
        match self {
            Self::Refused { description, .. } => description
                .to_ascii_lowercase()
                .contains("message to be replied not found"),
            Self::Unanswered { .. } => false,
        }
    }
}

/// Removes `field` from a JSON payload, reporting whether it was there.
fn take_field(payload: &mut serde_json::Value, field: &str) -> bool {
    payload
        .as_object_mut()
        .is_some_and(|obj| obj.remove(field).is_some())
}

/// Splits `text` into pieces of at most `limit` characters, preferring to
/// cut right after a newline, space or sentence punctuation. The pieces
/// concatenate back to the input.
pub fn chunk_message(text: &str, limit: usize) -> Vec<String> {
    let limit = limit.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= limit {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    while start < chars.len() {
        let mut end = (start + limit).min(chars.len());

        if end < chars.len() {
            let mut split = end;
            for i in (start..end).rev() {
                let c = chars[i];
                if c == '\n' || c == ' ' || c == '.' || c == '!' || c == '?' {
                    split = i + 1;
                    break;
                }
            }
            if split > start {
                end = split;
            }
        }

        chunks.push(chars[start..end].iter().collect::<String>());
        start = end;
    }

    chunks
}

pub struct TelegramAdapter {
    client: Client,
    bot_token: String,
    account_tag: String,
    account: TelegramAccount,
    api_url: String,
    file_url: String,
    data_dir: PathBuf,
    poll_timeout_secs: u64,
    client_recreate_interval_secs: u64,
    event_bus: Option<EventBus>,
}

impl TelegramAdapter {
    pub fn new(
        account: &TelegramAccount,
        data_dir: PathBuf,
        config_timeout: Option<u64>,
        config_recreate: Option<u64>,
    ) -> Self {
        let mut adapter = Self {
            client: Self::build_client(),
            bot_token: account.bot_token.clone(),
            account_tag: account.account_tag(),
            account: account.clone(),
            api_url: String::new(),
            file_url: String::new(),
            data_dir,
            poll_timeout_secs: config_timeout.unwrap_or(60),
            client_recreate_interval_secs: config_recreate.unwrap_or(60).max(1),
            event_bus: None,
        };
        adapter.set_api_base(DEFAULT_API_BASE);
        adapter
    }

    /// Points the adapter at another Bot API server (a local `telegram-bot-api`).
    pub fn with_api_base(mut self, base: &str) -> Self {
        self.set_api_base(base);
        self
    }

    fn set_api_base(&mut self, base: &str) {
        let base = base.trim_end_matches('/');
        self.api_url = format!("{}/bot{}", base, self.bot_token);
        self.file_url = format!("{}/file/bot{}", base, self.bot_token);
    }

    pub fn with_event_bus(mut self, event_bus: EventBus) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    pub fn account_tag(&self) -> &str {
        &self.account_tag
    }

    fn build_client() -> Client {
        ClientBuilder::new()
            .pool_idle_timeout(Duration::from_secs(600))
            .pool_max_idle_per_host(10)
            .tcp_keepalive(Some(Duration::from_secs(30)))
            .timeout(Duration::from_secs(180))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|e| {
                warn!("Falling back to default HTTP client: {}", e);
                Client::new()
            })
    }

    fn offset_path(&self) -> PathBuf {
        self.data_dir
            .join("runtime")
            .join(format!("telegram.{}.offset", self.account_tag))
    }

    async fn read_offset(&self) -> Option<i64> {
        match fs::read_to_string(self.offset_path()).await {
            Ok(content) => content.trim().parse().ok(),
            Err(_) => None,
        }
    }

    async fn write_offset(&self, offset: i64) {
        let p = self.offset_path();
        if let Some(parent) = p.parent() {
            let _ = fs::create_dir_all(parent).await;
        }
        if let Err(e) = fs::write(&p, format!("{}\n", offset)).await {
            debug!("Could not persist Telegram offset: {}", e);
        }
    }

    pub async fn get_me(&self) -> Result<TelegramUser> {
        let url = format!("{}/getMe", self.api_url);
        let parsed: ApiResponse<TelegramUser> = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(15))
            .send()
            .await
            .map_err(|e| anyhow!("telegram getMe request failed: {}", e))?
            .json()
            .await
            .map_err(|e| anyhow!("telegram getMe decode failed: {}", e))?;
        parsed.into_result("getMe")
    }

    pub async fn get_updates(
        &self,
        client: &Client,
        offset: Option<i64>,
    ) -> Result<Vec<TelegramUpdate>> {
        let url = format!("{}/getUpdates", self.api_url);

        let mut payload = serde_json::json!({
            "timeout": self.poll_timeout_secs,
            "allowed_updates": ["message"],
        });

        if let Some(offset) = offset {
            payload["offset"] = serde_json::json!(offset);
        }

        let resp = client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| anyhow!("telegram getUpdates request failed: {}", e))?
            .error_for_status()
            .map_err(|e| anyhow!("telegram getUpdates HTTP error: {}", e))?;

        let parsed: ApiResponse<Vec<TelegramUpdate>> = resp
            .json()
            .await
            .map_err(|e| anyhow!("telegram getUpdates decode failed: {}", e))?;

        parsed.into_result("getUpdates")
    }

    pub async fn send_message(&self, chat_id: i64, text: &str, reply_to: Option<i64>) -> Result<()> {
        let chunks = chunk_message(text, TELEGRAM_MAX_MESSAGE_LEN);

        for (i, chunk) in chunks.iter().enumerate() {
            if chunk.trim().is_empty() {
                continue;
            }
            let mut payload = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
                "parse_mode": "Markdown",
                "disable_web_page_preview": true,
            });

            if let Some(reply_to_message_id) = reply_to {
                if i == 0 {
                    payload["reply_to_message_id"] = serde_json::json!(reply_to_message_id);
                }
            }

            self.deliver("sendMessage", payload).await?;
        }

        Ok(())
    }

    pub async fn send_chat_action(&self, chat_id: i64, action: &str) -> Result<()> {
        let payload = serde_json::json!({
            "chat_id": chat_id,
            "action": action,
        });
        self.call(&self.client, "sendChatAction", &payload).await?;
        Ok(())
    }

    /// Resolves `file_id` with getFile and downloads it, refusing anything
    /// larger than `max_bytes`.
    pub async fn download_file(&self, file_id: &str, max_bytes: usize) -> Result<Vec<u8>> {
        let url = format!("{}/getFile", self.api_url);
        let resp = self
            .client
            .post(&url)
            .timeout(Duration::from_secs(45))
            .json(&serde_json::json!({ "file_id": file_id }))
            .send()
            .await
            .map_err(|e| anyhow!("telegram getFile request failed: {}", e))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            anyhow::bail!("telegram getFile failed with HTTP {}", status.as_u16());
        }

        let parsed: ApiResponse<TelegramFile> = serde_json::from_str(&body).map_err(|e| {
            anyhow!(
                "telegram getFile decode failed: {} | body={}",
                e,
                body.chars().take(400).collect::<String>()
            )
        })?;
        let file = parsed.into_result("getFile")?;
        if file.file_size.is_some_and(|size| size as u64 > max_bytes as u64) {
            anyhow::bail!("file is larger than the {} byte limit", max_bytes);
        }
        let file_path = file
            .file_path
            .ok_or_else(|| anyhow!("telegram getFile returned no file_path"))?;

        let download_url = format!("{}/{}", self.file_url, file_path);
        let download = self
            .client
            .get(&download_url)
            .timeout(Duration::from_secs(120))
            .send()
            .await?;
        if !download.status().is_success() {
            anyhow::bail!(
                "telegram file download failed with HTTP {}",
                download.status().as_u16()
            );
        }
        let bytes = download.bytes().await?;
        if bytes.len() > max_bytes {
            anyhow::bail!("file is larger than the {} byte limit", max_bytes);
        }
        Ok(bytes.to_vec())
    }

    /// One Bot API call; `ok: true` with a success status is the only
    /// accepted answer.
    async fn call(
        &self,
        client: &Client,
        method: &str,
        payload: &serde_json::Value,
    ) -> std::result::Result<(), Rejection> {
        let url = format!("{}/{}", self.api_url, method);
        let resp = client
            .post(&url)
            .json(payload)
            .send()
            .await
            .map_err(|e| Rejection::Unanswered {
                method: method.to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        let parsed = serde_json::from_str::<ApiResponse<serde_json::Value>>(&body).ok();
        match parsed {
            Some(answer) if status.is_success() && answer.ok => Ok(()),
            Some(answer) => Err(Rejection::Refused {
                method: method.to_string(),
                status: status.as_u16(),
                description: answer.description.unwrap_or(body),
            }),
            None => Err(Rejection::Refused {
                method: method.to_string(),
                status: status.as_u16(),
                description: body.chars().take(400).collect(),
            }),
        }
    }

    /// Retries a refused send with less in it: the reply target goes when it
    /// no longer exists, Markdown goes for any other refusal.
    async fn deliver(&self, method: &str, mut payload: serde_json::Value) -> Result<()> {
        loop {
            let rejection = match self.call(&self.client, method, &payload).await {
                Ok(()) => return Ok(()),
                Err(rejection) => rejection,
            };

            let dropped = if rejection.reply_target_missing()
                && take_field(&mut payload, "reply_to_message_id")
            {
                "reply_to_message_id"
            } else if matches!(rejection, Rejection::Refused { .. })
                && take_field(&mut payload, "parse_mode")
            {
                "parse_mode"
            } else {
                return Err(rejection.into());
            };
            warn!("{}; retrying without {}", rejection, dropped);
        }
    }

    pub async fn poll(&self) -> Result<()> {
        let mut offset: Option<i64> = self.read_offset().await;

        info!(account = %self.account_tag, offset = ?offset, "Telegram polling started");

        let mut client = self.client.clone();
        let mut client_recreate_at =
            Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);

        if let Err(err) = self.sync_bot_commands(&client).await {
            warn!("Failed to sync Telegram bot commands: {}", err);
        } else {
            info!("Telegram bot commands synced");
        }

        loop {
            if Instant::now() >= client_recreate_at {
                debug!("Recreating HTTP client to prevent stale connections");
                client = Self::build_client();
                client_recreate_at =
                    Instant::now() + Duration::from_secs(self.client_recreate_interval_secs);
            }

            let updates = match self.get_updates(&client, offset).await {
                Ok(v) => v,
                Err(err) => {
                    warn!("Telegram polling error: {}", err);
                    tokio::time::sleep(Duration::from_secs(2)).await;
                    continue;
                }
            };

            for update in updates {
                offset = Some(update.update_id + 1);
                self.write_offset(update.update_id + 1).await;

                if let Some(message) = &update.message {
                    self.handle_message(message);
                }
            }
        }
    }

    async fn sync_bot_commands(&self, client: &Client) -> Result<()> {
        let commands: Vec<serde_json::Value> = BOT_COMMANDS
            .iter()
            .map(|(command, description)| {
                serde_json::json!({ "command": command, "description": description })
            })
            .collect();

        let payload = serde_json::json!({ "commands": commands });
        self.call(client, "setMyCommands", &payload).await?;
        Ok(())
    }

    /// Maps a message to an envelope; `None` for unauthorized chats and
    /// content kinds the bot does not handle.
    fn envelope_for(&self, message: &TelegramMessage) -> Option<Envelope> {
        let chat_id = message.chat.id;
        if !self.account.is_chat_allowed(chat_id) {
            info!("Skipping message from unauthorized chat {}", chat_id);
            return None;
        }

        let from_id = message
            .from
            .as_ref()
            .map(|u| u.id.to_string())
            .unwrap_or_default();

        let kind = if let Some(document) = &message.document {
            MessageKind::Document {
                from: from_id,
                file_id: document.file_id.clone(),
                file_name: document.file_name.clone(),
                caption: message.caption.clone(),
                file_size: document.file_size,
            }
        } else if let Some(text) = message.text.as_deref().filter(|t| !t.trim().is_empty()) {
            MessageKind::from_text(&from_id, text)
        } else {
            debug!(chat_id, "Ignoring message without text or document");
            return None;
        };

        let mut payload = serde_json::json!({
            "account_tag": self.account_tag.clone(),
            "chat_type": message.chat.chat_type.clone(),
        });
        if let Some(username) = message.from.as_ref().and_then(|u| u.username.as_ref()) {
            payload["from_username"] = serde_json::json!(username);
        }

        Some(
            Envelope::new("telegram", kind)
                .with_chat_id(chat_id)
                .with_message_id(message.message_id)
                .with_payload(payload),
        )
    }

    fn handle_message(&self, message: &TelegramMessage) {
        let Some(envelope) = self.envelope_for(message) else {
            return;
        };

        let from = message
            .from
            .as_ref()
            .and_then(|u| u.username.as_deref())
            .unwrap_or("unknown");
        info!(
            id = %envelope.id,
            chat_id = message.chat.id,
            from = %from,
            kind = ?envelope.kind,
            "Received message"
        );

        match &self.event_bus {
            Some(event_bus) => {
                if let Err(e) = event_bus.publish(envelope) {
                    warn!("Failed to publish message to event bus: {}", e);
                }
            }
            None => info!("No event bus configured, message not forwarded"),
        }
    }

    pub async fn run_outbound_handler(&self, mut receiver: broadcast::Receiver<OutboundMessage>) {
        info!("Telegram outbound handler started");

        loop {
            match receiver.recv().await {
                Ok(msg) => {
                    if msg.channel != "telegram" {
                        continue;
                    }
                    if let Some(account_tag) = &msg.account_tag {
                        if account_tag != &self.account_tag {
                            continue;
                        }
                    }

                    if let Some(action) = &msg.chat_action {
                        if let Err(e) = self.send_chat_action(msg.chat_id, action).await {
                            warn!("Failed to send chat action: {}", e);
                        }
                        continue;
                    }

                    if let Err(e) = self.send_message(msg.chat_id, &msg.text, msg.reply_to).await
                    {
                        warn!("Failed to send outbound message: {}", e);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Telegram outbound handler stopped: channel closed");
                    break;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(
                        "Telegram outbound handler lagged; skipped {} messages",
                        skipped
                    );
                }
            }
        }
    }
}
