//! Kestrel IPC
//!
//! Event bus between the chat adapters and the runtime

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;

static NEXT_TRACE_COUNTER: AtomicU64 = AtomicU64::new(1);

pub const EVENT_BUS_CAPACITY: usize = 256;
pub const OUTBOUND_CAPACITY: usize = 256;

fn now_unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn generate_trace_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("trace-{}-{}", ts, n)
}

fn generate_envelope_id() -> String {
    let ts = now_unix_secs();
    let n = NEXT_TRACE_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("msg-{}-{}", ts, n)
}

fn default_schema_version() -> u16 {
    1
}

fn default_trace_id() -> String {
    generate_trace_id()
}

fn default_envelope_id() -> String {
    generate_envelope_id()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(default = "default_schema_version")]
    pub schema_version: u16,
    #[serde(default = "default_trace_id")]
    pub trace_id: String,
    #[serde(default = "default_envelope_id")]
    pub id: String,
    pub channel: String,
    pub kind: MessageKind,
    #[serde(default)]
    pub payload: serde_json::Value,
    pub chat_id: Option<i64>,
    pub message_id: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum MessageKind {
    #[serde(rename = "message")]
    Message { from: String, text: String },

    #[serde(rename = "command")]
    Command {
        from: String,
        name: String,
        args: Vec<String>,
    },

    #[serde(rename = "document")]
    Document {
        from: String,
        file_id: String,
        file_name: Option<String>,
        caption: Option<String>,
        file_size: Option<i64>,
    },
}

impl MessageKind {
    pub fn sender(&self) -> &str {
        match self {
            Self::Message { from, .. }
            | Self::Command { from, .. }
            | Self::Document { from, .. } => from,
        }
    }

    /// Parses `/name arg1 arg2`, dropping a `@botname` suffix on the command.
    /// Returns a plain message for anything that is not a command.
    pub fn from_text(from: &str, text: &str) -> Self {
        let trimmed = text.trim();
        if let Some(rest) = trimmed.strip_prefix('/') {
            let mut parts = rest.split_whitespace();
            if let Some(head) = parts.next() {
                let name = head.split('@').next().unwrap_or(head).to_lowercase();
                if !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
                {
                    return Self::Command {
                        from: from.to_string(),
                        name,
                        args: parts.map(str::to_string).collect(),
                    };
                }
            }
        }

        Self::Message {
            from: from.to_string(),
            text: text.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub channel: String,
    pub account_tag: Option<String>,
    pub chat_id: i64,
    pub text: String,
    pub reply_to: Option<i64>,
    pub chat_action: Option<String>,
}

impl OutboundMessage {
    pub fn text(channel: &str, account_tag: Option<String>, chat_id: i64, text: &str) -> Self {
        Self {
            channel: channel.to_string(),
            account_tag,
            chat_id,
            text: text.to_string(),
            reply_to: None,
            chat_action: None,
        }
    }

    pub fn action(channel: &str, account_tag: Option<String>, chat_id: i64, action: &str) -> Self {
        Self {
            channel: channel.to_string(),
            account_tag,
            chat_id,
            text: String::new(),
            reply_to: None,
            chat_action: Some(action.to_string()),
        }
    }

    pub fn with_reply_to(mut self, message_id: Option<i64>) -> Self {
        self.reply_to = message_id;
        self
    }
}

impl Envelope {
    pub fn new(channel: &str, kind: MessageKind) -> Self {
        Self {
            schema_version: default_schema_version(),
            trace_id: generate_trace_id(),
            id: generate_envelope_id(),
            channel: channel.to_string(),
            kind,
            payload: serde_json::json!({}),
            chat_id: None,
            message_id: None,
        }
    }

    pub fn with_chat_id(mut self, chat_id: i64) -> Self {
        self.chat_id = Some(chat_id);
        self
    }

    pub fn with_message_id(mut self, message_id: i64) -> Self {
        self.message_id = Some(message_id);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn account_tag(&self) -> Option<String> {
        self.payload
            .get("account_tag")
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}

#[derive(Clone)]
pub struct EventBus {
    inbound: broadcast::Sender<Envelope>,
    outbound: broadcast::Sender<OutboundMessage>,
}

impl EventBus {
    pub fn new() -> Self {
        let (inbound_tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        let (outbound_tx, _) = broadcast::channel(OUTBOUND_CAPACITY);

        Self {
            inbound: inbound_tx,
            outbound: outbound_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Envelope> {
        self.inbound.subscribe()
    }

    pub fn publish(&self, envelope: Envelope) -> anyhow::Result<()> {
        self.inbound.send(envelope)?;
        Ok(())
    }

    pub fn outbound_sender(&self) -> broadcast::Sender<OutboundMessage> {
        self.outbound.clone()
    }

    pub fn outbound_subscribe(&self) -> broadcast::Receiver<OutboundMessage> {
        self.outbound.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
