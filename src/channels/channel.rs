//! Channel trait and message types shared by every gateway.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ChannelError;

/// What a participant sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    Text {
        text: String,
    },
    Photo {
        file_id: String,
        caption: Option<String>,
    },
    /// An inline button press.
    Callback {
        data: String,
        callback_id: Option<String>,
    },
}

impl Payload {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn photo(file_id: impl Into<String>) -> Self {
        Self::Photo {
            file_id: file_id.into(),
            caption: None,
        }
    }

    pub fn callback(data: impl Into<String>) -> Self {
        Self::Callback {
            data: data.into(),
            callback_id: None,
        }
    }

    /// Text content, if this is a text message.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// An inbound message from a gateway.
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub id: Uuid,
    pub channel: String,
    /// Stable participant identity (Telegram user id).
    pub user_id: String,
    pub user_name: Option<String>,
    /// Where replies go. Defaults to `user_id` for private chats.
    pub chat_id: String,
    pub payload: Payload,
    pub metadata: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl IncomingMessage {
    pub fn new(channel: impl Into<String>, user_id: impl Into<String>, payload: Payload) -> Self {
        let user_id = user_id.into();
        Self {
            id: Uuid::new_v4(),
            channel: channel.into(),
            chat_id: user_id.clone(),
            user_id,
            user_name: None,
            payload,
            metadata: serde_json::json!({}),
            received_at: Utc::now(),
        }
    }

    pub fn with_chat_id(mut self, chat_id: impl Into<String>) -> Self {
        self.chat_id = chat_id.into();
        self
    }

    pub fn with_user_name(mut self, name: impl Into<String>) -> Self {
        self.user_name = Some(name.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// Telegram-style `@username`, if the gateway provided one.
    pub fn username(&self) -> Option<&str> {
        self.metadata.get("username").and_then(|v| v.as_str())
    }
}

/// An inline keyboard button.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InlineButton {
    pub label: String,
    /// Callback data delivered back as [`Payload::Callback`].
    pub data: String,
}

impl InlineButton {
    pub fn new(label: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            data: data.into(),
        }
    }
}

/// Outbound content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        text: String,
        #[serde(default)]
        buttons: Vec<InlineButton>,
    },
    /// A photo the gateway already holds, referenced by id.
    Photo {
        file_id: String,
        caption: Option<String>,
    },
}

/// An outbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingMessage {
    pub content: MessageContent,
}

impl OutgoingMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: MessageContent::Text {
                text: text.into(),
                buttons: Vec::new(),
            },
        }
    }

    pub fn photo(file_id: impl Into<String>, caption: Option<String>) -> Self {
        Self {
            content: MessageContent::Photo {
                file_id: file_id.into(),
                caption,
            },
        }
    }

    /// Attach inline buttons (text messages only).
    pub fn with_buttons(mut self, new_buttons: Vec<InlineButton>) -> Self {
        if let MessageContent::Text { buttons, .. } = &mut self.content {
            *buttons = new_buttons;
        }
        self
    }

    /// Text body or photo caption.
    pub fn body(&self) -> &str {
        match &self.content {
            MessageContent::Text { text, .. } => text,
            MessageContent::Photo { caption, .. } => caption.as_deref().unwrap_or(""),
        }
    }

    pub fn buttons(&self) -> &[InlineButton] {
        match &self.content {
            MessageContent::Text { buttons, .. } => buttons,
            MessageContent::Photo { .. } => &[],
        }
    }
}

/// Stream of inbound messages.
pub type MessageStream = Pin<Box<dyn Stream<Item = IncomingMessage> + Send>>;

/// A messaging gateway.
#[async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;

    /// Start receiving. Called once.
    async fn start(&self) -> Result<MessageStream, ChannelError>;

    /// Deliver a message to a chat.
    async fn send(&self, chat_id: &str, message: OutgoingMessage) -> Result<(), ChannelError>;

    /// Reply to the chat an inbound message came from.
    async fn respond(
        &self,
        msg: &IncomingMessage,
        message: OutgoingMessage,
    ) -> Result<(), ChannelError> {
        self.send(&msg.chat_id, message).await
    }

    /// Acknowledge a button press so the client stops its spinner.
    async fn acknowledge(&self, _msg: &IncomingMessage) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError>;

    async fn shutdown(&self) -> Result<(), ChannelError>;
}
