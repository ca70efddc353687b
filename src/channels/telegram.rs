//! Telegram channel — long-polls the Bot API for updates.
//!
//! Handles text messages, photos and inline keyboard callbacks. Outbound
//! text is split at Telegram's 4096 character limit; inline buttons are
//! attached to the last chunk.

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::channels::{
    Channel, IncomingMessage, InlineButton, MessageContent, MessageStream, OutgoingMessage,
    Payload,
};
use crate::error::ChannelError;

/// Maximum message length for Telegram's sendMessage API.
const TELEGRAM_MAX_MESSAGE_LENGTH: usize = 4096;

/// Maximum caption length for sendPhoto.
const TELEGRAM_MAX_CAPTION_LENGTH: usize = 1024;

/// Telegram Bot API channel.
pub struct TelegramChannel {
    bot_token: SecretString,
    client: reqwest::Client,
}

impl TelegramChannel {
    pub fn new(bot_token: SecretString) -> Self {
        Self {
            bot_token,
            client: reqwest::Client::new(),
        }
    }

    fn api_url(&self, method: &str) -> String {
        api_url(&self.bot_token, method)
    }

    fn send_error(reason: impl Into<String>) -> ChannelError {
        ChannelError::SendFailed {
            name: "telegram".into(),
            reason: reason.into(),
        }
    }

    /// POST a JSON body to a Bot API method, failing on non-2xx.
    async fn call(&self, method: &str, body: &serde_json::Value) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(self.api_url(method))
            .json(body)
            .send()
            .await
            .map_err(|e| Self::send_error(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let err = resp.text().await.unwrap_or_default();
            return Err(Self::send_error(format!("{method} returned {status}: {err}")));
        }
        Ok(())
    }

    /// Send a text message, splitting long ones. Buttons go on the last chunk.
    async fn send_text(
        &self,
        chat_id: &str,
        text: &str,
        buttons: &[InlineButton],
    ) -> Result<(), ChannelError> {
        let chunks = split_message(text, TELEGRAM_MAX_MESSAGE_LENGTH);
        let last = chunks.len().saturating_sub(1);

        for (i, chunk) in chunks.iter().enumerate() {
            let mut body = serde_json::json!({
                "chat_id": chat_id,
                "text": chunk,
            });
            if i == last && !buttons.is_empty() {
                body["reply_markup"] = reply_markup(buttons);
            }
            self.call("sendMessage", &body).await?;
        }
        Ok(())
    }

    /// Re-send a photo Telegram already stores, by file id.
    async fn send_photo_by_id(
        &self,
        chat_id: &str,
        file_id: &str,
        caption: Option<&str>,
    ) -> Result<(), ChannelError> {
        let mut body = serde_json::json!({
            "chat_id": chat_id,
            "photo": file_id,
        });
        if let Some(cap) = caption {
            let cap: String = cap.chars().take(TELEGRAM_MAX_CAPTION_LENGTH).collect();
            body["caption"] = serde_json::Value::String(cap);
        }
        self.call("sendPhoto", &body).await
    }
}

// ── Channel trait implementation ────────────────────────────────────

#[async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let url = self.api_url("getUpdates");
        let client = self.client.clone();

        tokio::spawn(async move {
            let mut offset: i64 = 0;

            tracing::info!("Telegram channel listening for messages...");

            loop {
                let body = serde_json::json!({
                    "offset": offset,
                    "timeout": 30,
                    "allowed_updates": ["message", "callback_query"]
                });

                let resp = match client.post(&url).json(&body).send().await {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!("Telegram poll error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let data: serde_json::Value = match resp.json().await {
                    Ok(d) => d,
                    Err(e) => {
                        tracing::warn!("Telegram parse error: {e}");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                        continue;
                    }
                };

                let Some(results) = data.get("result").and_then(serde_json::Value::as_array)
                else {
                    continue;
                };

                for update in results {
                    // Advance offset past this update
                    if let Some(uid) = update.get("update_id").and_then(serde_json::Value::as_i64)
                    {
                        offset = uid + 1;
                    }

                    let Some(incoming) = parse_update(update) else {
                        continue;
                    };

                    if tx.send(incoming).is_err() {
                        tracing::info!("Telegram listener channel closed");
                        return;
                    }
                }
            }
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send(&self, chat_id: &str, message: OutgoingMessage) -> Result<(), ChannelError> {
        match &message.content {
            MessageContent::Text { text, buttons } => self.send_text(chat_id, text, buttons).await,
            MessageContent::Photo { file_id, caption } => {
                self.send_photo_by_id(chat_id, file_id, caption.as_deref())
                    .await
            }
        }
    }

    async fn acknowledge(&self, msg: &IncomingMessage) -> Result<(), ChannelError> {
        if let Payload::Callback {
            callback_id: Some(id),
            ..
        } = &msg.payload
        {
            self.call(
                "answerCallbackQuery",
                &serde_json::json!({ "callback_query_id": id }),
            )
            .await?;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        let resp = self
            .client
            .get(self.api_url("getMe"))
            .send()
            .await
            .map_err(|e| ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: e.to_string(),
            })?;

        if resp.status().is_success() {
            Ok(())
        } else {
            Err(ChannelError::StartupFailed {
                name: "telegram".into(),
                reason: format!("getMe returned {}", resp.status()),
            })
        }
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        tracing::info!("Telegram channel shutting down");
        Ok(())
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn api_url(token: &SecretString, method: &str) -> String {
    format!("https://api.telegram.org/bot{}/{method}", token.expose_secret())
}

/// One button per row.
fn reply_markup(buttons: &[InlineButton]) -> serde_json::Value {
    let rows: Vec<serde_json::Value> = buttons
        .iter()
        .map(|b| serde_json::json!([{ "text": b.label, "callback_data": b.data }]))
        .collect();
    serde_json::json!({ "inline_keyboard": rows })
}

/// Turn a getUpdates entry into an inbound message.
///
/// Returns `None` for update kinds we don't handle (stickers, edits, ...).
fn parse_update(update: &serde_json::Value) -> Option<IncomingMessage> {
    if let Some(callback) = update.get("callback_query") {
        let from = callback.get("from")?;
        let data = callback.get("data").and_then(|d| d.as_str())?;
        let callback_id = callback
            .get("id")
            .and_then(|v| v.as_str())
            .map(String::from);
        let chat_id = callback
            .get("message")
            .and_then(|m| m.get("chat"))
            .and_then(|c| c.get("id"))
            .and_then(serde_json::Value::as_i64);
        return build_incoming(
            from,
            chat_id,
            Payload::Callback {
                data: data.to_string(),
                callback_id,
            },
        );
    }

    let message = update.get("message")?;
    let from = message.get("from")?;
    let chat_id = message
        .get("chat")
        .and_then(|c| c.get("id"))
        .and_then(serde_json::Value::as_i64);

    let payload = if let Some(text) = message.get("text").and_then(|t| t.as_str()) {
        Payload::text(text)
    } else if let Some(sizes) = message.get("photo").and_then(|p| p.as_array()) {
        // Sizes are ascending; the last one is the original.
        let file_id = sizes
            .last()
            .and_then(|s| s.get("file_id"))
            .and_then(|f| f.as_str())?;
        Payload::Photo {
            file_id: file_id.to_string(),
            caption: message
                .get("caption")
                .and_then(|c| c.as_str())
                .map(String::from),
        }
    } else {
        return None;
    };

    build_incoming(from, chat_id, payload)
}

fn build_incoming(
    from: &serde_json::Value,
    chat_id: Option<i64>,
    payload: Payload,
) -> Option<IncomingMessage> {
    let user_id = from.get("id").and_then(serde_json::Value::as_i64)?.to_string();
    let username = from.get("username").and_then(|u| u.as_str());
    let first_name = from.get("first_name").and_then(|n| n.as_str());

    let mut incoming = IncomingMessage::new("telegram", user_id.as_str(), payload)
        .with_chat_id(chat_id.map(|id| id.to_string()).unwrap_or(user_id.clone()))
        .with_metadata(serde_json::json!({ "username": username }));
    if let Some(name) = first_name.or(username) {
        incoming = incoming.with_user_name(name);
    }
    Some(incoming)
}

/// Split a message into chunks that fit Telegram's character limit.
/// Tries to split on newlines, then spaces, then hard-cuts.
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.chars().count() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut remaining = text;

    while !remaining.is_empty() {
        if remaining.chars().count() <= max_len {
            chunks.push(remaining.to_string());
            break;
        }

        // Byte index of the max_len-th char
        let limit = remaining
            .char_indices()
            .nth(max_len)
            .map(|(i, _)| i)
            .unwrap_or(remaining.len());
        let chunk = &remaining[..limit];
        let split_at = chunk
            .rfind('\n')
            .or_else(|| chunk.rfind(' '))
            .unwrap_or(limit);

        // Don't split at position 0 (infinite loop guard)
        let split_at = if split_at == 0 { limit } else { split_at };

        chunks.push(remaining[..split_at].to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> TelegramChannel {
        TelegramChannel::new(SecretString::from("123:ABC"))
    }

    #[test]
    fn telegram_channel_name() {
        assert_eq!(channel().name(), "telegram");
    }

    #[test]
    fn telegram_api_url() {
        assert_eq!(
            channel().api_url("getMe"),
            "https://api.telegram.org/bot123:ABC/getMe"
        );
        assert_eq!(
            channel().api_url("answerCallbackQuery"),
            "https://api.telegram.org/bot123:ABC/answerCallbackQuery"
        );
    }

    #[test]
    fn reply_markup_puts_one_button_per_row() {
        let markup = reply_markup(&[
            InlineButton::new("Red", "team:Red"),
            InlineButton::new("Blue", "team:Blue"),
        ]);
        assert_eq!(markup["inline_keyboard"].as_array().unwrap().len(), 2);
        assert_eq!(markup["inline_keyboard"][1][0]["callback_data"], "team:Blue");
        assert_eq!(markup["inline_keyboard"][0][0]["text"], "Red");
    }

    // ── Update parsing ──────────────────────────────────────────────

    #[test]
    fn parses_text_message() {
        let update = serde_json::json!({
            "update_id": 1,
            "message": {
                "from": { "id": 42, "username": "ann", "first_name": "Ann" },
                "chat": { "id": 4200 },
                "text": "/start"
            }
        });
        let msg = parse_update(&update).unwrap();
        assert_eq!(msg.user_id, "42");
        assert_eq!(msg.chat_id, "4200");
        assert_eq!(msg.user_name.as_deref(), Some("Ann"));
        assert_eq!(msg.username(), Some("ann"));
        assert_eq!(msg.payload, Payload::text("/start"));
    }

    #[test]
    fn parses_photo_using_largest_size() {
        let update = serde_json::json!({
            "message": {
                "from": { "id": 7 },
                "chat": { "id": 7 },
                "photo": [
                    { "file_id": "small", "width": 90 },
                    { "file_id": "large", "width": 1280 }
                ],
                "caption": "us"
            }
        });
        let msg = parse_update(&update).unwrap();
        assert_eq!(
            msg.payload,
            Payload::Photo {
                file_id: "large".into(),
                caption: Some("us".into())
            }
        );
    }

    #[test]
    fn parses_callback_query() {
        let update = serde_json::json!({
            "callback_query": {
                "id": "cb-1",
                "from": { "id": 9, "first_name": "Bob" },
                "message": { "chat": { "id": 900 } },
                "data": "team:Blue"
            }
        });
        let msg = parse_update(&update).unwrap();
        assert_eq!(msg.chat_id, "900");
        assert_eq!(
            msg.payload,
            Payload::Callback {
                data: "team:Blue".into(),
                callback_id: Some("cb-1".into())
            }
        );
    }

    #[test]
    fn ignores_unsupported_updates() {
        let sticker = serde_json::json!({
            "message": { "from": { "id": 1 }, "chat": { "id": 1 }, "sticker": {} }
        });
        assert!(parse_update(&sticker).is_none());
        assert!(parse_update(&serde_json::json!({ "edited_message": {} })).is_none());
    }

    #[test]
    fn chat_id_falls_back_to_user_id() {
        let update = serde_json::json!({
            "message": { "from": { "id": 5 }, "text": "hi" }
        });
        assert_eq!(parse_update(&update).unwrap().chat_id, "5");
    }

    // ── Message splitting tests ─────────────────────────────────────

    #[test]
    fn split_message_short() {
        let chunks = split_message("Hello", 4096);
        assert_eq!(chunks, vec!["Hello"]);
    }

    #[test]
    fn split_message_exact_limit() {
        let msg = "a".repeat(4096);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].len(), 4096);
    }

    #[test]
    fn split_message_over_limit_on_newline() {
        let msg = format!("{}\n{}", "a".repeat(2000), "b".repeat(3000));
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], "a".repeat(2000));
        assert_eq!(chunks[1], "b".repeat(3000));
    }

    #[test]
    fn split_message_no_good_split_point() {
        let msg = "a".repeat(5000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].len(), 4096);
        assert_eq!(chunks[1].len(), 904);
    }

    #[test]
    fn split_message_counts_chars_not_bytes() {
        let msg = "я".repeat(3000);
        let chunks = split_message(&msg, 4096);
        assert_eq!(chunks.len(), 1);
    }
}
