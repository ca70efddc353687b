//! MemoryChannel — an in-process gateway that records everything sent.
//!
//! - `inject()` feeds inbound messages to whoever called `start()`.
//! - `send()` appends to an in-memory log instead of talking to a network.
//! - `fail_for()` makes sends to one chat fail, to exercise delivery errors.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::channels::{Channel, IncomingMessage, MessageStream, OutgoingMessage};
use crate::error::ChannelError;

/// One recorded delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub chat_id: String,
    pub message: OutgoingMessage,
}

/// A Channel implementation backed by memory.
pub struct MemoryChannel {
    sent: Mutex<Vec<SentMessage>>,
    failing: Mutex<HashSet<String>>,
    inbound_tx: mpsc::UnboundedSender<IncomingMessage>,
    inbound_rx: Mutex<Option<mpsc::UnboundedReceiver<IncomingMessage>>>,
}

impl MemoryChannel {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            sent: Mutex::new(Vec::new()),
            failing: Mutex::new(HashSet::new()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    /// Queue an inbound message for the stream returned by `start()`.
    pub fn inject(&self, msg: IncomingMessage) {
        let _ = self.inbound_tx.send(msg);
    }

    /// Every delivery so far, in order.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Bodies of everything sent to `chat_id`.
    pub fn bodies_for(&self, chat_id: &str) -> Vec<String> {
        self.sent()
            .into_iter()
            .filter(|s| s.chat_id == chat_id)
            .map(|s| s.message.body().to_string())
            .collect()
    }

    /// Whether any message to `chat_id` contains `needle`.
    pub fn saw(&self, chat_id: &str, needle: &str) -> bool {
        self.bodies_for(chat_id).iter().any(|b| b.contains(needle))
    }

    pub fn clear(&self) {
        if let Ok(mut sent) = self.sent.lock() {
            sent.clear();
        }
    }

    /// Make every send to `chat_id` fail.
    pub fn fail_for(&self, chat_id: &str) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.insert(chat_id.to_string());
        }
    }
}

impl Default for MemoryChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    fn name(&self) -> &str {
        "memory"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let rx = self
            .inbound_rx
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .ok_or_else(|| ChannelError::StartupFailed {
                name: "memory".into(),
                reason: "already started".into(),
            })?;

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn send(&self, chat_id: &str, message: OutgoingMessage) -> Result<(), ChannelError> {
        let failing = self
            .failing
            .lock()
            .map(|f| f.contains(chat_id))
            .unwrap_or(false);
        if failing {
            return Err(ChannelError::SendFailed {
                name: "memory".into(),
                reason: format!("chat {chat_id} unreachable"),
            });
        }
        if let Ok(mut sent) = self.sent.lock() {
            sent.push(SentMessage {
                chat_id: chat_id.to_string(),
                message,
            });
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
