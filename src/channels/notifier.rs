//! Notifier — fire-and-log delivery on top of a `Channel`.
//!
//! Delivery failures are logged per recipient and never abort a broadcast;
//! callers that care get a count back.

use std::sync::Arc;

use crate::channels::{Channel, OutgoingMessage};

/// Outcome of a broadcast.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Notifier {
    channel: Arc<dyn Channel>,
}

impl Notifier {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    /// Send one message. Returns whether it was delivered.
    pub async fn send(&self, chat_id: &str, message: OutgoingMessage) -> bool {
        match self.channel.send(chat_id, message).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(chat_id, channel = self.channel.name(), error = %e, "Delivery failed");
                false
            }
        }
    }

    pub async fn text(&self, chat_id: &str, text: impl Into<String>) -> bool {
        self.send(chat_id, OutgoingMessage::text(text)).await
    }

    /// Send the same message to every chat, continuing past failures.
    pub async fn broadcast<'a, I>(&self, chat_ids: I, message: &OutgoingMessage) -> BroadcastReport
    where
        I: IntoIterator<Item = &'a str>,
    {
        // Collected up front so no borrowed iterator is held across an await.
        let chat_ids: Vec<String> = chat_ids.into_iter().map(str::to_string).collect();
        let mut report = BroadcastReport::default();
        for chat_id in &chat_ids {
            if self.send(chat_id, message.clone()).await {
                report.delivered += 1;
            } else {
                report.failed += 1;
            }
        }
        if report.failed > 0 {
            tracing::warn!(
                delivered = report.delivered,
                failed = report.failed,
                "Broadcast partially failed"
            );
        }
        report
    }
}
