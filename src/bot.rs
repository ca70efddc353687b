//! Inbound dispatch — reads the gateway stream and routes each message to the
//! quest engine, the poem coordinator or the operator surface.
//!
//! Every participant gets a lane: a task that handles their messages in the
//! order they arrived. Different participants are handled concurrently.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;

use crate::admin::{AdminCommand, AdminService};
use crate::channels::{Channel, IncomingMessage, OutgoingMessage, Payload};
use crate::error::{Error, Result};
use crate::quiz::prompts::{self, CONFIRM_CALLBACK, TEAM_CALLBACK_PREFIX};
use crate::quiz::{Answer, QuizEngine};

type Lane = mpsc::UnboundedSender<IncomingMessage>;

/// Routes inbound messages.
#[derive(Clone)]
pub struct Dispatcher {
    channel: Arc<dyn Channel>,
    engine: Arc<QuizEngine>,
    admin: Arc<AdminService>,
}

impl Dispatcher {
    pub fn new(channel: Arc<dyn Channel>, engine: Arc<QuizEngine>, admin: Arc<AdminService>) -> Self {
        Self {
            channel,
            engine,
            admin,
        }
    }

    /// Run until Ctrl+C or until the gateway stream ends.
    pub async fn run(self) -> Result<()> {
        let mut stream = self.channel.start().await?;
        let mut lanes: HashMap<String, Lane> = HashMap::new();

        tracing::info!(channel = self.channel.name(), "Dispatcher ready and listening");

        loop {
            let message = tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Ctrl+C received, shutting down...");
                    break;
                }
                msg = stream.next() => {
                    match msg {
                        Some(m) => m,
                        None => {
                            tracing::info!("Channel stream ended, shutting down...");
                            break;
                        }
                    }
                }
            };

            let identity = message.user_id.clone();
            let lane = lanes
                .entry(identity.clone())
                .or_insert_with(|| self.spawn_lane());
            if let Err(mpsc::error::SendError(message)) = lane.send(message) {
                tracing::warn!(identity = %identity, "Participant lane closed, restarting it");
                let fresh = self.spawn_lane();
                let _ = fresh.send(message);
                lanes.insert(identity, fresh);
            }
        }

        if let Err(e) = self.channel.shutdown().await {
            tracing::warn!("Channel shutdown failed: {}", e);
        }
        Ok(())
    }

    fn spawn_lane(&self) -> Lane {
        let (tx, mut rx) = mpsc::unbounded_channel::<IncomingMessage>();
        let dispatcher = self.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                dispatcher.dispatch(message).await;
            }
        });
        tx
    }

    /// Handle one message, turning errors into a reply.
    async fn dispatch(&self, message: IncomingMessage) {
        match self.route(&message).await {
            Ok(()) => {}
            Err(Error::UnknownParticipant { identity }) => {
                tracing::debug!(identity = %identity, "Message from unregistered user");
                self.reply(&message, prompts::not_registered()).await;
            }
            Err(e) => {
                tracing::error!(identity = %message.user_id, error = %e, "Error handling message");
                self.reply(&message, prompts::try_again()).await;
            }
        }
    }

    async fn reply(&self, message: &IncomingMessage, text: String) {
        if let Err(e) = self
            .channel
            .respond(message, OutgoingMessage::text(text))
            .await
        {
            tracing::warn!(chat_id = %message.chat_id, error = %e, "Reply failed");
        }
    }

    async fn route(&self, message: &IncomingMessage) -> Result<()> {
        let identity = message.user_id.as_str();

        match &message.payload {
            Payload::Callback { data, .. } => {
                if let Err(e) = self.channel.acknowledge(message).await {
                    tracing::debug!(error = %e, "Callback acknowledgement failed");
                }
                if let Some(team) = data.strip_prefix(TEAM_CALLBACK_PREFIX) {
                    self.engine.select_team(identity, team).await?;
                } else if data == CONFIRM_CALLBACK {
                    self.engine.confirm_start(identity).await?;
                } else {
                    tracing::debug!(identity, data = %data, "Unknown callback");
                }
            }
            Payload::Photo { file_id, .. } => {
                self.engine
                    .handle_input(identity, Answer::photo(file_id.clone()))
                    .await?;
            }
            Payload::Text { text } => {
                let trimmed = text.trim();
                match command_name(trimmed).as_deref() {
                    Some("/start") => {
                        self.engine
                            .begin(identity, &message.chat_id, message.username())
                            .await?;
                    }
                    Some("/stop") => {
                        self.engine.reset(identity).await?;
                    }
                    _ => match AdminCommand::parse(trimmed) {
                        Some(command) => {
                            self.admin
                                .handle(identity, &message.chat_id, command)
                                .await?;
                        }
                        None => {
                            self.engine
                                .handle_input(identity, Answer::text(trimmed))
                                .await?;
                        }
                    },
                }
            }
        }
        Ok(())
    }
}

/// `/start@quest_bot arg` → `/start`
fn command_name(text: &str) -> Option<String> {
    let head = text.split_whitespace().next()?;
    if !head.starts_with('/') {
        return None;
    }
    head.split('@').next().map(str::to_lowercase)
}
