//! CLI channel — stdin/stdout REPL for local rehearsals.
//!
//! Every line is sent as the current simulated participant. A few
//! directives change what gets sent:
//!
//! ```text
//! :as <id>          switch the simulated participant
//! :photo <file_id>  send a photo instead of text
//! :tap <data>       press an inline button
//! ```

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::channels::{Channel, IncomingMessage, MessageContent, MessageStream, OutgoingMessage, Payload};
use crate::error::ChannelError;

const DEFAULT_USER: &str = "local-user";

/// A simple CLI channel that reads from stdin and writes to stdout.
pub struct CliChannel {
    current_user: Arc<Mutex<String>>,
}

impl CliChannel {
    pub fn new() -> Self {
        Self {
            current_user: Arc::new(Mutex::new(DEFAULT_USER.to_string())),
        }
    }
}

impl Default for CliChannel {
    fn default() -> Self {
        Self::new()
    }
}

/// A parsed REPL line.
#[derive(Debug, PartialEq, Eq)]
enum Line {
    SwitchUser(String),
    Send(Payload),
}

fn parse_line(line: &str) -> Option<Line> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let (head, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();
    match head {
        ":as" if !rest.is_empty() => Some(Line::SwitchUser(rest.to_string())),
        ":photo" if !rest.is_empty() => Some(Line::Send(Payload::photo(rest))),
        ":tap" if !rest.is_empty() => Some(Line::Send(Payload::callback(rest))),
        _ => Some(Line::Send(Payload::text(line))),
    }
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(&self) -> Result<MessageStream, ChannelError> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let current_user = Arc::clone(&self.current_user);

        tokio::spawn(async move {
            let stdin = tokio::io::stdin();
            let reader = BufReader::new(stdin);
            let mut lines = reader.lines();

            eprint!("> ");

            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        let parsed = parse_line(&line);
                        let user = match current_user.lock() {
                            Ok(mut guard) => {
                                if let Some(Line::SwitchUser(id)) = &parsed {
                                    *guard = id.clone();
                                    eprintln!("(now acting as {id})");
                                }
                                guard.clone()
                            }
                            Err(_) => DEFAULT_USER.to_string(),
                        };
                        let Some(Line::Send(payload)) = parsed else {
                            eprint!("> ");
                            continue;
                        };
                        let msg = IncomingMessage::new("cli", user.as_str(), payload)
                            .with_user_name(user.as_str());
                        if tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Ok(None) => break, // EOF
                    Err(e) => {
                        tracing::error!("Error reading stdin: {}", e);
                        break;
                    }
                }
            }
        });

        let stream = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|msg| (msg, rx))
        });

        Ok(Box::pin(stream))
    }

    async fn send(&self, chat_id: &str, message: OutgoingMessage) -> Result<(), ChannelError> {
        match &message.content {
            MessageContent::Text { text, buttons } => {
                println!("\n[to {chat_id}] {text}");
                for button in buttons {
                    println!("   [{}]  (:tap {})", button.label, button.data);
                }
            }
            MessageContent::Photo { file_id, caption } => {
                println!(
                    "\n[to {chat_id}] <photo {file_id}> {}",
                    caption.as_deref().unwrap_or("")
                );
            }
        }
        eprint!("> ");
        Ok(())
    }

    async fn health_check(&self) -> Result<(), ChannelError> {
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}
