//! AdminService — executes operator commands and replies in chat.

use std::sync::Arc;

use crate::catalog::{PromptKind, Release};
use crate::channels::OutgoingMessage;
use crate::channels::telegram::split_message;
use crate::error::Result;
use crate::export::{self, ExportSink};
use crate::poem::{PoemStats, PoemStatus};
use crate::quiz::{ActivationSource, Answer, QuizEngine};
use crate::scheduler::AvailabilityScheduler;
use crate::store::ParticipantFilter;

use super::command::{AdminCommand, help_text};

/// Chunk size for long operator replies.
const REPLY_CHUNK: usize = 4000;

pub struct AdminService {
    engine: Arc<QuizEngine>,
    scheduler: Arc<AvailabilityScheduler>,
    sinks: Vec<Arc<dyn ExportSink>>,
    admin_ids: Vec<String>,
}

impl AdminService {
    pub fn new(
        scheduler: Arc<AvailabilityScheduler>,
        sinks: Vec<Arc<dyn ExportSink>>,
        admin_ids: Vec<String>,
    ) -> Self {
        Self {
            engine: Arc::clone(scheduler.engine()),
            scheduler,
            sinks,
            admin_ids,
        }
    }

    pub fn is_admin(&self, identity: &str) -> bool {
        self.admin_ids.iter().any(|id| id == identity)
    }

    async fn reply(&self, chat_id: &str, text: impl Into<String>) {
        self.engine.notifier().text(chat_id, text).await;
    }

    async fn reply_chunked(&self, chat_id: &str, text: &str) {
        for chunk in split_message(text, REPLY_CHUNK) {
            self.reply(chat_id, chunk).await;
        }
    }

    /// Run `command` on behalf of `identity`, replying to `chat_id`.
    pub async fn handle(&self, identity: &str, chat_id: &str, command: AdminCommand) -> Result<()> {
        if !self.is_admin(identity) {
            tracing::warn!(identity, ?command, "Operator command from non-operator");
            self.reply(chat_id, "⛔ You don't have access to operator commands.")
                .await;
            return Ok(());
        }
        tracing::info!(identity, ?command, "Operator command");

        match command {
            AdminCommand::Help => self.reply(chat_id, help_text()).await,
            AdminCommand::Blocks => self.reply(chat_id, self.blocks_text()).await,
            AdminCommand::Block { index } => self.reply(chat_id, self.block_text(index)).await,
            AdminCommand::Results => self.results(chat_id).await?,
            AdminCommand::Answers { identity: target } => self.answers(chat_id, &target).await?,
            AdminCommand::RunBlock { index, identity: target } => {
                self.run_block(chat_id, index, target.as_deref()).await?
            }
            AdminCommand::Poems { team } => self.poems(chat_id, team).await?,
            AdminCommand::Finish => {
                let text = if self.scheduler.close_event("operator").await? {
                    "🏁 Event closed."
                } else {
                    "The event is already closed."
                };
                self.reply(chat_id, text).await;
            }
            AdminCommand::Export => self.export(chat_id).await,
            AdminCommand::Usage { usage } => self.reply(chat_id, format!("Usage: {usage}")).await,
        }
        Ok(())
    }

    fn blocks_text(&self) -> String {
        let catalog = self.engine.catalog();
        let offset = self.engine.utc_offset();
        let mut text = String::from("Blocks:\n");
        for (i, block) in catalog.blocks().iter().enumerate() {
            let release = match block.release {
                Release::Immediate => "immediate".to_string(),
                Release::At(at) => at.with_timezone(&offset).format("%H:%M").to_string(),
            };
            let kind = if block.is_team_poem() { ", team poem" } else { "" };
            text.push_str(&format!(
                "{i}. {} — {} prompts, opens {release}{kind}\n",
                catalog.title(i),
                block.prompts.len()
            ));
        }
        text
    }

    fn block_text(&self, index: usize) -> String {
        let catalog = self.engine.catalog();
        let Some(block) = catalog.block(index) else {
            return "No such block.".to_string();
        };
        let mut text = format!("Prompts of {} (#{index}):\n", catalog.title(index));
        for (i, prompt) in block.prompts.iter().enumerate() {
            let marker = match prompt.kind {
                PromptKind::Photo => " [photo]",
                PromptKind::Text => "",
            };
            text.push_str(&format!("{}. {}{marker}\n", i + 1, prompt.text));
        }
        text
    }

    async fn results(&self, chat_id: &str) -> Result<()> {
        let columns = self.engine.catalog().total_prompts();
        let rows = self.engine.db().answer_rows(columns).await?;
        if rows.is_empty() {
            self.reply(chat_id, "No answers yet.").await;
            return Ok(());
        }

        let mut text = String::new();
        for (n, row) in rows.iter().enumerate() {
            text.push_str(&format!(
                "{}. {} [{}] ({})\n",
                n + 1,
                row.display_name.as_deref().unwrap_or("—"),
                row.team.as_deref().unwrap_or("no team"),
                row.identity
            ));
            for (i, cell) in row.answers.iter().enumerate() {
                text.push_str(&format!("{}: {}\n", i + 1, cell.as_deref().unwrap_or("-")));
            }
            text.push('\n');
        }
        self.reply_chunked(chat_id, &text).await;
        Ok(())
    }

    /// One participant's answers. Photo answers are re-sent as photos.
    async fn answers(&self, chat_id: &str, target: &str) -> Result<()> {
        let catalog = self.engine.catalog();
        let rows = self.engine.db().answer_rows(catalog.total_prompts()).await?;
        let Some(row) = rows.into_iter().find(|r| r.identity == target) else {
            self.reply(chat_id, format!("No participant with id {target}."))
                .await;
            return Ok(());
        };

        let prompts: Vec<&str> = catalog
            .blocks()
            .iter()
            .flat_map(|b| b.prompts.iter().map(|p| p.text.as_str()))
            .collect();
        let mut text = format!(
            "{} [{}]\n",
            row.display_name.as_deref().unwrap_or(target),
            row.team.as_deref().unwrap_or("no team")
        );
        let mut photos = Vec::new();
        for (i, cell) in row.answers.iter().enumerate() {
            let question = prompts.get(i).copied().unwrap_or("");
            match cell.as_deref().map(Answer::from_cell) {
                Some(Answer::Photo { file_id }) => {
                    text.push_str(&format!("{}. {question}: 📷 photo\n", i + 1));
                    photos.push((file_id, format!("{}. {question}", i + 1)));
                }
                Some(Answer::Text { text: answer }) => {
                    text.push_str(&format!("{}. {question}: {answer}\n", i + 1));
                }
                None => text.push_str(&format!("{}. {question}: -\n", i + 1)),
            }
        }
        self.reply_chunked(chat_id, &text).await;
        for (file_id, caption) in photos {
            self.engine
                .notifier()
                .send(chat_id, OutgoingMessage::photo(file_id, Some(caption)))
                .await;
        }
        Ok(())
    }

    async fn run_block(&self, chat_id: &str, index: usize, target: Option<&str>) -> Result<()> {
        if index >= self.engine.catalog().len() {
            self.reply(chat_id, "No such block.").await;
            return Ok(());
        }

        if let Some(target) = target {
            let opened = self
                .engine
                .activate_block(target, index, ActivationSource::Admin)
                .await?;
            let text = if opened {
                format!("Block #{index} opened for {target}.")
            } else {
                format!("Block #{index} not opened for {target}: busy, unconfirmed or already past it.")
            };
            self.reply(chat_id, text).await;
            return Ok(());
        }

        let participants = self
            .engine
            .db()
            .list_participants(&ParticipantFilter {
                confirmed_only: true,
                ..Default::default()
            })
            .await?;
        if participants.is_empty() {
            self.reply(chat_id, "No registered participants.").await;
            return Ok(());
        }

        let mut opened = 0;
        for p in &participants {
            match self
                .engine
                .activate_block(&p.identity, index, ActivationSource::Admin)
                .await
            {
                Ok(true) => opened += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::error!(identity = %p.identity, block = index, error = %e, "Admin activation failed")
                }
            }
        }
        self.reply(
            chat_id,
            format!(
                "ℹ️ Block #{index} opened for {opened} of {} participants.",
                participants.len()
            ),
        )
        .await;
        Ok(())
    }

    async fn poems(&self, chat_id: &str, team: Option<String>) -> Result<()> {
        let teams = match team {
            Some(team) => vec![team],
            None => self.engine.teams().to_vec(),
        };
        let stats = self.engine.poems().all_stats(&teams).await?;
        let text = stats
            .iter()
            .map(poem_summary)
            .collect::<Vec<_>>()
            .join("\n\n");
        self.reply_chunked(chat_id, &text).await;
        Ok(())
    }

    /// Run the export on a background task and report back when done.
    async fn export(&self, chat_id: &str) {
        if self.sinks.is_empty() {
            self.reply(chat_id, "No export sink is configured.").await;
            return;
        }
        self.reply(chat_id, "Export started…").await;

        let engine = Arc::clone(&self.engine);
        let sinks = self.sinks.clone();
        let chat_id = chat_id.to_string();
        tokio::spawn(async move {
            let text =
                match export::run_export(engine.db().as_ref(), engine.catalog(), &sinks).await {
                    Ok(results) => results
                        .iter()
                        .map(|r| match r {
                            Ok(receipt) => format!(
                                "✅ {}: {} rows → {}",
                                receipt.sink, receipt.rows, receipt.location
                            ),
                            Err(e) => format!("❌ {e}"),
                        })
                        .collect::<Vec<_>>()
                        .join("\n"),
                    Err(e) => format!("❌ Export failed: {e}"),
                };
            engine.notifier().text(&chat_id, text).await;
        });
    }
}

fn poem_summary(stats: &PoemStats) -> String {
    let mut text = format!("Team {}: {}", stats.team, stats.status);
    if stats.status == PoemStatus::NotStarted {
        return text;
    }
    text.push_str(&format!(
        "\nmembers {}, written {}, skipped {}",
        stats.members, stats.contributed, stats.skipped
    ));
    if let Some(current) = &stats.current_turn {
        text.push_str(&format!("\nnow writing: {current}"));
    }
    for line in &stats.lines {
        text.push_str(&format!("\n  {line}"));
    }
    text
}
