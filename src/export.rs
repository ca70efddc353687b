//! Export sinks — push the answer table and the poem ledger somewhere an
//! organizer can open it.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::catalog::BlockCatalog;
use crate::config::QuestConfig;
use crate::error::ExportError;
use crate::poem::Contribution;
use crate::store::{AnswerRow, Database};

/// Everything an export carries.
#[derive(Debug, Clone, Serialize)]
pub struct ExportSnapshot {
    pub generated_at: DateTime<Utc>,
    /// Column headers: identity, name, team, then one per prompt.
    pub headers: Vec<String>,
    pub rows: Vec<AnswerRow>,
    pub contributions: Vec<Contribution>,
}

impl ExportSnapshot {
    /// Read the current answers and poem ledger from the store.
    pub async fn collect(
        db: &dyn Database,
        catalog: &BlockCatalog,
    ) -> Result<Self, ExportError> {
        let mut headers = vec![
            "identity".to_string(),
            "display_name".to_string(),
            "team".to_string(),
        ];
        for block in catalog.blocks() {
            for prompt in &block.prompts {
                headers.push(format!("{}. {}", headers.len() - 2, prompt.text));
            }
        }

        Ok(Self {
            generated_at: Utc::now(),
            headers,
            rows: db.answer_rows(catalog.total_prompts()).await?,
            contributions: db.list_contributions(None).await?,
        })
    }
}

/// Where an export ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReceipt {
    pub sink: String,
    pub location: String,
    pub rows: usize,
}

/// A destination for exports.
#[async_trait]
pub trait ExportSink: Send + Sync {
    fn name(&self) -> &str;

    async fn export(&self, snapshot: &ExportSnapshot) -> Result<ExportReceipt, ExportError>;
}

/// Writes each export as a timestamped JSON file.
pub struct JsonFileSink {
    dir: PathBuf,
}

impl JsonFileSink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ExportSink for JsonFileSink {
    fn name(&self) -> &str {
        "json_file"
    }

    async fn export(&self, snapshot: &ExportSnapshot) -> Result<ExportReceipt, ExportError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(format!(
            "quest-export-{}.json",
            snapshot.generated_at.format("%Y%m%d-%H%M%S%.3f")
        ));
        let body = serde_json::to_vec_pretty(snapshot)?;
        tokio::fs::write(&path, body).await?;

        Ok(ExportReceipt {
            sink: self.name().to_string(),
            location: path.display().to_string(),
            rows: snapshot.rows.len(),
        })
    }
}

/// POSTs each export as JSON to a URL (e.g. a spreadsheet script endpoint).
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl ExportSink for WebhookSink {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn export(&self, snapshot: &ExportSnapshot) -> Result<ExportReceipt, ExportError> {
        let resp = self
            .client
            .post(&self.url)
            .json(snapshot)
            .send()
            .await
            .map_err(|e| ExportError::SinkFailed {
                sink: self.name().to_string(),
                reason: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExportError::SinkFailed {
                sink: self.name().to_string(),
                reason: format!("{status}: {body}"),
            });
        }

        Ok(ExportReceipt {
            sink: self.name().to_string(),
            location: self.url.clone(),
            rows: snapshot.rows.len(),
        })
    }
}

/// Build the sinks enabled by the configuration.
pub fn sinks_from_config(config: &QuestConfig) -> Vec<Arc<dyn ExportSink>> {
    let mut sinks: Vec<Arc<dyn ExportSink>> = Vec::new();
    if let Some(dir) = &config.export_dir {
        sinks.push(Arc::new(JsonFileSink::new(dir.clone())));
    }
    if let Some(url) = &config.export_webhook {
        sinks.push(Arc::new(WebhookSink::new(url.clone())));
    }
    sinks
}

/// Collect a snapshot and push it to every sink.
///
/// Each sink's result is returned separately; one failing sink doesn't stop
/// the others.
pub async fn run_export(
    db: &dyn Database,
    catalog: &BlockCatalog,
    sinks: &[Arc<dyn ExportSink>],
) -> Result<Vec<Result<ExportReceipt, ExportError>>, ExportError> {
    if sinks.is_empty() {
        return Err(ExportError::NotConfigured);
    }
    let snapshot = ExportSnapshot::collect(db, catalog).await?;
    let mut results = Vec::with_capacity(sinks.len());
    for sink in sinks {
        let result = sink.export(&snapshot).await;
        match &result {
            Ok(receipt) => {
                tracing::info!(sink = sink.name(), location = %receipt.location, rows = receipt.rows, "Export written")
            }
            Err(e) => tracing::error!(sink = sink.name(), error = %e, "Export failed"),
        }
        results.push(result);
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Block, Prompt, Release};
    use crate::store::{LibSqlBackend, NewParticipant};

    fn catalog() -> BlockCatalog {
        BlockCatalog::new(vec![
            Block::questions(Release::Immediate, vec![Prompt::text("Year?"), Prompt::photo("Selfie")]),
            Block::team_poem(Release::Immediate, "Write a poem"),
        ])
        .unwrap()
    }

    #[tokio::test]
    async fn snapshot_headers_follow_the_catalog() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let catalog = catalog();
        db.ensure_answer_columns(catalog.total_prompts()).await.unwrap();
        db.upsert_participant(&NewParticipant {
            identity: "1".into(),
            chat_id: "1".into(),
            username: None,
        })
        .await
        .unwrap();

        let snapshot = ExportSnapshot::collect(&db, &catalog).await.unwrap();
        assert_eq!(
            snapshot.headers,
            vec!["identity", "display_name", "team", "1. Year?", "2. Selfie", "3. Write a poem"]
        );
        assert_eq!(snapshot.rows.len(), 1);
        assert_eq!(snapshot.rows[0].answers.len(), 3);
    }

    #[tokio::test]
    async fn json_sink_writes_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let db = LibSqlBackend::new_memory().await.unwrap();
        let catalog = catalog();
        db.ensure_answer_columns(catalog.total_prompts()).await.unwrap();

        let sinks: Vec<Arc<dyn ExportSink>> = vec![Arc::new(JsonFileSink::new(dir.path().join("out")))];
        let results = run_export(&db, &catalog, &sinks).await.unwrap();
        let receipt = results[0].as_ref().unwrap();
        assert_eq!(receipt.sink, "json_file");

        let written = std::fs::read_to_string(&receipt.location).unwrap();
        let value: serde_json::Value = serde_json::from_str(&written).unwrap();
        assert!(value["headers"].is_array());
    }

    #[tokio::test]
    async fn no_sinks_is_an_error() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let err = run_export(&db, &catalog(), &[]).await.unwrap_err();
        assert!(matches!(err, ExportError::NotConfigured));
    }
}
