//! Block catalog — the static, ordered list of question blocks.
//!
//! Each block has a release time and an ordered list of prompts. A prompt is
//! either free text or photo-required. At most one block is the team poem
//! block; its prompts are the instructions shown to the team.
//!
//! The catalog is loaded from JSON. Release times are resolved once at load
//! time, so the rest of the system only ever sees absolute UTC timestamps or
//! [`Release::Immediate`].

use std::path::Path;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// What kind of input a prompt accepts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptKind {
    #[default]
    Text,
    Photo,
}

impl std::fmt::Display for PromptKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Photo => write!(f, "photo"),
        }
    }
}

/// A single prompt inside a block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Prompt {
    pub text: String,
    pub kind: PromptKind,
}

impl Prompt {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: PromptKind::Text,
        }
    }

    pub fn photo(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            kind: PromptKind::Photo,
        }
    }
}

/// Whether a block is an ordinary questionnaire block or the team poem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    #[default]
    Questions,
    TeamPoem,
}

/// When a block becomes available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Release {
    /// No explicit time. Only block 0 is opened by the sweep on this basis;
    /// later immediate blocks are reached by chaining.
    Immediate,
    At(DateTime<Utc>),
}

impl Release {
    /// Whether the release time has elapsed (immediate counts as elapsed).
    pub fn has_elapsed(&self, now: DateTime<Utc>) -> bool {
        match self {
            Release::Immediate => true,
            Release::At(at) => *at <= now,
        }
    }

    /// The absolute release time, if any.
    pub fn time(&self) -> Option<DateTime<Utc>> {
        match self {
            Release::Immediate => None,
            Release::At(at) => Some(*at),
        }
    }
}

/// A block of prompts released together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Block {
    pub title: Option<String>,
    pub kind: BlockKind,
    pub release: Release,
    pub prompts: Vec<Prompt>,
}

impl Block {
    pub fn questions(release: Release, prompts: Vec<Prompt>) -> Self {
        Self {
            title: None,
            kind: BlockKind::Questions,
            release,
            prompts,
        }
    }

    pub fn team_poem(release: Release, instructions: impl Into<String>) -> Self {
        Self {
            title: None,
            kind: BlockKind::TeamPoem,
            release,
            prompts: vec![Prompt::text(instructions)],
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn is_team_poem(&self) -> bool {
        self.kind == BlockKind::TeamPoem
    }
}

/// The validated, ordered block catalog.
#[derive(Debug, Clone)]
pub struct BlockCatalog {
    blocks: Vec<Block>,
    /// Flattened column offset of each block's first prompt.
    offsets: Vec<usize>,
    total_prompts: usize,
    poem_block: Option<usize>,
}

impl BlockCatalog {
    /// Build a catalog from already-resolved blocks.
    pub fn new(blocks: Vec<Block>) -> Result<Self, CatalogError> {
        if blocks.is_empty() {
            return Err(CatalogError::Empty);
        }
        if let Some(index) = blocks.iter().position(|b| b.prompts.is_empty()) {
            return Err(CatalogError::EmptyBlock { index });
        }

        let poem_indices: Vec<usize> = blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.is_team_poem())
            .map(|(i, _)| i)
            .collect();
        if poem_indices.len() > 1 {
            return Err(CatalogError::MultiplePoemBlocks {
                count: poem_indices.len(),
            });
        }
        let poem_block = poem_indices.first().copied();
        if poem_block == Some(0) {
            return Err(CatalogError::PoemBlockFirst);
        }

        let mut offsets = Vec::with_capacity(blocks.len());
        let mut total_prompts = 0;
        for block in &blocks {
            offsets.push(total_prompts);
            total_prompts += block.prompts.len();
        }

        Ok(Self {
            blocks,
            offsets,
            total_prompts,
            poem_block,
        })
    }

    /// Load a catalog file, resolving `today_at` times against `today` in `offset`.
    pub fn load(
        path: &Path,
        offset: FixedOffset,
        today: NaiveDate,
    ) -> Result<Self, CatalogError> {
        let raw = std::fs::read_to_string(path).map_err(|source| CatalogError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw, offset, today)
    }

    /// Parse a catalog from its JSON representation.
    pub fn from_json(
        json: &str,
        offset: FixedOffset,
        today: NaiveDate,
    ) -> Result<Self, CatalogError> {
        let file: CatalogFile = serde_json::from_str(json)?;
        let blocks = file
            .blocks
            .into_iter()
            .enumerate()
            .map(|(index, spec)| spec.resolve(index, offset, today))
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(blocks)
    }

    /// Number of blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Always false for a validated catalog.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn block(&self, index: usize) -> Option<&Block> {
        self.blocks.get(index)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Total number of prompts across all blocks (= answer column count).
    pub fn total_prompts(&self) -> usize {
        self.total_prompts
    }

    /// Flattened answer column index (0-based) of `step` within `block`.
    pub fn column_index(&self, block: usize, step: usize) -> usize {
        self.offsets[block] + step
    }

    /// Index of the team poem block, if the catalog has one.
    pub fn poem_block(&self) -> Option<usize> {
        self.poem_block
    }

    /// Display title for a block (1-based default numbering).
    pub fn title(&self, index: usize) -> String {
        self.blocks
            .get(index)
            .and_then(|b| b.title.clone())
            .unwrap_or_else(|| format!("Block #{}", index + 1))
    }

    /// Whether the periodic sweep may open `index` at `now`.
    ///
    /// Block 0 is always open. An immediate block past index 0 is never
    /// opened by the sweep; only chaining reaches it.
    pub fn open_for_sweep(&self, index: usize, now: DateTime<Utc>) -> bool {
        match self.blocks.get(index) {
            None => false,
            Some(_) if index == 0 => true,
            Some(block) => match block.release {
                Release::Immediate => false,
                Release::At(at) => at <= now,
            },
        }
    }

    /// Whether a participant who just finished `index - 1` may chain into `index`.
    pub fn open_for_chaining(&self, index: usize, now: DateTime<Utc>) -> bool {
        self.blocks
            .get(index)
            .is_some_and(|block| block.release.has_elapsed(now))
    }
}

// ── JSON file format ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CatalogFile {
    blocks: Vec<BlockSpec>,
}

#[derive(Debug, Deserialize)]
struct BlockSpec {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    kind: BlockKind,
    release: ReleaseSpec,
    prompts: Vec<PromptSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ReleaseSpec {
    Immediate,
    At(DateTime<FixedOffset>),
    /// Wall-clock time on the event day, e.g. `"09:55"`.
    TodayAt(String),
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum PromptSpec {
    Plain(String),
    Full {
        text: String,
        #[serde(default)]
        kind: PromptKind,
    },
}

impl BlockSpec {
    fn resolve(
        self,
        index: usize,
        offset: FixedOffset,
        today: NaiveDate,
    ) -> Result<Block, CatalogError> {
        let release = match self.release {
            ReleaseSpec::Immediate => Release::Immediate,
            ReleaseSpec::At(at) => Release::At(at.with_timezone(&Utc)),
            ReleaseSpec::TodayAt(hhmm) => {
                let time = NaiveTime::parse_from_str(&hhmm, "%H:%M").map_err(|e| {
                    CatalogError::InvalidRelease {
                        index,
                        reason: format!("'{hhmm}': {e}"),
                    }
                })?;
                let local = offset
                    .from_local_datetime(&today.and_time(time))
                    .single()
                    .ok_or_else(|| CatalogError::InvalidRelease {
                        index,
                        reason: format!("'{hhmm}' is ambiguous in {offset}"),
                    })?;
                Release::At(local.with_timezone(&Utc))
            }
        };

        let prompts = self
            .prompts
            .into_iter()
            .map(|p| match p {
                PromptSpec::Plain(text) => Prompt::text(text),
                PromptSpec::Full { text, kind } => Prompt { text, kind },
            })
            .collect();

        Ok(Block {
            title: self.title,
            kind: self.kind,
            release,
            prompts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn utc() -> FixedOffset {
        FixedOffset::east_opt(0).unwrap()
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    fn sample() -> BlockCatalog {
        let now = Utc::now();
        BlockCatalog::new(vec![
            Block::questions(
                Release::Immediate,
                vec![Prompt::text("a"), Prompt::text("b"), Prompt::text("c")],
            ),
            Block::questions(Release::At(now - Duration::hours(1)), vec![Prompt::text("d")]),
            Block::questions(Release::Immediate, vec![Prompt::photo("e"), Prompt::text("f")]),
            Block::team_poem(Release::At(now + Duration::hours(1)), "poem"),
        ])
        .unwrap()
    }

    #[test]
    fn column_offsets_are_cumulative() {
        let catalog = sample();
        assert_eq!(catalog.total_prompts(), 7);
        assert_eq!(catalog.column_index(0, 0), 0);
        assert_eq!(catalog.column_index(0, 2), 2);
        assert_eq!(catalog.column_index(1, 0), 3);
        assert_eq!(catalog.column_index(2, 1), 5);
        assert_eq!(catalog.column_index(3, 0), 6);
    }

    #[test]
    fn poem_block_is_detected() {
        assert_eq!(sample().poem_block(), Some(3));
    }

    #[test]
    fn sweep_never_opens_immediate_blocks_past_zero() {
        let catalog = sample();
        let now = Utc::now();
        assert!(catalog.open_for_sweep(0, now));
        assert!(catalog.open_for_sweep(1, now));
        assert!(!catalog.open_for_sweep(2, now));
        assert!(!catalog.open_for_sweep(3, now));
        assert!(!catalog.open_for_sweep(4, now));
    }

    #[test]
    fn chaining_treats_immediate_as_open() {
        let catalog = sample();
        let now = Utc::now();
        assert!(catalog.open_for_chaining(2, now));
        assert!(!catalog.open_for_chaining(3, now));
        assert!(catalog.open_for_chaining(3, now + Duration::hours(2)));
        assert!(!catalog.open_for_chaining(4, now));
    }

    #[test]
    fn default_titles_are_one_based() {
        let catalog = BlockCatalog::new(vec![
            Block::questions(Release::Immediate, vec![Prompt::text("a")]).with_title("Warm-up"),
            Block::questions(Release::Immediate, vec![Prompt::text("b")]),
        ])
        .unwrap();
        assert_eq!(catalog.title(0), "Warm-up");
        assert_eq!(catalog.title(1), "Block #2");
    }

    #[test]
    fn rejects_invalid_catalogs() {
        assert!(matches!(BlockCatalog::new(vec![]), Err(CatalogError::Empty)));
        assert!(matches!(
            BlockCatalog::new(vec![Block::questions(Release::Immediate, vec![])]),
            Err(CatalogError::EmptyBlock { index: 0 })
        ));
        assert!(matches!(
            BlockCatalog::new(vec![Block::team_poem(Release::Immediate, "poem")]),
            Err(CatalogError::PoemBlockFirst)
        ));
        assert!(matches!(
            BlockCatalog::new(vec![
                Block::questions(Release::Immediate, vec![Prompt::text("a")]),
                Block::team_poem(Release::Immediate, "one"),
                Block::team_poem(Release::Immediate, "two"),
            ]),
            Err(CatalogError::MultiplePoemBlocks { count: 2 })
        ));
    }

    #[test]
    fn parses_json_with_all_release_forms() {
        let json = r#"{
            "blocks": [
                { "release": "immediate", "prompts": ["When was the company founded?"] },
                { "title": "Talks", "release": { "today_at": "09:55" },
                  "prompts": [{ "text": "Key idea?" }, { "text": "Selfie!", "kind": "photo" }] },
                { "kind": "team_poem", "release": { "at": "2026-03-14T16:20:00+03:00" },
                  "prompts": ["Write one line each."] }
            ]
        }"#;
        let offset = FixedOffset::east_opt(3 * 3600).unwrap();
        let catalog = BlockCatalog::from_json(json, offset, day()).unwrap();

        assert_eq!(catalog.len(), 3);
        assert_eq!(catalog.block(0).unwrap().release, Release::Immediate);
        assert_eq!(
            catalog.block(1).unwrap().release.time().unwrap().to_rfc3339(),
            "2026-03-14T06:55:00+00:00"
        );
        assert_eq!(catalog.block(1).unwrap().prompts[1].kind, PromptKind::Photo);
        assert_eq!(catalog.title(1), "Talks");
        assert_eq!(
            catalog.block(2).unwrap().release.time().unwrap().to_rfc3339(),
            "2026-03-14T13:20:00+00:00"
        );
        assert_eq!(catalog.poem_block(), Some(2));
    }

    #[test]
    fn bad_today_at_is_reported_with_block_index() {
        let json = r#"{ "blocks": [
            { "release": "immediate", "prompts": ["a"] },
            { "release": { "today_at": "25:99" }, "prompts": ["b"] }
        ] }"#;
        let err = BlockCatalog::from_json(json, utc(), day()).unwrap_err();
        assert!(matches!(err, CatalogError::InvalidRelease { index: 1, .. }));
    }
}
