//! Team poem data model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a team poem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoemStatus {
    NotStarted,
    InProgress,
    Completed,
    Cancelled,
}

impl std::fmt::Display for PoemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotStarted => write!(f, "not_started"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for PoemStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(Self::NotStarted),
            "in_progress" => Ok(Self::InProgress),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown poem status: {other}")),
        }
    }
}

/// One team member's slot in the round robin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoemMember {
    pub identity: String,
    pub chat_id: String,
    pub display_name: String,
    #[serde(default)]
    pub has_contributed: bool,
    #[serde(default)]
    pub contribution: Option<String>,
    #[serde(default)]
    pub skipped: bool,
}

impl PoemMember {
    pub fn new(
        identity: impl Into<String>,
        chat_id: impl Into<String>,
        display_name: impl Into<String>,
    ) -> Self {
        Self {
            identity: identity.into(),
            chat_id: chat_id.into(),
            display_name: display_name.into(),
            has_contributed: false,
            contribution: None,
            skipped: false,
        }
    }

    /// Whether this member's turn has been consumed (line or skip).
    pub fn is_processed(&self) -> bool {
        self.has_contributed || self.skipped
    }
}

/// Why a line was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineRejection {
    NotInProgress,
    NotMember,
    NotYourTurn,
    AlreadyProcessed,
}

/// A team's collaborative poem.
///
/// `current_member_index` always points at an unprocessed member, or equals
/// `members.len()` once every member has had a turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamPoem {
    pub id: Uuid,
    pub team: String,
    pub status: PoemStatus,
    pub members: Vec<PoemMember>,
    pub current_member_index: usize,
    /// One entry per processed member, in turn order.
    pub lines: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TeamPoem {
    /// A new in-progress poem. `members` must be in registration order.
    pub fn start(team: impl Into<String>, members: Vec<PoemMember>) -> Self {
        Self {
            id: Uuid::new_v4(),
            team: team.into(),
            status: PoemStatus::InProgress,
            members,
            current_member_index: 0,
            lines: Vec::new(),
            started_at: Some(Utc::now()),
            completed_at: None,
        }
    }

    pub fn current_member(&self) -> Option<&PoemMember> {
        self.members.get(self.current_member_index)
    }

    pub fn member(&self, identity: &str) -> Option<&PoemMember> {
        self.members.iter().find(|m| m.identity == identity)
    }

    /// Every member has had a turn.
    pub fn is_exhausted(&self) -> bool {
        self.current_member_index >= self.members.len()
    }

    /// Check whether `identity` may submit a line right now.
    pub fn check_turn(&self, identity: &str) -> Result<usize, LineRejection> {
        if self.status != PoemStatus::InProgress {
            return Err(LineRejection::NotInProgress);
        }
        let member = self.member(identity).ok_or(LineRejection::NotMember)?;
        if member.is_processed() {
            return Err(LineRejection::AlreadyProcessed);
        }
        match self.current_member() {
            Some(current) if current.identity == identity => Ok(self.current_member_index),
            _ => Err(LineRejection::NotYourTurn),
        }
    }

    /// Accept a line from the current turn-holder. Returns the line number (1-based).
    pub fn record_line(&mut self, identity: &str, text: &str) -> Result<usize, LineRejection> {
        let index = self.check_turn(identity)?;
        let member = &mut self.members[index];
        member.has_contributed = true;
        member.contribution = Some(text.to_string());
        self.lines.push(text.to_string());
        Ok(self.lines.len())
    }

    /// Skip the current turn-holder. Returns the synthetic line.
    pub fn record_skip(&mut self) -> Option<String> {
        if self.status != PoemStatus::InProgress {
            return None;
        }
        let index = self.current_member_index;
        let member = self.members.get_mut(index)?;
        if member.is_processed() {
            return None;
        }
        member.skipped = true;
        let line = skip_line(&member.display_name);
        self.lines.push(line.clone());
        Some(line)
    }

    /// Move the pointer past the current member. Stops at `members.len()`.
    pub fn advance(&mut self) {
        if self.current_member_index < self.members.len() {
            self.current_member_index += 1;
        }
    }

    pub fn mark_completed(&mut self) {
        self.status = PoemStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = PoemStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Members who actually wrote a line.
    pub fn authors(&self) -> Vec<&PoemMember> {
        self.members.iter().filter(|m| m.has_contributed).collect()
    }

    pub fn contributed_count(&self) -> usize {
        self.members.iter().filter(|m| m.has_contributed).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.members.iter().filter(|m| m.skipped).count()
    }

    /// The poem so far, one line per row.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }
}

/// Placeholder line for a member whose turn timed out.
pub fn skip_line(display_name: &str) -> String {
    format!("[skipped by {display_name}]")
}

/// A ledger row: one per processed turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contribution {
    pub team: String,
    pub identity: String,
    pub chat_id: String,
    pub display_name: String,
    /// 1-based position in the poem.
    pub line_number: usize,
    pub text: String,
    pub skipped: bool,
    pub created_at: DateTime<Utc>,
}

/// Summary of a team's poem for operators.
#[derive(Debug, Clone, Serialize)]
pub struct PoemStats {
    pub team: String,
    pub status: PoemStatus,
    pub members: usize,
    pub contributed: usize,
    pub skipped: usize,
    pub current_turn: Option<String>,
    pub lines: Vec<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PoemStats {
    pub fn not_started(team: impl Into<String>) -> Self {
        Self {
            team: team.into(),
            status: PoemStatus::NotStarted,
            members: 0,
            contributed: 0,
            skipped: 0,
            current_turn: None,
            lines: Vec::new(),
            started_at: None,
            completed_at: None,
        }
    }
}

impl From<&TeamPoem> for PoemStats {
    fn from(poem: &TeamPoem) -> Self {
        Self {
            team: poem.team.clone(),
            status: poem.status,
            members: poem.members.len(),
            contributed: poem.contributed_count(),
            skipped: poem.skipped_count(),
            current_turn: match poem.status {
                PoemStatus::InProgress => poem.current_member().map(|m| m.display_name.clone()),
                _ => None,
            },
            lines: poem.lines.clone(),
            started_at: poem.started_at,
            completed_at: poem.completed_at,
        }
    }
}
