//! Participant conversation state — which step of the quest a participant is on.

use serde::{Deserialize, Serialize};

/// Coarse phases of the participant flow.
///
/// Progresses: AwaitingName → AwaitingTeam → AwaitingConfirmation →
/// Answering ⇄ WaitingForBlock → InTeamPoem → Finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    AwaitingName,
    AwaitingTeam,
    AwaitingConfirmation,
    Answering,
    WaitingForBlock,
    InTeamPoem,
    Finished,
}

impl Phase {
    /// Check if a transition from `self` to `target` is valid.
    pub fn can_transition_to(&self, target: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, target),
            (AwaitingName, AwaitingTeam)
                | (AwaitingTeam, AwaitingConfirmation)
                | (AwaitingConfirmation, Answering)
                | (Answering, Answering)
                | (Answering, WaitingForBlock)
                | (Answering, InTeamPoem)
                | (Answering, Finished)
                | (WaitingForBlock, Answering)
                | (WaitingForBlock, InTeamPoem)
                | (WaitingForBlock, Finished)
                | (InTeamPoem, Finished)
        )
    }

    /// Whether this phase is terminal (nothing left to answer).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished)
    }

    /// Whether registration has been completed and the quest begun.
    pub fn is_playing(&self) -> bool {
        matches!(
            self,
            Self::Answering | Self::WaitingForBlock | Self::InTeamPoem | Self::Finished
        )
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::AwaitingName => "awaiting_name",
            Self::AwaitingTeam => "awaiting_team",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Answering => "answering",
            Self::WaitingForBlock => "waiting_for_block",
            Self::InTeamPoem => "in_team_poem",
            Self::Finished => "finished",
        };
        write!(f, "{s}")
    }
}

/// A single accepted answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Answer {
    Text { text: String },
    Photo { file_id: String },
}

const PHOTO_PREFIX: &str = "photo:";

impl Answer {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn photo(file_id: impl Into<String>) -> Self {
        Self::Photo {
            file_id: file_id.into(),
        }
    }

    /// Encode for an answer column. Photos become `photo:<file_id>`.
    pub fn to_cell(&self) -> String {
        match self {
            Self::Text { text } => text.clone(),
            Self::Photo { file_id } => format!("{PHOTO_PREFIX}{file_id}"),
        }
    }

    /// Decode an answer column.
    pub fn from_cell(cell: &str) -> Self {
        match cell.strip_prefix(PHOTO_PREFIX) {
            Some(file_id) => Self::photo(file_id),
            None => Self::text(cell),
        }
    }
}

/// Persisted conversation state, stored with the participant row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ConversationState {
    AwaitingName,
    AwaitingTeam,
    AwaitingConfirmation,
    /// Mid-block. `answers.len() == step`.
    Answering {
        block: usize,
        step: usize,
        answers: Vec<Answer>,
    },
    /// Idle until `block` unlocks.
    WaitingForBlock { block: usize },
    InTeamPoem { team: String },
    Finished,
}

impl Default for ConversationState {
    fn default() -> Self {
        Self::AwaitingName
    }
}

impl ConversationState {
    /// Fresh session at the start of `block`.
    pub fn answering(block: usize) -> Self {
        Self::Answering {
            block,
            step: 0,
            answers: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        match self {
            Self::AwaitingName => Phase::AwaitingName,
            Self::AwaitingTeam => Phase::AwaitingTeam,
            Self::AwaitingConfirmation => Phase::AwaitingConfirmation,
            Self::Answering { .. } => Phase::Answering,
            Self::WaitingForBlock { .. } => Phase::WaitingForBlock,
            Self::InTeamPoem { .. } => Phase::InTeamPoem,
            Self::Finished => Phase::Finished,
        }
    }

    /// Record an accepted answer and advance the step.
    ///
    /// Returns the new step, or `None` if not answering.
    pub fn push_answer(&mut self, answer: Answer) -> Option<usize> {
        match self {
            Self::Answering { step, answers, .. } => {
                answers.push(answer);
                *step += 1;
                Some(*step)
            }
            _ => None,
        }
    }

    pub fn to_json(&self) -> String {
        // Tagged enums of strings and integers always serialize.
        serde_json::to_string(self).unwrap_or_else(|_| "{\"phase\":\"awaiting_name\"}".into())
    }
}
