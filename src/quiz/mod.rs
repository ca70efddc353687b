//! Per-participant progression through the quest.

pub mod engine;
pub mod locks;
pub mod prompts;
pub mod state;

pub use engine::{ActivationSource, NextBlock, QuizEngine, SubmitOutcome};
pub use locks::ParticipantLocks;
pub use state::{Answer, ConversationState, Phase};
