//! Persistence layer — libSQL-backed storage for participants, answers and poems.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{
    AnswerRow, BlockCompletion, Database, NewParticipant, Participant, ParticipantFilter,
    ParticipantPatch,
};
