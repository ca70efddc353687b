//! Event Quest — time-gated event questionnaire bot with a team poem finale.

pub mod admin;
pub mod bot;
pub mod catalog;
pub mod channels;
pub mod config;
pub mod error;
pub mod export;
pub mod poem;
pub mod quiz;
pub mod scheduler;
pub mod store;
