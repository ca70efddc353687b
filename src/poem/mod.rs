//! Team poem: one line per member, in registration order, with turn timeouts.

pub mod coordinator;
pub mod model;
pub mod prompts;
pub mod timers;

pub use coordinator::{LineOutcome, PoemCoordinator, Readiness};
pub use model::{Contribution, LineRejection, PoemMember, PoemStats, PoemStatus, TeamPoem};
pub use timers::spawn_turn_timer_loop;
