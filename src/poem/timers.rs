//! Turn timeouts — a min-heap of deadlines polled by one task.
//!
//! Each team has at most one live turn. Cancelling a turn just forgets the
//! live entry; its heap entry is discarded when it surfaces.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::coordinator::PoemCoordinator;

/// Identifies one issued turn.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TurnKey {
    pub team: String,
    pub identity: String,
    /// `current_member_index` when the turn was issued.
    pub index: usize,
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Entry {
    deadline: DateTime<Utc>,
    key: TurnKey,
}

/// Time-ordered queue of pending turn deadlines.
#[derive(Debug, Default)]
pub struct TimeoutQueue {
    heap: BinaryHeap<Reverse<Entry>>,
    /// team → live turn and its deadline
    live: HashMap<String, (TurnKey, DateTime<Utc>)>,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule a deadline for `key`, replacing the team's previous turn.
    pub fn schedule(&mut self, key: TurnKey, deadline: DateTime<Utc>) {
        self.live
            .insert(key.team.clone(), (key.clone(), deadline));
        self.heap.push(Reverse(Entry { deadline, key }));
    }

    /// Forget the live turn of `team` if it belongs to `identity`.
    /// Returns whether anything was cancelled. Safe to call repeatedly.
    pub fn cancel(&mut self, team: &str, identity: &str) -> bool {
        match self.live.get(team) {
            Some((key, _)) if key.identity == identity => {
                self.live.remove(team);
                true
            }
            _ => false,
        }
    }

    /// Forget any live turn of `team`.
    pub fn cancel_team(&mut self, team: &str) {
        self.live.remove(team);
    }

    /// Pop every live turn whose deadline is at or before `now`.
    pub fn pop_expired(&mut self, now: DateTime<Utc>) -> Vec<TurnKey> {
        let mut expired = Vec::new();
        while let Some(Reverse(top)) = self.heap.peek() {
            if top.deadline > now {
                break;
            }
            let Some(Reverse(entry)) = self.heap.pop() else {
                break;
            };
            let is_live = self
                .live
                .get(&entry.key.team)
                .is_some_and(|(key, deadline)| *key == entry.key && *deadline == entry.deadline);
            if is_live {
                self.live.remove(&entry.key.team);
                expired.push(entry.key);
            }
        }
        expired
    }

    /// Number of live turns.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Earliest live deadline.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.live.values().map(|(_, deadline)| *deadline).min()
    }
}

/// Spawn the task that skips turn-holders whose time ran out.
pub fn spawn_turn_timer_loop(
    coordinator: Arc<PoemCoordinator>,
    poll: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(poll);
        loop {
            ticker.tick().await;
            let skipped = coordinator.expire_turns(Utc::now()).await;
            if skipped > 0 {
                tracing::debug!(skipped, "Expired poem turns");
            }
        }
    })
}
