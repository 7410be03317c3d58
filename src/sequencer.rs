//! Arrival-order admission of turns per session key.
//!
//! A turn takes a ticket when it arrives and runs once every earlier ticket
//! for the same key has been released, so stored history follows arrival
//! order even when a later turn's generation finishes first. Different keys
//! never wait on each other. Lanes are dropped once no ticket is outstanding.
//!
//! Ordering holds within one process; deployments sharing a Redis store
//! across processes still get per-write atomicity from the store.

use crate::model::SessionKey;
use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

#[derive(Default)]
struct LaneState {
    next_ticket: u64,
    serving: u64,
}

impl LaneState {
    fn idle(&self) -> bool {
        self.next_ticket == self.serving
    }
}

#[derive(Default)]
struct Lane {
    state: Mutex<LaneState>,
    turn_over: Condvar,
}

#[derive(Default)]
pub struct TurnSequencer {
    lanes: DashMap<SessionKey, Arc<Lane>>,
}

impl TurnSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the next ticket for `key` and blocks until every earlier ticket
    /// for that key has been released. Call this when the message arrives.
    pub fn admit(&self, key: &SessionKey) -> Ticket<'_> {
        // Taken under the map's entry guard so a lane is never retired
        // between lookup and ticket issue.
        let entry = self.lanes.entry(key.clone()).or_default();
        let lane = Arc::clone(entry.value());
        let number = {
            let mut state = lane.state.lock();
            let number = state.next_ticket;
            state.next_ticket += 1;
            number
        };
        drop(entry);

        {
            let mut state = lane.state.lock();
            while state.serving != number {
                lane.turn_over.wait(&mut state);
            }
        }
        Ticket {
            sequencer: self,
            key: key.clone(),
            lane,
        }
    }

    /// Keys with an outstanding ticket.
    pub fn active_keys(&self) -> usize {
        self.lanes.len()
    }

    fn retire(&self, key: &SessionKey) {
        self.lanes
            .remove_if(key, |_, lane| lane.state.lock().idle());
    }
}

/// The served position in a key's lane; hands over to the next arrival on
/// drop.
pub struct Ticket<'a> {
    sequencer: &'a TurnSequencer,
    key: SessionKey,
    lane: Arc<Lane>,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        {
            let mut state = self.lane.state.lock();
            state.serving += 1;
            self.lane.turn_over.notify_all();
        }
        self.sequencer.retire(&self.key);
    }
}
