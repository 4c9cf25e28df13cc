use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use crate::track::Track;

/// Per-guild FIFO queues of pending tracks, created lazily on first use.
///
/// A guild that has interacted before keeps its entry even when drained or
/// cleared, so inspection can tell "empty queue" apart from "never seen".
pub struct QueueStore {
    queues: Mutex<HashMap<u64, VecDeque<Track>>>,
}

impl QueueStore {
    pub fn new() -> Self {
        QueueStore {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Appends a track, creating the guild's queue if absent. There is no
    /// capacity limit.
    pub fn enqueue(&self, guild_id: u64, track: Track) {
        let mut queues = self.queues.lock().expect("queue store lock poisoned");
        queues.entry(guild_id).or_default().push_back(track);
    }

    /// Removes and returns the head of the guild's queue. An exhausted or
    /// unknown queue yields `None`; that is a normal state, not an error.
    pub fn dequeue_front(&self, guild_id: u64) -> Option<Track> {
        let mut queues = self.queues.lock().expect("queue store lock poisoned");
        queues.get_mut(&guild_id)?.pop_front()
    }

    /// Empties the guild's queue in place. The entry itself survives.
    pub fn clear(&self, guild_id: u64) {
        let mut queues = self.queues.lock().expect("queue store lock poisoned");
        queues.entry(guild_id).or_default().clear();
    }

    /// Copy-on-read listing for display. `None` means the guild has never
    /// queued anything.
    pub fn snapshot(&self, guild_id: u64) -> Option<Vec<Track>> {
        let queues = self.queues.lock().expect("queue store lock poisoned");
        queues
            .get(&guild_id)
            .map(|queue| queue.iter().cloned().collect())
    }
}
