use std::{collections::VecDeque, time::Duration};

use tokio::time::Instant;

/// Per-room ring of recent broadcasts, keyed by event id. Serves reconnects
/// without touching the store; anything older than the window (or beyond the
/// capacity) requires a full resync.
pub struct ReplayBuffer {
    window: Duration,
    capacity: usize,
    entries: VecDeque<Entry>,
}

struct Entry {
    event_id: u64,
    frame: String,
    published_at: Instant,
}

impl ReplayBuffer {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity,
            entries: VecDeque::with_capacity(capacity.min(64)),
        }
    }

    pub fn push(&mut self, event_id: u64, frame: String) {
        self.prune();
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(Entry {
            event_id,
            frame,
            published_at: Instant::now(),
        });
    }

    fn prune(&mut self) {
        let now = Instant::now();
        while let Some(front) = self.entries.front() {
            if now.duration_since(front.published_at) > self.window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Frames with `event_id > last_event_id`, oldest first, or `None` when
    /// the gap can no longer be bridged and the client must resync.
    pub fn replay_from(&mut self, last_event_id: u64, latest: u64) -> Option<Vec<String>> {
        self.prune();

        if last_event_id > latest {
            // The client claims events this room never published
            return None;
        }
        if last_event_id == latest {
            return Some(Vec::new());
        }

        match self.entries.front() {
            Some(front) if front.event_id <= last_event_id + 1 => Some(
                self.entries
                    .iter()
                    .filter(|entry| entry.event_id > last_event_id)
                    .map(|entry| entry.frame.clone())
                    .collect(),
            ),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> ReplayBuffer {
        ReplayBuffer::new(Duration::from_secs(300), 4)
    }

    #[tokio::test(start_paused = true)]
    async fn replays_everything_after_the_requested_id() {
        let mut buf = buffer();
        for id in 1..=3 {
            buf.push(id, format!("frame-{id}"));
        }

        let frames = buf.replay_from(1, 3).unwrap();
        assert_eq!(frames, vec!["frame-2", "frame-3"]);
        assert_eq!(buf.replay_from(3, 3).unwrap(), Vec::<String>::new());
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_eviction_forces_resync() {
        let mut buf = buffer();
        for id in 1..=6 {
            buf.push(id, format!("frame-{id}"));
        }

        // 1 and 2 fell out of the ring, the gap after id 1 is unbridgeable
        assert!(buf.replay_from(1, 6).is_none());
        assert_eq!(buf.replay_from(2, 6).unwrap().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn old_frames_expire_after_the_window() {
        let mut buf = buffer();
        buf.push(1, "one".to_owned());

        tokio::time::advance(Duration::from_secs(299)).await;
        assert_eq!(buf.replay_from(0, 1).unwrap().len(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(buf.replay_from(0, 1).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn future_ids_require_resync() {
        let mut buf = buffer();
        buf.push(1, "one".to_owned());
        assert!(buf.replay_from(9, 1).is_none());
    }
}
