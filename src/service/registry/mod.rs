use std::{
    collections::{hash_map::Entry, HashMap},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use axum::extract::ws::Message;
use parking_lot::Mutex;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::debug;

use crate::{
    protocol::RoomId,
    service::bus::{self, Subscription},
};

pub type SessionId = u64;

/// Maps rooms to the sessions connected on this node and drives the bus
/// subscription lifecycle: subscribe on first join, unsubscribe on last
/// leave. One fan-out task per room forwards bus frames, in order, to every
/// local session's outbound queue.
pub struct Service {
    bus: Arc<bus::Service>,
    rooms: Mutex<HashMap<RoomId, RoomEntry>>,
    session_counter: AtomicU64,
}

struct RoomEntry {
    sessions: HashMap<SessionId, mpsc::UnboundedSender<Message>>,
    fanout: JoinHandle<()>,
}

impl Service {
    pub fn build(bus: Arc<bus::Service>) -> Arc<Self> {
        Arc::new(Self {
            bus,
            rooms: Mutex::new(HashMap::new()),
            session_counter: AtomicU64::new(1),
        })
    }

    pub fn next_session_id(&self) -> SessionId {
        self.session_counter.fetch_add(1, Ordering::Relaxed)
    }

    pub fn join(
        self: &Arc<Self>,
        room_id: &RoomId,
        session_id: SessionId,
        outbound: mpsc::UnboundedSender<Message>,
    ) {
        let mut rooms = self.rooms.lock();
        match rooms.entry(room_id.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().sessions.insert(session_id, outbound);
            }
            Entry::Vacant(entry) => {
                debug!(%room_id, "first session in room on this node, subscribing");
                let subscription = self.bus.subscribe(room_id);
                let fanout = tokio::spawn(fanout_task(
                    Arc::clone(self),
                    room_id.clone(),
                    subscription,
                ));
                entry.insert(RoomEntry {
                    sessions: HashMap::from([(session_id, outbound)]),
                    fanout,
                });
            }
        }
    }

    pub fn leave(&self, room_id: &RoomId, session_id: SessionId) {
        let mut rooms = self.rooms.lock();
        if let Some(entry) = rooms.get_mut(room_id) {
            entry.sessions.remove(&session_id);
            if entry.sessions.is_empty() {
                debug!(%room_id, "last session left room on this node, unsubscribing");
                entry.fanout.abort();
                rooms.remove(room_id);
                self.bus.unsubscribe(room_id);
            }
        }
    }

    fn deliver(&self, room_id: &RoomId, frame: &str) {
        let rooms = self.rooms.lock();
        if let Some(entry) = rooms.get(room_id) {
            for outbound in entry.sessions.values() {
                // A full/closed queue means the session is going away; its
                // own teardown calls leave()
                let _ = outbound.send(Message::Text(frame.to_owned()));
            }
        }
    }

    pub fn local_session_count(&self, room_id: &RoomId) -> usize {
        self.rooms
            .lock()
            .get(room_id)
            .map(|entry| entry.sessions.len())
            .unwrap_or(0)
    }
}

async fn fanout_task(registry: Arc<Service>, room_id: RoomId, mut subscription: Subscription) {
    while let Some(frame) = subscription.recv().await {
        registry.deliver(&room_id, &frame);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn config() -> Config {
        figment::Figment::new()
            .merge(figment::providers::Serialized::defaults(serde_json::json!({
                "database_backend": "memory",
                "database_path": "",
                "jwt_secret": "secret",
            })))
            .extract()
            .unwrap()
    }

    #[tokio::test]
    async fn frames_fan_out_to_every_local_session() {
        let bus = bus::Service::build(&config()).unwrap();
        let registry = Service::build(Arc::clone(&bus));
        let room_id = RoomId::parse("abc123").unwrap();

        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        registry.join(&room_id, registry.next_session_id(), tx1);
        registry.join(&room_id, registry.next_session_id(), tx2);

        bus.publish(&room_id, "hello".to_owned()).await.unwrap();

        assert_eq!(rx1.recv().await.unwrap(), Message::Text("hello".to_owned()));
        assert_eq!(rx2.recv().await.unwrap(), Message::Text("hello".to_owned()));
    }

    #[tokio::test]
    async fn last_leave_unsubscribes() {
        let bus = bus::Service::build(&config()).unwrap();
        let registry = Service::build(Arc::clone(&bus));
        let room_id = RoomId::parse("abc123").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let session_id = registry.next_session_id();
        registry.join(&room_id, session_id, tx);
        assert_eq!(registry.local_session_count(&room_id), 1);

        registry.leave(&room_id, session_id);
        assert_eq!(registry.local_session_count(&room_id), 0);
    }
}
