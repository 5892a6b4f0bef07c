//! Cross-node event fan-out.
//!
//! The actor publishes every broadcast here; the connection registry
//! subscribes per room and forwards frames to local sessions. The `local`
//! backend keeps everything in-process; the `redis` backend rides pub/sub so
//! a room's events reach sessions on every node, in broker order.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::{protocol::RoomId, Config, Error, Result};

/// Lag bound for in-process subscribers. A session that falls this far
/// behind loses frames and will catch up through the replay buffer.
const LOCAL_BUFFER: usize = 256;

const RECONNECT_START: Duration = Duration::from_secs(1);
const RECONNECT_CAP: Duration = Duration::from_secs(16);

pub fn channel_name(room_id: &RoomId) -> String {
    format!("room:{room_id}")
}

pub struct Service {
    backend: Backend,
}

enum Backend {
    Local {
        rooms: Mutex<HashMap<RoomId, broadcast::Sender<String>>>,
    },
    Redis {
        client: redis::Client,
        publisher: tokio::sync::Mutex<Option<redis::aio::MultiplexedConnection>>,
        ctl: mpsc::UnboundedSender<Ctl>,
    },
}

enum Ctl {
    Subscribe(String, mpsc::UnboundedSender<String>),
    Unsubscribe(String),
}

pub struct Subscription {
    inner: SubscriptionInner,
}

enum SubscriptionInner {
    Local(broadcast::Receiver<String>),
    Remote(mpsc::UnboundedReceiver<String>),
}

impl Subscription {
    /// Next frame for this room, `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<String> {
        match &mut self.inner {
            SubscriptionInner::Local(rx) => loop {
                match rx.recv().await {
                    Ok(frame) => return Some(frame),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "local bus subscriber lagged, frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            },
            SubscriptionInner::Remote(rx) => rx.recv().await,
        }
    }
}

impl Service {
    pub fn build(config: &Config) -> Result<Arc<Self>> {
        let backend = match config.bus_backend.as_str() {
            "local" => Backend::Local {
                rooms: Mutex::new(HashMap::new()),
            },
            "redis" => {
                let url = config
                    .redis_url
                    .as_ref()
                    .ok_or_else(|| Error::bad_config("bus_backend = \"redis\" needs a redis_url."))?;
                let client = redis::Client::open(url.as_str())?;

                let (ctl, ctl_rx) = mpsc::unbounded_channel();
                tokio::spawn(subscriber_task(client.clone(), ctl_rx));

                Backend::Redis {
                    client,
                    publisher: tokio::sync::Mutex::new(None),
                    ctl,
                }
            }
            _ => {
                return Err(Error::bad_config(
                    "Bus backend must be one of: local, redis.",
                ))
            }
        };

        Ok(Arc::new(Self { backend }))
    }

    /// Fire-and-forget publish; returns once the broker accepted the frame.
    #[tracing::instrument(skip(self, frame))]
    pub async fn publish(&self, room_id: &RoomId, frame: String) -> Result<()> {
        match &self.backend {
            Backend::Local { rooms } => {
                let sender = {
                    let mut rooms = rooms.lock();
                    rooms
                        .entry(room_id.clone())
                        .or_insert_with(|| broadcast::channel(LOCAL_BUFFER).0)
                        .clone()
                };
                // No receivers just means nobody on this node is watching
                let _ = sender.send(frame);
                Ok(())
            }
            Backend::Redis {
                client, publisher, ..
            } => {
                let channel = channel_name(room_id);
                let mut guard = publisher.lock().await;

                if guard.is_none() {
                    *guard = Some(client.get_multiplexed_tokio_connection().await?);
                }

                let conn = guard.as_mut().expect("connection was just established");
                let result: redis::RedisResult<()> = redis::cmd("PUBLISH")
                    .arg(&channel)
                    .arg(&frame)
                    .query_async(conn)
                    .await;

                if let Err(first_error) = result {
                    // One reconnect attempt within the command's budget
                    debug!("publish failed, reconnecting: {first_error}");
                    let mut conn = client.get_multiplexed_tokio_connection().await?;
                    redis::cmd("PUBLISH")
                        .arg(&channel)
                        .arg(&frame)
                        .query_async::<()>(&mut conn)
                        .await?;
                    *guard = Some(conn);
                }

                Ok(())
            }
        }
    }

    /// Called by the connection registry when the first local session joins
    /// a room on this node.
    pub fn subscribe(&self, room_id: &RoomId) -> Subscription {
        match &self.backend {
            Backend::Local { rooms } => {
                let receiver = rooms
                    .lock()
                    .entry(room_id.clone())
                    .or_insert_with(|| broadcast::channel(LOCAL_BUFFER).0)
                    .subscribe();
                Subscription {
                    inner: SubscriptionInner::Local(receiver),
                }
            }
            Backend::Redis { ctl, .. } => {
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = ctl.send(Ctl::Subscribe(channel_name(room_id), tx));
                Subscription {
                    inner: SubscriptionInner::Remote(rx),
                }
            }
        }
    }

    /// Called when the last local session leaves a room on this node.
    pub fn unsubscribe(&self, room_id: &RoomId) {
        match &self.backend {
            Backend::Local { rooms } => {
                let mut rooms = rooms.lock();
                if let Some(sender) = rooms.get(room_id) {
                    if sender.receiver_count() == 0 {
                        rooms.remove(room_id);
                    }
                }
            }
            Backend::Redis { ctl, .. } => {
                let _ = ctl.send(Ctl::Unsubscribe(channel_name(room_id)));
            }
        }
    }
}

/// Owns the redis pub/sub connection. Reconnects with exponential backoff
/// and re-subscribes every active room; frames published during the gap are
/// lost, which the replay buffer covers for same-node reconnects.
async fn subscriber_task(client: redis::Client, mut ctl_rx: mpsc::UnboundedReceiver<Ctl>) {
    let mut subscribers: HashMap<String, mpsc::UnboundedSender<String>> = HashMap::new();
    let mut backoff = RECONNECT_START;

    'reconnect: loop {
        let pubsub = match client.get_async_pubsub().await {
            Ok(pubsub) => {
                backoff = RECONNECT_START;
                pubsub
            }
            Err(e) => {
                warn!("event bus connection failed, retrying in {backoff:?}: {e}");
                let sleep = tokio::time::sleep(backoff);
                tokio::pin!(sleep);
                // Keep absorbing subscribe/unsubscribe while we wait
                loop {
                    tokio::select! {
                        () = &mut sleep => break,
                        ctl = ctl_rx.recv() => match ctl {
                            Some(ctl) => apply_ctl(&mut subscribers, ctl),
                            None => return,
                        },
                    }
                }
                backoff = (backoff * 2).min(RECONNECT_CAP);
                continue 'reconnect;
            }
        };

        let (mut sink, mut stream) = pubsub.split();

        for channel in subscribers.keys() {
            if let Err(e) = sink.subscribe(channel).await {
                warn!("event bus re-subscribe failed: {e}");
                continue 'reconnect;
            }
        }

        loop {
            tokio::select! {
                message = stream.next() => {
                    let Some(message) = message else {
                        warn!("event bus connection lost, reconnecting");
                        continue 'reconnect;
                    };

                    let channel = message.get_channel_name().to_owned();
                    let Ok(frame) = message.get_payload::<String>() else {
                        error!("non-utf8 frame on {channel}, dropping");
                        continue;
                    };

                    let gone = subscribers
                        .get(&channel)
                        .map(|tx| tx.send(frame).is_err())
                        .unwrap_or(false);
                    if gone {
                        subscribers.remove(&channel);
                        let _ = sink.unsubscribe(&channel).await;
                    }
                }
                ctl = ctl_rx.recv() => {
                    let Some(ctl) = ctl else { return };
                    let lost = match &ctl {
                        Ctl::Subscribe(channel, _) => {
                            sink.subscribe(channel).await.is_err()
                        }
                        Ctl::Unsubscribe(channel) => {
                            let _ = sink.unsubscribe(channel).await;
                            false
                        }
                    };
                    apply_ctl(&mut subscribers, ctl);
                    if lost {
                        warn!("event bus subscribe failed, reconnecting");
                        continue 'reconnect;
                    }
                }
            }
        }
    }
}

fn apply_ctl(subscribers: &mut HashMap<String, mpsc::UnboundedSender<String>>, ctl: Ctl) {
    match ctl {
        Ctl::Subscribe(channel, tx) => {
            subscribers.insert(channel, tx);
        }
        Ctl::Unsubscribe(channel) => {
            subscribers.remove(&channel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> Arc<Service> {
        Arc::new(Service {
            backend: Backend::Local {
                rooms: Mutex::new(HashMap::new()),
            },
        })
    }

    #[tokio::test]
    async fn local_bus_preserves_per_room_order() {
        let bus = local();
        let room_id = RoomId::parse("abc123").unwrap();
        let mut subscription = bus.subscribe(&room_id);

        for i in 0..5 {
            bus.publish(&room_id, format!("frame-{i}")).await.unwrap();
        }

        for i in 0..5 {
            assert_eq!(subscription.recv().await.unwrap(), format!("frame-{i}"));
        }
    }

    #[tokio::test]
    async fn rooms_do_not_leak_across_channels() {
        let bus = local();
        let room_a = RoomId::parse("aaaaaa").unwrap();
        let room_b = RoomId::parse("bbbbbb").unwrap();

        let mut sub_a = bus.subscribe(&room_a);
        let mut sub_b = bus.subscribe(&room_b);

        bus.publish(&room_a, "only-for-a".to_owned()).await.unwrap();
        bus.publish(&room_b, "only-for-b".to_owned()).await.unwrap();

        assert_eq!(sub_a.recv().await.unwrap(), "only-for-a");
        assert_eq!(sub_b.recv().await.unwrap(), "only-for-b");
    }
}
