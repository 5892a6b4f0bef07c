use std::{
    future::Future,
    sync::atomic::{self, AtomicBool},
    time::Duration,
};

use tokio::sync::broadcast;
use tracing::info;

use crate::{Config, Error, Result};

pub struct Service {
    pub config: Config,
    pub shutdown: AtomicBool,
    pub draining: DrainHandler,
}

/// Fans the shutdown notification out to every connection session so they
/// can say goodbye (close 1001) instead of just vanishing.
pub struct DrainHandler(broadcast::Sender<()>);

impl DrainHandler {
    pub fn new() -> Self {
        Self(broadcast::channel(1).0)
    }

    pub fn watch(&self) -> impl Future<Output = ()> {
        let mut rx = self.0.subscribe();

        async move {
            let _ = rx.recv().await;
        }
    }

    pub fn fire(&self) {
        let _ = self.0.send(());
    }
}

impl Default for DrainHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl Service {
    pub fn load(config: Config) -> Result<Self> {
        if config.jwt_secret.is_empty() {
            return Err(Error::bad_config("jwt_secret must not be empty."));
        }
        if !config.decks.contains_key(&config.default_deck) {
            return Err(Error::bad_config("default_deck is not in the deck catalog."));
        }
        if config.bus_backend == "redis" && config.redis_url.is_none() {
            return Err(Error::bad_config("bus_backend = \"redis\" needs a redis_url."));
        }

        Ok(Self {
            config,
            shutdown: AtomicBool::new(false),
            draining: DrainHandler::new(),
        })
    }

    pub fn join_deadline(&self) -> Duration {
        Duration::from_secs(self.config.join_deadline_s)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.config.heartbeat_timeout_s)
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(atomic::Ordering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, atomic::Ordering::Relaxed);
        info!(target: "shutdown", "Received shutdown notification, draining connections...");
        self.draining.fire();
    }
}
