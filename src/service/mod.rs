use std::sync::Arc;

use crate::{Config, Result};

pub mod auth;
pub mod bus;
pub mod globals;
pub mod rate_limiting;
pub mod registry;
pub mod rooms;
pub mod store;

pub struct Services {
    pub globals: globals::Service,
    pub auth: auth::Service,
    pub store: store::Service,
    pub bus: Arc<bus::Service>,
    pub registry: Arc<registry::Service>,
    pub rooms: rooms::Service,
}

impl Services {
    pub fn build<D: store::Data + 'static>(db: &'static D, config: Config) -> Result<Self> {
        let bus = bus::Service::build(&config)?;

        Ok(Self {
            auth: auth::Service::build(&config)?,
            store: store::Service { db },
            registry: registry::Service::build(Arc::clone(&bus)),
            rooms: rooms::Service::build(db, Arc::clone(&bus), &config),
            bus,
            globals: globals::Service::load(config)?,
        })
    }
}
