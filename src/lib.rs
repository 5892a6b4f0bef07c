pub mod api;
pub mod clap;
mod config;
mod database;
pub mod protocol;
// `self` is required for easy access to methods
#[allow(clippy::unused_self)]
pub mod service;
pub mod utils;

// Not async due to services() being used in many closures, and async closures are not stable as of writing
use std::sync::RwLock;

pub use config::Config;
pub use database::KeyValueDatabase;
pub use service::Services;
pub use utils::error::{Error, Result};

pub static SERVICES: RwLock<Option<&'static Services>> = RwLock::new(None);

pub fn services() -> &'static Services {
    SERVICES
        .read()
        .unwrap()
        .expect("SERVICES should be initialized when this is called")
}
