use std::{
    collections::BTreeMap,
    fmt,
    net::{IpAddr, Ipv4Addr},
};

use serde::{de::IgnoredAny, Deserialize};
use tracing::warn;
use url::Url;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default = "default_address")]
    pub address: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    pub tls: Option<TlsConfig>,

    pub database_backend: String,
    pub database_path: String,

    /// HMAC secret the token issuer signs access tokens with. The core only
    /// validates; it never mints tokens.
    pub jwt_secret: String,

    #[serde(default = "default_bus_backend")]
    pub bus_backend: String,
    pub redis_url: Option<Url>,

    #[serde(default = "default_room_capacity")]
    pub room_capacity: usize,
    #[serde(default = "default_free_tier_room_capacity")]
    pub free_tier_room_capacity: usize,

    #[serde(default = "default_join_deadline_s")]
    pub join_deadline_s: u64,
    #[serde(default = "default_heartbeat_timeout_s")]
    pub heartbeat_timeout_s: u64,
    #[serde(default = "default_grace_period_s")]
    pub grace_period_s: u64,
    #[serde(default = "default_actor_idle_timeout_s")]
    pub actor_idle_timeout_s: u64,
    #[serde(default = "default_shutdown_grace_s")]
    pub shutdown_grace_s: u64,

    /// Messages per minute one connection may send before drawing 4006.
    #[serde(default = "default_message_rate_limit")]
    pub message_rate_limit: u32,
    /// Chat messages one participant may send per 30 second window.
    #[serde(default = "default_chat_rate_limit")]
    pub chat_rate_limit: u32,

    #[serde(default = "default_replay_window_s")]
    pub replay_window_s: u64,
    #[serde(default = "default_replay_capacity")]
    pub replay_capacity: usize,

    #[serde(default = "default_decks")]
    pub decks: BTreeMap<String, Vec<String>>,
    #[serde(default = "default_deck_name")]
    pub default_deck: String,

    #[serde(default = "default_log")]
    pub log: String,

    #[serde(flatten)]
    pub catchall: BTreeMap<String, IgnoredAny>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TlsConfig {
    pub certs: String,
    pub key: String,
}

const DEPRECATED_KEYS: &[&str] = &["ping_interval_s"];

impl Config {
    pub fn warn_deprecated(&self) {
        let mut was_deprecated = false;
        for key in self
            .catchall
            .keys()
            .filter(|key| DEPRECATED_KEYS.iter().any(|s| s == key))
        {
            warn!("Config parameter {} is deprecated", key);
            was_deprecated = true;
        }

        if was_deprecated {
            warn!("Check the croupier documentation for the replacement configuration parameters");
        }
    }

    /// Room capacity that applies for the given paying-or-not distinction.
    pub fn capacity_for_free_tier(&self) -> usize {
        self.free_tier_room_capacity.min(self.room_capacity)
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let lines = [
            ("Database backend", self.database_backend.clone()),
            ("Database path", self.database_path.clone()),
            ("Bus backend", self.bus_backend.clone()),
            (
                "Redis URL",
                match self.redis_url {
                    Some(_) => "set".to_owned(),
                    None => "not set".to_owned(),
                },
            ),
            ("Room capacity", self.room_capacity.to_string()),
            (
                "Free tier room capacity",
                self.free_tier_room_capacity.to_string(),
            ),
            ("Join deadline (s)", self.join_deadline_s.to_string()),
            ("Heartbeat timeout (s)", self.heartbeat_timeout_s.to_string()),
            ("Grace period (s)", self.grace_period_s.to_string()),
            (
                "Message rate limit (per minute)",
                self.message_rate_limit.to_string(),
            ),
            ("Replay window (s)", self.replay_window_s.to_string()),
            ("Replay capacity", self.replay_capacity.to_string()),
            ("Default deck", self.default_deck.clone()),
            ("Decks", self.decks.keys().cloned().collect::<Vec<_>>().join(", ")),
        ];

        let mut msg: String = "Active config values:\n\n".to_owned();

        for (name, value) in lines {
            msg += &format!("{name}: {value}\n");
        }

        write!(f, "{msg}")
    }
}

fn default_address() -> IpAddr {
    Ipv4Addr::LOCALHOST.into()
}

fn default_port() -> u16 {
    8448
}

fn default_bus_backend() -> String {
    "local".to_owned()
}

fn default_room_capacity() -> usize {
    1000
}

fn default_free_tier_room_capacity() -> usize {
    8
}

fn default_join_deadline_s() -> u64 {
    10
}

fn default_heartbeat_timeout_s() -> u64 {
    60
}

fn default_grace_period_s() -> u64 {
    5 * 60
}

fn default_actor_idle_timeout_s() -> u64 {
    60
}

fn default_shutdown_grace_s() -> u64 {
    30
}

fn default_message_rate_limit() -> u32 {
    100
}

fn default_chat_rate_limit() -> u32 {
    10
}

fn default_replay_window_s() -> u64 {
    5 * 60
}

fn default_replay_capacity() -> usize {
    1024
}

fn default_deck_name() -> String {
    "fibonacci".to_owned()
}

fn default_decks() -> BTreeMap<String, Vec<String>> {
    let fibonacci = ["0", "1", "2", "3", "5", "8", "13", "21", "34", "55", "89", "?", "☕"];
    let modified = ["0", "½", "1", "2", "3", "5", "8", "13", "20", "40", "100", "?", "☕"];
    let tshirt = ["XS", "S", "M", "L", "XL", "XXL", "?"];
    let powers = ["1", "2", "4", "8", "16", "32", "64", "?"];

    let mut decks = BTreeMap::new();
    for (name, cards) in [
        ("fibonacci", &fibonacci[..]),
        ("modified_fibonacci", &modified[..]),
        ("tshirt", &tshirt[..]),
        ("powers_of_two", &powers[..]),
    ] {
        decks.insert(
            name.to_owned(),
            cards.iter().map(|&c| c.to_owned()).collect(),
        );
    }
    decks
}

fn default_log() -> String {
    "warn,croupier=info".to_owned()
}
