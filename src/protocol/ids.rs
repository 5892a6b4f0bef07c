use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::utils;

/// Opaque 6-character room identifier, minted by the room CRUD surface.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

/// Identifier of one participant attachment. Stable across a reconnect
/// within the grace window, fresh otherwise.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ParticipantId(String);

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoundId(String);

#[derive(Debug, thiserror::Error)]
#[error("invalid identifier")]
pub struct IdParseError;

const ROOM_ID_LEN: usize = 6;
const MAX_ID_LEN: usize = 64;

fn valid_token(s: &str, exact: Option<usize>) -> bool {
    let len_ok = match exact {
        Some(n) => s.len() == n,
        None => !s.is_empty() && s.len() <= MAX_ID_LEN,
    };
    len_ok && s.bytes().all(|b| b.is_ascii_alphanumeric())
}

macro_rules! id_impls {
    ($ty:ident) => {
        impl $ty {
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl Serialize for $ty {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $ty {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                utils::deserialize_from_str(deserializer)
            }
        }
    };
}

id_impls!(RoomId);
id_impls!(ParticipantId);
id_impls!(RoundId);

impl RoomId {
    pub fn parse(s: &str) -> Result<Self, IdParseError> {
        if valid_token(s, Some(ROOM_ID_LEN)) {
            Ok(Self(s.to_owned()))
        } else {
            Err(IdParseError)
        }
    }
}

impl FromStr for RoomId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl ParticipantId {
    pub fn new() -> Self {
        Self(format!("p{}", utils::random_string(16)))
    }

    pub fn parse(s: &str) -> Result<Self, IdParseError> {
        if valid_token(s, None) {
            Ok(Self(s.to_owned()))
        } else {
            Err(IdParseError)
        }
    }
}

impl Default for ParticipantId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for ParticipantId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl RoundId {
    pub fn new() -> Self {
        Self(format!("r{}", utils::random_string(16)))
    }

    pub fn parse(s: &str) -> Result<Self, IdParseError> {
        if valid_token(s, None) {
            Ok(Self(s.to_owned()))
        } else {
            Err(IdParseError)
        }
    }
}

impl Default for RoundId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for RoundId {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_id_must_be_six_alphanumerics() {
        assert!(RoomId::parse("abc123").is_ok());
        assert!(RoomId::parse("abc12").is_err());
        assert!(RoomId::parse("abc1234").is_err());
        assert!(RoomId::parse("abc 12").is_err());
        assert!(RoomId::parse("abc-12").is_err());
    }

    #[test]
    fn participant_ids_are_unique() {
        assert_ne!(ParticipantId::new(), ParticipantId::new());
    }

    #[test]
    fn ids_roundtrip_through_serde() {
        let id = RoomId::parse("abc123").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"abc123\"");
        let back: RoomId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
