use thiserror::Error;
use tracing::error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Application error codes carried inside `error.v1` frames. These ride the
/// wire before any close frame; WebSocket close codes stay in the 1xxx range.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Unauthorized,
    RoomNotFound,
    InvalidVote,
    Forbidden,
    Validation,
    InvalidState,
    RateLimited,
    RoomFull,
    PolicyViolation,
    Internal,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        match self {
            ErrorCode::Unauthorized => 4000,
            ErrorCode::RoomNotFound => 4001,
            ErrorCode::InvalidVote => 4002,
            ErrorCode::Forbidden => 4003,
            ErrorCode::Validation => 4004,
            ErrorCode::InvalidState => 4005,
            ErrorCode::RateLimited => 4006,
            ErrorCode::RoomFull => 4007,
            ErrorCode::PolicyViolation => 4008,
            ErrorCode::Internal => 4999,
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("There was a problem with the connection to the sqlite database: {source}")]
    SqliteError {
        #[from]
        source: rusqlite::Error,
    },
    #[error("There was a problem with the connection to the event bus: {source}")]
    RedisError {
        #[from]
        source: redis::RedisError,
    },
    #[error("Could not do this io: {source}")]
    IoError {
        #[from]
        source: std::io::Error,
    },
    #[error("Could not encode or decode json: {source}")]
    JsonError {
        #[from]
        source: serde_json::Error,
    },
    #[error("{0}")]
    BadConfig(&'static str),
    #[error("{0}")]
    /// Don't create this directly. Use Error::bad_database instead.
    BadDatabase(&'static str),
    /// A vote already exists for this (round, participant). The store
    /// surfaces this distinctly so the actor can answer "already voted".
    #[error("vote already recorded for this participant in this round")]
    DuplicateVote,
    /// Another writer claimed this round number first. Resolved by re-reading
    /// the round state and retrying once.
    #[error("round number {0} already taken")]
    RoundNumberTaken(u64),
    /// Optimistic round update found a different state than expected.
    #[error("round state changed concurrently")]
    RoundStateConflict,
    #[error("{n}: {1}", n = _0.as_u16())]
    BadRequest(ErrorCode, &'static str),
    #[error("{n}: {1}", n = _0.as_u16())]
    Detailed(ErrorCode, &'static str, serde_json::Value),
}

impl Error {
    pub fn bad_database(message: &'static str) -> Self {
        error!("BadDatabase: {}", message);
        Self::BadDatabase(message)
    }

    pub fn bad_config(message: &'static str) -> Self {
        error!("BadConfig: {}", message);
        Self::BadConfig(message)
    }

    /// The application error code this error maps to on the wire.
    pub fn wire_code(&self) -> ErrorCode {
        match self {
            Self::BadRequest(code, _) | Self::Detailed(code, _, _) => *code,
            Self::DuplicateVote => ErrorCode::InvalidVote,
            _ => ErrorCode::Internal,
        }
    }

    /// Client-facing message. Infra errors never leak verbatim.
    pub fn sanitized_message(&self) -> String {
        match self {
            Self::BadRequest(_, message) | Self::Detailed(_, message, _) => (*message).to_owned(),
            Self::DuplicateVote => "You already voted in this round.".to_owned(),
            _ => "Internal server error.".to_owned(),
        }
    }

    /// Structured details for the client, if any (e.g. the valid card values
    /// accompanying an invalid-vote rejection).
    pub fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::Detailed(_, _, details) => Some(details.clone()),
            _ => None,
        }
    }
}
