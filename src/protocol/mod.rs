//! The versioned wire protocol spoken over `/ws/room/{roomId}`.
//!
//! Every frame is a JSON object `{type, requestId, payload}`; broadcasts
//! additionally carry the room-scoped `eventId` used for ordering and replay.
//! Unknown fields are ignored so newer peers can extend payloads freely.

pub mod ids;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};

pub use ids::{ParticipantId, RoomId, RoundId};

use crate::{utils::error::ErrorCode, Error, Result};

/// Message type strings are `entity.action.vN`, ASCII, at most this long.
pub const MAX_TYPE_LEN: usize = 64;

/// WebSocket close codes used by the server. Application errors ride inside
/// `error.v1` frames before these are sent, never as close-code payloads.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const POLICY_VIOLATION: u16 = 1008;
    pub const INTERNAL: u16 = 1011;
}

pub mod client_kind {
    pub const JOIN: &str = "room.join.v1";
    pub const LEAVE: &str = "room.leave.v1";
    pub const SYNC: &str = "room.sync.v1";
    pub const START_ROUND: &str = "round.start.v1";
    pub const REVEAL: &str = "round.reveal.v1";
    pub const RESET: &str = "round.reset.v1";
    pub const CAST_VOTE: &str = "vote.cast.v1";
    pub const CHAT: &str = "chat.send.v1";
}

pub mod event_kind {
    pub const ROOM_STATE: &str = "room.state.v1";
    pub const PARTICIPANT_JOINED: &str = "room.participant_joined.v1";
    pub const PARTICIPANT_LEFT: &str = "room.participant_left.v1";
    pub const PARTICIPANT_DISCONNECTED: &str = "room.participant_disconnected.v1";
    pub const PRESENCE_UPDATE: &str = "presence.update.v1";
    pub const ROUND_STARTED: &str = "round.started.v1";
    pub const ROUND_REVEALED: &str = "round.revealed.v1";
    pub const ROUND_RESET: &str = "round.reset.v1";
    pub const VOTE_RECORDED: &str = "vote.recorded.v1";
    pub const CHAT_MESSAGE: &str = "chat.message.v1";
    pub const ERROR: &str = "error.v1";
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(
        rename = "requestId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub request_id: Option<String>,
    #[serde(rename = "eventId", default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<u64>,
    #[serde(default)]
    pub payload: JsonValue,
}

impl Envelope {
    /// Decodes a text frame. Failures map to a 4004 with no requestId echo,
    /// since a frame that doesn't parse has no trustworthy requestId.
    pub fn decode(text: &str) -> Result<Self> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|_| Error::BadRequest(ErrorCode::Validation, "Malformed frame."))?;

        if !valid_message_type(&envelope.kind) {
            return Err(Error::BadRequest(
                ErrorCode::Validation,
                "Malformed message type.",
            ));
        }

        Ok(envelope)
    }

    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// `entity.action.vN`: at least two dot-separated name segments followed by a
/// version segment `v<digits>`, ASCII, bounded length.
fn valid_message_type(kind: &str) -> bool {
    if kind.len() > MAX_TYPE_LEN || !kind.is_ascii() {
        return false;
    }

    let segments: Vec<&str> = kind.split('.').collect();
    if segments.len() < 3 {
        return false;
    }

    let version = segments[segments.len() - 1];
    let name_ok = segments[..segments.len() - 1].iter().all(|s| {
        !s.is_empty()
            && s.bytes()
                .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_')
    });

    name_ok
        && version.len() >= 2
        && version.starts_with('v')
        && version[1..].bytes().all(|b| b.is_ascii_digit())
}

/// Role of a participant within a room.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Host,
    Voter,
    Observer,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundState {
    Open,
    Revealed,
    Reset,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyMode {
    Public,
    InviteOnly,
    OrgRestricted,
}

/// Subscription tier claimed by the bearer token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Pro,
    ProPlus,
    Enterprise,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub display_name: String,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub last_event_id: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRoundPayload {
    #[serde(default)]
    pub story_title: Option<String>,
    #[serde(default)]
    pub timer_seconds: Option<u64>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CastVotePayload {
    pub card_value: String,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPayload {
    #[serde(default)]
    pub clear_votes: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub message: String,
    #[serde(default)]
    pub reply_to: Option<String>,
}

/// One decoded inbound message. Each wire type maps to exactly one variant;
/// the session and actor dispatch on the tag.
#[derive(Clone, Debug)]
pub enum ClientMessage {
    Join(JoinPayload),
    Leave,
    Sync,
    StartRound(StartRoundPayload),
    Reveal,
    Reset(ResetPayload),
    CastVote(CastVotePayload),
    Chat(ChatPayload),
}

impl ClientMessage {
    pub fn parse(envelope: &Envelope) -> Result<Self> {
        fn payload<T: serde::de::DeserializeOwned>(envelope: &Envelope) -> Result<T> {
            serde_json::from_value(envelope.payload.clone())
                .map_err(|_| Error::BadRequest(ErrorCode::Validation, "Invalid payload."))
        }

        Ok(match envelope.kind.as_str() {
            client_kind::JOIN => Self::Join(payload(envelope)?),
            client_kind::LEAVE => Self::Leave,
            client_kind::SYNC => Self::Sync,
            client_kind::START_ROUND => Self::StartRound(payload(envelope)?),
            client_kind::REVEAL => Self::Reveal,
            client_kind::RESET => Self::Reset(payload(envelope)?),
            client_kind::CAST_VOTE => Self::CastVote(payload(envelope)?),
            client_kind::CHAT => Self::Chat(payload(envelope)?),
            _ => {
                return Err(Error::BadRequest(
                    ErrorCode::Validation,
                    "Unknown message type.",
                ))
            }
        })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Join(_) => client_kind::JOIN,
            Self::Leave => client_kind::LEAVE,
            Self::Sync => client_kind::SYNC,
            Self::StartRound(_) => client_kind::START_ROUND,
            Self::Reveal => client_kind::REVEAL,
            Self::Reset(_) => client_kind::RESET,
            Self::CastVote(_) => client_kind::CAST_VOTE,
            Self::Chat(_) => client_kind::CHAT,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantInfo {
    pub participant_id: ParticipantId,
    pub display_name: String,
    pub role: Role,
    pub connected: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealedVote {
    pub participant_id: ParticipantId,
    pub card_value: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevealStats {
    pub average: Option<f64>,
    pub median: Option<f64>,
    pub mode: Option<String>,
    pub consensus_reached: bool,
    pub total_votes: u64,
    pub distribution: BTreeMap<String, u64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundInfo {
    pub round_id: RoundId,
    pub round_number: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub story_title: Option<String>,
    pub state: RoundState,
    pub started_at: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timer_seconds: Option<u64>,
    /// Who has voted so far. Values stay hidden until reveal.
    pub voted: Vec<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub votes: Option<Vec<RevealedVote>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stats: Option<RevealStats>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStateSnapshot {
    pub room_id: RoomId,
    pub title: String,
    pub privacy_mode: PrivacyMode,
    /// The deck currently configured for the room. An open round keeps its
    /// own snapshot taken at start.
    pub deck: Vec<String>,
    pub participants: Vec<ParticipantInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<RoundInfo>,
    pub last_event_id: u64,
    /// Set when the requested `lastEventId` fell off the replay window and
    /// the client must discard local state.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub full_resync: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: u16,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<JsonValue>,
}

/// Outbound server messages. `kind()` yields the versioned wire type.
#[derive(Clone, Debug)]
pub enum ServerEvent {
    RoomState(RoomStateSnapshot),
    ParticipantJoined {
        participant: ParticipantInfo,
    },
    ParticipantLeft {
        participant_id: ParticipantId,
        reason: String,
    },
    ParticipantDisconnected {
        participant_id: ParticipantId,
        grace_deadline: u64,
    },
    PresenceUpdate {
        participant_id: ParticipantId,
        role: Role,
        reason: String,
    },
    RoundStarted(RoundInfo),
    RoundRevealed {
        round_id: RoundId,
        votes: Vec<RevealedVote>,
        stats: RevealStats,
    },
    RoundReset {
        round_id: RoundId,
        new_round: Option<RoundInfo>,
    },
    VoteRecorded {
        round_id: RoundId,
        participant_id: ParticipantId,
    },
    ChatMessage {
        participant_id: ParticipantId,
        display_name: String,
        message: String,
        reply_to: Option<String>,
        sent_at: u64,
    },
    Error(ErrorPayload),
}

impl ServerEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RoomState(_) => event_kind::ROOM_STATE,
            Self::ParticipantJoined { .. } => event_kind::PARTICIPANT_JOINED,
            Self::ParticipantLeft { .. } => event_kind::PARTICIPANT_LEFT,
            Self::ParticipantDisconnected { .. } => event_kind::PARTICIPANT_DISCONNECTED,
            Self::PresenceUpdate { .. } => event_kind::PRESENCE_UPDATE,
            Self::RoundStarted(_) => event_kind::ROUND_STARTED,
            Self::RoundRevealed { .. } => event_kind::ROUND_REVEALED,
            Self::RoundReset { .. } => event_kind::ROUND_RESET,
            Self::VoteRecorded { .. } => event_kind::VOTE_RECORDED,
            Self::ChatMessage { .. } => event_kind::CHAT_MESSAGE,
            Self::Error(_) => event_kind::ERROR,
        }
    }

    fn payload(&self) -> Result<JsonValue> {
        Ok(match self {
            Self::RoomState(snapshot) => serde_json::to_value(snapshot)?,
            Self::ParticipantJoined { participant } => json!({ "participant": participant }),
            Self::ParticipantLeft {
                participant_id,
                reason,
            } => json!({ "participantId": participant_id, "reason": reason }),
            Self::ParticipantDisconnected {
                participant_id,
                grace_deadline,
            } => json!({
                "participantId": participant_id,
                "graceDeadline": grace_deadline,
            }),
            Self::PresenceUpdate {
                participant_id,
                role,
                reason,
            } => json!({
                "participantId": participant_id,
                "role": role,
                "reason": reason,
            }),
            Self::RoundStarted(round) => serde_json::to_value(round)?,
            Self::RoundRevealed {
                round_id,
                votes,
                stats,
            } => json!({ "roundId": round_id, "votes": votes, "stats": stats }),
            Self::RoundReset {
                round_id,
                new_round,
            } => json!({ "roundId": round_id, "newRound": new_round }),
            // The value is deliberately blank; it only ever appears in
            // round.revealed.v1.
            Self::VoteRecorded {
                round_id,
                participant_id,
            } => json!({
                "roundId": round_id,
                "participantId": participant_id,
                "cardValue": "",
            }),
            Self::ChatMessage {
                participant_id,
                display_name,
                message,
                reply_to,
                sent_at,
            } => json!({
                "participantId": participant_id,
                "displayName": display_name,
                "message": message,
                "replyTo": reply_to,
                "sentAt": sent_at,
            }),
            Self::Error(payload) => serde_json::to_value(payload)?,
        })
    }

    /// Encodes this event as a text frame. `request_id` echoes the
    /// originating request where there is one; broadcasts carry their
    /// assigned `event_id`.
    pub fn encode(&self, request_id: Option<&str>, event_id: Option<u64>) -> Result<String> {
        let envelope = Envelope {
            kind: self.kind().to_owned(),
            request_id: request_id.map(ToOwned::to_owned),
            event_id,
            payload: self.payload()?,
        };
        envelope.encode()
    }
}

/// Builds an `error.v1` frame. Infallible by construction, so the error path
/// itself can never fail to serialize.
pub fn error_frame(
    code: ErrorCode,
    message: &str,
    details: Option<JsonValue>,
    request_id: Option<&str>,
) -> String {
    let mut payload = json!({
        "code": code.as_u16(),
        "message": message,
    });
    if let Some(details) = details {
        payload["details"] = details;
    }

    let mut frame = json!({
        "type": event_kind::ERROR,
        "payload": payload,
    });
    if let Some(request_id) = request_id {
        frame["requestId"] = json!(request_id);
    }

    frame.to_string()
}

/// Shorthand for turning a command failure into its `error.v1` frame.
pub fn error_frame_for(error: &Error, request_id: Option<&str>) -> String {
    error_frame(
        error.wire_code(),
        &error.sanitized_message(),
        error.details(),
        request_id,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn envelope_roundtrip() {
        let envelope = Envelope {
            kind: "vote.cast.v1".to_owned(),
            request_id: Some("d2f1c3a4-0000-4000-8000-123456789abc".to_owned()),
            event_id: None,
            payload: json!({ "cardValue": "5" }),
        };

        let text = envelope.encode().unwrap();
        let back = Envelope::decode(&text).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn unknown_envelope_fields_are_ignored() {
        let text = r#"{"type":"room.leave.v1","payload":{},"futureField":42}"#;
        let envelope = Envelope::decode(text).unwrap();
        assert_eq!(envelope.kind, "room.leave.v1");
        assert_matches!(ClientMessage::parse(&envelope), Ok(ClientMessage::Leave));
    }

    #[test]
    fn unknown_payload_fields_are_ignored() {
        let text = r#"{"type":"vote.cast.v1","payload":{"cardValue":"8","color":"red"}}"#;
        let envelope = Envelope::decode(text).unwrap();
        let message = ClientMessage::parse(&envelope).unwrap();
        assert_matches!(message, ClientMessage::CastVote(p) if p.card_value == "8");
    }

    #[test]
    fn malformed_frames_are_validation_errors() {
        for text in ["not json", "{}", r#"{"type":"NotAType"}"#, r#"{"type":"a.b"}"#] {
            let err = Envelope::decode(text).unwrap_err();
            assert_eq!(err.wire_code(), ErrorCode::Validation);
        }
    }

    #[test]
    fn message_type_format() {
        assert!(valid_message_type("room.join.v1"));
        assert!(valid_message_type("room.participant_joined.v1"));
        assert!(valid_message_type("chat.message.v12"));
        assert!(!valid_message_type("room.join"));
        assert!(!valid_message_type("Room.Join.v1"));
        assert!(!valid_message_type("room.join.1"));
        assert!(!valid_message_type("room..v1"));
        assert!(!valid_message_type(&format!("{}.act.v1", "x".repeat(70))));
    }

    #[test]
    fn every_client_kind_parses() {
        let frames = [
            (r#"{"type":"room.join.v1","payload":{"displayName":"Alice"}}"#, client_kind::JOIN),
            (r#"{"type":"room.leave.v1"}"#, client_kind::LEAVE),
            (r#"{"type":"room.sync.v1"}"#, client_kind::SYNC),
            (r#"{"type":"round.start.v1","payload":{}}"#, client_kind::START_ROUND),
            (r#"{"type":"round.reveal.v1"}"#, client_kind::REVEAL),
            (r#"{"type":"round.reset.v1","payload":{"clearVotes":true}}"#, client_kind::RESET),
            (r#"{"type":"vote.cast.v1","payload":{"cardValue":"3"}}"#, client_kind::CAST_VOTE),
            (r#"{"type":"chat.send.v1","payload":{"message":"hi"}}"#, client_kind::CHAT),
        ];

        for (text, kind) in frames {
            let envelope = Envelope::decode(text).unwrap();
            let message = ClientMessage::parse(&envelope).unwrap();
            assert_eq!(message.kind(), kind);
        }
    }

    #[test]
    fn vote_recorded_never_carries_the_value() {
        let event = ServerEvent::VoteRecorded {
            round_id: RoundId::new(),
            participant_id: ParticipantId::new(),
        };
        let frame = event.encode(None, Some(7)).unwrap();
        let value: JsonValue = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["payload"]["cardValue"], "");
        assert_eq!(value["eventId"], 7);
        assert_eq!(value["type"], "vote.recorded.v1");
    }

    #[test]
    fn error_frames_echo_the_request_id() {
        let frame = error_frame(ErrorCode::Forbidden, "Observers cannot vote.", None, Some("req-1"));
        let value: JsonValue = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "error.v1");
        assert_eq!(value["requestId"], "req-1");
        assert_eq!(value["payload"]["code"], 4003);

        let frame = error_frame(ErrorCode::Validation, "Malformed frame.", None, None);
        let value: JsonValue = serde_json::from_str(&frame).unwrap();
        assert!(value.get("requestId").is_none());
    }
}
