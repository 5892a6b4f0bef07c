use jsonwebtoken::{decode, DecodingKey, Validation};
use serde::Deserialize;

use crate::{
    protocol::{ClientMessage, PrivacyMode, Role, Tier},
    service::rooms::model::Room,
    utils::error::ErrorCode,
    Config, Error, Result,
};

/// Claims the external token issuer puts into access tokens. The core only
/// validates the signature and expiry; it never mints tokens.
#[derive(Debug, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: String,
    pub tier: Tier,
    #[serde(default)]
    pub org: Option<String>,
    /// Room ids this principal holds an invitation for, minted by the CRUD
    /// surface when an invite is accepted.
    #[serde(default)]
    pub invites: Vec<String>,
    pub exp: u64,
}

/// The resolved identity behind one connection.
#[derive(Clone, Debug)]
pub struct Principal {
    pub user_id: String,
    pub email: String,
    pub tier: Tier,
    pub org: Option<String>,
    pub invites: Vec<String>,
    /// Token expiry, seconds since the unix epoch. A live session outliving
    /// this gets a 4000 and a 1001 close so the client can refresh.
    pub expires_at: u64,
}

pub struct Service {
    jwt_decoding_key: DecodingKey,
    jwt_validation: Validation,
}

impl Service {
    pub fn build(config: &Config) -> Result<Self> {
        if config.jwt_secret.is_empty() {
            return Err(Error::bad_config("jwt_secret must not be empty."));
        }

        Ok(Self {
            jwt_decoding_key: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            jwt_validation: Validation::default(),
        })
    }

    /// Validates signature and expiry of a presented bearer token.
    #[tracing::instrument(skip(self, token))]
    pub fn validate_token(&self, token: &str) -> Result<Principal> {
        let data = decode::<Claims>(token, &self.jwt_decoding_key, &self.jwt_validation)
            .map_err(|_| Error::BadRequest(ErrorCode::Unauthorized, "Invalid access token."))?;

        let claims = data.claims;
        Ok(Principal {
            user_id: claims.sub,
            email: claims.email,
            tier: claims.tier,
            org: claims.org,
            invites: claims.invites,
            expires_at: claims.exp,
        })
    }

    /// Whether this principal may attach to the room at all, given its
    /// privacy mode. Authorization decisions are final, never retried.
    pub fn check_join(&self, principal: &Principal, room: &Room) -> Result<()> {
        let allowed = match room.privacy_mode {
            PrivacyMode::Public => true,
            PrivacyMode::InviteOnly => {
                principal.user_id == room.owner_user_id
                    || principal
                        .invites
                        .iter()
                        .any(|invite| invite == room.room_id.as_str())
            }
            PrivacyMode::OrgRestricted => match (&principal.org, &room.org) {
                (Some(principal_org), Some(room_org)) => principal_org == room_org,
                _ => false,
            },
        };

        if allowed {
            Ok(())
        } else {
            Err(Error::BadRequest(
                ErrorCode::Forbidden,
                "You are not allowed to join this room.",
            ))
        }
    }

    /// Cheap per-message gate applied before a command reaches the actor.
    ///
    /// Observers are never promoted, so rejecting them here is safe; every
    /// other role decision (host-only commands, chat policy) is made by the
    /// actor against current state.
    pub fn check_message_role(&self, role: Role, message: &ClientMessage) -> Result<()> {
        let blocked = role == Role::Observer
            && matches!(
                message,
                ClientMessage::CastVote(_)
                    | ClientMessage::StartRound(_)
                    | ClientMessage::Reveal
                    | ClientMessage::Reset(_)
            );

        if blocked {
            Err(Error::BadRequest(
                ErrorCode::Forbidden,
                "Observers cannot do that.",
            ))
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocol::RoomId,
        service::rooms::model::RoomConfig,
        utils,
    };
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn service() -> Service {
        Service {
            jwt_decoding_key: DecodingKey::from_secret(b"secret"),
            jwt_validation: Validation::default(),
        }
    }

    fn token(claims: &serde_json::Value) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap()
    }

    fn room(privacy_mode: PrivacyMode, org: Option<&str>) -> Room {
        Room {
            room_id: RoomId::parse("abc123").unwrap(),
            title: "Sprint".to_owned(),
            owner_user_id: "carol".to_owned(),
            privacy_mode,
            org: org.map(ToOwned::to_owned),
            owner_tier: Tier::Pro,
            config: RoomConfig::default(),
            created_at: 0,
            last_active_at: 0,
            deleted_at: None,
        }
    }

    fn principal(user_id: &str) -> Principal {
        Principal {
            user_id: user_id.to_owned(),
            email: format!("{user_id}@example.com"),
            tier: Tier::Free,
            org: None,
            invites: Vec::new(),
            expires_at: u64::MAX,
        }
    }

    #[test]
    fn valid_tokens_resolve_to_principals() {
        let exp = utils::secs_since_unix_epoch() + 600;
        let token = token(&serde_json::json!({
            "sub": "alice",
            "email": "alice@example.com",
            "tier": "pro_plus",
            "exp": exp,
        }));

        let principal = service().validate_token(&token).unwrap();
        assert_eq!(principal.user_id, "alice");
        assert_eq!(principal.tier, Tier::ProPlus);
    }

    #[test]
    fn expired_tokens_are_unauthorized() {
        let token = token(&serde_json::json!({
            "sub": "alice",
            "email": "alice@example.com",
            "tier": "free",
            "exp": 1,
        }));

        let err = service().validate_token(&token).unwrap_err();
        assert_eq!(err.wire_code(), ErrorCode::Unauthorized);
    }

    #[test]
    fn garbage_tokens_are_unauthorized() {
        let err = service().validate_token("not-a-jwt").unwrap_err();
        assert_eq!(err.wire_code(), ErrorCode::Unauthorized);
    }

    #[test]
    fn invite_only_rooms_need_an_invite_or_ownership() {
        let service = service();
        let room = room(PrivacyMode::InviteOnly, None);

        assert!(service.check_join(&principal("carol"), &room).is_ok());

        let mut invited = principal("alice");
        invited.invites.push("abc123".to_owned());
        assert!(service.check_join(&invited, &room).is_ok());

        let err = service.check_join(&principal("mallory"), &room).unwrap_err();
        assert_eq!(err.wire_code(), ErrorCode::Forbidden);
    }

    #[test]
    fn org_restricted_rooms_match_the_org_claim() {
        let service = service();
        let room = room(PrivacyMode::OrgRestricted, Some("acme"));

        let mut member = principal("alice");
        member.org = Some("acme".to_owned());
        assert!(service.check_join(&member, &room).is_ok());

        let mut outsider = principal("bob");
        outsider.org = Some("globex".to_owned());
        assert!(service.check_join(&outsider, &room).is_err());
        assert!(service.check_join(&principal("carol"), &room).is_err());
    }

    #[test]
    fn observers_are_blocked_from_voting_early() {
        let service = service();
        let cast = ClientMessage::CastVote(crate::protocol::CastVotePayload {
            card_value: "5".to_owned(),
        });

        assert!(service.check_message_role(Role::Observer, &cast).is_err());
        assert!(service.check_message_role(Role::Voter, &cast).is_ok());
        assert!(service
            .check_message_role(Role::Observer, &ClientMessage::Leave)
            .is_ok());
    }
}
