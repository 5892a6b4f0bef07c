//! End-to-end exercises of the room actor over an in-memory store and the
//! in-process bus: join, vote, reveal, reset, host migration, reconnection
//! replay.

use std::{sync::Arc, time::Duration};

use croupier::{
    protocol::{PrivacyMode, Role, RoomId, Tier},
    service::{
        auth::Principal,
        bus,
        rooms::{
            self,
            model::{Room, RoomConfig},
        },
        store::Data,
    },
    utils::error::ErrorCode,
    Config, KeyValueDatabase,
};
use serde_json::Value as JsonValue;

fn test_config() -> Config {
    figment::Figment::new()
        .merge(figment::providers::Serialized::defaults(serde_json::json!({
            "database_backend": "memory",
            "database_path": "",
            "jwt_secret": "secret",
        })))
        .extract()
        .unwrap()
}

struct Harness {
    db: &'static KeyValueDatabase,
    bus: Arc<bus::Service>,
    rooms: rooms::Service,
    room_id: RoomId,
}

fn harness() -> Harness {
    let config = test_config();
    let db: &'static KeyValueDatabase =
        Box::leak(Box::new(KeyValueDatabase::memory_for_tests(&config).unwrap()));
    let bus = bus::Service::build(&config).unwrap();
    let rooms = rooms::Service::build(db, Arc::clone(&bus), &config);

    let room_id = RoomId::parse("abc123").unwrap();
    db.put_room(&Room {
        room_id: room_id.clone(),
        title: "Sprint planning".to_owned(),
        owner_user_id: "carol".to_owned(),
        privacy_mode: PrivacyMode::Public,
        org: None,
        owner_tier: Tier::Pro,
        config: RoomConfig::default(),
        created_at: 1,
        last_active_at: 1,
        deleted_at: None,
    })
    .unwrap();

    Harness {
        db,
        bus,
        rooms,
        room_id,
    }
}

fn principal(user_id: &str) -> Principal {
    Principal {
        user_id: user_id.to_owned(),
        email: format!("{user_id}@example.com"),
        tier: Tier::Pro,
        org: None,
        invites: Vec::new(),
        expires_at: u64::MAX,
    }
}

async fn join(
    harness: &Harness,
    user_id: &str,
    role: Option<Role>,
) -> croupier::service::rooms::RegisterOutcome {
    harness
        .rooms
        .register(
            &harness.room_id,
            principal(user_id),
            user_id.to_owned(),
            role,
            None,
            None,
        )
        .await
        .unwrap()
}

async fn next_event(sub: &mut bus::Subscription) -> JsonValue {
    let frame = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await
        .expect("timed out waiting for a broadcast")
        .expect("bus subscription closed");
    serde_json::from_str(&frame).unwrap()
}

async fn next_event_of(sub: &mut bus::Subscription, kind: &str) -> JsonValue {
    for _ in 0..32 {
        let event = next_event(sub).await;
        if event["type"] == kind {
            return event;
        }
    }
    panic!("never saw a {kind} broadcast");
}

#[tokio::test]
async fn happy_vote_and_reveal() {
    let harness = harness();
    let mut sub = harness.bus.subscribe(&harness.room_id);

    let carol = join(&harness, "carol", None).await;
    assert_eq!(carol.role, Role::Host);
    let alice = join(&harness, "alice", Some(Role::Voter)).await;
    let bob = join(&harness, "bob", Some(Role::Voter)).await;

    harness
        .rooms
        .start_round(&harness.room_id, carol.participant_id.clone(), None, None, None)
        .await
        .unwrap();

    harness
        .rooms
        .cast_vote(
            &harness.room_id,
            alice.participant_id.clone(),
            "5".to_owned(),
            None,
        )
        .await
        .unwrap();
    harness
        .rooms
        .cast_vote(
            &harness.room_id,
            bob.participant_id.clone(),
            "8".to_owned(),
            None,
        )
        .await
        .unwrap();

    // Both recordings go out with a blank value
    for _ in 0..2 {
        let recorded = next_event_of(&mut sub, "vote.recorded.v1").await;
        assert_eq!(recorded["payload"]["cardValue"], "");
    }

    harness
        .rooms
        .reveal(&harness.room_id, carol.participant_id.clone(), None)
        .await
        .unwrap();

    let revealed = next_event_of(&mut sub, "round.revealed.v1").await;
    let stats = &revealed["payload"]["stats"];
    assert_eq!(stats["average"], 6.5);
    assert_eq!(stats["median"], 6.5);
    assert_eq!(stats["mode"], "5");
    assert_eq!(stats["consensusReached"], false);
    assert_eq!(stats["totalVotes"], 2);
    assert_eq!(stats["distribution"]["5"], 1);
    assert_eq!(stats["distribution"]["8"], 1);

    let values: Vec<&str> = revealed["payload"]["votes"]
        .as_array()
        .unwrap()
        .iter()
        .map(|vote| vote["cardValue"].as_str().unwrap())
        .collect();
    assert_eq!(values.len(), 2);
    assert!(values.contains(&"5"));
    assert!(values.contains(&"8"));
}

#[tokio::test]
async fn observer_cannot_vote() {
    let harness = harness();

    let carol = join(&harness, "carol", None).await;
    harness
        .rooms
        .start_round(&harness.room_id, carol.participant_id.clone(), None, None, None)
        .await
        .unwrap();

    let dave = join(&harness, "dave", Some(Role::Observer)).await;
    let mut sub = harness.bus.subscribe(&harness.room_id);

    let error = harness
        .rooms
        .cast_vote(
            &harness.room_id,
            dave.participant_id.clone(),
            "5".to_owned(),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(error.wire_code(), ErrorCode::Forbidden);

    // No broadcast was emitted for the rejected vote; chat proves the
    // subscription works and nothing came before it
    harness
        .rooms
        .chat(
            &harness.room_id,
            dave.participant_id.clone(),
            "hello".to_owned(),
            None,
            None,
        )
        .await
        .unwrap();
    let event = next_event(&mut sub).await;
    assert_eq!(event["type"], "chat.message.v1");
}

#[tokio::test]
async fn reveal_with_no_votes_is_invalid_state() {
    let harness = harness();

    let carol = join(&harness, "carol", None).await;
    harness
        .rooms
        .start_round(&harness.room_id, carol.participant_id.clone(), None, None, None)
        .await
        .unwrap();

    let error = harness
        .rooms
        .reveal(&harness.room_id, carol.participant_id.clone(), None)
        .await
        .unwrap_err();
    assert_eq!(error.wire_code(), ErrorCode::InvalidState);
}

#[tokio::test]
async fn vote_outside_the_deck_lists_valid_values() {
    let harness = harness();

    let carol = join(&harness, "carol", None).await;
    harness
        .rooms
        .start_round(&harness.room_id, carol.participant_id.clone(), None, None, None)
        .await
        .unwrap();

    let error = harness
        .rooms
        .cast_vote(
            &harness.room_id,
            carol.participant_id.clone(),
            "7".to_owned(),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(error.wire_code(), ErrorCode::InvalidVote);
    let details = error.details().expect("details with the valid values");
    assert!(details["validValues"]
        .as_array()
        .unwrap()
        .iter()
        .any(|v| v == "5"));
}

#[tokio::test]
async fn second_vote_in_a_round_is_rejected_once() {
    let harness = harness();

    let carol = join(&harness, "carol", None).await;
    harness
        .rooms
        .start_round(&harness.room_id, carol.participant_id.clone(), None, None, None)
        .await
        .unwrap();

    harness
        .rooms
        .cast_vote(
            &harness.room_id,
            carol.participant_id.clone(),
            "3".to_owned(),
            None,
        )
        .await
        .unwrap();

    let error = harness
        .rooms
        .cast_vote(
            &harness.room_id,
            carol.participant_id.clone(),
            "5".to_owned(),
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(error.wire_code(), ErrorCode::InvalidVote);
}

#[tokio::test]
async fn round_numbers_are_dense_and_increasing() {
    let harness = harness();

    let carol = join(&harness, "carol", None).await;

    for expected in 1..=3u64 {
        harness
            .rooms
            .start_round(&harness.room_id, carol.participant_id.clone(), None, None, None)
            .await
            .unwrap();
        harness
            .rooms
            .cast_vote(
                &harness.room_id,
                carol.participant_id.clone(),
                "3".to_owned(),
                None,
            )
            .await
            .unwrap();
        harness
            .rooms
            .reveal(&harness.room_id, carol.participant_id.clone(), None)
            .await
            .unwrap();
        harness
            .rooms
            .reset(&harness.room_id, carol.participant_id.clone(), false, None)
            .await
            .unwrap();

        assert_eq!(harness.db.max_round_number(&harness.room_id).unwrap(), expected);
    }
}

#[tokio::test]
async fn starting_over_an_open_round_is_rejected() {
    let harness = harness();

    let carol = join(&harness, "carol", None).await;
    harness
        .rooms
        .start_round(&harness.room_id, carol.participant_id.clone(), None, None, None)
        .await
        .unwrap();

    let error = harness
        .rooms
        .start_round(&harness.room_id, carol.participant_id.clone(), None, None, None)
        .await
        .unwrap_err();
    assert_eq!(error.wire_code(), ErrorCode::InvalidState);
}

#[tokio::test]
async fn non_host_cannot_run_rounds() {
    let harness = harness();

    let _carol = join(&harness, "carol", None).await;
    let alice = join(&harness, "alice", Some(Role::Voter)).await;

    let error = harness
        .rooms
        .start_round(&harness.room_id, alice.participant_id.clone(), None, None, None)
        .await
        .unwrap_err();
    assert_eq!(error.wire_code(), ErrorCode::Forbidden);
}

#[tokio::test(start_paused = true)]
async fn host_migrates_to_the_longest_connected_voter_after_grace() {
    let harness = harness();
    let mut sub = harness.bus.subscribe(&harness.room_id);

    let carol = join(&harness, "carol", None).await;
    // Alice joins before Bob, so she is the longest-connected voter
    let alice = join(&harness, "alice", Some(Role::Voter)).await;
    let _bob = join(&harness, "bob", Some(Role::Voter)).await;

    harness
        .rooms
        .disconnected(&harness.room_id, carol.participant_id.clone())
        .await;
    let disconnected = next_event_of(&mut sub, "room.participant_disconnected.v1").await;
    assert_eq!(
        disconnected["payload"]["participantId"],
        carol.participant_id.as_str()
    );

    tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;

    let left = next_event_of(&mut sub, "room.participant_left.v1").await;
    assert_eq!(left["payload"]["reason"], "grace_expired");

    let promoted = next_event_of(&mut sub, "presence.update.v1").await;
    assert_eq!(
        promoted["payload"]["participantId"],
        alice.participant_id.as_str()
    );
    assert_eq!(promoted["payload"]["role"], "host");
}

#[tokio::test]
async fn explicit_leave_migrates_the_host_immediately() {
    let harness = harness();
    let mut sub = harness.bus.subscribe(&harness.room_id);

    let carol = join(&harness, "carol", None).await;
    let alice = join(&harness, "alice", Some(Role::Voter)).await;

    harness
        .rooms
        .leave(&harness.room_id, carol.participant_id.clone(), "left")
        .await;

    let _ = next_event_of(&mut sub, "room.participant_left.v1").await;
    let promoted = next_event_of(&mut sub, "presence.update.v1").await;
    assert_eq!(
        promoted["payload"]["participantId"],
        alice.participant_id.as_str()
    );
}

#[tokio::test]
async fn reconnection_replays_missed_events_in_order() {
    let harness = harness();

    let carol = join(&harness, "carol", None).await;
    let alice = join(&harness, "alice", Some(Role::Voter)).await;
    let bob = join(&harness, "bob", Some(Role::Voter)).await;

    harness
        .rooms
        .start_round(&harness.room_id, carol.participant_id.clone(), None, None, None)
        .await
        .unwrap();

    // Alice's connection drops; she knows everything up to this point
    let snapshot: JsonValue = serde_json::from_str(
        &harness
            .rooms
            .snapshot(&harness.room_id, alice.participant_id.clone(), None)
            .await
            .unwrap(),
    )
    .unwrap();
    let last_seen = snapshot["payload"]["lastEventId"].as_u64().unwrap();
    harness
        .rooms
        .disconnected(&harness.room_id, alice.participant_id.clone())
        .await;

    // Meanwhile Bob votes and Carol reveals
    harness
        .rooms
        .cast_vote(
            &harness.room_id,
            bob.participant_id.clone(),
            "8".to_owned(),
            None,
        )
        .await
        .unwrap();
    harness
        .rooms
        .reveal(&harness.room_id, carol.participant_id.clone(), None)
        .await
        .unwrap();

    let outcome = harness
        .rooms
        .register(
            &harness.room_id,
            principal("alice"),
            "alice".to_owned(),
            None,
            Some(last_seen),
            None,
        )
        .await
        .unwrap();

    // Same participant as before the drop
    assert_eq!(outcome.participant_id, alice.participant_id);

    let replayed: Vec<JsonValue> = outcome
        .replay
        .iter()
        .map(|frame| serde_json::from_str(frame).unwrap())
        .collect();
    let ids: Vec<u64> = replayed
        .iter()
        .map(|event| event["eventId"].as_u64().unwrap())
        .collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
    assert!(ids.iter().all(|id| *id > last_seen));
    assert!(replayed
        .iter()
        .any(|event| event["type"] == "vote.recorded.v1"));
    assert!(replayed
        .iter()
        .any(|event| event["type"] == "round.revealed.v1"));

    let snapshot: JsonValue = serde_json::from_str(&outcome.snapshot).unwrap();
    assert_eq!(
        snapshot["payload"]["lastEventId"].as_u64().unwrap(),
        *ids.last().unwrap()
    );
    assert_eq!(snapshot["payload"].get("fullResync"), None);
}

#[tokio::test(start_paused = true)]
async fn reconnection_after_grace_is_a_fresh_join() {
    let harness = harness();
    let mut sub = harness.bus.subscribe(&harness.room_id);

    let _carol = join(&harness, "carol", None).await;
    let alice = join(&harness, "alice", Some(Role::Voter)).await;

    harness
        .rooms
        .disconnected(&harness.room_id, alice.participant_id.clone())
        .await;
    let _ = next_event_of(&mut sub, "room.participant_disconnected.v1").await;

    tokio::time::advance(Duration::from_secs(5 * 60 + 1)).await;
    let _ = next_event_of(&mut sub, "room.participant_left.v1").await;

    let outcome = harness
        .rooms
        .register(
            &harness.room_id,
            principal("alice"),
            "alice".to_owned(),
            None,
            Some(2),
            None,
        )
        .await
        .unwrap();

    assert_ne!(outcome.participant_id, alice.participant_id);
}

#[tokio::test]
async fn deleted_rooms_accept_nothing() {
    let harness = harness();

    let mut room = harness.db.room(&harness.room_id).unwrap().unwrap();
    room.deleted_at = Some(2);
    harness.db.put_room(&room).unwrap();

    let error = harness
        .rooms
        .register(
            &harness.room_id,
            principal("carol"),
            "carol".to_owned(),
            None,
            None,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(error.wire_code(), ErrorCode::RoomNotFound);
}

#[tokio::test]
async fn free_tier_rooms_cap_out_early() {
    let harness = harness();

    let mut room = harness.db.room(&harness.room_id).unwrap().unwrap();
    room.owner_tier = Tier::Free;
    harness.db.put_room(&room).unwrap();

    for i in 0..8 {
        join(&harness, &format!("user{i}"), Some(Role::Voter)).await;
    }

    let error = harness
        .rooms
        .register(
            &harness.room_id,
            principal("straggler"),
            "straggler".to_owned(),
            Some(Role::Voter),
            None,
            None,
        )
        .await
        .unwrap_err();
    assert_eq!(error.wire_code(), ErrorCode::RoomFull);
}

#[tokio::test]
async fn reset_with_clear_votes_opens_a_fresh_round_with_the_same_story() {
    let harness = harness();
    let mut sub = harness.bus.subscribe(&harness.room_id);

    let carol = join(&harness, "carol", None).await;
    harness
        .rooms
        .start_round(
            &harness.room_id,
            carol.participant_id.clone(),
            Some("CROUP-17".to_owned()),
            None,
            None,
        )
        .await
        .unwrap();
    harness
        .rooms
        .cast_vote(
            &harness.room_id,
            carol.participant_id.clone(),
            "13".to_owned(),
            None,
        )
        .await
        .unwrap();

    harness
        .rooms
        .reset(&harness.room_id, carol.participant_id.clone(), true, None)
        .await
        .unwrap();

    let reset = next_event_of(&mut sub, "round.reset.v1").await;
    let new_round = &reset["payload"]["newRound"];
    assert_eq!(new_round["storyTitle"], "CROUP-17");
    assert_eq!(new_round["roundNumber"], 2);
    assert_eq!(new_round["state"], "open");
    assert_eq!(new_round["voted"].as_array().unwrap().len(), 0);
}
