//! E2E federation scenarios: the full signed pipeline from HTTP request
//! to persisted state and queued delivery.

mod common;

use common::{RemoteInbox, TestServer};
use driftway::data::{Block, EntityId};
use serde_json::json;

#[tokio::test]
async fn signed_follow_creates_accepted_follow_and_delivers_accept() {
    let server = TestServer::new().await;
    let inbox = RemoteInbox::start("/users/bob/inbox").await;
    let (bob, bob_key) = server
        .create_remote_actor("bob", "remote.example", &inbox.url)
        .await;
    let alice = server.local_actor("alice").await;

    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://remote.example/follows/1",
        "type": "Follow",
        "actor": bob.ap_id,
        "object": alice.ap_id
    });

    let response = server
        .signed_post("/users/alice/inbox", &activity, &bob.key_id(), &bob_key)
        .await;
    assert_eq!(response.status(), 202);

    let follow = server
        .state
        .services
        .db
        .get_follow(&bob.ap_id, &alice.ap_id)
        .await
        .unwrap()
        .expect("follow row");
    assert!(follow.accepted);

    // The Accept went out through the live delivery worker.
    assert!(inbox.wait_for(1).await, "Accept was not delivered");

    let stored_alice = server.local_actor("alice").await;
    assert_eq!(stored_alice.followers_count, 1);
}

#[tokio::test]
async fn duplicate_follow_delivery_is_idempotent() {
    let server = TestServer::new().await;
    let inbox = RemoteInbox::start("/users/bob/inbox").await;
    let (bob, bob_key) = server
        .create_remote_actor("bob", "remote.example", &inbox.url)
        .await;
    let alice = server.local_actor("alice").await;

    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://remote.example/follows/dup",
        "type": "Follow",
        "actor": bob.ap_id,
        "object": alice.ap_id
    });

    for _ in 0..2 {
        let response = server
            .signed_post("/users/alice/inbox", &activity, &bob.key_id(), &bob_key)
            .await;
        assert_eq!(response.status(), 202);
    }

    let stored_alice = server.local_actor("alice").await;
    assert_eq!(stored_alice.followers_count, 1, "double-applied follow");
}

#[tokio::test]
async fn duplicate_create_persists_exactly_one_object() {
    let server = TestServer::new().await;
    let inbox = RemoteInbox::start("/users/bob/inbox").await;
    let (bob, bob_key) = server
        .create_remote_actor("bob", "remote.example", &inbox.url)
        .await;

    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://remote.example/activities/create1",
        "type": "Create",
        "actor": bob.ap_id,
        "object": {
            "id": "https://remote.example/notes/1",
            "type": "Note",
            "attributedTo": bob.ap_id,
            "content": "<p>hello fediverse</p>",
            "to": ["https://www.w3.org/ns/activitystreams#Public"]
        }
    });

    for _ in 0..2 {
        let response = server
            .signed_post("/inbox", &activity, &bob.key_id(), &bob_key)
            .await;
        assert_eq!(response.status(), 202);
    }

    let object = server
        .state
        .services
        .db
        .get_object_by_ap_id("https://remote.example/notes/1")
        .await
        .unwrap()
        .expect("object persisted");
    assert_eq!(object.attributed_to, bob.ap_id);

    let stored_bob = server
        .state
        .services
        .db
        .get_actor_by_ap_id(&bob.ap_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored_bob.posts_count, 1, "double-counted Create");
}

#[tokio::test]
async fn blocked_actor_gets_403_and_no_rows() {
    let server = TestServer::new().await;
    let inbox = RemoteInbox::start("/users/bob/inbox").await;
    let (bob, bob_key) = server
        .create_remote_actor("bob", "remote.example", &inbox.url)
        .await;
    let alice = server.local_actor("alice").await;

    server
        .state
        .services
        .db
        .insert_block(&Block {
            id: EntityId::new().0,
            blocker_ap_id: alice.ap_id.clone(),
            target_ap_id: bob.ap_id.clone(),
            created_at: chrono::Utc::now(),
        })
        .await
        .unwrap();

    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://remote.example/follows/blocked",
        "type": "Follow",
        "actor": bob.ap_id,
        "object": alice.ap_id
    });

    let response = server
        .signed_post("/users/alice/inbox", &activity, &bob.key_id(), &bob_key)
        .await;
    assert_eq!(response.status(), 403);

    // No state was mutated.
    assert!(
        server
            .state
            .services
            .db
            .get_follow(&bob.ap_id, &alice.ap_id)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        !server
            .state
            .services
            .db
            .activity_exists("https://remote.example/follows/blocked")
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn blocked_domain_gets_403_before_any_processing() {
    let server = TestServer::new().await;
    let inbox = RemoteInbox::start("/users/carol/inbox").await;
    let (carol, carol_key) = server
        .create_remote_actor("carol", "blocked.example", &inbox.url)
        .await;
    let alice = server.local_actor("alice").await;

    server
        .state
        .services
        .db
        .block_domain("blocked.example")
        .await
        .unwrap();

    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://blocked.example/follows/1",
        "type": "Follow",
        "actor": carol.ap_id,
        "object": alice.ap_id
    });

    let response = server
        .signed_post("/users/alice/inbox", &activity, &carol.key_id(), &carol_key)
        .await;
    assert_eq!(response.status(), 403);
}

#[tokio::test]
async fn follow_then_undo_removes_follow_row() {
    let server = TestServer::new().await;
    let inbox = RemoteInbox::start("/users/bob/inbox").await;
    let (bob, bob_key) = server
        .create_remote_actor("bob", "remote.example", &inbox.url)
        .await;
    let alice = server.local_actor("alice").await;

    let follow = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://remote.example/follows/u1",
        "type": "Follow",
        "actor": bob.ap_id,
        "object": alice.ap_id
    });
    server
        .signed_post("/users/alice/inbox", &follow, &bob.key_id(), &bob_key)
        .await;

    let undo = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://remote.example/activities/undo1",
        "type": "Undo",
        "actor": bob.ap_id,
        "object": {
            "type": "Follow",
            "id": "https://remote.example/follows/u1",
            "actor": bob.ap_id,
            "object": alice.ap_id
        }
    });
    let response = server
        .signed_post("/users/alice/inbox", &undo, &bob.key_id(), &bob_key)
        .await;
    assert_eq!(response.status(), 202);

    assert!(
        server
            .state
            .services
            .db
            .get_follow(&bob.ap_id, &alice.ap_id)
            .await
            .unwrap()
            .is_none()
    );
    let stored_alice = server.local_actor("alice").await;
    assert_eq!(stored_alice.followers_count, 0);
}

#[tokio::test]
async fn like_then_undo_maintains_counter_invariant() {
    let server = TestServer::new().await;
    let inbox = RemoteInbox::start("/users/bob/inbox").await;
    let (bob, bob_key) = server
        .create_remote_actor("bob", "remote.example", &inbox.url)
        .await;
    let alice = server.local_actor("alice").await;

    // Alice publishes a note bob will like.
    let note = server
        .state
        .publisher
        .publish_note(&alice, "<p>likeable</p>", "public", None)
        .await
        .unwrap();

    let like = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://remote.example/likes/1",
        "type": "Like",
        "actor": bob.ap_id,
        "object": note.ap_id
    });
    let response = server
        .signed_post("/users/alice/inbox", &like, &bob.key_id(), &bob_key)
        .await;
    assert_eq!(response.status(), 202);

    let db = &server.state.services.db;
    let stored = db.get_object_by_ap_id(&note.ap_id).await.unwrap().unwrap();
    assert_eq!(stored.favourites_count, 1);
    assert_eq!(db.count_favourites(&note.ap_id).await.unwrap(), 1);

    let undo = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://remote.example/activities/undo-like",
        "type": "Undo",
        "actor": bob.ap_id,
        "object": {
            "type": "Like",
            "id": "https://remote.example/likes/1",
            "object": note.ap_id
        }
    });
    server
        .signed_post("/users/alice/inbox", &undo, &bob.key_id(), &bob_key)
        .await;

    let stored = db.get_object_by_ap_id(&note.ap_id).await.unwrap().unwrap();
    assert_eq!(stored.favourites_count, 0);
    assert_eq!(db.count_favourites(&note.ap_id).await.unwrap(), 0);
}

#[tokio::test]
async fn relay_handshake_and_public_fan_out() {
    let server = TestServer::new().await;
    let relay_inbox = RemoteInbox::start("/inbox").await;
    let alice = server.local_actor("alice").await;

    // Subscribe: idle → pending, Follow delivered to the relay.
    let relay = server
        .state
        .services
        .relays
        .subscribe(&relay_inbox.url, &alice)
        .await
        .unwrap();
    assert_eq!(relay.state, "pending");
    assert!(relay_inbox.wait_for(1).await, "relay Follow not delivered");

    // The relay answers with a signed Accept through the shared inbox.
    let (relay_actor, relay_key) = server
        .create_remote_actor("actor", "relay.example", &relay_inbox.url)
        .await;
    let accept = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://relay.example/activities/accept1",
        "type": "Accept",
        "actor": relay_actor.ap_id,
        "object": relay.follow_activity_ap_id
    });
    let response = server
        .signed_post("/inbox", &accept, &relay_actor.key_id(), &relay_key)
        .await;
    assert_eq!(response.status(), 202);

    let stored = server
        .state
        .services
        .db
        .get_relay_by_inbox(&relay.inbox_url)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, "accepted");

    // A public note fans out to the accepted relay.
    let before = relay_inbox.count();
    server
        .state
        .publisher
        .publish_note(&alice, "<p>to the relay</p>", "public", None)
        .await
        .unwrap();
    assert!(
        relay_inbox.wait_for(before + 1).await,
        "public Create not relayed"
    );
}

#[tokio::test]
async fn shared_inbox_routes_follow_to_resolved_target() {
    let server = TestServer::new().await;
    let inbox = RemoteInbox::start("/users/bob/inbox").await;
    let (bob, bob_key) = server
        .create_remote_actor("bob", "remote.example", &inbox.url)
        .await;
    let mallory = server.local_actor("mallory").await;

    let activity = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://remote.example/follows/shared1",
        "type": "Follow",
        "actor": bob.ap_id,
        "object": mallory.ap_id
    });

    let response = server
        .signed_post("/inbox", &activity, &bob.key_id(), &bob_key)
        .await;
    assert_eq!(response.status(), 202);

    let follow = server
        .state
        .services
        .db
        .get_follow(&bob.ap_id, &mallory.ap_id)
        .await
        .unwrap()
        .expect("follow row");
    assert!(follow.accepted);
}
