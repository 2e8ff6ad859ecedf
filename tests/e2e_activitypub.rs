//! E2E tests for the ActivityPub federation endpoints

mod common;

use common::{TestServer, ADMIN_TOKEN};
use serde_json::{json, Value};

#[tokio::test]
async fn actor_endpoint_serves_activitypub_document() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;

    let response = server
        .client
        .get(server.url("/users/alice"))
        .header("Accept", "application/activity+json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let doc: Value = response.json().await.unwrap();
    assert_eq!(doc["type"], "Person");
    assert_eq!(doc["preferredUsername"], "alice");
    assert!(doc.get("inbox").is_some());
    assert!(doc.get("outbox").is_some());
    assert!(doc["publicKey"]["publicKeyPem"].as_str().is_some());
    // The private key never rides along on unauthenticated reads
    assert!(doc.get("privateKeyPem").is_none());
}

#[tokio::test]
async fn actor_private_key_requires_admin_bearer() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;

    let doc: Value = server
        .client
        .get(server.url("/users/alice"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert!(doc["privateKeyPem"].as_str().is_some());
}

#[tokio::test]
async fn unknown_actor_is_404() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/users/nobody"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn webfinger_resolves_local_actor() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;

    let response = server
        .client
        .get(server.url("/.well-known/webfinger"))
        .query(&[("resource", "acct:alice@test.example.com")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let jrd: Value = response.json().await.unwrap();
    assert_eq!(jrd["subject"], "acct:alice@test.example.com");
    let self_link = jrd["links"]
        .as_array()
        .unwrap()
        .iter()
        .find(|link| link["rel"] == "self")
        .unwrap();
    assert_eq!(self_link["href"], alice.id);

    let response = server
        .client
        .get(server.url("/.well-known/webfinger"))
        .query(&[("resource", "acct:alice@other.example.com")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn unsigned_inbox_post_is_rejected() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;

    let response = server
        .client
        .post(server.url("/users/alice/inbox"))
        .header("Content-Type", "application/activity+json")
        .json(&json!({
            "type": "Follow",
            "actor": "https://remote.example/users/bob",
            "object": "https://test.example.com/users/alice"
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn malformed_body_is_400() {
    let server =
        TestServer::with_config(|config| config.federation.require_http_signatures = false).await;
    server.create_actor("alice").await;

    let response = server
        .client
        .post(server.url("/users/alice/inbox"))
        .header("Content-Type", "application/activity+json")
        .body("this is not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn follow_round_trip_records_and_removes_follower() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;
    let bob = server.create_actor("bob").await;

    // Bob follows Alice, signed by Bob
    let follow = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://test.example.com/activities/follow-1",
        "type": "Follow",
        "actor": bob.id,
        "object": alice.id,
    });
    let response = server.signed_inbox_post(&bob, "alice", &follow).await;
    assert_eq!(response.status(), 202);

    let followers = server.state.db.get_followers("alice").await.unwrap();
    assert_eq!(followers, vec![bob.id.clone()]);

    // Bob undoes the follow
    let undo = json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "id": "https://test.example.com/activities/undo-1",
        "type": "Undo",
        "actor": bob.id,
        "object": {
            "id": "https://test.example.com/activities/follow-1",
            "type": "Follow",
            "object": alice.id,
        },
    });
    let response = server.signed_inbox_post(&bob, "alice", &undo).await;
    assert_eq!(response.status(), 202);

    assert!(server.state.db.get_followers("alice").await.unwrap().is_empty());
}

#[tokio::test]
async fn duplicate_inbox_delivery_is_idempotent() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;
    let bob = server.create_actor("bob").await;

    let follow = json!({
        "id": "https://test.example.com/activities/follow-dup",
        "type": "Follow",
        "actor": bob.id,
        "object": alice.id,
    });

    for _ in 0..2 {
        let response = server.signed_inbox_post(&bob, "alice", &follow).await;
        assert_eq!(response.status(), 202);
    }

    assert_eq!(
        server
            .state
            .db
            .count_stream("alice", broca::data::StreamKind::Inbox)
            .await
            .unwrap(),
        1
    );
    assert_eq!(server.state.db.count_followers("alice").await.unwrap(), 1);
}

#[tokio::test]
async fn digest_mismatch_is_rejected_without_inbox_write() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;
    let bob = server.create_actor("bob").await;

    let signed = serde_json::to_vec(&json!({
        "id": "https://test.example.com/activities/x",
        "type": "Follow",
        "actor": bob.id,
        "object": alice.id,
    }))
    .unwrap();
    // Mutate the body after the digest was computed
    let sent = serde_json::to_vec(&json!({
        "id": "https://test.example.com/activities/x",
        "type": "Follow",
        "actor": bob.id,
        "object": "https://test.example.com/users/sys",
    }))
    .unwrap();

    let response = server
        .signed_inbox_post_raw(&bob, "alice", &signed, &sent)
        .await;
    assert_eq!(response.status(), 401);

    assert_eq!(
        server
            .state
            .db
            .count_stream("alice", broca::data::StreamKind::Inbox)
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn admin_bearer_bypasses_signatures_on_system_inbox_only() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;

    // Valid token on the system inbox: accepted without a signature
    let response = server
        .admin_inbox_post(&json!({
            "type": "Accept",
            "actor": "https://test.example.com/users/sys",
            "object": "https://remote.example/activities/1",
        }))
        .await;
    assert_eq!(response.status(), 202);

    // Invalid token falls through to signature verification
    let response = server
        .client
        .post(server.url("/users/sys/inbox"))
        .bearer_auth("wrong-token")
        .json(&json!({"type": "Accept", "actor": "https://r.example/u/x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    // The token does not bypass signatures on a regular actor's inbox
    let response = server
        .client
        .post(server.url("/users/alice/inbox"))
        .bearer_auth(ADMIN_TOKEN)
        .json(&json!({"type": "Accept", "actor": "https://r.example/u/x"}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn unknown_activity_type_is_accepted_as_noop() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;
    let bob = server.create_actor("bob").await;

    let response = server
        .signed_inbox_post(
            &bob,
            "alice",
            &json!({
                "id": "https://test.example.com/activities/odd",
                "type": "Arrive",
                "actor": bob.id,
                "object": alice.id,
            }),
        )
        .await;

    assert_eq!(response.status(), 202);
}

#[tokio::test]
async fn admin_creates_actor_through_system_inbox() {
    let server = TestServer::new().await;

    let response = server
        .admin_inbox_post(&json!({
            "type": "Create",
            "actor": "https://test.example.com/users/sys",
            "object": {
                "type": "Person",
                "preferredUsername": "carol",
                "name": "Carol",
                "summary": "Created by admin",
                "custom:badge": "gold",
            },
        }))
        .await;
    assert_eq!(response.status(), 202);

    let carol = server
        .state
        .db
        .get_actor_by_username("carol")
        .await
        .unwrap()
        .expect("carol should exist");
    assert!(carol.private_key_pem.is_some());
    assert_eq!(carol.extensions["custom:badge"], "gold");

    // The new actor serves a profile immediately
    let response = server
        .client
        .get(server.url("/users/carol"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
}

#[tokio::test]
async fn admin_delete_refuses_system_actor() {
    let server = TestServer::new().await;

    let response = server
        .admin_inbox_post(&json!({
            "type": "Delete",
            "actor": "https://test.example.com/users/sys",
            "object": "https://test.example.com/users/sys",
        }))
        .await;
    assert_eq!(response.status(), 403);

    assert!(server
        .state
        .db
        .get_actor_by_username("sys")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn authorized_actor_admin_scope_is_limited_to_system_inbox() {
    // Actor ids are deterministic, so the allowlist can be set
    // before the actor exists
    let server = TestServer::with_config(|config| {
        config.admin.authorized_actors = vec!["https://test.example.com/users/bob".to_string()];
    })
    .await;
    let alice = server.create_actor("alice").await;
    let bob = server.create_actor("bob").await;

    // A signed Delete against a regular actor's inbox is accepted as
    // a plain activity, never as an admin operation
    let delete_alice = json!({
        "id": "https://test.example.com/activities/rogue-delete",
        "type": "Delete",
        "actor": bob.id,
        "object": alice.id,
    });
    let response = server.signed_inbox_post(&bob, "alice", &delete_alice).await;
    assert_eq!(response.status(), 202);
    assert!(server
        .state
        .db
        .get_actor_by_username("alice")
        .await
        .unwrap()
        .is_some());

    // Same for Update: no profile mutation outside the system inbox
    let update_alice = json!({
        "id": "https://test.example.com/activities/rogue-update",
        "type": "Update",
        "actor": bob.id,
        "object": {"type": "Person", "id": alice.id, "name": "hijacked"},
    });
    let response = server.signed_inbox_post(&bob, "alice", &update_alice).await;
    assert_eq!(response.status(), 202);
    let reloaded = server
        .state
        .db
        .get_actor_by_username("alice")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(reloaded.display_name.as_deref(), Some("alice display"));

    // On the system inbox the same signed actor is admin-authorized
    let delete_via_system = json!({
        "id": "https://test.example.com/activities/admin-delete",
        "type": "Delete",
        "actor": bob.id,
        "object": alice.id,
    });
    let response = server.signed_inbox_post(&bob, "sys", &delete_via_system).await;
    assert_eq!(response.status(), 202);
    assert!(server
        .state
        .db
        .get_actor_by_username("alice")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn outbox_post_returns_location_and_stream_entry() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;

    let response = server
        .outbox_post(
            "alice",
            &json!({
                "type": "Create",
                "object": {"type": "Note", "content": "hello fediverse"},
            }),
        )
        .await;

    assert_eq!(response.status(), 201);
    let location = response
        .headers()
        .get("location")
        .and_then(|v| v.to_str().ok())
        .expect("Location header")
        .to_string();
    assert!(location.contains("/activities/"));

    // Two-tier outbox read
    let metadata: Value = server
        .client
        .get(server.url("/users/alice/outbox"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metadata["type"], "OrderedCollection");
    assert_eq!(metadata["totalItems"], 1);

    let page: Value = server
        .client
        .get(server.url("/users/alice/outbox?page=0&limit=20"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["type"], "OrderedCollectionPage");
    assert_eq!(page["orderedItems"][0]["id"], location);
}

#[tokio::test]
async fn outbox_post_without_token_is_rejected() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;

    let response = server
        .client
        .post(server.url("/users/alice/outbox"))
        .json(&json!({"type": "Create", "object": {"type": "Note", "content": "x"}}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
}

#[tokio::test]
async fn object_endpoint_unwraps_create_envelope() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;

    let note_id = "https://test.example.com/users/alice/objects/note-1";
    let response = server
        .outbox_post(
            "alice",
            &json!({
                "type": "Create",
                "object": {"id": note_id, "type": "Note", "content": "findable"},
            }),
        )
        .await;
    assert_eq!(response.status(), 201);

    let object: Value = server
        .client
        .get(server.url("/users/alice/objects/note-1"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(object["type"], "Note");
    assert_eq!(object["content"], "findable");

    let replies: Value = server
        .client
        .get(server.url("/users/alice/objects/note-1/replies"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(replies["type"], "OrderedCollection");
    assert_eq!(replies["totalItems"], 0);
}

#[tokio::test]
async fn object_likes_collection_lists_inbound_likes() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;
    let bob = server.create_actor("bob").await;

    let note_id = "https://test.example.com/users/alice/objects/note-2";
    server
        .outbox_post(
            "alice",
            &json!({
                "type": "Create",
                "object": {"id": note_id, "type": "Note", "content": "likeable"},
            }),
        )
        .await;

    let like = json!({
        "id": "https://test.example.com/activities/like-1",
        "type": "Like",
        "actor": bob.id,
        "object": note_id,
    });
    assert_eq!(server.signed_inbox_post(&bob, "alice", &like).await.status(), 202);

    let likes: Value = server
        .client
        .get(server.url("/users/alice/objects/note-2/likes"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(likes["totalItems"], 1);
    assert_eq!(likes["orderedItems"][0]["type"], "Like");
}

#[tokio::test]
async fn followers_collection_paginates() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;
    for i in 0..3 {
        server
            .state
            .db
            .add_follower("alice", &format!("https://r.example/users/f{i}"))
            .await
            .unwrap();
    }

    let metadata: Value = server
        .client
        .get(server.url("/users/alice/followers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(metadata["totalItems"], 3);

    let page: Value = server
        .client
        .get(server.url("/users/alice/followers?page=0&limit=2"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["orderedItems"].as_array().unwrap().len(), 2);
    assert!(page.get("next").is_some());
}

#[tokio::test]
async fn media_blob_is_served_with_content_type() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;

    let blob = broca::data::Blob {
        username: "alice".to_string(),
        id: "blob-1".to_string(),
        content_type: "image/png".to_string(),
        data: vec![0x89, 0x50, 0x4e, 0x47],
        source_url: None,
        created_at: chrono::Utc::now(),
    };
    server.state.db.insert_blob(&blob).await.unwrap();

    let response = server
        .client
        .get(server.url("/users/alice/media/blob-1"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "image/png"
    );
    assert_eq!(response.bytes().await.unwrap().to_vec(), blob.data);
}

#[tokio::test]
async fn admin_queue_stats_require_token() {
    let server = TestServer::new().await;

    let response = server
        .client
        .get(server.url("/admin/queue"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = server
        .client
        .get(server.url("/admin/queue"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let stats: Value = response.json().await.unwrap();
    assert!(stats["queue"].get("pending").is_some());
}
