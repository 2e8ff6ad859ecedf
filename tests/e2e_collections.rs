//! E2E tests for the custom collection engine

mod common;

use common::{TestServer, ADMIN_TOKEN};
use serde_json::{json, Value};

/// Create a collection for an actor through the admin system inbox
async fn admin_create_collection(
    server: &TestServer,
    owner_id: &str,
    definition: Value,
) -> reqwest::Response {
    server
        .admin_inbox_post(&json!({
            "type": "Create",
            "actor": "https://test.example.com/users/sys",
            "object": {
                "type": "Collection",
                "attributedTo": owner_id,
                "broca:collectionDefinition": definition,
            },
        }))
        .await
}

#[tokio::test]
async fn admin_creates_manual_collection() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;

    let response = admin_create_collection(
        &server,
        &alice.id,
        json!({
            "id": "featured",
            "name": "Featured",
            "type": "MANUAL",
            "visibility": "PUBLIC",
            "sortOrder": "MANUAL",
        }),
    )
    .await;
    assert_eq!(response.status(), 202);

    let definition = server
        .state
        .db
        .get_collection("alice", "featured")
        .await
        .unwrap()
        .expect("collection should exist");
    assert_eq!(definition.name, "Featured");
}

#[tokio::test]
async fn invalid_or_reserved_slugs_are_rejected() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;

    for bad_id in ["Not Valid", "-dash", "inbox", "outbox", ""] {
        let response = admin_create_collection(
            &server,
            &alice.id,
            json!({
                "id": bad_id,
                "name": "Bad",
                "type": "MANUAL",
            }),
        )
        .await;
        assert_eq!(response.status(), 422, "slug {bad_id:?} should be rejected");
    }
}

#[tokio::test]
async fn manual_with_filter_and_query_with_items_are_rejected() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;

    let response = admin_create_collection(
        &server,
        &alice.id,
        json!({
            "id": "bad-manual",
            "name": "Bad",
            "type": "MANUAL",
            "queryFilter": {"hasAttachment": true},
        }),
    )
    .await;
    assert_eq!(response.status(), 422);

    let response = admin_create_collection(
        &server,
        &alice.id,
        json!({
            "id": "bad-query",
            "name": "Bad",
            "type": "QUERY",
            "queryFilter": {"hasAttachment": true},
            "items": ["https://test.example.com/users/alice/objects/1"],
        }),
    )
    .await;
    assert_eq!(response.status(), 422);
}

#[tokio::test]
async fn manual_collection_add_and_page_read() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;

    admin_create_collection(
        &server,
        &alice.id,
        json!({
            "id": "featured",
            "name": "Featured",
            "type": "MANUAL",
            "visibility": "PUBLIC",
            "sortOrder": "MANUAL",
        }),
    )
    .await;

    // Publish a note, then Add it to the collection through the outbox
    let note_id = "https://test.example.com/users/alice/objects/note-1";
    let response = server
        .outbox_post(
            "alice",
            &json!({
                "type": "Create",
                "object": {"id": note_id, "type": "Note", "content": "pinned"},
            }),
        )
        .await;
    assert_eq!(response.status(), 201);

    let response = server
        .outbox_post(
            "alice",
            &json!({
                "type": "Add",
                "object": note_id,
                "target": "https://test.example.com/users/alice/collections/featured",
            }),
        )
        .await;
    assert_eq!(response.status(), 201);

    // Two-tier read
    let metadata: Value = server
        .client
        .get(server.url("/users/alice/collections/featured"))
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
        .get(server.url("/users/alice/collections/featured?page=0&limit=20"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(page["type"], "OrderedCollectionPage");
    let items = page["orderedItems"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    // The Create envelope is unwrapped to the note itself
    assert_eq!(items[0]["id"], note_id);
    assert_eq!(items[0]["content"], "pinned");
}

#[tokio::test]
async fn add_with_embedded_object_mints_and_persists_it() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;

    admin_create_collection(
        &server,
        &alice.id,
        json!({
            "id": "drafts",
            "name": "Drafts",
            "type": "MANUAL",
        }),
    )
    .await;

    let response = server
        .outbox_post(
            "alice",
            &json!({
                "type": "Add",
                "object": {"type": "Note", "content": "minted on the way in"},
                "target": "https://test.example.com/users/alice/collections/drafts",
            }),
        )
        .await;
    assert_eq!(response.status(), 201);

    let members = server
        .state
        .db
        .get_collection_items("alice", "drafts")
        .await
        .unwrap();
    assert_eq!(members.len(), 1);
    let minted_id = &members[0].item_id;
    assert!(minted_id.contains("/users/alice/objects/"));

    // The minted object resolves against the outbox
    let record = server
        .state
        .db
        .find_outbox_activity_for_object("alice", minted_id)
        .await
        .unwrap();
    assert!(record.is_some());
}

#[tokio::test]
async fn remove_deletes_member() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;

    admin_create_collection(
        &server,
        &alice.id,
        json!({"id": "featured", "name": "Featured", "type": "MANUAL"}),
    )
    .await;

    let note_id = "https://test.example.com/users/alice/objects/note-9";
    let target = "https://test.example.com/users/alice/collections/featured";
    server
        .outbox_post("alice", &json!({"type": "Add", "object": note_id, "target": target}))
        .await;
    assert_eq!(
        server
            .state
            .db
            .count_collection_items("alice", "featured")
            .await
            .unwrap(),
        1
    );

    let response = server
        .outbox_post(
            "alice",
            &json!({"type": "Remove", "object": note_id, "target": target}),
        )
        .await;
    assert_eq!(response.status(), 201);
    assert_eq!(
        server
            .state
            .db
            .count_collection_items("alice", "featured")
            .await
            .unwrap(),
        0
    );
}

#[tokio::test]
async fn query_collections_reject_add() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;

    admin_create_collection(
        &server,
        &alice.id,
        json!({
            "id": "photos",
            "name": "Photos",
            "type": "QUERY",
            "queryFilter": {"hasAttachment": true},
        }),
    )
    .await;

    let response = server
        .outbox_post(
            "alice",
            &json!({
                "type": "Add",
                "object": "https://test.example.com/users/alice/objects/note-1",
                "target": "https://test.example.com/users/alice/collections/photos",
            }),
        )
        .await;
    assert_eq!(response.status(), 422);
}

#[tokio::test]
async fn query_collection_filters_outbox() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;

    admin_create_collection(
        &server,
        &alice.id,
        json!({
            "id": "photos",
            "name": "Photos",
            "type": "QUERY",
            "visibility": "PUBLIC",
            "sortOrder": "REVERSE_CHRONO",
            "queryFilter": {
                "hasAttachment": true,
                "objectTypes": ["Image", "Note"],
            },
        }),
    )
    .await;

    // One Image with an attachment, one Note without
    server
        .outbox_post(
            "alice",
            &json!({
                "type": "Create",
                "object": {
                    "id": "https://test.example.com/users/alice/objects/img-1",
                    "type": "Image",
                    "name": "a photo",
                    "published": "2026-01-02T00:00:00Z",
                    "attachment": [{"type": "Link", "href": "https://m.example/1.png"}],
                },
            }),
        )
        .await;
    server
        .outbox_post(
            "alice",
            &json!({
                "type": "Create",
                "object": {
                    "id": "https://test.example.com/users/alice/objects/note-1",
                    "type": "Note",
                    "content": "plain text",
                    "published": "2026-01-03T00:00:00Z",
                },
            }),
        )
        .await;

    let page: Value = server
        .client
        .get(server.url("/users/alice/collections/photos?page=0&limit=20"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    let items = page["orderedItems"].as_array().unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0]["type"], "Image");
    assert_eq!(
        items[0]["id"],
        "https://test.example.com/users/alice/objects/img-1"
    );
}

#[tokio::test]
async fn visibility_rules_are_enforced() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;

    for (id, visibility) in [
        ("open", "PUBLIC"),
        ("hidden", "UNLISTED"),
        ("secret", "PRIVATE"),
    ] {
        admin_create_collection(
            &server,
            &alice.id,
            json!({
                "id": id,
                "name": id,
                "type": "MANUAL",
                "visibility": visibility,
            }),
        )
        .await;
    }

    // PUBLIC collections are advertised in the actor profile,
    // UNLISTED and PRIVATE are not
    let actor_doc: Value = server
        .client
        .get(server.url("/users/alice"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let advertised = actor_doc["broca:collections"].as_object().unwrap();
    assert!(advertised.contains_key("open"));
    assert!(!advertised.contains_key("hidden"));
    assert!(!advertised.contains_key("secret"));

    // UNLISTED is served when the URL is known
    let response = server
        .client
        .get(server.url("/users/alice/collections/hidden"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // PRIVATE requires the admin bearer token
    let response = server
        .client
        .get(server.url("/users/alice/collections/secret"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);

    let response = server
        .client
        .get(server.url("/users/alice/collections/secret"))
        .bearer_auth(ADMIN_TOKEN)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    // The catalog lists only PUBLIC without the token
    let catalog: Value = server
        .client
        .get(server.url("/users/alice/collections"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(catalog["totalItems"], 1);
}

#[tokio::test]
async fn admin_updates_collection_definition() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;

    admin_create_collection(
        &server,
        &alice.id,
        json!({"id": "featured", "name": "Featured", "type": "MANUAL", "visibility": "PRIVATE"}),
    )
    .await;

    let response = server
        .admin_inbox_post(&json!({
            "type": "Update",
            "actor": "https://test.example.com/users/sys",
            "object": {
                "type": "Collection",
                "attributedTo": alice.id,
                "broca:collectionDefinition": {
                    "id": "featured",
                    "name": "Featured posts",
                    "type": "MANUAL",
                    "visibility": "PUBLIC",
                },
            },
        }))
        .await;
    assert_eq!(response.status(), 202);

    let definition = server
        .state
        .db
        .get_collection("alice", "featured")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(definition.name, "Featured posts");
    assert_eq!(
        definition.visibility,
        broca::data::CollectionVisibility::Public
    );

    // The collection's type is fixed after creation
    let response = server
        .admin_inbox_post(&json!({
            "type": "Update",
            "actor": "https://test.example.com/users/sys",
            "object": {
                "type": "Collection",
                "attributedTo": alice.id,
                "broca:collectionDefinition": {
                    "id": "featured",
                    "name": "Featured posts",
                    "type": "QUERY",
                    "queryFilter": {"hasAttachment": true},
                },
            },
        }))
        .await;
    assert_eq!(response.status(), 422);
}

#[tokio::test]
async fn admin_deletes_collection_by_url() {
    let server = TestServer::new().await;
    let alice = server.create_actor("alice").await;

    admin_create_collection(
        &server,
        &alice.id,
        json!({"id": "featured", "name": "Featured", "type": "MANUAL"}),
    )
    .await;

    let response = server
        .admin_inbox_post(&json!({
            "type": "Delete",
            "actor": "https://test.example.com/users/sys",
            "object": "https://test.example.com/users/alice/collections/featured",
        }))
        .await;
    assert_eq!(response.status(), 202);

    assert!(server
        .state
        .db
        .get_collection("alice", "featured")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn unknown_collection_is_404() {
    let server = TestServer::new().await;
    server.create_actor("alice").await;

    let response = server
        .client
        .get(server.url("/users/alice/collections/nope"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);
}
