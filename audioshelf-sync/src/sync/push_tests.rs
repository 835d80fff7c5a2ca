use super::*;
use crate::sync::conflict::ConflictDetector;
use crate::token_provider::Credentials;
use audioshelf_core::AuthClient;
use serde_json::json;
use sqlx::sqlite::SqlitePoolOptions;
use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

async fn make_store() -> Arc<LibraryStore> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = LibraryStore::from_pool(pool);
    store.init().await.unwrap();
    Arc::new(store)
}

fn book(title: &str, updated_at: &str) -> Value {
    json!({ "id": "b1", "title": title, "updatedAt": updated_at })
}

async fn seed_book(store: &LibraryStore) {
    let record = incoming_from_value(EntityFamily::Books, book("Dune", "2024-01-01T00:00:00Z")).unwrap();
    store
        .apply_page(EntityFamily::Books, &[record], &[], &ConflictDetector::default())
        .await
        .unwrap();
}

fn orchestrator(server: &MockServer, store: Arc<LibraryStore>) -> PushSyncOrchestrator {
    let client = Arc::new(AudioshelfClient::new(&server.uri(), "old-token").unwrap());
    PushSyncOrchestrator::new(client, store, EventBus::new(16))
}

#[tokio::test]
async fn pushed_update_becomes_clean_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/books/b1"))
        .and(body_string_contains("Edited"))
        .respond_with(ResponseTemplate::new(200).set_body_json(book("Edited", "2100-01-01T00:00:00Z")))
        .expect(1)
        .mount(&server)
        .await;
    let store = make_store().await;
    seed_book(&store).await;
    store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Edited" }))
        .await
        .unwrap();
    let push = orchestrator(&server, store.clone());
    let mut events = push.events.subscribe();

    let report = push.drain().await.unwrap();

    assert_eq!(report, PushReport { pushed: 1, failed: 0, skipped: 0 });
    let row = store.get_entity(EntityFamily::Books, "b1").await.unwrap().unwrap();
    assert_eq!(row.name, "Edited");
    assert!(!row.dirty);
    assert_eq!(store.pending_count().await.unwrap(), 0);
    assert_eq!(
        events.recv().await.unwrap(),
        LibraryEvent::EntitiesChanged { family: EntityFamily::Books }
    );
}

#[tokio::test]
async fn created_entity_is_posted_without_local_id_and_rekeyed() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/collections"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "id": "k1",
            "name": "Road trip",
            "bookIds": ["b1"],
            "updatedAt": "2024-03-01T00:00:00Z"
        })))
        .expect(1)
        .mount(&server)
        .await;
    let store = make_store().await;
    let local_id = store
        .create_entity(EntityFamily::Collections, json!({ "name": "Road trip", "bookIds": ["b1"] }))
        .await
        .unwrap();

    orchestrator(&server, store.clone()).drain().await.unwrap();

    let requests = server.received_requests().await.unwrap();
    let sent: Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert!(sent.get("id").is_none());
    assert_eq!(sent["name"], "Road trip");
    assert!(store.get_entity(EntityFamily::Collections, &local_id).await.unwrap().is_none());
    assert_eq!(
        store.member_book_ids(EntityFamily::Collections, "k1").await.unwrap(),
        vec!["b1"]
    );
}

#[tokio::test]
async fn failure_holds_back_later_operations_for_the_entity() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/books/b1"))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/books/b1/tags"))
        .respond_with(ResponseTemplate::new(200).set_body_json(book("Dune", "2100-01-01T00:00:00Z")))
        .expect(0)
        .mount(&server)
        .await;
    let store = make_store().await;
    seed_book(&store).await;
    let op_id = store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Edited" }))
        .await
        .unwrap();
    store
        .set_relations(EntityFamily::Books, "b1", "tags", json!([{ "id": "t1", "name": "classic" }]))
        .await
        .unwrap();
    let push = orchestrator(&server, store.clone());
    let mut events = push.events.subscribe();

    let report = push.drain().await.unwrap();

    assert_eq!(report, PushReport { pushed: 0, failed: 1, skipped: 1 });
    let failed = store.failed_operations().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].id, op_id);
    assert!(failed[0].retryable);
    assert_eq!(failed[0].retry_count, 1);
    assert_eq!(
        events.recv().await.unwrap(),
        LibraryEvent::PushOperationFailed { op_id, entity_id: "b1".into() }
    );
}

#[tokio::test]
async fn permanent_failure_is_not_retried_automatically() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/books/b1"))
        .respond_with(ResponseTemplate::new(422).set_body_string("title too long"))
        .expect(1)
        .mount(&server)
        .await;
    let store = make_store().await;
    seed_book(&store).await;
    store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Edited" }))
        .await
        .unwrap();
    let push = orchestrator(&server, store.clone());

    push.drain().await.unwrap();
    let second = push.drain().await.unwrap();

    assert_eq!(second, PushReport { pushed: 0, failed: 0, skipped: 1 });
    let failed = push.failed_operations().await.unwrap();
    assert!(!failed[0].retryable);
    assert!(failed[0].last_error.as_deref().unwrap().contains("422"));
}

#[tokio::test]
async fn transient_failure_retries_up_to_the_limit() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/books/b1"))
        .respond_with(ResponseTemplate::new(503))
        .expect(2)
        .mount(&server)
        .await;
    let store = make_store().await;
    seed_book(&store).await;
    store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Edited" }))
        .await
        .unwrap();
    let push = orchestrator(&server, store.clone()).with_max_auto_retries(2);

    for _ in 0..3 {
        push.drain().await.unwrap();
    }

    assert_eq!(push.failed_operations().await.unwrap()[0].retry_count, 2);
}

#[tokio::test]
async fn manual_retry_resets_budget() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/books/b1"))
        .respond_with(ResponseTemplate::new(422))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/books/b1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(book("Edited", "2100-01-01T00:00:00Z")))
        .with_priority(2)
        .mount(&server)
        .await;
    let store = make_store().await;
    seed_book(&store).await;
    let op_id = store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Edited" }))
        .await
        .unwrap();
    let push = orchestrator(&server, store.clone());
    push.drain().await.unwrap();

    let report = push.retry(op_id).await.unwrap();

    assert_eq!(report.pushed, 1);
    assert_eq!(push.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn rejected_token_is_refreshed_once_and_retried() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/books/b1"))
        .and(header("authorization", "Bearer old-token"))
        .respond_with(ResponseTemplate::new(401))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PATCH"))
        .and(path("/books/b1"))
        .and(header("authorization", "Bearer new-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(book("Edited", "2100-01-01T00:00:00Z")))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/auth/refresh"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "accessToken": "new-token" })))
        .expect(1)
        .mount(&server)
        .await;
    let store = make_store().await;
    seed_book(&store).await;
    store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Edited" }))
        .await
        .unwrap();
    let client = Arc::new(AudioshelfClient::new(&server.uri(), "old-token").unwrap());
    let tokens = Arc::new(TokenProvider::new(
        client.clone(),
        Credentials::new("old-token", Some("refresh-1".into())),
        Some(AuthClient::new(&server.uri()).unwrap()),
    ));
    let push = PushSyncOrchestrator::new(client, store.clone(), EventBus::new(4))
        .with_token_provider(tokens);

    let report = push.drain().await.unwrap();

    assert_eq!(report.pushed, 1);
}

#[tokio::test]
async fn pushed_progress_is_marked_clean() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/books/b1/progress"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "bookId": "b1",
            "positionMs": 5000,
            "finished": false,
            "updatedAt": "2100-01-01T00:00:00Z"
        })))
        .expect(1)
        .mount(&server)
        .await;
    let store = make_store().await;
    store.record_progress("b1", 5_000, false).await.unwrap();
    let push = orchestrator(&server, store.clone());
    let mut events = push.events.subscribe();

    push.drain().await.unwrap();

    let progress = store.get_progress("b1").await.unwrap().unwrap();
    assert!(!progress.dirty);
    assert_eq!(progress.position_ms, 5_000);
    assert_eq!(
        events.recv().await.unwrap(),
        LibraryEvent::ProgressSaved { book_id: "b1".into() }
    );
}

#[tokio::test]
async fn confirmed_delete_removes_row() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/books/b1"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;
    let store = make_store().await;
    seed_book(&store).await;
    store.delete_entity(EntityFamily::Books, "b1").await.unwrap();

    let report = orchestrator(&server, store.clone()).drain().await.unwrap();

    assert_eq!(report.pushed, 1);
    assert!(store.get_entity(EntityFamily::Books, "b1").await.unwrap().is_none());
}

#[tokio::test]
async fn dismissed_delete_restores_row() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/books/b1"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;
    let store = make_store().await;
    seed_book(&store).await;
    let op_id = store.delete_entity(EntityFamily::Books, "b1").await.unwrap().unwrap();
    let push = orchestrator(&server, store.clone());
    push.drain().await.unwrap();

    push.dismiss(op_id).await.unwrap();

    assert_eq!(push.pending_count().await.unwrap(), 0);
    let row = store.get_entity(EntityFamily::Books, "b1").await.unwrap().unwrap();
    assert!(!row.pending_delete);
    assert!(!row.dirty);
}

#[tokio::test]
async fn interrupted_operations_are_recovered() {
    let server = MockServer::start().await;
    let store = make_store().await;
    store.record_progress("b1", 1_000, false).await.unwrap();
    let op = store.operations_for_drain().await.unwrap().remove(0);
    store.claim_operation(op.id).await.unwrap();

    let push = orchestrator(&server, store.clone());
    assert_eq!(push.recover().await.unwrap(), 1);
    assert_eq!(
        store.get_operation(op.id).await.unwrap().unwrap().status,
        OpStatus::Queued
    );
}
