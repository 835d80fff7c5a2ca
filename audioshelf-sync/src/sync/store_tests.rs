use super::*;
use audioshelf_core::Book;
use sqlx::sqlite::SqlitePoolOptions;

async fn make_store() -> LibraryStore {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let store = LibraryStore::from_pool(pool);
    store.init().await.unwrap();
    store
}

fn book(id: &str, title: &str, updated_at: &str) -> Value {
    json!({
        "id": id,
        "title": title,
        "updatedAt": updated_at,
        "contributors": [{ "contributorId": "c1", "role": "author" }],
        "tags": [{ "id": "t1", "name": "classic" }]
    })
}

fn record(family: EntityFamily, value: Value) -> IncomingRecord {
    incoming_from_value(family, value).unwrap()
}

async fn apply(store: &LibraryStore, family: EntityFamily, values: Vec<Value>, deleted: &[&str]) -> PageOutcome {
    let records: Vec<_> = values.into_iter().map(|v| record(family, v)).collect();
    let deleted: Vec<String> = deleted.iter().map(|id| id.to_string()).collect();
    store
        .apply_page(family, &records, &deleted, &ConflictDetector::default())
        .await
        .unwrap()
}

const FUTURE: &str = "2100-01-01T00:00:00Z";

#[tokio::test]
async fn reapplying_a_page_is_idempotent() {
    let store = make_store().await;
    let page = vec![book("b1", "Dune", "2024-01-01T00:00:00Z")];

    apply(&store, EntityFamily::Books, page.clone(), &[]).await;
    apply(&store, EntityFamily::Books, page, &[]).await;

    assert_eq!(store.count(EntityFamily::Books).await.unwrap(), 1);
    assert_eq!(store.book_contributors("b1").await.unwrap().len(), 1);
    assert_eq!(store.book_dimension_ids(EntityFamily::Tags, "b1").await.unwrap(), vec!["t1"]);
    let loaded: Book = store.load("b1").await.unwrap().unwrap();
    assert_eq!(loaded.title, "Dune");
}

#[tokio::test]
async fn junction_rows_follow_the_latest_snapshot() {
    let store = make_store().await;
    let mut first = book("b1", "Dune", "2024-01-01T00:00:00Z");
    first["contributors"] = json!([
        { "contributorId": "c1", "role": "author" },
        { "contributorId": "c2", "role": "narrator" }
    ]);
    apply(&store, EntityFamily::Books, vec![first], &[]).await;

    let mut second = book("b1", "Dune", "2024-01-02T00:00:00Z");
    second["contributors"] = json!([{ "contributorId": "c2", "role": "narrator" }]);
    apply(&store, EntityFamily::Books, vec![second], &[]).await;

    let contributors = store.book_contributors("b1").await.unwrap();
    assert_eq!(contributors.len(), 1);
    assert_eq!(contributors[0].contributor_id, "c2");
}

#[tokio::test]
async fn embedded_tag_never_overwrites_pulled_tag() {
    let store = make_store().await;
    apply(
        &store,
        EntityFamily::Tags,
        vec![json!({ "id": "t1", "name": "Classic", "updatedAt": "2024-01-01T00:00:00Z" })],
        &[],
    )
    .await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;

    let tag = store.get_entity(EntityFamily::Tags, "t1").await.unwrap().unwrap();
    assert_eq!(tag.name, "Classic");
    assert!(tag.updated_at > 0);
}

#[tokio::test]
async fn unknown_embedded_tag_gets_a_placeholder() {
    let store = make_store().await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;

    let tag = store.get_entity(EntityFamily::Tags, "t1").await.unwrap().unwrap();
    assert_eq!(tag.name, "classic");
    assert_eq!(tag.updated_at, 0);
}

#[tokio::test]
async fn tombstone_wins_over_local_edit() {
    let store = make_store().await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;
    store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Local" }))
        .await
        .unwrap();

    let outcome = apply(&store, EntityFamily::Books, Vec::new(), &["b1"]).await;

    assert_eq!(outcome.deleted, 1);
    assert!(store.get_entity(EntityFamily::Books, "b1").await.unwrap().is_none());
    assert!(store.book_contributors("b1").await.unwrap().is_empty());
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn tombstone_clears_conflicted_row() {
    let store = make_store().await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;
    store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Local" }))
        .await
        .unwrap();
    let flagged = apply(&store, EntityFamily::Books, vec![book("b1", "Server", FUTURE)], &[]).await;
    assert_eq!(flagged.conflicts, 1);
    assert_eq!(store.list_conflicts(EntityFamily::Books).await.unwrap().len(), 1);

    let outcome = apply(&store, EntityFamily::Books, Vec::new(), &["b1"]).await;

    assert_eq!(outcome.deleted, 1);
    assert!(store.get_entity(EntityFamily::Books, "b1").await.unwrap().is_none());
    assert!(store.book_contributors("b1").await.unwrap().is_empty());
    assert!(store.list_conflicts(EntityFamily::Books).await.unwrap().is_empty());
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn deleted_contributor_leaves_no_dangling_book_link() {
    let store = make_store().await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;

    apply(&store, EntityFamily::Contributors, Vec::new(), &["c1"]).await;

    assert!(store.book_contributors("b1").await.unwrap().is_empty());
    assert!(store.get_entity(EntityFamily::Books, "b1").await.unwrap().is_some());
}

#[tokio::test]
async fn newer_local_edit_survives_older_server_version() {
    let store = make_store().await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;
    store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Local" }))
        .await
        .unwrap();

    let outcome = apply(&store, EntityFamily::Books, vec![book("b1", "Server", "2024-01-02T00:00:00Z")], &[]).await;

    assert_eq!(outcome.preserved, 1);
    let row = store.get_entity(EntityFamily::Books, "b1").await.unwrap().unwrap();
    assert_eq!(row.name, "Local");
    assert!(row.dirty);
    assert!(!row.is_conflicted());
}

#[tokio::test]
async fn newer_server_version_flags_conflict_once() {
    let store = make_store().await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;
    store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Local" }))
        .await
        .unwrap();

    let outcome = apply(&store, EntityFamily::Books, vec![book("b1", "Server", FUTURE)], &[]).await;
    assert_eq!(outcome.conflicts, 1);

    let row = store.get_entity(EntityFamily::Books, "b1").await.unwrap().unwrap();
    assert_eq!(row.name, "Local");
    assert_eq!(row.conflict_server_at, Some(parse_ms(FUTURE)));
    assert_eq!(row.conflict_data.as_ref().unwrap()["title"], "Server");
    assert_eq!(store.list_conflicts(EntityFamily::Books).await.unwrap().len(), 1);

    let again = apply(&store, EntityFamily::Books, vec![book("b1", "Server", FUTURE)], &[]).await;
    assert_eq!(again.skipped, 1);
}

#[tokio::test]
async fn accepting_server_version_discards_local_edit() {
    let store = make_store().await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;
    store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Local" }))
        .await
        .unwrap();
    apply(&store, EntityFamily::Books, vec![book("b1", "Server", FUTURE)], &[]).await;

    store.accept_server_version(EntityFamily::Books, "b1").await.unwrap();

    let row = store.get_entity(EntityFamily::Books, "b1").await.unwrap().unwrap();
    assert_eq!(row.name, "Server");
    assert!(!row.dirty);
    assert!(!row.is_conflicted());
    assert_eq!(row.updated_at, parse_ms(FUTURE));
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn keeping_local_version_holds_edit_against_same_server_version() {
    let store = make_store().await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;
    store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Local" }))
        .await
        .unwrap();
    apply(&store, EntityFamily::Books, vec![book("b1", "Server", FUTURE)], &[]).await;

    store.keep_local_version(EntityFamily::Books, "b1").await.unwrap();
    let outcome = apply(&store, EntityFamily::Books, vec![book("b1", "Server", FUTURE)], &[]).await;

    assert_eq!(outcome.preserved, 1);
    let row = store.get_entity(EntityFamily::Books, "b1").await.unwrap().unwrap();
    assert_eq!(row.name, "Local");
    assert!(!row.is_conflicted());
    assert_eq!(store.pending_count().await.unwrap(), 1);
}

#[tokio::test]
async fn confirmed_push_clears_conflict() {
    let store = make_store().await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;
    let op_id = store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Local" }))
        .await
        .unwrap();
    apply(&store, EntityFamily::Books, vec![book("b1", "Server", FUTURE)], &[]).await;

    let op = store.claim_operation(op_id).await.unwrap().unwrap();
    let echo = record(EntityFamily::Books, book("b1", "Local", "2100-01-02T00:00:00Z"));
    store
        .complete_operation(&op, OpCompletion::Applied(echo))
        .await
        .unwrap();

    let row = store.get_entity(EntityFamily::Books, "b1").await.unwrap().unwrap();
    assert_eq!(row.name, "Local");
    assert!(!row.dirty);
    assert!(!row.is_conflicted());
    assert_eq!(row.updated_at, parse_ms("2100-01-02T00:00:00Z"));
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn successive_edits_coalesce_into_one_operation() {
    let store = make_store().await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;

    let first = store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "One" }))
        .await
        .unwrap();
    let second = store
        .update_fields(EntityFamily::Books, "b1", &json!({ "subtitle": "Two" }))
        .await
        .unwrap();

    assert_eq!(first, second);
    let ops = store.pending_operations().await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, OpKind::Update);
    assert_eq!(ops[0].payload, json!({ "title": "One", "subtitle": "Two" }));
}

#[tokio::test]
async fn created_entity_is_rekeyed_on_confirmation() {
    let store = make_store().await;
    let local_id = store
        .create_entity(
            EntityFamily::Collections,
            json!({ "name": "Road trip", "bookIds": ["b2", "b1"] }),
        )
        .await
        .unwrap();
    assert!(local_id.starts_with("local-"));
    assert_eq!(
        store.member_book_ids(EntityFamily::Collections, &local_id).await.unwrap(),
        vec!["b2", "b1"]
    );

    let op = store.operations_for_drain().await.unwrap().remove(0);
    assert_eq!(op.kind, OpKind::Create);
    let echo = record(
        EntityFamily::Collections,
        json!({ "id": "k1", "name": "Road trip", "bookIds": ["b2", "b1"], "updatedAt": "2024-03-01T00:00:00Z" }),
    );
    store
        .complete_operation(&op, OpCompletion::Applied(echo))
        .await
        .unwrap();

    assert!(store.get_entity(EntityFamily::Collections, &local_id).await.unwrap().is_none());
    let row = store.get_entity(EntityFamily::Collections, "k1").await.unwrap().unwrap();
    assert!(!row.dirty);
    assert_eq!(
        store.member_book_ids(EntityFamily::Collections, "k1").await.unwrap(),
        vec!["b2", "b1"]
    );
}

#[tokio::test]
async fn deleting_unpushed_create_leaves_nothing_behind() {
    let store = make_store().await;
    let id = store
        .create_entity(EntityFamily::Tags, json!({ "name": "draft" }))
        .await
        .unwrap();

    let op = store.delete_entity(EntityFamily::Tags, &id).await.unwrap();

    assert!(op.is_none());
    assert!(store.get_entity(EntityFamily::Tags, &id).await.unwrap().is_none());
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn local_delete_hides_row_until_confirmed() {
    let store = make_store().await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;
    store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Edited" }))
        .await
        .unwrap();

    let op_id = store.delete_entity(EntityFamily::Books, "b1").await.unwrap().unwrap();

    assert!(store.load::<Book>("b1").await.unwrap().is_none());
    assert!(store.list::<Book>().await.unwrap().is_empty());
    let ops = store.pending_operations().await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, OpKind::Delete);

    let op = store.claim_operation(op_id).await.unwrap().unwrap();
    store.complete_operation(&op, OpCompletion::Deleted).await.unwrap();
    assert!(store.get_entity(EntityFamily::Books, "b1").await.unwrap().is_none());
}

#[tokio::test]
async fn relation_edit_replaces_queued_relation_payload() {
    let store = make_store().await;
    apply(
        &store,
        EntityFamily::Lenses,
        vec![json!({ "id": "l1", "name": "Sci-fi", "bookIds": ["b1"], "updatedAt": "2024-01-01T00:00:00Z" })],
        &[],
    )
    .await;

    store
        .set_relations(EntityFamily::Lenses, "l1", "books", json!(["b1", "b2"]))
        .await
        .unwrap();
    store
        .set_relations(EntityFamily::Lenses, "l1", "books", json!(["b3"]))
        .await
        .unwrap();

    let ops = store.pending_operations().await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].relation.as_deref(), Some("books"));
    assert_eq!(ops[0].payload, json!(["b3"]));
    assert_eq!(store.member_book_ids(EntityFamily::Lenses, "l1").await.unwrap(), vec!["b3"]);
}

#[tokio::test]
async fn unknown_relation_is_rejected() {
    let store = make_store().await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;

    let err = store
        .set_relations(EntityFamily::Books, "b1", "narrators", json!([]))
        .await
        .unwrap_err();

    assert!(matches!(err, StoreError::Record(RecordError::UnknownRelation { .. })));
}

#[tokio::test]
async fn cursor_lifecycle() {
    let store = make_store().await;
    assert_eq!(store.get_cursor(EntityFamily::Books).await.unwrap(), CursorState::default());

    store
        .save_cursor(EntityFamily::Books, Some("page-2"), Some(5_000), 7_000)
        .await
        .unwrap();
    let state = store.get_cursor(EntityFamily::Books).await.unwrap();
    assert_eq!(state.cursor.as_deref(), Some("page-2"));
    assert_eq!(state.run_updated_after, Some(5_000));
    assert_eq!(state.run_started_at, Some(7_000));

    store.finish_cursor(EntityFamily::Books, 9_000).await.unwrap();
    let state = store.get_cursor(EntityFamily::Books).await.unwrap();
    assert_eq!(state.cursor, None);
    assert_eq!(state.run_started_at, None);
    assert_eq!(state.last_synced_at, Some(9_000));

    store.reset_cursors().await.unwrap();
    assert_eq!(store.get_cursor(EntityFamily::Books).await.unwrap(), CursorState::default());
}

#[tokio::test]
async fn last_successful_sync_round_trips() {
    let store = make_store().await;
    assert_eq!(store.last_successful_sync().await.unwrap(), None);
    store.set_last_successful_sync(1_234).await.unwrap();
    store.set_last_successful_sync(5_678).await.unwrap();
    assert_eq!(store.last_successful_sync().await.unwrap(), Some(5_678));
}

#[tokio::test]
async fn search_matches_prefixes_after_rebuild() {
    let store = make_store().await;
    apply(
        &store,
        EntityFamily::Contributors,
        vec![json!({ "id": "c1", "name": "Frank Herbert", "updatedAt": "2024-01-01T00:00:00Z" })],
        &[],
    )
    .await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;

    let indexed = store.rebuild_search_index().await.unwrap();
    assert_eq!(indexed, 3);

    let hits = store.search("dun", 10).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].family, EntityFamily::Books);
    assert_eq!(hits[0].entity_id, "b1");

    let by_author = store.search("herb", 10).await.unwrap();
    assert_eq!(by_author.len(), 2);

    assert!(store.search("   ", 10).await.unwrap().is_empty());
    assert!(store.search("\"dune", 10).await.is_ok());
}

#[tokio::test]
async fn cover_queue_tracks_image_reference() {
    let store = make_store().await;
    let mut first = book("b1", "Dune", "2024-01-01T00:00:00Z");
    first["coverUrl"] = json!("/covers/b1.jpg");
    let outcome = apply(&store, EntityFamily::Books, vec![first], &[]).await;
    assert_eq!(outcome.covers_enqueued, 1);

    let queued = store.covers_to_download(10, 3).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].state, CoverState::Pending);

    let palette = Palette {
        dominant: Rgb::new(10, 20, 30),
        dark_muted: Rgb::new(1, 2, 3),
        vibrant: Rgb::new(200, 40, 40),
    };
    let path = PathBuf::from("/tmp/covers/b1.img");
    store
        .complete_cover(EntityFamily::Books, "b1", "/covers/b1.jpg", &path, Some(palette))
        .await
        .unwrap();
    assert_eq!(store.cover_palette(EntityFamily::Books, "b1").await.unwrap(), Some(palette));
    assert!(store.covers_to_download(10, 3).await.unwrap().is_empty());

    let mut second = book("b1", "Dune", "2024-01-02T00:00:00Z");
    second["coverUrl"] = json!("/covers/b1-v2.jpg");
    apply(&store, EntityFamily::Books, vec![second], &[]).await;
    let cover = store.get_cover(EntityFamily::Books, "b1").await.unwrap().unwrap();
    assert_eq!(cover.state, CoverState::Stale);
    assert_eq!(cover.image_ref, "/covers/b1-v2.jpg");

    let outcome = apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-03T00:00:00Z")], &[]).await;
    assert_eq!(outcome.orphaned_covers, vec![path]);
    assert!(store.get_cover(EntityFamily::Books, "b1").await.unwrap().is_none());
}

#[tokio::test]
async fn failed_cover_is_retried_within_budget() {
    let store = make_store().await;
    store
        .enqueue_cover(EntityFamily::Series, "s1", "/covers/s1.jpg")
        .await
        .unwrap();

    store
        .fail_cover(EntityFamily::Series, "s1", "/covers/s1.jpg", "timeout")
        .await
        .unwrap();
    assert_eq!(store.covers_to_download(10, 2).await.unwrap().len(), 1);

    store
        .fail_cover(EntityFamily::Series, "s1", "/covers/s1.jpg", "timeout")
        .await
        .unwrap();
    assert!(store.covers_to_download(10, 2).await.unwrap().is_empty());

    store.reset_cover(EntityFamily::Series, "s1").await.unwrap();
    let cover = store.get_cover(EntityFamily::Series, "s1").await.unwrap().unwrap();
    assert_eq!(cover.state, CoverState::Pending);
    assert_eq!(cover.attempts, 0);
}

#[tokio::test]
async fn superseded_download_does_not_settle_the_cover() {
    let store = make_store().await;
    store
        .enqueue_cover(EntityFamily::Books, "b1", "/covers/old.jpg")
        .await
        .unwrap();
    store
        .enqueue_cover(EntityFamily::Books, "b1", "/covers/new.jpg")
        .await
        .unwrap();

    let settled = store
        .complete_cover(
            EntityFamily::Books,
            "b1",
            "/covers/old.jpg",
            Path::new("/tmp/covers/b1.img"),
            None,
        )
        .await
        .unwrap();
    assert!(!settled);
    let failed = store
        .fail_cover(EntityFamily::Books, "b1", "/covers/old.jpg", "timeout")
        .await
        .unwrap();
    assert!(!failed);

    let cover = store.get_cover(EntityFamily::Books, "b1").await.unwrap().unwrap();
    assert_eq!(cover.state, CoverState::Pending);
    assert_eq!(cover.image_ref, "/covers/new.jpg");
    assert_eq!(cover.attempts, 0);
    assert_eq!(cover.local_path, None);
    let queued = store.covers_to_download(10, 3).await.unwrap();
    assert_eq!(queued.len(), 1);
    assert_eq!(queued[0].image_ref, "/covers/new.jpg");
}

#[tokio::test]
async fn progress_updates_coalesce_and_yield_to_newer_local() {
    let store = make_store().await;
    store.record_progress("b1", 1_000, false).await.unwrap();
    store.record_progress("b1", 2_000, false).await.unwrap();

    let ops = store.pending_operations().await.unwrap();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].kind, OpKind::Progress);
    assert_eq!(ops[0].payload["positionMs"], 2_000);

    let stale = ProgressRecord {
        book_id: "b1".into(),
        position_ms: 500,
        finished: false,
        updated_at: 0,
        dirty: false,
    };
    assert!(!store.apply_server_progress(&stale).await.unwrap());
    assert_eq!(store.get_progress("b1").await.unwrap().unwrap().position_ms, 2_000);

    let newer = ProgressRecord {
        updated_at: now_ms() + 600_000,
        position_ms: 9_000,
        ..stale
    };
    assert!(store.apply_server_progress(&newer).await.unwrap());
    let progress = store.get_progress("b1").await.unwrap().unwrap();
    assert_eq!(progress.position_ms, 9_000);
    assert!(!progress.dirty);
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn operation_state_machine() {
    let store = make_store().await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;
    let op_id = store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Edited" }))
        .await
        .unwrap();

    assert!(store.claim_operation(op_id).await.unwrap().is_some());
    assert!(store.claim_operation(op_id).await.unwrap().is_none());
    assert!(store.operations_for_drain().await.unwrap().is_empty());

    store.fail_operation(op_id, "503", true).await.unwrap();
    let failed = store.failed_operations().await.unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].retry_count, 1);
    assert_eq!(failed[0].last_error.as_deref(), Some("503"));

    store.retry_operation(op_id).await.unwrap();
    let op = store.get_operation(op_id).await.unwrap().unwrap();
    assert_eq!(op.status, OpStatus::Queued);
    assert_eq!(op.retry_count, 0);

    store.claim_operation(op_id).await.unwrap();
    assert_eq!(store.recover_in_flight().await.unwrap(), 1);
    assert_eq!(
        store.get_operation(op_id).await.unwrap().unwrap().status,
        OpStatus::Queued
    );
}

#[tokio::test]
async fn dismissing_last_operation_clears_dirty_flag() {
    let store = make_store().await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;
    let op_id = store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Edited" }))
        .await
        .unwrap();
    store.fail_operation(op_id, "422", false).await.unwrap();

    assert_eq!(store.dismiss_all_failed().await.unwrap(), 1);

    let row = store.get_entity(EntityFamily::Books, "b1").await.unwrap().unwrap();
    assert!(!row.dirty);
    assert_eq!(row.name, "Edited");
    assert_eq!(store.pending_count().await.unwrap(), 0);
}

#[tokio::test]
async fn dismissing_conflicted_edit_applies_server_snapshot() {
    let store = make_store().await;
    apply(&store, EntityFamily::Books, vec![book("b1", "Dune", "2024-01-01T00:00:00Z")], &[]).await;
    let op_id = store
        .update_fields(EntityFamily::Books, "b1", &json!({ "title": "Local" }))
        .await
        .unwrap();
    apply(&store, EntityFamily::Books, vec![book("b1", "Server", FUTURE)], &[]).await;

    store.dismiss_operation(op_id).await.unwrap();

    let row = store.get_entity(EntityFamily::Books, "b1").await.unwrap().unwrap();
    assert_eq!(row.name, "Server");
    assert!(!row.is_conflicted());
}

fn parse_ms(value: &str) -> i64 {
    super::super::records::parse_timestamp(value).unwrap()
}
