//! Integration tests for the `PostgreSQL` event store.
//!
//! These tests require Docker to be running and will spin up a `PostgreSQL`
//! container using testcontainers.

use eventide_core::{
    event::{Event, LinkEvent},
    store::{AppendError, EventStore},
    test::{TestEvent, added, contract, names, stream_name},
};
use eventide_postgres::{Settings, Store};
use nonempty::nonempty;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use uuid::Uuid;

/// Test helper to set up a `PostgreSQL` container.
struct TestDb {
    _container: ContainerAsync<Postgres>,
    admin_url: String,
}

impl TestDb {
    async fn new() -> Self {
        let container = Postgres::default().start().await.unwrap();
        let host = container.get_host().await.unwrap();
        let port = container.get_host_port_ipv4(5432).await.unwrap();

        Self {
            _container: container,
            admin_url: format!("postgres://postgres:postgres@{host}:{port}/postgres"),
        }
    }

    fn settings(&self, database: &str) -> Settings {
        Settings {
            admin_url: self.admin_url.clone(),
            database: database.to_owned(),
            ..Settings::default()
        }
    }

    async fn store(&self) -> Store<TestEvent> {
        Store::connect(&self.settings("eventide")).await.unwrap()
    }
}

#[tokio::test]
async fn honours_the_event_store_contract() {
    let db = TestDb::new().await;
    let store = db.store().await;
    contract::run_all(&store).await;
}

#[tokio::test]
async fn connect_creates_the_database_and_schema() {
    let db = TestDb::new().await;
    let store = db.store().await;

    let streams: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM evt_streams")
        .fetch_one(store.pool())
        .await
        .unwrap();
    let events: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM evt_events")
        .fetch_one(store.pool())
        .await
        .unwrap();

    assert_eq!(streams.0, 0);
    assert_eq!(events.0, 0);
}

#[tokio::test]
async fn concurrent_bootstraps_all_succeed() {
    let db = TestDb::new().await;
    let settings = db.settings("raced");

    let connects = (0..4).map(|_| {
        let settings = settings.clone();
        tokio::spawn(async move { Store::<TestEvent>::connect(&settings).await.map(drop) })
    });
    for handle in connects.collect::<Vec<_>>() {
        handle.await.unwrap().unwrap();
    }

    let store: Store<TestEvent> = Store::connect(&settings).await.unwrap();
    store.migrate().await.unwrap();
}

#[tokio::test]
async fn stream_row_tracks_the_public_version() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let stream = stream_name("Foo");

    store
        .append(&stream, 0, nonempty![added("a"), added("b")])
        .await
        .unwrap();
    store.append(&stream, 2, nonempty![added("c")]).await.unwrap();

    let version: i64 = sqlx::query_scalar("SELECT version FROM evt_streams WHERE name = $1")
        .bind(&stream)
        .fetch_one(store.pool())
        .await
        .unwrap();
    assert_eq!(version, 3);

    let versions: Vec<i64> =
        sqlx::query_scalar("SELECT version FROM evt_events WHERE stream_name = $1 ORDER BY seq_id")
            .bind(&stream)
            .fetch_all(store.pool())
            .await
            .unwrap();
    assert_eq!(versions, [1, 2, 3]);
}

#[tokio::test]
async fn conflicts_leave_the_stream_unchanged() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let stream = stream_name("Foo");
    store
        .append(&stream, 0, nonempty![added("a"), added("b"), added("c")])
        .await
        .unwrap();

    match store.append(&stream, 1, nonempty![added("late")]).await {
        Err(AppendError::Conflict(conflict)) => {
            assert_eq!(conflict.expected, 1);
            assert_eq!(conflict.actual, Some(3));
        }
        other => panic!("expected a conflict, got {other:?}"),
    }
    assert_eq!(store.current_version(&stream).await.unwrap(), 3);
}

#[tokio::test]
async fn racing_writers_get_exactly_one_success() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let stream = stream_name("Race");

    let writers = (0..8).map(|i| {
        let store = store.clone();
        let stream = stream.clone();
        tokio::spawn(async move {
            store
                .append(&stream, 0, nonempty![added(&i.to_string())])
                .await
        })
    });
    let mut successes = 0;
    for writer in writers.collect::<Vec<_>>() {
        match writer.await.unwrap() {
            Ok(_) => successes += 1,
            Err(error) => assert!(error.is_conflict(), "unexpected error: {error}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(store.read_stream(&stream).await.unwrap().len(), 1);
}

#[tokio::test]
async fn links_are_stored_as_link_rows() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let source = stream_name("List");
    store
        .append(&source, 0, nonempty![added("a"), added("b")])
        .await
        .unwrap();
    let links = stream_name("ReadModel");
    store
        .append(
            &links,
            0,
            nonempty![
                Event::Link(LinkEvent::new(&source, 2, Uuid::new_v4())),
                Event::Link(LinkEvent::new(&source, 9, Uuid::new_v4())),
            ],
        )
        .await
        .unwrap();

    let (kind, link_stream, link_version): (String, String, i64) = sqlx::query_as(
        "SELECT kind, link_stream, link_version FROM evt_events \
         WHERE stream_name = $1 AND version = 1",
    )
    .bind(&links)
    .fetch_one(store.pool())
    .await
    .unwrap();
    assert_eq!(kind, "$>");
    assert_eq!(link_stream, source);
    assert_eq!(link_version, 2);

    // The dangling second link is skipped.
    assert_eq!(names(&store.read_stream(&links).await.unwrap()), ["b"]);
    assert_eq!(store.current_version(&links).await.unwrap(), 2);
}

#[tokio::test]
async fn links_to_links_resolve_recursively() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let source = stream_name("List");
    store.append(&source, 0, nonempty![added("a")]).await.unwrap();
    let first = stream_name("Index");
    store
        .append(
            &first,
            0,
            nonempty![Event::Link(LinkEvent::new(&source, 1, Uuid::new_v4()))],
        )
        .await
        .unwrap();
    let second = stream_name("Index");
    store
        .append(
            &second,
            0,
            nonempty![Event::Link(LinkEvent::new(&first, 1, Uuid::new_v4()))],
        )
        .await
        .unwrap();

    let last = store.read_last_event(&second).await.unwrap();
    assert_eq!(last.version, 1);
    assert_eq!(names(&last.event.into_iter().collect::<Vec<_>>()), ["a"]);
}

#[tokio::test]
async fn undecodable_rows_are_skipped_and_counted() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let stream = stream_name("Foo");
    store
        .append(&stream, 0, nonempty![added("a"), added("b")])
        .await
        .unwrap();
    sqlx::query(
        "UPDATE evt_events SET kind = 'Tests.Renamed' WHERE stream_name = $1 AND version = 1",
    )
    .bind(&stream)
    .execute(store.pool())
    .await
    .unwrap();

    assert_eq!(names(&store.read_stream(&stream).await.unwrap()), ["b"]);
    assert_eq!(store.decode_failures(), 1);
}

#[tokio::test]
async fn clear_removes_every_stream() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let stream = stream_name("Foo");
    store.append(&stream, 0, nonempty![added("a")]).await.unwrap();

    store.clear().await.unwrap();

    assert!(store.read_stream(&stream).await.unwrap().is_empty());
    store.append(&stream, 0, nonempty![added("again")]).await.unwrap();
}

#[tokio::test]
async fn stores_share_a_pool() {
    let db = TestDb::new().await;
    let store = db.store().await;
    let pool: PgPool = store.pool().clone();
    let other: Store<TestEvent> = Store::new(pool);
    let stream = stream_name("Foo");
    store.append(&stream, 0, nonempty![added("a")]).await.unwrap();

    assert_eq!(names(&other.read_stream(&stream).await.unwrap()), ["a"]);
}
