//! End-to-end: events appended to a store, read back and materialized into
//! relational rows and key-value entities.

use std::sync::Arc;

use eventide::{
    Entity, EntitySchema, Envelope, EventDecodeError, EventPayload, ProjectionCommand,
    ProjectionConsumer, ProjectionError, ProjectionQueue, Projector, QueueSettings,
    SchemaRegistry,
    event::{Event, Headers, LinkEvent, decode_as},
    keyvalue::{KeyValueProvider, inmemory as kv},
    rows::{RowStore, UnitOfWork, inmemory as memory_rows},
    schema::{Constraint, FieldKind},
    store::{EventStore, inmemory, log::{LogStore, memory::MemoryLog}},
};
use nonempty::nonempty;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct ListCreated {
    list_id: Uuid,
    name: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct ItemAdded {
    list_id: Uuid,
    item: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct ListArchived {
    list_id: Uuid,
}

#[derive(Clone, Debug, PartialEq)]
enum ShoppingEvent {
    ListCreated(ListCreated),
    ItemAdded(ItemAdded),
    ListArchived(ListArchived),
}

impl EventPayload for ShoppingEvent {
    const EVENT_KINDS: &'static [&'static str] =
        &["Shopping.ListCreated", "Shopping.ItemAdded", "Shopping.ListArchived"];

    fn kind(&self) -> &'static str {
        match self {
            Self::ListCreated(_) => "Shopping.ListCreated",
            Self::ItemAdded(_) => "Shopping.ItemAdded",
            Self::ListArchived(_) => "Shopping.ListArchived",
        }
    }

    fn encode(&self) -> Result<serde_json::Value, serde_json::Error> {
        match self {
            Self::ListCreated(e) => serde_json::to_value(e),
            Self::ItemAdded(e) => serde_json::to_value(e),
            Self::ListArchived(e) => serde_json::to_value(e),
        }
    }

    fn decode(kind: &str, data: serde_json::Value) -> Result<Self, EventDecodeError> {
        match kind {
            "Shopping.ListCreated" => decode_as(kind, data).map(Self::ListCreated),
            "Shopping.ItemAdded" => decode_as(kind, data).map(Self::ItemAdded),
            "Shopping.ListArchived" => decode_as(kind, data).map(Self::ListArchived),
            _ => Err(EventDecodeError::UnknownKind {
                kind: kind.to_owned(),
                expected: Self::EVENT_KINDS,
            }),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct ListSummary {
    id: Uuid,
    name: String,
    items: Vec<String>,
}

impl Entity for ListSummary {
    fn schema() -> EntitySchema {
        EntitySchema::new("ListSummary")
            .key("id", FieldKind::Uuid)
            .field("name", FieldKind::Text, [Constraint::Required])
            .field("items", FieldKind::Json, [])
    }
}

struct ListSummaryProjector;

impl Projector<ShoppingEvent> for ListSummaryProjector {
    type Entity = ListSummary;

    fn project(
        &self,
        event: &Envelope<ShoppingEvent>,
    ) -> Result<Option<ProjectionCommand>, ProjectionError> {
        match &event.payload {
            ShoppingEvent::ListCreated(e) => ProjectionCommand::create(&ListSummary {
                id: e.list_id,
                name: e.name.clone(),
                items: Vec::new(),
            })
            .map(Some),
            ShoppingEvent::ItemAdded(e) => Ok(Some(ProjectionCommand::Link {
                key: e.list_id.into(),
                collection: "items".to_owned(),
                value: serde_json::Value::String(e.item.clone()),
            })),
            ShoppingEvent::ListArchived(e) => Ok(Some(ProjectionCommand::Delete {
                key: e.list_id.into(),
            })),
        }
    }
}

fn envelope(payload: ShoppingEvent, correlation_id: Uuid) -> Event<ShoppingEvent> {
    Event::Domain(Envelope::new(
        payload,
        Headers::new(correlation_id, Uuid::new_v4(), Uuid::new_v4()),
    ))
}

/// Write a list's history and read it back through `store`.
async fn record_history<S>(store: &S, list_id: Uuid) -> Vec<Envelope<ShoppingEvent>>
where
    S: EventStore<Event = ShoppingEvent>,
{
    let stream = format!("ShoppingList-{list_id}");
    let correlation_id = Uuid::new_v4();
    let created = envelope(
        ShoppingEvent::ListCreated(ListCreated {
            list_id,
            name: "groceries".to_owned(),
        }),
        correlation_id,
    );
    store.append(&stream, 0, nonempty![created]).await.unwrap();
    let items = nonempty![
        envelope(
            ShoppingEvent::ItemAdded(ItemAdded {
                list_id,
                item: "milk".to_owned(),
            }),
            correlation_id,
        ),
        envelope(
            ShoppingEvent::ItemAdded(ItemAdded {
                list_id,
                item: "eggs".to_owned(),
            }),
            correlation_id,
        ),
    ];
    assert_eq!(store.append(&stream, 1, items).await.unwrap(), 2);

    let history = store.read_stream(&stream).await.unwrap();
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|e| e.headers.correlation_id == correlation_id));
    history
}

async fn project_history<S>(store: &S)
where
    S: EventStore<Event = ShoppingEvent>,
{
    let list_id = Uuid::new_v4();
    let history = record_history(store, list_id).await;

    let registry = Arc::new(SchemaRegistry::new());
    let row_store = Arc::new(memory_rows::RowStore::new());
    let consumer = ProjectionConsumer::new(
        ListSummaryProjector,
        Arc::clone(&row_store),
        Arc::clone(&registry),
        ProjectionQueue::new("list-summaries", QueueSettings::default()),
    );
    for event in &history {
        assert!(consumer.deliver(event).unwrap());
    }
    consumer.queue().flush(true).await;

    let descriptor = registry.descriptor::<ListSummary>().unwrap();
    let mut uow = UnitOfWork::new(row_store.begin().await.unwrap());
    let summary: ListSummary = uow.find(&descriptor, &list_id.into()).await.unwrap().unwrap();
    assert_eq!(summary.name, "groceries");
    assert_eq!(summary.items, ["milk", "eggs"]);
    assert_eq!(consumer.queue().stats().completed, 3);
}

#[tokio::test]
async fn in_memory_store_feeds_relational_projection() {
    project_history(&inmemory::Store::<ShoppingEvent>::new()).await;
}

#[tokio::test]
async fn log_store_feeds_relational_projection() {
    let store: LogStore<_, ShoppingEvent> = LogStore::new(Arc::new(MemoryLog::new()));
    project_history(&store).await;
}

#[tokio::test]
async fn linked_read_models_replay_the_source_events() {
    let store: LogStore<_, ShoppingEvent> = LogStore::new(Arc::new(MemoryLog::new()));
    let list_id = Uuid::new_v4();
    let history = record_history(&store, list_id).await;

    let index = "AllItems-1";
    let source = format!("ShoppingList-{list_id}");
    let links = nonempty![
        Event::Link(LinkEvent::new(&source, 2, history[1].headers.message_id)),
        Event::Link(LinkEvent::new(&source, 3, history[2].headers.message_id)),
    ];
    store.append(index, 0, links).await.unwrap();

    assert_eq!(store.read_stream(index).await.unwrap(), history[1..]);
}

#[tokio::test]
async fn history_materializes_into_key_value_partitions() {
    let store = inmemory::Store::<ShoppingEvent>::new();
    let list_id = Uuid::new_v4();
    let household = Uuid::new_v4();
    let history = record_history(&store, list_id).await;

    let provider = KeyValueProvider::new(kv::Store::new());
    let mut summary = ListSummary::default();
    let mut tokens = Vec::new();
    for event in &history {
        let token = match &event.payload {
            ShoppingEvent::ListCreated(e) => {
                summary = ListSummary {
                    id: e.list_id,
                    name: e.name.clone(),
                    items: Vec::new(),
                };
                provider.create_entity(household, e.list_id, &summary).await.unwrap()
            }
            ShoppingEvent::ItemAdded(e) => {
                summary.items.push(e.item.clone());
                provider.update_entity(household, e.list_id, &summary).await.unwrap()
            }
            ShoppingEvent::ListArchived(e) => provider
                .delete_entity::<ListSummary>(household, e.list_id)
                .await
                .unwrap(),
        };
        tokens.push(token);
    }

    let stored = provider.get_entity::<ListSummary>(list_id).await.unwrap().unwrap();
    assert_eq!(stored, summary);
    assert_eq!(
        provider.get_partition_keys::<ListSummary>(household).await.unwrap(),
        [format!("ListSummary:{list_id}")]
    );

    let since_creation = provider
        .get_change_entries(Some(&tokens[0]), household)
        .await
        .unwrap();
    assert_eq!(since_creation.len(), 2);
    assert!(
        since_creation
            .iter()
            .all(|entry| entry.entity_key == format!("ListSummary:{list_id}"))
    );
}
