//! Integration tests for the Redis key-value store.
//!
//! These tests require Docker to be running and will spin up a Redis
//! container using testcontainers.

use std::{collections::HashSet, sync::Arc};

use eventide_core::{
    keyvalue::{
        ChangeId, ChangeIdSource, Error, KeyValueProvider, KeyValueStore, KvCommand, TYPE_FIELD,
        keys,
    },
    schema::{Entity, EntitySchema, FieldKind},
};
use eventide_redis::{RedisStore, Settings};
use serde::{Deserialize, Serialize};
use testcontainers::{ContainerAsync, runners::AsyncRunner};
use testcontainers_modules::redis::{REDIS_PORT, Redis};
use uuid::Uuid;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct ShoppingItem {
    id: Uuid,
    name: String,
    quantity: i64,
    done: bool,
    tags: Vec<String>,
}

impl Entity for ShoppingItem {
    fn schema() -> EntitySchema {
        EntitySchema::new("ShoppingItem")
            .key("id", FieldKind::Uuid)
            .field("name", FieldKind::Text, [])
            .field("quantity", FieldKind::Integer, [])
            .field("done", FieldKind::Boolean, [])
            .field("tags", FieldKind::Json, [])
    }
}

struct TestRedis {
    _container: ContainerAsync<Redis>,
    store: RedisStore,
}

impl TestRedis {
    async fn new() -> Self {
        let container = Redis::default().start().await.unwrap();
        let host = container.get_host().await.unwrap();
        let port = container.get_host_port_ipv4(REDIS_PORT).await.unwrap();
        let settings = Settings {
            url: format!("redis://{host}:{port}"),
        };

        Self {
            _container: container,
            store: RedisStore::connect(&settings).await.unwrap(),
        }
    }

    fn provider(&self) -> KeyValueProvider<RedisStore> {
        KeyValueProvider::new(self.store.clone())
    }
}

fn item(name: &str) -> ShoppingItem {
    ShoppingItem {
        id: Uuid::new_v4(),
        name: name.to_owned(),
        quantity: 2,
        ..ShoppingItem::default()
    }
}

#[tokio::test]
async fn entities_are_stored_as_hashes_without_defaults() {
    let redis = TestRedis::new().await;
    let provider = redis.provider();
    let partition = Uuid::new_v4();
    let milk = ShoppingItem {
        tags: vec!["dairy".to_owned()],
        ..item("milk")
    };

    provider.create_entity(partition, milk.id, &milk).await.unwrap();

    let key = keys::entity("ShoppingItem", milk.id);
    let fields = redis.store.hash_get_all(&key).await.unwrap();
    assert_eq!(
        fields,
        [
            (TYPE_FIELD.to_owned(), "ShoppingItem".to_owned()),
            ("id".to_owned(), milk.id.to_string()),
            ("name".to_owned(), "milk".to_owned()),
            ("quantity".to_owned(), "2".to_owned()),
            ("tags".to_owned(), r#"["dairy"]"#.to_owned()),
        ]
    );
    assert_eq!(
        provider.get_entity::<ShoppingItem>(milk.id).await.unwrap(),
        Some(milk.clone())
    );
    assert_eq!(
        provider.get_partition_keys::<ShoppingItem>(partition).await.unwrap(),
        [key]
    );
}

#[tokio::test]
async fn updates_require_an_existing_entity() {
    let redis = TestRedis::new().await;
    let provider = redis.provider();
    let partition = Uuid::new_v4();
    let mut milk = item("milk");

    assert!(matches!(
        provider.update_entity(partition, milk.id, &milk).await,
        Err(Error::EntityDoesNotExist { .. })
    ));

    provider.create_entity(partition, milk.id, &milk).await.unwrap();
    milk.quantity = 0;
    milk.done = true;
    provider.update_entity(partition, milk.id, &milk).await.unwrap();

    let fields = redis
        .store
        .hash_get_all(&keys::entity("ShoppingItem", milk.id))
        .await
        .unwrap();
    assert!(fields.iter().all(|(name, _)| name != "quantity"));
    assert_eq!(
        provider.get_entity::<ShoppingItem>(milk.id).await.unwrap(),
        Some(milk)
    );
}

#[tokio::test]
async fn updates_after_a_delete_do_not_resurrect_the_entity() {
    let redis = TestRedis::new().await;
    let provider = redis.provider();
    let partition = Uuid::new_v4();
    let milk = item("milk");
    provider.create_entity(partition, milk.id, &milk).await.unwrap();
    provider
        .delete_entity::<ShoppingItem>(partition, milk.id)
        .await
        .unwrap();

    assert!(matches!(
        provider.update_entity(partition, milk.id, &milk).await,
        Err(Error::EntityDoesNotExist { .. })
    ));
    let key = keys::entity("ShoppingItem", milk.id);
    assert!(!redis.store.exists(&key).await.unwrap());
    assert!(
        provider
            .get_partition_keys::<ShoppingItem>(partition)
            .await
            .unwrap()
            .is_empty()
    );
    assert_eq!(provider.get_change_entries(None, partition).await.unwrap().len(), 2);
}

#[tokio::test]
async fn entities_with_only_default_fields_exist() {
    let redis = TestRedis::new().await;
    let provider = redis.provider();
    let partition = Uuid::new_v4();
    let id = Uuid::new_v4();
    let blank = ShoppingItem::default();

    provider.create_entity(partition, id, &blank).await.unwrap();
    let key = keys::entity("ShoppingItem", id);
    assert!(redis.store.exists(&key).await.unwrap());
    assert_eq!(
        provider.get_entity::<ShoppingItem>(id).await.unwrap(),
        Some(blank.clone())
    );

    provider.update_entity(partition, id, &blank).await.unwrap();
    assert_eq!(
        provider.get_entity::<ShoppingItem>(id).await.unwrap(),
        Some(blank)
    );
}

#[tokio::test]
async fn writers_sharing_a_server_never_share_change_tokens() {
    let redis = TestRedis::new().await;
    let writers = [
        KeyValueProvider::new(redis.store.clone())
            .with_change_ids(Arc::new(ChangeIdSource::with_clock(|| 1_000))),
        KeyValueProvider::new(redis.store.clone())
            .with_change_ids(Arc::new(ChangeIdSource::with_clock(|| 1_000))),
    ];
    let partition = Uuid::new_v4();

    let mut written = Vec::new();
    for i in 0..10 {
        let entity = item(&format!("item-{i}"));
        writers[i % 2]
            .create_entity(partition, entity.id, &entity)
            .await
            .unwrap();
        written.push(keys::entity("ShoppingItem", entity.id));
    }

    let changes = writers[1].get_change_entries(None, partition).await.unwrap();
    let tokens: HashSet<_> = changes.iter().map(|c| c.change_id.clone()).collect();
    assert_eq!(tokens.len(), 10);
    let keys: Vec<_> = changes.into_iter().map(|c| c.entity_key).collect();
    assert_eq!(keys, written);
}

#[tokio::test]
async fn change_feed_catches_up_from_a_token() {
    let redis = TestRedis::new().await;
    let provider = redis.provider();
    let partition = Uuid::new_v4();

    let mut tokens = Vec::new();
    for i in 0..10 {
        let entity = item(&format!("item-{i}"));
        tokens.push(
            provider
                .create_entity(partition, entity.id, &entity)
                .await
                .unwrap(),
        );
    }

    let after_fourth = provider
        .get_change_entries(Some(&tokens[3]), partition)
        .await
        .unwrap();
    let ids: Vec<ChangeId> = after_fourth.into_iter().map(|e| e.change_id).collect();
    assert_eq!(ids, tokens[4..]);

    let all = provider.get_change_entries(None, partition).await.unwrap();
    assert_eq!(all.len(), 10);
    assert!(all.windows(2).all(|w| w[0].change_id < w[1].change_id));

    let latest = provider
        .get_change_entries(tokens.last(), partition)
        .await
        .unwrap();
    assert!(latest.is_empty());
}

#[tokio::test]
async fn change_feed_scans_across_batches() {
    let redis = TestRedis::new().await;
    let provider = redis.provider();
    let partition = Uuid::new_v4();
    let entity = item("bulk");
    provider.create_entity(partition, entity.id, &entity).await.unwrap();

    let mut tokens = Vec::new();
    for _ in 0..250 {
        tokens.push(
            provider
                .update_entity_key_in_partition::<ShoppingItem>(partition, entity.id)
                .await
                .unwrap(),
        );
    }

    let entries = provider
        .get_change_entries(Some(&tokens[10]), partition)
        .await
        .unwrap();
    assert_eq!(entries.len(), 239);
    assert_eq!(entries[0].change_id, tokens[11]);
}

#[tokio::test]
async fn deletes_remove_the_entity_and_its_index_entry() {
    let redis = TestRedis::new().await;
    let provider = redis.provider();
    let partition = Uuid::new_v4();
    let milk = item("milk");
    provider.create_entity(partition, milk.id, &milk).await.unwrap();

    provider
        .delete_entity::<ShoppingItem>(partition, milk.id)
        .await
        .unwrap();

    assert!(
        provider
            .get_entity::<ShoppingItem>(milk.id)
            .await
            .unwrap()
            .is_none()
    );
    assert!(
        provider
            .get_partition_keys::<ShoppingItem>(partition)
            .await
            .unwrap()
            .is_empty()
    );
    let changes = provider.get_change_entries(None, partition).await.unwrap();
    assert_eq!(changes.len(), 2);
    let key = keys::entity("ShoppingItem", milk.id);
    assert!(changes.iter().all(|c| c.entity_key == key));
}

#[tokio::test]
async fn missing_keys_read_as_empty() {
    let redis = TestRedis::new().await;
    let store = &redis.store;

    assert!(!store.exists("nothing").await.unwrap());
    assert!(store.hash_get_all("nothing").await.unwrap().is_empty());
    assert_eq!(
        store.hash_get("nothing", &["a".to_owned()]).await.unwrap(),
        [None]
    );
    assert!(store.set_members("nothing").await.unwrap().is_empty());
    assert_eq!(store.list_len("nothing").await.unwrap(), 0);
    assert!(store.list_range("nothing", 0, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn exec_applies_every_command() {
    let redis = TestRedis::new().await;
    let store = &redis.store;

    store
        .exec(vec![
            KvCommand::HashSet {
                key: "h".to_owned(),
                fields: vec![("a".to_owned(), "1".to_owned())],
            },
            KvCommand::SetAdd {
                key: "s".to_owned(),
                member: "x".to_owned(),
            },
            KvCommand::ListPush {
                key: "l".to_owned(),
                value: "first".to_owned(),
            },
            KvCommand::ListPush {
                key: "l".to_owned(),
                value: "second".to_owned(),
            },
        ])
        .await
        .unwrap();

    assert_eq!(
        store.hash_get_all("h").await.unwrap(),
        [("a".to_owned(), "1".to_owned())]
    );
    assert_eq!(store.set_members("s").await.unwrap(), ["x"]);
    assert_eq!(store.list_range("l", 0, 1).await.unwrap(), ["first", "second"]);

    store
        .exec(vec![
            KvCommand::Delete { key: "h".to_owned() },
            KvCommand::SetRemove {
                key: "s".to_owned(),
                member: "x".to_owned(),
            },
        ])
        .await
        .unwrap();
    assert!(!store.exists("h").await.unwrap());
    assert!(store.set_members("s").await.unwrap().is_empty());
}

#[tokio::test]
async fn guarded_exec_runs_only_while_the_guard_exists() {
    let redis = TestRedis::new().await;
    let store = &redis.store;
    let commands = || {
        vec![
            KvCommand::Delete { key: "h".to_owned() },
            KvCommand::HashSet {
                key: "h".to_owned(),
                fields: vec![("b".to_owned(), "2".to_owned())],
            },
            KvCommand::ListPush {
                key: "l".to_owned(),
                value: "changed".to_owned(),
            },
        ]
    };

    assert!(!store.exec_if_exists("h", commands()).await.unwrap());
    assert!(!store.exists("l").await.unwrap());

    store
        .exec(vec![KvCommand::HashSet {
            key: "h".to_owned(),
            fields: vec![("a".to_owned(), "1".to_owned())],
        }])
        .await
        .unwrap();
    assert!(store.exec_if_exists("h", commands()).await.unwrap());
    assert_eq!(
        store.hash_get_all("h").await.unwrap(),
        [("b".to_owned(), "2".to_owned())]
    );
    assert_eq!(store.list_range("l", 0, 0).await.unwrap(), ["changed"]);
}
