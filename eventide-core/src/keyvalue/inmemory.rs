//! In-memory key-value store with Redis-like hash, set and list types.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex},
};

use super::{KeyValueStore, KvCommand};

#[derive(Clone, Debug)]
enum Value {
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
    List(Vec<String>),
}

impl Value {
    const fn type_name(&self) -> &'static str {
        match self {
            Self::Hash(_) => "hash",
            Self::Set(_) => "set",
            Self::List(_) => "list",
        }
    }
}

/// A command hit a key holding a different type.
#[derive(Debug, thiserror::Error)]
#[error("WRONGTYPE: `{key}` holds a {actual}, not a {expected}")]
pub struct WrongType {
    pub key: String,
    pub expected: &'static str,
    pub actual: &'static str,
}

/// Thread-safe in-memory [`KeyValueStore`].
///
/// A transaction is applied in place under the lock. Each command records
/// how to undo itself, and a failed transaction is undone in reverse order.
#[derive(Clone, Default)]
pub struct Store {
    data: Arc<Mutex<HashMap<String, Value>>>,
}

impl Store {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read<T>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&Value>) -> Result<T, WrongType>,
    ) -> Result<T, WrongType> {
        let data = self.data.lock().expect("key-value store lock poisoned");
        f(data.get(key))
    }
}

fn wrong_type(key: &str, expected: &'static str, actual: &Value) -> WrongType {
    WrongType {
        key: key.to_owned(),
        expected,
        actual: actual.type_name(),
    }
}

/// Inverse of one applied command.
enum Undo {
    /// Put back what `key` held, or remove it.
    Restore { key: String, value: Option<Value> },
    HashFields {
        key: String,
        previous: Vec<(String, Option<String>)>,
    },
    SetMember {
        key: String,
        member: String,
        added: bool,
    },
    ListPop { key: String },
    Nothing,
}

impl Undo {
    fn revert(self, data: &mut HashMap<String, Value>) {
        match self {
            Self::Restore { key, value: None } => {
                data.remove(&key);
            }
            Self::Restore {
                key,
                value: Some(value),
            } => {
                data.insert(key, value);
            }
            Self::HashFields { key, previous } => {
                if let Some(Value::Hash(hash)) = data.get_mut(&key) {
                    for (field, value) in previous {
                        match value {
                            Some(value) => hash.insert(field, value),
                            None => hash.remove(&field),
                        };
                    }
                }
            }
            Self::SetMember {
                key,
                member,
                added: true,
            } => {
                if let Some(Value::Set(set)) = data.get_mut(&key) {
                    set.remove(&member);
                }
            }
            Self::SetMember {
                key,
                member,
                added: false,
            } => {
                if let Value::Set(set) = data
                    .entry(key)
                    .or_insert_with(|| Value::Set(BTreeSet::new()))
                {
                    set.insert(member);
                }
            }
            Self::ListPop { key } => {
                if let Some(Value::List(list)) = data.get_mut(&key) {
                    list.pop();
                }
            }
            Self::Nothing => {}
        }
    }
}

fn apply(data: &mut HashMap<String, Value>, command: KvCommand) -> Result<Undo, WrongType> {
    let undo = match command {
        KvCommand::HashSet { key, fields } => match data.get_mut(&key) {
            Some(Value::Hash(hash)) => {
                let mut previous = Vec::with_capacity(fields.len());
                for (field, value) in fields {
                    let old = hash.insert(field.clone(), value);
                    previous.push((field, old));
                }
                Undo::HashFields { key, previous }
            }
            Some(other) => return Err(wrong_type(&key, "hash", other)),
            None => {
                data.insert(key.clone(), Value::Hash(fields.into_iter().collect()));
                Undo::Restore { key, value: None }
            }
        },
        KvCommand::Delete { key } => {
            let value = data.remove(&key);
            Undo::Restore { key, value }
        }
        KvCommand::SetAdd { key, member } => match data.get_mut(&key) {
            Some(Value::Set(set)) => {
                let added = set.insert(member.clone());
                Undo::SetMember { key, member, added }
            }
            Some(other) => return Err(wrong_type(&key, "set", other)),
            None => {
                data.insert(key.clone(), Value::Set(BTreeSet::from([member])));
                Undo::Restore { key, value: None }
            }
        },
        KvCommand::SetRemove { key, member } => match data.get_mut(&key) {
            Some(Value::Set(set)) => {
                let removed = set.remove(&member);
                if set.is_empty() {
                    data.remove(&key);
                }
                if removed {
                    Undo::SetMember {
                        key,
                        member,
                        added: false,
                    }
                } else {
                    Undo::Nothing
                }
            }
            Some(other) => return Err(wrong_type(&key, "set", other)),
            None => Undo::Nothing,
        },
        KvCommand::ListPush { key, value } => match data.get_mut(&key) {
            Some(Value::List(list)) => {
                list.push(value);
                Undo::ListPop { key }
            }
            Some(other) => return Err(wrong_type(&key, "list", other)),
            None => {
                data.insert(key.clone(), Value::List(vec![value]));
                Undo::Restore { key, value: None }
            }
        },
    };
    Ok(undo)
}

/// Apply `commands` in order, undoing the applied ones if any fails.
fn run(data: &mut HashMap<String, Value>, commands: Vec<KvCommand>) -> Result<(), WrongType> {
    let mut undo = Vec::with_capacity(commands.len());
    for command in commands {
        match apply(data, command) {
            Ok(step) => undo.push(step),
            Err(err) => {
                for step in undo.into_iter().rev() {
                    step.revert(data);
                }
                return Err(err);
            }
        }
    }
    Ok(())
}

impl KeyValueStore for Store {
    type Error = WrongType;

    async fn exec(&self, commands: Vec<KvCommand>) -> Result<(), Self::Error> {
        let mut data = self.data.lock().expect("key-value store lock poisoned");
        run(&mut data, commands)
    }

    async fn exec_if_exists<'a>(
        &'a self,
        guard: &'a str,
        commands: Vec<KvCommand>,
    ) -> Result<bool, Self::Error> {
        let mut data = self.data.lock().expect("key-value store lock poisoned");
        if !data.contains_key(guard) {
            return Ok(false);
        }
        run(&mut data, commands).map(|()| true)
    }

    async fn exists<'a>(&'a self, key: &'a str) -> Result<bool, Self::Error> {
        self.read(key, |value| Ok(value.is_some()))
    }

    async fn hash_get_all<'a>(
        &'a self,
        key: &'a str,
    ) -> Result<Vec<(String, String)>, Self::Error> {
        self.read(key, |value| match value {
            None => Ok(Vec::new()),
            Some(Value::Hash(hash)) => Ok(hash
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()),
            Some(other) => Err(wrong_type(key, "hash", other)),
        })
    }

    async fn hash_get<'a>(
        &'a self,
        key: &'a str,
        fields: &'a [String],
    ) -> Result<Vec<Option<String>>, Self::Error> {
        self.read(key, |value| match value {
            None => Ok(vec![None; fields.len()]),
            Some(Value::Hash(hash)) => Ok(fields.iter().map(|f| hash.get(f).cloned()).collect()),
            Some(other) => Err(wrong_type(key, "hash", other)),
        })
    }

    async fn set_members<'a>(&'a self, key: &'a str) -> Result<Vec<String>, Self::Error> {
        self.read(key, |value| match value {
            None => Ok(Vec::new()),
            Some(Value::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(other) => Err(wrong_type(key, "set", other)),
        })
    }

    async fn list_len<'a>(&'a self, key: &'a str) -> Result<usize, Self::Error> {
        self.read(key, |value| match value {
            None => Ok(0),
            Some(Value::List(list)) => Ok(list.len()),
            Some(other) => Err(wrong_type(key, "list", other)),
        })
    }

    async fn list_range<'a>(
        &'a self,
        key: &'a str,
        start: usize,
        stop: usize,
    ) -> Result<Vec<String>, Self::Error> {
        self.read(key, |value| match value {
            None => Ok(Vec::new()),
            Some(Value::List(list)) => {
                if start >= list.len() || start > stop {
                    return Ok(Vec::new());
                }
                let stop = stop.min(list.len() - 1);
                Ok(list[start..=stop].to_vec())
            }
            Some(other) => Err(wrong_type(key, "list", other)),
        })
    }
}
