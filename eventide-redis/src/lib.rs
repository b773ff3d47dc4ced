//! Redis backend for the eventide key-value projection provider.
//!
//! [`RedisStore`] implements [`KeyValueStore`] over a multiplexed
//! [`ConnectionManager`]; every [`KeyValueStore::exec`] call is sent as one
//! `MULTI`/`EXEC` pipeline. Guarded transactions run as one Lua script, since
//! `WATCH` cannot be used on a multiplexed connection.
//!
//! ```ignore
//! let store = RedisStore::connect(&Settings::from_env()).await?;
//! let provider = KeyValueProvider::new(store);
//! provider.create_entity(partition_id, item.id, &item).await?;
//! ```

use std::{collections::BTreeMap, sync::LazyLock};

use eventide_core::keyvalue::{KeyValueStore, KvCommand};
use redis::{AsyncCommands, RedisError, Script, aio::ConnectionManager};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("redis error: {0}")]
    Redis(#[from] RedisError),
}

/// Connection settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// `redis://` or `rediss://` URL.
    pub url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_owned(),
        }
    }
}

impl Settings {
    /// Defaults, overridden by `EVENTIDE_REDIS_URL` when set.
    #[must_use]
    pub fn from_env() -> Self {
        std::env::var("EVENTIDE_REDIS_URL")
            .map(|url| Self { url })
            .unwrap_or_default()
    }
}

/// Redis-backed [`KeyValueStore`].
///
/// Cloning is cheap and clones share the underlying connection.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    /// Open a managed connection. It reconnects on its own after failures.
    #[tracing::instrument(skip(settings))]
    pub async fn connect(settings: &Settings) -> Result<Self, Error> {
        let client = redis::Client::open(settings.url.as_str())?;
        let conn = ConnectionManager::new(client).await?;
        tracing::debug!("connected to redis");
        Ok(Self { conn })
    }

    #[must_use]
    pub const fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }
}

fn pipeline(commands: &[KvCommand]) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    for command in commands {
        match command {
            KvCommand::HashSet { key, fields } => {
                if !fields.is_empty() {
                    pipe.cmd("HSET").arg(key).arg(fields).ignore();
                }
            }
            KvCommand::Delete { key } => {
                pipe.del(key).ignore();
            }
            KvCommand::SetAdd { key, member } => {
                pipe.sadd(key, member).ignore();
            }
            KvCommand::SetRemove { key, member } => {
                pipe.srem(key, member).ignore();
            }
            KvCommand::ListPush { key, value } => {
                pipe.rpush(key, value).ignore();
            }
        }
    }
    pipe
}

/// Runs the packed commands in `ARGV` only if `KEYS[1]` exists.
///
/// Each command is packed as its name, its argument count, then its
/// arguments.
static GUARDED_EXEC: LazyLock<Script> = LazyLock::new(|| {
    Script::new(
        r"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
local i = 1
while i <= #ARGV do
    local argc = tonumber(ARGV[i + 1])
    redis.call(ARGV[i], unpack(ARGV, i + 2, i + 1 + argc))
    i = i + 2 + argc
end
return 1
",
    )
});

fn pack(name: &str, args: &[&str], packed: &mut Vec<String>) {
    packed.push(name.to_owned());
    packed.push(args.len().to_string());
    packed.extend(args.iter().map(|&arg| arg.to_owned()));
}

/// Script arguments for `commands`, in [`GUARDED_EXEC`]'s packing.
fn script_args(commands: &[KvCommand]) -> Vec<String> {
    let mut packed = Vec::new();
    for command in commands {
        match command {
            KvCommand::HashSet { key, fields } => {
                if !fields.is_empty() {
                    let mut args = vec![key.as_str()];
                    for (field, value) in fields {
                        args.extend([field.as_str(), value.as_str()]);
                    }
                    pack("HSET", &args, &mut packed);
                }
            }
            KvCommand::Delete { key } => pack("DEL", &[key.as_str()], &mut packed),
            KvCommand::SetAdd { key, member } => {
                pack("SADD", &[key.as_str(), member.as_str()], &mut packed);
            }
            KvCommand::SetRemove { key, member } => {
                pack("SREM", &[key.as_str(), member.as_str()], &mut packed);
            }
            KvCommand::ListPush { key, value } => {
                pack("RPUSH", &[key.as_str(), value.as_str()], &mut packed);
            }
        }
    }
    packed
}

impl KeyValueStore for RedisStore {
    type Error = Error;

    #[tracing::instrument(skip(self, commands), fields(commands_len = commands.len()))]
    async fn exec(&self, commands: Vec<KvCommand>) -> Result<(), Self::Error> {
        if commands.is_empty() {
            return Ok(());
        }
        pipeline(&commands)
            .query_async::<()>(&mut self.conn())
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, commands), fields(commands_len = commands.len()))]
    async fn exec_if_exists<'a>(
        &'a self,
        guard: &'a str,
        commands: Vec<KvCommand>,
    ) -> Result<bool, Self::Error> {
        let ran: i64 = GUARDED_EXEC
            .key(guard)
            .arg(script_args(&commands))
            .invoke_async(&mut self.conn())
            .await?;
        Ok(ran == 1)
    }

    async fn exists<'a>(&'a self, key: &'a str) -> Result<bool, Self::Error> {
        Ok(self.conn().exists(key).await?)
    }

    async fn hash_get_all<'a>(
        &'a self,
        key: &'a str,
    ) -> Result<Vec<(String, String)>, Self::Error> {
        let fields: BTreeMap<String, String> = self.conn().hgetall(key).await?;
        Ok(fields.into_iter().collect())
    }

    async fn hash_get<'a>(
        &'a self,
        key: &'a str,
        fields: &'a [String],
    ) -> Result<Vec<Option<String>>, Self::Error> {
        if fields.is_empty() {
            return Ok(Vec::new());
        }
        Ok(redis::cmd("HMGET")
            .arg(key)
            .arg(fields)
            .query_async(&mut self.conn())
            .await?)
    }

    async fn set_members<'a>(&'a self, key: &'a str) -> Result<Vec<String>, Self::Error> {
        Ok(self.conn().smembers(key).await?)
    }

    async fn list_len<'a>(&'a self, key: &'a str) -> Result<usize, Self::Error> {
        Ok(self.conn().llen(key).await?)
    }

    async fn list_range<'a>(
        &'a self,
        key: &'a str,
        start: usize,
        stop: usize,
    ) -> Result<Vec<String>, Self::Error> {
        let start = isize::try_from(start).unwrap_or(isize::MAX);
        let stop = isize::try_from(stop).unwrap_or(isize::MAX);
        Ok(self.conn().lrange(key, start, stop).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transactions_are_wrapped_in_multi_exec() {
        let commands = vec![
            KvCommand::HashSet {
                key: "Item:1".to_owned(),
                fields: vec![("name".to_owned(), "milk".to_owned())],
            },
            KvCommand::HashSet {
                key: "Item:2".to_owned(),
                fields: Vec::new(),
            },
            KvCommand::ListPush {
                key: "ChangeIndex:p".to_owned(),
                value: "00000000000000000001-0000000000000000".to_owned(),
            },
        ];
        let packed =
            String::from_utf8_lossy(&pipeline(&commands).get_packed_pipeline()).into_owned();

        assert!(packed.starts_with("*1\r\n$5\r\nMULTI\r\n"));
        assert!(packed.ends_with("*1\r\n$4\r\nEXEC\r\n"));
        assert_eq!(packed.matches("HSET").count(), 1);
        assert!(packed.contains("RPUSH"));
    }

    #[test]
    fn guarded_commands_are_packed_with_their_argument_counts() {
        let commands = vec![
            KvCommand::Delete {
                key: "Item:1".to_owned(),
            },
            KvCommand::HashSet {
                key: "Item:1".to_owned(),
                fields: vec![
                    ("$type".to_owned(), "Item".to_owned()),
                    ("name".to_owned(), "milk".to_owned()),
                ],
            },
            KvCommand::HashSet {
                key: "Item:2".to_owned(),
                fields: Vec::new(),
            },
            KvCommand::SetAdd {
                key: "Item:KeyIndex:p".to_owned(),
                member: "Item:1".to_owned(),
            },
        ];
        assert_eq!(
            script_args(&commands),
            [
                "DEL", "1", "Item:1", //
                "HSET", "5", "Item:1", "$type", "Item", "name", "milk", //
                "SADD", "2", "Item:KeyIndex:p", "Item:1",
            ]
        );
    }

    #[test]
    fn settings_default_to_localhost() {
        assert_eq!(Settings::default().url, "redis://127.0.0.1:6379");
    }
}
