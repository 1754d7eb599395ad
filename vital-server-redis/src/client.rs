use crate::error::RedlockResult;
use crate::replica::LockReplica;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{Client, Script};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Sets every key or none. Returns the number of keys set.
const ACQUIRE_SCRIPT: &str = r#"
for i, key in ipairs(KEYS) do
  if redis.call("exists", key) == 1 then
    return 0
  end
end
for i, key in ipairs(KEYS) do
  redis.call("set", key, ARGV[1], "PX", ARGV[2])
end
return #KEYS
"#;

/// Deletes the keys still owned by ARGV[1]
const RELEASE_SCRIPT: &str = r#"
local count = 0
for i, key in ipairs(KEYS) do
  if redis.call("get", key) == ARGV[1] then
    redis.call("del", key)
    count = count + 1
  end
end
return count
"#;

/// Lock replica backed by one Redis server
pub struct RedisReplica {
    url: String,
    client: Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    acquire: Script,
    release: Script,
}

impl RedisReplica {
    /// Parses the url; the connection is opened on first use.
    pub fn new<S: Into<String>>(url: S) -> RedlockResult<Self> {
        let url = url.into();
        let client = Client::open(url.as_str())?;
        info!(url = %url, "Configured Redis lock replica");
        Ok(Self {
            url,
            client,
            connection: Mutex::new(None),
            acquire: Script::new(ACQUIRE_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        })
    }

    async fn connection(&self) -> RedlockResult<MultiplexedConnection> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!(url = %self.url, "Connected to Redis lock replica");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    async fn reset(&self) {
        *self.connection.lock().await = None;
    }
}

#[async_trait]
impl LockReplica for RedisReplica {
    fn name(&self) -> &str {
        &self.url
    }

    async fn try_acquire(
        &self,
        keys: &[String],
        value: &str,
        ttl: Duration,
    ) -> RedlockResult<bool> {
        let mut conn = self.connection().await?;
        let mut invocation = self.acquire.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        invocation.arg(value).arg(ttl.as_millis() as u64);

        match invocation.invoke_async::<_, i64>(&mut conn).await {
            Ok(set) => Ok(set as usize == keys.len()),
            Err(e) => {
                if e.is_connection_dropped() || e.is_io_error() {
                    self.reset().await;
                }
                Err(e.into())
            }
        }
    }

    async fn release(&self, keys: &[String], value: &str) -> RedlockResult<()> {
        let mut conn = self.connection().await?;
        let mut invocation = self.release.prepare_invoke();
        for key in keys {
            invocation.key(key);
        }
        invocation.arg(value);

        let released: i64 = invocation.invoke_async(&mut conn).await?;
        debug!(url = %self.url, released, "Released Redis lock keys");
        Ok(())
    }
}
