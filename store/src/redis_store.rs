//! Redis-backed queues and sets
//!
//! Every queue maps to a handful of keys under a common prefix:
//!
//! - `<prefix>:<queue>:pending` list of message ids waiting for delivery
//! - `<prefix>:<queue>:inflight` sorted set of delivered ids scored by their visibility deadline (ms)
//! - `<prefix>:<queue>:body` hash of id -> message body
//! - `<prefix>:<queue>:receipt` hash of id -> pop token of the current delivery
//! - `<prefix>:<queue>:seq` message id counter
//!
//! Dequeue, delete and the visibility check run as Lua scripts so that they are atomic on the
//! server. Deadlines are computed from the server clock (`TIME`), so consumers on hosts with
//! skewed clocks agree on when a message becomes visible again.

use std::sync::{Arc, LazyLock};

use crate::{Backend, Message, Queue, QueueKind, QueueOptions, Result, Set, StoreError};

// KEYS: pending, inflight, receipt, body
// ARGV: visibility ms, batch size, token prefix
static DEQUEUE: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('HDEL', KEYS[3], id)
  redis.call('RPUSH', KEYS[1], id)
end
local out = {}
local wanted = tonumber(ARGV[2])
local taken = 0
while taken < wanted do
  local id = redis.call('LPOP', KEYS[1])
  if not id then
    break
  end
  local body = redis.call('HGET', KEYS[4], id)
  if body then
    local token = ARGV[3] .. '-' .. id
    redis.call('ZADD', KEYS[2], now + tonumber(ARGV[1]), id)
    redis.call('HSET', KEYS[3], id, token)
    table.insert(out, id)
    table.insert(out, token)
    table.insert(out, body)
    taken = taken + 1
  end
end
return out
",
    )
});

// KEYS: inflight, receipt, body
// ARGV: id, pop token
static DELETE: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
if redis.call('HGET', KEYS[2], ARGV[1]) ~= ARGV[2] then
  return 0
end
redis.call('ZREM', KEYS[1], ARGV[1])
redis.call('HDEL', KEYS[2], ARGV[1])
redis.call('HDEL', KEYS[3], ARGV[1])
return 1
",
    )
});

// KEYS: pending, inflight, receipt
static VISIBLE: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r"
local t = redis.call('TIME')
local now = tonumber(t[1]) * 1000 + math.floor(tonumber(t[2]) / 1000)
local expired = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', now)
for _, id in ipairs(expired) do
  redis.call('ZREM', KEYS[2], id)
  redis.call('HDEL', KEYS[3], id)
  redis.call('RPUSH', KEYS[1], id)
end
return redis.call('LLEN', KEYS[1])
",
    )
});

/// Maps a redis error onto the store taxonomy, connection trouble is transient
fn classify(target: &str, error: redis::RedisError) -> StoreError {
    let transient = error.is_io_error()
        || error.is_timeout()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
        || error.kind() == redis::ErrorKind::BusyLoadingError;
    if transient {
        StoreError::Transport {
            target: target.to_string(),
            reason: error.to_string(),
        }
    } else {
        StoreError::Backend {
            target: target.to_string(),
            reason: error.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct RedisBackend {
    connection: redis::aio::MultiplexedConnection,
    prefix: String,
    options: QueueOptions,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("prefix", &self.prefix)
            .field("options", &self.options)
            .finish()
    }
}

impl RedisBackend {
    /// Connects to the server at `url`, any failure here is a configuration error
    pub async fn connect(url: &str, prefix: &str, options: QueueOptions) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|error| StoreError::Config(format!("cannot parse '{url}': {error}")))?;
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|error| StoreError::Config(format!("cannot connect to '{url}': {error}")))?;
        tracing::info!("connected to redis, key prefix '{}'", prefix);
        Ok(Self {
            connection,
            prefix: prefix.to_string(),
            options,
        })
    }
}

#[async_trait::async_trait]
impl Backend for RedisBackend {
    async fn open_queue(&self, name: &str, kind: QueueKind) -> Result<Arc<dyn Queue>> {
        Ok(Arc::new(RedisQueue::new(
            self.connection.clone(),
            &self.prefix,
            name,
            kind,
            &self.options,
        )))
    }

    async fn open_set(&self, name: &str) -> Result<Arc<dyn Set>> {
        Ok(Arc::new(RedisSet {
            connection: self.connection.clone(),
            name: name.to_string(),
            key: format!("{}:{}", self.prefix, name),
        }))
    }
}

#[derive(Clone)]
pub struct RedisQueue {
    connection: redis::aio::MultiplexedConnection,
    name: String,
    kind: QueueKind,
    visibility_ms: u64,
    batch_size: usize,
    pending: String,
    inflight: String,
    body: String,
    receipt: String,
    seq: String,
}

impl std::fmt::Debug for RedisQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisQueue")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("visibility_ms", &self.visibility_ms)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

impl RedisQueue {
    fn new(
        connection: redis::aio::MultiplexedConnection,
        prefix: &str,
        name: &str,
        kind: QueueKind,
        options: &QueueOptions,
    ) -> Self {
        let base = format!("{prefix}:{name}");
        let visibility_ms =
            u64::try_from(options.visibility_timeout(kind).as_millis()).unwrap_or(u64::MAX);
        Self {
            connection,
            name: name.to_string(),
            kind,
            visibility_ms,
            batch_size: std::cmp::max(1, options.batch_size),
            pending: format!("{base}:pending"),
            inflight: format!("{base}:inflight"),
            body: format!("{base}:body"),
            receipt: format!("{base}:receipt"),
            seq: format!("{base}:seq"),
        }
    }

    fn error(&self, error: redis::RedisError) -> StoreError {
        classify(&self.name, error)
    }
}

#[async_trait::async_trait]
impl Queue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> QueueKind {
        self.kind
    }

    async fn enqueue(&self, body: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        let id: u64 = redis::cmd("INCR")
            .arg(&self.seq)
            .query_async(&mut connection)
            .await
            .map_err(|error| self.error(error))?;
        let _: () = redis::pipe()
            .atomic()
            .hset(&self.body, id, body)
            .ignore()
            .rpush(&self.pending, id)
            .ignore()
            .query_async(&mut connection)
            .await
            .map_err(|error| self.error(error))?;
        Ok(())
    }

    async fn dequeue_batch(&self) -> Result<Vec<Message>> {
        let mut connection = self.connection.clone();
        let token_prefix = format!("{:016x}", rand::random::<u64>());
        let flat: Vec<String> = DEQUEUE
            .key(&self.pending)
            .key(&self.inflight)
            .key(&self.receipt)
            .key(&self.body)
            .arg(self.visibility_ms)
            .arg(self.batch_size)
            .arg(&token_prefix)
            .invoke_async(&mut connection)
            .await
            .map_err(|error| self.error(error))?;
        if flat.len() % 3 != 0 {
            return Err(StoreError::Backend {
                target: self.name.clone(),
                reason: format!("dequeue returned {} fields, expected triples", flat.len()),
            });
        }
        Ok(flat
            .chunks_exact(3)
            .map(|triple| Message {
                id: triple[0].clone(),
                pop_token: triple[1].clone(),
                body: triple[2].clone(),
            })
            .collect())
    }

    async fn delete(&self, id: &str, pop_token: &str) -> Result<()> {
        let mut connection = self.connection.clone();
        let deleted: i64 = DELETE
            .key(&self.inflight)
            .key(&self.receipt)
            .key(&self.body)
            .arg(id)
            .arg(pop_token)
            .invoke_async(&mut connection)
            .await
            .map_err(|error| self.error(error))?;
        if deleted == 0 {
            return Err(StoreError::StaleReceipt {
                queue: self.name.clone(),
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn is_empty(&self) -> Result<bool> {
        let mut connection = self.connection.clone();
        let visible: u64 = VISIBLE
            .key(&self.pending)
            .key(&self.inflight)
            .key(&self.receipt)
            .invoke_async(&mut connection)
            .await
            .map_err(|error| self.error(error))?;
        Ok(visible == 0)
    }

    async fn approx_size(&self) -> Result<usize> {
        let mut connection = self.connection.clone();
        let (pending, inflight): (usize, usize) = redis::pipe()
            .llen(&self.pending)
            .zcard(&self.inflight)
            .query_async(&mut connection)
            .await
            .map_err(|error| self.error(error))?;
        Ok(pending + inflight)
    }

    async fn reset(&self) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: () = redis::cmd("DEL")
            .arg(&self.pending)
            .arg(&self.inflight)
            .arg(&self.body)
            .arg(&self.receipt)
            .arg(&self.seq)
            .query_async(&mut connection)
            .await
            .map_err(|error| self.error(error))?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct RedisSet {
    connection: redis::aio::MultiplexedConnection,
    name: String,
    key: String,
}

impl std::fmt::Debug for RedisSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSet")
            .field("name", &self.name)
            .field("key", &self.key)
            .finish()
    }
}

#[async_trait::async_trait]
impl Set for RedisSet {
    fn name(&self) -> &str {
        &self.name
    }

    async fn add(&self, value: &str) -> Result<bool> {
        let mut connection = self.connection.clone();
        let added: i64 = redis::cmd("SADD")
            .arg(&self.key)
            .arg(value)
            .query_async(&mut connection)
            .await
            .map_err(|error| classify(&self.name, error))?;
        Ok(added > 0)
    }

    async fn is_member(&self, value: &str) -> Result<bool> {
        let mut connection = self.connection.clone();
        let member: bool = redis::cmd("SISMEMBER")
            .arg(&self.key)
            .arg(value)
            .query_async(&mut connection)
            .await
            .map_err(|error| classify(&self.name, error))?;
        Ok(member)
    }

    async fn reset(&self) -> Result<()> {
        let mut connection = self.connection.clone();
        let _: () = redis::cmd("DEL")
            .arg(&self.key)
            .query_async(&mut connection)
            .await
            .map_err(|error| classify(&self.name, error))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_errors_are_transient() {
        let io = redis::RedisError::from(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset by peer",
        ));
        assert!(classify("q", io).is_transient());
        let rejected = redis::RedisError::from((redis::ErrorKind::TypeError, "wrong type"));
        assert!(!classify("q", rejected).is_transient());
    }

    #[tokio::test]
    async fn unparsable_url_is_a_config_error() {
        let result = RedisBackend::connect("not a url", "dcp", QueueOptions::default()).await;
        assert!(matches!(result, Err(StoreError::Config(_))));
    }
}
