//! Redis state provider
//!
//! Every compound write runs as a single Lua script, so the value, its
//! expiry and the CAS-max timestamp move together. Reads use pipelines
//! (one round-trip for all buckets of a window).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kestrel_core::retry::{retry_async, RetryPolicy};
use kestrel_core::state::{check_primitive_write, check_staleness, is_fresh};
use kestrel_core::window::{alive_window_buckets, bucket_key, bucket_name, parse_bucket_key};
use kestrel_core::{
    reduce_buckets, scalar_from_string, scalar_string, AggrFn, Error, FeatureDescriptor, Payload, RawBucket,
    Result, Scalar, SharedClock, State, Value, WindowPolicy, WindowResultMap,
};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Pipeline, Script};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

/// KEYS: value, ts. ARGV: op, ttl_ms (0 = none), ts_micros, values...
const PRIMITIVE_WRITE_LUA: &str = r#"
local op = ARGV[1]
local ttl = tonumber(ARGV[2])
if op == 'set' then
  redis.call('SET', KEYS[1], ARGV[4])
elseif op == 'replace' then
  redis.call('DEL', KEYS[1])
  if #ARGV > 3 then redis.call('RPUSH', KEYS[1], unpack(ARGV, 4)) end
elseif op == 'append' then
  redis.call('RPUSH', KEYS[1], unpack(ARGV, 4))
elseif op == 'incrby' then
  redis.call('INCRBY', KEYS[1], ARGV[4])
elseif op == 'incrbyfloat' then
  redis.call('INCRBYFLOAT', KEYS[1], ARGV[4])
else
  return redis.error_reply('unknown op ' .. op)
end
if ttl > 0 then redis.call('PEXPIRE', KEYS[1], ttl) end
local cur = redis.call('GET', KEYS[2])
if (not cur) or tonumber(cur) < tonumber(ARGV[3]) then cur = ARGV[3] end
if ttl > 0 then
  redis.call('SET', KEYS[2], cur, 'PX', ttl)
else
  redis.call('SET', KEYS[2], cur)
end
return 1
"#;

/// KEYS: bucket hash. ARGV: value, expire_at_ms, ts_micros, aggregators...
const WINDOW_ADD_LUA: &str = r#"
local v = tonumber(ARGV[1])
for i = 4, #ARGV do
  local f = ARGV[i]
  if f == 'sum' then
    redis.call('HINCRBYFLOAT', KEYS[1], 'sum', ARGV[1])
  elseif f == 'count' then
    redis.call('HINCRBY', KEYS[1], 'count', 1)
  elseif f == 'min' or f == 'max' then
    local cur = redis.call('HGET', KEYS[1], f)
    if (not cur) or (f == 'min' and v < tonumber(cur)) or (f == 'max' and v > tonumber(cur)) then
      redis.call('HSET', KEYS[1], f, ARGV[1])
    end
  end
end
local ts = redis.call('HGET', KEYS[1], '_ts')
if (not ts) or tonumber(ts) < tonumber(ARGV[3]) then
  redis.call('HSET', KEYS[1], '_ts', ARGV[3])
end
redis.call('PEXPIREAT', KEYS[1], ARGV[2])
return 1
"#;

static PRIMITIVE_WRITE: LazyLock<Script> = LazyLock::new(|| Script::new(PRIMITIVE_WRITE_LUA));
static WINDOW_ADD: LazyLock<Script> = LazyLock::new(|| Script::new(WINDOW_ADD_LUA));

/// Redis state configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisStateConfig {
    /// Redis connection URL (e.g., "redis://localhost:6379")
    pub url: String,
    /// Connection attempts at start-up
    pub max_retries: usize,
}

impl Default for RedisStateConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            max_retries: 3,
        }
    }
}

impl RedisStateConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

pub struct RedisState {
    conn: ConnectionManager,
    clock: SharedClock,
    window: WindowPolicy,
}

impl RedisState {
    pub async fn new(config: RedisStateConfig, clock: SharedClock, window: WindowPolicy) -> Result<Self> {
        let client = Client::open(config.url.clone()).map_err(|e| Error::config(format!("redis url: {}", e)))?;
        let policy = RetryPolicy {
            max_retries: config.max_retries,
            ..Default::default()
        };
        let conn = retry_async(&policy, || {
            let client = client.clone();
            async move {
                ConnectionManager::new(client)
                    .await
                    .map_err(|e| Error::state(format!("redis connection manager error: {}", e)))
            }
        })
        .await?;

        tracing::info!(url = %config.url, "connected redis state");
        Ok(Self { conn, clock, window })
    }

    fn value_key(fd: &FeatureDescriptor, entity_id: &str) -> String {
        format!("{}:{}", fd.fqn, entity_id)
    }

    fn ts_key(fd: &FeatureDescriptor, entity_id: &str) -> String {
        format!("_ts:{}:{}", fd.fqn, entity_id)
    }

    async fn primitive_write(
        &self,
        fd: &FeatureDescriptor,
        entity_id: &str,
        op: &str,
        values: &[String],
        ts: DateTime<Utc>,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        let ttl_ms = u64::try_from(fd.staleness.as_millis()).unwrap_or(u64::MAX);

        let mut invocation = PRIMITIVE_WRITE.prepare_invoke();
        invocation
            .key(Self::value_key(fd, entity_id))
            .key(Self::ts_key(fd, entity_id))
            .arg(op)
            .arg(ttl_ms)
            .arg(ts.timestamp_micros());
        for v in values {
            invocation.arg(v);
        }
        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::state(format!("redis {} error: {}", op, e)))?;

        tracing::debug!(fqn = %fd.fqn, entity_id, op, "redis write complete");
        Ok(())
    }

    fn decode_bucket(fd: &FeatureDescriptor, key: &str, fields: HashMap<String, String>) -> Option<RawBucket> {
        let (_, bucket, entity_id) = parse_bucket_key(key)?;
        let mut data = WindowResultMap::new();
        for (name, raw) in fields {
            let (Ok(fn_), Ok(v)) = (name.parse::<AggrFn>(), raw.parse::<f64>()) else {
                continue;
            };
            data.insert(fn_, v);
        }
        if data.is_empty() {
            return None;
        }
        Some(RawBucket {
            fqn: fd.fqn.clone(),
            bucket: bucket.to_string(),
            entity_id: entity_id.to_string(),
            data,
        })
    }

    async fn fetch_buckets(&self, fd: &FeatureDescriptor, keys: &[String]) -> Result<Vec<RawBucket>> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.conn.clone();
        let mut pipe = Pipeline::new();
        for key in keys {
            pipe.hgetall(key);
        }
        let hashes: Vec<HashMap<String, String>> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::state(format!("redis HGETALL error: {}", e)))?;

        Ok(keys
            .iter()
            .zip(hashes)
            .filter_map(|(key, fields)| Self::decode_bucket(fd, key, fields))
            .collect())
    }
}

#[async_trait]
impl State for RedisState {
    async fn get(&self, fd: &FeatureDescriptor, entity_id: &str) -> Result<Option<Value>> {
        let now = self.clock.now();
        if fd.is_windowed() {
            let names = alive_window_buckets(now, fd.staleness, fd.freshness);
            let buckets = self.window_buckets(fd, entity_id, &names).await?;
            let map = reduce_buckets(&buckets);
            if map.is_empty() {
                return Ok(None);
            }
            return Ok(Some(Value::new(Payload::Window(map), now).fresh(true)));
        }

        let mut conn = self.conn.clone();
        let key = Self::value_key(fd, entity_id);
        let ts_key = Self::ts_key(fd, entity_id);

        let (ts, payload) = if fd.primitive.is_list() {
            let (ts, items): (Option<i64>, Vec<String>) = redis::pipe()
                .get(&ts_key)
                .lrange(&key, 0, -1)
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::state(format!("redis get error: {}", e)))?;
            let Some(ts) = ts else { return Ok(None) };
            let singular = fd.primitive.singular();
            let items = items
                .iter()
                .map(|s| scalar_from_string(s, singular))
                .collect::<Result<Vec<_>>>()?;
            (ts, Payload::List(items))
        } else {
            let (ts, raw): (Option<i64>, Option<String>) = redis::pipe()
                .get(&ts_key)
                .get(&key)
                .query_async(&mut conn)
                .await
                .map_err(|e| Error::state(format!("redis get error: {}", e)))?;
            let (Some(ts), Some(raw)) = (ts, raw) else {
                return Ok(None);
            };
            (ts, Payload::Scalar(scalar_from_string(&raw, fd.primitive)?))
        };

        let timestamp =
            DateTime::from_timestamp_micros(ts).ok_or_else(|| Error::internal(format!("bad timestamp {}", ts)))?;
        Ok(Some(Value {
            payload,
            timestamp,
            fresh: is_fresh(fd, timestamp, now),
        }))
    }

    async fn set(&self, fd: &FeatureDescriptor, entity_id: &str, value: &Payload, ts: DateTime<Utc>) -> Result<()> {
        if fd.is_windowed() {
            return self.window_add(fd, entity_id, value, ts).await;
        }
        check_primitive_write(fd, "set", ts, self.clock.now())?;
        match (fd.primitive.is_list(), value) {
            (false, Payload::Scalar(s)) => self.primitive_write(fd, entity_id, "set", &[scalar_string(s)], ts).await,
            (true, Payload::List(items)) => {
                let values: Vec<String> = items.iter().map(scalar_string).collect();
                self.primitive_write(fd, entity_id, "replace", &values, ts).await
            }
            _ => Err(Error::type_mismatch(fd.primitive, "incompatible payload")),
        }
    }

    async fn append(&self, fd: &FeatureDescriptor, entity_id: &str, value: &Payload, ts: DateTime<Utc>) -> Result<()> {
        if fd.is_windowed() || !fd.primitive.is_list() {
            return Err(Error::UnsupportedOperation("append only supports list features".into()));
        }
        check_primitive_write(fd, "append", ts, self.clock.now())?;
        let values: Vec<String> = match value {
            Payload::List(items) => items.iter().map(scalar_string).collect(),
            Payload::Scalar(s) => vec![scalar_string(s)],
            _ => return Err(Error::type_mismatch(fd.primitive, "incompatible payload")),
        };
        if values.is_empty() {
            return Ok(());
        }
        self.primitive_write(fd, entity_id, "append", &values, ts).await
    }

    async fn incr(&self, fd: &FeatureDescriptor, entity_id: &str, by: &Payload, ts: DateTime<Utc>) -> Result<()> {
        if fd.is_windowed() || !fd.primitive.is_numeric() {
            return Err(Error::UnsupportedOperation("incr only supports numeric scalars".into()));
        }
        check_primitive_write(fd, "incr", ts, self.clock.now())?;
        let op = match by.as_scalar() {
            Some(Scalar::Int(_)) => "incrby",
            Some(Scalar::Float(_)) => "incrbyfloat",
            _ => return Err(Error::type_mismatch(fd.primitive, "non-numeric increment")),
        };
        let by = by.as_scalar().map(scalar_string).unwrap_or_default();
        self.primitive_write(fd, entity_id, op, &[by], ts).await
    }

    async fn window_add(&self, fd: &FeatureDescriptor, entity_id: &str, value: &Payload, ts: DateTime<Utc>)
        -> Result<()> {
        if !fd.is_windowed() {
            return Err(Error::UnsupportedOperation(format!("{} is not a windowed feature", fd.fqn)));
        }
        check_staleness(fd, ts, self.clock.now())?;
        let v = value
            .as_f64()
            .ok_or_else(|| Error::type_mismatch(fd.primitive, "non-numeric window value"))?;

        let bucket = bucket_name(ts, fd.freshness);
        let expire_at = self.window.bucket_dead_time(&bucket, fd.freshness, fd.staleness)?;

        let mut conn = self.conn.clone();
        let mut invocation = WINDOW_ADD.prepare_invoke();
        invocation
            .key(bucket_key(&fd.fqn, &bucket, entity_id))
            .arg(v)
            .arg(expire_at.timestamp_millis())
            .arg(ts.timestamp_micros());
        for fn_ in fd.tracked_aggregators() {
            invocation.arg(fn_.to_string());
        }
        let _: i64 = invocation
            .invoke_async(&mut conn)
            .await
            .map_err(|e| Error::state(format!("redis window add error: {}", e)))?;
        Ok(())
    }

    async fn window_buckets(&self, fd: &FeatureDescriptor, entity_id: &str, buckets: &[String])
        -> Result<Vec<RawBucket>> {
        let keys: Vec<String> = buckets.iter().map(|b| bucket_key(&fd.fqn, b, entity_id)).collect();
        self.fetch_buckets(fd, &keys).await
    }

    async fn dead_window_buckets(&self, fd: &FeatureDescriptor, ignore: &[RawBucket]) -> Result<Vec<RawBucket>> {
        let dead: HashSet<String> = self
            .window
            .dead_window_buckets(self.clock.now(), fd.staleness, fd.freshness)
            .into_iter()
            .collect();
        let ignore: HashSet<String> = ignore.iter().map(RawBucket::key).collect();

        let mut keys = Vec::new();
        {
            let mut conn = self.conn.clone();
            let mut iter: redis::AsyncIter<'_, String> = conn
                .scan_match(format!("{}/*", fd.fqn))
                .await
                .map_err(|e| Error::state(format!("redis SCAN error: {}", e)))?;
            while let Some(key) = iter.next_item().await {
                let Some((_, bucket, _)) = parse_bucket_key(&key) else {
                    continue;
                };
                if dead.contains(bucket) && !ignore.contains(&key) {
                    keys.push(key);
                }
            }
        }
        keys.sort();
        self.fetch_buckets(fd, &keys).await
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::state(format!("redis PING error: {}", e)))?;
        if pong != "PONG" {
            return Err(Error::state(format!("unexpected PING reply '{}'", pong)));
        }
        Ok(())
    }

    fn provider(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_default() {
        let config = RedisStateConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_config_from_settings() {
        let config: RedisStateConfig = serde_json::from_value(serde_json::json!({"url": "redis://r:6380"})).unwrap();
        assert_eq!(config.url, "redis://r:6380");
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_decode_bucket_skips_bookkeeping_fields() {
        let fd = FeatureDescriptor::new("ns.b", kestrel_core::Primitive::Float);
        let fields = HashMap::from([
            ("sum".to_string(), "4.5".to_string()),
            ("count".to_string(), "2".to_string()),
            ("_ts".to_string(), "1714557600000000".to_string()),
        ]);
        let b = RedisState::decode_bucket(&fd, "ns.b/1a:user_1", fields).unwrap();
        assert_eq!(b.bucket, "1a");
        assert_eq!(b.entity_id, "user_1");
        assert_eq!(b.data.len(), 2);
        assert_eq!(b.data[&AggrFn::Count], 2.0);

        assert!(RedisState::decode_bucket(&fd, "ns.b/1a:user_1", HashMap::new()).is_none());
    }
}
