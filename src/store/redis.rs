//! Redis-backed bucket store shared by every worker process.
//!
//! Each operation is one Lua script, so refill, check and decrement run as a
//! unit on the server. Two processes racing for the last token cannot both
//! win. Timestamps come from the Redis server clock, so hosts with skewed
//! clocks still refill on one timeline.

use ::redis::aio::MultiplexedConnection;
use ::redis::{Client, FromRedisValue, RedisResult, Script};
use async_trait::async_trait;
use std::future::Future;
use std::time::Duration;
use tokio::time;

use super::{Backend, BudgetStore};
use crate::error::{Error, Result};
use crate::token_bucket::{BucketPolicy, BucketSource, RateBucket};

/// Loads (or creates) the bucket at KEYS[1] into `b`, reverting an expired
/// learned limit. ARGV: default capacity, default rate, ttl seconds.
macro_rules! bucket_script {
    ($body:literal) => {
        concat!(
            r#"
local key = KEYS[1]
local clock = redis.call('TIME')
local now = tonumber(clock[1]) + tonumber(clock[2]) / 1000000
local default_capacity = tonumber(ARGV[1])
local default_rate = tonumber(ARGV[2])
local ttl = tonumber(ARGV[3])

local raw = redis.call('HMGET', key, 'capacity', 'refill_rate', 'tokens_available',
    'last_refill_at', 'source', 'expires_at')
local b = {
    capacity = tonumber(raw[1]), refill_rate = tonumber(raw[2]), tokens = tonumber(raw[3]),
    last = tonumber(raw[4]), source = raw[5], expires = tonumber(raw[6])
}
local dirty = false
if not (b.capacity and b.refill_rate and b.tokens and b.last and b.expires)
    or (b.source ~= 'default' and b.source ~= 'learned') then
    b = { capacity = default_capacity, refill_rate = default_rate, tokens = default_capacity,
          last = now, source = 'default', expires = now + ttl }
    dirty = true
end

local function tokens_at(t)
    local elapsed = math.max(0, t - b.last)
    return math.min(b.capacity, b.tokens + elapsed * b.refill_rate)
end

local function refill()
    b.tokens = tokens_at(now)
    b.last = math.max(b.last, now)
end

local function save()
    redis.call('HSET', key,
        'capacity', tostring(b.capacity), 'refill_rate', tostring(b.refill_rate),
        'tokens_available', tostring(b.tokens), 'last_refill_at', tostring(b.last),
        'source', b.source, 'expires_at', tostring(b.expires))
    redis.call('EXPIRE', key, ttl)
end

if b.source == 'learned' and now >= b.expires then
    refill()
    b.capacity = default_capacity
    b.refill_rate = default_rate
    b.tokens = math.min(b.tokens, b.capacity)
    b.source = 'default'
    b.expires = now + ttl
    dirty = true
end
"#,
            $body
        )
    };
}

/// ARGV[4]: cost. Returns 1 when granted.
const ACQUIRE_SCRIPT: &str = bucket_script!(
    r#"
local cost = tonumber(ARGV[4])
local available = tokens_at(now)
if available >= cost then
    b.tokens = available - cost
    b.last = math.max(b.last, now)
    save()
    return 1
end
if dirty then save() end
return 0
"#
);

/// Returns the record as strings.
const GET_SCRIPT: &str = bucket_script!(
    r#"
if dirty then save() end
return { tostring(b.capacity), tostring(b.refill_rate), tostring(b.tokens),
         tostring(b.last), b.source, tostring(b.expires) }
"#
);

/// ARGV[4]: capacity, ARGV[5]: window seconds.
const LEARN_SCRIPT: &str = bucket_script!(
    r#"
local capacity = tonumber(ARGV[4])
local window = tonumber(ARGV[5])
if window <= 0 then window = 1 end
refill()
b.capacity = capacity
b.refill_rate = capacity / window
b.tokens = math.min(b.tokens, capacity)
b.source = 'learned'
b.expires = now + ttl
save()
return 1
"#
);

pub struct RedisStore {
    connection: MultiplexedConnection,
    policy: BucketPolicy,
    op_timeout: Duration,
    acquire: Script,
    get: Script,
    learn: Script,
}

impl RedisStore {
    /// Connects and pings once; both steps are bounded by `op_timeout`.
    pub async fn connect(redis_url: &str, policy: BucketPolicy, op_timeout: Duration) -> Result<Self> {
        let client = Client::open(redis_url)
            .map_err(|e| Error::Store(format!("Failed to create Redis client: {}", e)))?;

        let connection = time::timeout(op_timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| Error::Store(format!("Timed out connecting to Redis after {:?}", op_timeout)))?
            .map_err(|e| Error::Store(format!("Failed to connect to Redis: {}", e)))?;

        let store = Self {
            connection,
            policy,
            op_timeout,
            acquire: Script::new(ACQUIRE_SCRIPT),
            get: Script::new(GET_SCRIPT),
            learn: Script::new(LEARN_SCRIPT),
        };
        store.ping().await?;

        Ok(store)
    }

    fn storage_key(key: &str) -> String {
        format!("quota_guard:bucket:{}", key)
    }

    fn ttl_secs(&self) -> u64 {
        self.policy.ttl.as_secs().max(1)
    }

    /// Bounds a Redis round trip so a hung server cannot block a caller forever.
    async fn bounded<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        time::timeout(self.op_timeout, fut)
            .await
            .map_err(|_| Error::Store(format!("{} timed out after {:?}", what, self.op_timeout)))?
            .map_err(|e| Error::Store(format!("{} failed: {}", what, e)))
    }

    async fn run_script<T: FromRedisValue>(
        &self,
        what: &str,
        script: &Script,
        key: &str,
        extra: &[f64],
    ) -> Result<T> {
        let mut conn = self.connection.clone();
        let mut invocation = script.prepare_invoke();
        invocation
            .key(Self::storage_key(key))
            .arg(self.policy.default_capacity)
            .arg(self.policy.default_refill_rate)
            .arg(self.ttl_secs());
        for value in extra {
            invocation.arg(*value);
        }

        self.bounded(what, invocation.invoke_async(&mut conn)).await
    }
}

fn parse_bucket(key: &str, fields: &[String]) -> Result<RateBucket> {
    let malformed = || Error::Store(format!("Malformed bucket record for '{}'", key));
    let number = |i: usize| -> Result<f64> {
        fields
            .get(i)
            .and_then(|v| v.parse::<f64>().ok())
            .ok_or_else(malformed)
    };

    Ok(RateBucket {
        key: key.to_string(),
        capacity: number(0)?,
        refill_rate: number(1)?,
        tokens_available: number(2)?,
        last_refill_at: number(3)?,
        source: fields
            .get(4)
            .and_then(|s| BucketSource::parse(s))
            .ok_or_else(malformed)?,
        expires_at: number(5)?,
    })
}

#[async_trait]
impl BudgetStore for RedisStore {
    async fn get_or_init(&self, key: &str) -> Result<RateBucket> {
        let fields: Vec<String> = self.run_script("bucket read", &self.get, key, &[]).await?;
        parse_bucket(key, &fields)
    }

    async fn try_acquire(&self, key: &str, cost: f64) -> Result<bool> {
        let granted: i64 = self
            .run_script("token acquire", &self.acquire, key, &[cost])
            .await?;
        Ok(granted == 1)
    }

    async fn record_observed_limit(
        &self,
        key: &str,
        capacity: f64,
        window_seconds: f64,
    ) -> Result<()> {
        let _: i64 = self
            .run_script("limit update", &self.learn, key, &[capacity, window_seconds])
            .await?;
        Ok(())
    }

    async fn reset(&self, key: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        let mut cmd = ::redis::cmd("DEL");
        cmd.arg(Self::storage_key(key));
        let _: i64 = self.bounded("DEL", cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let cmd = ::redis::cmd("PING");
        let _: String = self.bounded("PING", cmd.query_async(&mut conn)).await?;
        Ok(())
    }

    fn backend(&self) -> Backend {
        Backend::Shared
    }

    fn policy(&self) -> &BucketPolicy {
        &self.policy
    }
}
