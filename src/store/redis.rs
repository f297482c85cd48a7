//! Redis-backed bucket store shared by every service instance.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{info, trace};

use super::{BucketStore, StoreError};

/// Replace KEYS[1] with ARGV[2] (TTL ARGV[3] ms) only if it currently holds ARGV[1].
const COMPARE_AND_SWAP_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
    return 1
end
return 0
"#;

/// Bucket store on a Redis server.
///
/// Compare-and-swap runs as a server-side script, so a swap is atomic with
/// respect to every other client of the same server. Key expiry is native
/// Redis `PX` expiry.
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    cas_script: Script,
}

impl RedisStore {
    /// Connect to the server at `url` (for example `redis://127.0.0.1:6379`).
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        info!(url = %url, "Connected to Redis bucket store");

        Ok(Self {
            connection,
            cas_script: Script::new(COMPARE_AND_SWAP_SCRIPT),
        })
    }
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

/// Longest expiry Redis accepts without overflowing its absolute deadline.
const MAX_TTL_MILLIS: u64 = (i64::MAX / 4) as u64;

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis())
        .unwrap_or(u64::MAX)
        .clamp(1, MAX_TTL_MILLIS)
}

#[async_trait]
impl BucketStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: &str,
        new: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let swapped: i64 = self
            .cas_script
            .key(key)
            .arg(expected)
            .arg(new)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        trace!(key = %key, swapped = swapped == 1, "Redis compare-and-swap");
        Ok(swapped == 1)
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let mut conn = self.connection.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    fn backend(&self) -> &'static str {
        "redis"
    }
}
