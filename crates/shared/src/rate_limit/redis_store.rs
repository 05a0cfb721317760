//! Redis-backed rate limit counters
//!
//! Each key is a sorted set of hit timestamps (milliseconds). Pruning,
//! counting and inserting run inside one Lua script so concurrent API
//! instances share exact limits.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use uuid::Uuid;

use super::{RateLimitStore, WindowState};
use crate::error::{SharedError, SharedResult};

const INCREMENT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < max then
    redis.call('ZADD', key, now, ARGV[4])
    count = count + 1
    admitted = 1
end
redis.call('PEXPIRE', key, window)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local oldest_score = -1
if oldest[2] then
    oldest_score = tonumber(oldest[2])
end
return {count, admitted, oldest_score}
"#;

const GET_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local count = redis.call('ZCOUNT', key, now - window + 1, '+inf')
local oldest = redis.call('ZRANGEBYSCORE', key, now - window + 1, '+inf', 'WITHSCORES', 'LIMIT', 0, 1)
local oldest_score = -1
if oldest[2] then
    oldest_score = tonumber(oldest[2])
end
return {count, 0, oldest_score}
"#;

/// Rate limit store shared across API instances through Redis
#[derive(Clone)]
pub struct RedisRateLimitStore {
    connection: ConnectionManager,
    increment_script: Script,
    get_script: Script,
}

impl RedisRateLimitStore {
    pub async fn connect(redis_url: &str) -> SharedResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            connection,
            increment_script: Script::new(INCREMENT_SCRIPT),
            get_script: Script::new(GET_SCRIPT),
        })
    }

    fn now_millis() -> SharedResult<i64> {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .map_err(|e| SharedError::RateLimitStore(format!("system clock error: {}", e)))
    }

    fn to_state(reply: &[i64], now: i64, window: Duration) -> SharedResult<WindowState> {
        let [count, admitted, oldest] = reply else {
            return Err(SharedError::RateLimitStore(format!(
                "unexpected script reply: {:?}",
                reply
            )));
        };

        let window_ms = window.as_millis() as i64;
        let oldest_expires_in = (*oldest >= 0)
            .then(|| Duration::from_millis((oldest + window_ms - now).max(0) as u64));

        Ok(WindowState {
            count: (*count).max(0) as u32,
            admitted: *admitted == 1,
            oldest_expires_in,
        })
    }
}

#[async_trait]
impl RateLimitStore for RedisRateLimitStore {
    async fn get(&self, key: &str, window: Duration) -> SharedResult<WindowState> {
        let now = Self::now_millis()?;
        let mut connection = self.connection.clone();
        let reply: Vec<i64> = self
            .get_script
            .key(key)
            .arg(now)
            .arg(window.as_millis() as i64)
            .invoke_async(&mut connection)
            .await?;
        Self::to_state(&reply, now, window)
    }

    async fn increment(&self, key: &str, window: Duration, max: u32) -> SharedResult<WindowState> {
        let now = Self::now_millis()?;
        let mut connection = self.connection.clone();
        let reply: Vec<i64> = self
            .increment_script
            .key(key)
            .arg(now)
            .arg(window.as_millis() as i64)
            .arg(max)
            .arg(Uuid::new_v4().to_string())
            .invoke_async(&mut connection)
            .await?;
        Self::to_state(&reply, now, window)
    }

    async fn sweep(&self) -> SharedResult<usize> {
        // Keys carry a PEXPIRE of one window, Redis evicts them itself
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_conversion() {
        let window = Duration::from_secs(60);
        let state = RedisRateLimitStore::to_state(&[3, 1, 1_000], 31_000, window).unwrap();
        assert_eq!(state.count, 3);
        assert!(state.admitted);
        assert_eq!(state.oldest_expires_in, Some(Duration::from_millis(30_000)));
    }

    #[test]
    fn test_reply_without_hits() {
        let state =
            RedisRateLimitStore::to_state(&[0, 0, -1], 5_000, Duration::from_secs(60)).unwrap();
        assert_eq!(state.count, 0);
        assert!(!state.admitted);
        assert_eq!(state.oldest_expires_in, None);
    }

    #[test]
    fn test_malformed_reply_is_error() {
        assert!(RedisRateLimitStore::to_state(&[1, 2], 0, Duration::from_secs(1)).is_err());
    }
}
