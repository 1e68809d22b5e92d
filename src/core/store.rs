//! Counter store abstraction for the abuse protection service.
//!
//! All cross-request state (sliding-window counters, suspicious-IP sets,
//! behavioral event windows, cached records, challenge state) lives in a
//! shared store behind this narrow interface. The backing implementation is
//! Redis; components never hold counts in process memory as the source of
//! truth, so the engine stays correct across concurrent handler instances.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during store operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis error: {0}")]
    RedisError(#[from] redis::RedisError),
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Narrow, idempotent operations over the shared store.
///
/// `record_in_window` is the atomic sliding-window batch: purge-older-than,
/// insert, count and expire execute as one unit so concurrent requests for
/// the same identifier never both observe a stale count.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically prune entries older than the window, record `member` at
    /// `now_ms`, refresh the key's expiry and return the number of entries
    /// now in the window (including the new one).
    async fn record_in_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        member: &str,
    ) -> Result<u64, StoreError>;

    /// Remove a member previously added with `record_in_window`. Used to
    /// give back the slot consumed by a denied request.
    async fn discard_member(&self, key: &str, member: &str) -> Result<(), StoreError>;

    /// Count entries currently inside the window without recording anything.
    async fn count_in_window(&self, key: &str, now_ms: u64, window_ms: u64)
        -> Result<u64, StoreError>;

    /// Add a member to a set and refresh the set's expiry.
    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError>;

    async fn set_len(&self, key: &str) -> Result<u64, StoreError>;

    /// Store a value with a TTL.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Append a timestamped payload to a time-ordered structure and refresh
    /// its retention expiry.
    async fn append_event(
        &self,
        key: &str,
        ts_ms: u64,
        payload: &str,
        retention: Duration,
    ) -> Result<(), StoreError>;

    /// Load payloads within the window, pruning older entries lazily.
    async fn window_events(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError>;
}

/// Redis-backed counter store
pub struct RedisCounterStore {
    client: redis::Client,
    /// Per-call deadline so a slow store cannot stall request handling
    timeout: Duration,
}

impl RedisCounterStore {
    pub fn new(client: redis::Client) -> Self {
        Self {
            client,
            timeout: Duration::from_secs(3),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connection(&self) -> Result<redis::aio::Connection, StoreError> {
        let connect = self.client.get_async_connection();
        tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| StoreError::Unavailable("connection timed out".to_string()))?
            .map_err(StoreError::from)
    }

    async fn bounded<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, redis::RedisError>>,
    ) -> Result<T, StoreError> {
        tokio::time::timeout(self.timeout, fut)
            .await
            .map_err(|_| StoreError::Unavailable("operation timed out".to_string()))?
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn record_in_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        member: &str,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let cutoff = now_ms.saturating_sub(window_ms);
        let (count,): (u64,) = self
            .bounded(
                redis::pipe()
                    .atomic()
                    .cmd("ZREMRANGEBYSCORE")
                    .arg(key)
                    .arg(0)
                    .arg(cutoff)
                    .ignore()
                    .cmd("ZADD")
                    .arg(key)
                    .arg(now_ms)
                    .arg(member)
                    .ignore()
                    .cmd("ZCARD")
                    .arg(key)
                    .cmd("PEXPIRE")
                    .arg(key)
                    .arg(window_ms)
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;
        Ok(count)
    }

    async fn discard_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = self
            .bounded(redis::cmd("ZREM").arg(key).arg(member).query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn count_in_window(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
    ) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let cutoff = now_ms.saturating_sub(window_ms);
        let (count,): (u64,) = self
            .bounded(
                redis::pipe()
                    .atomic()
                    .cmd("ZREMRANGEBYSCORE")
                    .arg(key)
                    .arg(0)
                    .arg(cutoff)
                    .ignore()
                    .cmd("ZCARD")
                    .arg(key)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(count)
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = self
            .bounded(
                redis::pipe()
                    .atomic()
                    .cmd("SADD")
                    .arg(key)
                    .arg(member)
                    .ignore()
                    .cmd("PEXPIRE")
                    .arg(key)
                    .arg(ttl.as_millis() as u64)
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut conn = self.connection().await?;
        let found: bool = self
            .bounded(redis::cmd("SISMEMBER").arg(key).arg(member).query_async(&mut conn))
            .await?;
        Ok(found)
    }

    async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
        let mut conn = self.connection().await?;
        let len: u64 = self
            .bounded(redis::cmd("SCARD").arg(key).query_async(&mut conn))
            .await?;
        Ok(len)
    }

    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = self
            .bounded(
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("PX")
                    .arg(ttl.as_millis() as u64)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection().await?;
        let value: Option<String> = self
            .bounded(redis::cmd("GET").arg(key).query_async(&mut conn))
            .await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        let _: () = self
            .bounded(redis::cmd("DEL").arg(key).query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn append_event(
        &self,
        key: &str,
        ts_ms: u64,
        payload: &str,
        retention: Duration,
    ) -> Result<(), StoreError> {
        let mut conn = self.connection().await?;
        // Sorted-set members must be unique; a uuid prefix keeps identical
        // payloads at the same millisecond from collapsing into one entry.
        let member = format!("{}:{}", Uuid::new_v4().simple(), payload);
        let _: () = self
            .bounded(
                redis::pipe()
                    .atomic()
                    .cmd("ZADD")
                    .arg(key)
                    .arg(ts_ms)
                    .arg(member)
                    .ignore()
                    .cmd("PEXPIRE")
                    .arg(key)
                    .arg(retention.as_millis() as u64)
                    .ignore()
                    .query_async(&mut conn),
            )
            .await?;
        Ok(())
    }

    async fn window_events(
        &self,
        key: &str,
        now_ms: u64,
        window_ms: u64,
        limit: usize,
    ) -> Result<Vec<String>, StoreError> {
        let mut conn = self.connection().await?;
        let cutoff = now_ms.saturating_sub(window_ms);
        let (members,): (Vec<String>,) = self
            .bounded(
                redis::pipe()
                    .atomic()
                    .cmd("ZREMRANGEBYSCORE")
                    .arg(key)
                    .arg(0)
                    .arg(cutoff)
                    .ignore()
                    .cmd("ZRANGEBYSCORE")
                    .arg(key)
                    .arg(cutoff)
                    .arg("+inf")
                    .arg("LIMIT")
                    .arg(0)
                    .arg(limit as i64)
                    .query_async(&mut conn),
            )
            .await?;
        Ok(members
            .into_iter()
            .filter_map(|m| m.splitn(2, ':').nth(1).map(|p| p.to_string()))
            .collect())
    }
}

#[cfg(test)]
pub mod memory {
    //! In-memory counter store used by the test suite.

    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    use crate::utils::now_millis;

    #[derive(Default)]
    struct Tables {
        windows: HashMap<String, Vec<(u64, String)>>,
        sets: HashMap<String, Vec<String>>,
        values: HashMap<String, (String, u64)>,
    }

    /// Stand-in for the Redis store; supports failure injection so the
    /// fail-open paths can be exercised without a network.
    #[derive(Default)]
    pub struct MemoryCounterStore {
        tables: Mutex<Tables>,
        fail: AtomicBool,
    }

    impl MemoryCounterStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every subsequent operation fail as if the store were down.
        pub fn set_unavailable(&self, unavailable: bool) {
            self.fail.store(unavailable, Ordering::SeqCst);
        }

        fn check(&self) -> Result<(), StoreError> {
            if self.fail.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable("injected failure".to_string()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CounterStore for MemoryCounterStore {
        async fn record_in_window(
            &self,
            key: &str,
            now_ms: u64,
            window_ms: u64,
            member: &str,
        ) -> Result<u64, StoreError> {
            self.check()?;
            let mut tables = self.tables.lock().unwrap();
            let cutoff = now_ms.saturating_sub(window_ms);
            let window = tables.windows.entry(key.to_string()).or_default();
            window.retain(|(ts, _)| *ts > cutoff);
            window.push((now_ms, member.to_string()));
            Ok(window.len() as u64)
        }

        async fn discard_member(&self, key: &str, member: &str) -> Result<(), StoreError> {
            self.check()?;
            let mut tables = self.tables.lock().unwrap();
            if let Some(window) = tables.windows.get_mut(key) {
                window.retain(|(_, m)| m != member);
            }
            Ok(())
        }

        async fn count_in_window(
            &self,
            key: &str,
            now_ms: u64,
            window_ms: u64,
        ) -> Result<u64, StoreError> {
            self.check()?;
            let mut tables = self.tables.lock().unwrap();
            let cutoff = now_ms.saturating_sub(window_ms);
            let window = tables.windows.entry(key.to_string()).or_default();
            window.retain(|(ts, _)| *ts > cutoff);
            Ok(window.len() as u64)
        }

        async fn set_add(&self, key: &str, member: &str, _ttl: Duration) -> Result<(), StoreError> {
            self.check()?;
            let mut tables = self.tables.lock().unwrap();
            let set = tables.sets.entry(key.to_string()).or_default();
            if !set.iter().any(|m| m == member) {
                set.push(member.to_string());
            }
            Ok(())
        }

        async fn set_contains(&self, key: &str, member: &str) -> Result<bool, StoreError> {
            self.check()?;
            let tables = self.tables.lock().unwrap();
            Ok(tables
                .sets
                .get(key)
                .map(|s| s.iter().any(|m| m == member))
                .unwrap_or(false))
        }

        async fn set_len(&self, key: &str) -> Result<u64, StoreError> {
            self.check()?;
            let tables = self.tables.lock().unwrap();
            Ok(tables.sets.get(key).map(|s| s.len() as u64).unwrap_or(0))
        }

        async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), StoreError> {
            self.check()?;
            let mut tables = self.tables.lock().unwrap();
            let expires_at = now_millis() + ttl.as_millis() as u64;
            tables
                .values
                .insert(key.to_string(), (value.to_string(), expires_at));
            Ok(())
        }

        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.check()?;
            let mut tables = self.tables.lock().unwrap();
            match tables.values.get(key) {
                Some((value, expires_at)) if *expires_at > now_millis() => Ok(Some(value.clone())),
                Some(_) => {
                    tables.values.remove(key);
                    Ok(None)
                }
                None => Ok(None),
            }
        }

        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.check()?;
            let mut tables = self.tables.lock().unwrap();
            tables.values.remove(key);
            tables.windows.remove(key);
            tables.sets.remove(key);
            Ok(())
        }

        async fn append_event(
            &self,
            key: &str,
            ts_ms: u64,
            payload: &str,
            _retention: Duration,
        ) -> Result<(), StoreError> {
            self.check()?;
            let mut tables = self.tables.lock().unwrap();
            let window = tables.windows.entry(key.to_string()).or_default();
            window.push((ts_ms, payload.to_string()));
            window.sort_by_key(|(ts, _)| *ts);
            Ok(())
        }

        async fn window_events(
            &self,
            key: &str,
            now_ms: u64,
            window_ms: u64,
            limit: usize,
        ) -> Result<Vec<String>, StoreError> {
            self.check()?;
            let mut tables = self.tables.lock().unwrap();
            let cutoff = now_ms.saturating_sub(window_ms);
            let window = tables.windows.entry(key.to_string()).or_default();
            window.retain(|(ts, _)| *ts > cutoff);
            Ok(window
                .iter()
                .take(limit)
                .map(|(_, payload)| payload.clone())
                .collect())
        }
    }

    #[tokio::test]
    async fn test_window_prunes_old_entries() {
        let store = MemoryCounterStore::new();
        let count = store.record_in_window("w", 1_000, 500, "a").await.unwrap();
        assert_eq!(count, 1);
        let count = store.record_in_window("w", 1_200, 500, "b").await.unwrap();
        assert_eq!(count, 2);
        // First entry falls out of the window
        let count = store.record_in_window("w", 1_600, 500, "c").await.unwrap();
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn test_discard_member_gives_back_slot() {
        let store = MemoryCounterStore::new();
        store.record_in_window("w", 1_000, 500, "a").await.unwrap();
        store.record_in_window("w", 1_001, 500, "b").await.unwrap();
        store.discard_member("w", "b").await.unwrap();
        let count = store.count_in_window("w", 1_002, 500).await.unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_injected_failure_surfaces_as_unavailable() {
        let store = MemoryCounterStore::new();
        store.set_unavailable(true);
        let result = store.count_in_window("w", 1_000, 500).await;
        assert!(matches!(result, Err(StoreError::Unavailable(_))));
    }
}
