//! Process-local rate limit counters

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{RateLimitStore, WindowState};
use crate::error::SharedResult;

/// Hard cap on tracked keys so unique spoofed identifiers cannot exhaust memory
const MAX_TRACKED_KEYS: usize = 100_000;

#[derive(Debug)]
struct Window {
    length: Duration,
    hits: VecDeque<Instant>,
}

impl Window {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.hits.front() {
            if now.duration_since(*oldest) >= self.length {
                self.hits.pop_front();
            } else {
                break;
            }
        }
    }

    fn state(&self, now: Instant, admitted: bool) -> WindowState {
        WindowState {
            count: self.hits.len() as u32,
            admitted,
            oldest_expires_in: self
                .hits
                .front()
                .map(|oldest| self.length.saturating_sub(now.duration_since(*oldest))),
        }
    }
}

/// In-memory sliding-window log keyed by limiter key
#[derive(Debug, Default)]
pub struct InMemoryRateLimitStore {
    windows: Mutex<HashMap<String, Window>>,
}

impl InMemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys currently tracked
    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.len()
    }
}

#[async_trait]
impl RateLimitStore for InMemoryRateLimitStore {
    async fn get(&self, key: &str, window: Duration) -> SharedResult<WindowState> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        Ok(match windows.get_mut(key) {
            Some(entry) => {
                entry.length = window;
                entry.prune(now);
                entry.state(now, false)
            }
            None => WindowState {
                count: 0,
                admitted: false,
                oldest_expires_in: None,
            },
        })
    }

    async fn increment(&self, key: &str, window: Duration, max: u32) -> SharedResult<WindowState> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;

        if windows.len() >= MAX_TRACKED_KEYS && !windows.contains_key(key) {
            windows.retain(|_, entry| {
                entry.prune(now);
                !entry.hits.is_empty()
            });
        }

        let entry = windows.entry(key.to_string()).or_insert_with(|| Window {
            length: window,
            hits: VecDeque::new(),
        });
        entry.length = window;
        entry.prune(now);

        if (entry.hits.len() as u32) < max {
            entry.hits.push_back(now);
            Ok(entry.state(now, true))
        } else {
            Ok(entry.state(now, false))
        }
    }

    async fn sweep(&self) -> SharedResult<usize> {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|_, entry| {
            entry.prune(now);
            !entry.hits.is_empty()
        });
        Ok(before - windows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_increment_stops_at_max() {
        let store = InMemoryRateLimitStore::new();
        let window = Duration::from_secs(60);

        for expected in 1..=3 {
            let state = store.increment("k", window, 3).await.unwrap();
            assert!(state.admitted);
            assert_eq!(state.count, expected);
        }

        let state = store.increment("k", window, 3).await.unwrap();
        assert!(!state.admitted);
        assert_eq!(state.count, 3);
        assert!(state.oldest_expires_in.unwrap() <= window);
    }

    #[tokio::test]
    async fn test_get_does_not_record() {
        let store = InMemoryRateLimitStore::new();
        let window = Duration::from_secs(60);
        store.increment("k", window, 5).await.unwrap();

        let state = store.get("k", window).await.unwrap();
        assert_eq!(state.count, 1);
        let state = store.get("k", window).await.unwrap();
        assert_eq!(state.count, 1);
        assert_eq!(store.get("missing", window).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_sweep_removes_only_expired_keys() {
        let store = InMemoryRateLimitStore::new();
        store
            .increment("short", Duration::from_millis(10), 5)
            .await
            .unwrap();
        store
            .increment("long", Duration::from_secs(60), 5)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;

        let removed = store.sweep().await.unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.tracked_keys().await, 1);
        assert_eq!(store.get("long", Duration::from_secs(60)).await.unwrap().count, 1);
    }

    #[tokio::test]
    async fn test_concurrent_increments_respect_max() {
        use std::sync::Arc;

        let store = Arc::new(InMemoryRateLimitStore::new());
        let window = Duration::from_secs(60);
        let mut handles = Vec::new();

        for _ in 0..20 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.increment("shared", window, 7).await.unwrap().admitted
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 7);
    }
}
