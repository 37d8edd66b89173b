//! In-memory token store for tests and single-process runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::TokenStore;
use crate::error::{Error, Result};

/// Counters in a mutex-guarded map.
///
/// `set_available(false)` makes every call fail with `StoreUnavailable`, the
/// way an unreachable shared store would.
#[derive(Default)]
pub struct InMemoryTokenStore {
    counters: Mutex<HashMap<String, i64>>,
    unavailable: AtomicBool,
}

impl InMemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(Error::StoreUnavailable("token store offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn get(&self, key: &str) -> Result<Option<i64>> {
        self.check()?;
        Ok(self.counters.lock().get(key).copied())
    }

    async fn set_if_absent(&self, key: &str, value: i64) -> Result<bool> {
        self.check()?;
        let mut counters = self.counters.lock();
        if counters.contains_key(key) {
            return Ok(false);
        }
        counters.insert(key.to_string(), value);
        Ok(true)
    }

    async fn compare_and_swap(&self, key: &str, expected: i64, new: i64) -> Result<bool> {
        self.check()?;
        let mut counters = self.counters.lock();
        match counters.get_mut(key) {
            Some(value) if *value == expected => {
                *value = new;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        self.check()?;
        let mut counters = self.counters.lock();
        let value = counters.entry(key.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    async fn set(&self, key: &str, value: i64) -> Result<Option<i64>> {
        self.check()?;
        Ok(self.counters.lock().insert(key.to_string(), value))
    }
}
