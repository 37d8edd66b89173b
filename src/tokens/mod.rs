//! Cluster-wide admission control: a counting semaphore over a shared store.
//!
//! One integer counter at a well-known key bounds how many job bodies run at
//! once across every worker process. All mutation goes through
//! [`TokenPool`]; nobody else reads-then-writes the counter.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use opentelemetry::KeyValue;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::telemetry::metrics;

pub use memory::InMemoryTokenStore;

/// Key of the one global counter.
pub const DEFAULT_TOKEN_KEY: &str = "global:processing_tokens";

/// Compare-and-swap attempts before `try_acquire` reports contention.
pub const DEFAULT_MAX_CAS_RETRIES: u32 = 64;

/// Bytes of available memory backing one token.
const BYTES_PER_TOKEN: u64 = 2 * 1024 * 1024 * 1024;

/// A shared store holding integer counters with an atomic compare-and-swap.
///
/// Implementations fail with [`Error::StoreUnavailable`] when the backing
/// store cannot be reached.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Current value, `None` if the key was never set.
    async fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Set `key` to `value` only if it doesn't exist. Returns true if set.
    async fn set_if_absent(&self, key: &str, value: i64) -> Result<bool>;

    /// Write `new` only if the value is still `expected`. Returns true on success.
    async fn compare_and_swap(&self, key: &str, expected: i64, new: i64) -> Result<bool>;

    /// Atomically add one, creating the key at 1 if missing. Returns the new value.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Overwrite unconditionally. Returns the previous value.
    async fn set(&self, key: &str, value: i64) -> Result<Option<i64>>;
}

/// Capacity hint from a snapshot of available memory: one token per 2 GiB,
/// never less than one.
pub fn capacity_from_available_memory() -> i64 {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    capacity_for_bytes(system.available_memory())
}

fn capacity_for_bytes(available: u64) -> i64 {
    ((available / BYTES_PER_TOKEN) as i64).max(1)
}

/// The cluster-wide token pool.
#[derive(Clone)]
pub struct TokenPool {
    store: Arc<dyn TokenStore>,
    key: Arc<str>,
    max_cas_retries: u32,
}

impl TokenPool {
    pub fn new(store: Arc<dyn TokenStore>) -> Self {
        Self::with_key(store, DEFAULT_TOKEN_KEY)
    }

    pub fn with_key(store: Arc<dyn TokenStore>, key: &str) -> Self {
        Self {
            store,
            key: Arc::from(key),
            max_cas_retries: DEFAULT_MAX_CAS_RETRIES,
        }
    }

    pub fn max_cas_retries(mut self, n: u32) -> Self {
        self.max_cas_retries = n.max(1);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Seed the counter with `max(1, capacity_hint)` unless it already exists.
    ///
    /// Safe to call from every process at startup: a late-joining instance
    /// never resets a live pool. Returns the value now in the store.
    pub async fn initialize(&self, capacity_hint: i64) -> Result<i64> {
        let capacity = capacity_hint.max(1);
        if self.store.set_if_absent(&self.key, capacity).await? {
            info!(key = %self.key, tokens = capacity, "token pool initialized");
            return Ok(capacity);
        }
        let current = self.store.get(&self.key).await?.unwrap_or(0);
        info!(
            key = %self.key,
            tokens = current,
            capacity_hint,
            "token pool already exists, leaving it untouched"
        );
        Ok(current)
    }

    /// Take one token if the counter is strictly positive.
    ///
    /// Returns `Ok(false)` only when a consistent read showed the pool
    /// exhausted; concurrent modification restarts the loop from the read.
    pub async fn try_acquire(&self) -> Result<bool> {
        for attempt in 1..=self.max_cas_retries {
            let tokens = self.store.get(&self.key).await?.unwrap_or(0);
            if tokens <= 0 {
                metrics::token_operations().add(1, &[KeyValue::new("operation", "denied")]);
                return Ok(false);
            }
            if self
                .store
                .compare_and_swap(&self.key, tokens, tokens - 1)
                .await?
            {
                debug!(key = %self.key, remaining = tokens - 1, "token acquired");
                metrics::token_operations().add(1, &[KeyValue::new("operation", "acquired")]);
                return Ok(true);
            }
            debug!(key = %self.key, attempt, "token counter changed under us, retrying");
            metrics::token_operations().add(1, &[KeyValue::new("operation", "conflict")]);
        }
        warn!(key = %self.key, attempts = self.max_cas_retries, "token acquisition gave up on contention");
        Err(Error::Contention(self.max_cas_retries))
    }

    /// Scoped acquisition: the returned token gives its unit back when
    /// released, or when dropped on any other exit path.
    pub async fn try_acquire_token(&self) -> Result<Option<AdmissionToken>> {
        if self.try_acquire().await? {
            Ok(Some(AdmissionToken {
                pool: self.clone(),
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Give one token back.
    pub async fn release(&self) -> Result<()> {
        let tokens = self.store.increment(&self.key).await?;
        debug!(key = %self.key, available = tokens, "token released");
        metrics::token_operations().add(1, &[KeyValue::new("operation", "released")]);
        Ok(())
    }

    /// Tokens currently available.
    pub async fn available(&self) -> Result<i64> {
        Ok(self.store.get(&self.key).await?.unwrap_or(0))
    }

    /// Re-seed the counter, restoring capacity lost to crashed holders.
    ///
    /// Only safe while no job bodies are running; otherwise their releases
    /// push the counter above `capacity`.
    pub async fn reset(&self, capacity: i64) -> Result<i64> {
        let capacity = capacity.max(1);
        let previous = self.store.set(&self.key, capacity).await?;
        warn!(key = %self.key, ?previous, tokens = capacity, "token pool reset");
        Ok(capacity)
    }
}

/// One held admission token.
///
/// Call [`AdmissionToken::release`] on the normal path. Dropping it unreleased
/// (panic, early return) spawns the release on the current Tokio runtime.
#[must_use = "a token that is neither released nor held gives its unit back immediately"]
pub struct AdmissionToken {
    pool: TokenPool,
    released: bool,
}

impl AdmissionToken {
    /// Give the token back. A failure here means the unit is leaked until the
    /// pool is reset.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        let result = self.pool.release().await;
        if let Err(ref e) = result {
            error!(key = %self.pool.key, error = %e, "token release failed, capacity leaked");
            metrics::token_operations().add(1, &[KeyValue::new("operation", "leaked")]);
        }
        result
    }
}

impl Drop for AdmissionToken {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let pool = self.pool.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = pool.release().await {
                        error!(key = %pool.key, error = %e, "token release failed, capacity leaked");
                        metrics::token_operations()
                            .add(1, &[KeyValue::new("operation", "leaked")]);
                    }
                });
            }
            Err(_) => {
                error!(key = %pool.key, "token dropped outside a runtime, capacity leaked");
                metrics::token_operations().add(1, &[KeyValue::new("operation", "leaked")]);
            }
        }
    }
}
