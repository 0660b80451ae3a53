// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// Bounded in-memory greeter store; the oldest records are evicted first.

use std::collections::BTreeMap;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::domain::greeter::Greeter;

use super::GreeterRepository;

/// Records kept by [`InMemoryGreeterRepository::new`].
pub const DEFAULT_CAPACITY: usize = 1024;

pub struct InMemoryGreeterRepository {
    capacity: usize,
    inner: RwLock<Store>,
}

#[derive(Default)]
struct Store {
    next_id: i64,
    greeters: BTreeMap<i64, Greeter>,
}

impl Default for InMemoryGreeterRepository {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl InMemoryGreeterRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keeps at most `capacity` greeters (minimum one); saving beyond that
    /// evicts the lowest ids.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: RwLock::new(Store::default()),
        }
    }
}

#[async_trait]
impl GreeterRepository for InMemoryGreeterRepository {
    async fn save(&self, mut greeter: Greeter) -> Result<Greeter> {
        let mut guard = self.inner.write().await;
        guard.next_id += 1;

        let now = Utc::now();
        greeter.id = guard.next_id;
        greeter.created_at = now;
        greeter.updated_at = now;
        guard.greeters.insert(greeter.id, greeter.clone());

        while guard.greeters.len() > self.capacity {
            guard.greeters.pop_first();
        }

        Ok(greeter)
    }

    async fn update(&self, mut greeter: Greeter) -> Result<Greeter> {
        let mut guard = self.inner.write().await;
        let Some(existing) = guard.greeters.get(&greeter.id) else {
            bail!("greeter {} not found", greeter.id);
        };

        greeter.created_at = existing.created_at;
        greeter.updated_at = Utc::now();
        guard.greeters.insert(greeter.id, greeter.clone());

        Ok(greeter)
    }

    async fn find_by_id(&self, id: i64) -> Result<Option<Greeter>> {
        let guard = self.inner.read().await;
        Ok(guard.greeters.get(&id).cloned())
    }

    async fn list_by_hello(&self, hello: &str) -> Result<Vec<Greeter>> {
        let guard = self.inner.read().await;
        Ok(guard
            .greeters
            .values()
            .filter(|greeter| greeter.hello == hello)
            .cloned()
            .collect())
    }

    async fn list_all(&self) -> Result<Vec<Greeter>> {
        let guard = self.inner.read().await;
        Ok(guard.greeters.values().cloned().collect())
    }
}
