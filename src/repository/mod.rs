// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// Greeter persistence contract shared by the use case and its stores.

pub mod in_memory;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::greeter::Greeter;

#[async_trait]
pub trait GreeterRepository: Send + Sync {
    /// Stores a new greeter and returns it with its assigned id.
    async fn save(&self, greeter: Greeter) -> Result<Greeter>;

    async fn update(&self, greeter: Greeter) -> Result<Greeter>;

    async fn find_by_id(&self, id: i64) -> Result<Option<Greeter>>;

    async fn list_by_hello(&self, hello: &str) -> Result<Vec<Greeter>>;

    async fn list_all(&self) -> Result<Vec<Greeter>>;
}

pub type GreeterRepositoryHandle = Arc<dyn GreeterRepository>;
