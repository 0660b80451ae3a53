// Greeter is open-source under the Apache License 2.0; see LICENSE for usage and contributions.
// The greeting use case consumed by every transport.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::domain::greeter::Greeter;
use crate::repository::GreeterRepositoryHandle;

/// The business capability both transports adapt to. Implementations must
/// be safe to call concurrently; dropping the returned future cancels it.
#[async_trait]
pub trait GreeterService: Send + Sync {
    async fn say_hello(&self, name: &str) -> Result<String>;
}

pub type GreeterServiceHandle = Arc<dyn GreeterService>;

pub struct GreeterUsecase {
    repo: GreeterRepositoryHandle,
}

impl GreeterUsecase {
    pub fn new(repo: GreeterRepositoryHandle) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl GreeterService for GreeterUsecase {
    async fn say_hello(&self, name: &str) -> Result<String> {
        let greeter = self.repo.save(Greeter::new(name)).await?;
        tracing::debug!(id = greeter.id, hello = %greeter.hello, "greeter saved");
        Ok(greeter.greeting())
    }
}
