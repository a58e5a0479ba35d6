//! Bounds simultaneous provider calls.
//!
//! tokio's `Semaphore` hands out permits in FIFO order, which is what keeps
//! acquisition fair within a priority class. Permits are released on drop.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::ai_queue::error::AiError;

/// A held slot. Dropping it (or calling `release`) frees the slot.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyPermit {
    pub fn release(self) {}
}

pub struct ConcurrencyLimiter {
    max_concurrent: usize,
    global: Arc<Semaphore>,
    per_provider: HashMap<String, Arc<Semaphore>>,
}

impl ConcurrencyLimiter {
    /// `per_provider_limit` adds a secondary ceiling for each named provider.
    pub fn new<I, S>(max_concurrent: usize, per_provider_limit: Option<usize>, providers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let per_provider = match per_provider_limit {
            Some(limit) => providers
                .into_iter()
                .map(|name| (name.into(), Arc::new(Semaphore::new(limit.max(1)))))
                .collect(),
            None => HashMap::new(),
        };
        let max_concurrent = max_concurrent.max(1);
        Self {
            max_concurrent,
            global: Arc::new(Semaphore::new(max_concurrent)),
            per_provider,
        }
    }

    /// Wait for a global slot.
    pub async fn acquire(&self) -> Result<ConcurrencyPermit, AiError> {
        let permit = Arc::clone(&self.global)
            .acquire_owned()
            .await
            .map_err(|_| AiError::ShuttingDown)?;
        Ok(ConcurrencyPermit { _permit: permit })
    }

    /// Wait for a slot on `provider`. Providers without their own ceiling
    /// return `None` immediately.
    pub async fn acquire_provider(&self, provider: &str) -> Result<Option<ConcurrencyPermit>, AiError> {
        let Some(semaphore) = self.per_provider.get(provider) else {
            return Ok(None);
        };
        let permit = Arc::clone(semaphore)
            .acquire_owned()
            .await
            .map_err(|_| AiError::ShuttingDown)?;
        Ok(Some(ConcurrencyPermit { _permit: permit }))
    }

    pub fn available(&self) -> usize {
        self.global.available_permits()
    }

    pub fn in_use(&self) -> usize {
        self.max_concurrent - self.available()
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Wake every waiter with an error; used once the queue has stopped.
    pub fn close(&self) {
        self.global.close();
        for semaphore in self.per_provider.values() {
            semaphore.close();
        }
    }
}
