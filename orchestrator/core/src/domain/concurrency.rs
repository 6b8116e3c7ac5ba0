// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Global run slots.
//!
//! Every running agent holds one permit of a process-wide semaphore. A parent
//! that blocks on delegated children gives its permit back for the duration of
//! the wait, so a full tree of waiting parents cannot starve its own children.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::{AcquireError, Mutex, OwnedSemaphorePermit, Semaphore};

#[derive(Clone)]
pub struct RunSlot {
    semaphore: Arc<Semaphore>,
    permit: Arc<Mutex<Option<OwnedSemaphorePermit>>>,
}

impl RunSlot {
    pub async fn acquire(semaphore: Arc<Semaphore>) -> Result<Self, AcquireError> {
        let permit = semaphore.clone().acquire_owned().await?;
        Ok(Self {
            semaphore,
            permit: Arc::new(Mutex::new(Some(permit))),
        })
    }

    /// Release the permit while `fut` runs and take one back afterwards.
    pub async fn suspend<F: Future>(&self, fut: F) -> F::Output {
        drop(self.permit.lock().await.take());
        let output = fut.await;
        if let Ok(permit) = self.semaphore.clone().acquire_owned().await {
            *self.permit.lock().await = Some(permit);
        }
        output
    }

    pub async fn is_held(&self) -> bool {
        self.permit.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_suspend_frees_the_permit_for_others() {
        let semaphore = Arc::new(Semaphore::new(1));
        let parent = RunSlot::acquire(semaphore.clone()).await.unwrap();
        assert_eq!(semaphore.available_permits(), 0);

        let child_semaphore = semaphore.clone();
        let child_ran = parent
            .suspend(async move {
                let child = RunSlot::acquire(child_semaphore).await.unwrap();
                child.is_held().await
            })
            .await;

        assert!(child_ran);
        assert!(parent.is_held().await);
        assert_eq!(semaphore.available_permits(), 0);

        drop(parent);
        assert_eq!(semaphore.available_permits(), 1);
    }
}
