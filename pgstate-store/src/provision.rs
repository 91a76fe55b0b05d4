//! Memoized, mutually-exclusive provisioning of per-tenant database objects.
//!
//! The store runs at READ COMMITTED; without this gate, N concurrent first
//! writes against a new tenant would each race a `CREATE ... IF NOT EXISTS`
//! round-trip into the system catalogs. The gate collapses them to one
//! successful round-trip per distinct resource per process lifetime.
//! Cross-process, `IF NOT EXISTS` remains the correctness backstop.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::StoreError;

/// Process-wide create-if-absent gate, keyed by resource name.
///
/// Owned as a long-lived singleton by the process host and shared by every
/// service instance; provisioning futures are ephemeral and nothing keyed by
/// them is retained.
#[derive(Debug, Default)]
pub struct ResourceProvisioner {
    resources: Mutex<HashMap<String, Arc<tokio::sync::Mutex<bool>>>>,
}

impl ResourceProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `factory` exactly once per `resource_key` per process lifetime,
    /// on success. Concurrent callers for the same key wait for the first to
    /// finish and then return without running their factory; callers for
    /// distinct keys do not contend. A failed (or cancelled) factory is not
    /// memoized, so a later call retries.
    ///
    /// Returns whether this call performed the provisioning.
    pub async fn ensure<F, Fut>(&self, resource_key: &str, factory: F) -> Result<bool, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), StoreError>>,
    {
        let cell = {
            let mut resources = self.resources.lock();
            Arc::clone(resources.entry(resource_key.to_owned()).or_default())
        };

        let mut provisioned = cell.lock().await;
        if *provisioned {
            return Ok(false);
        }
        factory().await?;
        *provisioned = true;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn concurrent_callers_provision_once() {
        let provisioner = Arc::new(ResourceProvisioner::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let provisioner = Arc::clone(&provisioner);
                let calls = Arc::clone(&calls);
                tokio::spawn(async move {
                    provisioner
                        .ensure("T:public.state", || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(10)).await;
                            Ok(())
                        })
                        .await
                })
            })
            .collect();

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() {
                winners += 1;
            }
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn failure_is_not_memoized() {
        let provisioner = ResourceProvisioner::new();

        let err = provisioner
            .ensure("S:broken", || async {
                Err(StoreError::Internal("boom".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Internal(_)));

        // The next caller gets to retry, and its success is memoized.
        assert!(provisioner.ensure("S:broken", || async { Ok(()) }).await.unwrap());
        assert!(!provisioner.ensure("S:broken", || async { Ok(()) }).await.unwrap());
    }

    #[tokio::test]
    async fn distinct_keys_provision_independently() {
        let provisioner = ResourceProvisioner::new();
        assert!(provisioner.ensure("S:a", || async { Ok(()) }).await.unwrap());
        assert!(provisioner.ensure("S:b", || async { Ok(()) }).await.unwrap());
        assert!(!provisioner.ensure("S:a", || async { Ok(()) }).await.unwrap());
    }

    #[tokio::test]
    async fn cancelled_factory_is_retried() {
        let provisioner = Arc::new(ResourceProvisioner::new());

        let blocked = {
            let provisioner = Arc::clone(&provisioner);
            tokio::spawn(async move {
                provisioner
                    .ensure("T:slow", || async {
                        tokio::time::sleep(Duration::from_secs(60)).await;
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        blocked.abort();
        assert!(blocked.await.unwrap_err().is_cancelled());

        // The aborted attempt must not have been recorded as done.
        assert!(provisioner.ensure("T:slow", || async { Ok(()) }).await.unwrap());
    }
}
