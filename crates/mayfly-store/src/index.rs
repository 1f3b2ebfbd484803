//! IP→id index maintenance.
//!
//! The main `remove()` path deletes index rows synchronously; this
//! subscriber exists to close the gaps — crashes between writes, and records
//! that self-expired via TTL where the only delete was the implicit one.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::{AllocationEvent, Result, StateStore};

/// Long-lived subscriber to the allocation change feed that keeps the
/// `lookup/<ip>` rows converged with the primary records.
pub struct IndexMaintainer {
    task: JoinHandle<()>,
}

impl IndexMaintainer {
    /// Subscribe and start maintaining. The task runs until [`stop`] or
    /// until the store's feed ends.
    ///
    /// [`stop`]: IndexMaintainer::stop
    pub async fn spawn(store: Arc<dyn StateStore>) -> Result<Self> {
        let mut watch = store.watch_allocations().await?;
        let task = tokio::spawn(async move {
            while let Some(event) = watch.recv().await {
                match event {
                    AllocationEvent::Created(allocation)
                    | AllocationEvent::Modified(allocation) => {
                        let Some(lease) = &allocation.lease else {
                            continue;
                        };
                        if let Err(e) = store.index_ip(lease.fixed_address, allocation.id).await {
                            warn!(
                                ip = %lease.fixed_address,
                                id = %allocation.id,
                                error = %e,
                                "failed to update IP lookup row"
                            );
                        }
                    }
                    AllocationEvent::Deleted(allocation) => {
                        let Some(lease) = &allocation.lease else {
                            continue;
                        };
                        if let Err(e) = store.unindex_ip(lease.fixed_address).await {
                            warn!(
                                ip = %lease.fixed_address,
                                error = %e,
                                "failed to delete IP lookup row"
                            );
                        }
                    }
                }
            }
            debug!("index maintainer feed ended");
        });
        Ok(Self { task })
    }

    /// Stop maintaining. Dropping the task also drops its watch, which
    /// cancels the underlying feed.
    pub fn stop(self) {
        self.task.abort();
    }
}
