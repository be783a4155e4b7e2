//! Per-instance leases.
//!
//! Every mutation of an instance runs while holding that instance's lease,
//! so steps of one instance are strictly serialized while different
//! instances proceed concurrently.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

/// Grants exclusive per-instance leases.
#[derive(Debug, Default)]
pub struct LeaseManager {
    leases: DashMap<Uuid, Arc<Mutex<()>>>,
}

/// Held while an instance is being mutated. Dropping it releases the lease.
#[derive(Debug)]
pub struct Lease {
    instance_id: Uuid,
    _guard: OwnedMutexGuard<()>,
}

impl Lease {
    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }
}

impl LeaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, instance_id: Uuid) -> Arc<Mutex<()>> {
        self.leases
            .entry(instance_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait for and take the lease for `instance_id`.
    pub async fn acquire(&self, instance_id: Uuid) -> Lease {
        let guard = self.slot(instance_id).lock_owned().await;
        tracing::trace!(instance_id = %instance_id, "lease acquired");
        Lease {
            instance_id,
            _guard: guard,
        }
    }

    /// Take the lease only if nobody holds it.
    pub fn try_acquire(&self, instance_id: Uuid) -> Option<Lease> {
        let guard = self.slot(instance_id).try_lock_owned().ok()?;
        Some(Lease {
            instance_id,
            _guard: guard,
        })
    }

    /// Drop lease slots nobody holds or waits on.
    pub fn release_idle(&self) {
        self.leases.retain(|_, slot| Arc::strong_count(slot) > 1);
    }

    /// Number of lease slots currently tracked.
    pub fn tracked(&self) -> usize {
        self.leases.len()
    }
}
