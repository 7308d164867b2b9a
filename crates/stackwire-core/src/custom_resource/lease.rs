//! Per-resource mutual exclusion for lifecycle transitions.
//!
//! At most one transition may be in flight for a given custom resource.
//! A [`Lease`] holds the resource's lock and records the transient state
//! (`Creating`, `Updating`, `Deleting`) while it is alive; dropping the lease
//! clears the transient state and releases the lock. A lock entry is
//! dropped from the table once no lease holds it and nobody waits on it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;

use super::controller::LifecycleState;
use super::error::TransitionError;

#[derive(Debug, Default)]
pub struct LeaseTable {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    transient: Mutex<HashMap<String, LifecycleState>>,
}

pub struct Lease {
    table: Arc<LeaseTable>,
    address: String,
    _guard: OwnedMutexGuard<()>,
}

impl LeaseTable {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Wait up to `wait` for exclusive access to `address`.
    pub async fn acquire(
        table: &Arc<Self>,
        address: &str,
        wait: Duration,
    ) -> Result<Lease, TransitionError> {
        let lock = {
            let mut locks = table.locks.lock().unwrap();
            Arc::clone(locks.entry(address.to_string()).or_default())
        };
        let guard = match tokio::time::timeout(wait, Arc::clone(&lock).lock_owned()).await {
            Ok(guard) => guard,
            Err(_) => {
                // The table's copy and ours
                table.prune(address, &lock, 2);
                return Err(TransitionError::LeaseTimeout {
                    address: address.to_string(),
                    waited_ms: wait.as_millis() as u64,
                });
            }
        };
        Ok(Lease {
            table: Arc::clone(table),
            address: address.to_string(),
            _guard: guard,
        })
    }

    /// Remove `address` from the table when `lock` has no other users
    /// than the `owners` references the caller knows about.
    fn prune(&self, address: &str, lock: &Arc<tokio::sync::Mutex<()>>, owners: usize) {
        let Ok(mut locks) = self.locks.lock() else {
            return;
        };
        let unshared = locks
            .get(address)
            .is_some_and(|held| Arc::ptr_eq(held, lock) && Arc::strong_count(lock) <= owners);
        if unshared {
            locks.remove(address);
        }
    }

    /// Transient state of an in-flight transition, if any.
    pub fn transient_state(&self, address: &str) -> Option<LifecycleState> {
        self.transient.lock().unwrap().get(address).copied()
    }
}

impl Lease {
    pub fn enter(&self, state: LifecycleState) {
        self.table
            .transient
            .lock()
            .unwrap()
            .insert(self.address.clone(), state);
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Ok(mut transient) = self.table.transient.lock() {
            transient.remove(&self.address);
        }
        // The table's copy and the guard's
        let lock = Arc::clone(OwnedMutexGuard::mutex(&self._guard));
        self.table.prune(&self.address, &lock, 3);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_lease_waits_for_first() {
        let table = LeaseTable::new();
        let lease = LeaseTable::acquire(&table, "app/c", Duration::from_millis(50))
            .await
            .unwrap();
        lease.enter(LifecycleState::Creating);
        assert_eq!(
            table.transient_state("app/c"),
            Some(LifecycleState::Creating)
        );

        let err = LeaseTable::acquire(&table, "app/c", Duration::from_millis(20))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransitionError::LeaseTimeout { .. }));

        drop(lease);
        assert_eq!(table.transient_state("app/c"), None);
        assert!(LeaseTable::acquire(&table, "app/c", Duration::from_millis(20))
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn released_leases_leave_no_entries_behind() {
        let table = LeaseTable::new();
        let first = LeaseTable::acquire(&table, "app/a", Duration::from_millis(20))
            .await
            .unwrap();
        let _other = LeaseTable::acquire(&table, "app/b", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(LeaseTable::acquire(&table, "app/a", Duration::from_millis(10))
            .await
            .is_err());
        assert_eq!(table.locks.lock().unwrap().len(), 2);

        drop(first);
        assert_eq!(
            table.locks.lock().unwrap().keys().cloned().collect::<Vec<_>>(),
            vec!["app/b".to_string()]
        );

        // A fresh lease on a pruned address still excludes a second one.
        let again = LeaseTable::acquire(&table, "app/a", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(LeaseTable::acquire(&table, "app/a", Duration::from_millis(10))
            .await
            .is_err());
        drop(again);
        assert_eq!(table.locks.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn waiter_keeps_the_entry_until_it_is_served() {
        let table = LeaseTable::new();
        let held = LeaseTable::acquire(&table, "app/c", Duration::from_millis(20))
            .await
            .unwrap();
        let waiter = {
            let table = Arc::clone(&table);
            tokio::spawn(async move {
                LeaseTable::acquire(&table, "app/c", Duration::from_secs(2))
                    .await
                    .map(|lease| lease.address().to_string())
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        assert_eq!(waiter.await.unwrap().unwrap(), "app/c");
        assert!(table.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn distinct_addresses_do_not_contend() {
        let table = LeaseTable::new();
        let _a = LeaseTable::acquire(&table, "app/a", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(LeaseTable::acquire(&table, "app/b", Duration::from_millis(20))
            .await
            .is_ok());
    }
}
