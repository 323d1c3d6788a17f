use std::collections::HashSet;
use std::net::TcpListener;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::db::DbHandle;
use crate::errors::{EngineError, EngineResult};
use crate::models::PortAllocation;

/// Assigns TCP ports to preview processes.
///
/// A port is free when no allocation row holds it and it can be bound on
/// both loopback and the wildcard address. Check-then-reserve runs under an
/// allocator mutex and the table's primary key rejects double reservation.
pub struct PortAllocator {
    db: DbHandle,
    range_start: u16,
    range_end: u16,
    lock: Mutex<()>,
}

impl PortAllocator {
    pub fn new(db: DbHandle, range_start: u16, range_end: u16) -> Self {
        Self {
            db,
            range_start,
            range_end,
            lock: Mutex::new(()),
        }
    }

    /// Reserve `preferred` if it is free, otherwise the lowest free port in
    /// the configured range.
    pub async fn allocate_port(&self, preview_id: &str, preferred: Option<u16>) -> EngineResult<u16> {
        if preview_id.trim().is_empty() {
            return Err(EngineError::validation("preview_id", "must not be empty"));
        }
        let _guard = self.lock.lock().await;

        let mut candidates: Vec<u16> = Vec::new();
        if let Some(port) = preferred.filter(|p| *p > 0) {
            candidates.push(port);
        }
        candidates.extend((self.range_start..=self.range_end).filter(|p| Some(*p) != preferred));

        let owner = preview_id.to_string();
        let allocated = self
            .db
            .call(move |db| {
                let taken: HashSet<u16> = db
                    .list_port_allocations()?
                    .into_iter()
                    .map(|a| a.port)
                    .collect();
                for port in candidates {
                    if taken.contains(&port) || !is_port_available(port) {
                        continue;
                    }
                    if db.insert_port_allocation(port, &owner)? {
                        return Ok(Some(port));
                    }
                }
                Ok(None)
            })
            .await
            .map_err(EngineError::Database)?;

        match allocated {
            Some(port) => {
                info!(port, preview_id, "port allocated");
                Ok(port)
            }
            None => Err(EngineError::ResourceExhausted("no available ports".to_string())),
        }
    }

    /// Release a port. Releasing an unallocated port is a no-op.
    pub async fn release_port(&self, port: u16) -> EngineResult<bool> {
        let released = self
            .db
            .call(move |db| db.delete_port_allocation(port))
            .await
            .map_err(EngineError::Database)?;
        if released {
            debug!(port, "port released");
        }
        Ok(released)
    }

    pub async fn release_ports_by_preview_id(&self, preview_id: &str) -> EngineResult<usize> {
        let owner = preview_id.to_string();
        self.db
            .call(move |db| db.delete_port_allocations_for_preview(&owner))
            .await
            .map_err(EngineError::Database)
    }

    /// Drop allocations whose preview is gone or no longer running.
    pub async fn cleanup_stale_allocations(&self) -> EngineResult<usize> {
        let _guard = self.lock.lock().await;
        let removed = self
            .db
            .call(|db| {
                let stale = db.list_stale_port_allocations()?;
                let mut removed = 0;
                for allocation in stale {
                    if db.delete_port_allocation(allocation.port)? {
                        removed += 1;
                    }
                }
                Ok(removed)
            })
            .await
            .map_err(EngineError::Database)?;
        if removed > 0 {
            info!(removed, "stale port allocations removed");
        }
        Ok(removed)
    }

    pub async fn list_allocations(&self) -> EngineResult<Vec<PortAllocation>> {
        self.db
            .call(|db| db.list_port_allocations())
            .await
            .map_err(EngineError::Database)
    }
}

/// Whether `port` can be bound on both `127.0.0.1` and `0.0.0.0` right now.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok() && TcpListener::bind(("0.0.0.0", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A contiguous range the OS just handed out, so it is very likely free.
    fn free_range(len: u16) -> (u16, u16) {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let start = listener.local_addr().unwrap().port();
        drop(listener);
        let start = start.min(u16::MAX - len);
        (start, start + len)
    }

    #[tokio::test]
    async fn test_allocate_preferred_port() {
        let (start, end) = free_range(20);
        let allocator = PortAllocator::new(DbHandle::in_memory().unwrap(), start, end);
        let port = allocator.allocate_port("p1", Some(start + 5)).await.unwrap();
        assert_eq!(port, start + 5);
    }

    #[tokio::test]
    async fn test_bound_port_is_skipped() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();
        let end = busy.saturating_add(20);
        let allocator = PortAllocator::new(DbHandle::in_memory().unwrap(), busy, end);

        let port = allocator.allocate_port("p1", Some(busy)).await.unwrap();
        assert_ne!(port, busy);
        assert!(port > busy && port <= end);
        drop(listener);
    }

    #[tokio::test]
    async fn test_allocated_port_is_not_reused() {
        let (start, end) = free_range(20);
        let allocator = PortAllocator::new(DbHandle::in_memory().unwrap(), start, end);
        let a = allocator.allocate_port("p1", Some(start)).await.unwrap();
        let b = allocator.allocate_port("p2", Some(start)).await.unwrap();
        assert_ne!(a, b);

        assert!(allocator.release_port(a).await.unwrap());
        assert!(!allocator.release_port(a).await.unwrap());
        let c = allocator.allocate_port("p3", Some(start)).await.unwrap();
        assert_eq!(c, a);
    }

    #[tokio::test]
    async fn test_concurrent_allocations_are_unique() {
        let (start, end) = free_range(40);
        let allocator = std::sync::Arc::new(PortAllocator::new(
            DbHandle::in_memory().unwrap(),
            start,
            end,
        ));
        let mut handles = Vec::new();
        for i in 0..10 {
            let allocator = allocator.clone();
            handles.push(tokio::spawn(async move {
                allocator.allocate_port(&format!("p{}", i), None).await
            }));
        }
        let mut ports = HashSet::new();
        for handle in handles {
            assert!(ports.insert(handle.await.unwrap().unwrap()));
        }
        assert_eq!(ports.len(), 10);
    }

    #[tokio::test]
    async fn test_exhausted_range() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();
        let allocator = PortAllocator::new(DbHandle::in_memory().unwrap(), busy, busy);
        let err = allocator.allocate_port("p1", None).await.unwrap_err();
        assert!(matches!(err, EngineError::ResourceExhausted(ref m) if m == "no available ports"));
        drop(listener);
    }

    #[tokio::test]
    async fn test_release_by_preview_and_stale_cleanup() {
        let (start, end) = free_range(20);
        let db = DbHandle::in_memory().unwrap();
        let allocator = PortAllocator::new(db.clone(), start, end);
        {
            let db = db.lock_sync().unwrap();
            db.create_preview("live", "r1", None).unwrap();
        }
        allocator.allocate_port("live", None).await.unwrap();
        allocator.allocate_port("ghost", None).await.unwrap();
        allocator.allocate_port("ghost", None).await.unwrap();

        assert_eq!(allocator.cleanup_stale_allocations().await.unwrap(), 2);
        let remaining = allocator.list_allocations().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].preview_id, "live");

        assert_eq!(allocator.release_ports_by_preview_id("live").await.unwrap(), 1);
        assert_eq!(allocator.release_ports_by_preview_id("live").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_empty_preview_id_rejected() {
        let allocator = PortAllocator::new(DbHandle::in_memory().unwrap(), 40000, 40010);
        assert!(matches!(
            allocator.allocate_port(" ", None).await,
            Err(EngineError::Validation { .. })
        ));
    }
}
