//! Idle/active bookkeeping.
//!
//! [`ConnectionRegistry`] is the authoritative record of which connections
//! are idle and which are on loan. It does no locking of its own: the pool
//! keeps it inside its single state mutex so every mutation, and every growth
//! decision made alongside it, happens in one critical section.

use std::collections::{HashSet, VecDeque};

use crate::lifecycle::{ConnectionId, ConnectionMetadata};
use crate::pool::PoolStatus;

/// A connection sitting in the idle queue.
pub(crate) struct IdleConnection<C> {
    pub(crate) meta: ConnectionMetadata,
    pub(crate) conn: C,
}

/// Partition of the pool's connections into idle and active.
///
/// Idle connections are owned here. Active connections are owned by the
/// caller holding the loan; only their ids are tracked. Connections lent to
/// the background probe stay on the idle side of the ledger.
pub(crate) struct ConnectionRegistry<C> {
    idle: VecDeque<IdleConnection<C>>,
    probing: HashSet<ConnectionId>,
    active: HashSet<ConnectionId>,
    max: u32,
    next_id: u64,
}

impl<C> ConnectionRegistry<C> {
    pub(crate) fn new(max: u32) -> Self {
        Self {
            idle: VecDeque::with_capacity(max as usize),
            probing: HashSet::new(),
            active: HashSet::with_capacity(max as usize),
            max,
            next_id: 1,
        }
    }

    /// Total number of connections the pool is accountable for.
    pub(crate) fn size(&self) -> u32 {
        (self.idle.len() + self.probing.len() + self.active.len()) as u32
    }

    pub(crate) fn max(&self) -> u32 {
        self.max
    }

    pub(crate) fn is_active(&self, id: ConnectionId) -> bool {
        self.active.contains(&id)
    }

    /// Take the longest-idle connection and mark it active.
    pub(crate) fn take_idle(&mut self) -> Option<(ConnectionMetadata, C)> {
        let IdleConnection { mut meta, conn } = self.idle.pop_front()?;
        meta.mark_checkout();
        self.active.insert(meta.id);
        Some((meta, conn))
    }

    /// Move an active connection back to idle.
    ///
    /// Hands the connection back if it is not on loan, which means the
    /// caller released it twice or released something foreign.
    pub(crate) fn put_idle(&mut self, mut meta: ConnectionMetadata, conn: C) -> Result<(), C> {
        if !self.active.remove(&meta.id) {
            return Err(conn);
        }
        meta.mark_checkin();
        self.idle.push_back(IdleConnection { meta, conn });
        Ok(())
    }

    /// Register a freshly opened connection as idle.
    ///
    /// Hands the connection back if the pool is already at its maximum size.
    pub(crate) fn add_new(&mut self, conn: C) -> Result<ConnectionId, C> {
        if self.size() >= self.max {
            return Err(conn);
        }
        let id = ConnectionId(self.next_id);
        self.next_id += 1;
        self.idle.push_back(IdleConnection {
            meta: ConnectionMetadata::new(id),
            conn,
        });
        Ok(id)
    }

    /// Forget an idle connection that failed its health check.
    ///
    /// Only connections lent to the probe can be removed; active connections
    /// are never evicted. The caller closes the handle it holds.
    pub(crate) fn remove_invalid(&mut self, id: ConnectionId) -> bool {
        self.probing.remove(&id)
    }

    /// Forget an active connection that is not coming back to idle.
    pub(crate) fn discard_active(&mut self, id: ConnectionId) -> bool {
        self.active.remove(&id)
    }

    /// Ids of the connections idle right now, oldest first.
    pub(crate) fn idle_ids(&self) -> Vec<ConnectionId> {
        self.idle.iter().map(|idle| idle.meta.id).collect()
    }

    /// Lend an idle connection to the health check.
    ///
    /// Returns `None` if the connection is no longer idle.
    pub(crate) fn begin_probe(&mut self, id: ConnectionId) -> Option<IdleConnection<C>> {
        let position = self.idle.iter().position(|idle| idle.meta.id == id)?;
        let idle = self.idle.remove(position)?;
        self.probing.insert(id);
        Some(idle)
    }

    /// Return a connection that passed its health check to the idle queue.
    pub(crate) fn finish_probe(&mut self, mut idle: IdleConnection<C>) {
        if self.probing.remove(&idle.meta.id) {
            idle.meta.mark_health_check();
            self.idle.push_back(idle);
        }
    }

    /// Remove every idle connection, leaving active loans in place.
    pub(crate) fn drain_idle(&mut self) -> Vec<C> {
        self.idle.drain(..).map(|idle| idle.conn).collect()
    }

    pub(crate) fn snapshot(&self) -> PoolStatus {
        PoolStatus {
            idle: (self.idle.len() + self.probing.len()) as u32,
            active: self.active.len() as u32,
            size: self.size(),
            max: self.max,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn registry_with(max: u32, count: u32) -> ConnectionRegistry<u32> {
        let mut registry = ConnectionRegistry::new(max);
        for n in 0..count {
            registry.add_new(n).unwrap();
        }
        registry
    }

    #[test]
    fn test_add_new_respects_max() {
        let mut registry = registry_with(2, 2);

        assert_eq!(registry.add_new(99), Err(99));
        assert_eq!(registry.size(), 2);
    }

    #[test]
    fn test_take_idle_is_fifo() {
        let mut registry = registry_with(3, 3);

        let (_, first) = registry.take_idle().unwrap();
        let (_, second) = registry.take_idle().unwrap();

        assert_eq!((first, second), (0, 1));
        let status = registry.snapshot();
        assert_eq!((status.idle, status.active, status.size), (1, 2, 3));
    }

    #[test]
    fn test_take_idle_empty() {
        let mut registry = registry_with(1, 0);

        assert!(registry.take_idle().is_none());
        assert_eq!(registry.snapshot().idle, 0);
    }

    #[test]
    fn test_put_idle_round_trip() {
        let mut registry = registry_with(1, 1);
        let (meta, conn) = registry.take_idle().unwrap();
        assert!(registry.is_active(meta.id));

        registry.put_idle(meta.clone(), conn).unwrap();

        assert!(!registry.is_active(meta.id));
        let status = registry.snapshot();
        assert_eq!((status.idle, status.active, status.size), (1, 0, 1));
    }

    #[test]
    fn test_put_idle_twice_is_rejected() {
        let mut registry = registry_with(1, 1);
        let (meta, conn) = registry.take_idle().unwrap();
        registry.put_idle(meta.clone(), conn).unwrap();

        assert_eq!(registry.put_idle(meta, 0), Err(0));
        let status = registry.snapshot();
        assert_eq!((status.idle, status.active, status.size), (1, 0, 1));
    }

    #[test]
    fn test_checkout_count_tracks_loans() {
        let mut registry = registry_with(1, 1);
        for _ in 0..3 {
            let (meta, conn) = registry.take_idle().unwrap();
            registry.put_idle(meta, conn).unwrap();
        }

        let (meta, _) = registry.take_idle().unwrap();
        assert_eq!(meta.checkout_count, 4);
    }

    #[test]
    fn test_probe_keeps_connection_on_idle_side() {
        let mut registry = registry_with(2, 2);
        let ids = registry.idle_ids();

        let idle = registry.begin_probe(ids[0]).unwrap();
        let status = registry.snapshot();
        assert_eq!((status.idle, status.active, status.size), (2, 0, 2));

        // The probed connection cannot be handed out meanwhile.
        let (meta, _) = registry.take_idle().unwrap();
        assert_eq!(meta.id, ids[1]);

        registry.finish_probe(idle);
        assert_eq!(registry.idle_ids(), vec![ids[0]]);
    }

    #[test]
    fn test_remove_invalid_only_touches_probed() {
        let mut registry = registry_with(2, 2);
        let (active, _) = registry.take_idle().unwrap();
        let idle_id = registry.idle_ids()[0];

        assert!(!registry.remove_invalid(active.id));
        assert!(!registry.remove_invalid(idle_id));

        let probed = registry.begin_probe(idle_id).unwrap();
        assert!(registry.remove_invalid(probed.meta.id));

        let status = registry.snapshot();
        assert_eq!((status.idle, status.active, status.size), (0, 1, 1));
    }

    #[test]
    fn test_begin_probe_missing_id() {
        let mut registry = registry_with(1, 1);
        let (meta, _) = registry.take_idle().unwrap();

        assert!(registry.begin_probe(meta.id).is_none());
    }

    #[test]
    fn test_discard_active() {
        let mut registry = registry_with(2, 2);
        let (meta, _) = registry.take_idle().unwrap();

        assert!(registry.discard_active(meta.id));
        assert!(!registry.discard_active(meta.id));
        assert_eq!(registry.size(), 1);
    }

    #[test]
    fn test_drain_idle_leaves_active() {
        let mut registry = registry_with(3, 3);
        let _ = registry.take_idle().unwrap();

        let drained = registry.drain_idle();

        assert_eq!(drained, vec![1, 2]);
        let status = registry.snapshot();
        assert_eq!((status.idle, status.active, status.size), (0, 1, 1));
    }

    #[test]
    fn test_ids_are_unique() {
        let mut registry: ConnectionRegistry<u32> = ConnectionRegistry::new(4);
        let a = registry.add_new(0).unwrap();
        let b = registry.add_new(1).unwrap();

        assert_ne!(a, b);
    }
}
