//! Registry of live sessions.
//!
//! The registry is the only state shared between sessions. Every insert,
//! remove and full-table visit takes the same lock, so a broadcast never
//! observes a half-removed session and never writes to a connection whose
//! owner has already deregistered it. Ids map to slab slots through an
//! index, so insert and remove stay constant-time when unbounded.

use crate::runtime::session::SessionId;
use bytes::Bytes;
use slab::Slab;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc::UnboundedSender;

/// A registered session as seen by broadcasters.
///
/// `outbound` is a non-owning write handle: the session itself still owns
/// its connection and closes it after deregistering.
#[derive(Debug)]
pub struct SessionEntry<W> {
    pub id: SessionId,
    pub name: String,
    pub peer: SocketAddr,
    pub outbound: W,
}

/// Reasons an insert can be refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The registry already holds `capacity` sessions.
    Full { capacity: usize },
    /// A session with this id is already registered.
    Duplicate(SessionId),
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegistryError::Full { capacity } => {
                write!(f, "session registry full ({capacity} sessions)")
            }
            RegistryError::Duplicate(id) => write!(f, "session {id} already registered"),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Slab of entries plus an id index into it.
struct Table<W> {
    slots: Slab<SessionEntry<W>>,
    index: HashMap<SessionId, usize>,
}

/// Mutex-guarded table of live sessions using slab allocation.
pub struct SessionRegistry<W> {
    sessions: Mutex<Table<W>>,
    /// Maximum concurrent sessions; 0 means unbounded.
    max_sessions: usize,
}

/// Registry whose write handles are channels drained by per-session writers.
pub type ChannelRegistry = SessionRegistry<UnboundedSender<Bytes>>;

impl<W> SessionRegistry<W> {
    /// Create a registry holding at most `max_sessions` sessions (0 = unbounded).
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: Mutex::new(Table {
                slots: Slab::with_capacity(max_sessions),
                index: HashMap::with_capacity(max_sessions),
            }),
            max_sessions,
        }
    }

    // A panic while holding the lock leaves the table itself consistent,
    // so keep serving rather than poisoning every session.
    fn lock(&self) -> MutexGuard<'_, Table<W>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a session.
    pub fn insert(&self, entry: SessionEntry<W>) -> Result<(), RegistryError> {
        let mut table = self.lock();
        if self.max_sessions > 0 && table.slots.len() >= self.max_sessions {
            return Err(RegistryError::Full {
                capacity: self.max_sessions,
            });
        }
        if table.index.contains_key(&entry.id) {
            return Err(RegistryError::Duplicate(entry.id));
        }
        let id = entry.id;
        let key = table.slots.insert(entry);
        table.index.insert(id, key);
        Ok(())
    }

    /// Deregister a session. Removing an absent id is a no-op.
    pub fn remove(&self, id: SessionId) -> Option<SessionEntry<W>> {
        let mut table = self.lock();
        let key = table.index.remove(&id)?;
        table.slots.try_remove(key)
    }

    /// Visit every registered session while holding the registry lock.
    ///
    /// Order is slot order: unspecified, but stable for the call.
    pub fn for_each<F>(&self, mut visit: F)
    where
        F: FnMut(&SessionEntry<W>),
    {
        let table = self.lock();
        for (_, entry) in table.slots.iter() {
            visit(entry);
        }
    }

    #[cfg(test)]
    pub fn contains(&self, id: SessionId) -> bool {
        self.lock().index.contains_key(&id)
    }

    #[cfg(test)]
    pub fn ids(&self) -> Vec<SessionId> {
        self.lock().slots.iter().map(|(_, s)| s.id).collect()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    /// Number of live sessions.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    /// Whether an insert would be refused for lack of room.
    pub fn is_full(&self) -> bool {
        self.max_sessions > 0 && self.len() >= self.max_sessions
    }

    /// Maximum number of sessions allowed (0 = unbounded).
    pub fn capacity(&self) -> usize {
        self.max_sessions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::session::IdAllocator;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::thread;

    fn entry(id: SessionId) -> SessionEntry<()> {
        SessionEntry {
            id,
            name: id.to_string(),
            peer: "127.0.0.1:9000".parse().unwrap(),
            outbound: (),
        }
    }

    #[test]
    fn test_insert_and_remove() {
        let registry = SessionRegistry::new(0);
        registry.insert(entry(10)).unwrap();
        registry.insert(entry(11)).unwrap();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains(10));

        let removed = registry.remove(10).unwrap();
        assert_eq!(removed.name, "10");
        assert!(!registry.contains(10));
        assert_eq!(registry.ids(), vec![11]);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let registry = SessionRegistry::new(4);
        registry.insert(entry(10)).unwrap();

        assert!(registry.remove(99).is_none());
        assert!(registry.remove(10).is_some());
        assert!(registry.remove(10).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_index_follows_reused_slots() {
        let registry = SessionRegistry::new(0);
        registry.insert(entry(10)).unwrap();
        registry.insert(entry(11)).unwrap();
        registry.remove(10);

        // 12 takes the slot 10 left behind.
        registry.insert(entry(12)).unwrap();
        assert!(registry.remove(10).is_none());
        assert_eq!(registry.remove(11).unwrap().id, 11);
        assert_eq!(registry.remove(12).unwrap().id, 12);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_capacity_enforced() {
        let registry = SessionRegistry::new(2);
        registry.insert(entry(10)).unwrap();
        registry.insert(entry(11)).unwrap();

        assert!(registry.is_full());
        assert_eq!(
            registry.insert(entry(12)),
            Err(RegistryError::Full { capacity: 2 })
        );

        registry.remove(10);
        assert!(!registry.is_full());
        registry.insert(entry(12)).unwrap();
        assert_eq!(registry.capacity(), 2);
    }

    #[test]
    fn test_duplicate_rejected() {
        let registry = SessionRegistry::new(0);
        registry.insert(entry(10)).unwrap();
        assert_eq!(
            registry.insert(entry(10)),
            Err(RegistryError::Duplicate(10))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_for_each_visits_every_session_once() {
        let registry = SessionRegistry::new(0);
        for id in 10..15 {
            registry.insert(entry(id)).unwrap();
        }
        registry.remove(12);

        let mut seen = Vec::new();
        registry.for_each(|s| seen.push(s.id));
        seen.sort_unstable();
        assert_eq!(seen, vec![10, 11, 13, 14]);
    }

    #[test]
    fn test_concurrent_joins_have_distinct_ids() {
        const JOINS: usize = 64;
        let registry = Arc::new(SessionRegistry::new(0));
        let ids = Arc::new(IdAllocator::new());

        let handles: Vec<_> = (0..JOINS)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let ids = Arc::clone(&ids);
                thread::spawn(move || registry.insert(entry(ids.next())).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let unique: HashSet<_> = registry.ids().into_iter().collect();
        assert_eq!(registry.len(), JOINS);
        assert_eq!(unique.len(), JOINS);
    }

    #[test]
    fn test_concurrent_join_and_leave() {
        let registry = Arc::new(SessionRegistry::new(0));
        let handles: Vec<_> = (0..16u64)
            .map(|n| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    let id = 100 + n;
                    registry.insert(entry(id)).unwrap();
                    let mut visited = 0;
                    registry.for_each(|_| visited += 1);
                    assert!(visited >= 1);
                    if n % 2 == 0 {
                        registry.remove(id);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let mut ids = registry.ids();
        ids.sort_unstable();
        let expected: Vec<_> = (0..16u64).filter(|n| n % 2 == 1).map(|n| 100 + n).collect();
        assert_eq!(ids, expected);
    }
}
