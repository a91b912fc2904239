//! Loop-local ownership arena.
//!
//! Objects whose lifetime is shared between the loop and something else (a
//! connection, a server) are parked here under an [`OwnerId`]. Channels are
//! tied to the id rather than holding a strong reference, and dispatch looks
//! the id up first: once the entry is retired, the lookup comes back empty and
//! no callback runs. Ids are process-wide and never reused, so a stale id
//! cannot alias a newer owner, and an id can be minted on one thread before its
//! owner is built on another.

use std::any::Any;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OWNER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OwnerId(u64);

impl OwnerId {
    pub fn next() -> Self {
        OwnerId(NEXT_OWNER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Default)]
pub struct Registry {
    owners: HashMap<OwnerId, Rc<dyn Any>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hands out a fresh id; the owner is attached later with [`insert`](Self::insert).
    pub fn reserve(&mut self) -> OwnerId {
        OwnerId::next()
    }

    pub fn insert<T: Any>(&mut self, id: OwnerId, owner: Rc<T>) {
        let owner: Rc<dyn Any> = owner;
        self.owners.insert(id, owner);
    }

    pub fn get<T: Any>(&self, id: OwnerId) -> Option<Rc<T>> {
        self.owners.get(&id).cloned()?.downcast::<T>().ok()
    }

    pub fn contains(&self, id: OwnerId) -> bool {
        self.owners.contains_key(&id)
    }

    /// Removes the entry; returns `None` if it was already retired.
    pub fn retire(&mut self, id: OwnerId) -> Option<Rc<dyn Any>> {
        self.owners.remove(&id)
    }

    pub fn len(&self) -> usize {
        self.owners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.owners.is_empty()
    }
}
