//! Canonical in-memory order collection.
//!
//! Every entry carries the sequence number of the write that produced it; a
//! write with a lower sequence than the stored one is discarded. Mutators are
//! crate-private so the sync engine stays the only writer.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError, RwLock,
    },
};

use shared::{domain::OrderId, protocol::Order};
use tracing::{debug, warn};

/// Immutable view of the store at one point in time, ordered by id.
pub type OrderSnapshot = Arc<Vec<Order>>;

type Listener = Arc<dyn Fn(&StoreChange, &OrderSnapshot) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Applied,
    /// Content already matched; only the stored sequence may have moved.
    Unchanged,
    Stale {
        stored: u64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    Upserted(OrderId),
    Replaced,
    RolledBack(OrderId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Clone)]
struct Entry {
    order: Order,
    sequence: u64,
}

#[derive(Default)]
struct StoreState {
    entries: BTreeMap<OrderId, Entry>,
    snapshot: OrderSnapshot,
}

impl StoreState {
    fn rebuild_snapshot(&mut self) -> OrderSnapshot {
        let orders = self
            .entries
            .values()
            .map(|entry| entry.order.clone())
            .collect::<Vec<_>>();
        self.snapshot = Arc::new(orders);
        Arc::clone(&self.snapshot)
    }
}

#[derive(Default)]
pub struct OrderStore {
    state: RwLock<StoreState>,
    // Serializes writers so listeners observe mutations in the order they
    // were applied. Readers only touch `state`.
    write_gate: Mutex<()>,
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: OrderId) -> Option<Order> {
        self.read_state()
            .entries
            .get(&id)
            .map(|entry| entry.order.clone())
    }

    pub fn sequence_of(&self, id: OrderId) -> Option<u64> {
        self.read_state().entries.get(&id).map(|entry| entry.sequence)
    }

    /// Order and its sequence, read in one critical section.
    pub fn entry(&self, id: OrderId) -> Option<(Order, u64)> {
        self.read_state()
            .entries
            .get(&id)
            .map(|entry| (entry.order.clone(), entry.sequence))
    }

    pub fn list(&self) -> OrderSnapshot {
        Arc::clone(&self.read_state().snapshot)
    }

    pub fn len(&self) -> usize {
        self.read_state().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read_state().entries.is_empty()
    }

    /// Registers a listener fired after every successful mutation. Listeners
    /// run outside the state lock but must not write back into the store.
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&StoreChange, &OrderSnapshot) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub(crate) fn upsert(&self, order: Order, sequence: u64) -> UpsertOutcome {
        let _gate = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let id = order.id;
        let (outcome, snapshot) = {
            let mut state = self.write_state();
            match state.entries.get_mut(&id) {
                Some(existing) if existing.sequence > sequence => {
                    return UpsertOutcome::Stale {
                        stored: existing.sequence,
                    };
                }
                Some(existing) if existing.order == order => {
                    existing.sequence = sequence;
                    return UpsertOutcome::Unchanged;
                }
                Some(existing) => {
                    *existing = Entry { order, sequence };
                }
                None => {
                    state.entries.insert(id, Entry { order, sequence });
                }
            }
            (UpsertOutcome::Applied, state.rebuild_snapshot())
        };
        debug!(order_id = id.0, sequence, "store: entry applied");
        self.notify(StoreChange::Upserted(id), &snapshot);
        outcome
    }

    /// Replaces the whole collection, every entry at `sequence`.
    pub(crate) fn replace_all(&self, orders: Vec<Order>, sequence: u64) {
        let _gate = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let snapshot = {
            let mut state = self.write_state();
            let mut entries = BTreeMap::new();
            for order in orders {
                let id = order.id;
                if entries.insert(id, Entry { order, sequence }).is_some() {
                    warn!(order_id = id.0, "store: duplicate id in snapshot; keeping the later row");
                }
            }
            state.entries = entries;
            state.rebuild_snapshot()
        };
        debug!(count = snapshot.len(), "store: collection replaced");
        self.notify(StoreChange::Replaced, &snapshot);
    }

    /// Puts `prior` back only while the entry still carries
    /// `expected_sequence`, i.e. nothing newer landed since the write being
    /// undone.
    pub(crate) fn restore_if_current(
        &self,
        prior: Order,
        expected_sequence: u64,
        sequence: u64,
    ) -> bool {
        let _gate = self.write_gate.lock().unwrap_or_else(PoisonError::into_inner);
        let id = prior.id;
        let snapshot = {
            let mut state = self.write_state();
            match state.entries.get_mut(&id) {
                Some(existing) if existing.sequence == expected_sequence => {
                    *existing = Entry {
                        order: prior,
                        sequence,
                    };
                }
                _ => return false,
            }
            state.rebuild_snapshot()
        };
        debug!(order_id = id.0, sequence, "store: entry rolled back");
        self.notify(StoreChange::RolledBack(id), &snapshot);
        true
    }

    fn notify(&self, change: StoreChange, snapshot: &OrderSnapshot) {
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect::<Vec<_>>();
        for listener in listeners {
            listener(&change, snapshot);
        }
    }

    fn read_state(&self) -> std::sync::RwLockReadGuard<'_, StoreState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> std::sync::RwLockWriteGuard<'_, StoreState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
