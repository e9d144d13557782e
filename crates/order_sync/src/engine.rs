//! The only write path into the order store.
//!
//! Snapshot loads, user-initiated status changes and pushed events all pass
//! through here and are ordered by per-write sequence numbers, never by
//! arrival time or wall clock.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use shared::{
    domain::{OrderId, OrderStatus, Role},
    protocol::{NewOrder, Order, OrderUpdatePayload},
};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::{
    auth::AuthSession,
    config::Settings,
    error::{SyncError, SyncResult},
    rest::OrdersApi,
    store::{OrderStore, UpsertOutcome},
    workflow,
};

/// Sequence given to entries that come from a snapshot or a fetch: any
/// observed mutation within the same epoch outranks them.
const BASELINE_SEQUENCE: u64 = 0;

/// A pushed status change. `sequence` is present only when the server
/// supplies one; otherwise the engine assigns the next local sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderStatusChanged {
    pub order_id: OrderId,
    pub new_status: OrderStatus,
    pub sequence: Option<u64>,
    pub updated_by: Option<String>,
}

impl From<OrderUpdatePayload> for OrderStatusChanged {
    fn from(payload: OrderUpdatePayload) -> Self {
        Self {
            order_id: payload.order_id,
            new_status: payload.new_status,
            sequence: payload.sequence,
            updated_by: payload.updated_by,
        }
    }
}

/// Transient user intent; never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChangeRequest {
    pub order_id: OrderId,
    pub target_status: OrderStatus,
    pub requested_at: DateTime<Utc>,
}

impl StatusChangeRequest {
    pub fn new(order_id: OrderId, target_status: OrderStatus) -> Self {
        Self {
            order_id,
            target_status,
            requested_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteApply {
    Applied { sequence: u64 },
    Unchanged,
    Stale { stored: u64 },
    /// Order unknown locally; applied once its single-order fetch lands.
    Deferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    SnapshotLoaded { count: usize, resync: bool },
    OrderInserted(OrderId),
    RemoteApplied {
        order_id: OrderId,
        status: OrderStatus,
        sequence: u64,
    },
    RolledBack {
        order_id: OrderId,
        restored: OrderStatus,
    },
    Error(String),
}

struct PendingFetch {
    epoch: u64,
    events: Vec<(OrderStatus, u64)>,
}

pub struct SyncEngine {
    api: OrdersApi,
    auth: Arc<AuthSession>,
    store: Arc<OrderStore>,
    request_timeout: Duration,
    sequence: AtomicU64,
    // Bumped by every snapshot load. Store writes hold it for reading so a
    // write from an older epoch can never land after the replacement.
    epoch: RwLock<u64>,
    initialized: AtomicBool,
    pending_fetches: Mutex<HashMap<OrderId, PendingFetch>>,
    events: broadcast::Sender<SyncEvent>,
}

impl SyncEngine {
    pub fn new(
        api: OrdersApi,
        auth: Arc<AuthSession>,
        store: Arc<OrderStore>,
        request_timeout: Duration,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            api,
            auth,
            store,
            request_timeout,
            sequence: AtomicU64::new(BASELINE_SEQUENCE),
            epoch: RwLock::new(0),
            initialized: AtomicBool::new(false),
            pending_fetches: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn from_settings(settings: &Settings, auth: Arc<AuthSession>) -> SyncResult<Arc<Self>> {
        let api = OrdersApi::new(settings.api_url.clone(), settings.request_timeout)?;
        Ok(Self::new(
            api,
            auth,
            Arc::new(OrderStore::new()),
            settings.request_timeout,
        ))
    }

    pub fn store(&self) -> Arc<OrderStore> {
        Arc::clone(&self.store)
    }

    pub fn auth(&self) -> Arc<AuthSession> {
        Arc::clone(&self.auth)
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    /// Fetches the whole collection and replaces the store with it. Writes
    /// issued meanwhile wait for the replacement and then apply on top.
    pub async fn initialize(&self) -> SyncResult<usize> {
        self.load_snapshot(false).await
    }

    /// Full reload after the live channel reconnects; events pushed while it
    /// was down are otherwise lost.
    pub async fn resynchronize(&self) -> SyncResult<usize> {
        info!("sync: resynchronizing order collection");
        self.load_snapshot(true).await
    }

    async fn load_snapshot(&self, resync: bool) -> SyncResult<usize> {
        let token = self.auth.bearer().await?;
        let count = {
            // Held across the fetch: a write landing between the response and
            // the replacement would otherwise be overwritten by older data.
            let mut epoch = self.epoch.write().await;
            let orders = match self.api.list_orders(&token).await {
                Ok(orders) => orders,
                Err(err) => {
                    warn!(resync, "sync: snapshot fetch failed: {err}");
                    self.emit(SyncEvent::Error(format!("snapshot fetch failed: {err}")));
                    return Err(err);
                }
            };
            let count = orders.len();
            *epoch += 1;
            self.sequence.store(BASELINE_SEQUENCE, Ordering::Release);
            self.pending_fetches.lock().await.clear();
            self.store.replace_all(orders, BASELINE_SEQUENCE);
            info!(count, epoch = *epoch, resync, "sync: snapshot loaded");
            count
        };
        self.initialized.store(true, Ordering::Release);
        self.emit(SyncEvent::SnapshotLoaded { count, resync });
        Ok(count)
    }

    /// Applies a pushed status change. Issues no request itself (it only
    /// waits out a snapshot load in progress): an event for an unknown order
    /// schedules a fetch of that one order and returns
    /// [`RemoteApply::Deferred`].
    pub async fn apply_remote_event(self: &Arc<Self>, event: OrderStatusChanged) -> RemoteApply {
        let epoch = self.epoch.read().await;

        if let Some(outcome) = self.apply_to_known(&event) {
            return outcome;
        }

        let mut pending = self.pending_fetches.lock().await;
        // A fetch may have landed between the lookup above and taking the lock.
        if let Some(outcome) = self.apply_to_known(&event) {
            return outcome;
        }

        let sequence = self.sequence_for(&event);
        match pending.get_mut(&event.order_id) {
            Some(fetch) => {
                fetch.events.push((event.new_status, sequence));
                debug!(
                    order_id = event.order_id.0,
                    sequence, "sync: queued event behind in-flight order fetch"
                );
            }
            None => {
                pending.insert(
                    event.order_id,
                    PendingFetch {
                        epoch: *epoch,
                        events: vec![(event.new_status, sequence)],
                    },
                );
                info!(
                    order_id = event.order_id.0,
                    "sync: event for unknown order; fetching it"
                );
                let engine = Arc::clone(self);
                let order_id = event.order_id;
                let fetch_epoch = *epoch;
                tokio::spawn(async move {
                    engine.complete_unknown_order(order_id, fetch_epoch).await;
                });
            }
        }
        RemoteApply::Deferred
    }

    /// Applies `event` if its order is present. `None` when it is not.
    fn apply_to_known(&self, event: &OrderStatusChanged) -> Option<RemoteApply> {
        let (current, _) = self.store.entry(event.order_id)?;

        if event.sequence.is_none() && current.status == event.new_status {
            debug!(
                order_id = event.order_id.0,
                status = %event.new_status,
                "sync: remote event matches local state"
            );
            return Some(RemoteApply::Unchanged);
        }
        if current.status != event.new_status
            && !workflow::is_transition_allowed(current.status, event.new_status)
        {
            warn!(
                order_id = event.order_id.0,
                from = %current.status,
                to = %event.new_status,
                updated_by = event.updated_by.as_deref().unwrap_or("unknown"),
                "sync: server reported a move outside the workflow; applying server state"
            );
        }

        let sequence = self.sequence_for(event);
        let outcome = match self
            .store
            .upsert(current.with_status(event.new_status), sequence)
        {
            UpsertOutcome::Applied => {
                self.emit(SyncEvent::RemoteApplied {
                    order_id: event.order_id,
                    status: event.new_status,
                    sequence,
                });
                RemoteApply::Applied { sequence }
            }
            UpsertOutcome::Unchanged => RemoteApply::Unchanged,
            UpsertOutcome::Stale { stored } => {
                debug!(
                    order_id = event.order_id.0,
                    sequence, stored, "sync: discarded stale remote event"
                );
                RemoteApply::Stale { stored }
            }
        };
        Some(outcome)
    }

    fn sequence_for(&self, event: &OrderStatusChanged) -> u64 {
        match event.sequence {
            Some(sequence) => {
                // Keep local sequences ahead of anything the server numbered.
                self.sequence.fetch_max(sequence, Ordering::AcqRel);
                sequence
            }
            None => self.next_sequence(),
        }
    }

    async fn complete_unknown_order(&self, order_id: OrderId, fetch_epoch: u64) {
        let fetched = match self.auth.bearer().await {
            Ok(token) => self.api.fetch_order(&token, order_id).await,
            Err(err) => Err(err),
        };

        let epoch = self.epoch.read().await;
        let mut pending = self.pending_fetches.lock().await;
        let owns_entry = pending
            .get(&order_id)
            .is_some_and(|fetch| fetch.epoch == fetch_epoch);
        if !owns_entry || *epoch != fetch_epoch {
            debug!(
                order_id = order_id.0,
                "sync: dropping order fetch superseded by a snapshot"
            );
            return;
        }
        let Some(fetch) = pending.remove(&order_id) else {
            return;
        };

        let order = match fetched {
            Ok(order) if order.id == order_id => order,
            Ok(order) => {
                let message = format!(
                    "fetch for order {} returned order {}",
                    order_id.0, order.id.0
                );
                warn!(order_id = order_id.0, "sync: {message}");
                self.emit(SyncEvent::Error(message));
                return;
            }
            Err(err) => {
                warn!(
                    order_id = order_id.0,
                    dropped_events = fetch.events.len(),
                    "sync: failed to fetch unknown order: {err}"
                );
                self.emit(SyncEvent::Error(format!(
                    "failed to fetch order {}: {err}",
                    order_id.0
                )));
                return;
            }
        };

        if self.store.upsert(order, BASELINE_SEQUENCE) == UpsertOutcome::Applied {
            self.emit(SyncEvent::OrderInserted(order_id));
        }
        for (status, sequence) in fetch.events {
            let Some((current, _)) = self.store.entry(order_id) else {
                break;
            };
            if self.store.upsert(current.with_status(status), sequence) == UpsertOutcome::Applied {
                self.emit(SyncEvent::RemoteApplied {
                    order_id,
                    status,
                    sequence,
                });
            }
        }
        info!(
            order_id = order_id.0,
            status = ?self.store.get(order_id).map(|order| order.status),
            "sync: unknown order inserted"
        );
    }

    /// Validates the move, applies it optimistically, then sends it. A
    /// failed or timed-out request puts the prior status back unless a newer
    /// write already replaced the optimistic one.
    pub async fn request_status_change(
        &self,
        order_id: OrderId,
        target_status: OrderStatus,
        acting_role: Role,
    ) -> SyncResult<Order> {
        let request = StatusChangeRequest::new(order_id, target_status);
        let (prior, _) = self
            .store
            .entry(request.order_id)
            .ok_or(SyncError::UnknownOrder(order_id))?;

        if !workflow::is_transition_allowed(prior.status, target_status) {
            info!(
                order_id = order_id.0,
                from = %prior.status,
                to = %target_status,
                "sync: rejected status change outside the workflow"
            );
            return Err(SyncError::InvalidTransition {
                order_id,
                from: prior.status,
                to: target_status,
            });
        }
        if !workflow::is_transition_allowed_for(acting_role, prior.status, target_status) {
            info!(
                order_id = order_id.0,
                role = %acting_role,
                to = %target_status,
                "sync: rejected status change for role"
            );
            return Err(SyncError::NotPermitted {
                role: acting_role,
                from: prior.status,
                to: target_status,
            });
        }
        let token = self.auth.bearer().await?;

        let optimistic = prior.with_status(target_status);
        let (optimistic_sequence, epoch) = {
            let epoch = self.epoch.read().await;
            let sequence = self.next_sequence();
            self.store.upsert(optimistic.clone(), sequence);
            (sequence, *epoch)
        };
        debug!(
            order_id = order_id.0,
            to = %target_status,
            sequence = optimistic_sequence,
            requested_at = %request.requested_at,
            "sync: optimistic status applied"
        );

        let sent = tokio::time::timeout(
            self.request_timeout,
            self.api.update_status(&token, order_id, target_status),
        )
        .await;

        let err = match sent {
            Ok(Ok(())) => {
                info!(
                    order_id = order_id.0,
                    status = %target_status,
                    "sync: status change confirmed"
                );
                return Ok(optimistic);
            }
            Ok(Err(err)) => err,
            Err(_) => SyncError::Timeout(self.request_timeout),
        };
        warn!(
            order_id = order_id.0,
            to = %target_status,
            "sync: status change failed, rolling back: {err}"
        );
        self.roll_back(prior, optimistic_sequence, epoch).await;
        self.emit(SyncEvent::Error(format!(
            "status change for order {} failed: {err}",
            order_id.0
        )));
        Err(err)
    }

    async fn roll_back(&self, prior: Order, optimistic_sequence: u64, epoch: u64) {
        let order_id = prior.id;
        let restored_status = prior.status;
        let current_epoch = self.epoch.read().await;
        if *current_epoch != epoch {
            debug!(
                order_id = order_id.0,
                "sync: rollback skipped; store was reloaded since the optimistic write"
            );
            return;
        }
        let sequence = self.next_sequence();
        if self
            .store
            .restore_if_current(prior, optimistic_sequence, sequence)
        {
            self.emit(SyncEvent::RolledBack {
                order_id,
                restored: restored_status,
            });
        } else {
            debug!(
                order_id = order_id.0,
                "sync: rollback skipped; a newer write replaced the optimistic state"
            );
        }
    }

    /// Creates an order and inserts the server's copy without waiting for
    /// the push event, which later reapplies as a no-op.
    pub async fn create_order(&self, new_order: NewOrder) -> SyncResult<Order> {
        let token = self.auth.bearer().await?;
        let created = self.api.create_order(&token, &new_order).await?;
        {
            let _epoch = self.epoch.read().await;
            let sequence = self.next_sequence();
            self.store.upsert(created.clone(), sequence);
        }
        info!(order_id = created.id.0, "sync: order created");
        self.emit(SyncEvent::OrderInserted(created.id));
        Ok(created)
    }

    /// Re-reads one order from the server and stores it.
    pub async fn refresh_order(&self, order_id: OrderId) -> SyncResult<Order> {
        let token = self.auth.bearer().await?;
        let order = self.api.fetch_order(&token, order_id).await?;
        let _epoch = self.epoch.read().await;
        let sequence = self.next_sequence();
        self.store.upsert(order.clone(), sequence);
        Ok(order)
    }
}

#[cfg(test)]
#[path = "tests/engine_tests.rs"]
mod tests;
