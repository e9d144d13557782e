//! Client-side synchronization core for the order dashboard.
//!
//! [`SyncEngine`] owns every write into the [`OrderStore`]: the initial
//! snapshot, optimistic status changes and events pushed over the
//! [`LiveChannel`]. Views are derived from store snapshots by
//! [`ViewProjector`].

pub mod auth;
pub mod config;
pub mod engine;
pub mod error;
pub mod live;
pub mod rest;
pub mod store;
pub mod view;
pub mod workflow;

pub use auth::{AuthClient, AuthSession, Credentials, FileCredentialStore, MemoryCredentialStore};
pub use config::{load_settings, load_settings_from, Settings};
pub use engine::{OrderStatusChanged, RemoteApply, StatusChangeRequest, SyncEngine, SyncEvent};
pub use error::{SyncError, SyncResult};
pub use live::{parse_frame, ConnectionState, LiveChannel, LiveOptions};
pub use rest::OrdersApi;
pub use store::{OrderSnapshot, OrderStore, StoreChange, SubscriptionId, UpsertOutcome};
pub use view::{Column, KanbanView, ViewProjector};

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;
