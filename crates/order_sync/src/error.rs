use std::time::Duration;

use shared::domain::{OrderId, OrderStatus, Role};
use thiserror::Error;

/// Failures surfaced by the synchronization core. None of them is fatal;
/// the store is always left at its last consistent state.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("not signed in: no bearer token available")]
    AuthMissing,
    #[error("network failure: {0}")]
    Network(String),
    #[error("order {order_id}: transition {from} -> {to} is not allowed")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },
    #[error("role {role} may not move an order from {from} to {to}")]
    NotPermitted {
        role: Role,
        from: OrderStatus,
        to: OrderStatus,
    },
    #[error("order {0} is not present in the local store")]
    UnknownOrder(OrderId),
    #[error("server rejected request with status {status}: {message}")]
    ServerRejected { status: u16, message: String },
    #[error("request timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed live event: {0}")]
    MalformedEvent(String),
    #[error("failed to decode server response: {0}")]
    Decode(String),
}

impl SyncError {
    /// Rejections decided locally, before any request is sent.
    pub fn is_local_rejection(&self) -> bool {
        matches!(
            self,
            SyncError::AuthMissing
                | SyncError::InvalidTransition { .. }
                | SyncError::NotPermitted { .. }
                | SyncError::UnknownOrder(_)
        )
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            SyncError::Decode(err.to_string())
        } else {
            SyncError::Network(err.to_string())
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
