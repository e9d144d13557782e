//! Legal order-status moves and the per-role narrowing of them.
//!
//! Everything here is pure: no store access, no network.

use shared::domain::{OrderStatus, Role};

use OrderStatus::{Cancelled, Confirmed, Delivered, New, Shipped};

/// What a move means for the operator, used to label actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusAction {
    Advance,
    Revert,
    Cancel,
    Restore,
}

/// Adjacency row for `current`, forward move first, then the step back,
/// then cancellation.
pub fn allowed_targets(current: OrderStatus) -> &'static [OrderStatus] {
    match current {
        New => &[Confirmed, Cancelled],
        Confirmed => &[Shipped, New, Cancelled],
        Shipped => &[Delivered, Confirmed, Cancelled],
        Delivered => &[Shipped],
        Cancelled => &[New],
    }
}

pub fn is_transition_allowed(current: OrderStatus, target: OrderStatus) -> bool {
    allowed_targets(current).contains(&target)
}

/// Whether `role` may request a move into `target`. Only narrows the graph.
fn role_permits(role: Role, target: OrderStatus) -> bool {
    match role {
        Role::Admin => true,
        Role::Employee => target != Cancelled,
        Role::Customer => false,
    }
}

pub fn is_transition_allowed_for(role: Role, current: OrderStatus, target: OrderStatus) -> bool {
    is_transition_allowed(current, target) && role_permits(role, target)
}

pub fn allowed_targets_for(role: Role, current: OrderStatus) -> Vec<OrderStatus> {
    allowed_targets(current)
        .iter()
        .copied()
        .filter(|target| role_permits(role, *target))
        .collect()
}

/// Classifies a legal move. Returns `None` for pairs outside the graph.
pub fn classify(current: OrderStatus, target: OrderStatus) -> Option<StatusAction> {
    if !is_transition_allowed(current, target) {
        return None;
    }
    let action = match (current, target) {
        (_, Cancelled) => StatusAction::Cancel,
        (Cancelled, New) => StatusAction::Restore,
        _ if lifecycle_rank(target) > lifecycle_rank(current) => StatusAction::Advance,
        _ => StatusAction::Revert,
    };
    Some(action)
}

fn lifecycle_rank(status: OrderStatus) -> u8 {
    match status {
        New => 0,
        Confirmed => 1,
        Shipped => 2,
        Delivered => 3,
        Cancelled => 4,
    }
}

#[cfg(test)]
#[path = "tests/workflow_tests.rs"]
mod tests;
