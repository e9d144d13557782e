//! Kanban projection of the order store. Holds no state of its own; every
//! view is derived from a store snapshot.

use std::cmp::Reverse;

use shared::{
    domain::{OrderSource, OrderStatus},
    protocol::Order,
};

use crate::{
    store::{OrderStore, SubscriptionId},
    workflow::StatusAction,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub status: OrderStatus,
    pub orders: Vec<Order>,
}

impl Column {
    pub fn count(&self) -> usize {
        self.orders.len()
    }

    pub fn title(&self) -> &'static str {
        status_label(self.status)
    }
}

/// One column per status, always in [`OrderStatus::ALL`] order, empty
/// columns included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KanbanView {
    pub columns: Vec<Column>,
}

impl KanbanView {
    pub fn column(&self, status: OrderStatus) -> Option<&Column> {
        self.columns.iter().find(|column| column.status == status)
    }

    pub fn total(&self) -> usize {
        self.columns.iter().map(Column::count).sum()
    }
}

pub struct ViewProjector;

impl ViewProjector {
    /// Partitions `orders` by status; within a column newest first.
    pub fn project(orders: &[Order]) -> KanbanView {
        let mut columns = OrderStatus::ALL
            .iter()
            .map(|status| Column {
                status: *status,
                orders: Vec::new(),
            })
            .collect::<Vec<_>>();
        for order in orders {
            if let Some(column) = columns.iter_mut().find(|c| c.status == order.status) {
                column.orders.push(order.clone());
            }
        }
        for column in &mut columns {
            column
                .orders
                .sort_by_key(|order| (Reverse(order.created_at), Reverse(order.id)));
        }
        KanbanView { columns }
    }

    /// Calls `on_view` with a fresh projection after every store change.
    pub fn attach<F>(store: &OrderStore, on_view: F) -> SubscriptionId
    where
        F: Fn(KanbanView) + Send + Sync + 'static,
    {
        store.subscribe(move |_, snapshot| on_view(Self::project(snapshot)))
    }
}

pub fn status_label(status: OrderStatus) -> &'static str {
    match status {
        OrderStatus::New => "NEW",
        OrderStatus::Confirmed => "CONFIRMED",
        OrderStatus::Shipped => "SHIPPED",
        OrderStatus::Delivered => "DELIVERED",
        OrderStatus::Cancelled => "CANCELLED",
    }
}

pub fn source_label(source: &OrderSource) -> &str {
    match source {
        OrderSource::Website => "Website",
        OrderSource::Manual => "Manual",
        OrderSource::SourceOne => "Source one",
        OrderSource::SourceTwo => "Source two",
        OrderSource::Other(raw) => raw,
    }
}

pub fn action_label(action: StatusAction, target: OrderStatus) -> String {
    match action {
        StatusAction::Advance => format!("Mark {}", target.as_str()),
        StatusAction::Revert => format!("Back to {}", target.as_str()),
        StatusAction::Cancel => "Cancel".to_string(),
        StatusAction::Restore => "Restore".to_string(),
    }
}

#[cfg(test)]
#[path = "tests/view_tests.rs"]
mod tests;
