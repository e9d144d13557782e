use std::time::Duration;

use reqwest::{Client, Response};
use shared::{
    domain::{OrderId, OrderStatus},
    error::ApiError,
    protocol::{NewOrder, Order, StatusUpdateRequest},
};
use tracing::debug;

use crate::error::{SyncError, SyncResult};

/// REST client for the order service. Every call takes the bearer token
/// explicitly; callers resolve it from the auth session first.
#[derive(Clone)]
pub struct OrdersApi {
    http: Client,
    base_url: String,
}

impl OrdersApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> SyncResult<Self> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| SyncError::Network(format!("failed to build http client: {err}")))?;
        Ok(Self::with_client(http, base_url))
    }

    pub fn with_client(http: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub async fn list_orders(&self, token: &str) -> SyncResult<Vec<Order>> {
        let response = self
            .http
            .get(format!("{}/orders", self.base_url))
            .bearer_auth(token)
            .send()
            .await?;
        let orders: Vec<Order> = ensure_success(response).await?.json().await?;
        debug!(count = orders.len(), "rest: fetched order collection");
        Ok(orders)
    }

    pub async fn fetch_order(&self, token: &str, order_id: OrderId) -> SyncResult<Order> {
        let response = self
            .http
            .get(format!("{}/orders/{}", self.base_url, order_id.0))
            .bearer_auth(token)
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    pub async fn create_order(&self, token: &str, order: &NewOrder) -> SyncResult<Order> {
        let response = self
            .http
            .post(format!("{}/orders", self.base_url))
            .bearer_auth(token)
            .json(order)
            .send()
            .await?;
        Ok(ensure_success(response).await?.json().await?)
    }

    pub async fn update_status(
        &self,
        token: &str,
        order_id: OrderId,
        status: OrderStatus,
    ) -> SyncResult<()> {
        let response = self
            .http
            .patch(format!("{}/orders/{}/status", self.base_url, order_id.0))
            .bearer_auth(token)
            .json(&StatusUpdateRequest { status })
            .send()
            .await?;
        ensure_success(response).await?;
        Ok(())
    }
}

/// Maps non-2xx responses to `ServerRejected`, carrying the service's
/// `{"error": ...}` message when the body has one.
pub(crate) async fn ensure_success(response: Response) -> SyncResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ApiError>(&body)
        .map(|api_error| api_error.error)
        .unwrap_or_else(|_| {
            if body.trim().is_empty() {
                status
                    .canonical_reason()
                    .unwrap_or("request failed")
                    .to_string()
            } else {
                body
            }
        });
    Err(SyncError::ServerRejected {
        status: status.as_u16(),
        message,
    })
}
