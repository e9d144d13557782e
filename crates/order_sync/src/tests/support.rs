//! In-process fake of the order service (REST + live channel) for tests.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, patch},
    Json, Router,
};
use chrono::{TimeZone, Utc};
use rust_decimal::Decimal;
use shared::{
    domain::{OrderId, OrderSource, OrderStatus, Role, UserId},
    error::ApiError,
    protocol::{AuthUser, NewOrder, Order, OrderUpdatePayload, ServerEvent, StatusUpdateRequest},
};
use tokio::{
    net::TcpListener,
    sync::{broadcast, Mutex},
};

use crate::{
    auth::{AuthSession, Credentials},
    engine::SyncEngine,
    rest::OrdersApi,
    store::OrderStore,
};

pub const TEST_TOKEN: &str = "test-token";

pub fn sample_order(id: i64, status: OrderStatus) -> Order {
    Order {
        id: OrderId(id),
        customer_name: format!("Customer {id}"),
        customer_email: format!("customer{id}@example.com"),
        total_amount: Decimal::new(199_99, 2),
        source: OrderSource::Website,
        status,
        created_at: Utc
            .with_ymd_and_hms(2024, 3, 1, 9, 0, 0)
            .unwrap()
            + chrono::Duration::minutes(id),
        updated_at: None,
    }
}

pub fn admin_credentials() -> Credentials {
    Credentials {
        token: TEST_TOKEN.to_string(),
        user: AuthUser {
            id: UserId(1),
            email: "admin@example.com".to_string(),
            role: Role::Admin,
        },
    }
}

#[derive(Clone)]
pub struct FakeOrderService {
    pub orders: Arc<Mutex<BTreeMap<i64, Order>>>,
    pub list_calls: Arc<Mutex<u32>>,
    pub fetched_ids: Arc<Mutex<Vec<i64>>>,
    pub patches: Arc<Mutex<Vec<(i64, OrderStatus)>>>,
    pub creates: Arc<Mutex<u32>>,
    pub unauthorized_calls: Arc<Mutex<u32>>,
    pub patch_failure: Arc<Mutex<Option<StatusCode>>>,
    pub patch_delay: Arc<Mutex<Option<Duration>>>,
    pub fetch_delay: Arc<Mutex<Option<Duration>>>,
    pub list_delay: Arc<Mutex<Option<Duration>>>,
    pub ws_connections: Arc<Mutex<u32>>,
    frames: broadcast::Sender<String>,
    kick: broadcast::Sender<()>,
}

impl FakeOrderService {
    pub async fn seed(&self, orders: impl IntoIterator<Item = Order>) {
        let mut guard = self.orders.lock().await;
        for order in orders {
            guard.insert(order.id.0, order);
        }
    }

    /// Server-side change without any push, as if made while disconnected.
    pub async fn set_status_silently(&self, id: i64, status: OrderStatus) {
        if let Some(order) = self.orders.lock().await.get_mut(&id) {
            order.status = status;
        }
    }

    pub fn push_raw(&self, frame: impl Into<String>) {
        let _ = self.frames.send(frame.into());
    }

    pub fn push_update(&self, order_id: i64, new_status: OrderStatus, sequence: Option<u64>) {
        let frame = ServerEvent::OrderUpdate(OrderUpdatePayload {
            order_id: OrderId(order_id),
            new_status,
            sequence,
            updated_by: Some("admin".to_string()),
        });
        let encoded = serde_json::to_string(&frame).expect("encode frame");
        self.push_raw(encoded);
    }

    /// Closes every open live-channel socket.
    pub fn drop_connections(&self) {
        let _ = self.kick.send(());
    }

    pub fn live_subscribers(&self) -> usize {
        self.frames.receiver_count()
    }

    /// Serves this same state on another listener.
    pub fn serve_on(&self, listener: TcpListener) {
        let app = router(self.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
    }
}

fn router(state: FakeOrderService) -> Router {
    Router::new()
        .route("/api/orders", get(list_orders).post(create_order))
        .route("/api/orders/:id", get(fetch_order))
        .route("/api/orders/:id/status", patch(update_status))
        .route("/ws", get(live))
        .with_state(state)
}

fn authorized(headers: &HeaderMap) -> bool {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value == format!("Bearer {TEST_TOKEN}"))
}

async fn reject_unauthorized(state: &FakeOrderService) -> Response {
    *state.unauthorized_calls.lock().await += 1;
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiError::new("Authorization header required")),
    )
        .into_response()
}

async fn list_orders(State(state): State<FakeOrderService>, headers: HeaderMap) -> Response {
    if !authorized(&headers) {
        return reject_unauthorized(&state).await;
    }
    *state.list_calls.lock().await += 1;
    let orders = state.orders.lock().await.values().cloned().collect::<Vec<_>>();
    let delay = *state.list_delay.lock().await;
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    Json(orders).into_response()
}

async fn fetch_order(
    State(state): State<FakeOrderService>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&headers) {
        return reject_unauthorized(&state).await;
    }
    state.fetched_ids.lock().await.push(id);
    let delay = *state.fetch_delay.lock().await;
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    match state.orders.lock().await.get(&id).cloned() {
        Some(order) => Json(order).into_response(),
        None => (StatusCode::NOT_FOUND, Json(ApiError::new("Order not found"))).into_response(),
    }
}

async fn create_order(
    State(state): State<FakeOrderService>,
    headers: HeaderMap,
    Json(new_order): Json<NewOrder>,
) -> Response {
    if !authorized(&headers) {
        return reject_unauthorized(&state).await;
    }
    *state.creates.lock().await += 1;
    let mut orders = state.orders.lock().await;
    let id = orders.keys().next_back().copied().unwrap_or(0) + 1;
    let order = Order {
        id: OrderId(id),
        customer_name: new_order.customer_name,
        customer_email: new_order.customer_email,
        total_amount: new_order.total_amount,
        source: new_order.source,
        status: OrderStatus::New,
        created_at: Utc::now(),
        updated_at: None,
    };
    orders.insert(id, order.clone());
    (StatusCode::CREATED, Json(order)).into_response()
}

async fn update_status(
    State(state): State<FakeOrderService>,
    Path(id): Path<i64>,
    headers: HeaderMap,
    Json(request): Json<StatusUpdateRequest>,
) -> Response {
    if !authorized(&headers) {
        return reject_unauthorized(&state).await;
    }
    state.patches.lock().await.push((id, request.status));
    let delay = *state.patch_delay.lock().await;
    if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
    }
    let failure = *state.patch_failure.lock().await;
    if let Some(status) = failure {
        return (status, Json(ApiError::new("Failed to update order status"))).into_response();
    }
    if let Some(order) = state.orders.lock().await.get_mut(&id) {
        order.status = request.status;
    }
    Json(serde_json::json!({
        "message": "Order status updated successfully",
        "order_id": id,
        "new_status": request.status,
    }))
    .into_response()
}

async fn live(State(state): State<FakeOrderService>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| serve_live(state, socket))
}

async fn serve_live(state: FakeOrderService, mut socket: WebSocket) {
    *state.ws_connections.lock().await += 1;
    let mut frames = state.frames.subscribe();
    let mut kick = state.kick.subscribe();
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Ok(frame) = frame else { break };
                if socket.send(Message::Text(frame)).await.is_err() {
                    break;
                }
            }
            _ = kick.recv() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            incoming = socket.recv() => {
                if !matches!(incoming, Some(Ok(_))) {
                    break;
                }
            }
        }
    }
}

/// Starts the fake service; returns `(api_base_url, ws_url, state)`.
pub async fn spawn_order_service() -> (String, String, FakeOrderService) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let (frames, _) = broadcast::channel(64);
    let (kick, _) = broadcast::channel(4);
    let state = FakeOrderService {
        orders: Arc::new(Mutex::new(BTreeMap::new())),
        list_calls: Arc::new(Mutex::new(0)),
        fetched_ids: Arc::new(Mutex::new(Vec::new())),
        patches: Arc::new(Mutex::new(Vec::new())),
        creates: Arc::new(Mutex::new(0)),
        unauthorized_calls: Arc::new(Mutex::new(0)),
        patch_failure: Arc::new(Mutex::new(None)),
        patch_delay: Arc::new(Mutex::new(None)),
        fetch_delay: Arc::new(Mutex::new(None)),
        list_delay: Arc::new(Mutex::new(None)),
        ws_connections: Arc::new(Mutex::new(0)),
        frames,
        kick,
    };
    state.serve_on(listener);
    (
        format!("http://{addr}/api"),
        format!("ws://{addr}/ws"),
        state,
    )
}

pub fn build_engine(api_url: &str, auth: AuthSession, timeout: Duration) -> Arc<SyncEngine> {
    let api = OrdersApi::new(api_url, Duration::from_secs(5)).expect("http client");
    SyncEngine::new(api, Arc::new(auth), Arc::new(OrderStore::new()), timeout)
}

pub fn signed_in_engine(api_url: &str) -> Arc<SyncEngine> {
    build_engine(
        api_url,
        AuthSession::in_memory(Some(admin_credentials())),
        Duration::from_secs(5),
    )
}

/// Polls `check` until it holds or two seconds pass.
pub async fn eventually<F>(mut check: F) -> bool
where
    F: FnMut() -> bool,
{
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
