use super::*;

use shared::domain::{OrderId, OrderStatus};

use crate::test_support::{
    admin_credentials, eventually, sample_order, signed_in_engine, spawn_order_service,
};

fn options(url: &str) -> LiveOptions {
    LiveOptions {
        url: url.to_string(),
        initial_backoff: Duration::from_millis(50),
        max_backoff: Duration::from_millis(200),
    }
}

fn status_of(engine: &SyncEngine, id: i64) -> Option<OrderStatus> {
    engine.store().get(OrderId(id)).map(|order| order.status)
}

fn counter_is(counter: &tokio::sync::Mutex<u32>, expected: u32) -> bool {
    counter.try_lock().map(|value| *value == expected).unwrap_or(false)
}

fn counter_at_least(counter: &tokio::sync::Mutex<u32>, expected: u32) -> bool {
    counter.try_lock().map(|value| *value >= expected).unwrap_or(false)
}

async fn wait_for_state(channel: &LiveChannel, wanted: ConnectionState) -> bool {
    let mut state = channel.watch_state();
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if *state.borrow_and_update() == wanted {
                return true;
            }
            if state.changed().await.is_err() {
                return false;
            }
        }
    })
    .await
    .unwrap_or(false)
}

#[test]
fn parses_order_update_frame() {
    let event = parse_frame(
        r#"{"type":"order_update","payload":{"order_id":3,"new_status":"shipped","updated_by":"admin"}}"#,
    )
    .expect("valid frame")
    .expect("order update");

    assert_eq!(event.order_id, OrderId(3));
    assert_eq!(event.new_status, OrderStatus::Shipped);
    assert_eq!(event.sequence, None);
    assert_eq!(event.updated_by.as_deref(), Some("admin"));
}

#[test]
fn carries_server_sequence_when_present() {
    let event = parse_frame(
        r#"{"type":"order_update","payload":{"order_id":1,"new_status":"confirmed","sequence":42}}"#,
    )
    .expect("valid frame")
    .expect("order update");

    assert_eq!(event.sequence, Some(42));
}

#[test]
fn ignores_other_frame_types() {
    assert_eq!(
        parse_frame(r#"{"type":"new_order","payload":{"id":9}}"#).expect("valid frame"),
        None
    );
    assert_eq!(parse_frame(r#"{"type":"ping"}"#).expect("valid frame"), None);
}

#[test]
fn rejects_malformed_frames() {
    for frame in [
        "not json",
        r#"{"payload":{"order_id":1,"new_status":"new"}}"#,
        r#"{"type":"order_update","payload":{"order_id":1}}"#,
        r#"{"type":"order_update","payload":{"order_id":1,"new_status":"lost"}}"#,
        r#"{"type":"order_update","payload":{"order_id":"one","new_status":"new"}}"#,
    ] {
        assert!(
            matches!(parse_frame(frame), Err(SyncError::MalformedEvent(_))),
            "frame should be rejected: {frame}"
        );
    }
}

#[test]
fn backoff_doubles_up_to_the_cap() {
    let max = Duration::from_secs(30);
    let mut delay = Duration::from_millis(500);
    let mut seen = Vec::new();
    for _ in 0..8 {
        seen.push(delay.as_millis());
        delay = next_backoff(delay, max);
    }
    assert_eq!(
        seen,
        vec![500, 1_000, 2_000, 4_000, 8_000, 16_000, 30_000, 30_000]
    );
}

#[tokio::test]
async fn first_open_initializes_and_delivers_updates() {
    let (api_url, ws_url, server) = spawn_order_service().await;
    server
        .seed([
            sample_order(1, OrderStatus::New),
            sample_order(2, OrderStatus::Confirmed),
        ])
        .await;
    let engine = signed_in_engine(&api_url);

    let channel = LiveChannel::spawn_with(Arc::clone(&engine), options(&ws_url));

    assert!(eventually(|| engine.is_initialized() && server.live_subscribers() == 1).await);
    assert_eq!(channel.state(), ConnectionState::Open);
    assert_eq!(engine.store().len(), 2);

    server.push_update(1, OrderStatus::Confirmed, None);
    assert!(eventually(|| status_of(&engine, 1) == Some(OrderStatus::Confirmed)).await);

    channel.close();
}

#[tokio::test]
async fn malformed_and_foreign_frames_do_not_close_the_channel() {
    let (api_url, ws_url, server) = spawn_order_service().await;
    server.seed([sample_order(1, OrderStatus::New)]).await;
    let engine = signed_in_engine(&api_url);
    let channel = LiveChannel::spawn_with(Arc::clone(&engine), options(&ws_url));
    assert!(eventually(|| engine.is_initialized() && server.live_subscribers() == 1).await);

    server.push_raw("{not json");
    server.push_raw(r#"{"type":"order_update","payload":{"order_id":1,"new_status":"lost"}}"#);
    server.push_raw(r#"{"type":"new_order","payload":{"id":1}}"#);
    server.push_update(1, OrderStatus::Cancelled, None);

    assert!(eventually(|| status_of(&engine, 1) == Some(OrderStatus::Cancelled)).await);
    assert_eq!(channel.state(), ConnectionState::Open);
    assert_eq!(*server.ws_connections.lock().await, 1);

    channel.close();
}

#[tokio::test]
async fn reconnect_triggers_full_resync() {
    let (api_url, ws_url, server) = spawn_order_service().await;
    server
        .seed([
            sample_order(1, OrderStatus::New),
            sample_order(2, OrderStatus::Confirmed),
        ])
        .await;
    let engine = signed_in_engine(&api_url);
    let channel = LiveChannel::spawn_with(Arc::clone(&engine), options(&ws_url));
    assert!(eventually(|| engine.is_initialized() && server.live_subscribers() == 1).await);
    assert_eq!(*server.list_calls.lock().await, 1);

    server.set_status_silently(2, OrderStatus::Cancelled).await;
    server.drop_connections();

    assert!(eventually(|| counter_is(&server.ws_connections, 2)).await);
    assert!(eventually(|| status_of(&engine, 2) == Some(OrderStatus::Cancelled)).await);
    assert!(eventually(|| counter_is(&server.list_calls, 2)).await);
    assert!(eventually(|| channel.state() == ConnectionState::Open).await);

    channel.close();
}

#[tokio::test]
async fn pushed_update_for_unknown_order_fetches_only_that_order() {
    let (api_url, ws_url, server) = spawn_order_service().await;
    server
        .seed([
            sample_order(1, OrderStatus::New),
            sample_order(2, OrderStatus::Confirmed),
        ])
        .await;
    let engine = signed_in_engine(&api_url);
    let channel = LiveChannel::spawn_with(Arc::clone(&engine), options(&ws_url));
    assert!(eventually(|| engine.is_initialized() && server.live_subscribers() == 1).await);

    server.seed([sample_order(3, OrderStatus::Confirmed)]).await;
    server.push_update(3, OrderStatus::Shipped, None);

    assert!(eventually(|| status_of(&engine, 3) == Some(OrderStatus::Shipped)).await);
    assert_eq!(server.fetched_ids.lock().await.clone(), vec![3]);
    assert_eq!(*server.list_calls.lock().await, 1);

    channel.close();
}

#[tokio::test]
async fn close_stops_delivery() {
    let (api_url, ws_url, server) = spawn_order_service().await;
    server.seed([sample_order(1, OrderStatus::New)]).await;
    let engine = signed_in_engine(&api_url);
    let channel = LiveChannel::spawn_with(Arc::clone(&engine), options(&ws_url));
    assert!(eventually(|| engine.is_initialized() && server.live_subscribers() == 1).await);
    let mut state = channel.watch_state();

    channel.close();

    assert_eq!(channel.state(), ConnectionState::Closed);
    assert_eq!(*state.borrow_and_update(), ConnectionState::Closed);
    assert!(eventually(|| server.live_subscribers() == 0).await);
    server.push_update(1, OrderStatus::Confirmed, None);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(status_of(&engine, 1), Some(OrderStatus::New));
}

#[tokio::test]
async fn unreachable_endpoint_reports_errored_and_keeps_retrying() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    let (api_url, _, _server) = spawn_order_service().await;
    let engine = signed_in_engine(&api_url);

    let channel = LiveChannel::spawn_with(Arc::clone(&engine), options(&format!("ws://{addr}/ws")));
    let mut state = channel.watch_state();

    let errored = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if *state.borrow_and_update() == ConnectionState::Errored {
                return;
            }
            if state.changed().await.is_err() {
                return;
            }
        }
    })
    .await;
    assert!(errored.is_ok());
    assert!(!engine.is_initialized());

    channel.close();
}

#[tokio::test]
async fn first_open_after_failed_attempts_resyncs_an_initialized_engine() {
    let (api_url, _, server) = spawn_order_service().await;
    server.seed([sample_order(1, OrderStatus::New)]).await;
    let engine = signed_in_engine(&api_url);
    engine.initialize().await.expect("initialize");

    let reserved = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind");
    let addr = reserved.local_addr().expect("addr");
    drop(reserved);
    let channel = LiveChannel::spawn_with(Arc::clone(&engine), options(&format!("ws://{addr}/ws")));
    assert!(wait_for_state(&channel, ConnectionState::Errored).await);

    server.set_status_silently(1, OrderStatus::Cancelled).await;
    let listener = tokio::net::TcpListener::bind(addr).await.expect("rebind");
    server.serve_on(listener);

    assert!(eventually(|| status_of(&engine, 1) == Some(OrderStatus::Cancelled)).await);
    assert!(eventually(|| counter_is(&server.list_calls, 2)).await);
    assert!(eventually(|| channel.state() == ConnectionState::Open).await);

    channel.close();
}

#[tokio::test]
async fn failed_resync_reconnects_until_a_snapshot_succeeds() {
    let (api_url, ws_url, server) = spawn_order_service().await;
    server.seed([sample_order(1, OrderStatus::New)]).await;
    let engine = signed_in_engine(&api_url);
    let channel = LiveChannel::spawn_with(Arc::clone(&engine), options(&ws_url));
    assert!(eventually(|| engine.is_initialized() && server.live_subscribers() == 1).await);

    engine.auth().teardown().await.expect("teardown");
    server.set_status_silently(1, OrderStatus::Cancelled).await;
    server.drop_connections();

    assert!(eventually(|| counter_at_least(&server.ws_connections, 3)).await);
    assert_eq!(status_of(&engine, 1), Some(OrderStatus::New));
    assert_eq!(*server.list_calls.lock().await, 1);

    engine
        .auth()
        .sign_in(admin_credentials())
        .await
        .expect("sign in");

    assert!(eventually(|| status_of(&engine, 1) == Some(OrderStatus::Cancelled)).await);
    assert!(eventually(|| counter_is(&server.list_calls, 2)).await);
    assert!(eventually(|| channel.state() == ConnectionState::Open).await);

    channel.close();
}
