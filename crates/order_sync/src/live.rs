//! Live channel: a long-lived websocket delivering pushed status changes to
//! the engine, reconnecting with backoff and taking a fresh snapshot after
//! every successful open.

use std::{sync::Arc, time::Duration};

use futures::StreamExt;
use shared::protocol::{FrameEnvelope, OrderUpdatePayload, ORDER_UPDATE_FRAME};
use tokio::{sync::watch, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::{
    config::Settings,
    engine::{OrderStatusChanged, SyncEngine},
    error::{SyncError, SyncResult},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Errored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveOptions {
    pub url: String,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl LiveOptions {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self {
            url: settings.live_url()?,
            initial_backoff: settings.reconnect_initial_backoff,
            max_backoff: settings.reconnect_max_backoff,
        })
    }
}

/// Decodes one text frame. Frames of any other `type` yield `Ok(None)`.
pub fn parse_frame(text: &str) -> SyncResult<Option<OrderStatusChanged>> {
    let envelope: FrameEnvelope = serde_json::from_str(text)
        .map_err(|err| SyncError::MalformedEvent(format!("invalid frame: {err}")))?;
    if envelope.kind != ORDER_UPDATE_FRAME {
        return Ok(None);
    }
    let payload: OrderUpdatePayload = serde_json::from_value(envelope.payload).map_err(|err| {
        SyncError::MalformedEvent(format!("invalid {ORDER_UPDATE_FRAME} payload: {err}"))
    })?;
    Ok(Some(payload.into()))
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

pub struct LiveChannel {
    state: watch::Sender<ConnectionState>,
    task: JoinHandle<()>,
}

impl LiveChannel {
    pub fn spawn(engine: Arc<SyncEngine>, settings: &Settings) -> anyhow::Result<Self> {
        Ok(Self::spawn_with(engine, LiveOptions::from_settings(settings)?))
    }

    pub fn spawn_with(engine: Arc<SyncEngine>, options: LiveOptions) -> Self {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let task = tokio::spawn(run(engine, options, state.clone()));
        Self { state, task }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Stops delivery and reconnection. REST calls already issued by the
    /// engine keep running.
    pub fn close(&self) {
        self.task.abort();
        self.state.send_replace(ConnectionState::Closed);
        info!("live: channel closed");
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    engine: Arc<SyncEngine>,
    options: LiveOptions,
    state: watch::Sender<ConnectionState>,
) {
    let mut backoff = options.initial_backoff;

    loop {
        state.send_replace(ConnectionState::Connecting);
        debug!(url = %options.url, "live: connecting");

        let ended = match connect_async(options.url.as_str()).await {
            Ok((mut stream, _)) => {
                state.send_replace(ConnectionState::Open);
                info!(url = %options.url, "live: connected");

                // Anything pushed while disconnected is gone; frames are only
                // delivered on top of a snapshot taken after this open.
                match sync_after_open(&engine).await {
                    Err(err) => {
                        warn!("live: snapshot after connect failed, reconnecting: {err}");
                        let _ = stream.close(None).await;
                        ConnectionState::Errored
                    }
                    Ok(count) => {
                        debug!(count, "live: store synchronized, delivering frames");
                        backoff = options.initial_backoff;
                        loop {
                            match stream.next().await {
                                Some(Ok(Message::Text(text))) => deliver(&engine, &text).await,
                                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                                    Ok(text) => deliver(&engine, &text).await,
                                    Err(err) => {
                                        warn!("live: dropping non-utf8 binary frame: {err}")
                                    }
                                },
                                Some(Ok(Message::Close(_))) | None => {
                                    break ConnectionState::Closed
                                }
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    warn!("live: receive failed: {err}");
                                    break ConnectionState::Errored;
                                }
                            }
                        }
                    }
                }
            }
            Err(err) => {
                warn!(url = %options.url, "live: connect failed: {err}");
                ConnectionState::Errored
            }
        };

        state.send_replace(ended);
        debug!(?ended, delay_ms = backoff.as_millis() as u64, "live: reconnecting after delay");
        tokio::time::sleep(backoff).await;
        backoff = next_backoff(backoff, options.max_backoff);
    }
}

async fn sync_after_open(engine: &SyncEngine) -> SyncResult<usize> {
    if engine.is_initialized() {
        engine.resynchronize().await
    } else {
        engine.initialize().await
    }
}

async fn deliver(engine: &Arc<SyncEngine>, text: &str) {
    match parse_frame(text) {
        Ok(Some(event)) => {
            let order_id = event.order_id.0;
            let outcome = engine.apply_remote_event(event).await;
            debug!(order_id, ?outcome, "live: event delivered");
        }
        Ok(None) => debug!("live: ignoring frame of another type"),
        Err(err) => warn!("live: dropping frame: {err}"),
    }
}

#[cfg(test)]
#[path = "tests/live_tests.rs"]
mod tests;
