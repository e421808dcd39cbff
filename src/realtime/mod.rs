//! Realtime change-feed client
//!
//! Connects to the backend's realtime WebSocket, joins a channel bound to
//! inserts on the `messages` relation and forwards decoded rows onto an mpsc
//! channel in delivery order.

pub mod protocol;
pub mod socket;

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Instant};

use crate::api::{GatewayError, InsertFilter};
use crate::models::MessageEvent;
use protocol::Frame;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);
const MAX_BACKOFF_SECS: u64 = 64;

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct RealtimeTarget {
    pub ws_url: String,
    pub access_token: String,
    /// Channel topic, e.g. `realtime:messages-<user>`
    pub topic: String,
}

/// Reason the inner connection loop exited.
enum DisconnectReason {
    /// Subscription cancelled or receiver dropped. Do not reconnect.
    Shutdown,
    /// Error or server-initiated close. Should reconnect.
    Error(GatewayError),
}

/// Run a subscription with automatic reconnection until cancelled.
///
/// On transient errors or server-initiated disconnects, reconnects with
/// exponential backoff (1s, 2s, 4s, ... capped at 64s). A session that
/// stayed up for a minute resets the backoff.
pub async fn run_subscription(
    target: RealtimeTarget,
    filter: InsertFilter,
    events: mpsc::UnboundedSender<MessageEvent>,
    mut cancel: watch::Receiver<bool>,
) {
    let mut backoff = 1u64;
    let stability_threshold = Duration::from_secs(60);

    loop {
        let started = Instant::now();
        let reason = match connect_and_run_inner(&target, &filter, &events, &mut cancel).await {
            Ok(reason) => reason,
            Err(e) => DisconnectReason::Error(e),
        };

        let e = match reason {
            DisconnectReason::Shutdown => {
                tracing::info!("Realtime subscription {} stopped", target.topic);
                return;
            }
            DisconnectReason::Error(e) => e,
        };

        if started.elapsed() >= stability_threshold {
            backoff = 1;
        }
        tracing::warn!(
            "Realtime disconnected: {}. Reconnecting in {}s...",
            e,
            backoff
        );

        tokio::select! {
            _ = time::sleep(Duration::from_secs(backoff)) => {}
            _ = cancel.changed() => {
                tracing::info!("Realtime subscription {} cancelled", target.topic);
                return;
            }
        }

        backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
    }
}

/// Run one session: connect, join, then pump frames until something breaks.
async fn connect_and_run_inner(
    target: &RealtimeTarget,
    filter: &InsertFilter,
    events: &mpsc::UnboundedSender<MessageEvent>,
    cancel: &mut watch::Receiver<bool>,
) -> Result<DisconnectReason, GatewayError> {
    if *cancel.borrow() {
        return Ok(DisconnectReason::Shutdown);
    }

    let mut ws = socket::RealtimeSocket::connect(&target.ws_url).await?;
    let mut next_ref = 1u64;

    ws.send_frame(&Frame::join(
        &target.topic,
        filter,
        &target.access_token,
        next_ref,
    ))
    .await?;
    let join_ref = next_ref.to_string();
    next_ref += 1;

    let mut heartbeat = time::interval(HEARTBEAT_INTERVAL);
    heartbeat.tick().await; // skip first immediate tick

    let reason = loop {
        tokio::select! {
            frame = ws.recv_frame() => {
                match frame {
                    Ok(Some(frame)) => {
                        if let Some(reason) = handle_frame(&frame, &target.topic, &join_ref, events) {
                            break reason;
                        }
                    }
                    Ok(None) => {
                        break DisconnectReason::Error(GatewayError::Realtime(
                            "WebSocket closed by server".to_string(),
                        ));
                    }
                    Err(e) => break DisconnectReason::Error(e),
                }
            }
            _ = heartbeat.tick() => {
                if let Err(e) = ws.send_frame(&Frame::heartbeat(next_ref)).await {
                    break DisconnectReason::Error(e);
                }
                next_ref += 1;
            }
            _ = cancel.changed() => {
                break DisconnectReason::Shutdown;
            }
            _ = events.closed() => {
                tracing::debug!("Event receiver dropped");
                break DisconnectReason::Shutdown;
            }
        }
    };

    if matches!(reason, DisconnectReason::Shutdown) {
        let _ = ws.send_frame(&Frame::leave(&target.topic, next_ref)).await;
        ws.close().await;
    }

    Ok(reason)
}

/// Handle one incoming frame. Returns a reason when the session must end.
fn handle_frame(
    frame: &Frame,
    topic: &str,
    join_ref: &str,
    events: &mpsc::UnboundedSender<MessageEvent>,
) -> Option<DisconnectReason> {
    if frame.topic == protocol::PHOENIX_TOPIC {
        // heartbeat replies
        return None;
    }
    if frame.topic != topic {
        tracing::debug!("Frame for unexpected topic {}", frame.topic);
        return None;
    }

    if frame.reference.as_deref() == Some(join_ref) {
        match frame.reply_status() {
            Some("ok") => tracing::info!("Joined realtime channel {}", topic),
            Some(status) => {
                return Some(DisconnectReason::Error(GatewayError::Realtime(format!(
                    "join rejected ({}): {}",
                    status, frame.payload
                ))));
            }
            None => {}
        }
        return None;
    }

    if frame.is_channel_failure() {
        return Some(DisconnectReason::Error(GatewayError::Realtime(format!(
            "channel {} closed by server ({})",
            topic, frame.event
        ))));
    }

    if let Some(event) = frame.message_event() {
        tracing::debug!("Realtime insert {}", event.message().id);
        if events.send(event).is_err() {
            return Some(DisconnectReason::Shutdown);
        }
    }

    None
}
