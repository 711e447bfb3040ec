use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use chatline_core::authorization::SubscribeOptions;
use chatline_core::hub::{ChannelEvent, Delivery, SessionQueue, SessionSink};
use chatline_core::limits::SlotError;
use chatline_core::presence::{channel_presence_stats, SubscriptionEvent};
use chatline_core::{AppState, CoreError};
use chatline_models::channel::Channel;
use chatline_models::credential::Credential;
use chatline_models::gateway::*;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::commands::{self, CommandContext};
use crate::session::{ConnectionSession, ConnectionState};

const PING_INTERVAL: Duration = Duration::from_secs(20);
const SUBSCRIPTION_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Stand-in deadline for sessions that never expire.
const NO_EXPIRY: Duration = Duration::from_secs(86_400 * 365);

/// Why the event loop stopped, and which close frame to send, if any.
struct Disconnect {
    reason: String,
    close: Option<(u16, &'static str)>,
}

impl Disconnect {
    fn quiet(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            close: None,
        }
    }

    fn closing(code: u16, reason: &'static str) -> Self {
        Self {
            reason: reason.to_string(),
            close: Some((code, reason)),
        }
    }
}

async fn send_frame(
    sender: &mut (impl SinkExt<Message> + Unpin),
    session_id: &str,
    frame: &GatewayMessage,
) -> Result<(), ()> {
    let payload = match serde_json::to_string(frame) {
        Ok(payload) => payload,
        Err(err) => {
            tracing::error!(session_id, op = frame.op, error = %err, "frame encoding failed");
            return Err(());
        }
    };
    tracing::trace!(session_id, op = frame.op, event = ?frame.t, "ws out");
    sender
        .send(Message::Text(payload.into()))
        .await
        .map_err(|_| ())
}

async fn send_close(
    sender: &mut (impl SinkExt<Message> + Unpin),
    session_id: &str,
    code: u16,
    reason: &str,
) {
    tracing::debug!(session_id, code, reason, "ws close");
    let _ = sender
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.to_string().into(),
        })))
        .await;
}

pub async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    credential: Option<Credential>,
) {
    let user_id = credential.as_ref().map(|c| c.user_id);
    let slot = match state.connections.try_acquire(user_id) {
        Ok(slot) => slot,
        Err(err) => {
            let (mut sender, _) = socket.split();
            let code = match err {
                SlotError::GlobalCapacity => CLOSE_GLOBAL_CAPACITY,
                SlotError::UserCapacity => CLOSE_USER_CAPACITY,
            };
            tracing::warn!(user_id, error = %err, "connection refused");
            let reason = err.to_string();
            send_close(&mut sender, "-", code, &reason).await;
            return;
        }
    };

    let (mut sender, mut receiver) = socket.split();
    let mut session = ConnectionSession::new(credential, state.config.session_ttl);
    let (sink, mut queue) = SessionSink::channel(state.config.outbound_queue_size);

    let subs = if session.credential.is_some() {
        subscribe_personal(&state, &mut session, &sink).await
    } else {
        json!({})
    };

    let mut connected = json!({
        "client": session.session_id,
        "heartbeat_interval": state.config.heartbeat_interval.as_millis() as u64,
        "subs": subs,
    });
    if let (Some(user_id), Some(expires)) = (session.user_id(), session.expires_at()) {
        connected["user"] = json!(user_id.to_string());
        connected["expires"] = json!(expires.timestamp());
        connected["ttl"] = json!(state.config.session_ttl.as_secs());
    }
    if send_frame(&mut sender, &session.session_id, &GatewayMessage::connected(connected))
        .await
        .is_err()
    {
        disconnect(&state, &mut session, "connected frame send failed").await;
        drop(slot);
        return;
    }
    session.state = ConnectionState::Connected;
    tracing::info!(
        session_id = %session.session_id,
        user_id = session.user_id(),
        "client connected"
    );

    let outcome = run_event_loop(
        &state,
        &mut session,
        &sink,
        &mut queue,
        &mut sender,
        &mut receiver,
    )
    .await;
    if let Some((code, reason)) = outcome.close {
        send_close(&mut sender, &session.session_id, code, reason).await;
    }
    disconnect(&state, &mut session, &outcome.reason).await;
    drop(slot);
}

/// Server-side subscription of an authenticated session to its personal
/// channel. Returns the `subs` map announced in the connected frame.
async fn subscribe_personal(
    state: &AppState,
    session: &mut ConnectionSession,
    sink: &SessionSink,
) -> Value {
    let (Some(user_id), Some(info)) = (session.user_id(), session.client_info()) else {
        return json!({});
    };
    let channel = Channel::personal(user_id).name();
    let options = SubscribeOptions::full();
    state.hub.subscribe(&channel, &session.session_id, sink.clone());
    session.add_subscription(&channel, options, None);

    if let Err(err) = state
        .broker
        .add_presence(&channel, &session.session_id, &info)
        .await
    {
        tracing::warn!(
            session_id = %session.session_id,
            channel = %channel,
            error = %err,
            "presence add failed"
        );
    }
    if let Err(err) = state.broker.publish_join(&channel, &info).await {
        tracing::warn!(
            session_id = %session.session_id,
            channel = %channel,
            error = %err,
            "join publish failed"
        );
    }
    let position = match state.broker.stream_top(&channel).await {
        Ok(top) => json!({ "recoverable": true, "offset": top.offset, "epoch": top.epoch }),
        Err(err) => {
            tracing::warn!(
                session_id = %session.session_id,
                channel = %channel,
                error = %err,
                "stream position unavailable"
            );
            json!({ "recoverable": true })
        }
    };
    channel_presence_stats(
        &state.broker,
        &session.session_id,
        user_id,
        &SubscriptionEvent::Subscribe {
            channel: channel.clone(),
        },
    )
    .await;
    let mut subs = serde_json::Map::new();
    subs.insert(channel, position);
    Value::Object(subs)
}

async fn run_event_loop(
    state: &AppState,
    session: &mut ConnectionSession,
    sink: &SessionSink,
    queue: &mut SessionQueue,
    sender: &mut (impl SinkExt<Message> + Unpin),
    receiver: &mut (impl StreamExt<Item = Result<Message, axum::Error>> + Unpin),
) -> Disconnect {
    let heartbeat_timeout = state.config.heartbeat_timeout;
    let heartbeat_sleep = tokio::time::sleep(heartbeat_timeout);
    tokio::pin!(heartbeat_sleep);
    let expiry_sleep = tokio::time::sleep_until(
        session.deadline().unwrap_or_else(|| Instant::now() + NO_EXPIRY),
    );
    tokio::pin!(expiry_sleep);

    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut sweep_interval = tokio::time::interval(SUBSCRIPTION_SWEEP_INTERVAL);
    sweep_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let presence_period = (state.config.presence_ttl / 3).max(Duration::from_millis(100));
    let mut presence_interval =
        tokio::time::interval_at(Instant::now() + presence_period, presence_period);
    presence_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                break Disconnect::closing(CLOSE_SHUTDOWN, "shutdown");
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let frame: GatewayMessage = match serde_json::from_str(text.as_str()) {
                            Ok(frame) => frame,
                            Err(err) => {
                                tracing::debug!(
                                    session_id = %session.session_id,
                                    error = %err,
                                    "malformed frame"
                                );
                                let reply = GatewayMessage::error_reply(
                                    None,
                                    ERROR_BAD_REQUEST,
                                    "malformed frame",
                                );
                                if send_frame(sender, &session.session_id, &reply).await.is_err() {
                                    break Disconnect::quiet("websocket send error");
                                }
                                continue;
                            }
                        };
                        if frame.op == OP_HEARTBEAT {
                            heartbeat_sleep.as_mut().reset(Instant::now() + heartbeat_timeout);
                            let ack = GatewayMessage::heartbeat_ack();
                            if send_frame(sender, &session.session_id, &ack).await.is_err() {
                                break Disconnect::quiet("websocket send error");
                            }
                            continue;
                        }

                        let (reply, cancelled) = handle_command(state, session, sink, frame).await;
                        if send_frame(sender, &session.session_id, &reply).await.is_err() {
                            break Disconnect::quiet("websocket send error");
                        }
                        if cancelled {
                            break Disconnect::closing(CLOSE_SHUTDOWN, "shutdown");
                        }
                        expiry_sleep.as_mut().reset(
                            session.deadline().unwrap_or_else(|| Instant::now() + NO_EXPIRY),
                        );
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break Disconnect::quiet(match frame {
                            Some(frame) => format!(
                                "client close frame (code={}, reason={})",
                                frame.code, frame.reason
                            ),
                            None => "client close frame (no code/reason)".to_string(),
                        });
                    }
                    Some(Err(err)) => {
                        break Disconnect::quiet(format!("websocket receive error: {err}"));
                    }
                    None => {
                        break Disconnect::quiet("websocket stream ended");
                    }
                    _ => {}
                }
            }
            Some(delivery) = queue.deliveries.recv() => {
                if let Some(frame) = dispatch_frame(session, &delivery) {
                    if send_frame(sender, &session.session_id, &frame).await.is_err() {
                        break Disconnect::quiet("websocket send error");
                    }
                }
            }
            _ = queue.overflow.notified() => {
                tracing::warn!(session_id = %session.session_id, "outbound queue overflow");
                break Disconnect::closing(CLOSE_SLOW, "slow");
            }
            () = &mut heartbeat_sleep => {
                break Disconnect::quiet(format!(
                    "heartbeat timeout after {}ms",
                    heartbeat_timeout.as_millis()
                ));
            }
            () = &mut expiry_sleep => {
                break Disconnect::closing(CLOSE_EXPIRED, "expired");
            }
            _ = sweep_interval.tick() => {
                if expire_subscriptions(state, session, sender).await.is_err() {
                    break Disconnect::quiet("websocket send error");
                }
            }
            _ = presence_interval.tick(), if session.credential.is_some() => {
                refresh_presence(state, session).await;
            }
            _ = ping_interval.tick() => {
                if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break Disconnect::quiet("websocket ping send error");
                }
            }
        }
    }
}

/// Decode, rate limit and execute one command, producing its reply frame
/// and whether shutdown cut it short.
async fn handle_command(
    state: &AppState,
    session: &mut ConnectionSession,
    sink: &SessionSink,
    frame: GatewayMessage,
) -> (GatewayMessage, bool) {
    let id = frame.id;
    let command = match ClientCommand::decode(frame.op, frame.d) {
        Ok(command) => command,
        Err(err) => {
            tracing::debug!(session_id = %session.session_id, error = %err, "undecodable command");
            return (
                GatewayMessage::error_reply(id, ERROR_BAD_REQUEST, err.to_string()),
                false,
            );
        }
    };
    let name = command.name();

    let result = match session.user_id() {
        None => Err(CoreError::AuthenticationAbsent),
        Some(user_id) => match state.rate_limits.check(user_id) {
            Err(retry_after_ms) => Err(CoreError::RateLimited { retry_after_ms }),
            Ok(()) => {
                let mut ctx = CommandContext {
                    state,
                    session: &mut *session,
                    sink,
                };
                tokio::select! {
                    biased;
                    _ = state.shutdown.cancelled() => Err(CoreError::Cancelled),
                    result = commands::execute(&mut ctx, command) => result,
                }
            }
        },
    };

    match result {
        Ok(d) => (GatewayMessage::reply(id, d), false),
        Err(err) => {
            match &err {
                CoreError::Backend(_) | CoreError::Database(_) => tracing::error!(
                    session_id = %session.session_id,
                    command = name,
                    error = %err,
                    "command failed"
                ),
                _ => tracing::info!(
                    session_id = %session.session_id,
                    user_id = session.user_id(),
                    command = name,
                    error = %err,
                    "command rejected"
                ),
            }
            let cancelled = matches!(err, CoreError::Cancelled);
            (
                GatewayMessage::error_reply(id, err.code(), err.client_message()),
                cancelled,
            )
        }
    }
}

/// Turn a hub delivery into a dispatch frame, honoring the subscription's
/// join/leave setting. Deliveries for channels the session already left are
/// dropped.
fn dispatch_frame(session: &ConnectionSession, delivery: &Delivery) -> Option<GatewayMessage> {
    let subscription = session.subscription(&delivery.channel)?;
    let (event, mut d) = match &delivery.event {
        ChannelEvent::Publication(publication) => {
            (EVENT_PUBLICATION, serde_json::to_value(publication).ok()?)
        }
        ChannelEvent::Join(info) if subscription.options.join_leave => {
            (EVENT_JOIN, json!({ "info": info }))
        }
        ChannelEvent::Leave(info) if subscription.options.join_leave => {
            (EVENT_LEAVE, json!({ "info": info }))
        }
        _ => return None,
    };
    d["channel"] = json!(delivery.channel);
    Some(GatewayMessage::dispatch(event, d))
}

/// End client subscriptions whose refresh deadline passed.
async fn expire_subscriptions(
    state: &AppState,
    session: &mut ConnectionSession,
    sender: &mut (impl SinkExt<Message> + Unpin),
) -> Result<(), ()> {
    let expired = session.expired_subscriptions(Instant::now());
    if expired.is_empty() {
        return Ok(());
    }
    let Some(info) = session.client_info() else {
        return Ok(());
    };
    for channel in expired {
        let Some(subscription) = session.remove_subscription(&channel) else {
            continue;
        };
        state.hub.unsubscribe(&channel, &session.session_id);
        commands::release_channel(state, &channel, &session.session_id, &info, subscription.options)
            .await;
        tracing::info!(
            session_id = %session.session_id,
            channel = %channel,
            "subscription expired"
        );
        let frame = GatewayMessage::dispatch(
            EVENT_UNSUBSCRIBED,
            json!({ "channel": channel, "reason": "expired" }),
        );
        send_frame(sender, &session.session_id, &frame).await?;
    }
    Ok(())
}

/// Re-announce presence so live sessions outlast the broker's presence TTL.
async fn refresh_presence(state: &AppState, session: &ConnectionSession) {
    let Some(info) = session.client_info() else {
        return;
    };
    for channel in session.channels_with(|options| options.presence) {
        if let Err(err) = state
            .broker
            .add_presence(&channel, &session.session_id, &info)
            .await
        {
            tracing::warn!(
                session_id = %session.session_id,
                channel = %channel,
                error = %err,
                "presence refresh failed"
            );
        }
    }
}

/// Leave the hub and tell join/leave subscribers. Presence entries are left
/// to expire through the broker's TTL.
async fn disconnect(state: &AppState, session: &mut ConnectionSession, reason: &str) {
    session.state = ConnectionState::Disconnected;
    let channels: Vec<String> = session.channels().map(str::to_string).collect();
    state
        .hub
        .remove_session(&session.session_id, channels.iter().map(String::as_str));
    if let Some(info) = session.client_info() {
        for channel in session.channels_with(|options| options.join_leave) {
            if let Err(err) = state.broker.publish_leave(&channel, &info).await {
                tracing::debug!(
                    session_id = %session.session_id,
                    channel = %channel,
                    error = %err,
                    "leave publish failed"
                );
            }
        }
    }
    tracing::info!(
        session_id = %session.session_id,
        user_id = session.user_id(),
        channels = channels.len(),
        reason,
        "client disconnected"
    );
}
