use chatline_core::authorization::{authorize_subscribe, SubscribeOptions};
use chatline_core::enrichment::publish_enriched;
use chatline_core::hub::SessionSink;
use chatline_core::presence::{channel_presence_stats, SubscriptionEvent};
use chatline_core::{rpc, AppState, CoreError};
use chatline_models::channel::{Channel, ChannelParseError};
use chatline_models::gateway::{ChannelRequest, ClientCommand, PublishRequest, SubscribeRequest};
use chatline_models::presence::ClientInfo;
use serde_json::{json, Value};

use crate::session::ConnectionSession;

/// Everything a command needs from the connection that issued it.
pub(crate) struct CommandContext<'a> {
    pub state: &'a AppState,
    pub session: &'a mut ConnectionSession,
    pub sink: &'a SessionSink,
}

impl CommandContext<'_> {
    fn identity(&self) -> Result<(i64, ClientInfo), CoreError> {
        match (self.session.user_id(), self.session.client_info()) {
            (Some(user_id), Some(info)) => Ok((user_id, info)),
            _ => Err(CoreError::AuthenticationAbsent),
        }
    }

    fn require_subscribed(&self, channel: &str) -> Result<(), CoreError> {
        if self.session.is_subscribed(channel) {
            Ok(())
        } else {
            Err(CoreError::NotSubscribed)
        }
    }
}

/// Run one non-heartbeat command and produce the reply body.
pub(crate) async fn execute(
    ctx: &mut CommandContext<'_>,
    command: ClientCommand,
) -> Result<Value, CoreError> {
    if !ctx.session.is_connected() {
        return Err(CoreError::AuthenticationAbsent);
    }
    match command {
        ClientCommand::Heartbeat => Ok(Value::Null),
        ClientCommand::Subscribe(req) => subscribe(ctx, req).await,
        ClientCommand::Unsubscribe(req) => unsubscribe(ctx, req).await,
        ClientCommand::Publish(req) => publish(ctx, req).await,
        ClientCommand::Presence(req) => {
            ctx.identity()?;
            ctx.require_subscribed(&req.channel)?;
            let presence = ctx.state.broker.presence(&req.channel).await?;
            Ok(json!({ "presence": presence }))
        }
        ClientCommand::PresenceStats(req) => {
            ctx.identity()?;
            ctx.require_subscribed(&req.channel)?;
            let stats = ctx.state.broker.presence_stats(&req.channel).await?;
            Ok(json!({ "num_clients": stats.num_clients, "num_users": stats.num_users }))
        }
        ClientCommand::Rpc(req) => {
            let (user_id, _) = ctx.identity()?;
            let result = rpc::dispatch(&ctx.state.db, user_id, &req.method, &req.data).await?;
            Ok(json!({ "data": result }))
        }
        ClientCommand::Refresh => {
            ctx.identity()?;
            let ttl = ctx.state.config.session_ttl;
            let expires = ctx
                .session
                .refresh(ttl)
                .ok_or(CoreError::AuthenticationAbsent)?;
            tracing::debug!(session_id = %ctx.session.session_id, %expires, "connection refreshed");
            Ok(json!({ "expires": expires.timestamp(), "ttl": ttl.as_secs() }))
        }
        ClientCommand::SubRefresh(req) => {
            ctx.identity()?;
            let ttl = ctx.state.config.subscription_ttl;
            if !ctx.session.refresh_subscription(&req.channel, ttl) {
                return Err(CoreError::NotSubscribed);
            }
            Ok(json!({ "ttl": ttl.as_secs() }))
        }
    }
}

async fn subscribe(
    ctx: &mut CommandContext<'_>,
    req: SubscribeRequest,
) -> Result<Value, CoreError> {
    let (user_id, info) = ctx.identity()?;
    let requested = Channel::parse(&req.channel)?;
    if !requested.is_personal() && ctx.session.is_subscribed(&requested.name()) {
        return Err(CoreError::AlreadySubscribed);
    }
    let grant = authorize_subscribe(&ctx.state.db, user_id, &req.channel).await?;
    let channel = grant.channel.name();
    let session_id = ctx.session.session_id.clone();

    ctx.state.hub.subscribe(&channel, &session_id, ctx.sink.clone());
    ctx.session.add_subscription(
        &channel,
        grant.options,
        Some(ctx.state.config.subscription_ttl),
    );

    let position = match req.recovery_position().filter(|_| grant.options.recover) {
        Some(since) => ctx
            .state
            .broker
            .history_since(&channel, &since)
            .await
            .map(|recovery| {
                json!({
                    "channel": channel,
                    "recoverable": true,
                    "recovered": recovery.recovered,
                    "offset": recovery.position.offset,
                    "epoch": recovery.position.epoch,
                    "publications": recovery.publications,
                })
            }),
        None => ctx.state.broker.stream_top(&channel).await.map(|top| {
            json!({
                "channel": channel,
                "recoverable": grant.options.recover,
                "offset": top.offset,
                "epoch": top.epoch,
            })
        }),
    };
    let reply = match position {
        Ok(reply) => reply,
        Err(err) => {
            ctx.state.hub.unsubscribe(&channel, &session_id);
            ctx.session.remove_subscription(&channel);
            tracing::error!(
                session_id = %session_id,
                user_id,
                channel = %channel,
                error = %err,
                "subscribe failed"
            );
            return Err(err.into());
        }
    };

    if grant.options.presence {
        if let Err(err) = ctx.state.broker.add_presence(&channel, &session_id, &info).await {
            tracing::warn!(
                session_id = %session_id,
                channel = %channel,
                error = %err,
                "presence add failed"
            );
        }
    }
    if grant.options.join_leave {
        if let Err(err) = ctx.state.broker.publish_join(&channel, &info).await {
            tracing::warn!(
                session_id = %session_id,
                channel = %channel,
                error = %err,
                "join publish failed"
            );
        }
    }
    channel_presence_stats(
        &ctx.state.broker,
        &session_id,
        user_id,
        &SubscriptionEvent::Subscribe { channel },
    )
    .await;
    Ok(reply)
}

async fn unsubscribe(
    ctx: &mut CommandContext<'_>,
    req: ChannelRequest,
) -> Result<Value, CoreError> {
    let (user_id, info) = ctx.identity()?;
    let requested = Channel::parse(&req.channel)?;
    if requested.is_personal() {
        return Err(ChannelParseError::ServerSideOnly(req.channel).into());
    }
    let channel = requested.name();
    let session_id = ctx.session.session_id.clone();
    let Some(subscription) = ctx.session.remove_subscription(&channel) else {
        return Err(CoreError::NotSubscribed);
    };
    ctx.state.hub.unsubscribe(&channel, &session_id);
    release_channel(ctx.state, &channel, &session_id, &info, subscription.options).await;
    channel_presence_stats(
        &ctx.state.broker,
        &session_id,
        user_id,
        &SubscriptionEvent::Unsubscribe { channel },
    )
    .await;
    Ok(json!({}))
}

/// Presence removal and leave notification after a subscription ends while
/// the connection stays up.
pub(crate) async fn release_channel(
    state: &AppState,
    channel: &str,
    session_id: &str,
    info: &ClientInfo,
    options: SubscribeOptions,
) {
    if options.presence {
        if let Err(err) = state.broker.remove_presence(channel, session_id).await {
            tracing::warn!(session_id, channel, error = %err, "presence removal failed");
        }
    }
    if options.join_leave {
        if let Err(err) = state.broker.publish_leave(channel, info).await {
            tracing::warn!(session_id, channel, error = %err, "leave publish failed");
        }
    }
}

async fn publish(ctx: &mut CommandContext<'_>, req: PublishRequest) -> Result<Value, CoreError> {
    let (_, info) = ctx.identity()?;
    let channel = Channel::parse(&req.channel)?;
    if channel.is_personal() {
        return Err(CoreError::AuthorizationDenied);
    }
    let channel = channel.name();
    ctx.require_subscribed(&channel)?;
    let position = publish_enriched(
        &ctx.state.broker,
        ctx.state.config.history(),
        &channel,
        &req.data,
        &info,
    )
    .await?;
    Ok(json!({ "offset": position.offset, "epoch": position.epoch }))
}
