use std::borrow::Cow;
use std::fmt::Display;
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::error::{ConnectionError, ProtocolError};
use crate::hub::HubHandle;
use crate::protocol::{Envelope, Event, IdentityPayload};
use crate::registry::{
    ConnectionKey, ConnectionState, RegisterOutcome, RegistryEntry, Role, UpdateOutcome,
};

/// Inbound half of one relayed connection: its identity state plus the means
/// to reach the hub. Consumed by [`Connection::read_pump`].
pub struct Connection {
    state: ConnectionState,
    hub: HubHandle,
    config: Arc<RelayConfig>,
}

/// Receiving end of a connection's outbound queue, drained by [`write_pump`].
pub struct Outbound {
    key: ConnectionKey,
    rx: mpsc::Receiver<String>,
}

impl Connection {
    /// Registers a fresh connection with the hub. The returned [`Outbound`]
    /// closes once the hub forgets the connection.
    pub async fn accept(
        hub: HubHandle,
        config: Arc<RelayConfig>,
    ) -> Result<(Self, Outbound), ConnectionError> {
        let key = ConnectionKey::new();
        let (tx, rx) = mpsc::channel(config.outbound_capacity);
        let state = ConnectionState::new(key);
        match hub.register(RegistryEntry::new(state.clone(), tx)).await? {
            RegisterOutcome::Registered => {}
            RegisterOutcome::Rejected => return Err(ConnectionError::IdConflict(state.id)),
        }

        Ok((Self { state, hub, config }, Outbound { key, rx }))
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// Reads frames until the peer leaves or misbehaves, then unregisters the
    /// connection. Any inbound frame re-arms the read deadline.
    pub async fn read_pump<S, E>(mut self, mut stream: S) -> Result<(), ConnectionError>
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let result = self.read_frames(&mut stream).await;

        if let Err(err) = self
            .hub
            .unregister(self.state.id.clone(), self.state.key)
            .await
        {
            debug!(connection_id = %self.state.id, error = %err, "unregister after read pump failed");
        }
        result
    }

    async fn read_frames<S, E>(&mut self, stream: &mut S) -> Result<(), ConnectionError>
    where
        S: Stream<Item = Result<Message, E>> + Unpin,
        E: Display,
    {
        let deadline = self.config.peer_timeout;
        loop {
            let frame = match timeout(deadline, stream.next()).await {
                Ok(Some(Ok(frame))) => frame,
                Ok(Some(Err(err))) => return Err(ConnectionError::Transport(err.to_string())),
                Ok(None) => return Ok(()),
                Err(_) => return Err(ConnectionError::ReadTimeout(deadline)),
            };

            let text = match frame {
                Message::Text(text) => text,
                Message::Binary(bytes) => {
                    String::from_utf8(bytes).map_err(|_| ProtocolError::NotUtf8)?
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Close(frame) => {
                    debug!(
                        connection_id = %self.state.id,
                        reason = ?frame.map(|f| f.reason.to_string()),
                        "peer closed websocket"
                    );
                    return Ok(());
                }
            };

            let envelope = Envelope::decode(&text)?;
            self.handle(envelope).await?;
        }
    }

    async fn handle(&mut self, envelope: Envelope) -> Result<(), ConnectionError> {
        match envelope.event {
            Event::Identity(payload) => self.handle_identity(envelope.id, payload).await,
            Event::LogLine(payload) => {
                if !self.state.role.is_active() {
                    return Err(ConnectionError::UnsolicitedData);
                }
                self.hub
                    .broadcast_to_peer(payload.line, self.state.id.clone(), self.state.key)
                    .await?;
                Ok(())
            }
            Event::SubscriberAck(_) | Event::Unknown(_) => {
                debug!(
                    connection_id = %self.state.id,
                    event = envelope.event.name(),
                    "ignoring event"
                );
                Ok(())
            }
        }
    }

    async fn handle_identity(
        &mut self,
        announced_id: String,
        payload: IdentityPayload,
    ) -> Result<(), ConnectionError> {
        if self.state.role != Role::Unidentified {
            warn!(
                connection_id = %self.state.id,
                role = ?self.state.role,
                "connection already identified, ignoring identity"
            );
            return Ok(());
        }

        if payload.broadcaster {
            if announced_id.is_empty() {
                return Err(ConnectionError::MissingBroadcasterId);
            }
            let old_id = std::mem::replace(&mut self.state.id, announced_id);
            self.state.role = Role::Broadcaster;
            self.persist(old_id).await?;
            info!(connection_id = %self.state.id, "broadcaster identified");
            return Ok(());
        }

        if payload.peer_id.is_empty() {
            warn!(
                connection_id = %self.state.id,
                "subscriber identity without a peer id, discarding"
            );
            return Ok(());
        }

        // Become an active subscriber before resolving the peer, so a
        // broadcaster leaving in between cascades to this connection.
        let peer_id = payload.peer_id;
        self.state.role = Role::ActiveSubscriber {
            peer_id: peer_id.clone(),
        };
        self.persist(self.state.id.clone()).await?;
        if !self.hub.contains(peer_id.clone()).await? {
            return Err(ConnectionError::PeerNotFound(peer_id));
        }

        let ack = Envelope::subscriber_ack(peer_id.clone()).encode()?;
        self.hub.direct_send(ack, peer_id.clone()).await?;
        info!(connection_id = %self.state.id, peer_id = %peer_id, "subscriber attached");
        Ok(())
    }

    /// Stores the current state under its id, previously known as `old_id`.
    /// Fails once the hub no longer holds this connection.
    async fn persist(&mut self, old_id: String) -> Result<(), ConnectionError> {
        match self.hub.update_id(old_id, self.state.clone()).await? {
            UpdateOutcome::Updated => Ok(()),
            UpdateOutcome::Conflict => Err(ConnectionError::IdConflict(self.state.id.clone())),
            UpdateOutcome::Missing => Err(ConnectionError::Detached),
        }
    }
}

/// Sole writer of a connection's transport. Sends queued messages as they
/// arrive and a ping every keepalive interval; sends a close frame and stops
/// once the queue is closed.
pub async fn write_pump<Si>(
    mut outbound: Outbound,
    mut sink: Si,
    config: Arc<RelayConfig>,
) -> Result<(), ConnectionError>
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let period = config.keepalive_interval();
    let mut keepalive = interval_at(Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            next = outbound.rx.recv() => {
                let Some(first) = next else {
                    close(&mut sink, &config, outbound.key).await;
                    return Ok(());
                };

                // Everything already queued goes out in the same episode.
                write(&mut sink, &config, |sink| sink.feed(Message::Text(first))).await?;
                let mut closed = false;
                loop {
                    match outbound.rx.try_recv() {
                        Ok(message) => {
                            write(&mut sink, &config, |sink| sink.feed(Message::Text(message))).await?;
                        }
                        Err(TryRecvError::Empty) => break,
                        Err(TryRecvError::Disconnected) => {
                            closed = true;
                            break;
                        }
                    }
                }
                write(&mut sink, &config, |sink| sink.flush()).await?;

                if closed {
                    close(&mut sink, &config, outbound.key).await;
                    return Ok(());
                }
            }
            _ = keepalive.tick() => {
                write(&mut sink, &config, |sink| sink.send(Message::Ping(Vec::new())))
                    .await
                    .map_err(|err| ConnectionError::Keepalive(err.to_string()))?;
            }
        }
    }
}

async fn write<'a, Si, F, Fut>(
    sink: &'a mut Si,
    config: &RelayConfig,
    op: F,
) -> Result<(), ConnectionError>
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
    F: FnOnce(&'a mut Si) -> Fut,
    Fut: std::future::Future<Output = Result<(), Si::Error>>,
{
    match timeout(config.write_timeout, op(sink)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(ConnectionError::Transport(err.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout(config.write_timeout)),
    }
}

async fn close<Si>(sink: &mut Si, config: &RelayConfig, key: ConnectionKey)
where
    Si: Sink<Message> + Unpin,
    Si::Error: Display,
{
    let frame = Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: Cow::Borrowed(""),
    }));
    if let Err(err) = write(sink, config, |sink| sink.send(frame)).await {
        debug!(connection_key = %key, error = %err, "failed to send close frame");
    }
}
