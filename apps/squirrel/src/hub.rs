use metrics::{counter, decrement_gauge, increment_gauge};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::HubError;
use crate::registry::{
    ConnectionId, ConnectionKey, ConnectionSnapshot, ConnectionState, RegisterOutcome, Registry,
    RegistryEntry, UpdateOutcome,
};

/// Requests understood by the hub task.
#[derive(Debug)]
enum HubCommand {
    Register {
        entry: RegistryEntry,
        reply: oneshot::Sender<RegisterOutcome>,
    },
    Unregister {
        id: ConnectionId,
        key: ConnectionKey,
    },
    UpdateId {
        old_id: ConnectionId,
        state: ConnectionState,
        reply: oneshot::Sender<UpdateOutcome>,
    },
    /// Fan-out on behalf of `peer_id`, honoured only while `key` still owns
    /// that id.
    BroadcastToPeer {
        payload: String,
        peer_id: ConnectionId,
        key: ConnectionKey,
    },
    DirectSend {
        payload: String,
        target: ConnectionId,
    },
    Contains {
        id: ConnectionId,
        reply: oneshot::Sender<bool>,
    },
    Snapshot {
        reply: oneshot::Sender<Vec<ConnectionSnapshot>>,
    },
}

/// Single owner of the [`Registry`]. Commands are applied one at a time in
/// the order they arrive.
pub struct Hub {
    registry: Registry,
    inbox: mpsc::Receiver<HubCommand>,
}

/// Cloneable front door to a running [`Hub`].
#[derive(Clone, Debug)]
pub struct HubHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl Hub {
    pub fn new(capacity: usize) -> (Self, HubHandle) {
        let (tx, inbox) = mpsc::channel(capacity);
        let hub = Self {
            registry: Registry::new(),
            inbox,
        };
        (hub, HubHandle { tx })
    }

    pub fn spawn(capacity: usize) -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new(capacity);
        (handle, tokio::spawn(hub.run()))
    }

    /// Processes commands until every [`HubHandle`] has been dropped.
    pub async fn run(mut self) {
        while let Some(command) = self.inbox.recv().await {
            self.apply(command);
        }
        debug!(remaining = self.registry.len(), "hub inbox closed");
    }

    fn apply(&mut self, command: HubCommand) {
        match command {
            HubCommand::Register { entry, reply } => {
                let id = entry.state().id.clone();
                let outcome = self.registry.register(entry);
                match outcome {
                    RegisterOutcome::Registered => {
                        increment_gauge!("squirrel_connections_registered", 1.0);
                        debug!(connection_id = %id, "connection registered");
                    }
                    RegisterOutcome::Rejected => {
                        warn!(connection_id = %id, "connection id already registered, dropping newcomer");
                    }
                }
                let _ = reply.send(outcome);
            }
            HubCommand::UpdateId {
                old_id,
                state,
                reply,
            } => {
                let new_id = state.id.clone();
                let outcome = self.registry.update_id(&old_id, state);
                match outcome {
                    UpdateOutcome::Updated => {
                        debug!(old_id = %old_id, connection_id = %new_id, "connection updated");
                    }
                    UpdateOutcome::Missing => {
                        debug!(old_id = %old_id, "update for a connection that is no longer registered");
                    }
                    UpdateOutcome::Conflict => {
                        self.removed(1);
                        counter!("squirrel_id_conflicts_total", 1);
                        warn!(
                            old_id = %old_id,
                            connection_id = %new_id,
                            "id already owned by another connection, dropping requester"
                        );
                    }
                }
                let _ = reply.send(outcome);
            }
            HubCommand::Unregister { id, key } => {
                let removed = self.registry.unregister(&id, key);
                if removed.len() > 1 {
                    info!(
                        connection_id = %id,
                        subscribers = removed.len() - 1,
                        "broadcaster left, detached its subscribers"
                    );
                }
                self.removed(removed.len());
            }
            HubCommand::BroadcastToPeer {
                payload,
                peer_id,
                key,
            } => {
                if !self.registry.owned_by(&peer_id, key) {
                    debug!(peer_id = %peer_id, "line from a connection that no longer owns its id dropped");
                    return;
                }
                let report = self.registry.broadcast_to_peer(&payload, &peer_id);
                if report.delivered > 0 {
                    counter!("squirrel_lines_delivered_total", report.delivered as u64);
                }
                for id in &report.evicted {
                    counter!("squirrel_slow_consumers_evicted_total", 1);
                    warn!(connection_id = %id, peer_id = %peer_id, "outbound queue full, dropping subscriber");
                }
                self.removed(report.evicted.len());
            }
            HubCommand::DirectSend { payload, target } => {
                let Some(sender) = self.registry.sender_for(&target) else {
                    debug!(connection_id = %target, "direct send to unknown connection ignored");
                    return;
                };
                // Wait for room off the hub task so one busy queue cannot
                // stall every other connection.
                tokio::spawn(async move {
                    if sender.send(payload).await.is_err() {
                        debug!(connection_id = %target, "direct send target closed before delivery");
                    }
                });
            }
            HubCommand::Contains { id, reply } => {
                let _ = reply.send(self.registry.contains(&id));
            }
            HubCommand::Snapshot { reply } => {
                let _ = reply.send(self.registry.snapshot());
            }
        }
    }

    fn removed(&self, count: usize) {
        if count > 0 {
            decrement_gauge!("squirrel_connections_registered", count as f64);
        }
    }
}

impl HubHandle {
    pub async fn register(&self, entry: RegistryEntry) -> Result<RegisterOutcome, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Register { entry, reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn unregister(&self, id: ConnectionId, key: ConnectionKey) -> Result<(), HubError> {
        self.send(HubCommand::Unregister { id, key }).await
    }

    pub async fn update_id(
        &self,
        old_id: ConnectionId,
        state: ConnectionState,
    ) -> Result<UpdateOutcome, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::UpdateId {
            old_id,
            state,
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn broadcast_to_peer(
        &self,
        payload: String,
        peer_id: ConnectionId,
        key: ConnectionKey,
    ) -> Result<(), HubError> {
        self.send(HubCommand::BroadcastToPeer {
            payload,
            peer_id,
            key,
        })
        .await
    }

    pub async fn direct_send(&self, payload: String, target: ConnectionId) -> Result<(), HubError> {
        self.send(HubCommand::DirectSend { payload, target }).await
    }

    pub async fn contains(&self, id: ConnectionId) -> Result<bool, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Contains { id, reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    pub async fn snapshot(&self) -> Result<Vec<ConnectionSnapshot>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.send(HubCommand::Snapshot { reply }).await?;
        rx.await.map_err(|_| HubError::Closed)
    }

    async fn send(&self, command: HubCommand) -> Result<(), HubError> {
        self.tx.send(command).await.map_err(|_| HubError::Closed)
    }
}
