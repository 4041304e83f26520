use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use uuid::Uuid;

/// Opaque id a connection is addressed by. Starts out as a fresh UUID and is
/// replaced once when a broadcaster announces its stable id.
pub type ConnectionId = String;

/// Identity assigned at connect time that never changes, even when the
/// connection's [`ConnectionId`] does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey(Uuid);

impl ConnectionKey {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Id a connection is registered under until it identifies itself.
    pub fn initial_id(&self) -> ConnectionId {
        self.0.to_string()
    }
}

impl Default for ConnectionKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Where a connection is in the identity handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "role", rename_all = "snake_case")]
pub enum Role {
    Unidentified,
    Broadcaster,
    PendingSubscriber { peer_id: ConnectionId },
    ActiveSubscriber { peer_id: ConnectionId },
}

impl Role {
    pub fn is_active(&self) -> bool {
        matches!(self, Role::Broadcaster | Role::ActiveSubscriber { .. })
    }

    pub fn is_broadcaster(&self) -> bool {
        matches!(self, Role::Broadcaster)
    }

    pub fn is_subscriber(&self) -> bool {
        matches!(
            self,
            Role::PendingSubscriber { .. } | Role::ActiveSubscriber { .. }
        )
    }

    pub fn peer_id(&self) -> Option<&str> {
        match self {
            Role::PendingSubscriber { peer_id } | Role::ActiveSubscriber { peer_id } => {
                Some(peer_id)
            }
            _ => None,
        }
    }

    fn is_active_subscriber_of(&self, broadcaster: &str) -> bool {
        matches!(self, Role::ActiveSubscriber { peer_id } if peer_id == broadcaster)
    }
}

/// The part of a connection its read pump mutates and the hub persists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionState {
    pub key: ConnectionKey,
    pub id: ConnectionId,
    pub role: Role,
}

impl ConnectionState {
    pub fn new(key: ConnectionKey) -> Self {
        Self {
            key,
            id: key.initial_id(),
            role: Role::Unidentified,
        }
    }
}

/// A registered connection. The registry holds the only sender of the
/// outbound queue, so dropping an entry closes that queue.
#[derive(Debug)]
pub struct RegistryEntry {
    state: ConnectionState,
    outbound: mpsc::Sender<String>,
}

impl RegistryEntry {
    pub fn new(state: ConnectionState, outbound: mpsc::Sender<String>) -> Self {
        Self { state, outbound }
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSnapshot {
    pub id: ConnectionId,
    #[serde(flatten)]
    pub role: Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterOutcome {
    Registered,
    /// Another connection already holds the id; the newcomer was dropped.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    Updated,
    /// The old id is gone or owned by someone else; nothing changed.
    Missing,
    /// The new id belongs to another connection; the requester was dropped.
    Conflict,
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub evicted: Vec<ConnectionId>,
}

/// Id → connection map. Owned by the hub task and never shared.
#[derive(Debug, Default)]
pub struct Registry {
    connections: HashMap<ConnectionId, RegistryEntry>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&ConnectionState> {
        self.connections.get(id).map(RegistryEntry::state)
    }

    pub fn register(&mut self, entry: RegistryEntry) -> RegisterOutcome {
        if self.connections.contains_key(&entry.state.id) {
            return RegisterOutcome::Rejected;
        }
        self.connections.insert(entry.state.id.clone(), entry);
        RegisterOutcome::Registered
    }

    /// Moves the entry registered under `old_id` to `state.id` and stores the
    /// new state. The outbound queue is carried over untouched.
    pub fn update_id(&mut self, old_id: &str, state: ConnectionState) -> UpdateOutcome {
        if !self.owned_by(old_id, state.key) {
            return UpdateOutcome::Missing;
        }

        if state.id != old_id {
            if let Some(existing) = self.connections.get(&state.id) {
                if existing.state.key != state.key {
                    self.connections.remove(old_id);
                    return UpdateOutcome::Conflict;
                }
            }
        }

        let Some(mut entry) = self.connections.remove(old_id) else {
            return UpdateOutcome::Missing;
        };
        entry.state = state;
        self.connections.insert(entry.state.id.clone(), entry);
        UpdateOutcome::Updated
    }

    /// Removes the connection and, when it was a broadcaster, every active
    /// subscriber attached to it. Returns the ids removed, requester first.
    pub fn unregister(&mut self, id: &str, key: ConnectionKey) -> Vec<ConnectionId> {
        if !self.owned_by(id, key) {
            return Vec::new();
        }
        let Some(entry) = self.connections.remove(id) else {
            return Vec::new();
        };

        let mut removed = vec![entry.state.id.clone()];
        if entry.state.role.is_broadcaster() {
            let subscribers: Vec<ConnectionId> = self
                .connections
                .iter()
                .filter(|(_, other)| other.state.role.is_active_subscriber_of(id))
                .map(|(other_id, _)| other_id.clone())
                .collect();
            for subscriber in subscribers {
                self.connections.remove(&subscriber);
                removed.push(subscriber);
            }
        }
        removed
    }

    /// Offers `payload` to every active subscriber of `peer_id` without
    /// waiting. Subscribers whose queue is full (or already closed) are
    /// removed, which closes their queue.
    pub fn broadcast_to_peer(&mut self, payload: &str, peer_id: &str) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        for (id, entry) in &self.connections {
            if !entry.state.role.is_active_subscriber_of(peer_id) {
                continue;
            }
            match entry.outbound.try_send(payload.to_string()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) | Err(TrySendError::Closed(_)) => {
                    report.evicted.push(id.clone())
                }
            }
        }
        for id in &report.evicted {
            self.connections.remove(id);
        }
        report
    }

    pub fn sender_for(&self, id: &str) -> Option<mpsc::Sender<String>> {
        self.connections.get(id).map(|entry| entry.outbound.clone())
    }

    pub fn snapshot(&self) -> Vec<ConnectionSnapshot> {
        let mut snapshot: Vec<ConnectionSnapshot> = self
            .connections
            .values()
            .map(|entry| ConnectionSnapshot {
                id: entry.state.id.clone(),
                role: entry.state.role.clone(),
            })
            .collect();
        snapshot.sort_by(|a, b| a.id.cmp(&b.id));
        snapshot
    }

    /// True when `id` is currently registered to the connection holding `key`.
    pub fn owned_by(&self, id: &str, key: ConnectionKey) -> bool {
        self.connections
            .get(id)
            .is_some_and(|entry| entry.state.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    fn connection(capacity: usize) -> (ConnectionState, mpsc::Sender<String>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity);
        (ConnectionState::new(ConnectionKey::new()), tx, rx)
    }

    fn register(
        registry: &mut Registry,
        id: &str,
        role: Role,
        capacity: usize,
    ) -> (ConnectionState, mpsc::Receiver<String>) {
        let (mut state, tx, rx) = connection(capacity);
        let old_id = state.id.clone();
        assert_eq!(
            registry.register(RegistryEntry::new(state.clone(), tx)),
            RegisterOutcome::Registered
        );
        state.id = id.to_string();
        state.role = role;
        assert_eq!(registry.update_id(&old_id, state.clone()), UpdateOutcome::Updated);
        (state, rx)
    }

    fn subscriber_of(peer: &str) -> Role {
        Role::ActiveSubscriber {
            peer_id: peer.to_string(),
        }
    }

    #[test_timeout::timeout]
    fn broadcaster_id_rewrite_moves_the_entry() {
        let mut registry = Registry::new();
        let (state, tx, mut rx) = connection(4);
        let ephemeral = state.id.clone();
        registry.register(RegistryEntry::new(state.clone(), tx));

        let announced = ConnectionState {
            id: "B1".to_string(),
            role: Role::Broadcaster,
            ..state
        };
        assert_eq!(registry.update_id(&ephemeral, announced), UpdateOutcome::Updated);
        assert!(!registry.contains(&ephemeral));
        assert_eq!(registry.get("B1").map(|s| &s.role), Some(&Role::Broadcaster));

        // The queue moved with the entry.
        let sender = registry.sender_for("B1").expect("sender");
        sender.try_send("ack".to_string()).expect("send");
        assert_eq!(rx.try_recv().expect("recv"), "ack");
    }

    #[test_timeout::timeout]
    fn register_rejects_an_id_that_is_taken() {
        let mut registry = Registry::new();
        let (state, tx, _rx) = connection(1);
        registry.register(RegistryEntry::new(state.clone(), tx));

        let (tx, mut rx) = mpsc::channel(1);
        let duplicate = ConnectionState {
            key: ConnectionKey::new(),
            ..state
        };
        assert_eq!(
            registry.register(RegistryEntry::new(duplicate, tx)),
            RegisterOutcome::Rejected
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(registry.len(), 1);
    }

    #[test_timeout::timeout]
    fn announcing_a_taken_id_drops_the_newcomer() {
        let mut registry = Registry::new();
        let (incumbent, _incumbent_rx) = register(&mut registry, "B1", Role::Broadcaster, 1);

        let (state, tx, mut rx) = connection(1);
        let ephemeral = state.id.clone();
        registry.register(RegistryEntry::new(state.clone(), tx));
        let announced = ConnectionState {
            id: "B1".to_string(),
            role: Role::Broadcaster,
            ..state
        };

        assert_eq!(registry.update_id(&ephemeral, announced), UpdateOutcome::Conflict);
        assert!(!registry.contains(&ephemeral));
        assert_eq!(registry.get("B1").map(|s| s.key), Some(incumbent.key));
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test_timeout::timeout]
    fn stale_requests_cannot_touch_a_new_owner() {
        let mut registry = Registry::new();
        let (owner, _rx) = register(&mut registry, "B1", Role::Broadcaster, 1);

        let stranger = ConnectionKey::new();
        assert!(registry.unregister("B1", stranger).is_empty());
        let hijack = ConnectionState {
            key: stranger,
            id: "B2".to_string(),
            role: Role::Broadcaster,
        };
        assert_eq!(registry.update_id("B1", hijack), UpdateOutcome::Missing);
        assert_eq!(registry.get("B1"), Some(&owner));
    }

    #[test_timeout::timeout]
    fn unregistering_a_broadcaster_cascades_to_its_active_subscribers_only() {
        let mut registry = Registry::new();
        let (b1, _b1_rx) = register(&mut registry, "B1", Role::Broadcaster, 1);
        let (_s1, mut s1_rx) = register(&mut registry, "S1", subscriber_of("B1"), 1);
        let (_s2, _s2_rx) = register(&mut registry, "S2", subscriber_of("B1"), 1);
        let (_s3, _s3_rx) = register(&mut registry, "S3", subscriber_of("B2"), 1);
        let (_p1, _p1_rx) = register(
            &mut registry,
            "P1",
            Role::PendingSubscriber {
                peer_id: "B1".to_string(),
            },
            1,
        );

        let mut removed = registry.unregister("B1", b1.key);
        removed[1..].sort();
        assert_eq!(removed, vec!["B1", "S1", "S2"]);
        assert!(registry.contains("S3"));
        assert!(registry.contains("P1"));
        assert_eq!(registry.len(), 2);
        assert!(matches!(
            s1_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test_timeout::timeout]
    fn unregistering_a_subscriber_does_not_cascade() {
        let mut registry = Registry::new();
        let (_b1, _b1_rx) = register(&mut registry, "B1", Role::Broadcaster, 1);
        let (s1, _s1_rx) = register(&mut registry, "S1", subscriber_of("B1"), 1);
        let (_s2, _s2_rx) = register(&mut registry, "S2", subscriber_of("S1"), 1);

        assert_eq!(registry.unregister("S1", s1.key), vec!["S1"]);
        assert!(registry.contains("B1"));
        assert!(registry.contains("S2"));
    }

    #[test_timeout::timeout]
    fn broadcast_reaches_matching_active_subscribers_only() {
        let mut registry = Registry::new();
        let (_b1, mut b1_rx) = register(&mut registry, "B1", Role::Broadcaster, 4);
        let (_s1, mut s1_rx) = register(&mut registry, "S1", subscriber_of("B1"), 4);
        let (_s2, mut s2_rx) = register(&mut registry, "S2", subscriber_of("other"), 4);
        let (_p, mut p_rx) = register(
            &mut registry,
            "P",
            Role::PendingSubscriber {
                peer_id: "B1".to_string(),
            },
            4,
        );

        let report = registry.broadcast_to_peer("hello", "B1");
        assert_eq!(report.delivered, 1);
        assert!(report.evicted.is_empty());
        assert_eq!(s1_rx.try_recv().expect("line"), "hello");
        assert!(s2_rx.try_recv().is_err());
        assert!(p_rx.try_recv().is_err());
        assert!(b1_rx.try_recv().is_err());

        assert_eq!(registry.broadcast_to_peer("hello", "nobody"), BroadcastReport::default());
    }

    #[test_timeout::timeout]
    fn full_queue_evicts_the_slow_subscriber() {
        let mut registry = Registry::new();
        let (_b1, _b1_rx) = register(&mut registry, "B1", Role::Broadcaster, 1);
        let (_s1, mut s1_rx) = register(&mut registry, "S1", subscriber_of("B1"), 2);
        let (_s2, mut s2_rx) = register(&mut registry, "S2", subscriber_of("B1"), 8);

        registry.broadcast_to_peer("one", "B1");
        registry.broadcast_to_peer("two", "B1");
        let report = registry.broadcast_to_peer("three", "B1");

        assert_eq!(report.delivered, 1);
        assert_eq!(report.evicted, vec!["S1"]);
        assert!(!registry.contains("S1"));
        assert!(registry.contains("S2"));

        // Already queued lines drain, then the queue reports closed.
        assert_eq!(s1_rx.try_recv().expect("one"), "one");
        assert_eq!(s1_rx.try_recv().expect("two"), "two");
        assert!(matches!(
            s1_rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
        for expected in ["one", "two", "three"] {
            assert_eq!(s2_rx.try_recv().expect("line"), expected);
        }
    }

    /// Random register/update/unregister sequences must leave the registry in
    /// the same state as a plain fold over the operations.
    #[test_timeout::timeout]
    fn registry_matches_a_pure_fold_of_its_operations() {
        const IDS: [&str; 4] = ["B1", "B2", "S1", "S2"];

        for seed in 0..32u64 {
            let mut rng = StdRng::seed_from_u64(seed);
            let mut registry = Registry::new();
            let mut model: BTreeMap<ConnectionId, ConnectionState> = BTreeMap::new();
            let mut known: Vec<ConnectionState> = Vec::new();
            let mut receivers = Vec::new();

            for _ in 0..200 {
                match rng.gen_range(0..3) {
                    0 => {
                        let (state, tx, rx) = connection(1);
                        receivers.push(rx);
                        registry.register(RegistryEntry::new(state.clone(), tx));
                        if !model.contains_key(&state.id) {
                            model.insert(state.id.clone(), state.clone());
                        }
                        known.push(state);
                    }
                    1 if !known.is_empty() => {
                        let current = known[rng.gen_range(0..known.len())].clone();
                        let role = match rng.gen_range(0..3) {
                            0 => Role::Broadcaster,
                            1 => subscriber_of(IDS[rng.gen_range(0..2)]),
                            _ => Role::Unidentified,
                        };
                        let next = ConnectionState {
                            id: IDS[rng.gen_range(0..IDS.len())].to_string(),
                            role,
                            ..current.clone()
                        };
                        registry.update_id(&current.id, next.clone());
                        fold_update(&mut model, &current.id, next.clone());
                        refresh(&mut known, &model, next.key);
                    }
                    2 if !known.is_empty() => {
                        let current = known[rng.gen_range(0..known.len())].clone();
                        registry.unregister(&current.id, current.key);
                        fold_unregister(&mut model, &current.id, current.key);
                    }
                    _ => {}
                }

                let actual: BTreeMap<ConnectionId, ConnectionState> = registry
                    .connections
                    .iter()
                    .map(|(id, entry)| (id.clone(), entry.state.clone()))
                    .collect();
                assert_eq!(actual, model, "seed {seed}");
            }
        }
    }

    fn fold_update(model: &mut BTreeMap<ConnectionId, ConnectionState>, old_id: &str, next: ConnectionState) {
        if model.get(old_id).map(|s| s.key) != Some(next.key) {
            return;
        }
        if let Some(holder) = model.get(&next.id) {
            if holder.key != next.key {
                model.remove(old_id);
                return;
            }
        }
        model.remove(old_id);
        model.insert(next.id.clone(), next);
    }

    fn fold_unregister(model: &mut BTreeMap<ConnectionId, ConnectionState>, id: &str, key: ConnectionKey) {
        let Some(state) = model.get(id).cloned() else {
            return;
        };
        if state.key != key {
            return;
        }
        model.remove(id);
        if state.role == Role::Broadcaster {
            model.retain(|_, other| other.role != subscriber_of(id));
        }
    }

    /// Tracks where each connection currently lives so later operations are
    /// issued with the id its read pump would hold.
    fn refresh(
        known: &mut [ConnectionState],
        model: &BTreeMap<ConnectionId, ConnectionState>,
        key: ConnectionKey,
    ) {
        if let Some(state) = model.values().find(|s| s.key == key) {
            for entry in known.iter_mut().filter(|s| s.key == key) {
                *entry = state.clone();
            }
        }
    }
}
