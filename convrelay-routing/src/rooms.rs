use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use convrelay_core::models::ConversationId;

use crate::events::RoutedEvent;

/// Handle for a client connection
pub type ConnectionId = String;

/// Message sender for a client connection
pub type EventSender = mpsc::UnboundedSender<RoutedEvent>;

/// One connection's membership in a conversation room
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub connection_id: ConnectionId,
    pub sender: EventSender,
}

/// Per-connection bookkeeping: the outbound sender plus every conversation
/// the connection has joined, so disconnect cleanup knows what to release.
struct Membership {
    sender: EventSender,
    joined: HashSet<ConversationId>,
}

/// In-memory hub delivering routed events to connected clients.
///
/// This is the single-instance half of delivery: the routing channel
/// subscriber hands each received event to `broadcast`, which fans it out to
/// every local connection joined to the conversation. A connection may be
/// joined to any number of conversations at once.
///
/// The subscriber task and the connection handlers touch these tables
/// concurrently, hence `DashMap`.
#[derive(Clone)]
pub struct RoomHub {
    /// Map of conversation -> subscribers in that room
    rooms: Arc<DashMap<ConversationId, Vec<Subscriber>>>,

    /// Map of connection -> sender and joined conversations
    connections: Arc<DashMap<ConnectionId, Membership>>,
}

impl RoomHub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            connections: Arc::new(DashMap::new()),
        }
    }

    /// Register a connection and return the receiver its transport drains.
    ///
    /// The connection is in no room until it joins one.
    pub fn register(&self, connection_id: ConnectionId) -> mpsc::UnboundedReceiver<RoutedEvent> {
        let (tx, rx) = mpsc::unbounded_channel();

        self.connections.insert(
            connection_id.clone(),
            Membership {
                sender: tx,
                joined: HashSet::new(),
            },
        );

        debug!(connection_id = %connection_id, "Connection registered");

        rx
    }

    /// Add a connection to a conversation room.
    ///
    /// Idempotent: joining a room the connection is already in is a no-op.
    /// Returns false if the connection was never registered.
    pub fn join(&self, connection_id: &str, conversation: ConversationId) -> bool {
        let Some(mut membership) = self.connections.get_mut(connection_id) else {
            warn!(
                connection_id = %connection_id,
                "Attempted to join a room on an unregistered connection"
            );
            return false;
        };

        if !membership.joined.insert(conversation.clone()) {
            return true;
        }

        let subscriber = Subscriber {
            connection_id: connection_id.to_string(),
            sender: membership.sender.clone(),
        };
        drop(membership);

        self.rooms
            .entry(conversation.clone())
            .or_default()
            .push(subscriber);

        info!(
            conversation = %conversation,
            connection_id = %connection_id,
            "Connection joined conversation room"
        );

        true
    }

    /// Remove a connection from a conversation room
    pub fn leave(&self, connection_id: &str, conversation: &ConversationId) {
        if let Some(mut membership) = self.connections.get_mut(connection_id) {
            membership.joined.remove(conversation);
        }

        self.remove_from_room(connection_id, conversation);

        info!(
            conversation = %conversation,
            connection_id = %connection_id,
            "Connection left conversation room"
        );
    }

    /// Drop a connection entirely, returning the conversations it had
    /// joined so the caller can release their ownership entries.
    pub fn unregister(&self, connection_id: &str) -> Vec<ConversationId> {
        let Some((_, membership)) = self.connections.remove(connection_id) else {
            warn!(
                connection_id = %connection_id,
                "Attempted to unregister unknown connection"
            );
            return Vec::new();
        };

        let joined: Vec<ConversationId> = membership.joined.into_iter().collect();
        for conversation in &joined {
            self.remove_from_room(connection_id, conversation);
        }

        info!(
            connection_id = %connection_id,
            rooms = joined.len(),
            "Connection unregistered"
        );

        joined
    }

    /// Deliver an event to every connection joined to the conversation.
    ///
    /// An empty room is a no-op, not an error: it just means no client is
    /// attached here right now.
    pub fn broadcast(&self, conversation: &ConversationId, event: &RoutedEvent) -> usize {
        let mut sent_count = 0;
        let mut dead_connections = Vec::new();

        if let Some(subscribers) = self.rooms.get(conversation) {
            for subscriber in subscribers.iter() {
                match subscriber.sender.send(event.clone()) {
                    Ok(()) => sent_count += 1,
                    Err(err) => {
                        warn!(
                            conversation = %conversation,
                            connection_id = %subscriber.connection_id,
                            error = %err,
                            "Failed to deliver event, pruning dead subscriber"
                        );
                        dead_connections.push(subscriber.connection_id.clone());
                    }
                }
            }
        }

        // A dead sender means the transport already went away; its handler
        // runs full disconnect cleanup. Pruning here just stops repeated
        // send failures on this room.
        for connection_id in dead_connections {
            self.remove_from_room(&connection_id, conversation);
        }

        if sent_count > 0 {
            debug!(
                conversation = %conversation,
                sent_count = sent_count,
                data_type = %event.data_type,
                "Event fanned out to local sessions"
            );
        }

        sent_count
    }

    /// Get the number of subscribers in a conversation room
    #[must_use]
    pub fn member_count(&self, conversation: &ConversationId) -> usize {
        self.rooms
            .get(conversation)
            .map(|subscribers| subscribers.len())
            .unwrap_or(0)
    }

    /// Get the number of active rooms
    #[must_use]
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Get the number of registered connections
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn remove_from_room(&self, connection_id: &str, conversation: &ConversationId) {
        if let Some(mut subscribers) = self.rooms.get_mut(conversation) {
            subscribers.retain(|sub| sub.connection_id != connection_id);

            if subscribers.is_empty() {
                drop(subscribers); // Drop the RefMut before removing
                self.rooms.remove(conversation);
                debug!(conversation = %conversation, "Room has no more subscribers, removed");
            }
        }
    }
}

impl Default for RoomHub {
    fn default() -> Self {
        Self::new()
    }
}
