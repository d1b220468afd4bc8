//! Client connection records and the process-wide client table.
//!
//! Every accepted connection gets one [`Client`] record: its identity
//! (nickname + random session token), its lobby/room state, the liveness
//! counters driven by the heartbeat task, and the outbound queue handle the
//! writer task drains. The [`ClientManager`] owns all records, enforces the
//! connection cap, and hands out monotonically increasing ids.

use crate::protocol::Outbound;
use crate::room_manager::RoomId;
use log::debug;
use std::collections::HashMap;

pub type ClientId = u32;

/// Where a client currently stands in the lobby/room lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// No room association.
    Lobby,
    /// Seated in a room, waiting for an opponent (or a replay decision).
    Waiting,
    /// Seated in a room with a round in progress.
    Playing,
}

/// State kept per connected client.
#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    /// Nickname, replaced by each `JOIN` (truncated to the wire limit).
    pub name: String,
    pub state: ClientState,
    /// Non-owning back-reference to the occupied room, if any. The room
    /// registry owns seat identity; this is re-validated under its lock.
    pub room: Option<RoomId>,
    /// Cleared when the connection is observed dead.
    pub connected: bool,
    /// Cleared to stop the read worker cooperatively.
    pub alive: bool,
    /// Consecutive heartbeat PINGs without a PONG reply.
    pub missed_pongs: u32,
    /// Malformed inputs so far; three terminate the session.
    pub invalid_count: u32,
    /// Opaque 16-hex reconnect token, fixed for the record's lifetime.
    pub session: String,
    /// Outbound queue handle for this connection.
    pub tx: Outbound,
}

impl Client {
    fn new(id: ClientId, tx: Outbound) -> Self {
        Self {
            id,
            name: String::new(),
            state: ClientState::Lobby,
            room: None,
            connected: true,
            alive: true,
            missed_pongs: 0,
            invalid_count: 0,
            session: new_session_token(),
            tx,
        }
    }
}

/// 16 hexadecimal characters, generated per connection and opaque to clients.
fn new_session_token() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// The process-wide client table, guarded by its own mutex at the server
/// level. Capacity is enforced here; callers decide what to tell a rejected
/// connection.
#[derive(Debug)]
pub struct ClientManager {
    clients: HashMap<ClientId, Client>,
    next_client_id: ClientId,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Registers a new connection. Returns `None` when the table is full.
    pub fn add_client(&mut self, tx: Outbound) -> Option<ClientId> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;
        self.clients.insert(client_id, Client::new(client_id, tx));
        debug!("Registered client {}", client_id);
        Some(client_id)
    }

    /// Drops a record; its outbound queue closes with it, which lets the
    /// writer task flush and exit. Returns false if it was already gone.
    pub fn remove_client(&mut self, client_id: &ClientId) -> bool {
        self.clients.remove(client_id).is_some()
    }

    pub fn get(&self, client_id: ClientId) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    pub fn get_mut(&mut self, client_id: ClientId) -> Option<&mut Client> {
        self.clients.get_mut(&client_id)
    }

    /// Queues one protocol line for a client; silently ignored for ids that
    /// are no longer registered.
    pub fn send(&self, client_id: ClientId, payload: impl AsRef<str>) {
        if let Some(client) = self.clients.get(&client_id) {
            client.tx.send(payload);
        }
    }

    /// All records, for the heartbeat sweep.
    pub fn clients_mut(&mut self) -> impl Iterator<Item = &mut Client> {
        self.clients.values_mut()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connected_client(manager: &mut ClientManager) -> ClientId {
        let (tx, _rx) = Outbound::channel();
        manager.add_client(tx).expect("table full")
    }

    #[test]
    fn add_client_assigns_monotonic_ids() {
        let mut manager = ClientManager::new(4);
        let a = connected_client(&mut manager);
        let b = connected_client(&mut manager);
        assert_eq!(a, 1);
        assert_eq!(b, 2);
        assert_eq!(manager.len(), 2);
    }

    #[test]
    fn add_client_enforces_capacity() {
        let mut manager = ClientManager::new(1);
        let (tx1, _rx1) = Outbound::channel();
        let (tx2, _rx2) = Outbound::channel();
        assert!(manager.add_client(tx1).is_some());
        assert!(manager.add_client(tx2).is_none());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn capacity_frees_up_after_removal() {
        let mut manager = ClientManager::new(1);
        let id = connected_client(&mut manager);
        assert!(manager.remove_client(&id));
        assert!(!manager.remove_client(&id));
        assert!(manager.is_empty());
        let (tx, _rx) = Outbound::channel();
        assert!(manager.add_client(tx).is_some());
    }

    #[test]
    fn new_client_starts_in_the_lobby() {
        let mut manager = ClientManager::new(4);
        let id = connected_client(&mut manager);
        let client = manager.get(id).unwrap();
        assert_eq!(client.state, ClientState::Lobby);
        assert_eq!(client.room, None);
        assert!(client.alive);
        assert!(client.connected);
        assert_eq!(client.missed_pongs, 0);
        assert_eq!(client.invalid_count, 0);
    }

    #[test]
    fn session_tokens_are_sixteen_hex_chars() {
        let mut manager = ClientManager::new(4);
        let a = connected_client(&mut manager);
        let b = connected_client(&mut manager);
        let token_a = manager.get(a).unwrap().session.clone();
        let token_b = manager.get(b).unwrap().session.clone();
        for token in [&token_a, &token_b] {
            assert_eq!(token.len(), 16);
            assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
        }
        // Not a guarantee, but a collision here would be astonishing.
        assert_ne!(token_a, token_b);
    }

    #[test]
    fn send_frames_through_the_client_queue() {
        let mut manager = ClientManager::new(4);
        let (tx, mut rx) = Outbound::channel();
        let id = manager.add_client(tx).unwrap();
        manager.send(id, "INFO|hello");
        manager.send(999, "INFO|nobody home");
        assert_eq!(rx.try_recv().unwrap(), "##INFO|hello\n");
        assert!(rx.try_recv().is_err());
    }
}
