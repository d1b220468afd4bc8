//! TCP bootstrap, per-connection workers, and the heartbeat task.
//!
//! One listener accepts connections; each connection gets a reader task
//! (this module's read loop plus dispatch) and a writer task draining the
//! client's outbound queue. A single background task drives liveness: it
//! PINGs every connected client, expires the silent ones, and prunes rooms
//! whose reserved seat has outlived the reconnect grace window.
//!
//! Lock discipline: the client table first, then the room table, always.
//! Handlers queue their outbound lines while holding the locks (queueing
//! never blocks), so broadcasts stay ordered with the state changes they
//! announce.

use crate::client_manager::{ClientId, ClientManager, ClientState};
use crate::config::ServerConfig;
use crate::protocol::{self, Command, Outbound, MAX_LINE};
use crate::room_manager::RoomManager;
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Interval between heartbeat sweeps.
const PING_INTERVAL: Duration = Duration::from_secs(5);
/// A client is declared unreachable once it misses more than this many PONGs.
const MAX_MISSED_PONGS: u32 = 3;
/// Invalid inputs tolerated before the session is terminated.
const MAX_INVALID_MSGS: u32 = 3;
/// How long the read loop waits on the socket before re-checking the
/// client's liveness flags.
const READ_POLL: Duration = Duration::from_secs(1);

/// The server: configuration plus the two registries behind their locks.
pub struct Server {
    config: ServerConfig,
    clients: Mutex<ClientManager>,
    rooms: Mutex<RoomManager>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Arc::new(Self {
            clients: Mutex::new(ClientManager::new(config.max_clients)),
            rooms: Mutex::new(RoomManager::new(
                config.max_rooms,
                config.disconnect_grace(),
            )),
            config,
        })
    }

    /// Binds the configured endpoint and serves forever.
    pub async fn run(self: Arc<Self>) -> io::Result<()> {
        let addr = SocketAddr::from((self.config.bind_address, self.config.port));
        let listener = TcpListener::bind(addr).await?;
        info!("Listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Accept loop over an already-bound listener. Split out so tests can
    /// bind an ephemeral port themselves.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        let heartbeat = Arc::clone(&self);
        tokio::spawn(async move { heartbeat.heartbeat_loop().await });

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let server = Arc::clone(&self);
                    tokio::spawn(async move { server.handle_connection(stream, peer).await });
                }
                Err(e) => error!("Accept failed: {}", e),
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let (read_half, write_half) = stream.into_split();
        let (tx, mut rx) = Outbound::channel();

        let client_id = { self.clients.lock().await.add_client(tx.clone()) };
        let Some(client_id) = client_id else {
            warn!("Rejecting connection from {}: server full", peer);
            let mut write_half = write_half;
            let _ = write_half.write_all(b"##ERROR|Server full\n").await;
            return;
        };
        info!("Client {} connected from {}", client_id, peer);

        // Writer task: drains the outbound queue until the record is dropped
        // (which closes the queue and lets pending lines flush first) or the
        // peer stops accepting data.
        tokio::spawn(async move {
            let mut writer = BufWriter::new(write_half);
            while let Some(line) = rx.recv().await {
                if writer.write_all(line.as_bytes()).await.is_err()
                    || writer.flush().await.is_err()
                {
                    debug!("Write to client {} failed", client_id);
                    break;
                }
            }
        });

        tx.send("HELLO|");
        self.read_loop(client_id, read_half).await;

        // Uniform teardown: a seat still held here (read failure, heartbeat
        // expiry, QUIT without EXIT) goes through the disconnect handler so
        // it stays reconnect-eligible, then the record is destroyed.
        let mut clients = self.clients.lock().await;
        if clients.get(client_id).is_some_and(|c| c.room.is_some()) {
            let mut rooms = self.rooms.lock().await;
            rooms.disconnect(&mut clients, client_id);
        }
        clients.remove_client(&client_id);
        info!("Client {} disconnected", client_id);
    }

    /// Reads lines until EOF, a read error, or the liveness flags clear.
    ///
    /// The socket wait is sliced with a timeout so the flags are re-checked
    /// even when the peer sends nothing; `read_until` keeps partial data in
    /// the buffer across slices, so no bytes are lost to the polling.
    async fn read_loop(&self, client_id: ClientId, read_half: OwnedReadHalf) {
        let mut reader = BufReader::new(read_half);
        let mut line: Vec<u8> = Vec::new();
        let mut discarding = false;

        loop {
            {
                let clients = self.clients.lock().await;
                match clients.get(client_id) {
                    Some(client) if client.alive && client.connected => {}
                    _ => break,
                }
            }

            let n = match timeout(READ_POLL, reader.read_until(b'\n', &mut line)).await {
                Err(_elapsed) => {
                    // No complete line yet. Bound the buffer: an oversized
                    // line earns its strike now and its tail is skipped.
                    if discarding {
                        line.clear();
                    } else if line.len() > MAX_LINE {
                        warn!("Client {} sent an oversized line", client_id);
                        discarding = true;
                        line.clear();
                        self.bump_invalid(client_id, "oversized line").await;
                    }
                    continue;
                }
                Ok(Ok(n)) => n,
                Ok(Err(e)) => {
                    debug!("Read from client {} failed: {}", client_id, e);
                    break;
                }
            };
            if n == 0 {
                break; // EOF
            }

            if discarding {
                // Tail of a line that already took its strike.
                discarding = false;
                line.clear();
                continue;
            }
            if line.len() > MAX_LINE {
                warn!("Client {} sent an oversized line", client_id);
                line.clear();
                self.bump_invalid(client_id, "oversized line").await;
                continue;
            }

            let text = String::from_utf8_lossy(&line).into_owned();
            line.clear();
            self.dispatch(client_id, text.trim_end_matches(['\r', '\n'])).await;
        }
    }

    /// Decodes one line and routes it to its handler.
    async fn dispatch(&self, client_id: ClientId, line: &str) {
        debug!("Client {} -> {}", client_id, line);
        let command = match protocol::parse(line) {
            Ok(command) => command,
            Err(err) => {
                {
                    let clients = self.clients.lock().await;
                    clients.send(client_id, format!("ERROR|{}", err));
                }
                self.bump_invalid(client_id, "unparsable command").await;
                return;
            }
        };

        match command {
            Command::Join { name } => self.handle_join(client_id, name).await,
            Command::Reconnect { name, session } => {
                self.handle_reconnect(client_id, name, session).await
            }
            Command::Create { name } => self.handle_create(client_id, name).await,
            Command::JoinRoom { id } => self.handle_joinroom(client_id, id).await,
            Command::Exit => {
                let mut clients = self.clients.lock().await;
                let mut rooms = self.rooms.lock().await;
                rooms.leave(&mut clients, client_id);
            }
            Command::List => {
                let clients = self.clients.lock().await;
                let rooms = self.rooms.lock().await;
                rooms.list(&clients, client_id);
            }
            Command::Move { coords } => self.handle_move(client_id, coords).await,
            Command::Replay { again } => self.handle_replay(client_id, again).await,
            Command::Quit => {
                let mut clients = self.clients.lock().await;
                if let Some(client) = clients.get_mut(client_id) {
                    client.tx.send("BYE|");
                    client.alive = false;
                }
            }
            Command::Ping => {
                let clients = self.clients.lock().await;
                clients.send(client_id, "PONG|");
            }
            Command::Pong => {
                let mut clients = self.clients.lock().await;
                if let Some(client) = clients.get_mut(client_id) {
                    client.missed_pongs = 0;
                }
            }
        }
    }

    /// `JOIN` replaces the nickname and re-announces the session token. For
    /// a client already seated in a room it is a rename only.
    async fn handle_join(&self, client_id: ClientId, name: String) {
        let mut clients = self.clients.lock().await;
        let Some(client) = clients.get_mut(client_id) else {
            return;
        };
        client.name = name;
        if client.room.is_none() {
            client.state = ClientState::Lobby;
        }
        let joined = format!("JOINED|{}", client.name);
        let session = format!("SESSION|{}", client.session);
        info!("Client {} is now known as {}", client_id, client.name);
        client.tx.send(joined);
        client.tx.send(session);
    }

    async fn handle_reconnect(&self, client_id: ClientId, name: String, session: String) {
        let mut clients = self.clients.lock().await;
        let mut rooms = self.rooms.lock().await;
        if let Some(client) = clients.get_mut(client_id) {
            client.name = name.clone();
            client.session = session.clone();
        }
        rooms.reconnect(&mut clients, client_id, &name, &session);
    }

    /// `CREATE` (and `JOINROOM`) issued while seated count as an implicit
    /// voluntary exit from the current room first.
    async fn handle_create(&self, client_id: ClientId, name: String) {
        let mut clients = self.clients.lock().await;
        let mut rooms = self.rooms.lock().await;
        if clients.get(client_id).is_some_and(|c| c.room.is_some()) {
            rooms.leave(&mut clients, client_id);
        }
        rooms.create(&mut clients, client_id, name);
    }

    async fn handle_joinroom(&self, client_id: ClientId, id: Option<u32>) {
        let mut clients = self.clients.lock().await;
        let mut rooms = self.rooms.lock().await;
        let Some(room_id) = id else {
            clients.send(client_id, "ERROR|No such room");
            return;
        };
        if clients.get(client_id).is_some_and(|c| c.room.is_some()) {
            rooms.leave(&mut clients, client_id);
        }
        rooms.join(&mut clients, client_id, room_id);
    }

    async fn handle_move(&self, client_id: ClientId, coords: Option<(usize, usize)>) {
        let in_room = {
            let clients = self.clients.lock().await;
            match clients.get(client_id) {
                Some(client) if client.room.is_some() => true,
                Some(client) => {
                    client.tx.send("ERROR|Not in game room");
                    false
                }
                None => return,
            }
        };
        if !in_room {
            self.bump_invalid(client_id, "move outside room").await;
            return;
        }

        let Some((x, y)) = coords else {
            {
                let clients = self.clients.lock().await;
                clients.send(client_id, "ERROR|Invalid MOVE format");
            }
            self.bump_invalid(client_id, "invalid move format").await;
            return;
        };

        let mut clients = self.clients.lock().await;
        let mut rooms = self.rooms.lock().await;
        rooms.handle_move(&mut clients, client_id, x, y);
    }

    async fn handle_replay(&self, client_id: ClientId, again: bool) {
        let in_room = {
            let clients = self.clients.lock().await;
            match clients.get(client_id) {
                Some(client) if client.room.is_some() => true,
                Some(client) => {
                    client.tx.send("ERROR|Not in room");
                    false
                }
                None => return,
            }
        };
        if !in_room {
            self.bump_invalid(client_id, "replay outside room").await;
            return;
        }

        let mut clients = self.clients.lock().await;
        let mut rooms = self.rooms.lock().await;
        rooms.handle_replay(&mut clients, client_id, again);
    }

    /// One invalid-input strike; the third terminates the session and routes
    /// a held seat through the disconnect handler.
    async fn bump_invalid(&self, client_id: ClientId, reason: &str) {
        let mut clients = self.clients.lock().await;
        let mut rooms = self.rooms.lock().await;

        let limit_hit = {
            let Some(client) = clients.get_mut(client_id) else {
                return;
            };
            client.invalid_count += 1;
            warn!(
                "Client {} invalid input ({}), strike {}/{}",
                client_id, reason, client.invalid_count, MAX_INVALID_MSGS
            );
            client.invalid_count >= MAX_INVALID_MSGS
        };

        if limit_hit {
            if let Some(client) = clients.get_mut(client_id) {
                client.tx.send("ERROR|Too many invalid messages");
                client.alive = false;
                client.connected = false;
            }
            rooms.disconnect(&mut clients, client_id);
        }
    }

    /// Heartbeat sweep: PING every connected client, expire the ones that
    /// stopped answering, then let the pruner forfeit rooms whose reserved
    /// seat has outstayed the grace window.
    async fn heartbeat_loop(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(PING_INTERVAL);
        loop {
            ticker.tick().await;

            let mut clients = self.clients.lock().await;
            let mut rooms = self.rooms.lock().await;

            let mut expired = Vec::new();
            for client in clients.clients_mut() {
                if !client.connected {
                    continue;
                }
                client.tx.send("PING|");
                client.missed_pongs += 1;
                if client.missed_pongs > MAX_MISSED_PONGS {
                    expired.push(client.id);
                }
            }
            for client_id in expired {
                info!("Client {} missed too many pongs, dropping", client_id);
                if let Some(client) = clients.get_mut(client_id) {
                    client.connected = false;
                    client.alive = false;
                }
                rooms.disconnect(&mut clients, client_id);
            }

            rooms.prune_expired(&mut clients);
        }
    }
}
