//! Rooms, player seats, and the registry that coordinates matches.
//!
//! Everything in this module runs under the room-registry lock. Operations
//! mutate room and client state together and queue their outbound messages
//! in the same critical section, which is what keeps broadcast ordering
//! consistent with the state changes the messages describe.

use crate::client_manager::{Client, ClientId, ClientManager, ClientState};
use crate::game::{Game, GameState, PlayerSlot, SIZE};
use log::{debug, info};
use std::time::{Duration, Instant};

pub type RoomId = u32;

/// Room lifecycle. `Empty` is transient: a room observed empty is removed
/// from the registry in the same operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    Empty,
    Waiting,
    Playing,
}

impl RoomState {
    fn as_str(self) -> &'static str {
        match self {
            RoomState::Playing => "PLAYING",
            _ => "WAITING",
        }
    }
}

/// One player position inside a room.
///
/// The identity fields outlive the occupant: they are written whenever a
/// client takes the seat, and after an unannounced drop they are what a
/// `RECONNECT` attempt is matched against. A voluntary exit clears them.
#[derive(Debug, Default)]
pub struct Seat {
    pub client: Option<ClientId>,
    pub name: String,
    pub session: String,
    pub disconnected: bool,
    pub disconnected_at: Option<Instant>,
}

impl Seat {
    pub fn is_live(&self) -> bool {
        self.client.is_some()
    }

    /// A vacated seat still held for its previous occupant's return.
    pub fn is_reserved(&self) -> bool {
        self.client.is_none() && self.disconnected
    }

    fn occupy(&mut self, client: &Client) {
        self.client = Some(client.id);
        self.name = client.name.clone();
        self.session = client.session.clone();
        self.disconnected = false;
        self.disconnected_at = None;
    }

    fn clear(&mut self) {
        *self = Seat::default();
    }
}

/// A single match room: two seats, an embedded game, and the replay state
/// carried between rounds.
#[derive(Debug)]
pub struct Room {
    pub id: RoomId,
    pub name: String,
    pub state: RoomState,
    pub game: Game,
    pub seats: [Seat; 2],
    pub replay_votes: [bool; 2],
    /// The seat that opens the next round; flipped on each accepted replay.
    pub starting_player: PlayerSlot,
}

impl Room {
    fn new(id: RoomId, name: String) -> Self {
        Self {
            id,
            name,
            state: RoomState::Waiting,
            game: Game::new(),
            seats: [Seat::default(), Seat::default()],
            replay_votes: [false, false],
            starting_player: PlayerSlot::P1,
        }
    }

    pub fn seat(&self, slot: PlayerSlot) -> &Seat {
        &self.seats[slot.index()]
    }

    pub fn seat_mut(&mut self, slot: PlayerSlot) -> &mut Seat {
        &mut self.seats[slot.index()]
    }

    pub fn slot_of(&self, client_id: ClientId) -> Option<PlayerSlot> {
        PlayerSlot::BOTH
            .into_iter()
            .find(|slot| self.seat(*slot).client == Some(client_id))
    }

    pub fn live_count(&self) -> usize {
        self.seats.iter().filter(|seat| seat.is_live()).count()
    }
}

/// The room registry. Rooms are kept in creation order (which is also the
/// order `LIST` reports them in) and looked up by their monotonic id.
#[derive(Debug)]
pub struct RoomManager {
    rooms: Vec<Room>,
    next_room_id: RoomId,
    max_rooms: usize,
    disconnect_grace: Duration,
}

impl RoomManager {
    pub fn new(max_rooms: usize, disconnect_grace: Duration) -> Self {
        Self {
            rooms: Vec::new(),
            next_room_id: 0,
            max_rooms,
            disconnect_grace,
        }
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    fn room_mut(&mut self, room_id: RoomId) -> Option<&mut Room> {
        self.rooms.iter_mut().find(|room| room.id == room_id)
    }

    /// Creates a room with the caller seated first, or reports `Lobby full`.
    pub fn create(&mut self, clients: &mut ClientManager, creator: ClientId, name: String) {
        if self.rooms.len() >= self.max_rooms {
            clients.send(creator, "ERROR|Lobby full");
            return;
        }

        let room_id = self.next_room_id;
        self.next_room_id += 1;
        let mut room = Room::new(room_id, name);

        let Some(client) = clients.get_mut(creator) else {
            return;
        };
        room.seats[0].occupy(client);
        client.room = Some(room_id);
        client.state = ClientState::Waiting;
        client.tx.send(format!("CREATED|{}|{}", room_id, room.name));

        info!("Client {} created room {} ({})", creator, room_id, room.name);
        self.rooms.push(room);
    }

    /// Seats a second player and starts round one.
    ///
    /// Only rooms with exactly one live occupant are joinable; a room whose
    /// sole claim is a reserved seat keeps waiting for its reconnect. The
    /// lone live player is normalised into the first seat, so the joiner
    /// always takes the second and plays noughts for the opening round.
    pub fn join(&mut self, clients: &mut ClientManager, joiner: ClientId, room_id: RoomId) {
        let Some(room) = self.rooms.iter_mut().find(|room| room.id == room_id) else {
            clients.send(joiner, "ERROR|No such room");
            return;
        };
        if room.slot_of(joiner).is_some() {
            clients.send(joiner, "ERROR|Cannot join your own room");
            return;
        }
        if room.live_count() != 1 {
            clients.send(joiner, "ERROR|Room full");
            return;
        }

        if !room.seats[0].is_live() {
            room.seats.swap(0, 1);
            room.replay_votes.swap(0, 1);
        }
        let Some(host) = room.seats[0].client else {
            return;
        };

        {
            let Some(client) = clients.get_mut(joiner) else {
                return;
            };
            // Taking a reserved seat voids any pending reconnect claim on it.
            room.seats[1].occupy(client);
            client.room = Some(room.id);
            client.state = ClientState::Playing;
        }
        if let Some(host_client) = clients.get_mut(host) {
            host_client.state = ClientState::Playing;
        }

        room.state = RoomState::Playing;
        room.replay_votes = [false, false];
        room.starting_player = PlayerSlot::P1;
        room.game.reset(PlayerSlot::P1);

        let host_name = clients.get(host).map(|c| c.name.clone()).unwrap_or_default();
        let joiner_name = clients
            .get(joiner)
            .map(|c| c.name.clone())
            .unwrap_or_default();

        clients.send(joiner, format!("JOINEDROOM|{}|{}", room.id, room.name));
        clients.send(host, "CLEAR|");
        clients.send(joiner, "CLEAR|");
        clients.send(host, format!("START|Opponent:{}", joiner_name));
        clients.send(joiner, format!("START|Opponent:{}", host_name));
        clients.send(host, "SYMBOL|X");
        clients.send(joiner, "SYMBOL|O");
        clients.send(host, "TURN|Your move");

        info!(
            "Client {} joined room {} against client {}",
            joiner, room.id, host
        );
    }

    /// Voluntary exit. The seat is given up entirely: no reconnect claim
    /// survives, and a mid-game exit forfeits the round to the opponent.
    pub fn leave(&mut self, clients: &mut ClientManager, leaver: ClientId) {
        let Some(room_id) = clients.get(leaver).and_then(|c| c.room) else {
            return;
        };
        let Some(room) = self.rooms.iter_mut().find(|room| room.id == room_id) else {
            return;
        };
        let Some(slot) = room.slot_of(leaver) else {
            return;
        };
        let was_playing = room.state == RoomState::Playing;

        room.seat_mut(slot).clear();
        if room.game.current_turn() == Some(slot) {
            room.game.set_turn(None);
        }
        room.replay_votes = [false, false];

        if let Some(client) = clients.get_mut(leaver) {
            client.room = None;
            client.state = ClientState::Lobby;
            client.tx.send("EXITED|");
        }

        let other = room.seat(slot.other()).client;
        if let Some(other_id) = other {
            if was_playing {
                clients.send(other_id, "INFO|Opponent left");
                clients.send(other_id, "WIN|You");
                room.game.forfeit();
            }
            if let Some(other_client) = clients.get_mut(other_id) {
                other_client.state = ClientState::Waiting;
            }
            room.state = RoomState::Waiting;
        } else if room.seat(slot.other()).is_reserved() {
            room.state = RoomState::Waiting;
        } else {
            room.state = RoomState::Empty;
        }

        info!("Client {} left room {}", leaver, room_id);
        self.remove_if_empty(room_id);
    }

    /// Sends the room snapshot as one line:
    /// `ROOMS|count|id|name|state|occupied/2|…`, live occupants only.
    pub fn list(&self, clients: &ClientManager, requester: ClientId) {
        let mut payload = format!("ROOMS|{}", self.rooms.len());
        for room in &self.rooms {
            if room.state == RoomState::Empty {
                continue;
            }
            payload.push_str(&format!(
                "|{}|{}|{}|{}/2",
                room.id,
                room.name,
                room.state.as_str(),
                room.live_count()
            ));
        }
        clients.send(requester, payload);
    }

    /// Applies a validated-on-format move through the game engine and
    /// orchestrates the resulting broadcasts.
    pub fn handle_move(&mut self, clients: &mut ClientManager, mover: ClientId, x: usize, y: usize) {
        let Some(room_id) = clients.get(mover).and_then(|c| c.room) else {
            return;
        };
        let Some(room) = self.rooms.iter_mut().find(|room| room.id == room_id) else {
            return;
        };
        let Some(slot) = room.slot_of(mover) else {
            return;
        };

        let outcome = match room.game.play(slot, x, y) {
            Ok(state) => state,
            Err(err) => {
                clients.send(mover, format!("ERROR|{}", err));
                return;
            }
        };

        let mover_name = clients.get(mover).map(|c| c.name.clone()).unwrap_or_default();
        debug!(
            "Move: room {} {} ({}) -> {},{}",
            room.name,
            mover_name,
            slot.symbol(),
            x,
            y
        );
        for seat in &room.seats {
            if let Some(id) = seat.client {
                clients.send(id, format!("MOVE|{}|{}|{}", mover_name, x, y));
            }
        }

        match outcome {
            GameState::Won => {
                room.replay_votes = [false, false];
                clients.send(mover, "WIN|You");
                if let Some(other_id) = room.seat(slot.other()).client {
                    clients.send(other_id, format!("LOSE|{}", mover_name));
                }
                info!("Game result in room {}: {} wins", room.name, mover_name);
            }
            GameState::Draw => {
                room.replay_votes = [false, false];
                for seat in &room.seats {
                    if let Some(id) = seat.client {
                        clients.send(id, "DRAW|");
                    }
                }
                info!("Game result in room {}: draw", room.name);
            }
            GameState::Running => {
                if let Some(next) = room.game.current_turn() {
                    if let Some(id) = room.seat(next).client {
                        clients.send(id, "TURN|Your move");
                    }
                }
                return;
            }
        }

        // Terminal result with the opponent gone: nothing to replay against.
        if room.live_count() == 1 {
            if let Some(id) = room.seats.iter().find_map(|seat| seat.client) {
                clients.send(id, "INFO|Game ended");
            }
            room.state = RoomState::Waiting;
        }
    }

    /// Records a replay vote or treats a refusal as a scoped voluntary exit.
    pub fn handle_replay(&mut self, clients: &mut ClientManager, voter: ClientId, again: bool) {
        let Some(room_id) = clients.get(voter).and_then(|c| c.room) else {
            return;
        };
        let Some(slot) = self
            .room_mut(room_id)
            .and_then(|room| room.slot_of(voter))
        else {
            return;
        };

        if !again {
            self.decline_replay(clients, voter, room_id, slot);
            return;
        }

        if let Some(room) = self.room_mut(room_id) {
            room.replay_votes[slot.index()] = true;
        }
        clients.send(voter, "INFO|Replay confirmed");
        self.try_restart(clients, room_id);
    }

    fn decline_replay(
        &mut self,
        clients: &mut ClientManager,
        decliner: ClientId,
        room_id: RoomId,
        slot: PlayerSlot,
    ) {
        clients.send(decliner, "INFO|You declined replay");

        let Some(room) = self.room_mut(room_id) else {
            return;
        };
        let other = room.seat(slot.other()).client;
        if let Some(other_id) = other {
            clients.send(other_id, "INFO|Opponent declined replay");
            if let Some(other_client) = clients.get_mut(other_id) {
                other_client.state = ClientState::Waiting;
            }
        }

        // Declining is voluntary: the seat loses its reconnect claim.
        room.seat_mut(slot).clear();
        room.replay_votes = [false, false];
        room.state = if other.is_some() || room.seat(slot.other()).is_reserved() {
            RoomState::Waiting
        } else {
            RoomState::Empty
        };

        if let Some(client) = clients.get_mut(decliner) {
            client.room = None;
            client.state = ClientState::Lobby;
            client.tx.send("EXITED|");
        }

        info!("Client {} declined replay in room {}", decliner, room_id);
        self.remove_if_empty(room_id);
    }

    /// Starts the next round once both seats are live and both votes are in.
    /// The opening seat flips, and the symbol announcements follow the new
    /// starter.
    pub fn try_restart(&mut self, clients: &mut ClientManager, room_id: RoomId) {
        let Some(room) = self.room_mut(room_id) else {
            return;
        };
        let (Some(first), Some(second)) = (room.seats[0].client, room.seats[1].client) else {
            return;
        };
        if !(room.replay_votes[0] && room.replay_votes[1]) {
            return;
        }

        room.starting_player = room.starting_player.other();
        let starter = room.starting_player;
        room.game.reset(starter);
        room.state = RoomState::Playing;
        room.replay_votes = [false, false];

        let (starter_id, other_id) = match starter {
            PlayerSlot::P1 => (first, second),
            PlayerSlot::P2 => (second, first),
        };
        for id in [first, second] {
            clients.send(id, "RESTART|");
            if let Some(client) = clients.get_mut(id) {
                client.state = ClientState::Playing;
            }
        }
        clients.send(starter_id, "SYMBOL|X");
        clients.send(other_id, "SYMBOL|O");
        clients.send(starter_id, "TURN|Your move");

        info!("Room {} restarting, {:?} opens", room_id, starter);
    }

    /// Unannounced-loss handler: vacates the seat but keeps its identity so
    /// the same player can reclaim it with `RECONNECT` inside the grace
    /// window. Runs for read failures, heartbeat expiry, the strike limit,
    /// and `QUIT` issued while still seated.
    pub fn disconnect(&mut self, clients: &mut ClientManager, client_id: ClientId) {
        let (room_id, name, session) = {
            let Some(client) = clients.get_mut(client_id) else {
                return;
            };
            client.connected = false;
            let Some(room_id) = client.room.take() else {
                client.state = ClientState::Lobby;
                return;
            };
            client.state = ClientState::Lobby;
            (room_id, client.name.clone(), client.session.clone())
        };
        info!(
            "Client {} ({}) lost connection while in room {}",
            client_id, name, room_id
        );

        let grace_secs = self.disconnect_grace.as_secs();
        let Some(room) = self.rooms.iter_mut().find(|room| room.id == room_id) else {
            return;
        };
        let Some(slot) = room.slot_of(client_id) else {
            return;
        };

        let other = room.seat(slot.other()).client;
        {
            let seat = room.seat_mut(slot);
            seat.client = None;
            seat.name = name;
            seat.session = session;
            // A seat that goes away with nobody left needs no reservation.
            seat.disconnected = other.is_some();
            seat.disconnected_at = Some(Instant::now());
        }
        if room.game.current_turn() == Some(slot) {
            room.game.set_turn(None);
        }

        if let Some(other_id) = other {
            clients.send(
                other_id,
                format!(
                    "INFO|Opponent disconnected, waiting {} s to reconnect",
                    grace_secs
                ),
            );
            if let Some(other_client) = clients.get_mut(other_id) {
                other_client.state = ClientState::Waiting;
            }
            room.state = RoomState::Waiting;
        } else if room.seat(slot.other()).is_reserved() {
            room.state = RoomState::Waiting;
        } else {
            room.state = RoomState::Empty;
        }
        self.remove_if_empty(room_id);
    }

    /// Matches `(name, session)` against reserved seats and, on the first
    /// hit, seats the newcomer and replays the in-flight game to it.
    pub fn reconnect(
        &mut self,
        clients: &mut ClientManager,
        newcomer: ClientId,
        name: &str,
        session: &str,
    ) {
        let mut name_matched = false;
        let mut target = None;
        'scan: for room in &self.rooms {
            for slot in PlayerSlot::BOTH {
                let seat = room.seat(slot);
                if seat.is_reserved() && seat.name == name {
                    if seat.session == session {
                        target = Some((room.id, slot));
                        break 'scan;
                    }
                    name_matched = true;
                }
            }
        }
        let Some((room_id, slot)) = target else {
            clients.send(
                newcomer,
                if name_matched {
                    "ERROR|Invalid session"
                } else {
                    "ERROR|No reconnect slot"
                },
            );
            return;
        };
        let Some(room) = self.rooms.iter_mut().find(|room| room.id == room_id) else {
            return;
        };

        {
            let seat = room.seat_mut(slot);
            seat.client = Some(newcomer);
            seat.disconnected = false;
            seat.disconnected_at = None;
        }
        let both_live = room.seats.iter().all(Seat::is_live);
        if let Some(client) = clients.get_mut(newcomer) {
            client.room = Some(room_id);
            client.state = if both_live {
                ClientState::Playing
            } else {
                ClientState::Waiting
            };
        }

        let opponent = room.seat(slot.other()).client;
        let opponent_name = opponent
            .and_then(|id| clients.get(id))
            .map(|c| c.name.clone())
            .unwrap_or_else(|| "Unknown".to_string());

        clients.send(newcomer, "RECONNECTED|");
        clients.send(newcomer, format!("START|Opponent:{}", opponent_name));
        clients.send(newcomer, format!("SYMBOL|{}", slot.symbol()));
        for y in 0..SIZE {
            for x in 0..SIZE {
                if let Some(owner) = room.game.cell(x, y) {
                    let mover = &room.seat(owner).name;
                    clients.send(newcomer, format!("MOVE|{}|{}|{}", mover, x, y));
                }
            }
        }
        // The turn is vacated when the on-move player drops; hand it back so
        // the round can continue.
        if room.game.state() == GameState::Running && room.game.current_turn().is_none() {
            room.game.set_turn(Some(slot));
        }
        if room.game.current_turn() == Some(slot) {
            clients.send(newcomer, "TURN|");
        }

        if let Some(opponent_id) = opponent {
            clients.send(opponent_id, "INFO|Opponent reconnected");
            if both_live {
                if let Some(opponent_client) = clients.get_mut(opponent_id) {
                    opponent_client.state = ClientState::Playing;
                }
                room.state = RoomState::Playing;
            }
        }

        info!("Client {} reconnected into room {}", newcomer, room_id);
    }

    /// Forfeits rooms whose reserved seat has outstayed the grace window.
    pub fn prune_expired(&mut self, clients: &mut ClientManager) {
        let now = Instant::now();
        let grace = self.disconnect_grace;
        let expired: Vec<RoomId> = self
            .rooms
            .iter()
            .filter(|room| {
                room.seats.iter().any(|seat| {
                    seat.is_reserved()
                        && seat
                            .disconnected_at
                            .is_some_and(|at| now.duration_since(at) >= grace)
                })
            })
            .map(|room| room.id)
            .collect();

        for room_id in expired {
            let Some(idx) = self.rooms.iter().position(|room| room.id == room_id) else {
                continue;
            };
            let room = &self.rooms[idx];
            info!(
                "Reconnect grace expired in room {} ({})",
                room.id, room.name
            );
            if let Some(winner_id) = room.seats.iter().find_map(|seat| seat.client) {
                clients.send(winner_id, "INFO|Opponent did not return in time");
                clients.send(winner_id, "WIN|You");
                if let Some(winner) = clients.get_mut(winner_id) {
                    winner.room = None;
                    winner.state = ClientState::Lobby;
                }
            }
            self.rooms.remove(idx);
        }
    }

    /// Drops a room once nothing occupies it: no live client on either seat
    /// and no seat reserved for a reconnect.
    fn remove_if_empty(&mut self, room_id: RoomId) {
        let Some(idx) = self.rooms.iter().position(|room| room.id == room_id) else {
            return;
        };
        let gone = self.rooms[idx]
            .seats
            .iter()
            .all(|seat| !seat.is_live() && !seat.is_reserved());
        if gone {
            info!("Removing empty room {}", room_id);
            self.rooms.remove(idx);
        }
    }
}
