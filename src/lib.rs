//! # Tic-Tac-Toe Server Library
//!
//! The authoritative server for networked multiplayer Tic-Tac-Toe. It hosts
//! many concurrent two-player matches organised into named rooms, speaking a
//! line-oriented ASCII protocol (`##TAG|arg|…\n`) over plain TCP.
//!
//! ## Core Responsibilities
//!
//! ### Match Hosting
//! Clients pick a nickname, create or join rooms, and exchange moves in
//! strict turn order. The server owns the board: every move is validated
//! here, results are decided here, and both players only ever see the
//! server's version of events.
//!
//! ### Liveness and Reconnect
//! A heartbeat task PINGs every connection and expires the silent ones. An
//! unannounced drop does not destroy the game: the vacated seat keeps its
//! `(nickname, session token)` identity for a bounded grace window, during
//! which the same player can `RECONNECT` and have the in-flight board
//! replayed to them. Only when the window lapses is the match forfeited.
//!
//! ### Abuse Bounds
//! Connection and room counts are capped, inbound lines are length-limited,
//! and malformed input is metered per client — three strikes terminate the
//! session.
//!
//! ## Module Organization
//!
//! - [`protocol`] — wire framing and inbound command parsing
//! - [`game`] — the 3×3 board rules for a single round
//! - [`client_manager`] — per-connection records and the client table
//! - [`room_manager`] — rooms, seats, reconnect identity, and every
//!   registry operation
//! - [`network`] — TCP bootstrap, per-connection workers, heartbeat
//! - [`config`] — flat key=value configuration
//!
//! ## Concurrency Model
//!
//! Two coarse locks guard the shared state: one for the client table, one
//! for the room registry, acquired in that order. Handlers queue outbound
//! lines through per-client channels while holding the locks, so a
//! broadcast's ordering always matches the state change it describes, and
//! no lock is ever held across a blocking socket operation.

pub mod client_manager;
pub mod config;
pub mod game;
pub mod network;
pub mod protocol;
pub mod room_manager;
