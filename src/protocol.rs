//! Wire codec for the line-oriented protocol.
//!
//! Every message travels as a single ASCII line: the literal prefix `##`, a
//! TAG, zero or more `|`-separated arguments, and a terminating `\n`.
//! Inbound lines are decoded into [`Command`] values; outbound payloads are
//! framed by [`Outbound`], so handlers only ever deal in bare payloads like
//! `CREATED|0|lobby`.

use crate::game::SIZE;
use thiserror::Error;
use tokio::sync::mpsc;

/// Maximum accepted length of one inbound line, in bytes. Longer lines are
/// rejected whole and count as one invalid input.
pub const MAX_LINE: usize = 512;

/// Maximum stored length of nicknames and room names, in bytes.
pub const MAX_NAME: usize = 31;

/// Clamps a client-supplied name to [`MAX_NAME`] bytes without splitting a
/// UTF-8 sequence.
pub fn truncate_name(raw: &str) -> String {
    if raw.len() <= MAX_NAME {
        return raw.to_string();
    }
    let mut end = MAX_NAME;
    while !raw.is_char_boundary(end) {
        end -= 1;
    }
    raw[..end].to_string()
}

/// Cloneable handle for queueing outbound lines to a single client.
///
/// Framing happens here (`payload` -> `##payload\n`). The queue is drained
/// by the connection's writer task; sending into a closed queue is silently
/// dropped — dead connections are the liveness layer's problem, not the
/// sender's.
#[derive(Debug, Clone)]
pub struct Outbound(mpsc::UnboundedSender<String>);

impl Outbound {
    /// Creates the handle together with the receiver the writer task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Queues one framed protocol line.
    ///
    /// Example: `out.send("JOINED|alice")` puts `##JOINED|alice\n` on the wire.
    pub fn send(&self, payload: impl AsRef<str>) {
        let _ = self.0.send(format!("##{}\n", payload.as_ref()));
    }
}

/// One inbound command, decoded from a protocol line.
///
/// `Move` keeps its coordinates optional because the not-in-a-room check
/// must run before the format check; `JoinRoom` likewise carries the raw
/// parse result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Join { name: String },
    Reconnect { name: String, session: String },
    Create { name: String },
    JoinRoom { id: Option<u32> },
    Exit,
    List,
    Move { coords: Option<(usize, usize)> },
    Replay { again: bool },
    Quit,
    Ping,
    Pong,
}

/// Lines rejected before reaching a handler. The `Display` text is exactly
/// what goes out in the `ERROR|…` reply.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("UNKNOWN_CMD")]
    UnknownCommand,
    #[error("Invalid reconnect format")]
    InvalidReconnect,
}

/// Decodes one inbound line. Trailing CR/LF is stripped; the `##` prefix is
/// mandatory; the TAG runs up to the first `|`; arguments split on `|`, so
/// an empty trailing argument after a final `|` is permitted.
pub fn parse(line: &str) -> Result<Command, ParseError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let payload = line.strip_prefix("##").ok_or(ParseError::UnknownCommand)?;
    let (tag, rest) = match payload.split_once('|') {
        Some((tag, rest)) => (tag, Some(rest)),
        None => (payload, None),
    };
    let args: Vec<&str> = rest.map(|r| r.split('|').collect()).unwrap_or_default();

    match tag {
        "JOIN" => Ok(Command::Join {
            name: truncate_name(args.first().copied().unwrap_or("")),
        }),
        "RECONNECT" => {
            let name = args.first().copied().filter(|s| !s.is_empty());
            let session = args.get(1).copied().filter(|s| !s.is_empty());
            match (name, session) {
                (Some(name), Some(session)) => Ok(Command::Reconnect {
                    name: truncate_name(name),
                    session: truncate_name(session),
                }),
                _ => Err(ParseError::InvalidReconnect),
            }
        }
        "CREATE" => Ok(Command::Create {
            name: truncate_name(args.first().copied().unwrap_or("")),
        }),
        "JOINROOM" => Ok(Command::JoinRoom {
            id: args.first().and_then(|s| s.trim().parse().ok()),
        }),
        "EXIT" => Ok(Command::Exit),
        "LIST" => Ok(Command::List),
        "MOVE" => Ok(Command::Move {
            coords: parse_coords(&args),
        }),
        "REPLAY" => Ok(Command::Replay {
            again: args
                .first()
                .is_some_and(|a| a.eq_ignore_ascii_case("YES")),
        }),
        "QUIT" => Ok(Command::Quit),
        "PING" => Ok(Command::Ping),
        "PONG" => Ok(Command::Pong),
        _ => Err(ParseError::UnknownCommand),
    }
}

/// Two non-negative on-board integers, or `None` for anything else.
fn parse_coords(args: &[&str]) -> Option<(usize, usize)> {
    let x: usize = args.first()?.trim().parse().ok()?;
    let y: usize = args.get(1)?.trim().parse().ok()?;
    (x < SIZE && y < SIZE).then_some((x, y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_frames_payloads() {
        let (tx, mut rx) = Outbound::channel();
        tx.send("HELLO|");
        tx.send("CREATED|0|lobby");
        assert_eq!(rx.try_recv().unwrap(), "##HELLO|\n");
        assert_eq!(rx.try_recv().unwrap(), "##CREATED|0|lobby\n");
    }

    #[test]
    fn outbound_send_survives_closed_receiver() {
        let (tx, rx) = Outbound::channel();
        drop(rx);
        tx.send("PING|");
    }

    #[test]
    fn parse_requires_prefix() {
        assert_eq!(parse("JOIN|alice"), Err(ParseError::UnknownCommand));
        assert_eq!(parse(""), Err(ParseError::UnknownCommand));
        assert_eq!(parse("garbage"), Err(ParseError::UnknownCommand));
    }

    #[test]
    fn parse_unknown_tag() {
        assert_eq!(parse("##DANCE|"), Err(ParseError::UnknownCommand));
    }

    #[test]
    fn parse_strips_crlf() {
        assert_eq!(
            parse("##JOIN|alice\r\n"),
            Ok(Command::Join {
                name: "alice".to_string()
            })
        );
    }

    #[test]
    fn parse_join_cuts_at_first_pipe() {
        assert_eq!(
            parse("##JOIN|alice|trailing"),
            Ok(Command::Join {
                name: "alice".to_string()
            })
        );
        assert_eq!(parse("##JOIN|"), Ok(Command::Join { name: String::new() }));
    }

    #[test]
    fn parse_bare_tag_without_pipe() {
        assert_eq!(parse("##LIST"), Ok(Command::List));
        assert_eq!(parse("##QUIT|"), Ok(Command::Quit));
    }

    #[test]
    fn parse_reconnect() {
        assert_eq!(
            parse("##RECONNECT|alice|00c0ffee00c0ffee"),
            Ok(Command::Reconnect {
                name: "alice".to_string(),
                session: "00c0ffee00c0ffee".to_string()
            })
        );
        assert_eq!(parse("##RECONNECT|alice"), Err(ParseError::InvalidReconnect));
        assert_eq!(parse("##RECONNECT|alice|"), Err(ParseError::InvalidReconnect));
        assert_eq!(parse("##RECONNECT|"), Err(ParseError::InvalidReconnect));
    }

    #[test]
    fn parse_joinroom_ids() {
        assert_eq!(parse("##JOINROOM|7"), Ok(Command::JoinRoom { id: Some(7) }));
        assert_eq!(parse("##JOINROOM|x"), Ok(Command::JoinRoom { id: None }));
        assert_eq!(parse("##JOINROOM|"), Ok(Command::JoinRoom { id: None }));
    }

    #[test]
    fn parse_move_coords() {
        assert_eq!(
            parse("##MOVE|0|2"),
            Ok(Command::Move {
                coords: Some((0, 2))
            })
        );
        assert_eq!(parse("##MOVE|3|0"), Ok(Command::Move { coords: None }));
        assert_eq!(parse("##MOVE|-1|0"), Ok(Command::Move { coords: None }));
        assert_eq!(parse("##MOVE|a|b"), Ok(Command::Move { coords: None }));
        assert_eq!(parse("##MOVE|1"), Ok(Command::Move { coords: None }));
    }

    #[test]
    fn parse_replay_is_case_insensitive_yes() {
        assert_eq!(parse("##REPLAY|YES"), Ok(Command::Replay { again: true }));
        assert_eq!(parse("##REPLAY|yes"), Ok(Command::Replay { again: true }));
        assert_eq!(parse("##REPLAY|NO"), Ok(Command::Replay { again: false }));
        assert_eq!(parse("##REPLAY|maybe"), Ok(Command::Replay { again: false }));
        assert_eq!(parse("##REPLAY|"), Ok(Command::Replay { again: false }));
    }

    #[test]
    fn truncate_name_respects_byte_limit() {
        let long = "a".repeat(40);
        assert_eq!(truncate_name(&long).len(), MAX_NAME);
        assert_eq!(truncate_name("short"), "short");
    }

    #[test]
    fn truncate_name_keeps_utf8_boundaries() {
        // 'é' is two bytes; byte 31 falls in the middle of the 16th one.
        let name = "é".repeat(20);
        let cut = truncate_name(&name);
        assert!(cut.len() <= MAX_NAME);
        assert_eq!(cut, "é".repeat(15));
    }
}
