//! Integration tests driving a live server over real sockets.
//!
//! Each test binds its own ephemeral listener, so room ids always start at
//! zero and tests never share state. Reads skip interleaved heartbeat
//! `PING|` lines — the protocol makes no promise about where those land.

use std::net::SocketAddr;
use std::time::Duration;
use tictactoe_server::config::ServerConfig;
use tictactoe_server::network::Server;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("connect failed");
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    async fn send(&mut self, payload: &str) {
        self.writer
            .write_all(format!("##{}\n", payload).as_bytes())
            .await
            .expect("write failed");
    }

    /// Next protocol line, with heartbeat PINGs filtered out.
    async fn recv(&mut self) -> String {
        loop {
            let mut line = String::new();
            let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line))
                .await
                .expect("timed out waiting for a line")
                .expect("read failed");
            if n == 0 {
                return String::new(); // connection closed
            }
            let line = line.trim_end().to_string();
            if line == "##PING|" {
                continue;
            }
            return line;
        }
    }

    /// Reads until the connection closes, ignoring PINGs, returning the
    /// remaining lines.
    async fn recv_until_close(&mut self) -> Vec<String> {
        let mut lines = Vec::new();
        loop {
            let line = self.recv().await;
            if line.is_empty() {
                return lines;
            }
            lines.push(line);
        }
    }
}

async fn start_server(config: ServerConfig) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind failed");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(Server::new(config).serve(listener));
    addr
}

#[tokio::test]
async fn greets_and_registers_nicknames() {
    let addr = start_server(ServerConfig::default()).await;
    let mut client = TestClient::connect(addr).await;

    assert_eq!(client.recv().await, "##HELLO|");

    client.send("JOIN|alice").await;
    assert_eq!(client.recv().await, "##JOINED|alice");

    let session = client.recv().await;
    let token = session
        .strip_prefix("##SESSION|")
        .expect("expected a SESSION line");
    assert_eq!(token.len(), 16);
    assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn full_match_setup_and_first_moves() {
    let addr = start_server(ServerConfig::default()).await;

    let mut alice = TestClient::connect(addr).await;
    alice.recv().await; // HELLO
    alice.send("JOIN|alice").await;
    alice.recv().await; // JOINED
    alice.recv().await; // SESSION

    alice.send("CREATE|r1").await;
    assert_eq!(alice.recv().await, "##CREATED|0|r1");

    let mut bob = TestClient::connect(addr).await;
    bob.recv().await; // HELLO
    bob.send("JOIN|bob").await;
    bob.recv().await; // JOINED
    bob.recv().await; // SESSION

    bob.send("JOINROOM|0").await;
    assert_eq!(bob.recv().await, "##JOINEDROOM|0|r1");
    assert_eq!(bob.recv().await, "##CLEAR|");
    assert_eq!(bob.recv().await, "##START|Opponent:alice");
    assert_eq!(bob.recv().await, "##SYMBOL|O");

    assert_eq!(alice.recv().await, "##CLEAR|");
    assert_eq!(alice.recv().await, "##START|Opponent:bob");
    assert_eq!(alice.recv().await, "##SYMBOL|X");
    assert_eq!(alice.recv().await, "##TURN|Your move");

    alice.send("MOVE|0|0").await;
    assert_eq!(alice.recv().await, "##MOVE|alice|0|0");
    assert_eq!(bob.recv().await, "##MOVE|alice|0|0");
    assert_eq!(bob.recv().await, "##TURN|Your move");

    // Out of turn: rejected without disturbing the board.
    alice.send("MOVE|1|1").await;
    assert_eq!(alice.recv().await, "##ERROR|Not your turn");

    bob.send("MOVE|1|1").await;
    assert_eq!(bob.recv().await, "##MOVE|bob|1|1");
    assert_eq!(alice.recv().await, "##MOVE|bob|1|1");
    assert_eq!(alice.recv().await, "##TURN|Your move");
}

#[tokio::test]
async fn rejects_connections_beyond_capacity() {
    let config = ServerConfig {
        max_clients: 1,
        ..Default::default()
    };
    let addr = start_server(config).await;

    let mut first = TestClient::connect(addr).await;
    assert_eq!(first.recv().await, "##HELLO|");

    let mut second = TestClient::connect(addr).await;
    let lines = second.recv_until_close().await;
    assert_eq!(lines, vec!["##ERROR|Server full"]);
}

#[tokio::test]
async fn three_strikes_terminate_the_session() {
    let addr = start_server(ServerConfig::default()).await;
    let mut client = TestClient::connect(addr).await;
    client.recv().await; // HELLO

    client.send("BOGUS|").await;
    assert_eq!(client.recv().await, "##ERROR|UNKNOWN_CMD");
    client.send("NONSENSE|").await;
    assert_eq!(client.recv().await, "##ERROR|UNKNOWN_CMD");
    client.send("STILLWRONG|").await;

    let rest = client.recv_until_close().await;
    assert_eq!(
        rest,
        vec!["##ERROR|UNKNOWN_CMD", "##ERROR|Too many invalid messages"]
    );
}

#[tokio::test]
async fn list_is_stable_without_mutations() {
    let addr = start_server(ServerConfig::default()).await;
    let mut alice = TestClient::connect(addr).await;
    alice.recv().await; // HELLO
    alice.send("JOIN|alice").await;
    alice.recv().await;
    alice.recv().await;

    alice.send("LIST|").await;
    assert_eq!(alice.recv().await, "##ROOMS|0");

    alice.send("CREATE|lobby").await;
    assert_eq!(alice.recv().await, "##CREATED|0|lobby");

    alice.send("LIST|").await;
    let first = alice.recv().await;
    assert_eq!(first, "##ROOMS|1|0|lobby|WAITING|1/2");
    alice.send("LIST|").await;
    assert_eq!(alice.recv().await, first);
}

#[tokio::test]
async fn quit_says_goodbye_and_closes() {
    let addr = start_server(ServerConfig::default()).await;
    let mut client = TestClient::connect(addr).await;
    client.recv().await; // HELLO

    client.send("QUIT|").await;
    let lines = client.recv_until_close().await;
    assert_eq!(lines, vec!["##BYE|"]);
}

#[tokio::test]
async fn ping_is_answered_with_pong() {
    let addr = start_server(ServerConfig::default()).await;
    let mut client = TestClient::connect(addr).await;
    client.recv().await; // HELLO

    client.send("PING|").await;
    assert_eq!(client.recv().await, "##PONG|");
}

#[tokio::test]
async fn exit_hands_the_win_to_the_opponent() {
    let addr = start_server(ServerConfig::default()).await;

    let mut alice = TestClient::connect(addr).await;
    alice.recv().await;
    alice.send("JOIN|alice").await;
    alice.recv().await;
    alice.recv().await;
    alice.send("CREATE|r1").await;
    alice.recv().await;

    let mut bob = TestClient::connect(addr).await;
    bob.recv().await;
    bob.send("JOIN|bob").await;
    bob.recv().await;
    bob.recv().await;
    bob.send("JOINROOM|0").await;
    for _ in 0..4 {
        bob.recv().await; // JOINEDROOM, CLEAR, START, SYMBOL
    }
    for _ in 0..4 {
        alice.recv().await; // CLEAR, START, SYMBOL, TURN
    }

    bob.send("EXIT|").await;
    assert_eq!(bob.recv().await, "##EXITED|");
    assert_eq!(alice.recv().await, "##INFO|Opponent left");
    assert_eq!(alice.recv().await, "##WIN|You");

    // The room survives with Alice waiting in it.
    let mut carol = TestClient::connect(addr).await;
    carol.recv().await;
    carol.send("JOIN|carol").await;
    carol.recv().await;
    carol.recv().await;
    carol.send("LIST|").await;
    assert_eq!(carol.recv().await, "##ROOMS|1|0|r1|WAITING|1/2");
}
