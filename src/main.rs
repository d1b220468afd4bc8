use clap::Parser;
use log::info;
use tictactoe_server::config::ServerConfig;
use tictactoe_server::network::Server;

// Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Port to listen on; overrides the configuration file
    port: Option<u16>,

    /// Path to the key=value configuration file
    #[arg(short, long, default_value = "server.config")]
    config: String,
}

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Initialize logger
    env_logger::init();

    // Print a message about setting RUST_LOG if not set
    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    let args = Args::parse();
    let mut config = ServerConfig::load(&args.config);
    if let Some(port) = args.port {
        config.port = port;
    }

    info!(
        "Starting Tic-Tac-Toe server on {}:{}",
        config.bind_address, config.port
    );
    info!(
        "Limits: {} clients, {} rooms, {} s reconnect grace",
        config.max_clients, config.max_rooms, config.disconnect_grace_secs
    );

    Server::new(config).run().await
}
