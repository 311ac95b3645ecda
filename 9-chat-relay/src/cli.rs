use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

/// Line-based TCP chat relay: one binary for both the server and the terminal client.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Relay every line a client sends to all other connected clients.
    Server(ServerArgs),
    /// Join a relay and send stdin lines as `<username>: <text>`.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Address to accept clients on. The bound address is printed on stdout,
    /// so port 0 picks a free port.
    #[arg(long, default_value = "127.0.0.1:1234")]
    pub listen: SocketAddr,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// First line sent to the relay. Not validated; asked for on stdin when omitted.
    #[arg(long)]
    pub username: Option<String>,

    /// Relay to connect to.
    #[arg(long, default_value = "127.0.0.1:1234")]
    pub server: SocketAddr,
}
