use clap::{Args, Parser, Subcommand};

/// Port both endpoints use unless told otherwise.
pub const DEFAULT_PORT: u16 = 8080;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Wait for exactly one peer to connect, then chat with it.
    Server(ServerArgs),
    /// Connect to a waiting server and chat with it.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServerArgs {
    /// Interface address to bind to.
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Label printed in front of everything the peer sends.
    #[arg(long, default_value = "peer")]
    pub peer_label: String,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the server, either an IP literal or a hostname.
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port the server is listening on.
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Label printed in front of everything the peer sends.
    #[arg(long, default_value = "peer")]
    pub peer_label: String,
}
