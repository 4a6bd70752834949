use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the broker, accepting TCP and optionally Unix-domain connections.
    Broker(BrokerArgs),
    /// Connect to a broker and bridge stdin lines onto the bus.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// TCP port to listen on. Use 0 for an ephemeral port.
    #[arg(long, default_value_t = buxtehude::DEFAULT_PORT)]
    pub port: u16,

    /// Also listen on a Unix-domain socket at this path.
    #[arg(long)]
    pub unix: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Team name used when joining the bus.
    #[arg(long)]
    pub team: String,

    /// Broker host to connect to.
    #[arg(long, default_value = "localhost")]
    pub host: String,

    /// Broker TCP port.
    #[arg(long, default_value_t = buxtehude::DEFAULT_PORT)]
    pub port: u16,

    /// Connect through a Unix-domain socket instead of TCP.
    #[arg(long)]
    pub unix: Option<PathBuf>,

    /// Destination team for lines read from stdin.
    #[arg(long, default_value = buxtehude::MSG_ALL)]
    pub dest: String,

    /// Use MessagePack instead of JSON on the wire.
    #[arg(long)]
    pub msgpack: bool,
}
