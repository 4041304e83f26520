use clap::{Args, Parser, Subcommand};

use crate::config::{Domain, Environment};

#[derive(Parser, Debug)]
#[command(name = "squirrel", author, version)]
#[command(about = "Relay log lines from a broadcaster to remote subscribers")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the relay server
    Serve(ServeArgs),
    /// Pipe stdin to the relay once a subscriber attaches
    Broadcast(BroadcastArgs),
    /// Print the lines of a broadcaster
    Listen(ListenArgs),
}

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// Address to bind the HTTP/websocket listener to.
    #[arg(long, env = "SQUIRREL_LISTEN_ADDR", default_value = "0.0.0.0:3000")]
    pub listen_addr: String,

    /// Public host name used when handing out subscriber links.
    #[arg(long, env = "SQUIRREL_DOMAIN", default_value = "localhost:3000")]
    pub domain: String,

    #[arg(long, env = "SQUIRREL_ENV", value_enum, default_value_t = Environment::Prod)]
    pub env: Environment,

    /// Seconds a peer may stay silent before it is dropped.
    #[arg(long, env = "SQUIRREL_PEER_TIMEOUT_SECS", default_value_t = 60)]
    pub peer_timeout_secs: u64,

    /// Upper bound on a single websocket write.
    #[arg(long, env = "SQUIRREL_WRITE_TIMEOUT_SECS", default_value_t = 10)]
    pub write_timeout_secs: u64,

    /// Messages buffered per connection before a slow reader is disconnected.
    #[arg(long, env = "SQUIRREL_OUTBOUND_CAPACITY", default_value_t = 256)]
    pub outbound_capacity: usize,

    /// Largest inbound websocket message accepted, in bytes.
    #[arg(long, env = "SQUIRREL_MAX_MESSAGE_SIZE", default_value_t = 1024)]
    pub max_message_size: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "SQUIRREL_SHUTDOWN_GRACE_SECS", default_value_t = 1)]
    pub shutdown_grace_secs: u64,
}

/// Where a client finds the relay.
#[derive(Args, Debug, Clone)]
pub struct RemoteArgs {
    #[arg(long, env = "SQUIRREL_DOMAIN", default_value = "localhost:3000")]
    pub domain: String,

    #[arg(long, env = "SQUIRREL_ENV", value_enum, default_value_t = Environment::Prod)]
    pub env: Environment,
}

impl RemoteArgs {
    pub fn domain(&self) -> Domain {
        Domain::new(&self.domain, self.env)
    }
}

#[derive(Args, Debug)]
pub struct BroadcastArgs {
    #[command(flatten)]
    pub remote: RemoteArgs,

    /// Echo every line locally as it is sent.
    #[arg(long, default_value_t = false)]
    pub output: bool,
}

#[derive(Args, Debug)]
pub struct ListenArgs {
    #[command(flatten)]
    pub remote: RemoteArgs,

    /// Id of the broadcaster to subscribe to.
    #[arg(long)]
    pub peer_id: String,
}
