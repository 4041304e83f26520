use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context};

use crate::cli::ServeArgs;

const DEFAULT_OUTBOUND_CAPACITY: usize = 256;
const DEFAULT_HUB_CAPACITY: usize = 1024;
const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024;

/// Knobs shared by the hub and every connection it relays for.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// How long a peer may stay silent before its read pump gives up.
    pub peer_timeout: Duration,
    /// Upper bound on a single write or flush.
    pub write_timeout: Duration,
    /// Capacity of each connection's outbound queue.
    pub outbound_capacity: usize,
    /// Capacity of the hub inbox.
    pub hub_capacity: usize,
    pub max_message_size: usize,
}

impl RelayConfig {
    /// Keepalive pings go out at 9/10 of the peer timeout so a healthy peer
    /// always answers before its deadline passes.
    pub fn keepalive_interval(&self) -> Duration {
        self.peer_timeout * 9 / 10
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            peer_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            hub_capacity: DEFAULT_HUB_CAPACITY,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Environment {
    Prod,
    Dev,
}

/// Public addresses handed out in subscriber links.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Domain {
    pub public: String,
    pub websocket: String,
}

impl Domain {
    /// Production deployments sit behind TLS, development ones do not.
    pub fn new(host: &str, env: Environment) -> Self {
        let secure = if env == Environment::Prod { "s" } else { "" };
        Self {
            public: format!("http{secure}://{host}"),
            websocket: format!("ws{secure}://{host}"),
        }
    }

    pub fn subscriber_link(&self, client_id: &str) -> String {
        format!("{}/client/{}", self.public, client_id)
    }

    pub fn websocket_url(&self) -> String {
        format!("{}/ws", self.websocket)
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub domain: Domain,
    pub relay: RelayConfig,
    pub shutdown_grace: Duration,
}

impl TryFrom<ServeArgs> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(args: ServeArgs) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = args
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", args.listen_addr))?;
        if args.peer_timeout_secs == 0 {
            bail!("peer timeout must be greater than zero");
        }
        if args.write_timeout_secs == 0 {
            bail!("write timeout must be greater than zero");
        }
        if args.outbound_capacity == 0 {
            bail!("outbound capacity must be greater than zero");
        }

        Ok(ServerConfig {
            listen_addr,
            domain: Domain::new(&args.domain, args.env),
            relay: RelayConfig {
                peer_timeout: Duration::from_secs(args.peer_timeout_secs),
                write_timeout: Duration::from_secs(args.write_timeout_secs),
                outbound_capacity: args.outbound_capacity,
                max_message_size: args.max_message_size,
                ..RelayConfig::default()
            },
            shutdown_grace: Duration::from_secs(args.shutdown_grace_secs),
        })
    }
}
