use std::net::{IpAddr, SocketAddr};

use clap::{Args, Parser};

use crate::credentials::{DEFAULT_REALM, DEFAULT_TURN_PORT, DEFAULT_USERNAME_PREFIX};

#[derive(Parser, Debug, Clone)]
#[command(name = "parley-gateway")]
#[command(about = "Call lifecycle API, signaling coordinator and STUN/TURN relay")]
pub struct GatewayConfig {
    /// HTTP listen address
    #[arg(long, env = "PARLEY_BIND_ADDR", default_value = "127.0.0.1:8080")]
    pub bind: SocketAddr,

    /// SQLite database URL
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite:parley.db")]
    pub database_url: String,

    /// Origins allowed by CORS (comma separated; empty allows any)
    #[arg(long, env = "PARLEY_ALLOWED_ORIGINS", value_delimiter = ',')]
    pub allowed_origins: Vec<String>,

    #[command(flatten)]
    pub relay: RelayConfig,
}

#[derive(Args, Debug, Clone)]
pub struct RelayConfig {
    /// UDP and TCP listen address of the STUN/TURN relay
    #[arg(long = "turn-listen", env = "PARLEY_TURN_LISTEN", default_value_t = default_turn_listen())]
    pub listen: SocketAddr,

    #[arg(long = "turn-realm", env = "PARLEY_TURN_REALM", default_value = DEFAULT_REALM)]
    pub realm: String,

    #[arg(
        long = "turn-username-prefix",
        env = "PARLEY_TURN_USERNAME_PREFIX",
        default_value = DEFAULT_USERNAME_PREFIX
    )]
    pub username_prefix: String,

    /// Public address advertised to clients and used for relayed allocations
    #[arg(long = "relay-address", env = "PARLEY_RELAY_ADDRESS")]
    pub relay_address: Option<IpAddr>,

    /// Relay authentication attempts allowed per source IP per minute
    #[arg(long = "relay-auth-rate-limit", env = "PARLEY_RELAY_AUTH_RATE_LIMIT", default_value_t = 60)]
    pub auth_rate_limit: u32,
}

fn default_turn_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], DEFAULT_TURN_PORT))
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_turn_listen(),
            realm: DEFAULT_REALM.to_string(),
            username_prefix: DEFAULT_USERNAME_PREFIX.to_string(),
            relay_address: None,
            auth_rate_limit: 60,
        }
    }
}
