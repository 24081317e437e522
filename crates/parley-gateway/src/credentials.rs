//! Relay credentials derived from a caller's access token.
//!
//! Nothing here is stored. The TURN username is the configured prefix followed
//! by the token and the credential is the token itself, so the relay can
//! rebuild the long-term key from the username alone and re-check the token on
//! every allocation.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use anyhow::Context;
use parley_common::{CallConfigResponse, Error, IceServerConfig, Result};
use tracing::debug;

pub const DEFAULT_REALM: &str = "parley";
pub const DEFAULT_USERNAME_PREFIX: &str = "parley:";
pub const DEFAULT_TURN_PORT: u16 = 3478;

/// Environment override for the advertised relay address.
pub const RELAY_IP_ENV: &str = "PARLEY_TURN_RELAY_IP";

/// RFC 5389 long-term credential key, `MD5(username ":" realm ":" password)`.
///
/// The relay's auth handler returns exactly this for a valid token.
pub fn derive_auth_key(username: &str, realm: &str, token: &str) -> Vec<u8> {
    turn::auth::generate_auth_key(username, realm, token)
}

#[derive(Debug, Clone)]
pub struct CredentialIssuer {
    realm: String,
    username_prefix: String,
    relay_address: Option<IpAddr>,
    port: u16,
}

impl CredentialIssuer {
    pub fn new(
        realm: impl Into<String>,
        username_prefix: impl Into<String>,
        relay_address: Option<IpAddr>,
        port: u16,
    ) -> Self {
        Self {
            realm: realm.into(),
            username_prefix: username_prefix.into(),
            relay_address,
            port,
        }
    }

    pub fn realm(&self) -> &str {
        &self.realm
    }

    pub fn username_prefix(&self) -> &str {
        &self.username_prefix
    }

    pub fn username_for(&self, token: &str) -> String {
        format!("{}{}", self.username_prefix, token)
    }

    /// Builds the ICE server list for `access_token`.
    ///
    /// `request_host` is the HTTP `Host` header, used only when the issuer was
    /// built without a relay address.
    pub fn issue(
        &self,
        access_token: Option<&str>,
        request_host: Option<&str>,
    ) -> Result<CallConfigResponse> {
        let token = access_token
            .map(str::trim)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| Error::unauthenticated("access token required"))?;

        let host = match self.relay_address {
            Some(ip) => ip.to_string(),
            None => host_from_header(request_host),
        };
        let url_host = format_url_host(&host);
        let username = self.username_for(token);

        Ok(CallConfigResponse {
            ice_servers: vec![
                IceServerConfig {
                    urls: vec![format!("stun:{}:{}", url_host, self.port)],
                    username: None,
                    credential: None,
                },
                IceServerConfig {
                    urls: vec![
                        format!("turn:{}:{}?transport=udp", url_host, self.port),
                        format!("turn:{}:{}?transport=tcp", url_host, self.port),
                    ],
                    username: Some(username.clone()),
                    credential: Some(token.to_string()),
                },
            ],
            username,
            credential: token.to_string(),
            username_prefix: self.username_prefix.clone(),
            realm: self.realm.clone(),
            relay_address: host,
            port: self.port,
        })
    }
}

/// Picks the address the relay advertises and allocates on.
///
/// Order: explicit configuration, then the `PARLEY_TURN_RELAY_IP` override,
/// then the first non-loopback interface (IPv4 first), then loopback.
pub fn resolve_relay_ip(configured: Option<IpAddr>) -> anyhow::Result<IpAddr> {
    if let Some(ip) = configured {
        return Ok(ip);
    }

    if let Ok(raw) = std::env::var(RELAY_IP_ENV) {
        let raw = raw.trim();
        if !raw.is_empty() {
            return raw
                .parse::<IpAddr>()
                .with_context(|| format!("{RELAY_IP_ENV} is not a valid IP address: {raw}"));
        }
    }

    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(list) => list.into_iter().map(|(_, ip)| ip).collect(),
        Err(err) => {
            debug!("interface enumeration failed: {}", err);
            Vec::new()
        }
    };

    Ok(pick_interface_address(interfaces).unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST)))
}

fn pick_interface_address(addrs: impl IntoIterator<Item = IpAddr>) -> Option<IpAddr> {
    let mut first_v6 = None;
    for ip in addrs {
        if ip.is_loopback() || ip.is_unspecified() {
            continue;
        }
        match ip {
            IpAddr::V4(_) => return Some(ip),
            IpAddr::V6(v6) => {
                // link-local addresses need a zone id to be usable in URLs
                if (v6.segments()[0] & 0xffc0) == 0xfe80 {
                    continue;
                }
                first_v6.get_or_insert(ip);
            }
        }
    }
    first_v6
}

/// Host part of an HTTP `Host` header, without the port.
pub fn host_from_header(host: Option<&str>) -> String {
    let host = host.map(str::trim).unwrap_or_default();
    if host.is_empty() {
        return Ipv4Addr::LOCALHOST.to_string();
    }
    if let Some(rest) = host.strip_prefix('[') {
        if let Some((inner, _)) = rest.split_once(']') {
            return inner.to_string();
        }
    }
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return addr.ip().to_string();
    }
    if host.parse::<IpAddr>().is_ok() {
        return host.to_string();
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name.to_string(),
        _ => host.to_string(),
    }
}

/// Port advertised to clients; zero (ephemeral) falls back to 3478.
pub fn port_from_listen_address(listen: SocketAddr) -> u16 {
    match listen.port() {
        0 => DEFAULT_TURN_PORT,
        port => port,
    }
}

fn format_url_host(host: &str) -> String {
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V6(_)) => format!("[{host}]"),
        _ => host.to_string(),
    }
}
