//! IPC text configuration: the line-oriented `key=value` grammar used to
//! configure a device, plus WireGuard key material utilities.
//!
//! The grammar follows the WireGuard cross-platform UAPI convention: keys
//! are hex-encoded 32-byte values, one `key=value` pair per `\n`-terminated
//! line. Recognised keys are parsed; anything else is retained verbatim and
//! re-emitted on query, so protocol extensions (obfuscation parameters and
//! the like) pass through untouched.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use ipnet::IpNet;
use thiserror::Error;

// UAPI errno convention: negative errno values, propagated verbatim on
// configuration updates.
pub const IPC_ERRNO_INVALID: i64 = -22; // -EINVAL
pub const IPC_ERRNO_PROTOCOL: i64 = -71; // -EPROTO
pub const IPC_ERRNO_UNKNOWN: i64 = -55;

/// Rejection from the IPC parser, carrying its UAPI errno.
#[derive(Debug, Error)]
#[error("ipc error {errno}: {message}")]
pub struct IpcError {
    pub errno: i64,
    pub message: String,
}

impl IpcError {
    pub fn invalid(message: impl Into<String>) -> Self {
        IpcError {
            errno: IPC_ERRNO_INVALID,
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        IpcError {
            errno: IPC_ERRNO_PROTOCOL,
            message: message.into(),
        }
    }
}

// ── Key material ────────────────────────────────────────────────────────────

pub fn decode_key_hex(value: &str) -> Result<[u8; 32], IpcError> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| IpcError::invalid(format!("invalid hex key: {e}")))?;
    bytes
        .try_into()
        .map_err(|_| IpcError::invalid("key must be 32 bytes"))
}

pub fn encode_key_hex(key: &[u8; 32]) -> String {
    hex::encode(key)
}

/// Base64 form, as shown by the standard tooling. Used for short peer ids
/// in log output.
pub fn encode_key_base64(key: &[u8; 32]) -> String {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    STANDARD.encode(key)
}

/// Abbreviated peer identity for logs: `(AbCd…WxYz)`.
pub fn short_key_id(key: &[u8; 32]) -> String {
    let b64 = encode_key_base64(key);
    format!("({}…{})", &b64[..4], &b64[b64.len() - 4..])
}

/// Generate a fresh X25519 private key with RFC 7748 clamping applied.
pub fn generate_private_key() -> std::io::Result<[u8; 32]> {
    use ring::rand::{SecureRandom, SystemRandom};

    let rng = SystemRandom::new();
    let mut key = [0u8; 32];
    rng.fill(&mut key).map_err(|_| {
        std::io::Error::new(std::io::ErrorKind::Other, "failed to generate random key")
    })?;

    key[0] &= 248;
    key[31] &= 127;
    key[31] |= 64;

    Ok(key)
}

/// Derive the public key for a private key.
pub fn derive_public_key(private_key: &[u8; 32]) -> [u8; 32] {
    use boringtun::x25519::{PublicKey, StaticSecret};

    let secret = StaticSecret::from(*private_key);
    *PublicKey::from(&secret).as_bytes()
}

// ── Configuration model ─────────────────────────────────────────────────────

/// The single peer a device talks to.
#[derive(Clone, Debug)]
pub struct PeerConfig {
    pub public_key: [u8; 32],
    pub preshared_key: Option<[u8; 32]>,
    pub endpoint: Option<SocketAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub keepalive: Option<u16>,
}

impl PeerConfig {
    fn new(public_key: [u8; 32]) -> Self {
        PeerConfig {
            public_key,
            preshared_key: None,
            endpoint: None,
            allowed_ips: Vec::new(),
            keepalive: None,
        }
    }

    pub fn short_id(&self) -> String {
        short_key_id(&self.public_key)
    }
}

/// Parsed device configuration. `extra` holds unrecognised lines verbatim,
/// in arrival order.
#[derive(Clone, Debug, Default)]
pub struct DeviceConfig {
    pub private_key: Option<[u8; 32]>,
    pub listen_port: Option<u16>,
    pub peer: Option<PeerConfig>,
    pub extra: Vec<(String, String)>,
}

impl DeviceConfig {
    /// Parse an IPC "set" block.
    pub fn parse(text: &str) -> Result<DeviceConfig, IpcError> {
        let mut config = DeviceConfig::default();

        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| IpcError::protocol(format!("malformed line: {line:?}")))?;

            match key {
                "private_key" => config.private_key = Some(decode_key_hex(value)?),
                "listen_port" => {
                    let port: u16 = value
                        .parse()
                        .map_err(|_| IpcError::invalid(format!("bad listen_port: {value:?}")))?;
                    config.listen_port = Some(port);
                }
                "replace_peers" => {
                    // Single-peer device: wipe whatever was accumulated.
                    config.peer = None;
                }
                "public_key" => {
                    config.peer = Some(PeerConfig::new(decode_key_hex(value)?));
                }
                "preshared_key" => {
                    let peer = config.peer_mut(key)?;
                    peer.preshared_key = Some(decode_key_hex(value)?);
                }
                "endpoint" => {
                    let peer = config.peer_mut(key)?;
                    peer.endpoint = Some(resolve_endpoint(value)?);
                }
                "allowed_ip" => {
                    let net: IpNet = value
                        .parse()
                        .map_err(|_| IpcError::invalid(format!("bad allowed_ip: {value:?}")))?;
                    config.peer_mut(key)?.allowed_ips.push(net);
                }
                "persistent_keepalive_interval" => {
                    let secs: u16 = value
                        .parse()
                        .map_err(|_| IpcError::invalid(format!("bad keepalive: {value:?}")))?;
                    config.peer_mut(key)?.keepalive = Some(secs);
                }
                // Pass-through escape hatch: keep the line, re-emit on get.
                _ => config.extra.push((key.to_string(), value.to_string())),
            }
        }

        Ok(config)
    }

    fn peer_mut(&mut self, key: &str) -> Result<&mut PeerConfig, IpcError> {
        self.peer
            .as_mut()
            .ok_or_else(|| IpcError::invalid(format!("{key} before public_key")))
    }

    /// Fold an update into the current configuration. Present fields
    /// overwrite; a new `public_key` replaces the peer wholesale.
    pub fn merge(&mut self, update: DeviceConfig) {
        if update.private_key.is_some() {
            self.private_key = update.private_key;
        }
        if update.listen_port.is_some() {
            self.listen_port = update.listen_port;
        }
        if update.peer.is_some() {
            self.peer = update.peer;
        }
        if !update.extra.is_empty() {
            self.extra = update.extra;
        }
    }

    /// Serialise in UAPI "get" shape. Runtime counters come from the live
    /// tunnel session.
    pub fn serialize(&self, stats: Option<&TunnStats>) -> String {
        let mut out = String::new();
        if let Some(key) = &self.private_key {
            out.push_str(&format!("private_key={}\n", encode_key_hex(key)));
        }
        if let Some(port) = self.listen_port {
            out.push_str(&format!("listen_port={port}\n"));
        }
        for (key, value) in &self.extra {
            out.push_str(&format!("{key}={value}\n"));
        }
        if let Some(peer) = &self.peer {
            out.push_str(&format!("public_key={}\n", encode_key_hex(&peer.public_key)));
            if let Some(psk) = &peer.preshared_key {
                out.push_str(&format!("preshared_key={}\n", encode_key_hex(psk)));
            }
            if let Some(endpoint) = peer.endpoint {
                out.push_str(&format!("endpoint={endpoint}\n"));
            }
            for net in &peer.allowed_ips {
                out.push_str(&format!("allowed_ip={net}\n"));
            }
            if let Some(secs) = peer.keepalive {
                out.push_str(&format!("persistent_keepalive_interval={secs}\n"));
            }
            if let Some(stats) = stats {
                if let Some(since) = stats.last_handshake {
                    if let Ok(at) = std::time::SystemTime::now()
                        .checked_sub(since)
                        .unwrap_or(std::time::UNIX_EPOCH)
                        .duration_since(std::time::UNIX_EPOCH)
                    {
                        out.push_str(&format!("last_handshake_time_sec={}\n", at.as_secs()));
                        out.push_str(&format!("last_handshake_time_nsec={}\n", at.subsec_nanos()));
                    }
                }
                out.push_str(&format!("rx_bytes={}\n", stats.rx_bytes));
                out.push_str(&format!("tx_bytes={}\n", stats.tx_bytes));
            }
        }
        out.push_str("protocol_version=1\n");
        out
    }
}

/// Runtime counters surfaced by `ipc_get`.
#[derive(Clone, Copy, Debug, Default)]
pub struct TunnStats {
    pub last_handshake: Option<Duration>,
    pub tx_bytes: usize,
    pub rx_bytes: usize,
}

/// Parse `host:port`, resolving hostnames through the system resolver (the
/// entry endpoint is reached over the real network, not the tunnel). IPv6
/// addresses use the bracketed form.
fn resolve_endpoint(value: &str) -> Result<SocketAddr, IpcError> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .to_socket_addrs()
        .map_err(|e| IpcError::invalid(format!("bad endpoint {value:?}: {e}")))?
        .next()
        .ok_or_else(|| IpcError::invalid(format!("endpoint {value:?} resolved to nothing")))
}
