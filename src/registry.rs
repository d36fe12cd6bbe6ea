//! Process-wide session registry and device bootstrap.
//!
//! Devices and forwarders live behind stable integer handles in two global
//! tables, initialised on first use and released only at process exit. The
//! bootstrap sequence mirrors the device lifecycle: parse addresses, build
//! the TUN-backed device, apply the IPC block, bring it up, register it.

use std::net::IpAddr;
use std::sync::Arc;

use once_cell::sync::Lazy;

use crate::device::NetTunnel;
use crate::error::TunnelError;
use crate::handle_table::HandleTable;
use crate::logging::TunnelLogger;
use crate::udp_forwarder::{ForwarderConfig, UdpForwarder};

/// Default tunnel MTU when the caller does not specify one.
pub const DEFAULT_MTU: usize = 1280;

/// A registered device: the WireGuard tunnel (which owns the stack view)
/// and the logger it was created with.
pub struct DeviceSession {
    pub tunnel: Arc<NetTunnel>,
    pub logger: TunnelLogger,
}

pub static DEVICES: Lazy<HandleTable<Arc<DeviceSession>>> = Lazy::new(HandleTable::new);
pub static FORWARDERS: Lazy<HandleTable<Arc<UdpForwarder>>> = Lazy::new(HandleTable::new);

/// Split a comma-separated address list, trimming each element.
pub fn parse_ip_list(input: &str) -> Result<Vec<IpAddr>, TunnelError> {
    input
        .split(',')
        .map(|element| {
            element
                .trim()
                .parse::<IpAddr>()
                .map_err(|e| TunnelError::Config(format!("bad address {element:?}: {e}")))
        })
        .collect()
}

/// Bootstrap a device: parse the address lists, build the in-memory TUN
/// and device, apply the IPC block, bring the device up and register it.
/// Returns the new device handle.
///
/// Any failure after the device exists closes it before returning.
pub fn open_net_tunnel(
    local_addrs: &str,
    dns_addrs: &str,
    mtu: usize,
    settings: &str,
    logger: TunnelLogger,
) -> Result<i32, TunnelError> {
    let tun_addrs = parse_ip_list(local_addrs)?;
    let dns = parse_ip_list(dns_addrs)?;
    let mtu = if mtu == 0 { DEFAULT_MTU } else { mtu };

    let tunnel = NetTunnel::new(&tun_addrs, &dns, mtu, logger.clone())?;

    if let Err(e) = tunnel.ipc_set(settings) {
        tunnel.close();
        return Err(e);
    }
    tunnel.disable_roaming();
    if let Err(e) = tunnel.up() {
        tunnel.close();
        return Err(e);
    }

    let session = Arc::new(DeviceSession {
        tunnel: Arc::new(tunnel),
        logger,
    });
    let keepalive = session.clone();
    DEVICES.insert(session).map_err(|_| {
        keepalive.tunnel.close();
        TunnelError::TableFull
    })
}

/// Re-apply an IPC block on a live device.
pub fn set_net_tunnel_config(handle: i32, settings: &str) -> Result<(), TunnelError> {
    let session = DEVICES
        .get(handle)
        .ok_or_else(|| TunnelError::Config(format!("unknown device handle {handle}")))?;
    session.tunnel.ipc_set(settings)?;
    session.tunnel.disable_roaming();
    Ok(())
}

/// Current IPC serialisation of a device, or `None` on a dead handle.
pub fn get_net_tunnel_config(handle: i32) -> Option<String> {
    DEVICES.get(handle).map(|session| session.tunnel.ipc_get())
}

/// Remove and close a device. Forwarders over it must already be closed.
pub fn close_net_tunnel(handle: i32) {
    if let Some(session) = DEVICES.remove(handle) {
        session.tunnel.close();
    }
}

/// Create a forwarder over a live entry device. A dead parent handle is
/// rejected: the forwarder borrows the device's stack and must not outlive
/// it.
pub fn open_udp_forwarder(
    entry_handle: i32,
    config: ForwarderConfig,
    logger: TunnelLogger,
) -> Result<i32, TunnelError> {
    let session = DEVICES
        .get(entry_handle)
        .ok_or_else(|| TunnelError::Config(format!("unknown device handle {entry_handle}")))?;

    let forwarder = UdpForwarder::new(config, session.tunnel.clone(), logger)?;
    let keepalive = forwarder.clone();
    FORWARDERS.insert(forwarder).map_err(|_| {
        keepalive.close();
        TunnelError::TableFull
    })
}

/// Remove a forwarder, close both of its legs, and wait for the pumps.
pub fn close_udp_forwarder(handle: i32) {
    if let Some(forwarder) = FORWARDERS.remove(handle) {
        forwarder.close();
    }
}

/// Ask every live device to rebind its endpoint socket (after a network
/// change). Devices without an endpoint skip the call.
pub fn rebind_all_tunnel_sockets() {
    DEVICES.for_each(|handle, session| {
        if let Err(e) = session.tunnel.rebind_endpoint() {
            session
                .logger
                .error(format!("rebind of device {handle} failed: {e}"));
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_comma_separated_addresses_with_whitespace() {
        let addrs = parse_ip_list("10.0.0.2, fd00::2 ,1.1.1.1").unwrap();
        assert_eq!(addrs.len(), 3);
        assert!(addrs[0].is_ipv4());
        assert!(addrs[1].is_ipv6());
    }

    #[test]
    fn rejects_bad_address_early() {
        assert!(parse_ip_list("10.0.0.2,example.com").is_err());
        assert!(parse_ip_list("").is_err());
    }

    #[test]
    fn bootstrap_failure_reports_config_error() {
        let err = open_net_tunnel(
            "not-an-ip",
            "1.1.1.1",
            0,
            "",
            TunnelLogger::new("bootstrap-bad"),
        )
        .unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
    }

    #[test]
    fn bootstrap_without_keys_fails() {
        // Parses fine but cannot come up: no key material.
        let err = open_net_tunnel(
            "10.0.0.2",
            "1.1.1.1",
            0,
            "",
            TunnelLogger::new("bootstrap-nokeys"),
        )
        .unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
    }

    #[test]
    fn forwarder_requires_live_parent() {
        let config = ForwarderConfig {
            listen_port: 0,
            client_port: 1,
            exit_endpoint: "127.0.0.1:51820".parse().unwrap(),
        };
        let err =
            open_udp_forwarder(i32::MAX, config, TunnelLogger::new("orphan")).unwrap_err();
        assert!(matches!(err, TunnelError::Config(_)));
    }
}
