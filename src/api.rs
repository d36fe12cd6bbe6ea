//! Integer-handle boundary layer.
//!
//! The shape a foreign caller sees: plain functions, stable `i32` handles,
//! and two negative sentinels for failure. How the calls cross the process
//! boundary (JNI, C ABI, message passing) is up to the embedder; these
//! functions are the common trunk.

use std::sync::atomic::{AtomicU64, Ordering};

use log::error;

use crate::error::ERROR_GENERAL_FAILURE;
use crate::logging::TunnelLogger;
use crate::probe::{ProbeRequest, ProbeResponse, Prober};
use crate::registry::{
    close_net_tunnel, close_udp_forwarder, get_net_tunnel_config, open_net_tunnel,
    open_udp_forwarder, rebind_all_tunnel_sockets, set_net_tunnel_config,
};
use crate::udp_forwarder::ForwarderConfig;

static INSTANCE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn next_logger(prefix: &str) -> TunnelLogger {
    let n = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
    TunnelLogger::new(format!("{prefix}{n}"))
}

/// Create, configure and start a device over an in-memory TUN.
///
/// `local_addresses` and `dns_addresses` are comma-separated IP literals;
/// `mtu` of 0 selects the default. Returns a non-negative device handle,
/// or a negative failure code.
pub fn net_turn_on(local_addresses: &str, dns_addresses: &str, mtu: usize, settings: &str) -> i32 {
    let logger = next_logger("wgnet");
    match open_net_tunnel(local_addresses, dns_addresses, mtu, settings, logger) {
        Ok(handle) => handle,
        Err(e) => {
            error!("net_turn_on: {e}");
            e.code()
        }
    }
}

/// Close a device and forget its handle. Unknown handles are ignored.
pub fn net_turn_off(tunnel_handle: i32) {
    close_net_tunnel(tunnel_handle);
}

/// Re-apply an IPC block on a live device. Returns 0 on success, the IPC
/// errno verbatim on a parser rejection, or the general failure code.
pub fn net_set_config(tunnel_handle: i32, settings: &str) -> i64 {
    match set_net_tunnel_config(tunnel_handle, settings) {
        Ok(()) => 0,
        Err(crate::error::TunnelError::Ipc(e)) => e.errno,
        Err(e) => {
            error!("net_set_config: {e}");
            ERROR_GENERAL_FAILURE as i64
        }
    }
}

/// Current IPC serialisation of a device; `None` when the handle is dead.
pub fn net_get_config(tunnel_handle: i32) -> Option<String> {
    get_net_tunnel_config(tunnel_handle)
}

/// Start a UDP double-tunnel forwarder over a live entry device.
/// `exit_endpoint` is `ADDR:PORT` with IPv6 in bracketed form. Returns a
/// forwarder handle or a negative failure code.
pub fn net_open_connection_through_tunnel(
    entry_tunnel_handle: i32,
    listen_port: u16,
    client_port: u16,
    exit_endpoint: &str,
) -> i32 {
    let exit = match exit_endpoint.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!("net_open_connection_through_tunnel: bad endpoint {exit_endpoint:?}: {e}");
            return ERROR_GENERAL_FAILURE;
        }
    };
    let config = ForwarderConfig {
        listen_port,
        client_port,
        exit_endpoint: exit,
    };
    match open_udp_forwarder(entry_tunnel_handle, config, next_logger("udpfwd")) {
        Ok(handle) => handle,
        Err(e) => {
            error!("net_open_connection_through_tunnel: {e}");
            e.code()
        }
    }
}

/// Close a forwarder: both sockets are closed and the call returns once
/// both pumps have exited. Unknown handles are ignored.
pub fn net_close_connection_through_tunnel(forwarder_handle: i32) {
    close_udp_forwarder(forwarder_handle);
}

/// Ask every live device to rebind its endpoint socket after a network
/// change. Devices without a bind capability (no endpoint yet) no-op.
pub fn rebind_tunnel_sockets() {
    rebind_all_tunnel_sockets();
}

/// Run a gateway probe from a JSON request, returning the JSON response.
/// A malformed request yields a terminal response rather than an error.
pub fn probe_json(request_json: &str) -> String {
    let response = match serde_json::from_str::<ProbeRequest>(request_json) {
        Ok(request) => Prober::new().run(&request),
        Err(e) => ProbeResponse {
            download_error: format!("invalid probe request: {e}"),
            ..ProbeResponse::default()
        },
    };
    serde_json::to_string(&response).unwrap_or_else(|e| {
        error!("probe_json: response serialisation failed: {e}");
        "{}".to_string()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ERROR_GENERAL_FAILURE;
    use crate::ipc::{derive_public_key, encode_key_hex, generate_private_key, IPC_ERRNO_INVALID};

    fn valid_settings() -> String {
        let private_key = generate_private_key().unwrap();
        let peer_key = derive_public_key(&generate_private_key().unwrap());
        format!(
            "private_key={}\npublic_key={}\nendpoint=127.0.0.1:9\nallowed_ip=0.0.0.0/0\n",
            encode_key_hex(&private_key),
            encode_key_hex(&peer_key),
        )
    }

    #[test]
    fn turn_on_rejects_bad_addresses() {
        assert_eq!(
            net_turn_on("definitely-not-an-ip", "1.1.1.1", 0, &valid_settings()),
            ERROR_GENERAL_FAILURE
        );
    }

    #[test]
    fn device_lifecycle_through_the_boundary() {
        let handle = net_turn_on("10.99.0.2", "1.1.1.1", 0, &valid_settings());
        assert!(handle >= 0, "expected a handle, got {handle}");

        let config = net_get_config(handle).expect("config for live handle");
        assert!(config.contains("endpoint=127.0.0.1:9"));

        // Updates propagate IPC errnos verbatim.
        assert_eq!(net_set_config(handle, "private_key=zz\n"), IPC_ERRNO_INVALID);
        assert_eq!(net_set_config(handle, &valid_settings()), 0);

        net_turn_off(handle);
        assert!(net_get_config(handle).is_none());
        assert_eq!(
            net_set_config(handle, &valid_settings()),
            ERROR_GENERAL_FAILURE as i64
        );
        // Closing twice is harmless.
        net_turn_off(handle);
    }

    #[test]
    fn forwarder_rejects_bad_endpoint_and_dead_parent() {
        assert_eq!(
            net_open_connection_through_tunnel(0, 0, 1, "not-an-endpoint"),
            ERROR_GENERAL_FAILURE
        );
        assert_eq!(
            net_open_connection_through_tunnel(i32::MAX, 0, 1, "192.0.2.1:51820"),
            ERROR_GENERAL_FAILURE
        );
        // Unknown forwarder handles are ignored.
        net_close_connection_through_tunnel(i32::MAX);
    }

    #[test]
    fn probe_json_survives_malformed_requests() {
        let out = probe_json("{not json");
        let response: crate::probe::ProbeResponse = serde_json::from_str(&out).unwrap();
        assert!(!response.can_handshake);
        assert!(response.download_error.contains("invalid probe request"));
    }

    #[test]
    fn rebind_with_no_devices_is_a_no_op() {
        rebind_tunnel_sockets();
    }
}
