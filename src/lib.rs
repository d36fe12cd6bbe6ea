//! Userspace WireGuard data-plane.
//!
//! Runs WireGuard tunnels entirely in application memory: no kernel TUN
//! device, no routing-table changes, no privileges. On top of the tunnel
//! and its user-mode IP stack sit two facilities:
//!
//! - a UDP double-tunnel forwarder that relays a client's WireGuard
//!   packets from a loopback port to an exit endpoint through the entry
//!   tunnel (WireGuard-inside-WireGuard), and
//! - a gateway reachability probe that brings a tunnel up, pings a set of
//!   targets through it, measures one bulk download, and reports the
//!   results as a structured record.
//!
//! Long-lived resources (devices, forwarders) are owned through stable
//! 32-bit handles in process-wide tables, so a non-native embedder can
//! hold sessions across calls; `api` is that boundary.

pub mod api;
pub mod device;
pub mod download;
pub mod error;
pub mod handle_table;
pub mod ipc;
pub mod logging;
pub mod netstack;
pub mod ping;
pub mod probe;
pub mod registry;
pub mod sockets;
pub mod tun;
pub mod udp_forwarder;

pub use api::{
    net_close_connection_through_tunnel, net_get_config, net_open_connection_through_tunnel,
    net_set_config, net_turn_off, net_turn_on, probe_json, rebind_tunnel_sockets,
};
pub use device::NetTunnel;
pub use error::{TunnelError, ERROR_GENERAL_FAILURE, ERROR_INTERMITTENT_FAILURE};
pub use probe::{ProbeRequest, ProbeResponse, Prober};
pub use sockets::IpVersion;
pub use udp_forwarder::{ForwarderConfig, UdpForwarder};
