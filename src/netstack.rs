//! User-mode IP stack view over the in-memory TUN endpoint.
//!
//! Wraps a smoltcp `Interface` plus its socket set and a DNS socket pointed
//! at the tunnel's resolvers. The stack is driven under the owning device's
//! lock: `poll` advances the interface, `drain_outbound` hands the produced
//! IP frames to the device for encapsulation.

use std::net::IpAddr;

use rand::Rng;
use smoltcp::iface::{Config, Context, Interface, SocketHandle, SocketSet};
use smoltcp::socket::dns::{self, GetQueryResultError, QueryHandle};
use smoltcp::socket::{tcp, AnySocket};
use smoltcp::time::Instant;
use smoltcp::wire::{
    DnsQueryType, HardwareAddress, IpAddress, IpCidr, IpEndpoint, IpListenEndpoint, Ipv4Address,
    Ipv6Address,
};

use crate::error::TunnelError;
use crate::tun::NetTun;

pub struct Netstack {
    tun: NetTun,
    iface: Interface,
    sockets: SocketSet<'static>,
    dns_handle: SocketHandle,
    local_addrs: Vec<IpAddr>,
}

impl Netstack {
    /// Build a stack bound to `local_addrs` with `dns_servers` as the
    /// tunnel resolvers.
    pub fn new(
        local_addrs: &[IpAddr],
        dns_servers: &[IpAddr],
        mtu: usize,
    ) -> Result<Self, TunnelError> {
        if local_addrs.is_empty() {
            return Err(TunnelError::Config("no local addresses".into()));
        }

        let mut tun = NetTun::new(mtu);
        let mut iface = Interface::new(Config::new(HardwareAddress::Ip), &mut tun, Instant::now());

        // Prefix 0 keeps every destination on-link, so no routes are needed;
        // the tunnel peer's allowed_ips decide what actually flows.
        iface.update_ip_addrs(|addrs| {
            for addr in local_addrs {
                if addrs.push(IpCidr::new(to_ip_address(*addr), 0)).is_err() {
                    log::warn!("netstack: address capacity exceeded, skipping {addr}");
                }
            }
        });

        let mut sockets = SocketSet::new(vec![]);

        // The DNS socket holds one primary resolver; multi-server failover
        // is not part of this stack.
        let primary: Vec<IpAddress> =
            dns_servers.iter().take(1).map(|a| to_ip_address(*a)).collect();
        let dns_socket = dns::Socket::new(&primary, vec![]);
        let dns_handle = sockets.add(dns_socket);

        Ok(Netstack {
            tun,
            iface,
            sockets,
            dns_handle,
            local_addrs: local_addrs.to_vec(),
        })
    }

    pub fn local_addrs(&self) -> &[IpAddr] {
        &self.local_addrs
    }

    /// Queue a decapsulated IP packet for processing on the next poll.
    pub fn push_inbound(&mut self, packet: Vec<u8>) {
        self.tun.push_inbound(packet);
    }

    /// Advance the interface; returns whether any socket made progress.
    pub fn poll(&mut self, now: Instant) -> bool {
        self.iface.poll(now, &mut self.tun, &mut self.sockets)
    }

    /// IP frames produced by the stack since the last drain.
    pub fn drain_outbound(&mut self) -> Vec<Vec<u8>> {
        self.tun.drain_outbound()
    }

    pub fn poll_delay(&mut self, now: Instant) -> Option<std::time::Duration> {
        self.iface
            .poll_delay(now, &self.sockets)
            .map(|d| std::time::Duration::from_micros(d.total_micros()))
    }

    pub fn add_socket<T: AnySocket<'static>>(&mut self, socket: T) -> SocketHandle {
        self.sockets.add(socket)
    }

    pub fn get_socket<T: AnySocket<'static>>(&mut self, handle: SocketHandle) -> &mut T {
        self.sockets.get_mut::<T>(handle)
    }

    pub fn remove_socket(&mut self, handle: SocketHandle) {
        self.sockets.remove(handle);
    }

    pub fn context(&mut self) -> &mut Context {
        self.iface.context()
    }

    /// Initiate a TCP connection on an already-added socket. Lives here so
    /// the interface context and the socket can be borrowed together.
    pub fn tcp_connect(
        &mut self,
        handle: SocketHandle,
        remote: IpEndpoint,
        local_port: u16,
    ) -> Result<(), TunnelError> {
        let Netstack { iface, sockets, .. } = self;
        let socket = sockets.get_mut::<tcp::Socket>(handle);
        socket
            .connect(iface.context(), remote, IpListenEndpoint::from(local_port))
            .map_err(|e| TunnelError::Config(format!("tcp connect error: {e:?}")))
    }

    /// Kick off an A/AAAA lookup on the stack resolver.
    pub fn start_dns_query(
        &mut self,
        name: &str,
        query_type: DnsQueryType,
    ) -> Result<QueryHandle, TunnelError> {
        let Netstack {
            iface, sockets, dns_handle, ..
        } = self;
        let socket = sockets.get_mut::<dns::Socket>(*dns_handle);
        socket
            .start_query(iface.context(), name, query_type)
            .map_err(|e| TunnelError::Config(format!("dns query for {name:?} failed: {e:?}")))
    }

    /// Poll a previously started lookup. `Ok(None)` means still pending.
    pub fn dns_query_result(
        &mut self,
        query: QueryHandle,
    ) -> Result<Option<Vec<IpAddr>>, TunnelError> {
        let socket = self.sockets.get_mut::<dns::Socket>(self.dns_handle);
        match socket.get_query_result(query) {
            Ok(addrs) => Ok(Some(addrs.iter().map(|a| from_ip_address(*a)).collect())),
            Err(GetQueryResultError::Pending) => Ok(None),
            Err(GetQueryResultError::Failed) => {
                Err(TunnelError::Config("dns query failed".into()))
            }
        }
    }

    pub fn cancel_dns_query(&mut self, query: QueryHandle) {
        let socket = self.sockets.get_mut::<dns::Socket>(self.dns_handle);
        socket.cancel_query(query);
    }
}

pub fn to_ip_address(addr: IpAddr) -> IpAddress {
    match addr {
        IpAddr::V4(v4) => IpAddress::Ipv4(Ipv4Address::from(v4)),
        IpAddr::V6(v6) => IpAddress::Ipv6(Ipv6Address::from(v6)),
    }
}

pub fn from_ip_address(addr: IpAddress) -> IpAddr {
    match addr {
        IpAddress::Ipv4(v4) => IpAddr::V4(v4.into()),
        IpAddress::Ipv6(v6) => IpAddr::V6(v6.into()),
    }
}

/// Random port from the dynamic range for stack-side sockets.
pub fn random_ephemeral_port() -> u16 {
    rand::thread_rng().gen_range(49152..65535)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn rejects_empty_address_list() {
        assert!(Netstack::new(&[], &[], 1280).is_err());
    }

    #[test]
    fn builds_dual_stack_view() {
        let locals = [
            IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)),
            IpAddr::V6("fd00::2".parse().unwrap()),
        ];
        let dns = [IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1))];
        let mut stack = Netstack::new(&locals, &dns, 1280).unwrap();
        assert_eq!(stack.local_addrs().len(), 2);
        // A fresh stack has nothing to send.
        stack.poll(Instant::now());
        assert!(stack.drain_outbound().is_empty());
    }

    #[test]
    fn ephemeral_ports_stay_in_dynamic_range() {
        for _ in 0..64 {
            let port = random_ephemeral_port();
            assert!((49152..65535).contains(&port));
        }
    }
}
