//! UDP double-tunnel forwarder.
//!
//! Accepts raw WireGuard datagrams from a client on a loopback port and
//! ferries them to an exit endpoint through the entry tunnel, relaying
//! replies back. The client speaks WireGuard to the exit peer without the
//! process needing any OS privileges: a tunnel inside a tunnel.
//!
//! Two pumps run per forwarder. The inbound pump moves loopback datagrams
//! into the tunnel, the outbound pump moves tunnel datagrams back to the
//! client. Both filter on the expected sender and neither aborts the other
//! on a per-packet failure.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::device::{NetTunnel, MAX_UDP_PACKET_SIZE};
use crate::error::TunnelError;
use crate::logging::TunnelLogger;
use crate::sockets::UdpConn;

/// Write deadline on either leg.
const UDP_WRITE_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval for the loopback listener; bounds shutdown latency, since
/// a std UDP socket cannot be closed out from under a blocked read.
const LISTENER_POLL_TIMEOUT: Duration = Duration::from_millis(500);

#[derive(Clone, Copy, Debug)]
pub struct ForwarderConfig {
    /// Loopback port accepting inbound WireGuard traffic.
    pub listen_port: u16,
    /// Loopback port the client sends from. Anything else is dropped.
    pub client_port: u16,
    /// Exit endpoint reached over the entry tunnel.
    pub exit_endpoint: SocketAddr,
}

/// Completion latch counting the two pumps, in the role of Go's WaitGroup.
struct PumpLatch {
    live: Mutex<usize>,
    cond: Condvar,
}

impl PumpLatch {
    fn new(count: usize) -> Self {
        PumpLatch {
            live: Mutex::new(count),
            cond: Condvar::new(),
        }
    }

    fn done(&self) {
        let mut live = self.live.lock();
        *live -= 1;
        if *live == 0 {
            self.cond.notify_all();
        }
    }

    fn wait(&self) {
        let mut live = self.live.lock();
        while *live > 0 {
            self.cond.wait(&mut live);
        }
    }
}

pub struct UdpForwarder {
    logger: TunnelLogger,
    /// Keeps the entry device alive for as long as this forwarder exists.
    /// Callers still close forwarders before their parent device.
    _tunnel: Arc<NetTunnel>,
    /// Loopback listener; the client's side of the forwarder.
    listener: Arc<UdpSocket>,
    /// Outbound leg over the entry tunnel.
    outbound: UdpConn,
    client_addr: SocketAddr,
    exit_endpoint: SocketAddr,
    running: AtomicBool,
    latch: PumpLatch,
}

/// Loopback address in the exit endpoint's family: the client must speak
/// the same family as the exit.
fn loopback_for(exit: &SocketAddr) -> IpAddr {
    match exit {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::LOCALHOST),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::LOCALHOST),
    }
}

/// Inbound anti-spoof filter: loopback sender on the configured client
/// port, nothing else.
fn is_expected_client(sender: &SocketAddr, client_port: u16) -> bool {
    sender.ip().is_loopback() && sender.port() == client_port
}

impl UdpForwarder {
    /// Bind the loopback listener, dial the exit endpoint through the
    /// entry tunnel, and start both pumps.
    pub fn new(
        config: ForwarderConfig,
        tunnel: Arc<NetTunnel>,
        logger: TunnelLogger,
    ) -> Result<Arc<Self>, TunnelError> {
        let loopback = loopback_for(&config.exit_endpoint);
        let listen_addr = SocketAddr::new(loopback, config.listen_port);
        let client_addr = SocketAddr::new(loopback, config.client_port);

        let listener = UdpSocket::bind(listen_addr)?;
        listener.set_read_timeout(Some(LISTENER_POLL_TIMEOUT))?;

        let outbound = tunnel.dial_udp(config.exit_endpoint)?;

        let forwarder = Arc::new(UdpForwarder {
            logger,
            _tunnel: tunnel,
            listener: Arc::new(listener),
            outbound,
            client_addr,
            exit_endpoint: config.exit_endpoint,
            running: AtomicBool::new(true),
            latch: PumpLatch::new(2),
        });

        let inbound = forwarder.clone();
        thread::Builder::new()
            .name("udpfwd-in".into())
            .spawn(move || inbound.inbound_pump())?;

        let outbound = forwarder.clone();
        thread::Builder::new()
            .name("udpfwd-out".into())
            .spawn(move || outbound.outbound_pump())?;

        Ok(forwarder)
    }

    /// Loopback -> tunnel.
    fn inbound_pump(&self) {
        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
        self.logger.verbose(format!(
            "inbound: listening on {}",
            self.listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".into())
        ));

        while self.running.load(Ordering::Acquire) {
            let (n, sender) = match self.listener.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e)
                    if matches!(
                        e.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    if self.running.load(Ordering::Acquire) {
                        self.logger.error(format!("inbound: {e}"));
                    }
                    break;
                }
            };
            self.logger
                .verbose(format!("inbound: received {n} bytes <- {sender}"));

            if !is_expected_client(&sender, self.client_addr.port()) {
                self.logger.verbose(format!(
                    "inbound: drop packet from unknown sender: {sender}, expected: {}",
                    self.client_addr
                ));
                continue;
            }

            let deadline = Instant::now() + UDP_WRITE_TIMEOUT;
            match self.outbound.send(&buf[..n], Some(deadline)) {
                Ok(written) => self.logger.verbose(format!(
                    "inbound: sent {written} bytes -> {}",
                    self.exit_endpoint
                )),
                Err(e) => self.logger.error(format!("inbound: {e}")),
            }
        }

        self.logger.verbose("inbound: closed");
        self.latch.done();
    }

    /// Tunnel -> loopback.
    fn outbound_pump(&self) {
        let mut buf = vec![0u8; MAX_UDP_PACKET_SIZE];
        self.logger
            .verbose(format!("outbound: dial {}", self.exit_endpoint));

        loop {
            let (n, sender) = match self.outbound.recv_from(&mut buf, None) {
                Ok(received) => received,
                Err(e) => {
                    if self.running.load(Ordering::Acquire) {
                        self.logger.error(format!("outbound: {e}"));
                    }
                    break;
                }
            };
            self.logger
                .verbose(format!("outbound: received {n} bytes <- {sender}"));

            if sender != self.exit_endpoint {
                self.logger.verbose(format!(
                    "outbound: drop packet from unknown sender: {sender}, expected: {}",
                    self.exit_endpoint
                ));
                continue;
            }

            let _ = self.listener.set_write_timeout(Some(UDP_WRITE_TIMEOUT));
            match self.listener.send_to(&buf[..n], self.client_addr) {
                Ok(written) => self.logger.verbose(format!(
                    "outbound: sent {written} bytes -> {}",
                    self.client_addr
                )),
                Err(e) => self.logger.error(format!("outbound: {e}")),
            }
        }

        self.logger.verbose("outbound: closed");
        self.latch.done();
    }

    /// Close both legs and wait for both pumps to exit. The tunnel leg
    /// unblocks immediately; the loopback leg exits on its next poll tick.
    pub fn close(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            self.outbound.close();
        }
        self.latch.wait();
    }

    /// Block until both pumps have exited, without closing anything.
    pub fn wait(&self) {
        self.latch.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::peered_tunnels;

    #[test]
    fn loopback_family_follows_exit_endpoint() {
        let v4: SocketAddr = "198.51.100.1:51820".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:51820".parse().unwrap();
        assert_eq!(loopback_for(&v4), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(loopback_for(&v6), IpAddr::V6(Ipv6Addr::LOCALHOST));
    }

    #[test]
    fn client_filter_requires_loopback_and_port() {
        let ok: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let bad_port: SocketAddr = "127.0.0.1:4001".parse().unwrap();
        let bad_ip: SocketAddr = "192.0.2.5:4000".parse().unwrap();
        assert!(is_expected_client(&ok, 4000));
        assert!(!is_expected_client(&bad_port, 4000));
        assert!(!is_expected_client(&bad_ip, 4000));
    }

    fn free_loopback_port() -> u16 {
        let probe = UdpSocket::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    }

    #[test]
    fn forwards_byte_exact_and_drops_spoofed_senders() {
        let peers = peered_tunnels("fwd");
        assert!(peers.left.wait_for_handshake(Duration::from_secs(10)));
        assert!(peers.right.wait_for_handshake(Duration::from_secs(10)));

        // Stand-in for the exit WireGuard endpoint: a UDP listener on the
        // far stack that echoes with a marker prefix.
        let exit = peers.right.listen_udp(51999).unwrap();
        let exit_addr = SocketAddr::new(peers.right_ip, 51999);

        // The client socket first, so its real port becomes client_port.
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        let client_port = client.local_addr().unwrap().port();
        let listen_port = free_loopback_port();

        let forwarder = UdpForwarder::new(
            ForwarderConfig {
                listen_port,
                client_port,
                exit_endpoint: exit_addr,
            },
            Arc::new(peers.left),
            TunnelLogger::new("fwd-test"),
        )
        .unwrap();

        let deadline = Some(Instant::now() + Duration::from_secs(10));

        // Spoofed datagram: loopback, but not the client port.
        let spoofer = UdpSocket::bind("127.0.0.1:0").unwrap();
        spoofer
            .send_to(b"spoofed", ("127.0.0.1", listen_port))
            .unwrap();

        // Legitimate datagram.
        client
            .send_to(b"wireguard-in-wireguard", ("127.0.0.1", listen_port))
            .unwrap();

        // The exit sees the legitimate bytes only.
        let mut buf = [0u8; 2048];
        let (n, from) = exit.recv_from(&mut buf, deadline).unwrap();
        assert_eq!(&buf[..n], b"wireguard-in-wireguard");
        let err = exit
            .recv_from(&mut buf, Some(Instant::now() + Duration::from_millis(300)))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);

        // A reply travels back to the client port byte-exact.
        exit.send_to(b"reply-bytes", from, deadline).unwrap();
        let (n, reply_from) = client.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"reply-bytes");
        assert_eq!(reply_from.port(), listen_port);

        forwarder.close();
        forwarder.wait();
        peers.right.close();
    }

    #[test]
    fn close_unblocks_both_pumps() {
        let peers = peered_tunnels("fwd-close");
        assert!(peers.left.wait_for_handshake(Duration::from_secs(10)));

        let client_port = free_loopback_port();
        let listen_port = free_loopback_port();
        let forwarder = UdpForwarder::new(
            ForwarderConfig {
                listen_port,
                client_port,
                exit_endpoint: SocketAddr::new(peers.right_ip, 4444),
            },
            Arc::new(peers.left),
            TunnelLogger::new("fwd-close"),
        )
        .unwrap();

        let started = Instant::now();
        forwarder.close();
        forwarder.wait();
        // Both pumps must exit within one in-flight read's worth of time.
        assert!(started.elapsed() < Duration::from_secs(2));

        peers.right.close();
    }
}
