//! WireGuard device over the in-memory TUN.
//!
//! A `NetTunnel` couples a boringtun tunnel with a user-mode IP stack:
//! datagrams from the peer endpoint are decapsulated into the stack, frames
//! the stack produces are encapsulated back out. Two background threads run
//! per device: the endpoint receiver and the protocol timer. Everything
//! else (sockets, pings, downloads) drives the shared state through the
//! device mutex and waits on its condvar.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use boringtun::noise::errors::WireGuardError;
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use parking_lot::{Condvar, Mutex};
use smoltcp::time::Instant as SmolInstant;

use crate::error::TunnelError;
use crate::ipc::{DeviceConfig, IpcError, TunnStats};
use crate::logging::TunnelLogger;
use crate::netstack::Netstack;

/// Maximum size of a UDP datagram.
pub const MAX_UDP_PACKET_SIZE: usize = 65535;

/// Encapsulation working buffer: datagram plus WireGuard overhead.
const WG_BUFFER_SIZE: usize = MAX_UDP_PACKET_SIZE + 256;

/// Cadence of the protocol timer thread. Also bounds how quickly TCP
/// retransmissions and DNS retries inside the stack fire.
const TIMER_INTERVAL: Duration = Duration::from_millis(100);

/// Read timeout on the endpoint socket; bounds shutdown latency.
const ENDPOINT_READ_TIMEOUT: Duration = Duration::from_millis(100);

pub(crate) struct TunnelState {
    pub(crate) netstack: Netstack,
    pub(crate) config: DeviceConfig,
    pub(crate) tunn: Option<Box<Tunn>>,
    pub(crate) endpoint_socket: Option<Arc<UdpSocket>>,
    pub(crate) resolved_endpoint: Option<SocketAddr>,
    /// Incremented whenever the endpoint socket is replaced so the
    /// receiver thread re-fetches its clone.
    pub(crate) socket_generation: u64,
    pub(crate) handshake_completed: bool,
    pub(crate) up: bool,
    /// Reusable encapsulation/decapsulation buffer.
    pub(crate) scratch: Vec<u8>,
}

pub(crate) struct TunnelShared {
    pub(crate) state: Mutex<TunnelState>,
    pub(crate) cond: Condvar,
    pub(crate) running: AtomicBool,
    pub(crate) logger: TunnelLogger,
}

/// A userspace WireGuard device plus its IP stack view.
pub struct NetTunnel {
    pub(crate) shared: Arc<TunnelShared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl NetTunnel {
    /// Create the device over a fresh stack. No sockets exist yet; the
    /// tunnel itself is configured by `ipc_set` and started by `up`.
    pub fn new(
        local_addrs: &[IpAddr],
        dns_addrs: &[IpAddr],
        mtu: usize,
        logger: TunnelLogger,
    ) -> Result<Self, TunnelError> {
        let netstack = Netstack::new(local_addrs, dns_addrs, mtu)
            .map_err(|e| TunnelError::Intermittent(format!("net tun creation failed: {e}")))?;

        let state = TunnelState {
            netstack,
            config: DeviceConfig::default(),
            tunn: None,
            endpoint_socket: None,
            resolved_endpoint: None,
            socket_generation: 0,
            handshake_completed: false,
            up: false,
            scratch: vec![0u8; WG_BUFFER_SIZE],
        };

        Ok(NetTunnel {
            shared: Arc::new(TunnelShared {
                state: Mutex::new(state),
                cond: Condvar::new(),
                running: AtomicBool::new(false),
                logger,
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    pub fn logger(&self) -> &TunnelLogger {
        &self.shared.logger
    }

    /// Apply an IPC configuration block. Present fields overwrite the
    /// current configuration; a new `public_key` replaces the peer.
    pub fn ipc_set(&self, settings: &str) -> Result<(), TunnelError> {
        let update = DeviceConfig::parse(settings)?;

        let mut st = self.shared.state.lock();
        st.config.merge(update);

        // Rebuild the noise tunnel whenever both sides of the key pair are
        // known. An in-flight session is discarded; the next handshake
        // re-establishes it.
        if let (Some(private_key), Some(peer)) = (st.config.private_key, st.config.peer.clone()) {
            let tunn = Tunn::new(
                StaticSecret::from(private_key),
                PublicKey::from(peer.public_key),
                peer.preshared_key,
                peer.keepalive,
                rand::random(),
                None,
            )
            .map_err(|e| IpcError::invalid(format!("tunnel init: {e}")))?;
            st.tunn = Some(Box::new(tunn));
            st.handshake_completed = false;

            if let Some(endpoint) = peer.endpoint {
                match st.endpoint_socket.clone() {
                    Some(socket) => {
                        // Keep the local binding stable; just re-target.
                        socket.connect(endpoint)?;
                    }
                    None => {
                        let socket =
                            UdpSocket::bind(bind_addr_for(&endpoint, st.config.listen_port))?;
                        socket.connect(endpoint)?;
                        socket.set_read_timeout(Some(ENDPOINT_READ_TIMEOUT))?;
                        st.endpoint_socket = Some(Arc::new(socket));
                        st.socket_generation += 1;
                    }
                }
                st.resolved_endpoint = Some(endpoint);
            }
        }

        self.shared
            .logger
            .verbose("configuration applied".to_string());
        Ok(())
    }

    /// Serialise the live configuration in UAPI "get" shape.
    pub fn ipc_get(&self) -> String {
        let st = self.shared.state.lock();
        let stats = st.tunn.as_ref().map(|tunn| {
            let (last_handshake, tx_bytes, rx_bytes, _, _) = tunn.stats();
            TunnStats {
                last_handshake,
                tx_bytes,
                rx_bytes,
            }
        });
        st.config.serialize(stats.as_ref())
    }

    /// Bring the device up: send the first handshake initiation and start
    /// the receiver and timer threads.
    pub fn up(&self) -> Result<(), TunnelError> {
        if self.shared.running.load(Ordering::Acquire) {
            return Ok(());
        }

        {
            let mut st = self.shared.state.lock();
            if st.tunn.is_none() || st.endpoint_socket.is_none() {
                return Err(TunnelError::Config(
                    "device is missing key material or endpoint".into(),
                ));
            }
            initiate_handshake(&mut st, &self.shared.logger)?;
            st.up = true;
        }

        self.shared.running.store(true, Ordering::Release);

        let shared = self.shared.clone();
        let rx = thread::Builder::new()
            .name("wg-endpoint-rx".into())
            .spawn(move || endpoint_receiver_loop(shared))?;

        let shared = self.shared.clone();
        let timer = thread::Builder::new()
            .name("wg-timer".into())
            .spawn(move || timer_loop(shared))?;

        self.threads.lock().extend([rx, timer]);
        self.shared.logger.info("device up");
        Ok(())
    }

    pub fn is_up(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    pub fn handshake_completed(&self) -> bool {
        self.shared.state.lock().handshake_completed
    }

    /// Wait for the first handshake with active re-initiation and
    /// exponential backoff, to ride out lost initiation datagrams.
    pub fn wait_for_handshake(&self, timeout: Duration) -> bool {
        let start = Instant::now();
        let mut retry_interval = Duration::from_millis(500);
        let max_retry_interval = Duration::from_secs(4);
        let mut next_retry = start + retry_interval;

        while start.elapsed() < timeout {
            if self.handshake_completed() {
                return true;
            }
            let now = Instant::now();
            if now >= next_retry {
                let mut st = self.shared.state.lock();
                if let Err(e) = initiate_handshake(&mut st, &self.shared.logger) {
                    self.shared
                        .logger
                        .error(format!("handshake re-initiation failed: {e}"));
                }
                retry_interval = (retry_interval * 2).min(max_retry_interval);
                next_retry = now + retry_interval;
            }
            thread::sleep(Duration::from_millis(25));
        }

        self.shared.logger.error(format!(
            "handshake timed out after {:?}",
            start.elapsed()
        ));
        false
    }

    /// Recreate and reconnect the endpoint socket after a network change,
    /// then re-initiate the handshake. No-op when the device has no
    /// endpoint yet.
    pub fn rebind_endpoint(&self) -> Result<(), TunnelError> {
        let mut st = self.shared.state.lock();
        let Some(endpoint) = st.resolved_endpoint else {
            self.shared.logger.verbose("rebind skipped: no endpoint");
            return Ok(());
        };

        let socket = UdpSocket::bind(bind_addr_for(&endpoint, st.config.listen_port))?;
        socket.connect(endpoint)?;
        socket.set_read_timeout(Some(ENDPOINT_READ_TIMEOUT))?;
        st.endpoint_socket = Some(Arc::new(socket));
        st.socket_generation += 1;
        st.handshake_completed = false;

        let generation = st.socket_generation;
        initiate_handshake(&mut st, &self.shared.logger)?;
        self.shared
            .logger
            .info(format!("endpoint socket rebound (gen={generation})"));
        Ok(())
    }

    /// Mobile-platform roaming hook. The endpoint here is pinned by a
    /// connected socket, so there is no roaming state to disable.
    pub fn disable_roaming(&self) {
        self.shared.logger.verbose("roaming disabled (no-op)");
    }

    pub fn local_endpoint_addr(&self) -> Option<SocketAddr> {
        let st = self.shared.state.lock();
        st.endpoint_socket.as_ref()?.local_addr().ok()
    }

    /// Stop both worker threads, join them, and release the endpoint
    /// socket. Blocked stack sockets are woken with an error. Idempotent.
    pub fn close(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            let workers = std::mem::take(&mut *self.threads.lock());
            for worker in workers {
                let _ = worker.join();
            }
        }

        let mut st = self.shared.state.lock();
        st.up = false;
        st.endpoint_socket = None;
        drop(st);
        self.shared.cond.notify_all();
        self.shared.logger.info("device closed");
    }
}

impl Drop for NetTunnel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Unspecified bind address in the endpoint's family, with an optional
/// fixed port.
fn bind_addr_for(endpoint: &SocketAddr, listen_port: Option<u16>) -> SocketAddr {
    let port = listen_port.unwrap_or(0);
    match endpoint {
        SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), port),
        SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), port),
    }
}

/// Send a handshake initiation on the endpoint socket.
fn initiate_handshake(st: &mut TunnelState, logger: &TunnelLogger) -> Result<(), TunnelError> {
    let TunnelState {
        tunn,
        endpoint_socket,
        scratch,
        ..
    } = st;
    let (Some(tunn), Some(socket)) = (tunn.as_mut(), endpoint_socket.as_ref()) else {
        return Err(TunnelError::NotUp);
    };

    match tunn.format_handshake_initiation(scratch, false) {
        TunnResult::WriteToNetwork(data) => {
            logger.verbose(format!("sending handshake initiation ({} bytes)", data.len()));
            socket.send(data)?;
            Ok(())
        }
        TunnResult::Err(e) => Err(TunnelError::Config(format!(
            "handshake initiation failed: {e:?}"
        ))),
        _ => Ok(()),
    }
}

/// Poll the stack and push every produced frame through the tunnel.
pub(crate) fn flush_netstack(st: &mut TunnelState, logger: &TunnelLogger) {
    st.netstack.poll(SmolInstant::now());
    let frames = st.netstack.drain_outbound();
    if frames.is_empty() {
        return;
    }

    let TunnelState {
        tunn,
        endpoint_socket,
        scratch,
        ..
    } = st;
    let (Some(tunn), Some(socket)) = (tunn.as_mut(), endpoint_socket.as_ref()) else {
        logger.verbose("dropping stack frames: device not configured");
        return;
    };

    for frame in frames {
        match tunn.encapsulate(&frame, scratch) {
            TunnResult::WriteToNetwork(data) => {
                if let Err(e) = socket.send(data) {
                    logger.error(format!("endpoint send failed: {e}"));
                }
            }
            TunnResult::Err(e) => {
                logger.verbose(format!("encapsulate error: {e:?}"));
            }
            // No session keys yet; the frame is dropped and upper layers
            // retransmit once the handshake lands.
            _ => {}
        }
    }
}

/// Decapsulate one endpoint datagram into the stack, answering handshake
/// traffic inline.
fn process_endpoint_datagram(st: &mut TunnelState, datagram: &[u8], logger: &TunnelLogger) {
    let TunnelState {
        netstack,
        tunn,
        endpoint_socket,
        scratch,
        handshake_completed,
        ..
    } = st;
    let (Some(tunn), Some(socket)) = (tunn.as_mut(), endpoint_socket.as_ref()) else {
        return;
    };

    let mut result = tunn.decapsulate(None, datagram, scratch);
    loop {
        match result {
            TunnResult::WriteToNetwork(data) => {
                if let Err(e) = socket.send(data) {
                    logger.error(format!("endpoint send failed: {e}"));
                }
                // Drain queued protocol messages.
                result = tunn.decapsulate(None, &[], scratch);
            }
            TunnResult::WriteToTunnelV4(packet, _) | TunnResult::WriteToTunnelV6(packet, _) => {
                netstack.push_inbound(packet.to_vec());
                break;
            }
            TunnResult::Done => break,
            TunnResult::Err(e) => {
                logger.verbose(format!("decapsulation error: {e:?}"));
                break;
            }
        }
    }

    if !*handshake_completed && tunn.stats().0.is_some() {
        *handshake_completed = true;
        logger.info("handshake completed");
    }
}

/// Background thread: receive endpoint datagrams, decapsulate, poll.
fn endpoint_receiver_loop(shared: Arc<TunnelShared>) {
    let logger = &shared.logger;
    let (mut socket, mut generation) = {
        let st = shared.state.lock();
        match (&st.endpoint_socket, st.socket_generation) {
            (Some(socket), generation) => (socket.clone(), generation),
            (None, _) => return,
        }
    };

    let mut recv_buf = vec![0u8; WG_BUFFER_SIZE];
    logger.verbose("endpoint receiver started");

    while shared.running.load(Ordering::Relaxed) {
        match socket.recv(&mut recv_buf) {
            Ok(n) => {
                let mut st = shared.state.lock();
                process_endpoint_datagram(&mut st, &recv_buf[..n], logger);
                flush_netstack(&mut st, logger);
                drop(st);
                shared.cond.notify_all();
            }
            Err(e)
                if matches!(
                    e.kind(),
                    std::io::ErrorKind::WouldBlock
                        | std::io::ErrorKind::TimedOut
                        | std::io::ErrorKind::Interrupted
                        // ICMP port unreachable surfaces here on connected
                        // UDP sockets; the peer may simply not be up yet.
                        | std::io::ErrorKind::ConnectionRefused
                ) =>
            {
                // Pick up a replacement socket after a rebind.
                let st = shared.state.lock();
                if st.socket_generation != generation {
                    if let Some(replacement) = &st.endpoint_socket {
                        socket = replacement.clone();
                        generation = st.socket_generation;
                        logger.verbose(format!("receiver switched to socket gen {generation}"));
                    }
                }
            }
            Err(e) => {
                if shared.running.load(Ordering::Relaxed) {
                    logger.error(format!("endpoint recv error: {e}"));
                }
            }
        }
    }

    logger.verbose("endpoint receiver stopped");
}

/// Background thread: drive boringtun timers and stack retransmissions.
fn timer_loop(shared: Arc<TunnelShared>) {
    let logger = &shared.logger;
    logger.verbose("timer thread started");

    while shared.running.load(Ordering::Relaxed) {
        thread::sleep(TIMER_INTERVAL);

        let mut st = shared.state.lock();
        let TunnelState {
            tunn,
            endpoint_socket,
            scratch,
            handshake_completed,
            ..
        } = &mut *st;
        if let (Some(tunn), Some(socket)) = (tunn.as_mut(), endpoint_socket.as_ref()) {
            loop {
                match tunn.update_timers(scratch) {
                    TunnResult::WriteToNetwork(data) => {
                        if let Err(e) = socket.send(data) {
                            logger.verbose(format!("timer send failed: {e}"));
                        }
                    }
                    TunnResult::Err(WireGuardError::ConnectionExpired) => {
                        *handshake_completed = false;
                        // Sessions can recover after outages or NAT rebinds;
                        // always try again.
                        match tunn.format_handshake_initiation(scratch, false) {
                            TunnResult::WriteToNetwork(data) => {
                                if socket.send(data).is_ok() {
                                    logger.verbose("re-initiated expired session");
                                }
                            }
                            _ => {}
                        }
                        break;
                    }
                    TunnResult::Err(e) => {
                        logger.verbose(format!("timer error: {e:?}"));
                        break;
                    }
                    _ => break,
                }
            }
        }
        flush_netstack(&mut st, logger);
        drop(st);
        shared.cond.notify_all();
    }

    logger.verbose("timer thread stopped");
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ipc::{derive_public_key, encode_key_hex, generate_private_key};

    fn logger(tag: &str) -> TunnelLogger {
        TunnelLogger::new(tag)
    }

    pub(crate) struct PeeredTunnels {
        pub left: NetTunnel,
        pub right: NetTunnel,
        pub left_ip: IpAddr,
        pub right_ip: IpAddr,
    }

    /// Two in-process devices peered with each other over loopback UDP.
    pub(crate) fn peered_tunnels(tag: &str) -> PeeredTunnels {
        let _ = env_logger::builder().is_test(true).try_init();

        let left_ip: IpAddr = "10.64.0.1".parse().unwrap();
        let right_ip: IpAddr = "10.64.0.2".parse().unwrap();
        let dns: IpAddr = "10.64.0.2".parse().unwrap();

        let key_left = generate_private_key().unwrap();
        let key_right = generate_private_key().unwrap();
        let pub_left = derive_public_key(&key_left);
        let pub_right = derive_public_key(&key_right);

        let left =
            NetTunnel::new(&[left_ip], &[dns], 1280, logger(&format!("{tag}-left"))).unwrap();
        let right =
            NetTunnel::new(&[right_ip], &[dns], 1280, logger(&format!("{tag}-right"))).unwrap();

        let config_for = |private: &[u8; 32], peer: &[u8; 32], port: u16| {
            format!(
                "private_key={}\npublic_key={}\nendpoint=127.0.0.1:{port}\nallowed_ip=0.0.0.0/0\n",
                encode_key_hex(private),
                encode_key_hex(peer),
            )
        };

        // Bootstrap with a discard-port endpoint so the sockets bind and we
        // can learn the ephemeral ports, then point the peers at each other.
        left.ipc_set(&config_for(&key_left, &pub_right, 9)).unwrap();
        right.ipc_set(&config_for(&key_right, &pub_left, 9)).unwrap();

        let left_port = left.local_endpoint_addr().unwrap().port();
        let right_port = right.local_endpoint_addr().unwrap().port();
        left.ipc_set(&config_for(&key_left, &pub_right, right_port))
            .unwrap();
        right
            .ipc_set(&config_for(&key_right, &pub_left, left_port))
            .unwrap();

        left.up().unwrap();
        right.up().unwrap();

        PeeredTunnels {
            left,
            right,
            left_ip,
            right_ip,
        }
    }

    #[test]
    fn up_requires_configuration() {
        let dev = NetTunnel::new(
            &["10.0.0.2".parse().unwrap()],
            &["1.1.1.1".parse().unwrap()],
            1280,
            logger("unconfigured"),
        )
        .unwrap();
        assert!(matches!(dev.up(), Err(TunnelError::Config(_))));
    }

    #[test]
    fn configure_up_query_close() {
        let private_key = generate_private_key().unwrap();
        let peer_key = derive_public_key(&generate_private_key().unwrap());

        let dev = NetTunnel::new(
            &["10.0.0.2".parse().unwrap()],
            &["1.1.1.1".parse().unwrap()],
            1280,
            logger("solo"),
        )
        .unwrap();

        dev.ipc_set(&format!(
            "private_key={}\npublic_key={}\nendpoint=127.0.0.1:9\nallowed_ip=0.0.0.0/0\n",
            encode_key_hex(&private_key),
            encode_key_hex(&peer_key),
        ))
        .unwrap();
        dev.up().unwrap();
        assert!(dev.is_up());

        let text = dev.ipc_get();
        assert!(text.contains(&format!("public_key={}", encode_key_hex(&peer_key))));
        assert!(text.contains("endpoint=127.0.0.1:9"));
        assert!(text.contains("protocol_version=1"));

        dev.close();
        assert!(!dev.is_up());
        // Idempotent.
        dev.close();
    }

    #[test]
    fn rejects_bad_settings_with_ipc_error() {
        let dev = NetTunnel::new(
            &["10.0.0.2".parse().unwrap()],
            &["1.1.1.1".parse().unwrap()],
            1280,
            logger("badcfg"),
        )
        .unwrap();
        let err = dev.ipc_set("private_key=zz\n").unwrap_err();
        assert!(matches!(err, TunnelError::Ipc(_)));
    }

    #[test]
    fn loopback_peers_complete_handshake() {
        let peers = peered_tunnels("hs");
        assert!(peers.left.wait_for_handshake(Duration::from_secs(10)));
        assert!(peers.right.wait_for_handshake(Duration::from_secs(10)));

        // The UAPI get view reflects the completed handshake.
        let text = peers.left.ipc_get();
        assert!(text.contains("last_handshake_time_sec="));

        peers.left.close();
        peers.right.close();
    }

    #[test]
    fn rebind_replaces_endpoint_socket() {
        let peers = peered_tunnels("rebind");
        assert!(peers.left.wait_for_handshake(Duration::from_secs(10)));

        let before = peers.left.local_endpoint_addr().unwrap();
        peers.left.rebind_endpoint().unwrap();
        let after = peers.left.local_endpoint_addr().unwrap();
        // A fresh ephemeral binding; the peer re-learns it on the next
        // handshake. Equality would mean the socket was not replaced.
        assert_ne!(before.port(), after.port());
        assert!(peers.left.is_up());

        peers.left.close();
        peers.right.close();
    }
}
