//! Blocking socket wrappers over the tunnel stack.
//!
//! Each wrapper owns one smoltcp socket inside the device's socket set and
//! drives it through the device mutex, parking on the device condvar until
//! the worker threads make progress. Deadlines bound every wait.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::MutexGuard;
use smoltcp::iface::SocketHandle;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::socket::{icmp, tcp, udp};
use smoltcp::wire::{
    DnsQueryType, Icmpv4Packet, Icmpv4Repr, Icmpv6Packet, Icmpv6Repr, IpAddress, IpEndpoint,
    IpListenEndpoint,
};

use crate::device::{flush_netstack, NetTunnel, TunnelShared, TunnelState};
use crate::error::TunnelError;
use crate::netstack::{from_ip_address, random_ephemeral_port, to_ip_address};

const UDP_META_COUNT: usize = 64;
const UDP_BUFFER_SIZE: usize = 1 << 17;
const ICMP_META_COUNT: usize = 8;
const ICMP_BUFFER_SIZE: usize = 4096;
const TCP_BUFFER_SIZE: usize = 64 * 1024;
const DNS_TIMEOUT: Duration = Duration::from_secs(5);

/// Address family selector mirroring the probe schema's `ip_version`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    pub fn from_u8(value: u8) -> Result<Self, TunnelError> {
        match value {
            4 => Ok(IpVersion::V4),
            6 => Ok(IpVersion::V6),
            other => Err(TunnelError::Config(format!("bad ip_version: {other}"))),
        }
    }

    pub fn matches(&self, addr: &IpAddr) -> bool {
        matches!(
            (self, addr),
            (IpVersion::V4, IpAddr::V4(_)) | (IpVersion::V6, IpAddr::V6(_))
        )
    }
}

fn closed_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "socket closed")
}

fn device_down_err() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "device is not up")
}

fn timeout_err() -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, "deadline elapsed")
}

/// Park on the device condvar until woken or `deadline`. Returns false on
/// timeout.
fn wait_progress(
    shared: &TunnelShared,
    guard: &mut MutexGuard<'_, TunnelState>,
    deadline: Option<Instant>,
) -> bool {
    match deadline {
        Some(at) => !shared.cond.wait_until(guard, at).timed_out(),
        None => {
            shared.cond.wait(guard);
            true
        }
    }
}

// ── UDP ─────────────────────────────────────────────────────────────────────

struct UdpConnInner {
    shared: Arc<TunnelShared>,
    handle: SocketHandle,
    remote: Option<SocketAddr>,
    closed: AtomicBool,
}

/// A UDP socket on the tunnel stack. Cloneable so one thread can block in
/// `recv_from` while another closes the connection.
#[derive(Clone)]
pub struct UdpConn {
    inner: Arc<UdpConnInner>,
}

impl NetTunnel {
    fn new_udp_socket(&self, bind_port: u16) -> Result<(SocketHandle, u16), TunnelError> {
        let mut st = self.shared.state.lock();
        if !st.up {
            return Err(TunnelError::NotUp);
        }
        let rx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; UDP_META_COUNT],
            vec![0u8; UDP_BUFFER_SIZE],
        );
        let tx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; UDP_META_COUNT],
            vec![0u8; UDP_BUFFER_SIZE],
        );
        let mut socket = udp::Socket::new(rx, tx);
        let port = if bind_port == 0 {
            random_ephemeral_port()
        } else {
            bind_port
        };
        socket
            .bind(IpListenEndpoint::from(port))
            .map_err(|e| TunnelError::Config(format!("udp bind error: {e:?}")))?;
        Ok((st.netstack.add_socket(socket), port))
    }

    /// Open a UDP connection over the tunnel with a fixed remote, from an
    /// ephemeral local port.
    pub fn dial_udp(&self, remote: SocketAddr) -> Result<UdpConn, TunnelError> {
        let (handle, _port) = self.new_udp_socket(0)?;
        Ok(UdpConn {
            inner: Arc::new(UdpConnInner {
                shared: self.shared.clone(),
                handle,
                remote: Some(remote),
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Bind a UDP socket on the tunnel stack at a fixed port.
    pub fn listen_udp(&self, port: u16) -> Result<UdpConn, TunnelError> {
        let (handle, _port) = self.new_udp_socket(port)?;
        Ok(UdpConn {
            inner: Arc::new(UdpConnInner {
                shared: self.shared.clone(),
                handle,
                remote: None,
                closed: AtomicBool::new(false),
            }),
        })
    }
}

impl UdpConn {
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote
    }

    /// Send to the dialed remote. Errors if this socket was bound with
    /// `listen_udp`.
    pub fn send(&self, payload: &[u8], deadline: Option<Instant>) -> io::Result<usize> {
        let remote = self
            .inner
            .remote
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "socket has no remote"))?;
        self.send_to(payload, remote, deadline)
    }

    pub fn send_to(
        &self,
        payload: &[u8],
        target: SocketAddr,
        deadline: Option<Instant>,
    ) -> io::Result<usize> {
        let endpoint = IpEndpoint::new(to_ip_address(target.ip()), target.port());
        let mut st = self.inner.shared.state.lock();
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(closed_err());
            }
            if !st.up {
                return Err(device_down_err());
            }
            let socket = st.netstack.get_socket::<udp::Socket>(self.inner.handle);
            if socket.can_send() {
                return match socket.send_slice(payload, endpoint) {
                    Ok(()) => {
                        flush_netstack(&mut st, &self.inner.shared.logger);
                        drop(st);
                        self.inner.shared.cond.notify_all();
                        Ok(payload.len())
                    }
                    Err(udp::SendError::BufferFull) => Err(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        "udp tx buffer full",
                    )),
                    Err(udp::SendError::Unaddressable) => Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "unaddressable destination",
                    )),
                };
            }
            if !wait_progress(&self.inner.shared, &mut st, deadline) {
                return Err(timeout_err());
            }
        }
    }

    /// Receive one datagram, copying into `buf`. Blocks until a datagram
    /// arrives, the deadline fires, or the socket/device is closed.
    pub fn recv_from(
        &self,
        buf: &mut [u8],
        deadline: Option<Instant>,
    ) -> io::Result<(usize, SocketAddr)> {
        let mut st = self.inner.shared.state.lock();
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(closed_err());
            }
            if !st.up {
                return Err(device_down_err());
            }
            let socket = st.netstack.get_socket::<udp::Socket>(self.inner.handle);
            if socket.can_recv() {
                let (data, meta) = socket
                    .recv()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{e:?}")))?;
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                let from = SocketAddr::new(from_ip_address(meta.endpoint.addr), meta.endpoint.port);
                return Ok((len, from));
            }
            if !wait_progress(&self.inner.shared, &mut st, deadline) {
                return Err(timeout_err());
            }
        }
    }

    /// Close the socket. Any blocked reader or writer wakes with an error.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::AcqRel) {
            let mut st = self.inner.shared.state.lock();
            st.netstack.remove_socket(self.inner.handle);
            drop(st);
            self.inner.shared.cond.notify_all();
        }
    }
}

impl Drop for UdpConnInner {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            let mut st = self.shared.state.lock();
            st.netstack.remove_socket(self.handle);
            drop(st);
            self.shared.cond.notify_all();
        }
    }
}

// ── ICMP echo ───────────────────────────────────────────────────────────────

/// An ICMP echo socket bound to a fixed identifier, pointed at one target.
pub struct PingConn {
    shared: Arc<TunnelShared>,
    handle: SocketHandle,
    target: IpAddr,
    ident: u16,
    closed: bool,
}

impl NetTunnel {
    /// Open an ICMP echo socket towards `target`. A hostname target is
    /// resolved through the tunnel DNS first; resolution failure fails the
    /// dial.
    pub fn dial_ping(
        &self,
        target: &str,
        version: IpVersion,
        ident: u16,
    ) -> Result<PingConn, TunnelError> {
        let addr = self.resolve(target, version)?;

        let mut st = self.shared.state.lock();
        if !st.up {
            return Err(TunnelError::NotUp);
        }
        let rx = icmp::PacketBuffer::new(
            vec![icmp::PacketMetadata::EMPTY; ICMP_META_COUNT],
            vec![0u8; ICMP_BUFFER_SIZE],
        );
        let tx = icmp::PacketBuffer::new(
            vec![icmp::PacketMetadata::EMPTY; ICMP_META_COUNT],
            vec![0u8; ICMP_BUFFER_SIZE],
        );
        let mut socket = icmp::Socket::new(rx, tx);
        socket
            .bind(icmp::Endpoint::Ident(ident))
            .map_err(|e| TunnelError::Config(format!("icmp bind error: {e:?}")))?;
        let handle = st.netstack.add_socket(socket);

        Ok(PingConn {
            shared: self.shared.clone(),
            handle,
            target: addr,
            ident,
            closed: false,
        })
    }
}

impl PingConn {
    pub fn target(&self) -> IpAddr {
        self.target
    }

    /// Build and send one echo request. Waits for tx space until
    /// `deadline` (the write deadline).
    pub fn send_echo(
        &mut self,
        seq_no: u16,
        payload: &[u8],
        deadline: Option<Instant>,
    ) -> io::Result<()> {
        let mut st = self.shared.state.lock();
        loop {
            if self.closed {
                return Err(closed_err());
            }
            if !st.up {
                return Err(device_down_err());
            }

            // Assemble inside the loop so the borrow of the socket set does
            // not outlive a wait.
            let local_v6 = st
                .netstack
                .local_addrs()
                .iter()
                .find(|a| a.is_ipv6())
                .copied();
            let socket = st.netstack.get_socket::<icmp::Socket>(self.handle);
            if socket.can_send() {
                let result = match self.target {
                    IpAddr::V4(_) => {
                        let repr = Icmpv4Repr::EchoRequest {
                            ident: self.ident,
                            seq_no,
                            data: payload,
                        };
                        let mut packet = vec![0u8; repr.buffer_len()];
                        repr.emit(
                            &mut Icmpv4Packet::new_unchecked(&mut packet),
                            &ChecksumCapabilities::default(),
                        );
                        socket.send_slice(&packet, to_ip_address(self.target))
                    }
                    IpAddr::V6(dst) => {
                        let src = local_v6.ok_or_else(|| {
                            io::Error::new(io::ErrorKind::AddrNotAvailable, "no local IPv6 address")
                        })?;
                        let repr = Icmpv6Repr::EchoRequest {
                            ident: self.ident,
                            seq_no,
                            data: payload,
                        };
                        let mut packet = vec![0u8; repr.buffer_len()];
                        repr.emit(
                            &to_ip_address(src),
                            &to_ip_address(IpAddr::V6(dst)),
                            &mut Icmpv6Packet::new_unchecked(&mut packet),
                            &ChecksumCapabilities::default(),
                        );
                        socket.send_slice(&packet, to_ip_address(self.target))
                    }
                };
                return match result {
                    Ok(()) => {
                        flush_netstack(&mut st, &self.shared.logger);
                        drop(st);
                        self.shared.cond.notify_all();
                        Ok(())
                    }
                    Err(e) => Err(io::Error::new(io::ErrorKind::Other, format!("{e:?}"))),
                };
            }
            if !wait_progress(&self.shared, &mut st, deadline) {
                return Err(timeout_err());
            }
        }
    }

    /// Receive one raw ICMP message. Returns its bytes and the sender.
    pub fn recv(&mut self, buf: &mut [u8], deadline: Option<Instant>) -> io::Result<(usize, IpAddr)> {
        let mut st = self.shared.state.lock();
        loop {
            if self.closed {
                return Err(closed_err());
            }
            if !st.up {
                return Err(device_down_err());
            }
            let socket = st.netstack.get_socket::<icmp::Socket>(self.handle);
            if socket.can_recv() {
                let (data, from) = socket
                    .recv()
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{e:?}")))?;
                let len = data.len().min(buf.len());
                buf[..len].copy_from_slice(&data[..len]);
                return Ok((len, from_ip_address(from)));
            }
            if !wait_progress(&self.shared, &mut st, deadline) {
                return Err(timeout_err());
            }
        }
    }

    /// Local IPv6 source address, needed to verify v6 reply checksums.
    pub fn local_v6(&self) -> Option<IpAddr> {
        let st = self.shared.state.lock();
        st.netstack.local_addrs().iter().find(|a| a.is_ipv6()).copied()
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut st = self.shared.state.lock();
            st.netstack.remove_socket(self.handle);
            drop(st);
            self.shared.cond.notify_all();
        }
    }
}

impl Drop for PingConn {
    fn drop(&mut self) {
        self.close();
    }
}

// ── TCP ─────────────────────────────────────────────────────────────────────

/// A TCP connection over the tunnel stack. Implements `io::Read`/`Write`
/// with per-direction deadlines so a TLS session can layer on top.
pub struct TcpConn {
    shared: Arc<TunnelShared>,
    handle: SocketHandle,
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    closed: bool,
}

impl NetTunnel {
    /// Resolve `host` and open a TCP connection, waiting up to `timeout`
    /// for establishment.
    pub fn dial_tcp(
        &self,
        host: &str,
        port: u16,
        version: IpVersion,
        timeout: Duration,
    ) -> Result<TcpConn, TunnelError> {
        let addr = self.resolve(host, version)?;
        let deadline = Instant::now() + timeout;

        let handle = {
            let mut st = self.shared.state.lock();
            if !st.up {
                return Err(TunnelError::NotUp);
            }
            let rx = tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
            let tx = tcp::SocketBuffer::new(vec![0u8; TCP_BUFFER_SIZE]);
            let mut socket = tcp::Socket::new(rx, tx);
            socket.set_nagle_enabled(false);
            let handle = st.netstack.add_socket(socket);

            let local_port = random_ephemeral_port();
            let remote = IpEndpoint::new(to_ip_address(addr), port);
            if let Err(e) = st.netstack.tcp_connect(handle, remote, local_port) {
                st.netstack.remove_socket(handle);
                return Err(e);
            }
            flush_netstack(&mut st, &self.shared.logger);
            handle
        };
        self.shared.cond.notify_all();

        // Wait for establishment.
        let mut st = self.shared.state.lock();
        loop {
            if !st.up {
                st.netstack.remove_socket(handle);
                return Err(TunnelError::NotUp);
            }
            let socket = st.netstack.get_socket::<tcp::Socket>(handle);
            match socket.state() {
                tcp::State::Established => break,
                tcp::State::Closed => {
                    st.netstack.remove_socket(handle);
                    return Err(TunnelError::Socket(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        format!("connection to {addr}:{port} refused"),
                    )));
                }
                _ => {}
            }
            if !wait_progress(&self.shared, &mut st, Some(deadline)) {
                let socket = st.netstack.get_socket::<tcp::Socket>(handle);
                socket.abort();
                st.netstack.remove_socket(handle);
                return Err(TunnelError::Socket(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("connection to {addr}:{port} timed out"),
                )));
            }
        }
        drop(st);

        Ok(TcpConn {
            shared: self.shared.clone(),
            handle,
            read_deadline: None,
            write_deadline: None,
            closed: false,
        })
    }
}

impl TcpConn {
    pub fn set_read_deadline(&mut self, deadline: Option<Instant>) {
        self.read_deadline = deadline;
    }

    pub fn set_write_deadline(&mut self, deadline: Option<Instant>) {
        self.write_deadline = deadline;
    }

    /// Orderly close: emit a FIN and stop tracking the socket.
    pub fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            let mut st = self.shared.state.lock();
            {
                let socket = st.netstack.get_socket::<tcp::Socket>(self.handle);
                socket.close();
            }
            flush_netstack(&mut st, &self.shared.logger);
            st.netstack.remove_socket(self.handle);
            drop(st);
            self.shared.cond.notify_all();
        }
    }
}

impl io::Read for TcpConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut st = self.shared.state.lock();
        loop {
            if self.closed {
                return Err(closed_err());
            }
            if !st.up {
                return Err(device_down_err());
            }
            let socket = st.netstack.get_socket::<tcp::Socket>(self.handle);
            if socket.can_recv() {
                let len = socket
                    .recv_slice(buf)
                    .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("{e:?}")))?;
                return Ok(len);
            }
            match socket.state() {
                // Receive half still open, keep waiting.
                tcp::State::SynSent
                | tcp::State::SynReceived
                | tcp::State::Established
                | tcp::State::FinWait1
                | tcp::State::FinWait2 => {}
                // Remote closed and the buffer is drained.
                _ => return Ok(0),
            }
            if !wait_progress(&self.shared, &mut st, self.read_deadline) {
                return Err(timeout_err());
            }
        }
    }
}

impl io::Write for TcpConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut st = self.shared.state.lock();
        loop {
            if self.closed {
                return Err(closed_err());
            }
            if !st.up {
                return Err(device_down_err());
            }
            let socket = st.netstack.get_socket::<tcp::Socket>(self.handle);
            if socket.can_send() {
                let len = socket
                    .send_slice(buf)
                    .map_err(|e| io::Error::new(io::ErrorKind::NotConnected, format!("{e:?}")))?;
                flush_netstack(&mut st, &self.shared.logger);
                drop(st);
                self.shared.cond.notify_all();
                return Ok(len);
            }
            if !socket.may_send() {
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "send half closed",
                ));
            }
            if !wait_progress(&self.shared, &mut st, self.write_deadline) {
                return Err(timeout_err());
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for TcpConn {
    fn drop(&mut self) {
        self.close();
    }
}

// ── DNS ─────────────────────────────────────────────────────────────────────

impl NetTunnel {
    /// Resolve a hostname through the tunnel's DNS. IP literals
    /// short-circuit (after a family check against `version`).
    pub fn resolve(&self, host: &str, version: IpVersion) -> Result<IpAddr, TunnelError> {
        if let Ok(addr) = host.parse::<IpAddr>() {
            if !version.matches(&addr) {
                return Err(TunnelError::Config(format!(
                    "address family of {host} does not match requested ip version"
                )));
            }
            return Ok(addr);
        }

        let query_type = match version {
            IpVersion::V4 => DnsQueryType::A,
            IpVersion::V6 => DnsQueryType::Aaaa,
        };

        let deadline = Instant::now() + DNS_TIMEOUT;
        let mut st = self.shared.state.lock();
        if !st.up {
            return Err(TunnelError::NotUp);
        }
        let query = st.netstack.start_dns_query(host, query_type)?;
        flush_netstack(&mut st, &self.shared.logger);

        loop {
            match st.netstack.dns_query_result(query) {
                Ok(Some(addrs)) => {
                    return addrs
                        .into_iter()
                        .find(|a| version.matches(a))
                        .ok_or_else(|| {
                            TunnelError::Config(format!("{host} has no matching address"))
                        });
                }
                Ok(None) => {}
                Err(e) => return Err(e),
            }
            if !wait_progress(&self.shared, &mut st, Some(deadline)) {
                st.netstack.cancel_dns_query(query);
                return Err(TunnelError::Config(format!("dns lookup for {host} timed out")));
            }
        }
    }
}
