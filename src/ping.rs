//! ICMP echo prober.
//!
//! Sends one echo request per call over a fresh tunnel socket and waits for
//! the matching reply. Replies are matched by payload and sequence number;
//! a stale sequence (a straggler from an earlier, timed-out request on the
//! same target) is logged and the wait continues.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{Icmpv4Packet, Icmpv4Repr, Icmpv6Packet, Icmpv6Repr};

use crate::device::NetTunnel;
use crate::error::PingError;
use crate::netstack::to_ip_address;
use crate::sockets::IpVersion;

/// Fixed echo identifier; one in-flight echo per socket.
pub const ECHO_IDENT: u16 = 1337;

/// Fixed echo payload.
pub const ECHO_PAYLOAD: &[u8] = b"gopher burrow";

/// Echo contents extracted from a reply.
enum Reply<'a> {
    Echo { seq_no: u16, data: &'a [u8] },
    Other,
}

fn parse_reply<'a>(
    buf: &'a [u8],
    version: IpVersion,
    target: IpAddr,
    local_v6: Option<IpAddr>,
) -> Reply<'a> {
    match version {
        IpVersion::V4 => {
            let Ok(packet) = Icmpv4Packet::new_checked(buf) else {
                return Reply::Other;
            };
            match Icmpv4Repr::parse(&packet, &ChecksumCapabilities::ignored()) {
                Ok(Icmpv4Repr::EchoReply { seq_no, data, .. }) => Reply::Echo { seq_no, data },
                _ => Reply::Other,
            }
        }
        IpVersion::V6 => {
            let Some(local) = local_v6 else {
                return Reply::Other;
            };
            let Ok(packet) = Icmpv6Packet::new_checked(buf) else {
                return Reply::Other;
            };
            match Icmpv6Repr::parse(
                &to_ip_address(target),
                &to_ip_address(local),
                &packet,
                &ChecksumCapabilities::ignored(),
            ) {
                Ok(Icmpv6Repr::EchoReply { seq_no, data, .. }) => Reply::Echo { seq_no, data },
                _ => Reply::Other,
            }
        }
    }
}

/// Ping one target once and return the round-trip time.
///
/// `target` may be an IP literal or a hostname; hostnames resolve through
/// the tunnel DNS as part of the dial. The write deadline is
/// `send_timeout`, each read waits at most `recv_timeout`.
pub fn send_ping(
    tunnel: &NetTunnel,
    target: &str,
    seq: u16,
    send_timeout: Duration,
    recv_timeout: Duration,
    version: IpVersion,
) -> Result<Duration, PingError> {
    let mut conn = tunnel
        .dial_ping(target, version, ECHO_IDENT)
        .map_err(|e| PingError::Dial(e.to_string()))?;
    let target_addr = conn.target();
    let local_v6 = conn.local_v6();
    let logger = tunnel.logger().clone();

    let start = Instant::now();
    conn.send_echo(seq, ECHO_PAYLOAD, Some(start + send_timeout))
        .map_err(PingError::Send)?;

    let mut buf = [0u8; 512];
    loop {
        let (n, _from) = conn
            .recv(&mut buf, Some(Instant::now() + recv_timeout))
            .map_err(PingError::Recv)?;

        match parse_reply(&buf[..n], version, target_addr, local_v6) {
            Reply::Echo { seq_no, data } => {
                if data != ECHO_PAYLOAD {
                    return Err(PingError::PayloadMismatch);
                }
                if seq_no != seq {
                    // Straggler from a previous request on this target.
                    logger.verbose(format!(
                        "got echo reply from timed out request (expected {seq}, received {seq_no})"
                    ));
                    continue;
                }
                return Ok(start.elapsed());
            }
            Reply::Other => return Err(PingError::InvalidReply),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::peered_tunnels;
    use smoltcp::wire::Icmpv4Message;

    #[test]
    fn echo_round_trip_against_peer_stack() {
        let peers = peered_tunnels("ping-rt");
        assert!(peers.left.wait_for_handshake(Duration::from_secs(10)));

        let rtt = send_ping(
            &peers.left,
            &peers.right_ip.to_string(),
            0,
            Duration::from_secs(3),
            Duration::from_secs(10),
            IpVersion::V4,
        )
        .unwrap();
        assert!(rtt < Duration::from_secs(10));

        // A second sequence number on the same target still matches.
        let rtt = send_ping(
            &peers.left,
            &peers.right_ip.to_string(),
            1,
            Duration::from_secs(3),
            Duration::from_secs(10),
            IpVersion::V4,
        )
        .unwrap();
        assert!(rtt < Duration::from_secs(10));

        peers.left.close();
        peers.right.close();
    }

    #[test]
    fn unreachable_target_times_out() {
        let peers = peered_tunnels("ping-dead");
        assert!(peers.left.wait_for_handshake(Duration::from_secs(10)));

        let err = send_ping(
            &peers.left,
            "10.64.0.99",
            0,
            Duration::from_secs(1),
            Duration::from_millis(500),
            IpVersion::V4,
        )
        .unwrap_err();
        assert!(matches!(err, PingError::Recv(_)));

        peers.left.close();
        peers.right.close();
    }

    #[test]
    fn family_mismatch_fails_the_dial() {
        let peers = peered_tunnels("ping-family");
        assert!(peers.left.wait_for_handshake(Duration::from_secs(10)));
        let err = send_ping(
            &peers.left,
            "10.64.0.2",
            0,
            Duration::from_secs(1),
            Duration::from_secs(1),
            IpVersion::V6,
        )
        .unwrap_err();
        assert!(matches!(err, PingError::Dial(_)));
        peers.left.close();
        peers.right.close();
    }

    #[test]
    fn stale_sequence_is_not_a_match() {
        // Craft a v4 echo reply with the wrong sequence and check the
        // parser classifies it as an echo (so the wait continues) rather
        // than a failure.
        let repr = Icmpv4Repr::EchoReply {
            ident: ECHO_IDENT,
            seq_no: 3,
            data: ECHO_PAYLOAD,
        };
        let mut packet = vec![0u8; repr.buffer_len()];
        repr.emit(
            &mut Icmpv4Packet::new_unchecked(&mut packet),
            &ChecksumCapabilities::default(),
        );
        let parsed = parse_reply(
            &packet,
            IpVersion::V4,
            "10.0.0.1".parse().unwrap(),
            None,
        );
        match parsed {
            Reply::Echo { seq_no, data } => {
                assert_eq!(seq_no, 3);
                assert_eq!(data, ECHO_PAYLOAD);
            }
            Reply::Other => panic!("expected an echo reply"),
        }

        // A non-echo message is classified as Other and fails the attempt.
        let dest_unreachable = {
            let mut raw = vec![0u8; 8 + 28];
            let mut packet = Icmpv4Packet::new_unchecked(&mut raw);
            packet.set_msg_type(Icmpv4Message::DstUnreachable);
            packet.set_msg_code(1);
            packet.fill_checksum();
            raw
        };
        assert!(matches!(
            parse_reply(
                &dest_unreachable,
                IpVersion::V4,
                "10.0.0.1".parse().unwrap(),
                None
            ),
            Reply::Other
        ));
    }
}
