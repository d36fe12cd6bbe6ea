//! In-memory TUN endpoint.
//!
//! A pair of queues that looks like an IP network interface to smoltcp and
//! like a packet source/sink to the WireGuard device: frames decapsulated
//! from the tunnel are pushed onto the inbound queue, frames emitted by the
//! stack accumulate on the outbound queue until the device encapsulates and
//! sends them. No kernel interface is involved.

use std::collections::VecDeque;

use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::time::Instant;

/// Queue-pair TUN endpoint driven entirely under the owning device's lock.
pub struct NetTun {
    /// Frames decapsulated from the tunnel, waiting for the stack.
    inbound: VecDeque<Vec<u8>>,
    /// Frames emitted by the stack, waiting for encapsulation.
    outbound: Vec<Vec<u8>>,
    mtu: usize,
}

impl NetTun {
    pub fn new(mtu: usize) -> Self {
        NetTun {
            inbound: VecDeque::new(),
            outbound: Vec::new(),
            mtu,
        }
    }

    /// Queue a decapsulated IP packet for the stack.
    pub fn push_inbound(&mut self, packet: Vec<u8>) {
        self.inbound.push_back(packet);
    }

    /// Take every frame the stack has produced since the last drain.
    pub fn drain_outbound(&mut self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.outbound)
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }
}

pub struct NetTunRxToken {
    buffer: Vec<u8>,
}

impl RxToken for NetTunRxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.buffer)
    }
}

pub struct NetTunTxToken<'a> {
    queue: &'a mut Vec<Vec<u8>>,
}

impl<'a> TxToken for NetTunTxToken<'a> {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        self.queue.push(buffer);
        result
    }
}

impl Device for NetTun {
    type RxToken<'a> = NetTunRxToken;
    type TxToken<'a> = NetTunTxToken<'a>;

    fn receive(&mut self, _timestamp: Instant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let packet = self.inbound.pop_front()?;
        Some((
            NetTunRxToken { buffer: packet },
            NetTunTxToken {
                queue: &mut self.outbound,
            },
        ))
    }

    fn transmit(&mut self, _timestamp: Instant) -> Option<Self::TxToken<'_>> {
        Some(NetTunTxToken {
            queue: &mut self.outbound,
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}
