use core::fmt;

use heapless::Deque;

use super::device::Registry;
use super::fragmentation::{Ipv4Reassembler, ReassemblyStats, Received, TimedOut};
use super::multilink::{LinkRemoved, MpError, Multilink, MultilinkConfig};
use super::timer::{Event, TimerQueue};
use crate::config::IFACE_RX_QUEUE_DEPTH;
use crate::phy::{IfIndex, LinkOutput, NetworkLayer};
use crate::storage::{BufferPool, PacketBuf};
use crate::time::{Duration, Instant};
use crate::wire::{
    ICMPV4_HEADER_LEN, ICMPV4_QUOTE_PAYLOAD_LEN, IPV4_HEADER_LEN, IPV4_MAX_HEADER_LEN,
    Icmpv4Packet, Icmpv4Repr, Icmpv4TimeExceeded, IpProtocol, Ipv4Packet, Ipv4Repr, PppProtocol,
};

/// Runtime configuration of an [`Interface`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// How long an incomplete IPv4 datagram is held before it is dropped.
    pub ip_frag_ttl: Duration,
    pub multilink: MultilinkConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ip_frag_ttl: Duration::from_secs(60),
            multilink: MultilinkConfig::default(),
        }
    }
}

/// Error returned by [`Interface::receive`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveError {
    /// The buffer pool could not hold the frame.
    NoBuffers,
    /// The inbound list is full.
    QueueFull,
}

impl fmt::Display for ReceiveError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ReceiveError::NoBuffers => write!(f, "no buffers"),
            ReceiveError::QueueFull => write!(f, "inbound list full"),
        }
    }
}

impl core::error::Error for ReceiveError {}

/// Whether a call to [`Interface::poll`] handed anything to the network layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollResult {
    /// Nothing was delivered.
    None,
    /// At least one packet or ICMP message was handed up.
    Delivered,
}

/// An entry of the inbound list.
#[derive(Debug)]
enum Inbound {
    /// A PPP frame, starting with its protocol field.
    Frame(PacketBuf),
    /// An IPv4 datagram completed by reassembly.
    Ipv4(PacketBuf),
}

/// A PPP network interface.
///
/// The interface owns the buffer pool, the device registry and both
/// reassembly engines. Link drivers queue received frames with
/// [`receive`](#method.receive); [`poll`](#method.poll) fires expired timers
/// and works the inbound list, handing finished packets to a [`NetworkLayer`].
#[derive(Debug)]
pub struct Interface<'a> {
    pool: BufferPool<'a>,
    registry: Registry,
    timers: TimerQueue,
    ipv4: Ipv4Reassembler,
    multilink: Multilink,
    inbound: Deque<Inbound, IFACE_RX_QUEUE_DEPTH>,
}

impl<'a> Interface<'a> {
    pub fn new(config: Config, pool: BufferPool<'a>) -> Interface<'a> {
        Interface {
            pool,
            registry: Registry::new(),
            timers: TimerQueue::new(),
            ipv4: Ipv4Reassembler::new(config.ip_frag_ttl),
            multilink: Multilink::new(config.multilink),
            inbound: Deque::new(),
        }
    }

    pub fn pool(&self) -> &BufferPool<'a> {
        &self.pool
    }

    pub fn pool_mut(&mut self) -> &mut BufferPool<'a> {
        &mut self.pool
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn multilink(&self) -> &Multilink {
        &self.multilink
    }

    /// Give mutable access to the Multilink context together with the
    /// collaborators its operations take.
    pub fn multilink_mut(&mut self) -> (&mut Multilink, &mut BufferPool<'a>, &mut Registry) {
        (&mut self.multilink, &mut self.pool, &mut self.registry)
    }

    pub fn ipv4_stats(&self) -> ReassemblyStats {
        self.ipv4.stats()
    }

    /// Return the time at which [`poll`](#method.poll) should next be called
    /// to fire timers.
    pub fn poll_at(&self) -> Option<Instant> {
        self.timers.poll_at()
    }

    /// Queue a frame received on `link`. The frame starts with the PPP
    /// protocol field.
    pub fn receive(&mut self, link: IfIndex, frame: &[u8]) -> Result<(), ReceiveError> {
        let mut buf = self
            .pool
            .alloc(frame.len())
            .map_err(|_| ReceiveError::NoBuffers)?;
        if self.pool.append(&mut buf, frame).is_err() {
            self.pool.free(buf);
            return Err(ReceiveError::NoBuffers);
        }
        buf.set_device(link);
        if let Err(Inbound::Frame(buf) | Inbound::Ipv4(buf)) =
            self.inbound.push_back(Inbound::Frame(buf))
        {
            self.pool.free(buf);
            return Err(ReceiveError::QueueFull);
        }
        Ok(())
    }

    /// Send `packet` of the given protocol on the virtual interface
    /// `virtual_if`. The packet is consumed.
    pub fn send<L>(
        &mut self,
        virtual_if: IfIndex,
        packet: PacketBuf,
        protocol: PppProtocol,
        links: &mut L,
    ) -> Result<(), MpError>
    where
        L: LinkOutput + ?Sized,
    {
        self.multilink
            .output(&mut self.pool, &self.registry, virtual_if, packet, protocol, links)
    }

    /// Put a link that negotiated Multilink into its bundle.
    pub fn add_link(
        &mut self,
        link: IfIndex,
        virtual_if: Option<IfIndex>,
    ) -> Result<IfIndex, MpError> {
        self.multilink.add_link(&mut self.registry, link, virtual_if)
    }

    pub fn remove_link(&mut self, link: IfIndex) -> Result<(IfIndex, LinkRemoved), MpError> {
        self.multilink
            .remove_link(&mut self.pool, &mut self.registry, link)
    }

    /// Fire the timers due at `now`, then process the inbound list until it
    /// is empty.
    pub fn poll<U>(&mut self, now: Instant, upper: &mut U) -> PollResult
    where
        U: NetworkLayer + ?Sized,
    {
        let mut result = PollResult::None;

        while let Some(expired) = self.timers.pop_expired(now) {
            match expired.event {
                Event::Ipv4Reassembly => {
                    let timed_out = self
                        .ipv4
                        .expire(&mut self.pool, &mut self.timers, expired.token);
                    if let Some(timed_out) = timed_out {
                        if self.time_exceeded(&timed_out, upper) {
                            result = PollResult::Delivered;
                        }
                    }
                }
            }
        }

        while let Some(entry) = self.inbound.pop_front() {
            let delivered = match entry {
                Inbound::Frame(frame) => self.ppp_input(now, frame, upper),
                Inbound::Ipv4(datagram) => match datagram.device() {
                    Some(device) => {
                        upper.ipv4_input(&mut self.pool, device, datagram);
                        true
                    }
                    None => {
                        self.pool.free(datagram);
                        false
                    }
                },
            };
            if delivered {
                result = PollResult::Delivered;
            }
        }
        result
    }

    /// Put an entry at the head of the inbound list, so it is processed next.
    fn requeue(&mut self, entry: Inbound) {
        if let Err(Inbound::Frame(buf) | Inbound::Ipv4(buf)) = self.inbound.push_front(entry) {
            net_error!("iface: inbound list full, dropping reassembled packet");
            self.pool.free(buf);
        }
    }

    fn ppp_input<U>(&mut self, now: Instant, mut frame: PacketBuf, upper: &mut U) -> bool
    where
        U: NetworkLayer + ?Sized,
    {
        let Some(device) = frame.device() else {
            self.pool.free(frame);
            return false;
        };
        let Ok((protocol, field_len)) = PppProtocol::parse(self.pool.head(&frame)) else {
            net_debug!("iface: bad protocol field on device {}", device);
            self.pool.free(frame);
            return false;
        };
        if self.pool.pull(&mut frame, field_len).is_err() {
            self.pool.free(frame);
            return false;
        }
        net_trace!("iface: {} frame on device {}", protocol, device);

        match protocol {
            PppProtocol::Multilink => {
                let completed =
                    self.multilink
                        .new_fragment(&mut self.pool, &mut self.registry, frame);
                if let Some(frame) = completed {
                    self.requeue(Inbound::Frame(frame));
                }
                false
            }
            PppProtocol::Ipv4 => self.ipv4_input(now, device, frame, upper),
            PppProtocol::Ipv6 => {
                upper.ipv6_input(&mut self.pool, device, frame);
                true
            }
            _ => {
                upper.control_input(&mut self.pool, device, protocol, frame);
                true
            }
        }
    }

    fn ipv4_input<U>(
        &mut self,
        now: Instant,
        device: IfIndex,
        frame: PacketBuf,
        upper: &mut U,
    ) -> bool
    where
        U: NetworkLayer + ?Sized,
    {
        let fragmented = Ipv4Packet::new_checked(self.pool.head(&frame))
            .is_ok_and(|packet| packet.more_frags() || packet.frag_offset() != 0);
        let max_size = self
            .registry
            .devices
            .get(device)
            .map_or(0, |device| device.reasm_max_size);

        match self
            .ipv4
            .reassemble_packet(&mut self.pool, &mut self.timers, now, frame, max_size)
        {
            Ok(Received::Datagram(datagram)) if fragmented => {
                self.requeue(Inbound::Ipv4(datagram));
                false
            }
            Ok(Received::Datagram(datagram)) => {
                upper.ipv4_input(&mut self.pool, device, datagram);
                true
            }
            Ok(Received::Pending) => false,
            Err(err) => {
                net_debug!("iface: IPv4 datagram on device {} dropped: {}", device, err);
                false
            }
        }
    }

    /// Report a timed-out reassembly to the sender with an ICMP Time
    /// Exceeded message, when the first fragment had arrived.
    fn time_exceeded<U>(&mut self, timed_out: &TimedOut, upper: &mut U) -> bool
    where
        U: NetworkLayer + ?Sized,
    {
        let Some(quote) = timed_out.quote.as_ref() else {
            return false;
        };
        let icmp_repr = Icmpv4Repr::TimeExceeded {
            reason: Icmpv4TimeExceeded::FragExpired,
            quote: quote.as_slice(),
        };
        let ip_repr = Ipv4Repr {
            src_addr: timed_out.key.dst_addr(),
            dst_addr: timed_out.key.src_addr(),
            next_header: IpProtocol::Icmp,
            payload_len: icmp_repr.buffer_len(),
            hop_limit: 64,
        };

        const MAX_LEN: usize =
            IPV4_HEADER_LEN + ICMPV4_HEADER_LEN + IPV4_MAX_HEADER_LEN + ICMPV4_QUOTE_PAYLOAD_LEN;
        let mut bytes = [0u8; MAX_LEN];
        let total = ip_repr.buffer_len() + icmp_repr.buffer_len();
        let (header, payload) = bytes[..total].split_at_mut(ip_repr.buffer_len());
        ip_repr.emit(&mut Ipv4Packet::new_unchecked(header));
        icmp_repr.emit(&mut Icmpv4Packet::new_unchecked(payload));

        let Ok(mut packet) = self.pool.alloc(total) else {
            net_error!("iface: no buffer for ICMP time exceeded");
            return false;
        };
        if self.pool.append(&mut packet, &bytes[..total]).is_err() {
            self.pool.free(packet);
            return false;
        }
        net_debug!("iface: time exceeded for {} to {}", timed_out.key, ip_repr.dst_addr);
        upper.icmp_output(&mut self.pool, ip_repr.dst_addr, packet);
        true
    }
}
