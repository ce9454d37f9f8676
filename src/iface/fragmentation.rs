use core::fmt;

use alloc::vec::Vec;

use crate::config::REASSEMBLY_QUEUE_COUNT;
use crate::iface::timer::{Event, Match, TimerQueue};
use crate::phy::IfIndex;
use crate::storage::{BufferPool, PacketBuf};
use crate::time::{Duration, Instant};
use crate::wire::{
    ICMPV4_QUOTE_PAYLOAD_LEN, IPV4_MAX_HEADER_LEN, Ipv4FragKey, Ipv4Packet, checksum,
};

/// Error returned by [`Ipv4Reassembler::reassemble_packet`].
///
/// The fragment handed in has been released in every case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassemblyError {
    /// The fragment reaches beyond the largest datagram the device accepts.
    Oversize,
    /// An unfragmented datagram arrived while fragments with the same key were queued.
    HeaderError,
    /// No reassembly queue slot is free.
    Exhausted,
    /// The IPv4 header could not be parsed.
    Malformed,
}

impl fmt::Display for ReassemblyError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ReassemblyError::Oversize => write!(f, "datagram too big for reassembly"),
            ReassemblyError::HeaderError => {
                write!(f, "unfragmented datagram with queued fragments")
            }
            ReassemblyError::Exhausted => write!(f, "reassembly queues exhausted"),
            ReassemblyError::Malformed => write!(f, "malformed IPv4 header"),
        }
    }
}

impl core::error::Error for ReassemblyError {}

/// Reassembly counters, as kept by the IP MIB.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyStats {
    /// Fragments that needed reassembly.
    pub reasm_reqds: u32,
    /// Datagrams successfully reassembled.
    pub reasm_oks: u32,
    /// Failures: oversize, header errors, exhaustion and timeouts.
    pub reasm_fails: u32,
    /// Datagrams discarded for header errors.
    pub in_hdr_errors: u32,
}

/// Outcome of handing a datagram to the reassembler.
#[derive(Debug, PartialEq, Eq)]
pub enum Received {
    /// A datagram ready for the upper layer: either it was never fragmented,
    /// or this fragment completed it.
    Datagram(PacketBuf),
    /// The fragment was queued, or discarded as a duplicate.
    Pending,
}

/// A queue that ran out of time before completing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedOut {
    pub key: Ipv4FragKey,
    /// Device the first fragment arrived on.
    pub device: Option<IfIndex>,
    /// Header plus leading payload octets of the zero-offset fragment, when it
    /// had arrived; this is what an ICMP Time Exceeded message quotes.
    pub quote: Option<heapless::Vec<u8, { IPV4_MAX_HEADER_LEN + ICMPV4_QUOTE_PAYLOAD_LEN }>>,
}

/// One stored fragment. The buffer's data starts at the fragment payload; the
/// IPv4 header is kept as headroom in front of it.
#[derive(Debug)]
struct Fragment {
    offset: usize,
    len: usize,
    more_frags: bool,
    header_len: usize,
    buf: PacketBuf,
}

impl Fragment {
    fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Fragments of one datagram, ordered by offset.
#[derive(Debug)]
struct FragmentQueue {
    key: Option<Ipv4FragKey>,
    frags: Vec<Fragment>,
}

impl FragmentQueue {
    const fn new() -> Self {
        Self {
            key: None,
            frags: Vec::new(),
        }
    }

    /// Returns `true` when the queue slot is free to use.
    fn is_free(&self) -> bool {
        self.key.is_none()
    }

    /// Contiguous from offset zero with the last fragment closing the datagram.
    /// Returns the payload length when complete.
    fn complete_len(&self) -> Option<usize> {
        let mut next = 0;
        for frag in &self.frags {
            if frag.offset != next {
                return None;
            }
            next += frag.len;
        }
        match self.frags.last() {
            Some(last) if !last.more_frags => Some(next),
            _ => None,
        }
    }
}

/// Collects IPv4 fragments into complete datagrams.
///
/// Each datagram under reassembly occupies one of a fixed number of queue
/// slots and owns one timer in the [`TimerQueue`], tokened by its slot index.
#[derive(Debug)]
pub struct Ipv4Reassembler {
    queues: [FragmentQueue; REASSEMBLY_QUEUE_COUNT],
    ttl: Duration,
    stats: ReassemblyStats,
}

impl Ipv4Reassembler {
    const NEW_QUEUE: FragmentQueue = FragmentQueue::new();

    /// Create a reassembler whose queues live for `ttl` after their first fragment.
    pub fn new(ttl: Duration) -> Self {
        Self {
            queues: [Self::NEW_QUEUE; REASSEMBLY_QUEUE_COUNT],
            ttl,
            stats: ReassemblyStats::default(),
        }
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    /// Return the number of datagrams under reassembly.
    pub fn pending(&self) -> usize {
        self.queues.iter().filter(|q| !q.is_free()).count()
    }

    /// Query whether fragments with this key are queued.
    pub fn contains(&self, key: &Ipv4FragKey) -> bool {
        self.find(key).is_some()
    }

    fn find(&self, key: &Ipv4FragKey) -> Option<usize> {
        self.queues
            .iter()
            .position(|q| q.key.as_ref() == Some(key))
    }

    /// Hand an IPv4 datagram to the reassembler.
    ///
    /// Datagrams that are not fragments, and have no queue of fragments under
    /// their key, are passed back untouched. Fragments are stored, trimming any
    /// overlap with what is already queued, until the datagram is complete; the
    /// complete datagram is then returned with its header restored.
    ///
    /// `max_size` is the device's reassembly limit. A fragment whose offset
    /// plus total length (header included) goes beyond it is refused.
    pub fn reassemble_packet(
        &mut self,
        pool: &mut BufferPool,
        timers: &mut TimerQueue,
        now: Instant,
        mut buf: PacketBuf,
        max_size: usize,
    ) -> Result<Received, ReassemblyError> {
        let (key, offset, more_frags, header_len, total_len) = {
            let packet = Ipv4Packet::new_unchecked(pool.head(&buf));
            if packet.check_header_len().is_err() || packet.version() != 4 {
                pool.free(buf);
                return Err(ReassemblyError::Malformed);
            }
            (
                packet.get_key(),
                packet.frag_offset() as usize,
                packet.more_frags(),
                packet.header_len() as usize,
                packet.total_len() as usize,
            )
        };
        if buf.len() < total_len {
            net_debug!("ipv4 reassembly: truncated datagram {}", key);
            pool.free(buf);
            return Err(ReassemblyError::Malformed);
        }

        let slot = self.find(&key);
        let is_fragment = more_frags || offset != 0;
        if !is_fragment && slot.is_none() {
            return Ok(Received::Datagram(buf));
        }

        self.stats.reasm_reqds += 1;
        if offset + total_len > max_size {
            net_debug!(
                "ipv4 reassembly: {} exceeds {} octets, dropping",
                key,
                max_size
            );
            pool.free(buf);
            if let Some(slot) = slot {
                self.free_queue(pool, timers, slot);
            }
            self.stats.reasm_fails += 1;
            return Err(ReassemblyError::Oversize);
        }

        if !is_fragment {
            if let Some(slot) = slot {
                self.free_queue(pool, timers, slot);
            }
            pool.free(buf);
            self.stats.in_hdr_errors += 1;
            self.stats.reasm_fails += 1;
            return Err(ReassemblyError::HeaderError);
        }

        pool.truncate(&mut buf, total_len);
        if pool.pull(&mut buf, header_len).is_err() {
            pool.free(buf);
            self.stats.reasm_fails += 1;
            return Err(ReassemblyError::Malformed);
        }

        let frag = Fragment {
            offset,
            len: total_len - header_len,
            more_frags,
            header_len,
            buf,
        };

        let slot = match slot {
            Some(slot) => {
                self.insert(pool, slot, frag);
                slot
            }
            None => match self.queues.iter().position(FragmentQueue::is_free) {
                Some(slot) => {
                    let queue = &mut self.queues[slot];
                    queue.key = Some(key);
                    queue.frags.push(frag);
                    if timers
                        .set(Event::Ipv4Reassembly, slot as u32, now + self.ttl, 0)
                        .is_err()
                    {
                        net_error!("ipv4 reassembly: no timer for queue {}", slot);
                    }
                    slot
                }
                None => {
                    net_error!("ipv4 reassembly: no free queue for {}", key);
                    pool.free(frag.buf);
                    self.stats.reasm_fails += 1;
                    return Err(ReassemblyError::Exhausted);
                }
            },
        };

        match self.queues[slot].complete_len() {
            Some(len) => self.assemble(pool, timers, slot, len),
            None => Ok(Received::Pending),
        }
    }

    /// Merge a fragment into an existing queue.
    fn insert(&mut self, pool: &mut BufferPool, slot: usize, mut frag: Fragment) {
        let frags = &mut self.queues[slot].frags;

        // First stored fragment that starts after the new one.
        let mut position = frags
            .iter()
            .position(|q| q.offset > frag.offset)
            .unwrap_or(frags.len());

        if position > 0 {
            let prev = &frags[position - 1];
            if prev.end() > frag.offset {
                let overlap = prev.end() - frag.offset;
                if overlap >= frag.len {
                    net_trace!("ipv4 reassembly: duplicate fragment at {}", frag.offset);
                    pool.free(frag.buf);
                    return;
                }
                pool.trim_front(&mut frag.buf, overlap);
                frag.offset += overlap;
                frag.len -= overlap;
            }
        }

        while position < frags.len() && frag.end() > frags[position].offset {
            let next = &mut frags[position];
            let overlap = frag.end() - next.offset;
            if overlap < next.len {
                pool.trim_front(&mut next.buf, overlap);
                next.offset += overlap;
                next.len -= overlap;
                break;
            }
            let covered = frags.remove(position);
            pool.free(covered.buf);
        }

        frags.insert(position, frag);
    }

    /// Join a complete queue into one datagram and release the queue.
    fn assemble(
        &mut self,
        pool: &mut BufferPool,
        timers: &mut TimerQueue,
        slot: usize,
        payload_len: usize,
    ) -> Result<Received, ReassemblyError> {
        timers.unset(Event::Ipv4Reassembly, Match::Exact, slot as u32, 0);
        let queue = &mut self.queues[slot];
        let key = queue.key.take();
        let mut frags = core::mem::take(&mut queue.frags).into_iter();

        let Some(first) = frags.next() else {
            return Ok(Received::Pending);
        };
        let header_len = first.header_len;
        let mut head = first.buf;
        for frag in frags {
            let mut buf = frag.buf;
            if let Some(sum) = buf.take_checksum_sum() {
                let merged = match head.checksum_sum() {
                    Some(acc) => checksum::combine(&[checksum::fold(acc), checksum::fold(sum)]),
                    None => checksum::fold(sum),
                };
                head.set_checksum_sum(Some(merged as u32));
            }
            pool.cat(&mut head, buf);
        }

        let total_len = header_len + payload_len;
        if total_len > u16::MAX as usize || pool.push(&mut head, header_len).is_err() {
            pool.free(head);
            self.stats.reasm_fails += 1;
            return Err(ReassemblyError::Malformed);
        }

        {
            let mut packet = Ipv4Packet::new_unchecked(pool.head_mut(&head));
            packet.set_total_len(total_len as u16);
            packet.set_more_frags(false);
            packet.set_frag_offset(0);
            packet.fill_checksum();
        }

        self.stats.reasm_oks += 1;
        if let Some(key) = key {
            net_trace!("ipv4 reassembly: {} complete, {} octets", key, total_len);
        }
        Ok(Received::Datagram(head))
    }

    /// Release a queue: cancel its timer and free every fragment.
    pub fn free_queue(&mut self, pool: &mut BufferPool, timers: &mut TimerQueue, slot: usize) {
        let Some(queue) = self.queues.get_mut(slot) else {
            return;
        };
        timers.unset(Event::Ipv4Reassembly, Match::Exact, slot as u32, 0);
        queue.key = None;
        for frag in queue.frags.drain(..) {
            pool.free(frag.buf);
        }
    }

    /// Handle the expiry of the timer with the given token.
    ///
    /// Counts a failure, releases the queue, and returns what an ICMP Time
    /// Exceeded report needs. Returns `None` if the slot was already free.
    pub fn expire(
        &mut self,
        pool: &mut BufferPool,
        timers: &mut TimerQueue,
        token: u32,
    ) -> Option<TimedOut> {
        let slot = token as usize;
        let queue = self.queues.get_mut(slot)?;
        let key = queue.key?;
        self.stats.reasm_fails += 1;

        let mut device = None;
        let mut quote = None;
        if let Some(first) = queue.frags.first_mut() {
            device = first.buf.device();
            if first.offset == 0 && pool.push(&mut first.buf, first.header_len).is_ok() {
                let mut data = heapless::Vec::new();
                let want = first.header_len + first.len.min(ICMPV4_QUOTE_PAYLOAD_LEN);
                let mut octets = [0u8; IPV4_MAX_HEADER_LEN + ICMPV4_QUOTE_PAYLOAD_LEN];
                let got = pool.copy_out(&first.buf, 0, &mut octets[..want]);
                if data.extend_from_slice(&octets[..got]).is_ok() {
                    quote = Some(data);
                }
            }
        }

        net_debug!("ipv4 reassembly: {} timed out", key);
        self.free_queue(pool, timers, slot);
        Some(TimedOut { key, device, quote })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::storage::Node;
    use crate::wire::{IpProtocol, Ipv4Address};
    use std::vec::Vec;

    const SRC: Ipv4Address = Ipv4Address::new(10, 0, 0, 1);
    const DST: Ipv4Address = Ipv4Address::new(10, 0, 0, 2);

    struct Harness {
        pool: BufferPool<'static>,
        timers: TimerQueue,
        reasm: Ipv4Reassembler,
    }

    impl Harness {
        fn new() -> Harness {
            crate::tests::setup();
            Harness {
                pool: BufferPool::new(std::vec![Node::EMPTY; 64]),
                timers: TimerQueue::new(),
                reasm: Ipv4Reassembler::new(Duration::from_secs(60)),
            }
        }

        fn feed(
            &mut self,
            now: Instant,
            id: u16,
            offset: usize,
            more: bool,
            payload: &[u8],
        ) -> Result<Received, ReassemblyError> {
            let buf = fragment(&mut self.pool, id, offset, more, payload);
            self.reasm
                .reassemble_packet(&mut self.pool, &mut self.timers, now, buf, 65535)
        }
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    fn fragment(
        pool: &mut BufferPool,
        id: u16,
        offset: usize,
        more: bool,
        payload: &[u8],
    ) -> PacketBuf {
        fragment_with_header(pool, id, offset, more, payload, 20)
    }

    /// Build a fragment whose header is `header_len` octets, padded with
    /// no-operation options.
    fn fragment_with_header(
        pool: &mut BufferPool,
        id: u16,
        offset: usize,
        more: bool,
        payload: &[u8],
        header_len: usize,
    ) -> PacketBuf {
        let mut bytes = std::vec![1u8; header_len + payload.len()];
        {
            let mut packet = Ipv4Packet::new_unchecked(&mut bytes[..]);
            packet.set_version(4);
            packet.set_header_len(header_len as u8);
            packet.set_dscp_ecn(0);
            packet.set_total_len((header_len + payload.len()) as u16);
            packet.set_ident(id);
            packet.clear_flags();
            packet.set_more_frags(more);
            packet.set_frag_offset(offset as u16);
            packet.set_hop_limit(64);
            packet.set_next_header(IpProtocol::Udp);
            packet.set_src_addr(SRC);
            packet.set_dst_addr(DST);
            packet.fill_checksum();
        }
        bytes[header_len..].copy_from_slice(payload);
        let mut buf = pool.alloc(bytes.len()).unwrap();
        pool.append(&mut buf, &bytes).unwrap();
        buf.set_device(1);
        buf
    }

    fn datagram(harness: &mut Harness, result: Result<Received, ReassemblyError>) -> Vec<u8> {
        match result {
            Ok(Received::Datagram(buf)) => {
                let data = harness.pool.to_vec(&buf);
                harness.pool.free(buf);
                data
            }
            other => panic!("expected a datagram, got {other:?}"),
        }
    }

    #[test]
    fn test_unfragmented_passes_through() {
        let mut h = Harness::new();
        let data = payload(40);
        let result = h_feed(&mut h, 1, 0, false, &data);
        let bytes = datagram(&mut h, result);
        assert_eq!(&bytes[20..], &data[..]);
        assert_eq!(h.reasm.stats().reasm_reqds, 0);
        assert_eq!(h.pool.free_nodes(), 64);
    }

    fn h_feed(
        h: &mut Harness,
        id: u16,
        offset: usize,
        more: bool,
        payload: &[u8],
    ) -> Result<Received, ReassemblyError> {
        h.feed(Instant::ZERO, id, offset, more, payload)
    }

    #[test]
    fn test_in_order() {
        let mut h = Harness::new();
        let data = payload(1480 * 2 + 100);
        assert_eq!(h_feed(&mut h, 7, 0, true, &data[..1480]), Ok(Received::Pending));
        assert_eq!(h.timers.len(), 1);
        assert_eq!(
            h_feed(&mut h, 7, 1480, true, &data[1480..2960]),
            Ok(Received::Pending)
        );
        let result = h_feed(&mut h, 7, 2960, false, &data[2960..]);
        let bytes = datagram(&mut h, result);

        let packet = Ipv4Packet::new_checked(&bytes[..]).unwrap();
        assert_eq!(packet.total_len() as usize, 20 + data.len());
        assert!(!packet.more_frags());
        assert_eq!(packet.frag_offset(), 0);
        assert!(packet.verify_checksum());
        assert_eq!(packet.payload(), &data[..]);

        assert!(h.timers.is_empty());
        assert_eq!(h.reasm.pending(), 0);
        assert_eq!(h.reasm.stats().reasm_reqds, 3);
        assert_eq!(h.reasm.stats().reasm_oks, 1);
        assert_eq!(h.pool.free_nodes(), 64);
    }

    #[test]
    fn test_out_of_order() {
        let mut h = Harness::new();
        let data = payload(1200);
        assert_eq!(
            h_feed(&mut h, 9, 800, false, &data[800..]),
            Ok(Received::Pending)
        );
        assert_eq!(h_feed(&mut h, 9, 0, true, &data[..400]), Ok(Received::Pending));
        let result = h_feed(&mut h, 9, 400, true, &data[400..800]);
        let bytes = datagram(&mut h, result);
        assert_eq!(&bytes[20..], &data[..]);
        assert_eq!(h.pool.free_nodes(), 64);
    }

    #[test]
    fn test_duplicate_discarded() {
        let mut h = Harness::new();
        let data = payload(800);
        assert_eq!(h_feed(&mut h, 3, 0, true, &data[..400]), Ok(Received::Pending));
        assert_eq!(h_feed(&mut h, 3, 0, true, &data[..400]), Ok(Received::Pending));
        let result = h_feed(&mut h, 3, 400, false, &data[400..]);
        let bytes = datagram(&mut h, result);
        assert_eq!(&bytes[20..], &data[..]);
        assert_eq!(h.pool.free_nodes(), 64);
    }

    #[test]
    fn test_overlap_trimmed() {
        let mut h = Harness::new();
        let data = payload(32);
        // [0, 16), [8, 24) overlaps the tail of the first, [24, 32) closes.
        assert_eq!(h_feed(&mut h, 5, 0, true, &data[..16]), Ok(Received::Pending));
        assert_eq!(h_feed(&mut h, 5, 8, true, &data[8..24]), Ok(Received::Pending));
        let result = h_feed(&mut h, 5, 24, false, &data[24..]);
        let bytes = datagram(&mut h, result);
        assert_eq!(bytes.len(), 20 + 32);
        assert_eq!(&bytes[20..], &data[..]);
        assert_eq!(h.pool.free_nodes(), 64);
    }

    #[test]
    fn test_overlap_covers_following() {
        let mut h = Harness::new();
        let data = payload(48);
        assert_eq!(h_feed(&mut h, 5, 16, true, &data[16..24]), Ok(Received::Pending));
        assert_eq!(h_feed(&mut h, 5, 24, true, &data[24..40]), Ok(Received::Pending));
        // Covers [16, 24) entirely and the front of [24, 40).
        assert_eq!(h_feed(&mut h, 5, 8, true, &data[8..32]), Ok(Received::Pending));
        assert_eq!(h_feed(&mut h, 5, 40, false, &data[40..]), Ok(Received::Pending));
        let result = h_feed(&mut h, 5, 0, true, &data[..8]);
        let bytes = datagram(&mut h, result);
        assert_eq!(&bytes[20..], &data[..]);
        assert_eq!(h.pool.free_nodes(), 64);
    }

    #[test]
    fn test_first_fragment_overlapping_next() {
        let mut h = Harness::new();
        let data = payload(24);
        assert_eq!(h_feed(&mut h, 2, 8, false, &data[8..]), Ok(Received::Pending));
        let result = h_feed(&mut h, 2, 0, true, &data[..16]);
        let bytes = datagram(&mut h, result);
        assert_eq!(&bytes[20..], &data[..]);
        assert_eq!(h.pool.free_nodes(), 64);
    }

    #[test]
    fn test_oversize_frees_queue() {
        let mut h = Harness::new();
        let data = payload(400);
        assert_eq!(h_feed(&mut h, 4, 0, true, &data), Ok(Received::Pending));
        let buf = fragment(&mut h.pool, 4, 400, false, &data);
        let result = h
            .reasm
            .reassemble_packet(&mut h.pool, &mut h.timers, Instant::ZERO, buf, 576);
        assert_eq!(result, Err(ReassemblyError::Oversize));
        assert_eq!(h.reasm.pending(), 0);
        assert!(h.timers.is_empty());
        assert_eq!(h.reasm.stats().reasm_fails, 1);
        assert_eq!(h.pool.free_nodes(), 64);
    }

    #[test]
    fn test_oversize_counts_options() {
        let mut h = Harness::new();
        let data = payload(8);
        // 568 + 20 + 8 fits in 598 octets, 568 + 24 + 8 does not.
        let buf = fragment_with_header(&mut h.pool, 6, 568, true, &data, 20);
        let result = h
            .reasm
            .reassemble_packet(&mut h.pool, &mut h.timers, Instant::ZERO, buf, 598);
        assert_eq!(result, Ok(Received::Pending));

        let buf = fragment_with_header(&mut h.pool, 6, 568, true, &data, 24);
        let result = h
            .reasm
            .reassemble_packet(&mut h.pool, &mut h.timers, Instant::ZERO, buf, 598);
        assert_eq!(result, Err(ReassemblyError::Oversize));
        assert_eq!(h.reasm.pending(), 0);
        assert_eq!(h.reasm.stats().reasm_fails, 1);
        assert_eq!(h.pool.free_nodes(), 64);
    }

    #[test]
    fn test_every_arrival_order() {
        const COUNT: usize = 4;
        let data = payload(COUNT * 64);
        // Each number below 4! picks one ordering of the fragments.
        for mut code in 0..24 {
            let mut left: Vec<usize> = (0..COUNT).collect();
            let mut order = Vec::new();
            for radix in (1..=COUNT).rev() {
                order.push(left.remove(code % radix));
                code /= radix;
            }

            let mut h = Harness::new();
            let mut result: Result<Received, ReassemblyError> = Ok(Received::Pending);
            for (step, &index) in order.iter().enumerate() {
                assert_eq!(result, Ok(Received::Pending), "order {order:?} step {step}");
                let offset = index * 64;
                let more = index != COUNT - 1;
                result = h_feed(&mut h, 12, offset, more, &data[offset..offset + 64]);
            }
            let bytes = datagram(&mut h, result);
            let packet = Ipv4Packet::new_checked(&bytes[..]).unwrap();
            assert!(packet.verify_checksum(), "order {order:?}");
            assert_eq!(packet.payload(), &data[..], "order {order:?}");
            assert_eq!(h.reasm.pending(), 0);
            assert!(h.timers.is_empty());
            assert_eq!(h.pool.free_nodes(), 64);
        }
    }

    #[test]
    fn test_unfragmented_with_queue_is_header_error() {
        let mut h = Harness::new();
        let data = payload(64);
        assert_eq!(h_feed(&mut h, 8, 0, true, &data[..32]), Ok(Received::Pending));
        assert_eq!(
            h_feed(&mut h, 8, 0, false, &data),
            Err(ReassemblyError::HeaderError)
        );
        assert_eq!(h.reasm.stats().in_hdr_errors, 1);
        assert_eq!(h.reasm.pending(), 0);
        assert_eq!(h.pool.free_nodes(), 64);
    }

    #[test]
    fn test_timeout_reports_first_fragment() {
        let mut h = Harness::new();
        let data = payload(64);
        assert_eq!(h_feed(&mut h, 6, 0, true, &data[..32]), Ok(Received::Pending));

        assert_eq!(h.timers.pop_expired(Instant::from_secs(59)), None);
        let expired = h.timers.pop_expired(Instant::from_secs(60)).unwrap();
        assert_eq!(expired.event, Event::Ipv4Reassembly);
        let timed_out = h
            .reasm
            .expire(&mut h.pool, &mut h.timers, expired.token)
            .unwrap();

        assert_eq!(timed_out.key.src_addr(), SRC);
        assert_eq!(timed_out.device, Some(1));
        let quote = timed_out.quote.unwrap();
        assert_eq!(quote.len(), 28);
        assert_eq!(&quote[20..], &data[..8]);
        assert_eq!(h.reasm.stats().reasm_fails, 1);
        assert_eq!(h.reasm.pending(), 0);
        assert_eq!(h.pool.free_nodes(), 64);
    }

    #[test]
    fn test_timeout_without_first_fragment() {
        let mut h = Harness::new();
        let data = payload(64);
        assert_eq!(
            h_feed(&mut h, 6, 32, false, &data[32..]),
            Ok(Received::Pending)
        );
        let expired = h.timers.pop_expired(Instant::from_secs(61)).unwrap();
        let timed_out = h
            .reasm
            .expire(&mut h.pool, &mut h.timers, expired.token)
            .unwrap();
        assert_eq!(timed_out.quote, None);
        assert_eq!(h.pool.free_nodes(), 64);
        assert_eq!(h.reasm.expire(&mut h.pool, &mut h.timers, expired.token), None);
    }

    #[test]
    fn test_queues_exhausted() {
        let mut h = Harness::new();
        let data = payload(8);
        for id in 0..REASSEMBLY_QUEUE_COUNT as u16 {
            assert_eq!(h_feed(&mut h, id, 0, true, &data), Ok(Received::Pending));
        }
        assert_eq!(
            h_feed(&mut h, 999, 0, true, &data),
            Err(ReassemblyError::Exhausted)
        );
        assert_eq!(h.reasm.pending(), REASSEMBLY_QUEUE_COUNT);
        for slot in 0..REASSEMBLY_QUEUE_COUNT {
            h.reasm.free_queue(&mut h.pool, &mut h.timers, slot);
        }
        assert!(h.timers.is_empty());
        assert_eq!(h.pool.free_nodes(), 64);
    }

    #[test]
    fn test_checksum_sums_merged_into_head() {
        let mut h = Harness::new();
        let data = payload(16);
        let first = fragment(&mut h.pool, 1, 0, true, &data[..8]);
        let mut second = fragment(&mut h.pool, 1, 8, false, &data[8..]);
        second.set_checksum_sum(Some(0x1234));
        assert_eq!(
            h.reasm
                .reassemble_packet(&mut h.pool, &mut h.timers, Instant::ZERO, first, 65515),
            Ok(Received::Pending)
        );
        let result =
            h.reasm
                .reassemble_packet(&mut h.pool, &mut h.timers, Instant::ZERO, second, 65515);
        match result {
            Ok(Received::Datagram(buf)) => {
                assert_eq!(buf.checksum_sum(), Some(0x1234));
                h.pool.free(buf);
            }
            other => panic!("expected a datagram, got {other:?}"),
        }
    }
}
