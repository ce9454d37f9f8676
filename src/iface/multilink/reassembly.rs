use alloc::vec::Vec;

use super::{Bundle, MpFragment, Multilink, rx_format};
use crate::iface::device::Registry;
use crate::phy::IfIndex;
use crate::storage::{BufferPool, PacketBuf};
use crate::wire::{MpFlags, MpPacket, MpRepr, MpSeqFormat};

impl Bundle {
    /// Recompute the watermark: the earliest of the latest sequence numbers
    /// seen on the member links. It stays unset until every member link has
    /// delivered a fragment.
    fn update_watermark(&mut self, registry: &Registry, format: MpSeqFormat) {
        let mut watermark = None;
        let mut silent = false;
        let mut links = 0;
        for lower in registry.stack.lowers(self.virtual_if) {
            let Some(device) = registry.devices.get(lower) else {
                continue;
            };
            links += 1;
            let Some(seq) = device.mp_last_seq else {
                silent = true;
                continue;
            };
            watermark = match watermark {
                Some(min) if !format.precedes(seq, min) => Some(min),
                _ => Some(seq),
            };
        }
        if links != self.num_links {
            net_error!(
                "multilink: interface {} has {} links stacked, {} counted",
                self.virtual_if,
                links,
                self.num_links
            );
        }
        self.latest_min_seq = if silent { None } else { watermark };
    }

    /// Query whether every member link has moved past `seq`, so that nothing
    /// older than it can still arrive.
    fn is_behind_watermark(&self, seq: u32, format: MpSeqFormat) -> bool {
        self.latest_min_seq
            .is_some_and(|watermark| format.precedes(seq, watermark))
    }

    /// Release every fragment from the head of the list up to and including
    /// the one at `through`. Returns how many of them carried the End flag.
    fn delete_fragments(&mut self, pool: &mut BufferPool, through: usize) -> usize {
        if self.fragments.is_empty() {
            return 0;
        }
        let through = through.min(self.fragments.len() - 1);
        let mut ends = 0;
        for fragment in self.fragments.drain(..=through) {
            if fragment.flags.contains(MpFlags::END) {
                ends += 1;
            }
            pool.free(fragment.buf);
        }
        net_debug!(
            "multilink: dropped {} stale fragments on interface {}",
            through + 1,
            self.virtual_if
        );
        ends
    }

    /// Look for a run of fragments from a Begin to an End flag without gaps
    /// in sequence, and take it off the list.
    ///
    /// Fragments that can no longer complete are dropped on the way: those
    /// in front of a Begin fragment whose predecessor is behind the
    /// watermark, and any unfinished run ending behind the watermark.
    fn take_complete_run(
        &mut self,
        pool: &mut BufferPool,
        format: MpSeqFormat,
    ) -> Option<Vec<MpFragment>> {
        let mut begin: Option<(usize, u32)> = None;
        let mut counter = 0u32;
        let mut i = 0;

        while self.e_bits > 0 && i < self.fragments.len() {
            counter += 1;
            let (seq, flags) = (self.fragments[i].seq, self.fragments[i].flags);

            if flags.contains(MpFlags::BEGIN) {
                counter = 1;
                if i > 0 && self.is_behind_watermark(self.fragments[i - 1].seq, format) {
                    let ends = self.delete_fragments(pool, i - 1);
                    self.e_bits = self.e_bits.saturating_sub(ends);
                    i = 0;
                }
                begin = Some((i, seq));
            }

            if flags.contains(MpFlags::END) {
                if let Some((start, first)) = begin {
                    if format.distance(first, seq) == counter - 1 {
                        self.e_bits -= 1;
                        return Some(self.fragments.drain(start..=i).collect());
                    }
                }
                if self.is_behind_watermark(seq, format) {
                    let ends = self.delete_fragments(pool, i);
                    self.e_bits = self.e_bits.saturating_sub(ends);
                    begin = None;
                    counter = 0;
                    i = 0;
                    continue;
                }
            }
            i += 1;
        }
        None
    }
}

/// Join a run of fragments into one PPP frame.
///
/// The Multilink header is stripped from each fragment. The frame is copied
/// into a fresh buffer; a compressed protocol field gets its leading zero
/// octet back.
fn make_packet(
    pool: &mut BufferPool,
    run: Vec<MpFragment>,
    header_len: usize,
) -> Option<PacketBuf> {
    let mut fragments = run.into_iter();
    let first = fragments.next()?;
    let device = first.buf.device();
    let mut chain = first.buf;
    pool.trim_front(&mut chain, header_len);
    for fragment in fragments {
        let mut buf = fragment.buf;
        pool.trim_front(&mut buf, header_len);
        pool.cat(&mut chain, buf);
    }

    let total = chain.len();
    let mut packet = match pool.alloc(total + 1) {
        Ok(packet) => packet,
        Err(_) => {
            net_error!("multilink: no buffer for a {} octet frame", total);
            pool.free(chain);
            return None;
        }
    };
    let compressed = pool.byte(&chain, 0).is_some_and(|octet| octet & 1 != 0);
    let copied = if compressed {
        pool.append(&mut packet, &[0]).is_ok()
    } else {
        true
    };
    if !copied || pool.copy_chain(&mut packet, &chain, 0, total).is_err() {
        pool.free(packet);
        pool.free(chain);
        return None;
    }
    pool.free(chain);
    if let Some(device) = device {
        packet.set_device(device);
    }
    Some(packet)
}

impl Multilink {
    /// Take in a fragment received on a member link.
    ///
    /// `buf` starts with the Multilink header and carries the device it
    /// arrived on. It is queued in sequence order with the other fragments of
    /// its bundle. When this completes a frame, the frame is returned,
    /// addressed to the bundle's virtual interface, ready for PPP input.
    pub fn new_fragment(
        &mut self,
        pool: &mut BufferPool,
        registry: &mut Registry,
        buf: PacketBuf,
    ) -> Option<PacketBuf> {
        let Some((link, handle)) = buf
            .device()
            .and_then(|link| Some((link, self.find_bundle_by_device(registry, link)?)))
        else {
            net_debug!("multilink: fragment from a link outside any bundle");
            pool.free(buf);
            return None;
        };
        let Some(bundle) = self.bundle_mut(handle) else {
            pool.free(buf);
            return None;
        };
        let mp_if: IfIndex = bundle.virtual_if;
        let Some(format) = registry.devices.get(mp_if).map(rx_format) else {
            pool.free(buf);
            return None;
        };

        let header = MpRepr::parse(&MpPacket::new_unchecked(pool.head(&buf)), format);
        let Ok(header) = header else {
            net_debug!("multilink: truncated fragment on link {}", link);
            pool.free(buf);
            return None;
        };
        let seq = header.seq_number;

        let previous = match registry.devices.get_mut(link) {
            Some(device) => device.mp_last_seq.replace(seq),
            None => Some(seq),
        };
        if previous.is_none() || previous == bundle.latest_min_seq {
            bundle.update_watermark(registry, format);
        }

        let position = bundle
            .fragments
            .iter()
            .position(|queued| !format.precedes(queued.seq, seq))
            .unwrap_or(bundle.fragments.len());
        if bundle
            .fragments
            .get(position)
            .is_some_and(|queued| queued.seq == seq && seq != 0)
        {
            net_debug!("multilink: duplicate fragment {} on link {}", seq, link);
            pool.free(buf);
            return None;
        }

        net_trace!("multilink: {} from link {}", header, link);
        bundle.fragments.insert(
            position,
            MpFragment {
                seq,
                flags: header.flags,
                buf,
            },
        );
        if header.flags.contains(MpFlags::END) {
            bundle.e_bits += 1;
        }

        let run = bundle.take_complete_run(pool, format)?;
        let mut packet = make_packet(pool, run, format.header_len())?;
        packet.set_device(mp_if);
        Some(packet)
    }
}

#[cfg(test)]
mod test {
    use super::super::test_support::*;
    use super::*;
    use crate::iface::multilink::MultilinkConfig;
    use crate::phy::Capture;
    use std::vec::Vec;

    struct Harness {
        mp: Multilink,
        registry: Registry,
        pool: BufferPool<'static>,
        mp_if: IfIndex,
        a: IfIndex,
        b: IfIndex,
    }

    impl Harness {
        fn new(short_seq: bool) -> Harness {
            crate::tests::setup();
            let mut mp = Multilink::new(MultilinkConfig::default());
            let mut registry = Registry::new();
            let a = add_ppp_link(&mut registry, "ppp0", 64_000, "alice", short_seq);
            let b = add_ppp_link(&mut registry, "ppp1", 64_000, "alice", short_seq);
            let mp_if = mp.add_link(&mut registry, a, None).unwrap();
            mp.add_link(&mut registry, b, None).unwrap();
            Harness {
                mp,
                registry,
                pool: pool(),
                mp_if,
                a,
                b,
            }
        }

        fn format(&self) -> MpSeqFormat {
            rx_format(self.registry.devices.get(self.mp_if).unwrap())
        }

        /// Deliver a raw fragment (Multilink header included) from `link`.
        fn deliver(&mut self, link: IfIndex, frame: &[u8]) -> Option<Vec<u8>> {
            let mut buf = self.pool.alloc(frame.len()).unwrap();
            self.pool.append(&mut buf, frame).unwrap();
            buf.set_device(link);
            let packet = self
                .mp
                .new_fragment(&mut self.pool, &mut self.registry, buf)?;
            assert_eq!(packet.device(), Some(self.mp_if));
            let data = self.pool.to_vec(&packet);
            self.pool.free(packet);
            Some(data)
        }

        fn send(
            &mut self,
            link: IfIndex,
            seq: u32,
            flags: MpFlags,
            payload: &[u8],
        ) -> Option<Vec<u8>> {
            let format = self.format();
            let mut frame = std::vec![0u8; format.header_len()];
            MpRepr {
                flags,
                seq_number: seq,
                format,
            }
            .emit(&mut MpPacket::new_unchecked(&mut frame[..]));
            frame.extend_from_slice(payload);
            self.deliver(link, &frame)
        }

        fn pending(&self) -> usize {
            let handle = self.mp.find_bundle_by_device(&self.registry, self.a).unwrap();
            self.mp.bundle(handle).unwrap().pending_fragments()
        }
    }

    const B: MpFlags = MpFlags::BEGIN;
    const E: MpFlags = MpFlags::END;
    const M: MpFlags = MpFlags::empty();

    #[test]
    fn test_round_trip_through_fragmenter() {
        let mut h = Harness::new(true);
        let mut data = std::vec![0x00, 0x21];
        data.extend((0..998).map(|i| (i % 253) as u8));
        let mut packet = h.pool.alloc(data.len()).unwrap();
        h.pool.append(&mut packet, &data).unwrap();

        let mut capture = Capture::default();
        h.mp
            .fragment_send(&mut h.pool, &h.registry, h.mp_if, packet, &mut capture)
            .unwrap();
        assert_eq!(capture.frames.len(), 3);

        // Link b's fragment overtakes link a's.
        let (a, b) = (h.a, h.b);
        let from_b: Vec<_> = capture.frames.iter().filter(|(l, _)| *l == b).collect();
        let from_a: Vec<_> = capture.frames.iter().filter(|(l, _)| *l == a).collect();
        assert_eq!(h.deliver(b, &from_b[0].1[1..]), None);
        assert_eq!(h.deliver(a, &from_a[0].1[1..]), None);
        assert_eq!(h.deliver(a, &from_a[1].1[1..]), Some(data));
        assert_eq!(h.pending(), 0);
        assert_eq!(h.pool.free_nodes(), NODES);
    }

    #[test]
    fn test_compressed_protocol_is_expanded() {
        let mut h = Harness::new(true);
        let (a, b) = (h.a, h.b);
        assert_eq!(h.send(a, 0, B, &[0x21, 1, 2, 3]), None);
        assert_eq!(
            h.send(b, 1, E, &[4, 5]),
            Some(std::vec![0x00, 0x21, 1, 2, 3, 4, 5])
        );
        assert_eq!(h.pool.free_nodes(), NODES);
    }

    #[test]
    fn test_duplicate_discarded() {
        let mut h = Harness::new(true);
        let (a, b) = (h.a, h.b);
        assert_eq!(h.send(a, 4, B, &[0, 0x21]), None);
        assert_eq!(h.send(a, 4, B, &[0, 0x21]), None);
        assert_eq!(h.pending(), 1);
        assert_eq!(h.send(b, 5, E, &[9]), Some(std::vec![0, 0x21, 9]));
        assert_eq!(h.pool.free_nodes(), NODES);
    }

    #[test]
    fn test_lost_middle_fragment_is_flushed() {
        let mut h = Harness::new(true);
        let (a, b) = (h.a, h.b);
        // Fragment 2 of the first packet never arrives.
        assert_eq!(h.send(a, 0, B, &[0, 0x21, 1]), None);
        assert_eq!(h.send(b, 1, M, &[2]), None);
        assert_eq!(h.send(b, 3, B, &[0, 0x21, 7]), None);
        assert_eq!(h.send(a, 4, E, &[8]), Some(std::vec![0, 0x21, 7, 8]));
        assert_eq!(h.pending(), 0);
        assert_eq!(h.pool.free_nodes(), NODES);
    }

    #[test]
    fn test_lost_end_fragment_is_flushed() {
        let mut h = Harness::new(true);
        let (a, b) = (h.a, h.b);
        // Fragment 1, the end of the first packet, never arrives.
        assert_eq!(h.send(a, 0, B, &[0, 0x21, 1]), None);
        assert_eq!(h.send(b, 2, B | E, &[0, 0x21, 2]), Some(std::vec![0, 0x21, 2]));
        assert_eq!(h.pending(), 1);
        assert_eq!(h.send(a, 3, B | E, &[0, 0x21, 3]), Some(std::vec![0, 0x21, 3]));
        assert_eq!(h.pending(), 0);
        assert_eq!(h.pool.free_nodes(), NODES);
    }

    #[test]
    fn test_unfinished_run_behind_watermark_is_flushed() {
        let mut h = Harness::new(true);
        let (a, b) = (h.a, h.b);
        // Fragment 1 never arrives, so 0..=2 can never complete.
        assert_eq!(h.send(a, 0, B, &[0, 0x21, 1]), None);
        assert_eq!(h.send(a, 2, E, &[3]), None);
        assert_eq!(h.send(b, 5, B, &[0, 0x21, 5]), None);
        assert_eq!(h.pending(), 3);
        assert_eq!(h.send(a, 6, E, &[6]), Some(std::vec![0, 0x21, 5, 6]));
        assert_eq!(h.pending(), 0);
        let handle = h.mp.find_bundle_by_device(&h.registry, a).unwrap();
        assert_eq!(h.mp.bundle(handle).unwrap().e_bits, 0);
        assert_eq!(h.pool.free_nodes(), NODES);
    }

    #[test]
    fn test_short_sequence_wraps() {
        let mut h = Harness::new(true);
        let (a, b) = (h.a, h.b);
        assert_eq!(h.send(a, 0xffe, B, &[0, 0x21, 1]), None);
        assert_eq!(h.send(b, 0xfff, M, &[2]), None);
        assert_eq!(h.send(a, 0x000, E, &[3]), Some(std::vec![0, 0x21, 1, 2, 3]));
        assert_eq!(h.pool.free_nodes(), NODES);
    }

    #[test]
    fn test_long_sequence_wraps() {
        let mut h = Harness::new(false);
        let (a, b) = (h.a, h.b);
        assert_eq!(h.format(), MpSeqFormat::Long);
        assert_eq!(h.send(b, 0x00ff_ffff, M, &[2]), None);
        assert_eq!(h.send(a, 0x00ff_fffe, B, &[0, 0x21, 1]), None);
        assert_eq!(h.send(a, 0x0000_0000, E, &[3]), Some(std::vec![0, 0x21, 1, 2, 3]));
        assert_eq!(h.pool.free_nodes(), NODES);
    }

    #[test]
    fn test_link_without_fragments_holds_back_loss() {
        let mut h = Harness::new(true);
        let (a, b) = (h.a, h.b);
        // Link b has sent nothing yet, so 3001 may still be on its way.
        assert_eq!(h.send(a, 3000, B, &[0, 0x21, 1]), None);
        assert_eq!(h.send(a, 3002, E, &[3]), None);
        assert_eq!(h.send(a, 3003, B | E, &[0, 0x21, 9]), Some(std::vec![0, 0x21, 9]));
        assert_eq!(h.pending(), 2);
        assert_eq!(h.send(b, 3001, M, &[2]), Some(std::vec![0, 0x21, 1, 2, 3]));
        assert_eq!(h.pending(), 0);
        assert_eq!(h.pool.free_nodes(), NODES);
    }

    #[test]
    fn test_every_link_interleaving() {
        // Six fragments of one frame, even ones on link a and odd ones on
        // link b, each link keeping its own order.
        let expected = std::vec![0, 0x21, 0, 1, 2, 3, 4, 5];
        for base in [0u32, 0xffd] {
            for order in 0u32..64 {
                if order.count_ones() != 3 {
                    continue;
                }
                let mut h = Harness::new(true);
                let (a, b) = (h.a, h.b);
                let (mut next_a, mut next_b) = (0u32, 1u32);
                for step in 0..6 {
                    let (link, k) = if order & (1 << step) != 0 {
                        next_a += 2;
                        (a, next_a - 2)
                    } else {
                        next_b += 2;
                        (b, next_b - 2)
                    };
                    let seq = (base + k) & 0xfff;
                    let result = match k {
                        0 => h.send(link, seq, B, &[0, 0x21, 0]),
                        5 => h.send(link, seq, E, &[5]),
                        _ => h.send(link, seq, M, &[k as u8]),
                    };
                    if step == 5 {
                        assert_eq!(result.as_ref(), Some(&expected), "order {order:06b}");
                    } else {
                        assert_eq!(result, None, "order {order:06b} step {step}");
                    }
                }
                assert_eq!(h.pending(), 0);
                assert_eq!(h.pool.free_nodes(), NODES);
            }
        }
    }

    #[test]
    fn test_fragment_outside_bundle_is_dropped() {
        let mut h = Harness::new(true);
        let stray = add_ppp_link(&mut h.registry, "ppp7", 0, "mallory", true);
        assert_eq!(h.send(stray, 0, B | E, &[0, 0x21]), None);
        assert_eq!(h.pool.free_nodes(), NODES);
    }

    #[test]
    fn test_remove_link_releases_fragments() {
        let mut h = Harness::new(true);
        let (a, b) = (h.a, h.b);
        assert_eq!(h.send(a, 0, B, &[0, 0x21, 1]), None);
        assert_eq!(h.send(b, 1, M, &[2]), None);
        h.mp.remove_link(&mut h.pool, &mut h.registry, a).unwrap();
        h.mp.remove_link(&mut h.pool, &mut h.registry, b).unwrap();
        assert_eq!(h.pool.free_nodes(), NODES);
    }
}
