use super::{MpError, Multilink, Unsent, tx_format};
use crate::iface::device::{ControlState, DeviceFlags, LcpFlags, LinkPhase, Registry};
use crate::iface::stack::StackEntry;
use crate::phy::{IfIndex, LinkOutput};
use crate::storage::{BufferPool, PacketBuf};
use crate::wire::{MpFlags, MpPacket, MpRepr, PppProtocol};

/// Payload octets of the next fragment for one link.
///
/// The share of `packet_size` is proportional to the link's part of the
/// bundle's bandwidth, or an equal split when speeds are unknown, rounded
/// down to a multiple of 8. It is raised to `min_size`, then capped by the
/// link's `budget` and by what is left of the packet.
fn fragment_size(
    min_size: usize,
    link_baud_rate: u32,
    total_baud_rate: u32,
    num_links: usize,
    packet_size: usize,
    remaining: usize,
    budget: usize,
) -> usize {
    let share = if link_baud_rate != 0 && total_baud_rate != 0 {
        (link_baud_rate as u64 * packet_size as u64 / total_baud_rate as u64) as usize
    } else {
        packet_size / num_links.max(1)
    };
    (share & !7)
        .max(min_size)
        .min(budget & !7)
        .min(remaining)
}

impl Multilink {
    /// Split `packet` into fragments and send them over the links of the
    /// bundle on `virtual_if`.
    ///
    /// `packet` must start with its PPP protocol field. Links take turns in
    /// interface stack order; links still in the initial phase are passed
    /// over. Each fragment goes out as soon as it is built.
    ///
    /// The packet is released once every fragment is sent. On error it is
    /// handed back; fragments already sent stay sent.
    pub fn fragment_send<L>(
        &mut self,
        pool: &mut BufferPool,
        registry: &Registry,
        virtual_if: IfIndex,
        packet: PacketBuf,
        links: &mut L,
    ) -> Result<(), Unsent>
    where
        L: LinkOutput + ?Sized,
    {
        let Some(mp) = registry.devices.get(virtual_if) else {
            return Err(Unsent {
                error: MpError::NotPresent,
                packet,
            });
        };
        let format = tx_format(mp);
        let compress = mp.link.remote.flags.contains(LcpFlags::PFC);
        let pid_len = PppProtocol::Multilink.field_len(compress);
        let overhead = pid_len + format.header_len();
        let min_size = self.config.min_frag_size;

        let Some(bundle) = mp.bundle.and_then(|handle| self.bundle_mut(handle)) else {
            return Err(Unsent {
                error: MpError::NotPresent,
                packet,
            });
        };

        let packet_size = packet.len();
        let mut offset = 0;
        let mut entry: Option<StackEntry> = None;
        let mut idle = 0;

        while offset < packet_size {
            entry = match registry.stack.get_next(entry.as_ref()) {
                Some(next) if next.higher == virtual_if => Some(next),
                _ => registry.stack.get_lower(virtual_if),
            };
            let Some(current) = entry else {
                return Err(Unsent {
                    error: MpError::NotPresent,
                    packet,
                });
            };

            let remaining = packet_size - offset;
            let link = registry
                .devices
                .get(current.lower)
                .filter(|device| current.active && device.link.phase != LinkPhase::Initial);
            let size = link.map_or(0, |device| {
                fragment_size(
                    min_size,
                    device.baud_rate,
                    bundle.total_baud_rate,
                    bundle.num_links,
                    packet_size,
                    remaining,
                    device.mtu.saturating_sub(overhead + device.header_len),
                )
            });
            let Some(device) = link.filter(|_| size > 0) else {
                idle += 1;
                // Every entry was tried without progress.
                if idle > registry.stack.len() {
                    return Err(Unsent {
                        error: MpError::NotPresent,
                        packet,
                    });
                }
                continue;
            };
            idle = 0;

            let mut fragment = match pool.alloc_with_headroom(size, device.header_len + overhead) {
                Ok(fragment) => fragment,
                Err(_) => {
                    net_error!("multilink: no buffer for a {} octet fragment", size);
                    return Err(Unsent {
                        error: MpError::NoBuffers,
                        packet,
                    });
                }
            };
            if pool.copy_chain(&mut fragment, &packet, offset, size).is_err() {
                pool.free(fragment);
                return Err(Unsent {
                    error: MpError::NoBuffers,
                    packet,
                });
            }

            let mut flags = MpFlags::empty();
            if offset == 0 {
                flags |= MpFlags::BEGIN;
            }
            if size >= remaining {
                flags |= MpFlags::END;
            }
            let repr = MpRepr {
                flags,
                seq_number: bundle.take_sequence(format),
                format,
            };
            let mut header = [0u8; 6];
            PppProtocol::Multilink.emit(compress, &mut header[..pid_len]);
            repr.emit(&mut MpPacket::new_unchecked(&mut header[pid_len..overhead]));
            if pool.prepend(&mut fragment, &header[..overhead]).is_err() {
                pool.free(fragment);
                return Err(Unsent {
                    error: MpError::NoBuffers,
                    packet,
                });
            }
            fragment.set_device(current.lower);

            net_trace!("multilink: {} to link {}, {} octets", repr, current.lower, size);
            if links.transmit(pool, current.lower, fragment).is_err() {
                return Err(Unsent {
                    error: MpError::TxFailed,
                    packet,
                });
            }
            offset += size;
        }

        pool.free(packet);
        Ok(())
    }

    /// Send a network layer packet on the bundle's virtual interface.
    ///
    /// `packet` holds the datagram without PPP framing; the protocol field
    /// is added here. A bundle with one link sends it whole on that link.
    /// Otherwise the bundle must be up and running, with LCP and the control
    /// protocol of `protocol` opened, and the packet is fragmented.
    ///
    /// The packet is consumed in every case.
    pub fn output<L>(
        &mut self,
        pool: &mut BufferPool,
        registry: &Registry,
        virtual_if: IfIndex,
        mut packet: PacketBuf,
        protocol: PppProtocol,
        links: &mut L,
    ) -> Result<(), MpError>
    where
        L: LinkOutput + ?Sized,
    {
        let Some((mp, bundle)) = registry
            .devices
            .get(virtual_if)
            .and_then(|mp| Some((mp, self.bundle(mp.bundle?)?)))
        else {
            pool.free(packet);
            return Err(MpError::NotPresent);
        };

        if bundle.num_links == 1 {
            let Some(link) = registry
                .stack
                .lowers(virtual_if)
                .next()
                .and_then(|lower| registry.devices.get(lower))
            else {
                pool.free(packet);
                return Err(MpError::NotPresent);
            };
            let compress = link.link.remote.flags.contains(LcpFlags::PFC);
            if let Err(err) = prepend_protocol(pool, &mut packet, protocol, compress) {
                pool.free(packet);
                return Err(err);
            }
            packet.set_device(link.index());
            return links
                .transmit(pool, link.index(), packet)
                .map_err(|_| MpError::TxFailed);
        }

        let ncp_opened = match protocol {
            PppProtocol::Ipv4 => mp.link.ipcp == ControlState::Opened,
            PppProtocol::Ipv6 => mp.link.ipv6cp == ControlState::Opened,
            _ => true,
        };
        if !mp.flags.contains(DeviceFlags::UP | DeviceFlags::RUNNING)
            || mp.link.lcp != ControlState::Opened
            || !ncp_opened
        {
            net_debug!("multilink: interface {} not open for {}", virtual_if, protocol);
            pool.free(packet);
            return Err(MpError::HostUnreachable);
        }

        let compress = mp.link.remote.flags.contains(LcpFlags::PFC);
        if let Err(err) = prepend_protocol(pool, &mut packet, protocol, compress) {
            pool.free(packet);
            return Err(err);
        }
        self.fragment_send(pool, registry, virtual_if, packet, links)
            .map_err(|unsent| {
                net_debug!("multilink: {}", unsent);
                pool.free(unsent.packet);
                unsent.error
            })
    }
}

fn prepend_protocol(
    pool: &mut BufferPool,
    packet: &mut PacketBuf,
    protocol: PppProtocol,
    compress: bool,
) -> Result<(), MpError> {
    let mut field = [0u8; 2];
    let len = protocol.emit(compress, &mut field);
    pool.prepend(packet, &field[..len])
        .map_err(|_| MpError::NoBuffers)
}
