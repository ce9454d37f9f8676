/*! Access to networking hardware.

The `phy` module deals with the *link devices*. It provides the trait through
which finished frames leave the stack, [LinkOutput](trait.LinkOutput.html), and
the one through which received packets are handed up to the network layer,
[NetworkLayer](trait.NetworkLayer.html).

A PPP link driver receives frames that start with the PPP protocol field; the
address, control and framing octets are the driver's business.
*/

use core::fmt;

use crate::storage::{BufferPool, PacketBuf};
use crate::wire::{Ipv4Address, PppProtocol};

/// Index of a device in the device table.
pub type IfIndex = u32;

/// Error returned by [`LinkOutput::transmit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxError;

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "link transmit failed")
    }
}

impl core::error::Error for TxError {}

/// An interface for handing frames to link drivers.
///
/// The frame is always consumed: on success the driver owns it, and on failure
/// the driver must have returned its nodes to the pool before reporting the error.
pub trait LinkOutput {
    fn transmit(
        &mut self,
        pool: &mut BufferPool,
        link: IfIndex,
        frame: PacketBuf,
    ) -> Result<(), TxError>;
}

impl<T: LinkOutput + ?Sized> LinkOutput for &mut T {
    fn transmit(
        &mut self,
        pool: &mut BufferPool,
        link: IfIndex,
        frame: PacketBuf,
    ) -> Result<(), TxError> {
        (**self).transmit(pool, link, frame)
    }
}

/// The protocols above the PPP layer.
///
/// Every method takes ownership of the packet; the implementation returns it to
/// the pool when done.
pub trait NetworkLayer {
    /// Take a complete IPv4 datagram, header included, received on `device`.
    fn ipv4_input(&mut self, pool: &mut BufferPool, device: IfIndex, datagram: PacketBuf);

    fn ipv6_input(&mut self, pool: &mut BufferPool, device: IfIndex, packet: PacketBuf);

    /// Take a frame of any other PPP protocol. The protocol field has been
    /// removed. Such frames are dropped unless this is overridden.
    fn control_input(
        &mut self,
        pool: &mut BufferPool,
        device: IfIndex,
        protocol: PppProtocol,
        frame: PacketBuf,
    ) {
        net_trace!("dropping {} frame from device {}", protocol, device);
        pool.free(frame);
    }

    /// Send an ICMP message generated by the stack to `dst`. The packet is a
    /// complete IPv4 datagram.
    fn icmp_output(&mut self, pool: &mut BufferPool, dst: Ipv4Address, packet: PacketBuf);
}

/// A link output that records every frame, for tests.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct Capture {
    pub frames: std::vec::Vec<(IfIndex, std::vec::Vec<u8>)>,
    pub fail: bool,
}

#[cfg(test)]
impl LinkOutput for Capture {
    fn transmit(
        &mut self,
        pool: &mut BufferPool,
        link: IfIndex,
        frame: PacketBuf,
    ) -> Result<(), TxError> {
        let data = pool.to_vec(&frame);
        pool.free(frame);
        if self.fail {
            return Err(TxError);
        }
        self.frames.push((link, data));
        Ok(())
    }
}
