/*! PPP Multilink (RFC 1990).

A bundle joins several PPP links under one virtual interface. Outgoing packets
on the virtual interface are split into fragments sized by link speed and
spread over the member links; fragments arriving on the member links are
put back in sequence order and joined into whole PPP frames again.

Fragment loss is detected without timers: every link delivers its fragments
in sequence order, so once the lowest sequence number most recently seen on
any member link (the watermark) has passed a fragment, nothing older can still
arrive and an unfinished packet behind the watermark is discarded.
*/

mod bundle;
mod fragmenter;
mod reassembly;

use core::fmt;

use alloc::vec::Vec;

use crate::config::MP_MAX_BUNDLE_COUNT;
use crate::iface::device::{Device, DeviceError, LcpFlags};
use crate::iface::stack::StackError;
use crate::phy::IfIndex;
use crate::storage::PacketBuf;
use crate::wire::{MpFlags, MpSeqFormat};

pub use self::bundle::{BundleInfo, LinkRemoved};

/// Name prefix of virtual interfaces created on demand for a new bundle.
pub(crate) const DYNAMIC_PREFIX: &str = "__MP__";

/// A stable reference to a bundle held by [`Multilink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BundleHandle(usize);

/// Error returned by Multilink operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpError {
    /// No bundle, or no usable member link, was found.
    NotPresent,
    /// The buffer pool could not supply a fragment buffer.
    NoBuffers,
    /// The link does not belong to the requested bundle.
    InvalidLink,
    /// The bundle is not open for network traffic.
    HostUnreachable,
    /// A device or interface stack table is full.
    NoMemory,
    /// Every bundle slot is in use.
    Exhausted,
    /// A link driver refused a fragment.
    TxFailed,
}

impl fmt::Display for MpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            MpError::NotPresent => write!(f, "bundle or link not present"),
            MpError::NoBuffers => write!(f, "no buffers"),
            MpError::InvalidLink => write!(f, "invalid link"),
            MpError::HostUnreachable => write!(f, "host unreachable"),
            MpError::NoMemory => write!(f, "no memory"),
            MpError::Exhausted => write!(f, "bundles exhausted"),
            MpError::TxFailed => write!(f, "link transmit failed"),
        }
    }
}

impl core::error::Error for MpError {}

impl From<StackError> for MpError {
    fn from(err: StackError) -> Self {
        match err {
            StackError::TableFull => MpError::NoMemory,
            StackError::Exists => MpError::InvalidLink,
            StackError::NotFound => MpError::NotPresent,
        }
    }
}

impl From<DeviceError> for MpError {
    fn from(err: DeviceError) -> Self {
        match err {
            DeviceError::TableFull | DeviceError::NameTooLong => MpError::NoMemory,
            DeviceError::Exists => MpError::InvalidLink,
        }
    }
}

/// A packet that could not be sent, handed back to the caller with the reason.
#[derive(Debug, PartialEq, Eq)]
pub struct Unsent {
    pub error: MpError,
    pub packet: PacketBuf,
}

impl fmt::Display for Unsent {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "packet unsent: {}", self.error)
    }
}

impl core::error::Error for Unsent {}

/// Runtime tunables of the Multilink engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultilinkConfig {
    /// Smallest fragment payload sent on a link, unless the packet is smaller.
    pub min_frag_size: usize,
    /// MRRU requested on links attached to a bundle.
    pub default_mrru: u16,
    /// Request short sequence numbers on attached links.
    pub short_seq_default: bool,
    /// Endpoint discriminator (MAC class) announced on attached links.
    pub endpoint_mac: [u8; 6],
    /// A bundle's reassembly limit is raised to its MRRU only above this size.
    pub min_reasm_max_size: usize,
}

impl Default for MultilinkConfig {
    fn default() -> Self {
        MultilinkConfig {
            min_frag_size: 64,
            default_mrru: 1500,
            short_seq_default: true,
            endpoint_mac: [0x02, 0x00, 0x00, 0x00, 0x00, 0x01],
            min_reasm_max_size: 576,
        }
    }
}

/// A fragment waiting for the rest of its packet.
///
/// The buffer still starts with the Multilink header.
#[derive(Debug)]
struct MpFragment {
    seq: u32,
    flags: MpFlags,
    buf: PacketBuf,
}

/// The state of one bundle.
#[derive(Debug)]
pub struct Bundle {
    virtual_if: IfIndex,
    num_links: usize,
    total_baud_rate: u32,
    /// Sequence number of the next fragment sent.
    sequence_no: u32,
    /// Received fragments in sequence order.
    fragments: Vec<MpFragment>,
    /// Lowest of the latest sequence numbers seen on each member link. Unset
    /// while some member link has not delivered a fragment yet.
    latest_min_seq: Option<u32>,
    /// Number of queued fragments carrying the End flag.
    e_bits: usize,
}

impl Bundle {
    fn new(virtual_if: IfIndex) -> Bundle {
        Bundle {
            virtual_if,
            num_links: 0,
            total_baud_rate: 0,
            sequence_no: 0,
            fragments: Vec::new(),
            latest_min_seq: None,
            e_bits: 0,
        }
    }

    /// Return the index of the bundle's virtual interface.
    pub fn virtual_if(&self) -> IfIndex {
        self.virtual_if
    }

    pub fn num_links(&self) -> usize {
        self.num_links
    }

    pub fn total_baud_rate(&self) -> u32 {
        self.total_baud_rate
    }

    /// Return the number of received fragments waiting for reassembly.
    pub fn pending_fragments(&self) -> usize {
        self.fragments.len()
    }

    pub fn watermark(&self) -> Option<u32> {
        self.latest_min_seq
    }

    /// Return the sequence number to stamp on the next fragment and advance
    /// the counter, wrapping past the largest value of `format`.
    fn take_sequence(&mut self, format: MpSeqFormat) -> u32 {
        if self.sequence_no > format.max_seq() {
            self.sequence_no = 0;
        }
        let seq = self.sequence_no;
        self.sequence_no += 1;
        seq
    }
}

/// Sequence format of fragments sent on a bundle: what the peer asked to receive.
pub(crate) fn tx_format(device: &Device) -> MpSeqFormat {
    if device.link.remote.flags.contains(LcpFlags::SHORT_SEQ_NUM) {
        MpSeqFormat::Short
    } else {
        MpSeqFormat::Long
    }
}

/// Sequence format of fragments received on a bundle: what we asked to receive.
pub(crate) fn rx_format(device: &Device) -> MpSeqFormat {
    if device.link.local.flags.contains(LcpFlags::SHORT_SEQ_NUM) {
        MpSeqFormat::Short
    } else {
        MpSeqFormat::Long
    }
}

/// The Multilink context: every bundle, addressed by [`BundleHandle`].
#[derive(Debug)]
pub struct Multilink {
    config: MultilinkConfig,
    bundles: [Option<Bundle>; MP_MAX_BUNDLE_COUNT],
    /// Live bundles in creation order.
    order: heapless::Vec<BundleHandle, MP_MAX_BUNDLE_COUNT>,
}

impl Multilink {
    pub fn new(config: MultilinkConfig) -> Multilink {
        Multilink {
            config,
            bundles: [const { None }; MP_MAX_BUNDLE_COUNT],
            order: heapless::Vec::new(),
        }
    }

    pub fn config(&self) -> &MultilinkConfig {
        &self.config
    }

    pub fn bundle(&self, handle: BundleHandle) -> Option<&Bundle> {
        self.bundles.get(handle.0)?.as_ref()
    }

    fn bundle_mut(&mut self, handle: BundleHandle) -> Option<&mut Bundle> {
        self.bundles.get_mut(handle.0)?.as_mut()
    }

    /// Iterate over the live bundles in creation order.
    pub fn bundles(&self) -> impl Iterator<Item = (BundleHandle, &Bundle)> + '_ {
        self.order
            .iter()
            .filter_map(move |&handle| Some((handle, self.bundle(handle)?)))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
