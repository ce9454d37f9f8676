use core::fmt;

use bitflags::bitflags;
use heapless::{String, Vec};

use crate::config::{
    DEVICE_NAME_LEN, IFACE_MAX_DEVICE_COUNT, LOGIN_NAME_LEN, MP_ENDPOINT_DISC_LEN,
};
use crate::iface::multilink::BundleHandle;
use crate::iface::stack::InterfaceStack;
use crate::phy::IfIndex;
use crate::wire::Ipv4Address;

/// Error returned by [`DeviceTable`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceError {
    /// The table has no free slot.
    TableFull,
    /// The name does not fit a device name.
    NameTooLong,
    /// A device with this name already exists.
    Exists,
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            DeviceError::TableFull => write!(f, "device table full"),
            DeviceError::NameTooLong => write!(f, "device name too long"),
            DeviceError::Exists => write!(f, "device exists"),
        }
    }
}

impl core::error::Error for DeviceError {}

bitflags! {
    /// Administrative and operational state of a device.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceFlags: u16 {
        const UP             = 0x0001;
        const RUNNING        = 0x0002;
        const POINT_TO_POINT = 0x0004;
        /// The device is a Multilink bundle interface, not a physical link.
        const VIRTUAL        = 0x0008;
    }
}

bitflags! {
    /// LCP options that were negotiated (or are to be requested) on a link.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct LcpFlags: u16 {
        /// Protocol field compression.
        const PFC            = 0x0001;
        /// Address and control field compression.
        const ACFC           = 0x0002;
        /// Maximum received reconstructed unit, i.e. Multilink itself.
        const MRRU           = 0x0004;
        const SHORT_SEQ_NUM  = 0x0008;
        const ENDPOINT_DISC  = 0x0010;
    }
}

enum_with_unknown! {
    /// Endpoint discriminator class, RFC 1990 § 5.1.3.
    pub enum EndpointClass(u8) {
        Null    = 0,
        Local   = 1,
        Ip      = 2,
        Mac     = 3,
        Magic   = 4,
        Phone   = 5,
    }
}

impl Default for EndpointClass {
    fn default() -> Self {
        EndpointClass::Null
    }
}

/// Phase of the link layer state machine, as far as bundling is concerned.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum LinkPhase {
    /// Not connected; links in this phase carry no fragments.
    #[default]
    Initial,
    Connected,
}

/// State of a PPP control protocol (LCP or an NCP).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ControlState {
    #[default]
    Closed,
    Opened,
}

/// One side's view of the LCP options relevant to Multilink.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LcpOptions {
    pub flags: LcpFlags,
    pub mrru: u16,
    pub endpoint_disc: Vec<u8, MP_ENDPOINT_DISC_LEN>,
    pub endpoint_class: EndpointClass,
}

/// The PPP link layer state kept per device.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LinkLayer {
    pub phase: LinkPhase,
    pub lcp: ControlState,
    pub ipcp: ControlState,
    pub ipv6cp: ControlState,
    /// Options requested by us.
    pub local: LcpOptions,
    /// Options acknowledged for the peer.
    pub remote: LcpOptions,
    /// Name the peer authenticated with.
    pub login_name: String<LOGIN_NAME_LEN>,
}

/// A network device, either a physical PPP link or a virtual bundle interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    index: IfIndex,
    name: String<DEVICE_NAME_LEN>,
    pub flags: DeviceFlags,
    pub mtu: usize,
    /// Octets of link framing the driver adds in front of each frame.
    pub header_len: usize,
    pub baud_rate: u32,
    /// Largest IPv4 datagram accepted for reassembly on this device.
    pub reasm_max_size: usize,
    pub ipv4_addr: Option<Ipv4Address>,
    pub link: LinkLayer,
    /// Bundle attached to a virtual device.
    pub bundle: Option<BundleHandle>,
    /// Latest Multilink sequence number received on a physical link, once
    /// one has arrived since the link joined its bundle.
    pub mp_last_seq: Option<u32>,
}

impl Device {
    /// Create a device description with the given name. The index is assigned
    /// when it is added to a [`DeviceTable`].
    pub fn new(name: &str) -> Result<Device, DeviceError> {
        let mut stored = String::new();
        stored
            .push_str(name)
            .map_err(|_| DeviceError::NameTooLong)?;
        Ok(Device {
            index: 0,
            name: stored,
            flags: DeviceFlags::empty(),
            mtu: 1500,
            header_len: 0,
            baud_rate: 0,
            reasm_max_size: 65535,
            ipv4_addr: None,
            link: LinkLayer::default(),
            bundle: None,
            mp_last_seq: None,
        })
    }

    pub fn index(&self) -> IfIndex {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn set_name(&mut self, name: &str) -> Result<(), DeviceError> {
        let mut stored = String::new();
        stored
            .push_str(name)
            .map_err(|_| DeviceError::NameTooLong)?;
        self.name = stored;
        Ok(())
    }

    /// Query whether the device is a Multilink bundle interface.
    pub fn is_virtual(&self) -> bool {
        self.flags.contains(DeviceFlags::VIRTUAL)
    }
}

/// The table of all devices known to the stack.
#[derive(Debug, Default)]
pub struct DeviceTable {
    devices: Vec<Device, IFACE_MAX_DEVICE_COUNT>,
    next_index: IfIndex,
}

impl DeviceTable {
    pub fn new() -> DeviceTable {
        DeviceTable {
            devices: Vec::new(),
            next_index: 1,
        }
    }

    /// Add a device, returning the index assigned to it.
    pub fn add(&mut self, mut device: Device) -> Result<IfIndex, DeviceError> {
        if self.by_name(device.name()).is_some() {
            return Err(DeviceError::Exists);
        }
        let index = self.next_index.max(1);
        device.index = index;
        self.devices
            .push(device)
            .map_err(|_| DeviceError::TableFull)?;
        self.next_index = index + 1;
        Ok(index)
    }

    pub fn remove(&mut self, index: IfIndex) -> Option<Device> {
        let position = self.devices.iter().position(|d| d.index == index)?;
        Some(self.devices.remove(position))
    }

    pub fn get(&self, index: IfIndex) -> Option<&Device> {
        self.devices.iter().find(|d| d.index == index)
    }

    pub fn get_mut(&mut self, index: IfIndex) -> Option<&mut Device> {
        self.devices.iter_mut().find(|d| d.index == index)
    }

    pub fn by_name(&self, name: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter()
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

/// The device table together with the layering between its devices.
#[derive(Debug, Default)]
pub struct Registry {
    pub devices: DeviceTable,
    pub stack: InterfaceStack,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            devices: DeviceTable::new(),
            stack: InterfaceStack::new(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_add_assigns_indices() {
        let mut table = DeviceTable::new();
        let a = table.add(Device::new("ppp0").unwrap()).unwrap();
        let b = table.add(Device::new("ppp1").unwrap()).unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(table.get(b).map(Device::name), Some("ppp1"));
        assert_eq!(
            table.add(Device::new("ppp0").unwrap()),
            Err(DeviceError::Exists)
        );
    }

    #[test]
    fn test_remove_keeps_indices_unique() {
        let mut table = DeviceTable::new();
        let a = table.add(Device::new("ppp0").unwrap()).unwrap();
        assert!(table.remove(a).is_some());
        let b = table.add(Device::new("ppp0").unwrap()).unwrap();
        assert_ne!(a, b);
        assert!(table.get(a).is_none());
    }

    #[test]
    fn test_table_full() {
        let mut table = DeviceTable::new();
        for i in 0..IFACE_MAX_DEVICE_COUNT {
            let mut name = String::<DEVICE_NAME_LEN>::new();
            core::fmt::write(&mut name, format_args!("ppp{i}")).unwrap();
            table.add(Device::new(&name).unwrap()).unwrap();
        }
        assert_eq!(
            table.add(Device::new("extra").unwrap()),
            Err(DeviceError::TableFull)
        );
    }

    #[test]
    fn test_name_too_long() {
        assert_eq!(
            Device::new("a-name-well-beyond-the-limit"),
            Err(DeviceError::NameTooLong)
        );
    }
}
