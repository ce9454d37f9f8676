//! Compile-time capacities.
//!
//! Every table in the crate is bounded; these constants size them.

/// Octets of packet data held by one buffer node.
pub const BUFFER_NODE_SIZE: usize = 256;

/// Number of IPv4 datagrams that can be under reassembly at once.
pub const REASSEMBLY_QUEUE_COUNT: usize = 16;

/// Number of entries in the device table, physical and virtual.
pub const IFACE_MAX_DEVICE_COUNT: usize = 8;

/// Number of (higher, lower) entries in the interface stack.
pub const IFACE_STACK_ENTRY_COUNT: usize = 16;

/// Number of Multilink bundles that can exist at once.
pub const MP_MAX_BUNDLE_COUNT: usize = 4;

/// Number of pending timers.
pub const TIMER_SLOT_COUNT: usize = REASSEMBLY_QUEUE_COUNT + 4;

/// Depth of the inbound frame list.
pub const IFACE_RX_QUEUE_DEPTH: usize = 16;

pub const DEVICE_NAME_LEN: usize = 16;
pub const LOGIN_NAME_LEN: usize = 32;
pub const MP_ENDPOINT_DISC_LEN: usize = 20;
