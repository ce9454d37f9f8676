/*! Network interface logic.

The `iface` module deals with the *network interfaces*. It keeps the device
table and the interface stack that places physical PPP links under Multilink
bundle interfaces, reassembles fragmented IPv4 datagrams, and runs the
Multilink fragmentation and reassembly engines.
*/

mod device;
mod fragmentation;
mod interface;
mod multilink;
mod stack;
mod timer;

pub use self::device::{
    ControlState, Device, DeviceError, DeviceFlags, DeviceTable, EndpointClass, LcpFlags,
    LcpOptions, LinkLayer, LinkPhase, Registry,
};
pub use self::fragmentation::{
    Ipv4Reassembler, ReassemblyError, ReassemblyStats, Received, TimedOut,
};
pub use self::interface::{Config, Interface, PollResult, ReceiveError};
pub use self::multilink::{
    Bundle, BundleHandle, BundleInfo, LinkRemoved, MpError, Multilink, MultilinkConfig, Unsent,
};
pub use self::stack::{InterfaceStack, StackEntry, StackError};
pub use self::timer::{Event, Expired, Match, TimerError, TimerQueue};
