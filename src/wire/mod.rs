/*! Low-level packet access and construction.

The `wire` module deals with the packet *representation*. It provides two levels
of functionality.

 * First, it provides functions to extract fields from sequences of octets,
   and to insert fields into sequences of octets. This happens `Packet` family of
   structures, e.g. [Ipv4Packet] or [MpPacket].
 * Second, in cases where the space of valid field values is much smaller than the space
   of possible field values, it provides a compact, high-level representation
   of packet data that can be parsed from and emitted into a sequence of octets.
   This happens through the `Repr` family of structs and enums, e.g. [MpRepr] or [Ipv4Repr].

[Ipv4Packet]: struct.Ipv4Packet.html
[MpPacket]: struct.MpPacket.html
[MpRepr]: struct.MpRepr.html
[Ipv4Repr]: struct.Ipv4Repr.html

The `Packet` family of data structures guarantees that, if the `Packet::check_len()` method
returned `Ok(())`, then no accessor or setter method will panic; however, the guarantee
provided by `Packet::check_len()` may no longer hold after changing certain fields,
which are listed in the documentation for the specific packet.

The `Packet::new_checked` method is a shorthand for a combination of `Packet::new_unchecked`
and `Packet::check_len`.
When parsing untrusted input, it is *necessary* to use `Packet::new_checked()`;
so long as the buffer is not modified, no accessor will fail.
When emitting output, though, it is *incorrect* to use `Packet::new_checked()`;
the length check is likely to succeed on a zeroed buffer, but fail on a buffer
filled with data from a previous packet, such as when reusing buffers.

Packets held in a buffer pool may span several nodes. Only the head node is
guaranteed to be contiguous, so headers are parsed from the head node with the
header-only checks (e.g. `Ipv4Packet::check_header_len`).

# Examples

To emit a Multilink header into an octet buffer, and then parse it back:

```rust
use rosfrag::wire::*;
let repr = MpRepr {
    flags: MpFlags::BEGIN,
    seq_number: 42,
    format: MpSeqFormat::Short,
};
let mut buffer = vec![0; repr.buffer_len()];
repr.emit(&mut MpPacket::new_unchecked(&mut buffer));
let packet = MpPacket::new_checked(&buffer, MpSeqFormat::Short).expect("truncated header");
assert_eq!(MpRepr::parse(&packet, MpSeqFormat::Short), Ok(repr));
```
*/

mod field {
    pub type Field = ::core::ops::Range<usize>;
}

pub(crate) mod icmpv4;
pub(crate) mod ip;
pub(crate) mod ipv4;
pub(crate) mod mp;
pub(crate) mod ppp;

use core::fmt;

pub use self::ip::{Protocol as IpProtocol, checksum};

pub use self::ipv4::{
    Address as Ipv4Address, HEADER_LEN as IPV4_HEADER_LEN, Key as Ipv4FragKey,
    MAX_HEADER_LEN as IPV4_MAX_HEADER_LEN, Packet as Ipv4Packet,
    Repr as Ipv4Repr,
};

pub use self::icmpv4::{
    HEADER_LEN as ICMPV4_HEADER_LEN, Message as Icmpv4Message, Packet as Icmpv4Packet,
    QUOTE_PAYLOAD_LEN as ICMPV4_QUOTE_PAYLOAD_LEN, Repr as Icmpv4Repr,
    TimeExceeded as Icmpv4TimeExceeded,
};

pub use self::ppp::Protocol as PppProtocol;

pub use self::mp::{
    Flags as MpFlags, Packet as MpPacket, Repr as MpRepr, SeqFormat as MpSeqFormat,
};

/// Parsing a packet failed.
///
/// Either it is malformed, or it is not supported by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Error;

impl core::error::Error for Error {}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "wire::Error")
    }
}

pub type Result<T> = core::result::Result<T, Error>;
