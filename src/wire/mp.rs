use bitflags::bitflags;
use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;

use super::{Error, Result};

bitflags! {
    /// Position of a Multilink fragment within its packet.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct Flags: u8 {
        /// First fragment of a packet.
        const BEGIN = 0x80;
        /// Last fragment of a packet.
        const END = 0x40;
    }
}

/// Multilink sequence number format, as negotiated by LCP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeqFormat {
    /// 12-bit sequence numbers in a 2-octet header.
    Short,
    /// 24-bit sequence numbers in a 4-octet header.
    Long,
}

impl SeqFormat {
    /// Return the length of the Multilink header in this format.
    pub const fn header_len(&self) -> usize {
        match self {
            SeqFormat::Short => 2,
            SeqFormat::Long => 4,
        }
    }

    /// Return the largest sequence number before wrapping to zero.
    pub const fn max_seq(&self) -> u32 {
        match self {
            SeqFormat::Short => 0x0fff,
            SeqFormat::Long => 0x00ff_ffff,
        }
    }

    /// Return the sequence number that follows `seq`.
    pub const fn next(&self, seq: u32) -> u32 {
        seq.wrapping_add(1) & self.max_seq()
    }

    /// Return how many steps forward `to` lies from `from`, modulo the sequence space.
    pub const fn distance(&self, from: u32, to: u32) -> u32 {
        to.wrapping_sub(from) & self.max_seq()
    }

    /// Query whether `a` comes strictly before `b` in serial-number order.
    ///
    /// Numbers within half the sequence space ahead of `a` are taken to follow it.
    pub const fn precedes(&self, a: u32, b: u32) -> bool {
        let distance = self.distance(a, b);
        distance != 0 && distance <= self.max_seq() / 2
    }
}

impl fmt::Display for SeqFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SeqFormat::Short => write!(f, "short"),
            SeqFormat::Long => write!(f, "long"),
        }
    }
}

/// A read/write wrapper around a Multilink fragment header.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Packet<T: AsRef<[u8]>> {
    buffer: T,
}

mod field {
    use crate::wire::field::*;

    pub const FLAGS: usize = 0;
    pub const SHORT_SEQ: Field = 0..2;
    pub const LONG_SEQ: Field = 0..4;
}

const SHORT_SEQ_MASK: u16 = 0x0fff;
const LONG_SEQ_MASK: u32 = 0x00ff_ffff;
const FLAG_MASK: u8 = 0xc0;

impl<T: AsRef<[u8]>> Packet<T> {
    /// Imbue a raw octet buffer with Multilink header structure.
    pub const fn new_unchecked(buffer: T) -> Packet<T> {
        Packet { buffer }
    }

    /// Shorthand for a combination of [new_unchecked] and [check_len].
    ///
    /// [new_unchecked]: #method.new_unchecked
    /// [check_len]: #method.check_len
    pub fn new_checked(buffer: T, format: SeqFormat) -> Result<Packet<T>> {
        let packet = Self::new_unchecked(buffer);
        packet.check_len(format)?;
        Ok(packet)
    }

    /// Ensure that no accessor method will panic if called.
    /// Returns `Err(Error)` if the buffer is shorter than the header.
    pub fn check_len(&self, format: SeqFormat) -> Result<()> {
        if self.buffer.as_ref().len() < format.header_len() {
            Err(Error)
        } else {
            Ok(())
        }
    }

    /// Consume the packet, returning the underlying buffer.
    pub fn into_inner(self) -> T {
        self.buffer
    }

    /// Return the Begin and End flags.
    #[inline]
    pub fn flags(&self) -> Flags {
        let data = self.buffer.as_ref();
        Flags::from_bits_truncate(data[field::FLAGS])
    }

    /// Return the sequence number.
    #[inline]
    pub fn seq_number(&self, format: SeqFormat) -> u32 {
        let data = self.buffer.as_ref();
        match format {
            SeqFormat::Short => {
                (NetworkEndian::read_u16(&data[field::SHORT_SEQ]) & SHORT_SEQ_MASK) as u32
            }
            SeqFormat::Long => NetworkEndian::read_u32(&data[field::LONG_SEQ]) & LONG_SEQ_MASK,
        }
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Packet<&'a T> {
    /// Return a pointer to the fragment data.
    #[inline]
    pub fn payload(&self, format: SeqFormat) -> &'a [u8] {
        let data = self.buffer.as_ref();
        &data[format.header_len()..]
    }
}

impl<T: AsRef<[u8]> + AsMut<[u8]>> Packet<T> {
    /// Set the Begin and End flags, leaving the sequence number intact.
    #[inline]
    pub fn set_flags(&mut self, value: Flags) {
        let data = self.buffer.as_mut();
        data[field::FLAGS] = (data[field::FLAGS] & !FLAG_MASK) | value.bits();
    }

    /// Set the sequence number, leaving the flags intact and clearing reserved bits.
    #[inline]
    pub fn set_seq_number(&mut self, format: SeqFormat, value: u32) {
        let flags = self.flags().bits();
        let data = self.buffer.as_mut();
        match format {
            SeqFormat::Short => {
                let raw = ((flags as u16) << 8) | (value as u16 & SHORT_SEQ_MASK);
                NetworkEndian::write_u16(&mut data[field::SHORT_SEQ], raw)
            }
            SeqFormat::Long => {
                let raw = ((flags as u32) << 24) | (value & LONG_SEQ_MASK);
                NetworkEndian::write_u32(&mut data[field::LONG_SEQ], raw)
            }
        }
    }
}

/// A high-level representation of a Multilink fragment header.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Repr {
    pub flags: Flags,
    pub seq_number: u32,
    pub format: SeqFormat,
}

impl Repr {
    /// Parse a Multilink header and return a high-level representation.
    pub fn parse<T: AsRef<[u8]> + ?Sized>(
        packet: &Packet<&T>,
        format: SeqFormat,
    ) -> Result<Repr> {
        packet.check_len(format)?;
        Ok(Repr {
            flags: packet.flags(),
            seq_number: packet.seq_number(format),
            format,
        })
    }

    /// Return the length of a header that will be emitted from this high-level representation.
    pub const fn buffer_len(&self) -> usize {
        self.format.header_len()
    }

    /// Emit a high-level representation into a Multilink header.
    pub fn emit<T: AsRef<[u8]> + AsMut<[u8]>>(&self, packet: &mut Packet<T>) {
        packet.set_flags(self.flags);
        packet.set_seq_number(self.format, self.seq_number);
    }
}

impl fmt::Display for Repr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MP seq={}", self.seq_number)?;
        if self.flags.contains(Flags::BEGIN) {
            write!(f, " B")?;
        }
        if self.flags.contains(Flags::END) {
            write!(f, " E")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_deconstruct_short() {
        let bytes = [0xca, 0xbc, 0x45];
        let packet = Packet::new_checked(&bytes[..], SeqFormat::Short).unwrap();
        assert_eq!(packet.flags(), Flags::BEGIN | Flags::END);
        assert_eq!(packet.seq_number(SeqFormat::Short), 0xabc);
        assert_eq!(packet.payload(SeqFormat::Short), &[0x45]);
    }

    #[test]
    fn test_deconstruct_long() {
        let bytes = [0x40, 0x12, 0x34, 0x56];
        let packet = Packet::new_checked(&bytes[..], SeqFormat::Long).unwrap();
        assert_eq!(packet.flags(), Flags::END);
        assert_eq!(packet.seq_number(SeqFormat::Long), 0x123456);
        assert!(Packet::new_checked(&bytes[..3], SeqFormat::Long).is_err());
    }

    #[test]
    fn test_emit() {
        let mut bytes = [0xffu8; 4];
        let repr = Repr {
            flags: Flags::BEGIN,
            seq_number: 0x1001,
            format: SeqFormat::Short,
        };
        repr.emit(&mut Packet::new_unchecked(&mut bytes[..2]));
        assert_eq!(&bytes[..2], &[0x80, 0x01]);

        let repr = Repr {
            flags: Flags::END,
            seq_number: 0x0102_0304,
            format: SeqFormat::Long,
        };
        repr.emit(&mut Packet::new_unchecked(&mut bytes[..]));
        assert_eq!(bytes, [0x40, 0x02, 0x03, 0x04]);
        assert_eq!(
            Repr::parse(&Packet::new_unchecked(&bytes[..]), SeqFormat::Long),
            Ok(Repr {
                flags: Flags::END,
                seq_number: 0x020304,
                format: SeqFormat::Long,
            })
        );
    }

    #[test]
    fn test_serial_arithmetic() {
        let short = SeqFormat::Short;
        assert_eq!(short.next(0x0fff), 0);
        assert_eq!(short.distance(4094, 1), 3);
        assert!(short.precedes(4095, 0));
        assert!(!short.precedes(0, 4095));
        assert!(!short.precedes(7, 7));
        assert!(short.precedes(1, 2048));
        assert!(!short.precedes(1, 2049));

        let long = SeqFormat::Long;
        assert_eq!(long.next(0x00ff_ffff), 0);
        assert!(long.precedes(0x00ff_fff0, 3));
    }
}
