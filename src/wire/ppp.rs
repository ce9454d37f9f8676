use byteorder::{ByteOrder, NetworkEndian};
use core::fmt;

use super::{Error, Result};

enum_with_unknown! {
    /// PPP protocol field value.
    pub enum Protocol(u16) {
        Ipv4      = 0x0021,
        Ipv6      = 0x0057,
        Multilink = 0x003d,
        Ipcp      = 0x8021,
        Ipv6cp    = 0x8057,
        Lcp       = 0xc021,
        Pap       = 0xc023,
        Chap      = 0xc223,
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Protocol::Ipv4 => write!(f, "IPv4"),
            Protocol::Ipv6 => write!(f, "IPv6"),
            Protocol::Multilink => write!(f, "MP"),
            Protocol::Ipcp => write!(f, "IPCP"),
            Protocol::Ipv6cp => write!(f, "IPV6CP"),
            Protocol::Lcp => write!(f, "LCP"),
            Protocol::Pap => write!(f, "PAP"),
            Protocol::Chap => write!(f, "CHAP"),
            Protocol::Unknown(id) => write!(f, "0x{id:04x}"),
        }
    }
}

impl Protocol {
    /// Query whether the value fits the one-octet form of protocol field compression.
    pub fn is_compressible(&self) -> bool {
        u16::from(*self) <= 0xff
    }

    /// Return the length of the protocol field as it would be emitted.
    pub fn field_len(&self, compress: bool) -> usize {
        if compress && self.is_compressible() {
            1
        } else {
            2
        }
    }

    /// Parse a protocol field, compressed or not, from the front of `data`.
    ///
    /// Returns the protocol and the number of octets it occupied. An odd first
    /// octet is a complete compressed field.
    pub fn parse(data: &[u8]) -> Result<(Protocol, usize)> {
        match data {
            [first, ..] if first & 1 != 0 => Ok((Protocol::from(*first as u16), 1)),
            [_, second, ..] if second & 1 != 0 => {
                Ok((Protocol::from(NetworkEndian::read_u16(data)), 2))
            }
            _ => Err(Error),
        }
    }

    /// Emit the protocol field into the front of `data`, returning its length.
    ///
    /// # Panics
    /// This function panics if `data` is shorter than [field_len](#method.field_len).
    pub fn emit(&self, compress: bool, data: &mut [u8]) -> usize {
        let value = u16::from(*self);
        if compress && self.is_compressible() {
            data[0] = value as u8;
            1
        } else {
            NetworkEndian::write_u16(&mut data[..2], value);
            2
        }
    }
}
