#![no_std]
#![deny(unsafe_code)]

//! The _rosfrag_ library implements the datagram fragmentation machinery of a
//! small real-time network stack: reassembly of fragmented IPv4 datagrams and
//! PPP Multilink (RFC 1990) fragmentation, reassembly and bundle management.
//!
//! # Buffers
//!
//! All packet data lives in a [BufferPool](storage/struct.BufferPool.html), a fixed
//! arena of nodes that the caller provides. Packets are passed around as
//! [PacketBuf](storage/struct.PacketBuf.html) handles that own a chain of nodes.
//! Handles cannot be cloned; every operation that is handed one either passes it on
//! or returns its nodes to the pool.
//!
//! # The layers
//!
//! ## The wire layer
//!
//! The `wire` module provides zero-copy accessors for the IPv4, ICMPv4, PPP protocol
//! field and Multilink header formats, plus the serial-number arithmetic used by
//! Multilink sequence numbers.
//!
//! ## The interface layer
//!
//! The `iface` module holds the device table, the interface stack that records which
//! physical links sit under which virtual bundle interface, the timer queue, and the
//! two engines:
//!
//!   * [Ipv4Reassembler](iface/struct.Ipv4Reassembler.html), which collects IPv4
//!     fragments into complete datagrams and reports timed-out queues;
//!   * [Multilink](iface/struct.Multilink.html), which splits outbound packets across
//!     the links of a bundle and puts inbound fragments back together.
//!
//! [Interface](iface/struct.Interface.html) ties them to an inbound frame list.
//!
//! ## The physical layer
//!
//! The `phy` module defines the trait through which fragments reach link drivers.

#[cfg(test)]
#[macro_use]
extern crate std;

extern crate alloc;

#[macro_use]
mod macros;

pub mod config;
pub mod iface;
pub mod phy;
pub mod storage;
pub mod time;
pub mod wire;

#[cfg(test)]
mod tests;
