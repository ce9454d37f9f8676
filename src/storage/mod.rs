/*! Specialized containers.

The `storage` module provides the node pool that holds every packet in flight.
Packets are chains of fixed-size nodes so that fragments can be spliced together
and headers prepended without copying payload octets.
*/

mod buffer;

pub use self::buffer::{BufferPool, Chunks, Node, PacketBuf, PoolError};
