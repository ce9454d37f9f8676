use core::fmt;

use managed::ManagedSlice;

use crate::config::BUFFER_NODE_SIZE;
use crate::phy::IfIndex;

type NodeIndex = u16;

/// Error returned by [`BufferPool`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Not enough free nodes for the request.
    Exhausted,
    /// The head node has no room in front of its data.
    NoHeadroom,
    /// The request refers to octets the buffer does not hold.
    OutOfRange,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            PoolError::Exhausted => write!(f, "buffer pool exhausted"),
            PoolError::NoHeadroom => write!(f, "no headroom"),
            PoolError::OutOfRange => write!(f, "out of range"),
        }
    }
}

impl core::error::Error for PoolError {}

/// One fixed-size block of packet storage.
#[derive(Debug, Clone)]
pub struct Node {
    data: [u8; BUFFER_NODE_SIZE],
    start: u16,
    len: u16,
    next: Option<NodeIndex>,
}

impl Node {
    /// An unused node, for initializing pool storage.
    pub const EMPTY: Node = Node {
        data: [0; BUFFER_NODE_SIZE],
        start: 0,
        len: 0,
        next: None,
    };

    fn end(&self) -> usize {
        self.start as usize + self.len as usize
    }

    fn room(&self) -> usize {
        BUFFER_NODE_SIZE - self.end()
    }

    fn bytes(&self) -> &[u8] {
        &self.data[self.start as usize..self.end()]
    }
}

/// A handle to a chain of pool nodes holding one packet.
///
/// The handle owns its nodes until it is given back with [`BufferPool::free`]
/// or merged into another chain with [`BufferPool::cat`].
#[derive(Debug, PartialEq, Eq)]
#[must_use = "packet buffers must be handed on or freed"]
pub struct PacketBuf {
    head: NodeIndex,
    len: usize,
    device: Option<IfIndex>,
    sum: Option<u32>,
}

impl PacketBuf {
    /// Return the number of data octets in the chain.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Return the interface the packet arrived on or is bound to.
    pub fn device(&self) -> Option<IfIndex> {
        self.device
    }

    pub fn set_device(&mut self, device: IfIndex) {
        self.device = Some(device)
    }

    /// Return the partial ones-complement sum a driver accumulated over the payload.
    pub fn checksum_sum(&self) -> Option<u32> {
        self.sum
    }

    pub fn set_checksum_sum(&mut self, sum: Option<u32>) {
        self.sum = sum
    }

    /// Take the accumulated sum, leaving none.
    pub fn take_checksum_sum(&mut self) -> Option<u32> {
        self.sum.take()
    }
}

/// A fixed arena of buffer nodes.
///
/// Packets are chains of nodes linked by index. The first node of a chain may
/// keep unused room in front of its data so that lower layers can prepend
/// headers without copying.
#[derive(Debug)]
pub struct BufferPool<'a> {
    nodes: ManagedSlice<'a, Node>,
    free_head: Option<NodeIndex>,
    free_count: usize,
}

impl<'a> BufferPool<'a> {
    /// Create a pool over the provided node storage.
    pub fn new<S>(storage: S) -> BufferPool<'a>
    where
        S: Into<ManagedSlice<'a, Node>>,
    {
        let mut nodes = storage.into();
        let count = nodes.len().min(NodeIndex::MAX as usize + 1);
        for (index, node) in nodes.iter_mut().enumerate().take(count) {
            node.start = 0;
            node.len = 0;
            node.next = if index + 1 < count {
                Some((index + 1) as NodeIndex)
            } else {
                None
            };
        }

        BufferPool {
            nodes,
            free_head: if count > 0 { Some(0) } else { None },
            free_count: count,
        }
    }

    /// Return the number of nodes managed by the pool.
    pub fn capacity(&self) -> usize {
        self.nodes.len().min(NodeIndex::MAX as usize + 1)
    }

    /// Return the number of nodes not owned by any packet.
    pub fn free_nodes(&self) -> usize {
        self.free_count
    }

    fn take_node(&mut self) -> Result<NodeIndex, PoolError> {
        let index = self.free_head.ok_or(PoolError::Exhausted)?;
        let node = &mut self.nodes[index as usize];
        self.free_head = node.next.take();
        node.start = 0;
        node.len = 0;
        self.free_count -= 1;
        Ok(index)
    }

    fn release_node(&mut self, index: NodeIndex) {
        let node = &mut self.nodes[index as usize];
        node.start = 0;
        node.len = 0;
        node.next = self.free_head;
        self.free_head = Some(index);
        self.free_count += 1;
    }

    fn release_chain(&mut self, first: Option<NodeIndex>) {
        let mut cursor = first;
        while let Some(index) = cursor {
            cursor = self.nodes[index as usize].next;
            self.release_node(index);
        }
    }

    /// Allocate an empty packet with room for `size` octets.
    pub fn alloc(&mut self, size: usize) -> Result<PacketBuf, PoolError> {
        self.alloc_with_headroom(size, 0)
    }

    /// Allocate an empty packet with room for `size` octets, keeping `headroom`
    /// octets free in front of the data for later [`prepend`](#method.prepend) calls.
    pub fn alloc_with_headroom(
        &mut self,
        size: usize,
        headroom: usize,
    ) -> Result<PacketBuf, PoolError> {
        if headroom > BUFFER_NODE_SIZE {
            return Err(PoolError::OutOfRange);
        }
        let first_room = BUFFER_NODE_SIZE - headroom;
        let extra = size.saturating_sub(first_room).div_ceil(BUFFER_NODE_SIZE);
        if self.free_count < extra + 1 {
            return Err(PoolError::Exhausted);
        }

        let head = self.take_node()?;
        self.nodes[head as usize].start = headroom as u16;
        let mut tail = head;
        for _ in 0..extra {
            let next = self.take_node()?;
            self.nodes[tail as usize].next = Some(next);
            tail = next;
        }

        Ok(PacketBuf {
            head,
            len: 0,
            device: None,
            sum: None,
        })
    }

    /// Return every node of the packet to the pool.
    pub fn free(&mut self, buf: PacketBuf) {
        self.release_chain(Some(buf.head))
    }

    /// The node that the next appended octet goes into: the last one holding data.
    fn write_node(&self, buf: &PacketBuf) -> NodeIndex {
        let mut cursor = buf.head;
        let mut last = buf.head;
        loop {
            let node = &self.nodes[cursor as usize];
            if node.len > 0 {
                last = cursor;
            }
            match node.next {
                Some(next) => cursor = next,
                None => return last,
            }
        }
    }

    fn room(&self, buf: &PacketBuf) -> usize {
        let mut room = self.free_count * BUFFER_NODE_SIZE;
        let mut cursor = Some(self.write_node(buf));
        while let Some(index) = cursor {
            let node = &self.nodes[index as usize];
            room += node.room();
            cursor = node.next;
        }
        room
    }

    /// Append octets at the end of the packet, taking extra nodes when the
    /// reserved ones are full. Nothing is written if the pool cannot hold all of `data`.
    pub fn append(&mut self, buf: &mut PacketBuf, mut data: &[u8]) -> Result<(), PoolError> {
        if self.room(buf) < data.len() {
            return Err(PoolError::Exhausted);
        }

        let mut cursor = self.write_node(buf);
        while !data.is_empty() {
            let node = &mut self.nodes[cursor as usize];
            let count = node.room().min(data.len());
            let end = node.end();
            node.data[end..end + count].copy_from_slice(&data[..count]);
            node.len += count as u16;
            buf.len += count;
            data = &data[count..];
            if data.is_empty() {
                break;
            }

            let next = node.next;
            cursor = match next {
                Some(next) => next,
                None => {
                    let next = self.take_node()?;
                    self.nodes[cursor as usize].next = Some(next);
                    next
                }
            };
        }
        Ok(())
    }

    /// Write `data` in front of the packet, using headroom when there is enough
    /// and linking a fresh head node otherwise.
    pub fn prepend(&mut self, buf: &mut PacketBuf, data: &[u8]) -> Result<(), PoolError> {
        if self.nodes[buf.head as usize].start as usize >= data.len() {
            self.push(buf, data.len())?;
            self.head_mut(buf)[..data.len()].copy_from_slice(data);
            return Ok(());
        }
        if data.len() > BUFFER_NODE_SIZE {
            return Err(PoolError::OutOfRange);
        }

        let index = self.take_node()?;
        let node = &mut self.nodes[index as usize];
        let start = BUFFER_NODE_SIZE - data.len();
        node.data[start..].copy_from_slice(data);
        node.start = start as u16;
        node.len = data.len() as u16;
        node.next = Some(buf.head);
        buf.head = index;
        buf.len += data.len();
        Ok(())
    }

    /// Hide `count` octets at the front of the head node, keeping them as headroom.
    pub fn pull(&mut self, buf: &mut PacketBuf, count: usize) -> Result<(), PoolError> {
        let node = &mut self.nodes[buf.head as usize];
        if count > node.len as usize {
            return Err(PoolError::OutOfRange);
        }
        node.start += count as u16;
        node.len -= count as u16;
        buf.len -= count;
        Ok(())
    }

    /// Expose `count` octets of headroom in front of the data.
    pub fn push(&mut self, buf: &mut PacketBuf, count: usize) -> Result<(), PoolError> {
        let node = &mut self.nodes[buf.head as usize];
        if count > node.start as usize {
            return Err(PoolError::NoHeadroom);
        }
        node.start -= count as u16;
        node.len += count as u16;
        buf.len += count;
        Ok(())
    }

    /// Remove `count` octets from the front of the packet.
    ///
    /// Nodes emptied by the trim are returned to the pool, except the last one.
    pub fn trim_front(&mut self, buf: &mut PacketBuf, count: usize) {
        let mut count = count.min(buf.len);
        buf.len -= count;
        while count > 0 {
            let head = buf.head;
            let node = &mut self.nodes[head as usize];
            let step = (node.len as usize).min(count);
            node.start += step as u16;
            node.len -= step as u16;
            count -= step;

            if node.len == 0 {
                let next = node.next;
                match next {
                    Some(next) => {
                        buf.head = next;
                        self.release_node(head);
                    }
                    None => break,
                }
            }
        }
    }

    /// Shorten the packet to `len` octets, releasing nodes past the new end.
    pub fn truncate(&mut self, buf: &mut PacketBuf, len: usize) {
        if len >= buf.len {
            return;
        }

        let mut keep = len;
        let mut cursor = buf.head;
        loop {
            let node = &mut self.nodes[cursor as usize];
            if keep <= node.len as usize {
                node.len = keep as u16;
                let rest = node.next.take();
                self.release_chain(rest);
                break;
            }
            keep -= node.len as usize;
            match node.next {
                Some(next) => cursor = next,
                None => break,
            }
        }
        buf.len = len;
    }

    /// Link `src` after the data of `dst`. Reserved but unused nodes at the
    /// end of `dst` are released first.
    pub fn cat(&mut self, dst: &mut PacketBuf, src: PacketBuf) {
        let last = self.write_node(dst);
        let trailing = self.nodes[last as usize].next.take();
        self.release_chain(trailing);
        self.nodes[last as usize].next = Some(src.head);
        dst.len += src.len;
    }

    /// Return the data held by the head node.
    pub fn head(&self, buf: &PacketBuf) -> &[u8] {
        self.nodes[buf.head as usize].bytes()
    }

    pub fn head_mut(&mut self, buf: &PacketBuf) -> &mut [u8] {
        let node = &mut self.nodes[buf.head as usize];
        let range = node.start as usize..node.end();
        &mut node.data[range]
    }

    /// Iterate over the non-empty data segments of the packet, in order.
    pub fn chunks(&self, buf: &PacketBuf) -> Chunks<'_> {
        Chunks {
            nodes: &self.nodes,
            next: Some(buf.head),
        }
    }

    /// Copy octets starting at `offset` into `out`, returning how many were copied.
    pub fn copy_out(&self, buf: &PacketBuf, offset: usize, out: &mut [u8]) -> usize {
        let mut skip = offset;
        let mut written = 0;
        for chunk in self.chunks(buf) {
            if written == out.len() {
                break;
            }
            if skip >= chunk.len() {
                skip -= chunk.len();
                continue;
            }
            let chunk = &chunk[skip..];
            let count = chunk.len().min(out.len() - written);
            out[written..written + count].copy_from_slice(&chunk[..count]);
            written += count;
            skip = 0;
        }
        written
    }

    /// Return the octet at `offset`.
    pub fn byte(&self, buf: &PacketBuf, offset: usize) -> Option<u8> {
        let mut octet = [0u8];
        match self.copy_out(buf, offset, &mut octet) {
            1 => Some(octet[0]),
            _ => None,
        }
    }

    /// Append `len` octets of `src`, starting at `offset`, to `dst`.
    pub fn copy_chain(
        &mut self,
        dst: &mut PacketBuf,
        src: &PacketBuf,
        offset: usize,
        len: usize,
    ) -> Result<(), PoolError> {
        if offset + len > src.len {
            return Err(PoolError::OutOfRange);
        }
        if self.room(dst) < len {
            return Err(PoolError::Exhausted);
        }

        let mut scratch = [0u8; 64];
        let mut done = 0;
        while done < len {
            let want = (len - done).min(scratch.len());
            let got = self.copy_out(src, offset + done, &mut scratch[..want]);
            if got == 0 {
                return Err(PoolError::OutOfRange);
            }
            self.append(dst, &scratch[..got])?;
            done += got;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn to_vec(&self, buf: &PacketBuf) -> alloc::vec::Vec<u8> {
        let mut data = alloc::vec::Vec::with_capacity(buf.len);
        for chunk in self.chunks(buf) {
            data.extend_from_slice(chunk);
        }
        data
    }
}

/// Iterator over the data segments of a packet.
#[derive(Debug)]
pub struct Chunks<'p> {
    nodes: &'p [Node],
    next: Option<NodeIndex>,
}

impl<'p> Iterator for Chunks<'p> {
    type Item = &'p [u8];

    fn next(&mut self) -> Option<&'p [u8]> {
        while let Some(index) = self.next {
            let node = &self.nodes[index as usize];
            self.next = node.next;
            if node.len > 0 {
                return Some(node.bytes());
            }
        }
        None
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::vec::Vec;

    fn pool(nodes: usize) -> BufferPool<'static> {
        BufferPool::new(vec![Node::EMPTY; nodes])
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_alloc_reserves_nodes() {
        let mut pool = pool(8);
        let buf = pool.alloc(BUFFER_NODE_SIZE * 2 + 1).unwrap();
        assert_eq!(pool.free_nodes(), 5);
        assert!(buf.is_empty());
        pool.free(buf);
        assert_eq!(pool.free_nodes(), 8);
    }

    #[test]
    fn test_alloc_exhausted() {
        let mut pool = pool(2);
        assert_eq!(
            pool.alloc(BUFFER_NODE_SIZE * 3),
            Err(PoolError::Exhausted)
        );
        assert_eq!(pool.free_nodes(), 2);
    }

    #[test]
    fn test_append_spans_nodes() {
        let mut pool = pool(8);
        let data = pattern(700);
        let mut buf = pool.alloc(100).unwrap();
        pool.append(&mut buf, &data).unwrap();
        assert_eq!(buf.len(), 700);
        assert_eq!(pool.free_nodes(), 5);
        assert_eq!(pool.to_vec(&buf), data);
        pool.free(buf);
        assert_eq!(pool.free_nodes(), 8);
    }

    #[test]
    fn test_append_is_atomic() {
        let mut pool = pool(2);
        let mut buf = pool.alloc(10).unwrap();
        assert_eq!(
            pool.append(&mut buf, &pattern(BUFFER_NODE_SIZE * 3)),
            Err(PoolError::Exhausted)
        );
        assert!(buf.is_empty());
        pool.free(buf);
        assert_eq!(pool.free_nodes(), 2);
    }

    #[test]
    fn test_prepend_uses_headroom() {
        let mut pool = pool(4);
        let mut buf = pool.alloc_with_headroom(4, 8).unwrap();
        pool.append(&mut buf, &[5, 6, 7, 8]).unwrap();
        pool.prepend(&mut buf, &[1, 2, 3, 4]).unwrap();
        assert_eq!(pool.to_vec(&buf), [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(pool.free_nodes(), 3);

        // No headroom left: a fresh node is linked in front.
        pool.prepend(&mut buf, &[0xff; 6]).unwrap();
        assert_eq!(pool.free_nodes(), 2);
        assert_eq!(buf.len(), 14);
        assert_eq!(&pool.to_vec(&buf)[..7], &[0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 1]);
        pool.free(buf);
        assert_eq!(pool.free_nodes(), 4);
    }

    #[test]
    fn test_pull_push() {
        let mut pool = pool(2);
        let mut buf = pool.alloc(8).unwrap();
        pool.append(&mut buf, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        pool.pull(&mut buf, 3).unwrap();
        assert_eq!(pool.head(&buf), &[4, 5, 6, 7, 8]);
        assert_eq!(pool.push(&mut buf, 4), Err(PoolError::NoHeadroom));
        pool.push(&mut buf, 3).unwrap();
        assert_eq!(pool.head(&buf), &[1, 2, 3, 4, 5, 6, 7, 8]);
        pool.free(buf);
    }

    #[test]
    fn test_trim_front_releases_nodes() {
        let mut pool = pool(8);
        let data = pattern(600);
        let mut buf = pool.alloc(600).unwrap();
        pool.append(&mut buf, &data).unwrap();
        assert_eq!(pool.free_nodes(), 5);

        pool.trim_front(&mut buf, BUFFER_NODE_SIZE + 10);
        assert_eq!(pool.free_nodes(), 6);
        assert_eq!(pool.to_vec(&buf), &data[BUFFER_NODE_SIZE + 10..]);

        pool.trim_front(&mut buf, 1000);
        assert!(buf.is_empty());
        assert_eq!(pool.free_nodes(), 7);
        pool.free(buf);
        assert_eq!(pool.free_nodes(), 8);
    }

    #[test]
    fn test_truncate() {
        let mut pool = pool(8);
        let data = pattern(600);
        let mut buf = pool.alloc(600).unwrap();
        pool.append(&mut buf, &data).unwrap();
        pool.truncate(&mut buf, 100);
        assert_eq!(pool.to_vec(&buf), &data[..100]);
        assert_eq!(pool.free_nodes(), 7);
        pool.free(buf);
    }

    #[test]
    fn test_cat_and_copy_chain() {
        let mut pool = pool(8);
        let mut a = pool.alloc(BUFFER_NODE_SIZE * 2).unwrap();
        pool.append(&mut a, &[1, 2, 3]).unwrap();
        let mut b = pool.alloc(3).unwrap();
        pool.append(&mut b, &[4, 5, 6]).unwrap();
        assert_eq!(pool.free_nodes(), 5);

        pool.cat(&mut a, b);
        assert_eq!(pool.free_nodes(), 6);
        assert_eq!(a.len(), 6);
        assert_eq!(pool.to_vec(&a), [1, 2, 3, 4, 5, 6]);
        assert_eq!(pool.byte(&a, 4), Some(5));
        assert_eq!(pool.byte(&a, 6), None);

        let mut c = pool.alloc(4).unwrap();
        pool.copy_chain(&mut c, &a, 2, 4).unwrap();
        assert_eq!(pool.to_vec(&c), [3, 4, 5, 6]);
        assert_eq!(
            pool.copy_chain(&mut c, &a, 4, 4),
            Err(PoolError::OutOfRange)
        );

        pool.free(a);
        pool.free(c);
        assert_eq!(pool.free_nodes(), 8);
    }
}
