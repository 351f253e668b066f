//! Fixed-capacity pools owned by a single worker.
//!
//! [`PacketPool`] recycles byte chunks; [`SessionPool`] is a slab whose ids
//! carry a generation. Neither is shared across threads.

use std::fmt;

use slab::Slab;

/// A fixed-capacity byte chunk with a logical length and a send cursor.
pub struct Packet {
    buf: Box<[u8]>,
    len: usize,
    sent: usize,
}

impl Packet {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
            sent: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Bytes already written out to a socket.
    #[inline]
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// True once every filled byte has been sent.
    #[inline]
    pub fn is_drained(&self) -> bool {
        self.sent == self.len
    }

    /// Free space after the filled region, for a `recv` to write into.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.len..]
    }

    /// Marks `n` bytes of [`Self::spare_mut`] as filled.
    pub fn commit(&mut self, n: usize) {
        debug_assert!(self.len + n <= self.buf.len());
        self.len = (self.len + n).min(self.buf.len());
    }

    /// Filled bytes not yet sent.
    pub fn unsent(&self) -> &[u8] {
        &self.buf[self.sent..self.len]
    }

    /// Moves the send cursor forward by `n` bytes.
    pub fn advance(&mut self, n: usize) {
        debug_assert!(self.sent + n <= self.len);
        self.sent = (self.sent + n).min(self.len);
    }

    fn reset(&mut self) {
        self.len = 0;
        self.sent = 0;
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len)
            .field("sent", &self.sent)
            .field("capacity", &self.buf.len())
            .finish()
    }
}

/// Bounded packet allocator. Buffers are created lazily up to `capacity` and
/// recycled through a free list afterwards.
#[derive(Debug)]
pub struct PacketPool {
    free: Vec<Packet>,
    packet_size: usize,
    capacity: usize,
    outstanding: usize,
}

impl PacketPool {
    pub fn new(capacity: usize, packet_size: usize) -> Self {
        Self {
            free: Vec::with_capacity(capacity.min(1024)),
            packet_size,
            capacity,
            outstanding: 0,
        }
    }

    /// Hands out an empty packet, or `None` when every packet is in use.
    pub fn alloc(&mut self) -> Option<Packet> {
        if self.outstanding >= self.capacity {
            return None;
        }
        let packet = self
            .free
            .pop()
            .unwrap_or_else(|| Packet::with_capacity(self.packet_size));
        self.outstanding += 1;
        Some(packet)
    }

    pub fn free(&mut self, mut packet: Packet) {
        debug_assert!(self.outstanding > 0, "packet freed twice");
        packet.reset();
        self.outstanding = self.outstanding.saturating_sub(1);
        self.free.push(packet);
    }

    /// Packets currently handed out.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn available(&self) -> usize {
        self.capacity - self.outstanding
    }
}

/// Key of a live entry in a [`SessionPool`]. The generation makes ids of
/// removed entries stop resolving after their slab slot is reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId {
    key: usize,
    generation: u32,
}

impl SessionId {
    /// Slab slot, shared by every id that ever lived there.
    #[inline]
    pub fn key(&self) -> usize {
        self.key
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.key, self.generation)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.key, self.generation)
    }
}

struct Entry<T> {
    generation: u32,
    value: T,
}

/// Fixed-capacity slab of sessions keyed by [`SessionId`].
pub struct SessionPool<T> {
    slab: Slab<Entry<T>>,
    capacity: usize,
    next_generation: u32,
}

impl<T> SessionPool<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slab: Slab::with_capacity(capacity.min(4096)),
            capacity,
            next_generation: 0,
        }
    }

    /// Stores `value`, handing it back when the pool is full.
    pub fn insert(&mut self, value: T) -> Result<SessionId, T> {
        if self.is_full() {
            return Err(value);
        }
        let entry = self.slab.vacant_entry();
        let id = SessionId {
            key: entry.key(),
            generation: self.next_generation,
        };
        self.next_generation = self.next_generation.wrapping_add(1);
        entry.insert(Entry {
            generation: id.generation,
            value,
        });
        Ok(id)
    }

    pub fn get(&self, id: SessionId) -> Option<&T> {
        self.slab
            .get(id.key)
            .filter(|entry| entry.generation == id.generation)
            .map(|entry| &entry.value)
    }

    pub fn get_mut(&mut self, id: SessionId) -> Option<&mut T> {
        self.slab
            .get_mut(id.key)
            .filter(|entry| entry.generation == id.generation)
            .map(|entry| &mut entry.value)
    }

    pub fn remove(&mut self, id: SessionId) -> Option<T> {
        self.get(id)?;
        Some(self.slab.remove(id.key).value)
    }

    pub fn len(&self) -> usize {
        self.slab.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slab.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.slab.len() >= self.capacity
    }

    /// Ids of every live entry.
    pub fn ids(&self) -> Vec<SessionId> {
        self.slab
            .iter()
            .map(|(key, entry)| SessionId {
                key,
                generation: entry.generation,
            })
            .collect()
    }
}
