use crate::buffer::Buffer;
use crate::seq::Sequence;
use crate::sorted::SortedVec;
use crate::Channel;

/// A packet retained by a channel, either awaiting acknowledgment (send side) or awaiting its
/// predecessors (receive side).
#[derive(Debug)]
pub struct Packet {
    pub channel: Channel,
    pub sequence: Sequence,
    pub buffer: Option<Buffer>,
    // Last send time (send side) or arrival time (receive side)
    pub time_ms: u64,
}

impl Packet {
    pub fn new(channel: Channel, sequence: Sequence, buffer: Option<Buffer>, time_ms: u64) -> Self {
        Self {
            channel,
            sequence,
            buffer,
            time_ms,
        }
    }

    pub fn payload(&self) -> &[u8] {
        self.buffer.as_ref().map_or(&[], |buffer| buffer.as_bytes())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Stash {
    Accepted,
    Duplicate,
}

/// One direction of one channel: the next sequence number and its packet pool.
#[derive(Debug)]
pub struct ChannelState {
    // Next sequence to assign (send) or deliver (receive)
    next_sequence: Sequence,
    // Keyed by sequence, ascending
    pool: SortedVec<Sequence, Packet>,
}

impl Default for ChannelState {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelState {
    pub fn new() -> Self {
        Self {
            next_sequence: Sequence::FIRST,
            pool: SortedVec::new(),
        }
    }

    #[cfg(test)]
    pub fn next_sequence(&self) -> Sequence {
        self.next_sequence
    }

    pub fn pending(&self) -> usize {
        self.pool.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pool.is_empty()
    }

    /// Returns a fresh nonzero sequence number for an outbound reliable packet.
    pub fn assign(&mut self) -> Sequence {
        self.next_sequence.advance()
    }

    /// Holds an outbound packet until it is acknowledged.
    pub fn retain(&mut self, packet: Packet) {
        debug_assert!(packet.sequence.is_reliable());

        // Assigned sequences only grow, so this is an append in practice
        self.pool.push(packet.sequence, packet);
    }

    /// Removes the packet with the given sequence from the send pool. Returns `None` if no such
    /// packet exists, e.g. because it was acknowledged already.
    pub fn acknowledge(&mut self, sequence: Sequence) -> Option<Packet> {
        self.pool.remove(&sequence)
    }

    /// Calls `f` for every retained packet last sent at least `timeout_ms` ago. If `f` returns
    /// true, the packet's send time is updated to `now_ms`.
    pub fn for_each_due<F>(&mut self, now_ms: u64, timeout_ms: u64, mut f: F)
    where
        F: FnMut(&Packet) -> bool,
    {
        for packet in self.pool.values_mut() {
            if now_ms.saturating_sub(packet.time_ms) >= timeout_ms && f(packet) {
                packet.time_ms = now_ms;
            }
        }
    }

    /// Buffers an inbound packet on an ordered channel. Packets preceding the next expected
    /// sequence, or already buffered, are duplicates.
    pub fn stash(&mut self, packet: Packet) -> Stash {
        debug_assert!(packet.sequence.is_reliable());

        if packet.sequence < self.next_sequence || self.pool.contains(&packet.sequence) {
            return Stash::Duplicate;
        }

        self.pool.insert(packet.sequence, packet);

        return Stash::Accepted;
    }

    /// True if the next expected packet has been received.
    pub fn has_ready(&self) -> bool {
        match self.pool.first() {
            Some((sequence, _)) => *sequence == self.next_sequence,
            None => false,
        }
    }

    /// Removes and returns the next expected packet, if it has been received.
    pub fn pop_ready(&mut self) -> Option<Packet> {
        if self.has_ready() {
            let (_, packet) = self.pool.pop_first()?;

            self.next_sequence = self.next_sequence.next();

            return Some(packet);
        }

        return None;
    }

    pub fn clear(&mut self) {
        self.pool.clear();
    }
}

/// Send and receive state for an ordered channel.
#[derive(Debug, Default)]
pub struct DuplexChannelState {
    pub tx: ChannelState,
    pub rx: ChannelState,
}
