/*

Linkwire is a connectionless reliable-messaging layer over UDP. A terminal owns one socket and keeps
a link for every remote host it has exchanged datagrams with. There is no handshake: a link comes
into existence the first time a host is sent to, or the first time an admitted host sends data or a
ping.

# Datagram format

Every datagram begins with a 4-byte header, followed by zero or more payload bytes:

  byte 0    version (high nibble) | flags (low nibble)
  byte 1    channel
  byte 2-3  sequence number, big endian

The version is currently 1. Datagrams bearing any other version are discarded. The flag bits are:

  0x1  PING
  0x2  ACK
  0x4  FIN
  0x8  reserved, must be zero

A datagram with no flags set carries data. PING|ACK is a pong. No other combination is valid.

# Channels

There are 256 channels. Channels 0-127 are ordered: reliable data on these channels is delivered in
sequence order, and later packets are pooled until their predecessors arrive. Channels 128-255 are
unordered: data is delivered as soon as it arrives.

# Reliability

Sequence number zero marks unreliable data. It is delivered at most once and never acknowledged or
resent. Reliable data is assigned a nonzero sequence number, per channel, per link, starting at 1
and skipping zero on wrap. The sender retains each reliable packet until an ACK bearing its channel
and sequence number arrives, resending it every resend timeout. The receiver acknowledges every
reliable datagram it accepts, including duplicates, so that a lost ACK is repaired by the next
resend.

Sequence numbers are compared using serial-number arithmetic, i.e. a < b iff the forward distance
from a to b is nonzero and less than 2^15.

# Liveness

A link which has been silent for the ping timeout is pinged, unless a previous ping is still
unanswered. A link which has been silent for the unlink timeout is dropped. A FIN drops the link at
the receiver immediately. Pending packets are abandoned in both cases.

*/

mod buffer;
mod error;
mod frame;
mod link;
mod seq;
mod socket;
mod sorted;
pub mod terminal;

use std::fmt;

pub use buffer::{Allocator, Buffer, HeapAllocator, PoolAllocator};
pub use error::{Error, Result};
pub use frame::FrameError;
pub use seq::Sequence;
pub use socket::{Socket, UdpSocket};
pub use terminal::{Clock, Config, Epoch, Message, Terminal};

/// Address of a remote terminal.
pub type Host = std::net::SocketAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendMode {
    /// Resent until acknowledged; ordered on channels 0-127.
    Reliable,
    /// Sent once, delivered at most once.
    Unreliable,
}

/// A channel identifier. Channels below 128 are ordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Channel(u8);

impl Channel {
    pub const fn new(id: u8) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn is_ordered(self) -> bool {
        self.0 < 128
    }

    // Index into the ordered or unordered channel table
    pub(crate) const fn index(self) -> usize {
        (self.0 & 0x7F) as usize
    }
}

impl From<u8> for Channel {
    fn from(id: u8) -> Self {
        Self(id)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_tables() {
        assert!(Channel::new(0).is_ordered());
        assert!(Channel::new(127).is_ordered());
        assert!(!Channel::new(128).is_ordered());
        assert!(!Channel::new(255).is_ordered());

        assert_eq!(Channel::new(5).index(), 5);
        assert_eq!(Channel::new(128).index(), 0);
        assert_eq!(Channel::new(200).index(), 72);
    }
}
