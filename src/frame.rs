use thiserror::Error;

use crate::seq::Sequence;
use crate::Channel;

pub const PROTOCOL_VERSION: u8 = 1;

pub const HEADER_SIZE: usize = 4;

const VERSION_SHIFT: u8 = 4;
const FLAGS_MASK: u8 = 0x0F;

const FLAG_PING: u8 = 0x01;
const FLAG_ACK: u8 = 0x02;
const FLAG_FIN: u8 = 0x04;

/// Datagram classification, as determined by the header's flag nibble.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Kind {
    /// No flags: application payload follows.
    Data,
    /// PING: liveness probe, doubles as a link request.
    Ping,
    /// PING|ACK: reply to a probe.
    Pong,
    /// ACK: acknowledges (channel, sequence).
    Ack,
    /// FIN: the sender has dropped the link.
    Fin,
}

impl Kind {
    fn flags(self) -> u8 {
        match self {
            Kind::Data => 0,
            Kind::Ping => FLAG_PING,
            Kind::Pong => FLAG_PING | FLAG_ACK,
            Kind::Ack => FLAG_ACK,
            Kind::Fin => FLAG_FIN,
        }
    }

    fn from_flags(flags: u8) -> Option<Self> {
        match flags {
            0 => Some(Kind::Data),
            FLAG_PING => Some(Kind::Ping),
            f if f == FLAG_PING | FLAG_ACK => Some(Kind::Pong),
            FLAG_ACK => Some(Kind::Ack),
            FLAG_FIN => Some(Kind::Fin),
            _ => None,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("truncated header ({0} bytes)")]
    Truncated(usize),
    #[error("protocol version mismatch ({0})")]
    Version(u8),
    #[error("invalid flags {0:#06b}")]
    Flags(u8),
}

/// The fixed 4-byte header at the front of every datagram.
///
/// ```text
///  0       4       8               16                              32
/// +-------+-------+---------------+-------------------------------+
/// |version| flags |    channel    |     sequence (big-endian)     |
/// +-------+-------+---------------+-------------------------------+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Header {
    pub kind: Kind,
    pub channel: Channel,
    pub sequence: Sequence,
}

impl Header {
    pub fn new(kind: Kind, channel: Channel, sequence: Sequence) -> Self {
        Self {
            kind,
            channel,
            sequence,
        }
    }

    /// Parses a header from the front of `bytes`, returning the header and the remaining payload.
    pub fn read(bytes: &[u8]) -> Result<(Header, &[u8]), FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Truncated(bytes.len()));
        }

        let version = bytes[0] >> VERSION_SHIFT;
        let flags = bytes[0] & FLAGS_MASK;

        if version != PROTOCOL_VERSION {
            return Err(FrameError::Version(version));
        }

        let kind = Kind::from_flags(flags).ok_or(FrameError::Flags(flags))?;
        let channel = Channel::new(bytes[1]);
        let sequence = Sequence::new(u16::from_be_bytes([bytes[2], bytes[3]]));

        Ok((Header::new(kind, channel, sequence), &bytes[HEADER_SIZE..]))
    }

    pub fn write(&self) -> [u8; HEADER_SIZE] {
        let sequence = self.sequence.get().to_be_bytes();

        [
            (PROTOCOL_VERSION << VERSION_SHIFT) | self.kind.flags(),
            self.channel.get(),
            sequence[0],
            sequence[1],
        ]
    }
}
