use crate::buffer::Buffer;
use crate::error::Result;
use crate::frame::{Header, Kind};
use crate::seq::Sequence;
use crate::{Channel, Host, SendMode};

mod channel;

pub use channel::{ChannelState, DuplexChannelState, Packet, Stash};

const ORDERED_CHANNEL_COUNT: usize = 128;
const UNORDERED_CHANNEL_COUNT: usize = 128;

pub trait HostContext {
    // Called to send a datagram to the remote host, header and payload as separate segments
    fn send_frame(&mut self, header: &Header, payload: &[u8]) -> Result<()>;
}

/// Liveness and retransmission timing for a link.
#[derive(Clone, Debug)]
pub struct Config {
    pub resend_timeout_ms: u64,
    pub ping_timeout_ms: u64,
    pub unlink_timeout_ms: u64,
}

#[derive(Debug, PartialEq, Eq)]
pub enum UpkeepAction {
    Continue,
    Unlink,
}

/// Outcome of processing one inbound datagram on an existing link.
#[derive(Debug, PartialEq)]
pub enum Inbound {
    /// Nothing for the application.
    None,
    /// Payload to deliver now.
    Deliver(Channel, Buffer),
    /// The remote dropped the link.
    Fin,
}

/// Per-peer protocol state.
pub struct Link {
    // Remote address
    remote: Host,
    // Time of the last data or ping send
    last_send_ms: u64,
    // Time of the last accepted inbound datagram
    last_recv_ms: u64,
    // Indexed by channel id
    ordered: Box<[DuplexChannelState]>,
    // Indexed by channel id - 128
    unordered: Box<[ChannelState]>,
}

impl Link {
    pub fn new(remote: Host, now_ms: u64) -> Self {
        Self {
            remote,
            last_send_ms: now_ms,
            last_recv_ms: now_ms,
            ordered: (0..ORDERED_CHANNEL_COUNT)
                .map(|_| DuplexChannelState::default())
                .collect(),
            unordered: (0..UNORDERED_CHANNEL_COUNT)
                .map(|_| ChannelState::new())
                .collect(),
        }
    }

    #[cfg(test)]
    pub fn last_send_ms(&self) -> u64 {
        self.last_send_ms
    }

    #[cfg(test)]
    pub fn last_recv_ms(&self) -> u64 {
        self.last_recv_ms
    }

    fn tx_state(&mut self, channel: Channel) -> &mut ChannelState {
        if channel.is_ordered() {
            &mut self.ordered[channel.index()].tx
        } else {
            &mut self.unordered[channel.index()]
        }
    }

    /// Number of reliable packets awaiting acknowledgment, across all channels.
    pub fn pending_count(&self) -> usize {
        let ordered: usize = self.ordered.iter().map(|state| state.tx.pending()).sum();
        let unordered: usize = self.unordered.iter().map(|state| state.pending()).sum();

        ordered + unordered
    }

    /// Frames and sends a data packet. Reliable packets are assigned the channel's next sequence
    /// number and retained until acknowledged.
    pub fn send<C>(
        &mut self,
        channel: Channel,
        buffer: &Buffer,
        mode: SendMode,
        now_ms: u64,
        ctx: &mut C,
    ) -> Result<Sequence>
    where
        C: HostContext,
    {
        let sequence = match mode {
            SendMode::Reliable => self.tx_state(channel).assign(),
            SendMode::Unreliable => Sequence::NONE,
        };

        let header = Header::new(Kind::Data, channel, sequence);

        log::trace!(
            "[Link {}] send channel {} sequence {} ({} bytes)",
            self.remote,
            channel,
            sequence,
            buffer.cap()
        );

        let result = ctx.send_frame(&header, buffer.as_bytes());

        // A reliable packet is retained even if the first transmission failed; the resend timer
        // covers it
        if sequence.is_reliable() {
            let packet = Packet::new(channel, sequence, Some(buffer.clone()), now_ms);
            self.tx_state(channel).retain(packet);
        }

        self.last_send_ms = now_ms;

        result.map(|_| sequence)
    }

    /// Sends a liveness probe.
    pub fn ping<C>(&mut self, now_ms: u64, ctx: &mut C) -> Result<()>
    where
        C: HostContext,
    {
        let header = Header::new(Kind::Ping, Channel::new(0), Sequence::NONE);

        log::trace!("[Link {}] ping", self.remote);

        self.last_send_ms = now_ms;

        ctx.send_frame(&header, &[])
    }

    /// Tells the remote host that this link is gone.
    pub fn send_fin<C>(&mut self, ctx: &mut C) -> Result<()>
    where
        C: HostContext,
    {
        let header = Header::new(Kind::Fin, Channel::new(0), Sequence::NONE);

        ctx.send_frame(&header, &[])
    }

    fn send_control<C>(&self, kind: Kind, channel: Channel, sequence: Sequence, ctx: &mut C)
    where
        C: HostContext,
    {
        let header = Header::new(kind, channel, sequence);

        if let Err(err) = ctx.send_frame(&header, &[]) {
            // The remote will resend or reping
            log::debug!("[Link {}] {:?} not sent: {}", self.remote, kind, err);
        }
    }

    /// Processes one inbound datagram from the remote host. `payload` is `Some` for data
    /// datagrams.
    pub fn handle_datagram<C>(
        &mut self,
        header: &Header,
        payload: Option<Buffer>,
        now_ms: u64,
        ctx: &mut C,
    ) -> Inbound
    where
        C: HostContext,
    {
        self.last_recv_ms = now_ms;

        match header.kind {
            Kind::Ping => {
                self.send_control(Kind::Pong, header.channel, header.sequence, ctx);
                Inbound::None
            }
            Kind::Pong => Inbound::None,
            Kind::Ack => {
                self.handle_ack(header.channel, header.sequence);
                Inbound::None
            }
            Kind::Fin => Inbound::Fin,
            Kind::Data => match payload {
                Some(buffer) => self.handle_data(header, buffer, now_ms, ctx),
                None => Inbound::None,
            },
        }
    }

    /// Stops retransmission of the given packet. Returns false if it was not pending.
    pub fn handle_ack(&mut self, channel: Channel, sequence: Sequence) -> bool {
        let acked = self.tx_state(channel).acknowledge(sequence).is_some();

        if !acked {
            log::debug!(
                "[Link {}] unmatched ack channel {} sequence {}",
                self.remote,
                channel,
                sequence
            );
        }

        acked
    }

    fn handle_data<C>(&mut self, header: &Header, buffer: Buffer, now_ms: u64, ctx: &mut C) -> Inbound
    where
        C: HostContext,
    {
        let channel = header.channel;
        let sequence = header.sequence;

        log::trace!(
            "[Link {}] receive channel {} sequence {} ({} bytes)",
            self.remote,
            channel,
            sequence,
            buffer.cap()
        );

        if sequence.is_reliable() {
            self.send_control(Kind::Ack, channel, sequence, ctx);
        }

        if !channel.is_ordered() || !sequence.is_reliable() {
            return Inbound::Deliver(channel, buffer);
        }

        let rx = &mut self.ordered[channel.index()].rx;

        let packet = Packet::new(channel, sequence, Some(buffer), now_ms);

        if rx.stash(packet) == Stash::Duplicate {
            log::debug!(
                "[Link {}] duplicate channel {} sequence {}",
                self.remote,
                channel,
                sequence
            );
            return Inbound::None;
        }

        match rx.pop_ready() {
            Some(packet) => match packet.buffer {
                Some(buffer) => Inbound::Deliver(channel, buffer),
                None => Inbound::None,
            },
            None => Inbound::None,
        }
    }

    /// True if some ordered channel holds its next expected packet.
    #[cfg(test)]
    pub fn has_ready(&self) -> bool {
        self.ordered.iter().any(|state| state.rx.has_ready())
    }

    /// Removes the next deliverable buffered packet from the lowest ready ordered channel.
    pub fn pop_ready(&mut self) -> Option<(Channel, Buffer)> {
        for state in self.ordered.iter_mut() {
            if let Some(packet) = state.rx.pop_ready() {
                if let Some(buffer) = packet.buffer {
                    return Some((packet.channel, buffer));
                }
            }
        }

        return None;
    }

    /// Performs time-driven maintenance: timeout detection, heartbeats and retransmission.
    pub fn upkeep<C>(&mut self, config: &Config, now_ms: u64, ctx: &mut C) -> UpkeepAction
    where
        C: HostContext,
    {
        let silence_ms = now_ms.saturating_sub(self.last_recv_ms);

        if silence_ms >= config.unlink_timeout_ms {
            return UpkeepAction::Unlink;
        }

        // The previous ping has been answered if something arrived at or after it was sent
        if self.last_send_ms <= self.last_recv_ms && silence_ms >= config.ping_timeout_ms {
            if let Err(err) = self.ping(now_ms, ctx) {
                log::debug!("[Link {}] ping not sent: {}", self.remote, err);
            }
        }

        let mut resent = false;

        let remote = self.remote;
        let resend_timeout_ms = config.resend_timeout_ms;

        let mut resend = |packet: &Packet| {
            let header = Header::new(Kind::Data, packet.channel, packet.sequence);

            log::trace!(
                "[Link {}] resend channel {} sequence {}",
                remote,
                packet.channel,
                packet.sequence
            );

            match ctx.send_frame(&header, packet.payload()) {
                Ok(()) => {
                    resent = true;
                    true
                }
                Err(err) => {
                    log::debug!("[Link {}] resend failed: {}", remote, err);
                    false
                }
            }
        };

        for state in self.ordered.iter_mut() {
            if !state.tx.is_idle() {
                state.tx.for_each_due(now_ms, resend_timeout_ms, &mut resend);
            }
        }

        for state in self.unordered.iter_mut() {
            if !state.is_idle() {
                state.for_each_due(now_ms, resend_timeout_ms, &mut resend);
            }
        }

        if resent {
            self.last_send_ms = now_ms;
        }

        UpkeepAction::Continue
    }

    /// Drops every pooled packet.
    pub fn clear(&mut self) {
        for state in self.ordered.iter_mut() {
            state.tx.clear();
            state.rx.clear();
        }

        for state in self.unordered.iter_mut() {
            state.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use crate::buffer::{Allocator, HeapAllocator};

    #[derive(Default)]
    struct MockHostContext {
        frames: Vec<(Header, Vec<u8>)>,
    }

    impl HostContext for MockHostContext {
        fn send_frame(&mut self, header: &Header, payload: &[u8]) -> Result<()> {
            self.frames.push((*header, payload.to_vec()));
            Ok(())
        }
    }

    impl MockHostContext {
        fn take(&mut self) -> Vec<(Header, Vec<u8>)> {
            std::mem::take(&mut self.frames)
        }
    }

    const CONFIG: Config = Config {
        resend_timeout_ms: 100,
        ping_timeout_ms: 1000,
        unlink_timeout_ms: 5000,
    };

    fn remote() -> Host {
        "127.0.0.1:9000".parse().unwrap()
    }

    fn buffer(bytes: &[u8]) -> Buffer {
        let allocator: Arc<dyn Allocator> = Arc::new(HeapAllocator);
        Buffer::from_slice(&allocator, bytes)
    }

    fn data(channel: u8, sequence: u16) -> Header {
        Header::new(Kind::Data, Channel::new(channel), Sequence::new(sequence))
    }

    fn delivered(inbound: Inbound) -> Option<Vec<u8>> {
        match inbound {
            Inbound::Deliver(_, buffer) => Some(buffer.as_bytes().to_vec()),
            _ => None,
        }
    }

    #[test]
    fn reliable_send_is_retained() {
        let mut ctx = MockHostContext::default();
        let mut link = Link::new(remote(), 0);

        let seq = link
            .send(Channel::new(3), &buffer(b"m1"), SendMode::Reliable, 10, &mut ctx)
            .unwrap();

        assert_eq!(seq, Sequence::new(1));
        assert_eq!(link.pending_count(), 1);
        assert_eq!(link.last_send_ms(), 10);

        let frames = ctx.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, data(3, 1));
        assert_eq!(frames[0].1, b"m1");
    }

    #[test]
    fn unreliable_send_is_not_retained() {
        let mut ctx = MockHostContext::default();
        let mut link = Link::new(remote(), 0);

        let seq = link
            .send(Channel::new(200), &buffer(b"x"), SendMode::Unreliable, 0, &mut ctx)
            .unwrap();

        assert_eq!(seq, Sequence::NONE);
        assert_eq!(link.pending_count(), 0);
        assert_eq!(ctx.take()[0].0, data(200, 0));
    }

    #[test]
    fn resend_until_acked() {
        let mut ctx = MockHostContext::default();
        let mut link = Link::new(remote(), 0);

        link.send(Channel::new(3), &buffer(b"m1"), SendMode::Reliable, 0, &mut ctx)
            .unwrap();
        ctx.take();

        // Not yet due
        link.upkeep(&CONFIG, 50, &mut ctx);
        assert!(ctx.take().is_empty());

        // Resent with the same sequence
        link.upkeep(&CONFIG, 100, &mut ctx);
        let frames = ctx.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0, data(3, 1));
        assert_eq!(frames[0].1, b"m1");

        // Resends count as sends
        assert_eq!(link.last_send_ms(), 100);

        // Timestamp was updated by the resend
        link.upkeep(&CONFIG, 150, &mut ctx);
        assert!(ctx.take().is_empty());

        let ack = Header::new(Kind::Ack, Channel::new(3), Sequence::new(1));
        link.handle_datagram(&ack, None, 160, &mut ctx);

        assert_eq!(link.pending_count(), 0);

        link.upkeep(&CONFIG, 400, &mut ctx);
        assert!(ctx.take().is_empty());
    }

    #[test]
    fn resends_hold_off_ping() {
        let mut ctx = MockHostContext::default();
        let mut link = Link::new(remote(), 0);

        link.send(Channel::new(3), &buffer(b"m1"), SendMode::Reliable, 0, &mut ctx)
            .unwrap();
        ctx.take();

        // Silent past the ping timeout, but every resend is newer than the last receive
        for now_ms in (100..=1500).step_by(100) {
            assert_eq!(link.upkeep(&CONFIG, now_ms, &mut ctx), UpkeepAction::Continue);

            let frames = ctx.take();
            assert_eq!(frames.len(), 1);
            assert_eq!(frames[0].0, data(3, 1));
        }

        assert_eq!(link.last_send_ms(), 1500);
        assert_eq!(link.last_recv_ms(), 0);

        let ack = Header::new(Kind::Ack, Channel::new(3), Sequence::new(1));
        link.handle_datagram(&ack, None, 1600, &mut ctx);

        link.upkeep(&CONFIG, 2599, &mut ctx);
        assert!(ctx.take().is_empty());

        link.upkeep(&CONFIG, 2600, &mut ctx);
        let frames = ctx.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.kind, Kind::Ping);
    }

    #[test]
    fn duplicate_ack_is_noop() {
        let mut ctx = MockHostContext::default();
        let mut link = Link::new(remote(), 0);

        link.send(Channel::new(130), &buffer(b"a"), SendMode::Reliable, 0, &mut ctx)
            .unwrap();
        link.send(Channel::new(130), &buffer(b"b"), SendMode::Reliable, 0, &mut ctx)
            .unwrap();

        assert!(link.handle_ack(Channel::new(130), Sequence::new(1)));
        assert!(!link.handle_ack(Channel::new(130), Sequence::new(1)));
        // Same sequence on another channel
        assert!(!link.handle_ack(Channel::new(131), Sequence::new(2)));

        assert_eq!(link.pending_count(), 1);
    }

    #[test]
    fn reliable_data_is_acked() {
        let mut ctx = MockHostContext::default();
        let mut link = Link::new(remote(), 0);

        let inbound = link.handle_datagram(&data(200, 7), Some(buffer(b"hi")), 5, &mut ctx);

        assert_eq!(delivered(inbound), Some(b"hi".to_vec()));
        assert_eq!(link.last_recv_ms(), 5);

        let frames = ctx.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(
            frames[0].0,
            Header::new(Kind::Ack, Channel::new(200), Sequence::new(7))
        );
        assert!(frames[0].1.is_empty());

        // Unreliable data is not acked
        link.handle_datagram(&data(200, 0), Some(buffer(b"u")), 6, &mut ctx);
        assert!(ctx.take().is_empty());
    }

    #[test]
    fn ordered_delivery() {
        let mut ctx = MockHostContext::default();
        let mut link = Link::new(remote(), 0);

        assert_eq!(
            delivered(link.handle_datagram(&data(5, 3), Some(buffer(b"3")), 0, &mut ctx)),
            None
        );
        assert!(!link.has_ready());

        assert_eq!(
            delivered(link.handle_datagram(&data(5, 1), Some(buffer(b"1")), 0, &mut ctx)),
            Some(b"1".to_vec())
        );
        assert!(link.pop_ready().is_none());

        assert_eq!(
            delivered(link.handle_datagram(&data(5, 2), Some(buffer(b"2")), 0, &mut ctx)),
            Some(b"2".to_vec())
        );

        assert!(link.has_ready());

        let (channel, buffer) = link.pop_ready().unwrap();
        assert_eq!(channel, Channel::new(5));
        assert_eq!(buffer.as_bytes(), b"3");

        assert!(link.pop_ready().is_none());

        // All three acked, in arrival order
        let acked = ctx
            .take()
            .into_iter()
            .map(|(header, _)| header.sequence.get())
            .collect::<Vec<_>>();
        assert_eq!(acked, vec![3, 1, 2]);
    }

    #[test]
    fn unreliable_data_bypasses_ordering() {
        let mut ctx = MockHostContext::default();
        let mut link = Link::new(remote(), 0);

        // Seq 1 is missing
        assert_eq!(
            delivered(link.handle_datagram(&data(5, 2), Some(buffer(b"2")), 0, &mut ctx)),
            None
        );

        assert_eq!(
            delivered(link.handle_datagram(&data(5, 0), Some(buffer(b"u")), 0, &mut ctx)),
            Some(b"u".to_vec())
        );

        let rx = &link.ordered[5].rx;
        assert_eq!(rx.pending(), 1);
        assert_eq!(rx.next_sequence(), Sequence::new(1));

        assert_eq!(
            delivered(link.handle_datagram(&data(5, 1), Some(buffer(b"1")), 0, &mut ctx)),
            Some(b"1".to_vec())
        );

        let (_, buffer) = link.pop_ready().unwrap();
        assert_eq!(buffer.as_bytes(), b"2");
    }

    #[test]
    fn ordered_duplicate_is_acked_not_delivered() {
        let mut ctx = MockHostContext::default();
        let mut link = Link::new(remote(), 0);

        link.handle_datagram(&data(5, 1), Some(buffer(b"1")), 0, &mut ctx);
        ctx.take();

        let inbound = link.handle_datagram(&data(5, 1), Some(buffer(b"1")), 0, &mut ctx);

        assert_eq!(inbound, Inbound::None);
        assert_eq!(ctx.take().len(), 1);
    }

    #[test]
    fn channels_order_independently() {
        let mut ctx = MockHostContext::default();
        let mut link = Link::new(remote(), 0);

        // A gap on channel 1 does not hold back channel 2
        link.handle_datagram(&data(1, 2), Some(buffer(b"a2")), 0, &mut ctx);

        assert_eq!(
            delivered(link.handle_datagram(&data(2, 1), Some(buffer(b"b1")), 0, &mut ctx)),
            Some(b"b1".to_vec())
        );
    }

    #[test]
    fn ping_answered_with_pong() {
        let mut ctx = MockHostContext::default();
        let mut link = Link::new(remote(), 0);

        let ping = Header::new(Kind::Ping, Channel::new(0), Sequence::NONE);
        assert_eq!(link.handle_datagram(&ping, None, 20, &mut ctx), Inbound::None);

        let frames = ctx.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.kind, Kind::Pong);

        // Control replies do not count as sends
        assert_eq!(link.last_send_ms(), 0);

        let pong = Header::new(Kind::Pong, Channel::new(0), Sequence::NONE);
        assert_eq!(link.handle_datagram(&pong, None, 30, &mut ctx), Inbound::None);
        assert!(ctx.take().is_empty());
        assert_eq!(link.last_recv_ms(), 30);
    }

    #[test]
    fn fin() {
        let mut ctx = MockHostContext::default();
        let mut link = Link::new(remote(), 0);

        let fin = Header::new(Kind::Fin, Channel::new(0), Sequence::NONE);
        assert_eq!(link.handle_datagram(&fin, None, 0, &mut ctx), Inbound::Fin);
    }

    #[test]
    fn heartbeat() {
        let mut ctx = MockHostContext::default();
        let mut link = Link::new(remote(), 0);

        // Quiet, but not for long enough
        link.upkeep(&CONFIG, 999, &mut ctx);
        assert!(ctx.take().is_empty());

        link.upkeep(&CONFIG, 1000, &mut ctx);
        let frames = ctx.take();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].0.kind, Kind::Ping);
        assert_eq!(link.last_send_ms(), 1000);

        // Outstanding ping, no repeat
        link.upkeep(&CONFIG, 2500, &mut ctx);
        assert!(ctx.take().is_empty());

        let pong = Header::new(Kind::Pong, Channel::new(0), Sequence::NONE);
        link.handle_datagram(&pong, None, 2600, &mut ctx);

        link.upkeep(&CONFIG, 3599, &mut ctx);
        assert!(ctx.take().is_empty());

        link.upkeep(&CONFIG, 3600, &mut ctx);
        assert_eq!(ctx.take()[0].0.kind, Kind::Ping);
    }

    #[test]
    fn timeout() {
        let mut ctx = MockHostContext::default();
        let mut link = Link::new(remote(), 0);

        link.send(Channel::new(0), &buffer(b"x"), SendMode::Reliable, 0, &mut ctx)
            .unwrap();
        ctx.take();

        assert_eq!(link.upkeep(&CONFIG, 4999, &mut ctx), UpkeepAction::Continue);
        ctx.take();

        // Nothing is sent once the peer is presumed gone
        assert_eq!(link.upkeep(&CONFIG, 5000, &mut ctx), UpkeepAction::Unlink);
        assert!(ctx.take().is_empty());
    }

    #[test]
    fn clear_drops_pools() {
        let mut ctx = MockHostContext::default();
        let mut link = Link::new(remote(), 0);

        let shared = buffer(b"x");

        link.send(Channel::new(1), &shared, SendMode::Reliable, 0, &mut ctx)
            .unwrap();
        link.send(Channel::new(129), &shared, SendMode::Reliable, 0, &mut ctx)
            .unwrap();

        assert_eq!(shared.ref_count(), 3);

        link.clear();

        assert_eq!(link.pending_count(), 0);
        assert_eq!(shared.ref_count(), 1);
    }
}
