mod epoch;

use std::io;
use std::net;
use std::sync::Arc;
use std::time;

use crate::buffer::{Allocator, Buffer, HeapAllocator};
use crate::error::{Error, Result};
use crate::frame::{self, Header, Kind};
use crate::link::{self, HostContext, Inbound, Link, UpkeepAction};
use crate::seq::Sequence;
use crate::socket::{Socket, UdpSocket};
use crate::sorted::SortedVec;
use crate::{Channel, Host, SendMode};

pub use epoch::{Clock, Epoch};

// 1500-byte Ethernet MTU less IPv4 and UDP headers
const DATAGRAM_SIZE_SAFE: usize = 1472;
// Largest UDP payload over IPv4
const DATAGRAM_SIZE_MAX: usize = 65507;

const PAYLOAD_SIZE_MAX_DEFAULT: usize = DATAGRAM_SIZE_SAFE - frame::HEADER_SIZE;
const PAYLOAD_SIZE_MAX_MAX: usize = DATAGRAM_SIZE_MAX - frame::HEADER_SIZE;

const RESEND_TIMEOUT_DEFAULT_MS: u64 = 200;
const PING_TIMEOUT_DEFAULT_MS: u64 = 1_000;
const UNLINK_TIMEOUT_DEFAULT_MS: u64 = 10_000;

/// Materializes the payload of a received datagram.
pub type BuildBuffer = Arc<dyn Fn(&Arc<dyn Allocator>, &[u8]) -> Buffer + Send + Sync>;

/// Invoked with the remote host and whether the link timed out (as opposed to the remote
/// sending a FIN).
pub type UnlinkCallback = Arc<dyn Fn(&Host, bool) + Send + Sync>;

/// Decides whether an unknown remote host may establish a link.
pub type AdmitFilter = Box<dyn FnMut(&Host) -> bool + Send>;

/// Configuration for a [`Terminal`] object.
#[derive(Clone)]
pub struct Config {
    /// Maximum number of payload bytes per datagram, excluding the 4-byte header.
    ///
    /// Minimum value: 1 \
    /// Maximum value: 65,503 \
    /// Default value: 1,468
    pub payload_size_max: usize,

    /// Time after which an unacknowledged reliable packet is resent, in milliseconds.
    ///
    /// Minimum value: 1 \
    /// Default value: 200
    pub resend_timeout_ms: u64,

    /// Period of inbound silence after which a link is probed with a ping, in milliseconds.
    ///
    /// Minimum value: 1 \
    /// Default value: 1,000
    pub ping_timeout_ms: u64,

    /// Period of inbound silence after which a link is dropped, in milliseconds. Must exceed
    /// `ping_timeout_ms`.
    ///
    /// Default value: 10,000
    pub unlink_timeout_ms: u64,

    /// Allocator backing every received payload.
    pub allocator: Arc<dyn Allocator>,

    /// Constructs received payload buffers from raw datagram bytes.
    pub build_buffer: BuildBuffer,

    /// Notified when a link is dropped by the remote or by timeout.
    pub on_unlink: Option<UnlinkCallback>,

    /// Source of link timestamps.
    pub clock: Arc<dyn Clock>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            payload_size_max: PAYLOAD_SIZE_MAX_DEFAULT,
            resend_timeout_ms: RESEND_TIMEOUT_DEFAULT_MS,
            ping_timeout_ms: PING_TIMEOUT_DEFAULT_MS,
            unlink_timeout_ms: UNLINK_TIMEOUT_DEFAULT_MS,
            allocator: Arc::new(HeapAllocator),
            build_buffer: Arc::new(Buffer::from_slice),
            on_unlink: None,
            clock: Arc::new(Epoch::new()),
        }
    }
}

impl Config {
    fn validate(&self) {
        assert!(
            self.payload_size_max > 0,
            "invalid terminal configuration: payload_size_max == 0"
        );
        assert!(
            self.payload_size_max <= PAYLOAD_SIZE_MAX_MAX,
            "invalid terminal configuration: payload_size_max > {}",
            PAYLOAD_SIZE_MAX_MAX
        );
        assert!(
            self.resend_timeout_ms > 0,
            "invalid terminal configuration: resend_timeout_ms == 0"
        );
        assert!(
            self.ping_timeout_ms > 0,
            "invalid terminal configuration: ping_timeout_ms == 0"
        );
        assert!(
            self.unlink_timeout_ms > self.ping_timeout_ms,
            "invalid terminal configuration: unlink_timeout_ms <= ping_timeout_ms"
        );
    }

    fn link_config(&self) -> link::Config {
        link::Config {
            resend_timeout_ms: self.resend_timeout_ms,
            ping_timeout_ms: self.ping_timeout_ms,
            unlink_timeout_ms: self.unlink_timeout_ms,
        }
    }
}

/// A payload delivered to the application.
#[derive(Debug)]
pub struct Message {
    pub host: Host,
    pub channel: Channel,
    pub buffer: Buffer,
}

enum Read {
    // Nothing pending on the socket
    Empty,
    // Read and thrown away
    Discarded,
    Datagram(Header, Option<Buffer>, Host),
}

struct EndpointContext<'a, S> {
    socket: &'a S,
    remote: &'a Host,
}

impl<'a, S> EndpointContext<'a, S> {
    fn new(socket: &'a S, remote: &'a Host) -> Self {
        Self { socket, remote }
    }
}

impl<'a, S> HostContext for EndpointContext<'a, S>
where
    S: Socket,
{
    fn send_frame(&mut self, header: &Header, payload: &[u8]) -> Result<()> {
        let header_bytes = header.write();
        let expected = header_bytes.len() + payload.len();

        let sent = self.socket.send_to(&[&header_bytes, payload], self.remote)?;

        if sent < expected {
            return Err(Error::ShortSend { sent, expected });
        }

        Ok(())
    }
}

/// A local endpoint: one socket and the links to every known remote host.
pub struct Terminal<S = UdpSocket> {
    // Saved configuration
    config: Config,
    link_config: link::Config,
    socket: S,
    // Always-allocated receive buffer, one byte larger than the largest valid datagram
    recv_buffer: Box<[u8]>,
    admit: AdmitFilter,
    // Table of linked peers
    peers: SortedVec<Host, Link>,
    // Always-allocated upkeep expiration buffer
    expired_buffer: Vec<Host>,
}

impl Terminal<UdpSocket> {
    /// Equivalent to calling [`Terminal::bind_with_config`] with default configuration.
    pub fn bind<A, F>(bind_addr: A, admit: F) -> Result<Self>
    where
        A: net::ToSocketAddrs,
        F: FnMut(&Host) -> bool + Send + 'static,
    {
        Self::bind_with_config(bind_addr, admit, Default::default())
    }

    /// Binds a non-blocking UDP socket at the provided address and returns a new terminal.
    ///
    /// `admit` is consulted whenever an unknown host sends data or a ping; links created by
    /// local sends are never filtered.
    pub fn bind_with_config<A, F>(bind_addr: A, admit: F, config: Config) -> Result<Self>
    where
        A: net::ToSocketAddrs,
        F: FnMut(&Host) -> bool + Send + 'static,
    {
        let socket = UdpSocket::bind(bind_addr)?;

        log::info!("[Terminal] bound to {}", socket.local_addr());

        Ok(Self::with_socket(socket, admit, config))
    }
}

impl<S> Terminal<S>
where
    S: Socket,
{
    /// Creates a terminal on top of an existing socket.
    pub fn with_socket<F>(socket: S, admit: F, config: Config) -> Self
    where
        F: FnMut(&Host) -> bool + Send + 'static,
    {
        config.validate();

        let recv_buffer = vec![0; frame::HEADER_SIZE + config.payload_size_max + 1];

        Self {
            link_config: config.link_config(),
            config,
            socket,
            recv_buffer: recv_buffer.into_boxed_slice(),
            admit: Box::new(admit),
            peers: SortedVec::new(),
            expired_buffer: Vec::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the local address of the internal socket.
    pub fn local_addr(&self) -> Host {
        self.socket.local_addr()
    }

    /// Returns the current time according to the configured clock.
    pub fn time_now_ms(&self) -> u64 {
        self.config.clock.now_ms()
    }

    /// Iterates linked hosts in ascending order.
    pub fn peers(&self) -> impl Iterator<Item = &Host> {
        self.peers.keys()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_linked(&self, host: &Host) -> bool {
        self.peers.contains(host)
    }

    /// Number of reliable packets sent to `host` which have not been acknowledged.
    pub fn pending_count(&self, host: &Host) -> usize {
        self.peers.find(host).map_or(0, |link| link.pending_count())
    }

    fn check_payload_size(&self, buffer: &Buffer) -> Result<()> {
        if buffer.cap() > self.config.payload_size_max {
            return Err(Error::PayloadTooLarge {
                size: buffer.cap(),
                max: self.config.payload_size_max,
            });
        }

        Ok(())
    }

    /// Sends `buffer` to `host` on `channel`.
    ///
    /// A reliable send to an unknown host creates a link for it. An unreliable send to an unknown
    /// host is transmitted without creating one.
    pub fn send(
        &mut self,
        host: &Host,
        channel: Channel,
        buffer: &Buffer,
        mode: SendMode,
    ) -> Result<()> {
        self.check_payload_size(buffer)?;

        let now_ms = self.config.clock.now_ms();

        let ref mut ctx = EndpointContext::new(&self.socket, host);

        let link = match mode {
            SendMode::Reliable => Some(self.peers.get_or_insert_with(*host, || {
                log::info!("[Terminal] link {} (outbound)", host);
                Link::new(*host, now_ms)
            })),
            SendMode::Unreliable => self.peers.find_mut(host),
        };

        match link {
            Some(link) => link.send(channel, buffer, mode, now_ms, ctx).map(|_| ()),
            None => {
                let header = Header::new(Kind::Data, channel, Sequence::NONE);
                ctx.send_frame(&header, buffer.as_bytes())
            }
        }
    }

    /// Sends `buffer` to every linked host. The buffer is shared, not copied, between links.
    ///
    /// Every host is attempted; the first error encountered is returned.
    pub fn broadcast(&mut self, channel: Channel, buffer: &Buffer, mode: SendMode) -> Result<()> {
        self.check_payload_size(buffer)?;

        let now_ms = self.config.clock.now_ms();

        let mut result = Ok(());

        for (host, link) in self.peers.iter_mut() {
            let ref mut ctx = EndpointContext::new(&self.socket, host);

            if let Err(err) = link.send(channel, buffer, mode, now_ms, ctx) {
                log::warn!("[Terminal] broadcast to {} failed: {}", host, err);

                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        result
    }

    /// Creates a link to `host` if none exists and sends it a ping, prompting the remote to link
    /// back. Returns true if a new link was created.
    pub fn link(&mut self, host: &Host) -> Result<bool> {
        let now_ms = self.config.clock.now_ms();

        let created = !self.peers.contains(host);

        if created {
            log::info!("[Terminal] link {} (outbound)", host);
        }

        let link = self
            .peers
            .get_or_insert_with(*host, || Link::new(*host, now_ms));

        let ref mut ctx = EndpointContext::new(&self.socket, host);

        link.ping(now_ms, ctx)?;

        Ok(created)
    }

    /// Drops the link to `host`, abandoning any unacknowledged packets, and sends the remote a
    /// FIN. Returns false if no link existed.
    pub fn unlink(&mut self, host: &Host) -> Result<bool> {
        match self.peers.remove(host) {
            Some(mut link) => {
                log::info!("[Terminal] unlink {}", host);

                link.clear();

                let ref mut ctx = EndpointContext::new(&self.socket, host);

                link.send_fin(ctx)?;

                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Drops every link. FINs are sent to all hosts; the first send error is returned.
    pub fn unlink_all(&mut self) -> Result<()> {
        let mut result = Ok(());

        while let Some((host, mut link)) = self.peers.pop_first() {
            log::info!("[Terminal] unlink {}", host);

            link.clear();

            let ref mut ctx = EndpointContext::new(&self.socket, &host);

            if let Err(err) = link.send_fin(ctx) {
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }

        result
    }

    fn drop_link(&mut self, host: &Host, timeout: bool) {
        if self.peers.remove(host).is_some() {
            if timeout {
                log::info!("[Terminal] unlink {} (timeout)", host);
            } else {
                log::info!("[Terminal] unlink {} (fin)", host);
            }

            if let Some(on_unlink) = &self.config.on_unlink {
                on_unlink(host, timeout);
            }
        }
    }

    /// Resends overdue packets, pings quiet links, and drops links which have timed out.
    ///
    /// Should be called periodically with the current time, e.g. [`Terminal::time_now_ms`].
    pub fn upkeep(&mut self, now_ms: u64) {
        let mut expired = std::mem::take(&mut self.expired_buffer);

        for (host, link) in self.peers.iter_mut() {
            let ref mut ctx = EndpointContext::new(&self.socket, host);

            match link.upkeep(&self.link_config, now_ms, ctx) {
                UpkeepAction::Continue => (),
                UpkeepAction::Unlink => expired.push(*host),
            }
        }

        for host in expired.drain(..) {
            self.drop_link(&host, true);
        }

        self.expired_buffer = expired;
    }

    fn pop_ready(&mut self) -> Option<Message> {
        for (host, link) in self.peers.iter_mut() {
            if let Some((channel, buffer)) = link.pop_ready() {
                return Some(Message {
                    host: *host,
                    channel,
                    buffer,
                });
            }
        }

        return None;
    }

    fn read_datagram(&mut self) -> Result<Read> {
        let (size, sender) = match self.socket.try_recv_from(&mut self.recv_buffer) {
            Ok(Some(result)) => result,
            Ok(None) => return Ok(Read::Empty),
            Err(err) => match err.kind() {
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionRefused
                | io::ErrorKind::Interrupted => {
                    log::warn!("[Terminal] receive error skipped: {}", err);
                    return Ok(Read::Discarded);
                }
                io::ErrorKind::InvalidData => {
                    log::debug!("[Terminal] discarded oversized datagram: {}", err);
                    return Ok(Read::Discarded);
                }
                _ => return Err(err.into()),
            },
        };

        if size > frame::HEADER_SIZE + self.config.payload_size_max {
            log::debug!("[Terminal] discarded oversized datagram from {}", sender);
            return Ok(Read::Discarded);
        }

        let (header, payload_bytes) = match Header::read(&self.recv_buffer[..size]) {
            Ok(result) => result,
            Err(err) => {
                log::debug!("[Terminal] discarded datagram from {}: {}", sender, err);
                return Ok(Read::Discarded);
            }
        };

        let payload = if header.kind == Kind::Data {
            Some((self.config.build_buffer)(&self.config.allocator, payload_bytes))
        } else {
            None
        };

        Ok(Read::Datagram(header, payload, sender))
    }

    fn handle_datagram(
        &mut self,
        header: &Header,
        payload: Option<Buffer>,
        sender: &Host,
        now_ms: u64,
    ) -> Option<Message> {
        if !self.peers.contains(sender) {
            // Only data and pings may establish a link
            match header.kind {
                Kind::Data | Kind::Ping => (),
                _ => {
                    log::debug!(
                        "[Terminal] ignored {:?} from unlinked host {}",
                        header.kind,
                        sender
                    );
                    return None;
                }
            }

            if !(self.admit)(sender) {
                log::warn!("[Terminal] rejected {}", sender);
                return None;
            }

            log::info!("[Terminal] link {} (inbound)", sender);

            self.peers.insert(*sender, Link::new(*sender, now_ms));
        }

        let link = self.peers.find_mut(sender)?;

        let ref mut ctx = EndpointContext::new(&self.socket, sender);

        match link.handle_datagram(header, payload, now_ms, ctx) {
            Inbound::None => None,
            Inbound::Deliver(channel, buffer) => Some(Message {
                host: *sender,
                channel,
                buffer,
            }),
            Inbound::Fin => {
                self.drop_link(sender, false);
                None
            }
        }
    }

    /// Returns the next message for the application without blocking, or `Ok(None)` if none is
    /// available.
    ///
    /// Buffered in-order data is delivered before the socket is read. Control datagrams (acks,
    /// pings, fins) and malformed datagrams are consumed without returning.
    pub fn receive(&mut self) -> Result<Option<Message>> {
        if let Some(message) = self.pop_ready() {
            return Ok(Some(message));
        }

        loop {
            let (header, payload, sender) = match self.read_datagram()? {
                Read::Empty => return Ok(None),
                Read::Discarded => continue,
                Read::Datagram(header, payload, sender) => (header, payload, sender),
            };

            let now_ms = self.config.clock.now_ms();

            if let Some(message) = self.handle_datagram(&header, payload, &sender, now_ms) {
                return Ok(Some(message));
            }
        }
    }

    /// Like [`Terminal::receive`], but waits up to `timeout` for a message to arrive.
    pub fn receive_timeout(&mut self, timeout: time::Duration) -> Result<Option<Message>> {
        if let Some(message) = self.receive()? {
            return Ok(Some(message));
        }

        let mut remaining_timeout = timeout;
        let mut wait_begin = time::Instant::now();

        loop {
            self.socket.wait_readable(Some(remaining_timeout))?;

            if let Some(message) = self.receive()? {
                return Ok(Some(message));
            }

            let now = time::Instant::now();
            let elapsed_time = now - wait_begin;

            if elapsed_time >= remaining_timeout {
                // No time left
                return Ok(None);
            }

            remaining_timeout -= elapsed_time;
            wait_begin = now;
        }
    }
}
