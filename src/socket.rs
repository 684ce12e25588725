use std::io;
use std::io::IoSlice;
use std::net;
use std::time;

use socket2::{SockAddr, SockRef};

use crate::Host;

const SOCKET_POLLING_KEY: usize = 0;

// WSAEMSGSIZE
#[cfg(windows)]
const MESSAGE_TOO_LONG: i32 = 10040;

// Windows fails the read when a datagram is larger than the buffer, rather than truncating
#[cfg(windows)]
fn is_message_too_long(err: &io::Error) -> bool {
    err.raw_os_error() == Some(MESSAGE_TOO_LONG)
}

#[cfg(not(windows))]
fn is_message_too_long(_err: &io::Error) -> bool {
    false
}

/// Datagram I/O consumed by a [`Terminal`](crate::Terminal).
pub trait Socket {
    /// Sends the concatenation of `segments` as one datagram to `dest`. Returns the number of
    /// bytes sent.
    fn send_to(&self, segments: &[&[u8]], dest: &Host) -> io::Result<usize>;

    /// Reads one datagram into `buffer` without blocking. Returns `Ok(None)` if none is pending.
    ///
    /// A datagram larger than `buffer` is either truncated or consumed and reported as
    /// [`io::ErrorKind::InvalidData`].
    fn try_recv_from(&self, buffer: &mut [u8]) -> io::Result<Option<(usize, Host)>>;

    /// Blocks for up to `timeout` until a datagram may be read. Returns false on timeout or
    /// spurious wakeup.
    fn wait_readable(&mut self, timeout: Option<time::Duration>) -> io::Result<bool>;

    fn local_addr(&self) -> Host;
}

/// A non-blocking UDP socket.
pub struct UdpSocket {
    socket: net::UdpSocket,
    // Cached from socket initialization
    local_addr: net::SocketAddr,
    // Polling objects
    poller: polling::Poller,
    poller_events: polling::Events,
}

impl UdpSocket {
    pub fn bind<A>(bind_address: A) -> io::Result<Self>
    where
        A: net::ToSocketAddrs,
    {
        let socket = net::UdpSocket::bind(bind_address)?;
        socket.set_nonblocking(true)?;

        let local_addr = socket.local_addr()?;

        let poller = polling::Poller::new()?;

        unsafe {
            poller.add(&socket, polling::Event::readable(SOCKET_POLLING_KEY))?;
        }

        Ok(Self {
            socket,
            local_addr,
            poller,
            poller_events: polling::Events::new(),
        })
    }
}

impl Socket for UdpSocket {
    fn send_to(&self, segments: &[&[u8]], dest: &Host) -> io::Result<usize> {
        let slices = segments
            .iter()
            .map(|segment| IoSlice::new(segment))
            .collect::<Vec<_>>();

        SockRef::from(&self.socket).send_to_vectored(&slices, &SockAddr::from(*dest))
    }

    fn try_recv_from(&self, buffer: &mut [u8]) -> io::Result<Option<(usize, Host)>> {
        match self.socket.recv_from(buffer) {
            Ok((size, sender_addr)) => Ok(Some((size, sender_addr))),
            Err(err) => match err.kind() {
                // The only acceptable error is WouldBlock, indicating no datagram
                io::ErrorKind::WouldBlock => Ok(None),
                _ if is_message_too_long(&err) => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "datagram exceeds receive buffer",
                )),
                _ => Err(err),
            },
        }
    }

    fn wait_readable(&mut self, timeout: Option<time::Duration>) -> io::Result<bool> {
        // Rearm the readable event (must be done prior to each wait() call)
        self.poller
            .modify(&self.socket, polling::Event::readable(SOCKET_POLLING_KEY))?;

        self.poller_events.clear();

        let n = self.poller.wait(&mut self.poller_events, timeout)?;

        Ok(n > 0)
    }

    fn local_addr(&self) -> Host {
        self.local_addr
    }
}

impl Drop for UdpSocket {
    fn drop(&mut self) {
        let _ = self.poller.delete(&self.socket);
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gather_send() {
        let a = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut b = UdpSocket::bind("127.0.0.1:0").unwrap();

        let sent = a
            .send_to(&[&[1, 2, 3, 4], b"payload"], &b.local_addr())
            .unwrap();

        assert_eq!(sent, 11);

        assert!(b
            .wait_readable(Some(time::Duration::from_secs(2)))
            .unwrap());

        let mut buffer = [0u8; 64];
        let (size, sender) = b.try_recv_from(&mut buffer).unwrap().unwrap();

        assert_eq!(sender, a.local_addr());
        assert_eq!(&buffer[..size], b"\x01\x02\x03\x04payload");

        assert!(b.try_recv_from(&mut buffer).unwrap().is_none());
    }
}
