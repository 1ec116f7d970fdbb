//! Connected stream-socket pairs for cross-thread wakeups.
//!
//! The transceiver uses one of these pairs as its signalling channel: the
//! host writes a byte to wake the worker, the worker writes a byte to tell
//! the host an event is queued. [`socket_pair`] uses the OS's native
//! `socketpair(2)`; [`loopback_socket_pair`] is the portable fallback that
//! builds an equivalent pair from a loopback TCP listen/connect/accept.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

use nix::sys::socket::{self, AddressFamily, MsgFlags, SockFlag, SockType};
use nix::unistd;

/// A minimal owned stream socket over a raw fd, closed on drop.
///
/// Covers both halves of a wakeup pair and the transceiver's remote TCP
/// socket; I/O goes through `send(2)`/`recv(2)` so the same type works for
/// either.
#[derive(Debug)]
pub struct Sock {
    fd: RawFd,
}

impl Sock {
    pub(crate) fn from_raw(fd: RawFd) -> Sock {
        Sock { fd }
    }

    pub(crate) fn from_stream(stream: TcpStream) -> Sock {
        Sock {
            fd: stream.into_raw_fd(),
        }
    }

    /// Sends bytes, returning how many the socket accepted.
    pub fn send(&self, buf: &[u8]) -> io::Result<usize> {
        socket::send(self.fd, buf, MsgFlags::MSG_NOSIGNAL).map_err(io::Error::from)
    }

    /// Receives bytes, returning how many arrived (0 means end-of-stream).
    pub fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        socket::recv(self.fd, buf, MsgFlags::empty()).map_err(io::Error::from)
    }
}

impl AsRawFd for Sock {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Sock {
    fn drop(&mut self) {
        let _ = unistd::close(self.fd);
    }
}

/// Returns two connected stream sockets in the requested blocking mode,
/// using the OS's native `socketpair(2)`.
pub fn socket_pair(blocking: bool) -> io::Result<(Sock, Sock)> {
    let flags = if blocking {
        SockFlag::empty()
    } else {
        SockFlag::SOCK_NONBLOCK
    };
    let (a, b) = socket::socketpair(AddressFamily::Unix, SockType::Stream, None, flags)?;
    Ok((Sock::from_raw(a), Sock::from_raw(b)))
}

/// Socket-pair fallback for hosts without `socketpair(2)`: listen on a
/// loopback ephemeral port, connect one end, accept the other, close the
/// listener. Prefers IPv6 `::1`, falling back to IPv4 `127.0.0.1`.
pub fn loopback_socket_pair(blocking: bool, prefer_ipv6: bool) -> io::Result<(Sock, Sock)> {
    let listener = if prefer_ipv6 {
        TcpListener::bind(("::1", 0)).or_else(|_| TcpListener::bind(("127.0.0.1", 0)))?
    } else {
        TcpListener::bind(("127.0.0.1", 0))?
    };
    let a = TcpStream::connect(listener.local_addr()?)?;
    let (b, _) = listener.accept()?;
    a.set_nonblocking(!blocking)?;
    b.set_nonblocking(!blocking)?;
    Ok((Sock::from_stream(a), Sock::from_stream(b)))
}
