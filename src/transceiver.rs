//! Asynchronous Message transceiver.
//!
//! A [`Transceiver`] owns a worker thread that holds one TCP endpoint
//! (an outgoing connection or a passive accept socket) and exchanges
//! flattened Messages with the remote peer without ever blocking the host.
//! Host and worker communicate only through two FIFO queues and a connected
//! socket pair used for wakeups: the host writes a byte to make the worker
//! re-check its outgoing queue, and the worker writes a byte per posted
//! event so the host can wait for [`Event`]s with an ordinary readiness
//! poll on [`Transceiver::notification_socket`].
//!
//! Every frame on the wire is an 8-byte header (`u32` body size, `u32`
//! 'Enc0' magic) followed by one flattened Message. Partial reads and
//! writes are routine; both directions resume at the exact byte offset
//! where the socket last blocked.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::thread::{self, JoinHandle};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use crossbeam::channel::{unbounded, Receiver, Sender, TryRecvError};
use log::{debug, info, warn};
use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags};
use nix::sys::socket::{self, AddressFamily, SockFlag, SockType, SockaddrIn, SockaddrIn6};

use crate::error::Error;
use crate::message::Message;
use crate::sockpair::{socket_pair, Sock};

/// Magic cookie of the default MUSCLE message encoding ('Enc0'), carried in
/// every frame header.
pub const MESSAGE_ENCODING_DEFAULT: u32 = 1164862256;

const FRAME_HEADER_SIZE: usize = 2 * 4;

/// Notifications delivered to the host through the incoming-event queue.
#[derive(Debug, PartialEq)]
pub enum Event {
    /// The TCP connection has been established. Emitted exactly once per
    /// connection, always before any `Received` from it.
    Connected,
    /// The TCP connection failed or was closed by the peer. A passive
    /// endpoint goes back to accepting afterwards; an active endpoint's
    /// worker terminates.
    Disconnected,
    /// A Message arrived from the remote peer.
    Received(Message),
}

// Work items the host queues for the worker. Shutdown is a dedicated
// sentinel, processed in FIFO order with the Messages ahead of it.
enum Command {
    Deliver(Message),
    Shutdown,
}

/// Host-side handle to the transceiver worker.
///
/// Build one with [`new_active`](Transceiver::new_active) or
/// [`new_passive`](Transceiver::new_passive), then call
/// [`start`](Transceiver::start). All methods are safe to call from any
/// thread. [`destroy`](Transceiver::destroy) (also run on drop) shuts the
/// worker down and joins it; Messages still queued at that point are
/// silently dropped.
pub struct Transceiver {
    out_tx: Sender<Command>,
    in_rx: Receiver<Event>,
    // host half of the wakeup pair; worker holds the other half
    notify: Sock,
    port: u16,
    setup: Option<WorkerSetup>,
    worker: Option<JoinHandle<()>>,
}

// Everything the worker thread takes ownership of at start().
struct WorkerSetup {
    out_rx: Receiver<Command>,
    in_tx: Sender<Event>,
    wakeup: Sock,
    listener: Option<TcpListener>,
    target: Option<(String, u16)>,
    prefer_ipv6: bool,
}

impl Transceiver {
    /// Creates a transceiver that will make an outgoing TCP connection to
    /// `host:port` once started, preferring the given address family and
    /// retrying once with the opposite family if that fails.
    pub fn new_active(host: impl Into<String>, port: u16, prefer_ipv6: bool) -> Result<Transceiver> {
        Self::new(Some(host.into()), port, None, prefer_ipv6)
    }

    /// Creates a transceiver that accepts one incoming TCP connection at a
    /// time on `port` (0 lets the system pick; see [`port`](Self::port)).
    /// `accept_from` restricts the bind address; the default is the
    /// wildcard address of the preferred family.
    pub fn new_passive(
        port: u16,
        accept_from: Option<IpAddr>,
        prefer_ipv6: bool,
    ) -> Result<Transceiver> {
        Self::new(None, port, accept_from, prefer_ipv6)
    }

    fn new(
        hostname: Option<String>,
        port: u16,
        accept_from: Option<IpAddr>,
        prefer_ipv6: bool,
    ) -> Result<Transceiver> {
        let (out_tx, out_rx) = unbounded();
        let (in_tx, in_rx) = unbounded();
        let (notify, wakeup) = socket_pair(false).wrap_err("creating the wakeup socket pair")?;

        let mut listener = None;
        let mut bound_port = port;
        if hostname.is_none() {
            let bind_addr = accept_from.unwrap_or(if prefer_ipv6 {
                IpAddr::V6(Ipv6Addr::UNSPECIFIED)
            } else {
                IpAddr::V4(Ipv4Addr::UNSPECIFIED)
            });
            let sock = bind_listener(SocketAddr::new(bind_addr, port))
                .wrap_err("binding the accept socket")?;
            bound_port = sock.local_addr().wrap_err("querying the bound port")?.port();
            listener = Some(sock);
        }

        Ok(Transceiver {
            out_tx,
            in_rx,
            notify,
            port: bound_port,
            setup: Some(WorkerSetup {
                out_rx,
                in_tx,
                wakeup,
                listener,
                target: hostname.map(|host| (host, port)),
                prefer_ipv6,
            }),
            worker: None,
        })
    }

    /// Starts the worker thread. Nothing flows until this is called.
    pub fn start(&mut self) -> Result<()> {
        let setup = self
            .setup
            .take()
            .ok_or_else(|| eyre!("transceiver already started"))?;
        let handle = thread::Builder::new()
            .name("muscle-transceiver".into())
            .spawn(move || Worker::new(setup).run())
            .wrap_err("spawning the transceiver thread")?;
        self.worker = Some(handle);
        Ok(())
    }

    /// The local port this endpoint connects to or accepts on. For a
    /// passive endpoint created with port 0 this is the actual bound port.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Queues `msg` for transmission and wakes the worker. Messages go out
    /// strictly in the order they were queued, once the connection is up.
    pub fn send(&self, msg: Message) -> Result<()> {
        self.out_tx
            .send(Command::Deliver(msg))
            .map_err(|_| eyre!("transceiver worker is gone"))?;
        // a full signalling buffer is fine, the worker has wakeups pending
        let _ = self.notify.send(b"j");
        Ok(())
    }

    /// The next queued [`Event`], if any. With `block` the call waits until
    /// an event arrives or the worker shuts down.
    pub fn next_event(&self, block: bool) -> Option<Event> {
        if block {
            self.in_rx.recv().ok()
        } else {
            self.in_rx.try_recv().ok()
        }
    }

    /// The socket the host may poll (or read) to learn that events are
    /// queued: the worker writes one byte per posted event, though bytes
    /// may coalesce. Drain it, then call [`next_event`](Self::next_event)
    /// until it returns `None`. Do not write to or close this socket.
    pub fn notification_socket(&self) -> &Sock {
        &self.notify
    }

    /// Queues the shutdown sentinel, wakes the worker, and joins it.
    /// Idempotent; also called on drop.
    pub fn destroy(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = self.out_tx.send(Command::Shutdown);
            let _ = self.notify.send(b"j");
            let _ = handle.join();
        }
        self.setup = None;
    }
}

impl Drop for Transceiver {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ---------------------------------------------------------------------------
// worker side

// Receive state: two phases per inbound Message.
enum RecvPhase {
    Header { buf: [u8; FRAME_HEADER_SIZE], have: usize },
    Body { buf: Vec<u8>, have: usize },
}

impl RecvPhase {
    fn header() -> RecvPhase {
        RecvPhase::Header {
            buf: [0; FRAME_HEADER_SIZE],
            have: 0,
        }
    }
}

// One outgoing frame, tracking how much of the header and body has been
// accepted by the socket so far.
struct OutFrame {
    header: [u8; FRAME_HEADER_SIZE],
    header_sent: usize,
    body: Vec<u8>,
    body_sent: usize,
}

impl OutFrame {
    fn new(msg: &Message) -> crate::error::Result<OutFrame> {
        let body = msg.to_flattened_buffer()?;
        let mut header = [0u8; FRAME_HEADER_SIZE];
        let mut w = &mut header[..];
        w.write_u32::<LE>(body.len() as u32)?;
        w.write_u32::<LE>(MESSAGE_ENCODING_DEFAULT)?;
        Ok(OutFrame {
            header,
            header_sent: 0,
            body,
            body_sent: 0,
        })
    }

    fn done(&self) -> bool {
        self.header_sent == FRAME_HEADER_SIZE && self.body_sent == self.body.len()
    }
}

enum Flow {
    Continue,
    Shutdown,
}

// Worker-internal failures. Remote failures follow the disconnect policy
// (fatal for active endpoints, back-to-accept for passive ones); Fatal ones
// end the worker either way.
enum StepError {
    Remote(io::Error),
    Fatal(color_eyre::Report),
}

struct Worker {
    out_rx: Receiver<Command>,
    in_tx: Sender<Event>,
    wakeup: Sock,
    listener: Option<TcpListener>,
    target: Option<(String, u16)>,
    prefer_ipv6: bool,
    remote: Option<Sock>,
    connect_pending: bool,
    recv_phase: RecvPhase,
    out_frame: Option<OutFrame>,
}

impl Worker {
    fn new(setup: WorkerSetup) -> Worker {
        Worker {
            out_rx: setup.out_rx,
            in_tx: setup.in_tx,
            wakeup: setup.wakeup,
            listener: setup.listener,
            target: setup.target,
            prefer_ipv6: setup.prefer_ipv6,
            remote: None,
            connect_pending: false,
            recv_phase: RecvPhase::header(),
            out_frame: None,
        }
    }

    fn run(mut self) {
        if let Some((host, port)) = self.target.clone() {
            match self.open_connection(&host, port) {
                Ok(sock) => {
                    self.remote = Some(sock);
                    if !self.connect_pending {
                        self.emit(Event::Connected);
                    }
                }
                Err(err) => {
                    warn!(target: "muscle", "connecting to {}:{} failed: {}", host, port, err);
                    self.emit(Event::Disconnected);
                    return;
                }
            }
        }

        loop {
            match self.step() {
                Ok(Flow::Continue) => {}
                Ok(Flow::Shutdown) => {
                    debug!(target: "muscle", "shutdown requested, worker exiting");
                    break;
                }
                Err(StepError::Remote(err)) => {
                    debug!(target: "muscle", "connection lost: {}", err);
                    self.emit(Event::Disconnected);
                    self.reset_connection();
                    if self.listener.is_none() {
                        // active endpoints do not reconnect
                        break;
                    }
                }
                Err(StepError::Fatal(err)) => {
                    warn!(target: "muscle", "worker failed: {:#}", err);
                    self.emit(Event::Disconnected);
                    break;
                }
            }
        }
    }

    // Drops the remote socket and rewinds both frame state machines so a
    // passive endpoint starts its next connection clean.
    fn reset_connection(&mut self) {
        self.remote = None;
        self.connect_pending = false;
        self.recv_phase = RecvPhase::header();
        self.out_frame = None;
    }

    fn step(&mut self) -> std::result::Result<Flow, StepError> {
        let waiting_for_accept = self.listener.is_some() && self.remote.is_none();

        let mut fds = Vec::with_capacity(2);
        fds.push(PollFd::new(self.wakeup.as_raw_fd(), PollFlags::POLLIN));
        if waiting_for_accept {
            if let Some(listener) = &self.listener {
                fds.push(PollFd::new(listener.as_raw_fd(), PollFlags::POLLIN));
            }
        } else if let Some(remote) = &self.remote {
            let mut interest = PollFlags::empty();
            if !self.connect_pending {
                interest |= PollFlags::POLLIN;
            }
            if self.connect_pending || self.out_frame.is_some() {
                interest |= PollFlags::POLLOUT;
            }
            fds.push(PollFd::new(remote.as_raw_fd(), interest));
        }

        match poll(&mut fds, -1) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Flow::Continue),
            Err(errno) => return Err(StepError::Fatal(io::Error::from(errno).into())),
        }

        let wakeup_ready = ready(&fds[0], PollFlags::POLLIN);
        let sock_in = fds.len() > 1 && ready(&fds[1], PollFlags::POLLIN);
        let sock_out = fds.len() > 1 && ready(&fds[1], PollFlags::POLLOUT);

        if waiting_for_accept {
            if sock_in {
                self.accept_remote().map_err(StepError::Remote)?;
            }
        } else if sock_in && !self.connect_pending {
            self.read_remote().map_err(StepError::Remote)?;
        }

        if wakeup_ready {
            self.drain_wakeups()?;
        }

        if self.remote.is_some() && sock_out {
            if self.connect_pending {
                self.finalize_connect().map_err(StepError::Remote)?;
            } else {
                self.write_remote().map_err(StepError::Remote)?;
            }
        }

        // refill the outgoing frame only once the previous one is fully on
        // the wire, so the shutdown sentinel is never seen mid-frame
        if self.out_frame.is_none() {
            match self.out_rx.try_recv() {
                Ok(Command::Deliver(msg)) => match OutFrame::new(&msg) {
                    Ok(frame) => self.out_frame = Some(frame),
                    Err(err) => return Err(StepError::Fatal(err.into())),
                },
                Ok(Command::Shutdown) => return Ok(Flow::Shutdown),
                Err(TryRecvError::Empty) => {}
                // host handle dropped without destroy(); treat as shutdown
                Err(TryRecvError::Disconnected) => return Ok(Flow::Shutdown),
            }
        }

        Ok(Flow::Continue)
    }

    // The wakeup bytes carry no data, only the side effect of interrupting
    // poll() so the out-queue gets re-checked.
    fn drain_wakeups(&mut self) -> std::result::Result<(), StepError> {
        let mut scratch = [0u8; 1024];
        match self.wakeup.recv(&mut scratch) {
            Ok(0) => Ok(()), // host side gone; the queue drop will stop us
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(StepError::Fatal(
                color_eyre::Report::from(err).wrap_err("reading the wakeup socket"),
            )),
        }
    }

    fn accept_remote(&mut self) -> io::Result<()> {
        let listener = match &self.listener {
            Some(listener) => listener,
            None => return Ok(()),
        };
        match listener.accept() {
            Ok((stream, peer)) => {
                info!(target: "muscle", "accepted connection from {}", peer);
                stream.set_nonblocking(true)?;
                let _ = stream.set_nodelay(true);
                self.remote = Some(Sock::from_stream(stream));
                self.emit(Event::Connected);
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    // One recv per readiness event, mirroring one poll iteration per
    // inbound burst. A zero-length read is end-of-stream.
    fn read_remote(&mut self) -> io::Result<()> {
        let remote = match &self.remote {
            Some(remote) => remote,
            None => return Ok(()),
        };
        match &mut self.recv_phase {
            RecvPhase::Header { buf, have } => {
                let n = match remote.recv(&mut buf[*have..]) {
                    Ok(n) => n,
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                    Err(err) => return Err(err),
                };
                if n == 0 {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "peer closed the connection",
                    ));
                }
                *have += n;
                if *have == FRAME_HEADER_SIZE {
                    let mut r = &buf[..];
                    let body_size = r.read_u32::<LE>()? as usize;
                    let magic = r.read_u32::<LE>()?;
                    if magic != MESSAGE_ENCODING_DEFAULT {
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            Error::BadMagic(magic),
                        ));
                    }
                    if body_size == 0 {
                        // a flattened Message is at least a 12-byte header
                        return Err(io::Error::new(
                            io::ErrorKind::InvalidData,
                            Error::MalformedMessage("zero-length frame body".into()),
                        ));
                    }
                    self.recv_phase = RecvPhase::Body {
                        buf: vec![0; body_size],
                        have: 0,
                    };
                }
            }
            RecvPhase::Body { buf, have } => {
                if *have < buf.len() {
                    let n = match remote.recv(&mut buf[*have..]) {
                        Ok(n) => n,
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                        Err(err) => return Err(err),
                    };
                    if n == 0 {
                        return Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            "peer closed the connection mid-frame",
                        ));
                    }
                    *have += n;
                }
                if *have == buf.len() {
                    let mut msg = Message::new(0);
                    msg.set_from_flattened_buffer(buf)
                        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
                    self.emit(Event::Received(msg));
                    self.recv_phase = RecvPhase::header();
                }
            }
        }
        Ok(())
    }

    // A zero-length send surfaces the pending connect error, if any; on
    // success the connection is up.
    fn finalize_connect(&mut self) -> io::Result<()> {
        let remote = match &self.remote {
            Some(remote) => remote,
            None => return Ok(()),
        };
        remote.send(&[])?;
        self.connect_pending = false;
        self.emit(Event::Connected);
        Ok(())
    }

    // Pushes out whatever the socket will take: the rest of the header
    // first, then the rest of the body.
    fn write_remote(&mut self) -> io::Result<()> {
        let remote = match &self.remote {
            Some(remote) => remote,
            None => return Ok(()),
        };
        let frame = match &mut self.out_frame {
            Some(frame) => frame,
            None => return Ok(()),
        };
        let chunk = if frame.header_sent < FRAME_HEADER_SIZE {
            &frame.header[frame.header_sent..]
        } else {
            &frame.body[frame.body_sent..]
        };
        let n = match remote.send(chunk) {
            Ok(n) => n,
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(err) => return Err(err),
        };
        if frame.header_sent < FRAME_HEADER_SIZE {
            frame.header_sent += n;
        } else {
            frame.body_sent += n;
        }
        if frame.done() {
            self.out_frame = None;
        }
        Ok(())
    }

    fn open_connection(&mut self, host: &str, port: u16) -> io::Result<Sock> {
        match self.connect_with_family(host, port, self.prefer_ipv6) {
            Ok(sock) => Ok(sock),
            Err(err) => {
                debug!(
                    target: "muscle",
                    "preferred address family failed ({}), trying the other", err
                );
                self.connect_with_family(host, port, !self.prefer_ipv6)
            }
        }
    }

    fn connect_with_family(&mut self, host: &str, port: u16, ipv6: bool) -> io::Result<Sock> {
        let addr = (host, port)
            .to_socket_addrs()?
            .find(|addr| addr.is_ipv6() == ipv6)
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    "no address in the requested family",
                )
            })?;
        let family = if ipv6 {
            AddressFamily::Inet6
        } else {
            AddressFamily::Inet
        };
        let fd: RawFd = socket::socket(family, SockType::Stream, SockFlag::SOCK_NONBLOCK, None)
            .map_err(io::Error::from)?;
        let sock = Sock::from_raw(fd);
        let connected = match addr {
            SocketAddr::V4(v4) => socket::connect(fd, &SockaddrIn::from(v4)),
            SocketAddr::V6(v6) => socket::connect(fd, &SockaddrIn6::from(v6)),
        };
        match connected {
            Ok(()) => {
                self.connect_pending = false;
                Ok(sock)
            }
            Err(Errno::EINPROGRESS) | Err(Errno::EALREADY) | Err(Errno::EAGAIN) => {
                self.connect_pending = true;
                Ok(sock)
            }
            Err(errno) => Err(errno.into()),
        }
    }

    // Posts an event and pings the notification socket. A full signalling
    // buffer just coalesces with the bytes already queued there.
    fn emit(&self, event: Event) {
        if self.in_tx.send(event).is_ok() {
            let _ = self.wakeup.send(b"t");
        }
    }
}

fn ready(fd: &PollFd, wanted: PollFlags) -> bool {
    fd.revents().map_or(false, |revents| {
        revents.intersects(wanted | PollFlags::POLLERR | PollFlags::POLLHUP)
    })
}

// A non-blocking listener with a backlog of one: a passive endpoint serves
// a single connection at a time, so there is no reason to queue more.
fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let family = if addr.is_ipv6() {
        AddressFamily::Inet6
    } else {
        AddressFamily::Inet
    };
    let fd = socket::socket(family, SockType::Stream, SockFlag::empty(), None)
        .map_err(io::Error::from)?;
    let bound = match addr {
        SocketAddr::V4(v4) => socket::bind(fd, &SockaddrIn::from(v4)),
        SocketAddr::V6(v6) => socket::bind(fd, &SockaddrIn6::from(v6)),
    }
    .and_then(|_| socket::listen(fd, 1));
    if let Err(errno) = bound {
        let _ = nix::unistd::close(fd);
        return Err(errno.into());
    }
    let listener = unsafe { TcpListener::from_raw_fd(fd) };
    listener.set_nonblocking(true)?;
    Ok(listener)
}
