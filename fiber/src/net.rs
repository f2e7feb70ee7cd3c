//! Fiber-aware TCP primitives.
//!
//! All operations follow one suspend-and-resume contract: an operation that
//! would block registers the descriptor with the current reactor and yields;
//! the reactor reschedules the fiber once the descriptor is ready (or a
//! timeout cancels the registration) and the operation retries. Callers
//! write plain blocking-style code; no kernel thread ever blocks.

use std::io;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::fiber::Fiber;
use crate::reactor::{Event, Reactor};

/// Timeout value meaning "wait forever".
pub const NO_TIMEOUT: u64 = u64::MAX;

const BACKLOG: i32 = 128;

/// Cancellation witness shared between a suspended operation and its
/// timeout timer; the timer fires only while the operation is still parked.
struct CancelWitness {
    cancelled: AtomicBool,
}

/// Parks the current fiber on `(fd, event)` with an optional timeout.
/// Returns false when the wait was cancelled by the timeout.
fn suspend(fd: RawFd, event: Event, timeout_ms: u64) -> io::Result<bool> {
    let reactor = Reactor::current();
    let witness = Arc::new(CancelWitness { cancelled: AtomicBool::new(false) });

    let timer = if timeout_ms != NO_TIMEOUT {
        let weak = Arc::downgrade(&witness);
        let cancel_reactor = reactor.clone();
        Some(reactor.add_condition_timer(
            timeout_ms,
            move || {
                let Some(witness) = weak.upgrade() else { return };
                if witness.cancelled.swap(true, Ordering::AcqRel) {
                    return;
                }
                cancel_reactor.cancel_event(fd, event);
            },
            Arc::downgrade(&witness),
            false,
        ))
    } else {
        None
    };

    if let Err(err) = reactor.add_event(fd, event) {
        if let Some(timer) = timer {
            timer.cancel();
        }
        return Err(err);
    }
    Fiber::yield_now();

    if let Some(timer) = timer {
        timer.cancel();
    }
    Ok(!witness.cancelled.load(Ordering::Acquire))
}

fn sockaddr(addr: SocketAddr) -> SockAddr { SockAddr::from(addr) }

/// A listening TCP socket whose `accept` suspends the calling fiber.
pub struct TcpListener {
    socket: Socket,
    local: SocketAddr,
    closed: AtomicBool,
}

impl TcpListener {
    /// Binds a reusable, non-blocking listener on `addr`.
    pub fn bind(addr: SocketAddr) -> io::Result<TcpListener> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.bind(&sockaddr(addr))?;
        socket.listen(BACKLOG)?;
        socket.set_nonblocking(true)?;
        let local = socket
            .local_addr()?
            .as_socket()
            .expect("TCP listener doesn't have local address");
        Ok(TcpListener { socket, local, closed: AtomicBool::new(false) })
    }

    pub fn local_addr(&self) -> SocketAddr { self.local }

    /// Accepts one connection, suspending the fiber until a peer arrives.
    pub fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "listener closed"));
            }
            match self.socket.accept() {
                Ok((socket, peer)) => {
                    socket.set_nonblocking(true)?;
                    let peer = peer.as_socket().expect("TCP peer has a socket address");
                    return Ok((TcpStream::from_socket(socket), peer));
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    suspend(self.socket.as_raw_fd(), Event::Read, NO_TIMEOUT)?;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Unblocks pending accepts and closes the listener.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(reactor) = Reactor::try_current() {
            reactor.cancel_all(self.socket.as_raw_fd());
        }
        log::debug!(target: "fiber", "listener on {} closed", self.local);
    }
}

/// A connected TCP stream whose reads and writes suspend the calling fiber.
/// Per-direction timeouts are enforced with conditional timers, never by
/// the OS.
pub struct TcpStream {
    socket: Socket,
    closed: AtomicBool,
    read_timeout_ms: AtomicU64,
    write_timeout_ms: AtomicU64,
}

impl TcpStream {
    fn from_socket(socket: Socket) -> TcpStream {
        TcpStream {
            socket,
            closed: AtomicBool::new(false),
            read_timeout_ms: AtomicU64::new(NO_TIMEOUT),
            write_timeout_ms: AtomicU64::new(NO_TIMEOUT),
        }
    }

    /// Connects to `addr`, suspending until established.
    pub fn connect(addr: SocketAddr) -> io::Result<TcpStream> {
        Self::connect_timeout(addr, NO_TIMEOUT)
    }

    /// Connects with a deadline of `timeout_ms` milliseconds.
    pub fn connect_timeout(addr: SocketAddr, timeout_ms: u64) -> io::Result<TcpStream> {
        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        match socket.connect(&sockaddr(addr)) {
            Ok(()) => {}
            Err(err)
                if err.raw_os_error() == Some(libc::EINPROGRESS)
                    || err.kind() == io::ErrorKind::WouldBlock =>
            {
                if !suspend(socket.as_raw_fd(), Event::Write, timeout_ms)? {
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("connect to {addr} timed out"),
                    ));
                }
                if let Some(err) = socket.take_error()? {
                    return Err(err);
                }
            }
            Err(err) => return Err(err),
        }
        log::trace!(target: "fiber", "connected to {addr}");
        Ok(TcpStream::from_socket(socket))
    }

    pub fn as_raw_fd(&self) -> RawFd { self.socket.as_raw_fd() }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .peer_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable))
    }

    /// Per-read timeout in milliseconds; [`NO_TIMEOUT`] disables it.
    pub fn set_read_timeout_ms(&self, timeout_ms: u64) {
        self.read_timeout_ms.store(timeout_ms, Ordering::Release);
    }

    /// Per-write timeout in milliseconds; [`NO_TIMEOUT`] disables it.
    pub fn set_write_timeout_ms(&self, timeout_ms: u64) {
        self.write_timeout_ms.store(timeout_ms, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool { self.closed.load(Ordering::Acquire) }

    /// Reads into `buf`, suspending until data, EOF, error or timeout.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.as_raw_fd();
        self.do_io(Event::Read, self.read_timeout_ms.load(Ordering::Acquire), || {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        })
    }

    /// Writes from `buf`, suspending until buffer space, error or timeout.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.as_raw_fd();
        self.do_io(Event::Write, self.write_timeout_ms.load(Ordering::Acquire), || {
            let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n < 0 {
                Err(io::Error::last_os_error())
            } else {
                Ok(n as usize)
            }
        })
    }

    fn do_io(
        &self,
        event: Event,
        timeout_ms: u64,
        mut op: impl FnMut() -> io::Result<usize>,
    ) -> io::Result<usize> {
        loop {
            if self.is_closed() {
                return Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed"));
            }
            match op() {
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    if !suspend(self.as_raw_fd(), event, timeout_ms)? {
                        return Err(io::Error::new(io::ErrorKind::TimedOut, "io timed out"));
                    }
                }
                other => return other,
            }
        }
    }

    /// Cancels every pending event on the descriptor — each suspended
    /// operation wakes once and observes closure — and shuts the socket
    /// down. The descriptor itself is released on drop.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(reactor) = Reactor::try_current() {
            reactor.cancel_all(self.socket.as_raw_fd());
        }
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
        log::trace!(target: "fiber", "stream fd {} closed", self.socket.as_raw_fd());
    }
}

/// Parks the current fiber for `ms` milliseconds without blocking the
/// worker thread.
pub fn sleep_ms(ms: u64) {
    let reactor = Reactor::current();
    let sched = reactor.scheduler().clone();
    let fiber = Fiber::current();
    reactor.add_timer(ms, move || sched.schedule_fiber(fiber.clone()), false);
    Fiber::yield_now();
}
