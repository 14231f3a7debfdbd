//! Thin typed wrapper over a non-blocking socket descriptor.
//!
//! [`Socket`] owns one descriptor and exposes the small set of operations
//! the connection machinery needs: bind/listen/accept on the server path,
//! resolve/connect on the client path, and read/write calls whose zero
//! return means exactly "would block". The descriptor is opened lazily on
//! first use, or adopted already-open from an accept.
//!
//! The factory methods [`Socket::make_read_source`] and
//! [`Socket::make_write_source`] bind readiness sources for the
//! descriptor to a serial queue; everything event-driven builds on those.

use std::ffi::{CStr, CString};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use socket2::SockAddr;

use crate::dispatch::{EventSource, Interest, SerialQueue};
use crate::error::{Error, Result};

/// Address family of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    /// IPv4
    Ipv4,
    /// IPv6
    Ipv6,
}

impl Family {
    fn domain(self) -> libc::c_int {
        match self {
            Family::Ipv4 => libc::AF_INET,
            Family::Ipv6 => libc::AF_INET6,
        }
    }

    /// The family's wildcard address.
    pub fn wildcard(self) -> IpAddr {
        match self {
            Family::Ipv4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            Family::Ipv6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
        }
    }
}

impl std::fmt::Display for Family {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Family::Ipv4 => write!(f, "IPv4"),
            Family::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// Transport protocol of a socket.
///
/// Only the two protocols the crate speaks are representable; foreign
/// protocol numbers are rejected at the boundary by the `TryFrom`
/// conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Stream sockets (`IPPROTO_TCP`)
    Tcp,
    /// Datagram sockets (`IPPROTO_UDP`)
    Udp,
}

impl Protocol {
    fn socket_type(self) -> libc::c_int {
        match self {
            Protocol::Tcp => libc::SOCK_STREAM,
            Protocol::Udp => libc::SOCK_DGRAM,
        }
    }

    fn protocol_number(self) -> libc::c_int {
        match self {
            Protocol::Tcp => libc::IPPROTO_TCP,
            Protocol::Udp => libc::IPPROTO_UDP,
        }
    }
}

impl TryFrom<libc::c_int> for Protocol {
    type Error = Error;

    fn try_from(raw: libc::c_int) -> Result<Self> {
        match raw {
            libc::IPPROTO_TCP => Ok(Protocol::Tcp),
            libc::IPPROTO_UDP => Ok(Protocol::Udp),
            _ => Err(Error::ProtocolNotSupported),
        }
    }
}

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
        }
    }
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn cvt_size(ret: isize) -> io::Result<isize> {
    if ret == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn set_opt_int(fd: RawFd, level: libc::c_int, name: libc::c_int, value: libc::c_int) -> io::Result<()> {
    // SAFETY: the option value is a c_int read by the kernel.
    cvt(unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    })
    .map(drop)
}

fn get_opt_int(fd: RawFd, level: libc::c_int, name: libc::c_int) -> io::Result<libc::c_int> {
    let mut value: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: the kernel writes a c_int through the provided pointer.
    cvt(unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut value as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok(value)
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: querying then updating flags on a descriptor we own.
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) }).map(drop)
}

fn gai_error(code: libc::c_int) -> Error {
    // SAFETY: gai_strerror returns a pointer to a static string.
    let ptr = unsafe { libc::gai_strerror(code) };
    let detail = if ptr.is_null() {
        format!("resolver error {}", code)
    } else {
        // SAFETY: non-null gai_strerror results are NUL-terminated.
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    };
    Error::AddressResolution { code, detail }
}

/// Resolves `host:port` to socket addresses matching `family`/`protocol`.
fn resolve(host: &str, port: u16, family: Family, protocol: Protocol) -> Result<Vec<SocketAddr>> {
    let c_host = CString::new(host).map_err(|_| Error::AddressResolution {
        code: libc::EAI_NONAME,
        detail: "host contains an interior NUL".to_string(),
    })?;
    let c_port = CString::new(port.to_string()).map_err(|_| Error::AddressResolution {
        code: libc::EAI_NONAME,
        detail: "invalid port string".to_string(),
    })?;

    // SAFETY: addrinfo is a plain C struct; zeroed is its empty state.
    let mut hints: libc::addrinfo = unsafe { std::mem::zeroed() };
    hints.ai_family = family.domain();
    hints.ai_socktype = protocol.socket_type();
    hints.ai_protocol = protocol.protocol_number();

    let mut list: *mut libc::addrinfo = std::ptr::null_mut();
    // SAFETY: the hint and out pointers are valid for the call.
    let rc = unsafe { libc::getaddrinfo(c_host.as_ptr(), c_port.as_ptr(), &hints, &mut list) };
    if rc != 0 {
        return Err(gai_error(rc));
    }

    let mut addrs = Vec::new();
    let mut cursor = list;
    while !cursor.is_null() {
        // SAFETY: getaddrinfo returned a well-formed list.
        let entry = unsafe { &*cursor };
        if !entry.ai_addr.is_null() {
            let copy_len = (entry.ai_addrlen as usize)
                .min(std::mem::size_of::<libc::sockaddr_storage>());
            // SAFETY: the closure fills the storage from the entry's
            // address, which is copy_len bytes long.
            let converted = unsafe {
                SockAddr::try_init(|storage, len| {
                    std::ptr::copy_nonoverlapping(
                        entry.ai_addr as *const u8,
                        storage as *mut u8,
                        copy_len,
                    );
                    *len = copy_len as libc::socklen_t;
                    Ok(())
                })
            };
            if let Ok(((), addr)) = converted {
                if let Some(socket_addr) = addr.as_socket() {
                    addrs.push(socket_addr);
                }
            }
        }
        cursor = entry.ai_next;
    }
    // SAFETY: list came from getaddrinfo and is freed exactly once.
    unsafe { libc::freeaddrinfo(list) };

    if addrs.is_empty() {
        return Err(Error::AddressResolution {
            code: libc::EAI_NONAME,
            detail: format!("no usable {} addresses for {}", family, host),
        });
    }
    Ok(addrs)
}

/// Typed wrapper over one socket descriptor.
///
/// The descriptor is opened lazily: a freshly constructed `Socket` owns
/// nothing until the first operation that needs a descriptor. Closing is
/// idempotent and also clears the connected flag and the memoized receive
/// timeout. The descriptor is closed on drop as a backstop; the
/// connection layer closes it explicitly at a defined point instead.
#[derive(Debug)]
pub struct Socket {
    fd: Option<RawFd>,
    family: Family,
    protocol: Protocol,
    peer: Option<SocketAddr>,
    recv_timeout: Option<Duration>,
    connected: bool,
}

impl Socket {
    /// Creates a socket for `family`/`protocol` without opening a
    /// descriptor yet.
    pub fn new(family: Family, protocol: Protocol) -> Self {
        Self {
            fd: None,
            family,
            protocol,
            peer: None,
            recv_timeout: None,
            connected: false,
        }
    }

    /// Adopts an already-open, already-connected descriptor.
    fn adopt(fd: RawFd, family: Family, protocol: Protocol, peer: Option<SocketAddr>) -> Self {
        Self {
            fd: Some(fd),
            family,
            protocol,
            peer,
            recv_timeout: None,
            connected: true,
        }
    }

    /// The socket's address family.
    pub fn family(&self) -> Family {
        self.family
    }

    /// The socket's transport protocol.
    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    /// Whether the socket is (or is treated as) connected.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// The cached remote address, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// The locally bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let fd = self.require_fd()?;
        // SAFETY: getsockname fills the storage the closure hands it.
        let ((), addr) = unsafe {
            SockAddr::try_init(|storage, len| {
                cvt(libc::getsockname(fd, storage as *mut libc::sockaddr, len)).map(drop)
            })
        }?;
        addr.as_socket().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "local address is not an inet address",
            ))
        })
    }

    fn require_fd(&self) -> Result<RawFd> {
        self.fd.ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket descriptor is unset",
            ))
        })
    }

    /// Opens the descriptor if it is not open yet.
    fn ensure_fd(&mut self) -> Result<RawFd> {
        if let Some(fd) = self.fd {
            return Ok(fd);
        }
        // SAFETY: plain descriptor-creating syscall.
        let fd = cvt(unsafe {
            libc::socket(
                self.family.domain(),
                self.protocol.socket_type() | libc::SOCK_CLOEXEC,
                self.protocol.protocol_number(),
            )
        })?;
        // Broken-pipe writes must come back as errors, not signals.
        #[cfg(target_os = "macos")]
        set_opt_int(fd, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)?;
        self.fd = Some(fd);
        Ok(fd)
    }

    /// Binds to `port` on `ip`, or on the family's wildcard address when
    /// `ip` is omitted.
    ///
    /// IPv6 sockets get `IPV6_V6ONLY` first so dual-stack deployments can
    /// bind both families to the same port; the address is always marked
    /// reusable before binding.
    pub fn bind(&mut self, port: u16, ip: Option<IpAddr>) -> Result<()> {
        let fd = self.ensure_fd()?;
        if self.family == Family::Ipv6 {
            set_opt_int(fd, libc::IPPROTO_IPV6, libc::IPV6_V6ONLY, 1)?;
        }
        set_opt_int(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)?;

        let addr = SocketAddr::new(ip.unwrap_or_else(|| self.family.wildcard()), port);
        let raw = SockAddr::from(addr);
        // SAFETY: socket2 guarantees a valid sockaddr pointer and length.
        cvt(unsafe { libc::bind(fd, raw.as_ptr() as *const libc::sockaddr, raw.len()) })?;
        Ok(())
    }

    /// Starts listening with the given backlog (system maximum when
    /// omitted).
    pub fn listen(&mut self, backlog: Option<libc::c_int>) -> Result<()> {
        let fd = self.ensure_fd()?;
        // SAFETY: fd is our descriptor.
        cvt(unsafe { libc::listen(fd, backlog.unwrap_or(libc::SOMAXCONN)) })?;
        Ok(())
    }

    /// Accepts one pending connection, adopting its descriptor.
    ///
    /// The peer address is queried and cached on the adopted socket, and
    /// non-blocking mode is applied when requested.
    pub fn accept(&mut self, nonblocking: bool) -> Result<Socket> {
        let fd = self.require_fd()?;
        // SAFETY: the address output is queried separately below.
        let accepted = cvt(unsafe { libc::accept(fd, std::ptr::null_mut(), std::ptr::null_mut()) })?;

        // SAFETY: getpeername fills the storage the closure hands it.
        let peer = unsafe {
            SockAddr::try_init(|storage, len| {
                cvt(libc::getpeername(accepted, storage as *mut libc::sockaddr, len)).map(drop)
            })
        }
        .ok()
        .and_then(|((), addr)| addr.as_socket());

        if nonblocking {
            if let Err(e) = set_nonblocking(accepted) {
                // SAFETY: the fd was never handed out.
                unsafe { libc::close(accepted) };
                return Err(Error::Io(e));
            }
        }
        #[cfg(target_os = "macos")]
        set_opt_int(accepted, libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1)?;

        Ok(Socket::adopt(accepted, self.family, self.protocol, peer))
    }

    /// Closes and forgets the descriptor so the next attempt starts
    /// fresh. A descriptor that failed a connect is not reusable.
    fn reset_descriptor(&mut self) {
        if let Some(fd) = self.fd.take() {
            // SAFETY: fd is ours and closed exactly once.
            unsafe { libc::close(fd) };
        }
        self.connected = false;
    }

    /// Resolves `host` and connects to the first usable address.
    ///
    /// A non-blocking connect that reports in-progress is treated as
    /// connected; the readiness sources surface the eventual completion
    /// or failure.
    pub fn connect(&mut self, host: &str, port: u16, nonblocking: bool) -> Result<()> {
        let addrs = resolve(host, port, self.family, self.protocol)?;
        let mut last_err: Option<io::Error> = None;

        for addr in addrs {
            let fd = match self.ensure_fd() {
                Ok(fd) => fd,
                Err(e) => return Err(e),
            };
            if nonblocking {
                set_nonblocking(fd)?;
            }

            let raw = SockAddr::from(addr);
            // SAFETY: socket2 guarantees a valid sockaddr pointer/length.
            let rc = unsafe { libc::connect(fd, raw.as_ptr() as *const libc::sockaddr, raw.len()) };
            if rc == 0 {
                self.peer = Some(addr);
                self.connected = true;
                return Ok(());
            }

            let err = io::Error::last_os_error();
            if nonblocking && err.raw_os_error() == Some(libc::EINPROGRESS) {
                self.peer = Some(addr);
                self.connected = true;
                return Ok(());
            }
            last_err = Some(err);
            self.reset_descriptor();
        }

        Err(Error::Io(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "connect exhausted all addresses")
        })))
    }

    /// Like [`Socket::connect`], but waits for the non-blocking connect
    /// to complete and enforces `timeout` as a hard deadline.
    ///
    /// Expiry closes the descriptor and reports [`Error::TimedOut`].
    pub fn connect_deadline(&mut self, host: &str, port: u16, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let addrs = resolve(host, port, self.family, self.protocol)?;
        let mut last_err: Option<io::Error> = None;

        for addr in addrs {
            let fd = self.ensure_fd()?;
            set_nonblocking(fd)?;

            let raw = SockAddr::from(addr);
            // SAFETY: socket2 guarantees a valid sockaddr pointer/length.
            let rc = unsafe { libc::connect(fd, raw.as_ptr() as *const libc::sockaddr, raw.len()) };
            if rc == 0 {
                self.peer = Some(addr);
                self.connected = true;
                return Ok(());
            }

            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                last_err = Some(err);
                self.reset_descriptor();
                continue;
            }

            match await_connect(fd, deadline) {
                Ok(()) => {
                    self.peer = Some(addr);
                    self.connected = true;
                    return Ok(());
                }
                Err(Error::TimedOut) => {
                    // The deadline is spent; further addresses get no time.
                    self.close();
                    return Err(Error::TimedOut);
                }
                Err(Error::Io(e)) => {
                    last_err = Some(e);
                    self.reset_descriptor();
                }
                Err(e) => {
                    self.reset_descriptor();
                    return Err(e);
                }
            }
        }

        Err(Error::Io(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::AddrNotAvailable, "connect exhausted all addresses")
        })))
    }

    /// Reads into `buf`.
    ///
    /// `Ok(0)` means the descriptor would block (or the receive timeout
    /// ran out); an orderly zero-byte read from the kernel surfaces as
    /// [`Error::ConnectionReset`].
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.require_fd()?;
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            // SAFETY: buf is a live, writable slice of the given length.
            let n = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0) };
            match cvt_size(n) {
                Ok(0) => return Err(Error::ConnectionReset),
                Ok(n) => return Ok(n as usize),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Writes from `buf`.
    ///
    /// `Ok(0)` means the descriptor would block. Sends suppress the
    /// broken-pipe signal so a closed peer surfaces as an error.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let fd = self.require_fd()?;
        if buf.is_empty() {
            return Ok(0);
        }
        #[cfg(target_os = "linux")]
        let flags = libc::MSG_NOSIGNAL;
        #[cfg(not(target_os = "linux"))]
        let flags = 0;
        loop {
            // SAFETY: buf is a live slice of the given length.
            let n = unsafe { libc::send(fd, buf.as_ptr() as *const libc::c_void, buf.len(), flags) };
            match cvt_size(n) {
                Ok(n) => return Ok(n as usize),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
                Err(e) => return Err(Error::Io(e)),
            }
        }
    }

    /// Receives one datagram, reporting the sender.
    pub fn recv_from(&mut self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let fd = self.require_fd()?;
        let mut received = 0usize;
        // SAFETY: recvfrom fills the storage the closure hands it and
        // writes at most buf.len() bytes into buf.
        let ((), addr) = unsafe {
            SockAddr::try_init(|storage, len| {
                let n = cvt_size(libc::recvfrom(
                    fd,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                    storage as *mut libc::sockaddr,
                    len,
                ))?;
                received = n as usize;
                Ok(())
            })
        }?;
        let addr = addr.as_socket().ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "datagram sender is not an inet address",
            ))
        })?;
        Ok((received, addr))
    }

    /// Sends one datagram to `addr`.
    pub fn send_to(&mut self, addr: SocketAddr, data: &[u8]) -> Result<usize> {
        let fd = self.ensure_fd()?;
        let raw = SockAddr::from(addr);
        #[cfg(target_os = "linux")]
        let flags = libc::MSG_NOSIGNAL;
        #[cfg(not(target_os = "linux"))]
        let flags = 0;
        // SAFETY: data is a live slice; socket2 guarantees the sockaddr.
        let n = cvt_size(unsafe {
            libc::sendto(
                fd,
                data.as_ptr() as *const libc::c_void,
                data.len(),
                flags,
                raw.as_ptr() as *const libc::sockaddr,
                raw.len(),
            )
        })?;
        Ok(n as usize)
    }

    /// Sets the receive timeout. Memoized: setting the same value twice
    /// performs one syscall.
    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        if timeout == self.recv_timeout {
            return Ok(());
        }
        let fd = self.require_fd()?;
        let tv = match timeout {
            Some(t) => libc::timeval {
                tv_sec: t.as_secs() as libc::time_t,
                tv_usec: t.subsec_micros() as libc::suseconds_t,
            },
            None => libc::timeval {
                tv_sec: 0,
                tv_usec: 0,
            },
        };
        // SAFETY: the option value is a timeval read by the kernel.
        cvt(unsafe {
            libc::setsockopt(
                fd,
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const libc::timeval as *const libc::c_void,
                std::mem::size_of::<libc::timeval>() as libc::socklen_t,
            )
        })?;
        self.recv_timeout = timeout;
        Ok(())
    }

    /// The kernel's send-buffer size for this descriptor.
    pub fn send_buffer_size(&self) -> Result<usize> {
        let fd = self.require_fd()?;
        let size = get_opt_int(fd, libc::SOL_SOCKET, libc::SO_SNDBUF)?;
        Ok(size.max(1) as usize)
    }

    /// Creates a read-readiness source for this descriptor on `queue`.
    ///
    /// On a listening socket the source's data hint is the pending accept
    /// count; elsewhere it is the readable byte count.
    pub fn make_read_source(&self, queue: &SerialQueue) -> Result<EventSource> {
        let fd = self.require_fd()?;
        let listening = get_opt_int(fd, libc::SOL_SOCKET, libc::SO_ACCEPTCONN)
            .map(|v| v != 0)
            .unwrap_or(false);
        EventSource::new(fd, Interest::Read, listening, queue)
    }

    /// Creates a write-readiness source for this descriptor on `queue`.
    pub fn make_write_source(&self, queue: &SerialQueue) -> Result<EventSource> {
        let fd = self.require_fd()?;
        EventSource::new(fd, Interest::Write, false, queue)
    }

    /// Closes the descriptor. Idempotent; clears the connected flag and
    /// the memoized receive timeout.
    pub fn close(&mut self) {
        if let Some(fd) = self.fd.take() {
            // SAFETY: fd is ours and closed exactly once.
            unsafe { libc::close(fd) };
        }
        self.connected = false;
        self.recv_timeout = None;
        self.peer = None;
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

/// Waits for a non-blocking connect on `fd` to finish, up to `deadline`.
fn await_connect(fd: RawFd, deadline: Instant) -> Result<()> {
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::TimedOut);
        }
        let timeout_ms = remaining.as_millis().min(i32::MAX as u128) as libc::c_int;

        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLOUT,
            revents: 0,
        };
        // SAFETY: one pollfd, valid for the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms.max(1)) };
        match rc {
            -1 => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(Error::Io(err));
            }
            0 => return Err(Error::TimedOut),
            _ => {
                let status = get_opt_int(fd, libc::SOL_SOCKET, libc::SO_ERROR)?;
                if status == 0 {
                    return Ok(());
                }
                return Err(Error::Io(io::Error::from_raw_os_error(status)));
            }
        }
    }
}
