//! TCP control layer: listener setup and non-blocking server connects.
//!
//! Everything here is plain socket plumbing; readiness is the poller's
//! business and data movement is the transport's. Bind-time options map to
//! setsockopt calls, connect is always non-blocking with `EINPROGRESS`
//! treated as "in progress", and a later probe distinguishes established
//! from failed using `SO_ERROR`.

#![cfg(unix)]

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{Error, Result};

/// Socket options applied when binding a listener.
#[derive(Debug, Default, Clone)]
pub struct BindOpts {
    /// Bind to foreign addresses (requires CAP_NET_ADMIN on Linux).
    pub transparent: bool,
    /// Wake the accept loop only once data arrives.
    pub defer_accept: bool,
    /// Enable TCP Fast Open with a small queue.
    pub tfo: bool,
    /// Accept both IPv4 and IPv6 on an IPv6 socket.
    pub v4v6: bool,
    /// Restrict an IPv6 socket to IPv6 only.
    pub v6only: bool,
    /// Maximum segment size to advertise.
    pub mss: Option<i32>,
    /// Network device to bind to.
    pub interface: Option<String>,
    pub backlog: i32,
}

fn setsockopt_i32(fd: i32, level: i32, opt: i32, val: i32) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &val as *const i32 as *const libc::c_void,
            std::mem::size_of::<i32>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_transparent(fd: i32) -> io::Result<()> {
    setsockopt_i32(fd, libc::SOL_IP, libc::IP_TRANSPARENT, 1)
}

#[cfg(not(target_os = "linux"))]
fn set_transparent(_fd: i32) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Other,
        "transparent binding not supported on this platform",
    ))
}

#[cfg(target_os = "linux")]
fn set_defer_accept(fd: i32) -> io::Result<()> {
    setsockopt_i32(fd, libc::IPPROTO_TCP, libc::TCP_DEFER_ACCEPT, 1)
}

#[cfg(not(target_os = "linux"))]
fn set_defer_accept(_fd: i32) -> io::Result<()> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn set_fastopen(fd: i32) -> io::Result<()> {
    setsockopt_i32(fd, libc::IPPROTO_TCP, libc::TCP_FASTOPEN, 16)
}

#[cfg(not(target_os = "linux"))]
fn set_fastopen(_fd: i32) -> io::Result<()> {
    Ok(())
}

fn set_mss(fd: i32, mss: i32) -> io::Result<()> {
    setsockopt_i32(fd, libc::IPPROTO_TCP, libc::TCP_MAXSEG, mss)
}

/// Bind and listen with the requested options. Any failure comes back as
/// a config-style error naming the option, never a panic.
pub fn bind_listener(addr: SocketAddr, opts: &BindOpts) -> Result<TcpListener> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let sock =
        Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(Error::new_listen)?;
    sock.set_reuse_address(true).map_err(Error::new_listen)?;
    sock.set_nonblocking(true).map_err(Error::new_listen)?;

    if addr.is_ipv6() {
        if opts.v4v6 {
            sock.set_only_v6(false).map_err(Error::new_listen)?;
        } else if opts.v6only {
            sock.set_only_v6(true).map_err(Error::new_listen)?;
        }
    }
    if opts.transparent {
        set_transparent(sock.as_raw_fd()).map_err(Error::new_listen)?;
    }
    if let Some(mss) = opts.mss {
        set_mss(sock.as_raw_fd(), mss).map_err(Error::new_listen)?;
    }
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "fuchsia"))]
    if let Some(ref dev) = opts.interface {
        sock.bind_device(Some(dev.as_bytes()))
            .map_err(Error::new_listen)?;
    }

    sock.bind(&addr.into()).map_err(Error::new_listen)?;
    let backlog = if opts.backlog > 0 { opts.backlog } else { 1024 };
    sock.listen(backlog).map_err(Error::new_listen)?;

    // deferred options only make sense on a listening socket
    if opts.defer_accept {
        set_defer_accept(sock.as_raw_fd()).map_err(Error::new_listen)?;
    }
    if opts.tfo {
        set_fastopen(sock.as_raw_fd()).map_err(Error::new_listen)?;
    }

    Ok(sock.into())
}

/// Start a non-blocking connect toward a server. Returns the stream and
/// whether the connection is already established (loopback often is).
pub fn connect_server(
    addr: SocketAddr,
    source: Option<SocketAddr>,
    nodelay: bool,
) -> io::Result<(TcpStream, bool)> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let sock = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
    sock.set_nonblocking(true)?;
    if nodelay {
        sock.set_nodelay(true)?;
    }
    if let Some(src) = source {
        sock.set_reuse_address(true)?;
        sock.bind(&src.into())?;
    }
    let established = match sock.connect(&addr.into()) {
        Ok(()) => true,
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => false,
        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => false,
        Err(e) => return Err(e),
    };
    Ok((sock.into(), established))
}

/// Check the outcome of an in-progress connect without consuming data.
/// `Ok(true)` means established, `Ok(false)` means still in progress.
pub fn connect_probe(stream: &TcpStream) -> io::Result<bool> {
    if let Some(err) = stream.take_error()? {
        return Err(err);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(ref e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Source address of an accepted or established connection.
pub fn get_src(stream: &TcpStream) -> io::Result<SocketAddr> {
    stream.peer_addr()
}

/// Original destination address of the connection.
pub fn get_dst(stream: &TcpStream) -> io::Result<SocketAddr> {
    stream.local_addr()
}
