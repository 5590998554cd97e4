//! Thin typed wrappers around the non-blocking socket system calls the
//! reactor core relies on.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;

use tracing::error;

/// An owned socket file descriptor; dropping it closes the fd.
pub struct Socket {
    fd: RawFd,
}

impl Socket {
    pub(crate) fn from_raw(fd: RawFd) -> Socket {
        Socket { fd }
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd
    }

    pub(crate) fn set_reuse_addr(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, on)
    }

    pub(crate) fn set_reuse_port(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, on)
    }

    pub(crate) fn set_keep_alive(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, on)
    }

    pub(crate) fn set_tcp_no_delay(&self, on: bool) -> io::Result<()> {
        set_bool_opt(self.fd, libc::IPPROTO_TCP, libc::TCP_NODELAY, on)
    }

    pub(crate) fn shutdown_write(&self) -> io::Result<()> {
        let ret = unsafe { libc::shutdown(self.fd, libc::SHUT_WR) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        if unsafe { libc::close(self.fd) } < 0 {
            error!(fd = self.fd, error = %io::Error::last_os_error(), "close failed");
        }
    }
}

pub(crate) fn family_of(addr: &SocketAddr) -> libc::c_int {
    if addr.is_ipv4() {
        libc::AF_INET
    } else {
        libc::AF_INET6
    }
}

/// Create a non-blocking, close-on-exec TCP socket.
pub(crate) fn create_nonblocking(family: libc::c_int) -> io::Result<Socket> {
    let fd = unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            libc::IPPROTO_TCP,
        )
    };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(Socket::from_raw(fd))
}

/// Write a `SocketAddr` into a `sockaddr_storage`, returning the address
/// length.
fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sa = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sa = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

/// Read a `SocketAddr` back out of a kernel-filled `sockaddr_storage`.
fn sockaddr_to(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(sa.sin_addr.s_addr.to_ne_bytes());
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, u16::from_be(sa.sin_port))))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                u16::from_be(sa.sin6_port),
                sa.sin6_flowinfo,
                sa.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected address family {family}"),
        )),
    }
}

pub(crate) fn bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = sockaddr_from(addr);
    let ret = unsafe { libc::bind(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn listen(fd: RawFd) -> io::Result<()> {
    let ret = unsafe { libc::listen(fd, libc::SOMAXCONN) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Accept one pending connection; the returned socket is non-blocking
/// and close-on-exec.
pub(crate) fn accept(fd: RawFd) -> io::Result<(Socket, SocketAddr)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let conn_fd = unsafe {
        libc::accept4(
            fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        )
    };
    if conn_fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let socket = Socket::from_raw(conn_fd);
    let peer = sockaddr_to(&storage)?;
    Ok((socket, peer))
}

/// Initiate a non-blocking connect. `EINPROGRESS` surfaces as an error
/// for the caller to classify.
pub(crate) fn connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = sockaddr_from(addr);
    let ret = unsafe { libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn write(fd: RawFd, data: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Pending socket error, consumed from `SO_ERROR`. Zero means none.
pub(crate) fn get_socket_error(fd: RawFd) -> i32 {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    let ret = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if ret < 0 {
        io::Error::last_os_error().raw_os_error().unwrap_or(0)
    } else {
        err
    }
}

pub(crate) fn local_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to(&storage)
}

pub(crate) fn peer_addr(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let ret =
        unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    sockaddr_to(&storage)
}

/// A connect that landed on its own ephemeral port (possible when source
/// and destination are the same host and the port range wraps).
pub(crate) fn is_self_connect(fd: RawFd) -> bool {
    match (local_addr(fd), peer_addr(fd)) {
        (Ok(local), Ok(peer)) => local == peer,
        _ => false,
    }
}

fn set_bool_opt(fd: RawFd, level: libc::c_int, opt: libc::c_int, on: bool) -> io::Result<()> {
    let val: libc::c_int = if on { 1 } else { 0 };
    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            opt,
            &val as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_reports_actual_port() {
        let sock = create_nonblocking(libc::AF_INET).unwrap();
        sock.set_reuse_addr(true).unwrap();
        bind(sock.fd(), &"127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = local_addr(sock.fd()).unwrap();
        assert_eq!(addr.ip().to_string(), "127.0.0.1");
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn sockaddr_round_trip() {
        for addr in ["127.0.0.1:8080", "[::1]:9090"] {
            let addr: SocketAddr = addr.parse().unwrap();
            let (storage, _) = sockaddr_from(&addr);
            assert_eq!(sockaddr_to(&storage).unwrap(), addr);
        }
    }

    #[test]
    fn socket_error_starts_clean() {
        let sock = create_nonblocking(libc::AF_INET).unwrap();
        assert_eq!(get_socket_error(sock.fd()), 0);
    }
}
