//! Passive open: a bound listening socket whose readiness hands accepted
//! fds to the server facade.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use tracing::{error, info, warn};

use crate::channel::{AcceptorId, ChannelId, ChannelOwner};
use crate::event_loop::EventLoop;
use crate::sockets::{self, Socket};

pub(crate) type NewConnectionCallback =
    Box<dyn FnMut(&mut EventLoop, Socket, SocketAddr) + Send>;

/// A listening socket bound on the caller's thread, before the acceptor
/// is registered with its loop. Binding early makes the resolved address
/// (port 0 included) observable ahead of `start`.
pub(crate) struct BoundListener {
    pub(crate) socket: Socket,
    pub(crate) addr: SocketAddr,
}

pub(crate) fn bind(addr: SocketAddr, reuse_port: bool) -> io::Result<BoundListener> {
    let socket = sockets::create_nonblocking(sockets::family_of(&addr))?;
    socket.set_reuse_addr(true)?;
    if reuse_port {
        socket.set_reuse_port(true)?;
    }
    sockets::bind(socket.fd(), &addr)?;
    let addr = sockets::local_addr(socket.fd())?;
    Ok(BoundListener { socket, addr })
}

pub(crate) struct Acceptor {
    socket: Socket,
    channel: ChannelId,
    new_connection: Option<NewConnectionCallback>,
    listening: bool,
    /// Reserved fd released to survive EMFILE without busy-looping.
    idle_fd: RawFd,
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        if self.idle_fd >= 0 {
            unsafe {
                libc::close(self.idle_fd);
            }
        }
    }
}

fn open_idle_fd() -> RawFd {
    unsafe { libc::open(c"/dev/null".as_ptr(), libc::O_RDONLY | libc::O_CLOEXEC) }
}

pub(crate) fn create(
    ev: &mut EventLoop,
    listener: BoundListener,
    callback: NewConnectionCallback,
) -> AcceptorId {
    ev.assert_in_loop_thread();
    let id = ev.acceptors.vacant_key();
    let channel = ev.add_channel(listener.socket.fd(), ChannelOwner::Acceptor(id));
    ev.acceptors.insert(Acceptor {
        socket: listener.socket,
        channel,
        new_connection: Some(callback),
        listening: false,
        idle_fd: open_idle_fd(),
    });
    id
}

pub(crate) fn listen(ev: &mut EventLoop, id: AcceptorId) {
    ev.assert_in_loop_thread();
    let (fd, channel) = {
        let acceptor = &mut ev.acceptors[id];
        acceptor.listening = true;
        (acceptor.socket.fd(), acceptor.channel)
    };
    if let Err(e) = sockets::listen(fd) {
        // Nothing sensible can run without the listener.
        error!(fd, error = %e, "listen failed");
        panic!("listen on fd {fd}: {e}");
    }
    ev.enable_reading(channel);
    info!(fd, "acceptor listening");
}

pub(crate) fn handle_read(ev: &mut EventLoop, id: AcceptorId) {
    ev.assert_in_loop_thread();
    let Some(acceptor) = ev.acceptors.get_mut(id) else {
        return;
    };
    debug_assert!(acceptor.listening);
    let listen_fd = acceptor.socket.fd();
    match sockets::accept(listen_fd) {
        Ok((socket, peer_addr)) => {
            // Take the callback out so user code runs without the arena
            // borrowed.
            let mut callback = acceptor.new_connection.take();
            if let Some(ref mut f) = callback {
                f(ev, socket, peer_addr);
            } else {
                warn!(peer = %peer_addr, "no new-connection callback, dropping");
            }
            if let Some(acceptor) = ev.acceptors.get_mut(id)
                && acceptor.new_connection.is_none()
            {
                acceptor.new_connection = callback;
            }
        }
        Err(e) => match e.raw_os_error() {
            Some(libc::EMFILE) => {
                warn!("accept hit the fd limit, shedding one connection");
                shed_connection(ev, id);
            }
            Some(
                libc::EAGAIN | libc::EINTR | libc::ECONNABORTED | libc::EPROTO | libc::EPERM,
            ) => {}
            _ => error!(error = %e, "accept failed"),
        },
    }
}

/// EMFILE defense: release the reserved fd, accept-and-close the pending
/// connection so the listener's queue drains, then re-reserve.
fn shed_connection(ev: &mut EventLoop, id: AcceptorId) {
    let Some(acceptor) = ev.acceptors.get_mut(id) else {
        return;
    };
    unsafe {
        libc::close(acceptor.idle_fd);
    }
    let fd = unsafe { libc::accept(acceptor.socket.fd(), std::ptr::null_mut(), std::ptr::null_mut()) };
    if fd >= 0 {
        unsafe {
            libc::close(fd);
        }
    }
    acceptor.idle_fd = open_idle_fd();
}

pub(crate) fn destroy(ev: &mut EventLoop, id: AcceptorId) {
    ev.assert_in_loop_thread();
    if !ev.acceptors.contains(id) {
        return;
    }
    let channel = ev.acceptors[id].channel;
    ev.disable_all(channel);
    ev.remove_channel(channel);
    // Dropping the entry closes the listening socket and the idle fd.
    ev.acceptors.remove(id);
}
