//! Active open: non-blocking connect with exponential-backoff retry.

use std::net::SocketAddr;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::channel::{ChannelId, ChannelOwner, ConnectorId};
use crate::event_loop::EventLoop;
use crate::sockets::{self, Socket};
use crate::timer::TimerId;

const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(500);
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Disconnected,
    Connecting,
    Connected,
}

/// Receives the connected socket once the handshake completes.
pub(crate) type ConnectedCallback = Box<dyn FnMut(&mut EventLoop, Socket) + Send>;

pub(crate) struct Connector {
    server_addr: SocketAddr,
    state: State,
    /// Cleared by `stop`; a disabled connector neither connects nor
    /// retries.
    enabled: bool,
    channel: Option<ChannelId>,
    socket: Option<Socket>,
    retry_delay: Duration,
    retry_timer: Option<TimerId>,
    /// Guards retry timers against slab slot reuse.
    token: u64,
    connected: Option<ConnectedCallback>,
}

pub(crate) fn create(
    ev: &mut EventLoop,
    server_addr: SocketAddr,
    connected: ConnectedCallback,
) -> ConnectorId {
    ev.assert_in_loop_thread();
    let token = ev.next_generation;
    ev.next_generation += 1;
    ev.connectors.insert(Connector {
        server_addr,
        state: State::Disconnected,
        enabled: false,
        channel: None,
        socket: None,
        retry_delay: INITIAL_RETRY_DELAY,
        retry_timer: None,
        token,
        connected: Some(connected),
    })
}

pub(crate) fn start(ev: &mut EventLoop, id: ConnectorId) {
    ev.assert_in_loop_thread();
    let Some(connector) = ev.connectors.get_mut(id) else {
        return;
    };
    connector.enabled = true;
    do_connect(ev, id);
}

/// Reset backoff and go again; used for client-side reconnect.
pub(crate) fn restart(ev: &mut EventLoop, id: ConnectorId) {
    ev.assert_in_loop_thread();
    // Reclaim any in-flight attempt before starting over.
    let _ = take_channel_and_socket(ev, id);
    if let Some(connector) = ev.connectors.get_mut(id) {
        connector.state = State::Disconnected;
        connector.retry_delay = INITIAL_RETRY_DELAY;
        connector.enabled = true;
    }
    do_connect(ev, id);
}

/// Cancel a pending retry and abandon any in-flight connect.
pub(crate) fn stop(ev: &mut EventLoop, id: ConnectorId) {
    ev.assert_in_loop_thread();
    let timer = {
        let Some(connector) = ev.connectors.get_mut(id) else {
            return;
        };
        connector.enabled = false;
        connector.state = State::Disconnected;
        connector.retry_timer.take()
    };
    if let Some(timer) = timer {
        ev.cancel(timer);
    }
    // Dropping the in-flight socket closes it.
    let _ = take_channel_and_socket(ev, id);
}

pub(crate) fn destroy(ev: &mut EventLoop, id: ConnectorId) {
    stop(ev, id);
    if ev.connectors.contains(id) {
        ev.connectors.remove(id);
    }
}

fn do_connect(ev: &mut EventLoop, id: ConnectorId) {
    let (addr, enabled) = match ev.connectors.get(id) {
        Some(c) => (c.server_addr, c.enabled),
        None => return,
    };
    if !enabled {
        debug!("connector disabled, not connecting");
        return;
    }
    let socket = match sockets::create_nonblocking(sockets::family_of(&addr)) {
        Ok(socket) => socket,
        Err(e) => {
            error!(error = %e, "socket creation failed");
            return;
        }
    };
    match sockets::connect(socket.fd(), &addr) {
        Ok(()) => connecting(ev, id, socket),
        Err(e) => match e.raw_os_error() {
            Some(libc::EINPROGRESS | libc::EINTR | libc::EISCONN) => connecting(ev, id, socket),
            Some(
                libc::EAGAIN
                | libc::EADDRINUSE
                | libc::EADDRNOTAVAIL
                | libc::ECONNREFUSED
                | libc::ENETUNREACH,
            ) => retry(ev, id, socket),
            _ => {
                error!(addr = %addr, error = %e, "connect failed, giving up");
            }
        },
    }
}

/// Handshake in flight: watch the socket for writability.
fn connecting(ev: &mut EventLoop, id: ConnectorId, socket: Socket) {
    let fd = socket.fd();
    {
        let Some(connector) = ev.connectors.get_mut(id) else {
            return;
        };
        connector.state = State::Connecting;
        connector.socket = Some(socket);
    }
    let channel = ev.add_channel(fd, ChannelOwner::Connector(id));
    if let Some(connector) = ev.connectors.get_mut(id) {
        connector.channel = Some(channel);
    }
    ev.enable_writing(channel);
}

pub(crate) fn handle_event(ev: &mut EventLoop, id: ConnectorId, revents: u32) {
    const ERROR_BITS: u32 = (libc::POLLERR | libc::POLLNVAL) as u32;
    const WRITE_BITS: u32 = (libc::POLLOUT | libc::POLLHUP) as u32;
    if revents & ERROR_BITS != 0 {
        handle_error(ev, id);
        return;
    }
    if revents & WRITE_BITS != 0 {
        handle_write(ev, id);
    }
}

fn handle_write(ev: &mut EventLoop, id: ConnectorId) {
    if ev.connectors.get(id).map(|c| c.state) != Some(State::Connecting) {
        return;
    }
    let Some(socket) = take_channel_and_socket(ev, id) else {
        return;
    };
    // Writability alone does not mean success.
    let err = sockets::get_socket_error(socket.fd());
    if err != 0 {
        warn!(
            errno = err,
            error = %std::io::Error::from_raw_os_error(err),
            "connect completed with error"
        );
        retry(ev, id, socket);
    } else if sockets::is_self_connect(socket.fd()) {
        warn!("self connect, retrying");
        retry(ev, id, socket);
    } else {
        let enabled = match ev.connectors.get_mut(id) {
            Some(connector) => {
                connector.state = State::Connected;
                connector.enabled
            }
            None => false,
        };
        if enabled {
            let mut callback = ev.connectors.get_mut(id).and_then(|c| c.connected.take());
            if let Some(ref mut f) = callback {
                f(ev, socket);
            }
            if let Some(connector) = ev.connectors.get_mut(id)
                && connector.connected.is_none()
            {
                connector.connected = callback;
            }
        }
        // A stopped connector just drops the freshly-connected socket.
    }
}

fn handle_error(ev: &mut EventLoop, id: ConnectorId) {
    if ev.connectors.get(id).map(|c| c.state) != Some(State::Connecting) {
        return;
    }
    let Some(socket) = take_channel_and_socket(ev, id) else {
        return;
    };
    let err = sockets::get_socket_error(socket.fd());
    error!(
        errno = err,
        error = %std::io::Error::from_raw_os_error(err),
        "connector error"
    );
    retry(ev, id, socket);
}

/// Unregister the connecting channel and reclaim the socket.
fn take_channel_and_socket(ev: &mut EventLoop, id: ConnectorId) -> Option<Socket> {
    let (channel, socket) = {
        let connector = ev.connectors.get_mut(id)?;
        (connector.channel.take(), connector.socket.take())
    };
    if let Some(channel) = channel {
        ev.disable_all(channel);
        ev.remove_channel(channel);
    }
    socket
}

/// Close the failed socket and schedule a fresh attempt with doubled
/// backoff, capped at 30 s.
fn retry(ev: &mut EventLoop, id: ConnectorId, socket: Socket) {
    drop(socket);
    let (enabled, delay, token, addr) = match ev.connectors.get_mut(id) {
        Some(connector) => {
            connector.state = State::Disconnected;
            (
                connector.enabled,
                connector.retry_delay,
                connector.token,
                connector.server_addr,
            )
        }
        None => return,
    };
    if !enabled {
        debug!("connector disabled, not retrying");
        return;
    }
    info!(
        addr = %addr,
        delay_ms = delay.as_millis() as u64,
        "retrying connect"
    );
    let timer = ev.run_after(delay, move |ev| {
        if ev.connectors.get(id).map(|c| c.token) == Some(token) {
            if let Some(connector) = ev.connectors.get_mut(id) {
                connector.retry_timer = None;
            }
            do_connect(ev, id);
        }
    });
    if let Some(connector) = ev.connectors.get_mut(id) {
        connector.retry_timer = Some(timer);
        connector.retry_delay = (delay * 2).min(MAX_RETRY_DELAY);
    }
}
