//! The per-connection state machine: read/write pipelines, buffers, and
//! back-pressure signalling.
//!
//! Connections live in their owning loop's arena and are referred to by
//! generation-tagged [`ConnId`]s. The user-facing [`Conn`] handle is
//! clonable and thread-safe; every operation on it marshals onto the
//! owning loop and silently no-ops if the id has gone stale — the
//! equivalent of a weak reference that fails to promote.

use std::any::Any;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use crate::buffer::Buffer;
use crate::channel::{ChannelId, ChannelOwner};
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sockets::{self, Socket};

/// Output-buffer size above which the high-water callback fires, unless
/// overridden by the facade.
pub const DEFAULT_HIGH_WATER_MARK: usize = 64 * 1024 * 1024;

/// Generation-tagged connection id. Stale ids (the slot was released or
/// reused) make every operation a no-op.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConnId {
    pub(crate) index: usize,
    pub(crate) generation: u64,
}

/// Connection lifecycle. Transitions follow
/// `Connecting -> Connected -> Disconnecting -> Disconnected`, with
/// `Connecting -> Disconnected` on an aborted open.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Connecting = 0,
    Connected = 1,
    Disconnecting = 2,
    Disconnected = 3,
}

fn state_from_u8(v: u8) -> ConnState {
    match v {
        0 => ConnState::Connecting,
        1 => ConnState::Connected,
        2 => ConnState::Disconnecting,
        _ => ConnState::Disconnected,
    }
}

pub type ConnectionCallback = dyn Fn(&Conn) + Send + Sync;
pub type MessageCallback = dyn Fn(&Conn, &mut Buffer, Instant) + Send + Sync;
pub type WriteCompleteCallback = dyn Fn(&Conn) + Send + Sync;
pub type HighWaterMarkCallback = dyn Fn(&Conn, usize) + Send + Sync;
pub(crate) type CloseCallback = dyn Fn(&Conn) + Send + Sync;

/// Callback set shared by every connection of one server or client.
pub(crate) struct Callbacks {
    pub(crate) connection: Arc<ConnectionCallback>,
    pub(crate) message: Arc<MessageCallback>,
    pub(crate) write_complete: Option<Arc<WriteCompleteCallback>>,
    pub(crate) high_water_mark: Option<Arc<HighWaterMarkCallback>>,
    pub(crate) high_water_mark_bytes: usize,
}

pub(crate) fn default_connection_callback(conn: &Conn) {
    trace!(
        name = conn.name(),
        peer = %conn.peer_addr(),
        up = conn.connected(),
        "connection state changed"
    );
}

pub(crate) fn default_message_callback(_conn: &Conn, buffer: &mut Buffer, _when: Instant) {
    buffer.retrieve_all();
}

/// Arena entry; loop-affine.
pub(crate) struct TcpConnection {
    pub(crate) name: Arc<str>,
    state: ConnState,
    /// Mirror of `state` readable from handles on any thread.
    state_cell: Arc<AtomicU8>,
    pub(crate) socket: Socket,
    pub(crate) channel: ChannelId,
    pub(crate) local_addr: SocketAddr,
    pub(crate) peer_addr: SocketAddr,
    pub(crate) input: Buffer,
    pub(crate) output: Buffer,
    pub(crate) high_water_mark: usize,
    pub(crate) reading: bool,
    pub(crate) generation: u64,
    pub(crate) callbacks: Arc<Callbacks>,
    pub(crate) close_callback: Option<Arc<CloseCallback>>,
    context: Arc<Mutex<Option<Box<dyn Any + Send>>>>,
}

impl TcpConnection {
    fn set_state(&mut self, state: ConnState) {
        self.state = state;
        self.state_cell.store(state as u8, Ordering::Release);
    }
}

/// Thread-safe connection handle, the user-facing face of a
/// `TcpConnection`. Cloning is cheap; all clones of one connection share
/// the same context slot and observe the same state.
#[derive(Clone)]
pub struct Conn {
    loop_handle: LoopHandle,
    id: ConnId,
    name: Arc<str>,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: Arc<AtomicU8>,
    context: Arc<Mutex<Option<Box<dyn Any + Send>>>>,
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("name", &self.name)
            .field("peer", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl Conn {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    pub fn state(&self) -> ConnState {
        state_from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn connected(&self) -> bool {
        self.state() == ConnState::Connected
    }

    /// Send bytes over the connection. Safe from any thread; bytes from
    /// one caller are never interleaved with another's, and submission
    /// order is preserved per sending thread.
    pub fn send(&self, data: &[u8]) {
        if self.state() != ConnState::Connected {
            return;
        }
        let id = self.id;
        let data = data.to_vec();
        self.loop_handle
            .run_in_loop(move |ev| send_in_loop(ev, id, &data));
    }

    /// Close the write side once the output buffer drains.
    pub fn shutdown(&self) {
        let id = self.id;
        self.loop_handle.run_in_loop(move |ev| shutdown_begin(ev, id));
    }

    /// Close now, as if the peer had vanished; the down callback still
    /// fires.
    pub fn force_close(&self) {
        let id = self.id;
        self.loop_handle
            .queue_in_loop(move |ev| force_close_in_loop(ev, id));
    }

    pub fn force_close_with_delay(&self, delay: Duration) {
        let id = self.id;
        self.loop_handle
            .run_after(delay, move |ev| force_close_in_loop(ev, id));
    }

    pub fn set_tcp_no_delay(&self, on: bool) {
        let id = self.id;
        self.loop_handle.run_in_loop(move |ev| {
            if let Some(conn) = get(ev, id)
                && let Err(e) = conn.socket.set_tcp_no_delay(on)
            {
                warn!(error = %e, "TCP_NODELAY failed");
            }
        });
    }

    /// Resume delivering message callbacks after `stop_read`.
    pub fn start_read(&self) {
        let id = self.id;
        self.loop_handle
            .run_in_loop(move |ev| start_read_in_loop(ev, id));
    }

    /// Stop reading from the socket; kernel-level back-pressure builds
    /// toward the peer.
    pub fn stop_read(&self) {
        let id = self.id;
        self.loop_handle
            .run_in_loop(move |ev| stop_read_in_loop(ev, id));
    }

    /// Store an opaque per-connection value, shared by all handle
    /// clones.
    pub fn set_context(&self, value: Box<dyn Any + Send>) {
        *self.context.lock().unwrap() = Some(value);
    }

    pub fn take_context(&self) -> Option<Box<dyn Any + Send>> {
        self.context.lock().unwrap().take()
    }

    pub fn with_context<R>(&self, f: impl FnOnce(&mut Option<Box<dyn Any + Send>>) -> R) -> R {
        f(&mut self.context.lock().unwrap())
    }
}

/// Register a new connection on the loop, in `Connecting` state.
pub(crate) fn create(
    ev: &mut EventLoop,
    name: String,
    socket: Socket,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    callbacks: Arc<Callbacks>,
    close_callback: Option<Arc<CloseCallback>>,
) -> ConnId {
    ev.assert_in_loop_thread();
    if let Err(e) = socket.set_keep_alive(true) {
        warn!(error = %e, "SO_KEEPALIVE failed");
    }
    let generation = ev.next_generation;
    ev.next_generation += 1;
    let index = ev.conns.vacant_key();
    let id = ConnId { index, generation };
    let channel = ev.add_channel(socket.fd(), ChannelOwner::Connection(id));
    debug!(name = %name, fd = socket.fd(), "connection created");
    let high_water_mark = callbacks.high_water_mark_bytes;
    ev.conns.insert(TcpConnection {
        name: name.into(),
        state: ConnState::Connecting,
        state_cell: Arc::new(AtomicU8::new(ConnState::Connecting as u8)),
        socket,
        channel,
        local_addr,
        peer_addr,
        input: Buffer::new(),
        output: Buffer::new(),
        high_water_mark,
        reading: true,
        generation,
        callbacks,
        close_callback,
        context: Arc::new(Mutex::new(None)),
    });
    id
}

fn get(ev: &mut EventLoop, id: ConnId) -> Option<&mut TcpConnection> {
    ev.conns
        .get_mut(id.index)
        .filter(|conn| conn.generation == id.generation)
}

/// Mint a thread-safe handle for a live connection.
pub(crate) fn make_handle(ev: &EventLoop, id: ConnId) -> Option<Conn> {
    let conn = ev
        .conns
        .get(id.index)
        .filter(|conn| conn.generation == id.generation)?;
    Some(Conn {
        loop_handle: ev.handle(),
        id,
        name: conn.name.clone(),
        local_addr: conn.local_addr,
        peer_addr: conn.peer_addr,
        state: conn.state_cell.clone(),
        context: conn.context.clone(),
    })
}

/// Complete the handover from acceptor/connector: start reading and fire
/// the user's up callback. Called exactly once, on the owning loop.
pub(crate) fn establish(ev: &mut EventLoop, id: ConnId) {
    ev.assert_in_loop_thread();
    let Some(handle) = make_handle(ev, id) else {
        return;
    };
    let (channel, connection_cb) = {
        let Some(conn) = get(ev, id) else { return };
        assert_eq!(conn.state, ConnState::Connecting);
        conn.set_state(ConnState::Connected);
        (conn.channel, conn.callbacks.connection.clone())
    };
    ev.enable_reading(channel);
    connection_cb(&handle);
}

/// Final teardown on the owning loop: unregister the channel and drop
/// the arena entry (which closes the socket). If the connection never
/// saw `handle_close` (facade shutdown), the down callback fires here.
pub(crate) fn destroy(ev: &mut EventLoop, id: ConnId) {
    ev.assert_in_loop_thread();
    let handle = make_handle(ev, id);
    let (channel, was_connected, connection_cb) = {
        let Some(conn) = get(ev, id) else { return };
        let was_connected = conn.state == ConnState::Connected;
        if was_connected {
            conn.set_state(ConnState::Disconnected);
        }
        (conn.channel, was_connected, conn.callbacks.connection.clone())
    };
    ev.disable_all(channel);
    if was_connected && let Some(handle) = handle {
        connection_cb(&handle);
    }
    ev.remove_channel(channel);
    let conn = ev.conns.remove(id.index);
    debug!(name = %conn.name, "connection destroyed");
}

/// Ready-mask dispatch. Priority: hang-up with nothing readable closes;
/// error bits report; then read, then write. The generation check at
/// the top is the tie: a stale id means the owner is gone and the event
/// is dropped.
pub(crate) fn handle_event(ev: &mut EventLoop, id: ConnId, revents: u32, when: Instant) {
    if get(ev, id).is_none() {
        trace!(?id, "event for stale connection dropped");
        return;
    }
    const READ_BITS: u32 = (libc::POLLIN | libc::POLLPRI | libc::POLLRDHUP) as u32;
    const ERROR_BITS: u32 = (libc::POLLERR | libc::POLLNVAL) as u32;
    const HUP_BIT: u32 = libc::POLLHUP as u32;
    const IN_BIT: u32 = libc::POLLIN as u32;
    const OUT_BIT: u32 = libc::POLLOUT as u32;

    if revents & HUP_BIT != 0 && revents & IN_BIT == 0 {
        // Peer is gone with nothing left to read; close preempts
        // read/write for this event.
        handle_close(ev, id);
        return;
    }
    if revents & ERROR_BITS != 0 {
        handle_error(ev, id);
    }
    if revents & READ_BITS != 0 {
        handle_read(ev, id, when);
    }
    if revents & OUT_BIT != 0 {
        handle_write(ev, id);
    }
}

fn handle_read(ev: &mut EventLoop, id: ConnId, when: Instant) {
    ev.assert_in_loop_thread();
    let Some(handle) = make_handle(ev, id) else {
        return;
    };
    let result = {
        let Some(conn) = get(ev, id) else { return };
        let fd = conn.socket.fd();
        conn.input.read_fd(fd)
    };
    match result {
        Ok(0) => handle_close(ev, id),
        Ok(_) => {
            let message_cb = {
                let Some(conn) = get(ev, id) else { return };
                conn.callbacks.message.clone()
            };
            let Some(conn) = get(ev, id) else { return };
            message_cb(&handle, &mut conn.input, when);
        }
        Err(e) => {
            if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted) {
                return;
            }
            error!(name = handle.name(), error = %e, "read failed");
            handle_error(ev, id);
        }
    }
}

fn handle_write(ev: &mut EventLoop, id: ConnId) {
    ev.assert_in_loop_thread();
    let Some(channel) = get(ev, id).map(|conn| conn.channel) else {
        return;
    };
    if !ev.channels[channel].is_writing() {
        trace!("connection is down, no more writing");
        return;
    }
    let (drained, state, write_complete_cb) = {
        let Some(conn) = get(ev, id) else { return };
        let fd = conn.socket.fd();
        match sockets::write(fd, conn.output.peek()) {
            Ok(n) => {
                conn.output.retrieve(n);
                (
                    conn.output.readable_bytes() == 0,
                    conn.state,
                    conn.callbacks.write_complete.clone(),
                )
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::WouldBlock {
                    error!(error = %e, "write failed");
                }
                return;
            }
        }
    };
    if drained {
        // Stop watching writability or the loop would spin.
        ev.disable_writing(channel);
        if let Some(cb) = write_complete_cb
            && let Some(handle) = make_handle(ev, id)
        {
            ev.queue_in_loop(move |_| cb(&handle));
        }
        if state == ConnState::Disconnecting {
            shutdown_in_loop(ev, id);
        }
    }
}

/// Write directly when the pipeline is idle, buffer the rest, signal
/// the high-water crossing, then watch for writability.
pub(crate) fn send_in_loop(ev: &mut EventLoop, id: ConnId, data: &[u8]) {
    ev.assert_in_loop_thread();
    let Some(channel) = get(ev, id).map(|conn| conn.channel) else {
        return;
    };
    let is_writing = ev.channels[channel].is_writing();
    let mut nwrote = 0usize;
    let mut fault = false;
    {
        let Some(conn) = get(ev, id) else { return };
        if conn.state == ConnState::Disconnected {
            warn!(name = %conn.name, "disconnected, give up writing");
            return;
        }
        // Nothing queued and not watching writability: try the kernel
        // directly.
        if !is_writing && conn.output.readable_bytes() == 0 {
            let fd = conn.socket.fd();
            match sockets::write(fd, data) {
                Ok(n) => nwrote = n,
                Err(e) => {
                    if e.kind() != io::ErrorKind::WouldBlock {
                        error!(name = %conn.name, error = %e, "send failed");
                        if matches!(e.raw_os_error(), Some(libc::EPIPE | libc::ECONNRESET)) {
                            fault = true;
                        }
                    }
                }
            }
        }
    }
    let remaining = data.len() - nwrote;
    if remaining == 0 {
        let write_complete_cb = get(ev, id).and_then(|conn| conn.callbacks.write_complete.clone());
        if let Some(cb) = write_complete_cb
            && let Some(handle) = make_handle(ev, id)
        {
            ev.queue_in_loop(move |_| cb(&handle));
        }
        return;
    }
    if fault {
        return;
    }
    let (crossed, new_len, high_water_cb) = {
        let Some(conn) = get(ev, id) else { return };
        let old_len = conn.output.readable_bytes();
        conn.output.append(&data[nwrote..]);
        let new_len = old_len + remaining;
        // Fire only on the upward crossing, not on every append above
        // the mark.
        let crossed = new_len >= conn.high_water_mark && old_len < conn.high_water_mark;
        (crossed, new_len, conn.callbacks.high_water_mark.clone())
    };
    if crossed
        && let Some(cb) = high_water_cb
        && let Some(handle) = make_handle(ev, id)
    {
        ev.queue_in_loop(move |_| cb(&handle, new_len));
    }
    if !ev.channels[channel].is_writing() {
        ev.enable_writing(channel);
    }
}

pub(crate) fn shutdown_begin(ev: &mut EventLoop, id: ConnId) {
    let Some(conn) = get(ev, id) else { return };
    if conn.state != ConnState::Connected {
        return;
    }
    conn.set_state(ConnState::Disconnecting);
    shutdown_in_loop(ev, id);
}

fn shutdown_in_loop(ev: &mut EventLoop, id: ConnId) {
    ev.assert_in_loop_thread();
    let Some(channel) = get(ev, id).map(|conn| conn.channel) else {
        return;
    };
    if ev.channels[channel].is_writing() {
        // Output not drained yet; handle_write re-invokes this once it
        // is.
        return;
    }
    if let Some(conn) = get(ev, id)
        && let Err(e) = conn.socket.shutdown_write()
    {
        error!(name = %conn.name, error = %e, "shutdown(SHUT_WR) failed");
    }
}

pub(crate) fn force_close_in_loop(ev: &mut EventLoop, id: ConnId) {
    let should_close = match get(ev, id) {
        Some(conn) => matches!(conn.state, ConnState::Connected | ConnState::Disconnecting),
        None => false,
    };
    if should_close {
        // As if a zero-byte read had arrived.
        handle_close(ev, id);
    }
}

fn start_read_in_loop(ev: &mut EventLoop, id: ConnId) {
    ev.assert_in_loop_thread();
    let Some((channel, reading)) = get(ev, id).map(|conn| (conn.channel, conn.reading)) else {
        return;
    };
    if !reading || !ev.channels[channel].is_reading() {
        ev.enable_reading(channel);
        if let Some(conn) = get(ev, id) {
            conn.reading = true;
        }
    }
}

fn stop_read_in_loop(ev: &mut EventLoop, id: ConnId) {
    ev.assert_in_loop_thread();
    let Some((channel, reading)) = get(ev, id).map(|conn| (conn.channel, conn.reading)) else {
        return;
    };
    if reading || ev.channels[channel].is_reading() {
        ev.disable_reading(channel);
        if let Some(conn) = get(ev, id) {
            conn.reading = false;
        }
    }
}

/// Runs exactly once per connection: down callback, then the facade's
/// close callback (which unregisters the handle and schedules
/// `destroy`).
fn handle_close(ev: &mut EventLoop, id: ConnId) {
    ev.assert_in_loop_thread();
    let Some(handle) = make_handle(ev, id) else {
        return;
    };
    let (channel, connection_cb, close_cb) = {
        let Some(conn) = get(ev, id) else { return };
        assert!(
            matches!(conn.state, ConnState::Connected | ConnState::Disconnecting),
            "handle_close in state {:?}",
            conn.state
        );
        trace!(name = %conn.name, state = ?conn.state, "closing");
        conn.set_state(ConnState::Disconnected);
        (
            conn.channel,
            conn.callbacks.connection.clone(),
            conn.close_callback.clone(),
        )
    };
    ev.disable_all(channel);
    connection_cb(&handle);
    // Must run last; the facade tears the connection down from here.
    if let Some(cb) = close_cb {
        cb(&handle);
    }
}

fn handle_error(ev: &mut EventLoop, id: ConnId) {
    let Some(conn) = get(ev, id) else { return };
    let err = sockets::get_socket_error(conn.socket.fd());
    error!(
        name = %conn.name,
        errno = err,
        error = %io::Error::from_raw_os_error(err),
        "connection error"
    );
}
