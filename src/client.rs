//! TCP client facade: one connector, at most one live connection, and
//! optional reconnect.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{error, info};

use crate::buffer::Buffer;
use crate::channel::ConnectorId;
use crate::connection::{
    self, Callbacks, CloseCallback, Conn, ConnectionCallback, DEFAULT_HIGH_WATER_MARK,
    HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
use crate::connector::{self, ConnectedCallback};
use crate::event_loop::LoopHandle;
use crate::sockets;

struct ClientShared {
    name: String,
    server_addr: SocketAddr,
    connector: Mutex<Option<ConnectorId>>,
    connection: Mutex<Option<Conn>>,
    /// Reconnect automatically after a lost connection.
    retry: AtomicBool,
    /// User intent: false once `disconnect`/`stop` was called.
    connect: AtomicBool,
    next_conn_id: AtomicU64,
}

/// A TCP client bound to one loop.
pub struct TcpClient {
    loop_handle: LoopHandle,
    shared: Arc<ClientShared>,
    connection_cb: Arc<ConnectionCallback>,
    message_cb: Arc<MessageCallback>,
    write_complete_cb: Option<Arc<WriteCompleteCallback>>,
    high_water_cb: Option<Arc<HighWaterMarkCallback>>,
    high_water_mark: usize,
}

impl TcpClient {
    pub fn new(loop_handle: LoopHandle, server_addr: SocketAddr, name: &str) -> TcpClient {
        TcpClient {
            loop_handle,
            shared: Arc::new(ClientShared {
                name: name.to_string(),
                server_addr,
                connector: Mutex::new(None),
                connection: Mutex::new(None),
                retry: AtomicBool::new(false),
                connect: AtomicBool::new(true),
                next_conn_id: AtomicU64::new(1),
            }),
            connection_cb: Arc::new(connection::default_connection_callback),
            message_cb: Arc::new(connection::default_message_callback),
            write_complete_cb: None,
            high_water_cb: None,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn server_addr(&self) -> SocketAddr {
        self.shared.server_addr
    }

    /// The live connection, if any.
    pub fn connection(&self) -> Option<Conn> {
        self.shared.connection.lock().unwrap().clone()
    }

    /// Reconnect with reset backoff whenever an established connection
    /// goes down.
    pub fn enable_retry(&self) {
        self.shared.retry.store(true, Ordering::Release);
    }

    pub fn retry_enabled(&self) -> bool {
        self.shared.retry.load(Ordering::Acquire)
    }

    pub fn set_connection_callback(&mut self, callback: impl Fn(&Conn) + Send + Sync + 'static) {
        self.connection_cb = Arc::new(callback);
    }

    pub fn set_message_callback(
        &mut self,
        callback: impl Fn(&Conn, &mut Buffer, Instant) + Send + Sync + 'static,
    ) {
        self.message_cb = Arc::new(callback);
    }

    pub fn set_write_complete_callback(
        &mut self,
        callback: impl Fn(&Conn) + Send + Sync + 'static,
    ) {
        self.write_complete_cb = Some(Arc::new(callback));
    }

    pub fn set_high_water_mark_callback(
        &mut self,
        callback: impl Fn(&Conn, usize) + Send + Sync + 'static,
        mark: usize,
    ) {
        self.high_water_cb = Some(Arc::new(callback));
        self.high_water_mark = mark;
    }

    /// Begin the active open. Safe to call again after `stop` or
    /// `disconnect`.
    pub fn connect(&self) {
        self.shared.connect.store(true, Ordering::Release);
        info!(name = %self.shared.name, addr = %self.shared.server_addr, "connecting");
        let callbacks = Arc::new(Callbacks {
            connection: self.connection_cb.clone(),
            message: self.message_cb.clone(),
            write_complete: self.write_complete_cb.clone(),
            high_water_mark: self.high_water_cb.clone(),
            high_water_mark_bytes: self.high_water_mark,
        });
        let shared = self.shared.clone();
        let loop_handle = self.loop_handle.clone();
        self.loop_handle.run_in_loop(move |ev| {
            let existing = *shared.connector.lock().unwrap();
            if let Some(id) = existing
                && ev.connectors.contains(id)
            {
                connector::restart(ev, id);
                return;
            }
            let callback = connected_callback(shared.clone(), loop_handle, callbacks);
            let id = connector::create(ev, shared.server_addr, callback);
            *shared.connector.lock().unwrap() = Some(id);
            connector::start(ev, id);
        });
    }

    /// Shut down the live connection gracefully; the connector stays
    /// usable.
    pub fn disconnect(&self) {
        self.shared.connect.store(false, Ordering::Release);
        if let Some(conn) = self.shared.connection.lock().unwrap().as_ref() {
            conn.shutdown();
        }
    }

    /// Abort connecting: cancel pending retries and abandon any
    /// in-flight open.
    pub fn stop(&self) {
        self.shared.connect.store(false, Ordering::Release);
        let shared = self.shared.clone();
        self.loop_handle.run_in_loop(move |ev| {
            if let Some(id) = *shared.connector.lock().unwrap() {
                connector::stop(ev, id);
            }
        });
    }
}

/// Runs on the client's loop with the freshly-connected socket.
fn connected_callback(
    shared: Arc<ClientShared>,
    loop_handle: LoopHandle,
    callbacks: Arc<Callbacks>,
) -> ConnectedCallback {
    Box::new(move |ev, socket| {
        let peer_addr = match sockets::peer_addr(socket.fd()) {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "getpeername on connected fd failed");
                return;
            }
        };
        let local_addr = match sockets::local_addr(socket.fd()) {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "getsockname on connected fd failed");
                return;
            }
        };
        let seq = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}:{}#{}", shared.name, peer_addr, seq);
        info!(name = %name, peer = %peer_addr, "connected");

        let close_cb = remove_connection_callback(shared.clone(), loop_handle.clone());
        let id = connection::create(
            ev,
            name,
            socket,
            local_addr,
            peer_addr,
            callbacks.clone(),
            Some(close_cb),
        );
        if let Some(handle) = connection::make_handle(ev, id) {
            *shared.connection.lock().unwrap() = Some(handle);
        }
        connection::establish(ev, id);
    })
}

/// Internal close callback: drop the handle, destroy the connection,
/// and re-arm the connector when retry is on.
fn remove_connection_callback(
    shared: Arc<ClientShared>,
    loop_handle: LoopHandle,
) -> Arc<CloseCallback> {
    Arc::new(move |conn: &Conn| {
        let shared = shared.clone();
        let id = conn.id();
        loop_handle.queue_in_loop(move |ev| {
            *shared.connection.lock().unwrap() = None;
            connection::destroy(ev, id);
            if shared.retry.load(Ordering::Acquire)
                && shared.connect.load(Ordering::Acquire)
                && let Some(connector_id) = *shared.connector.lock().unwrap()
            {
                info!("connection lost, reconnecting");
                connector::restart(ev, connector_id);
            }
        });
    })
}

impl Drop for TcpClient {
    fn drop(&mut self) {
        let connection = self.shared.connection.lock().unwrap().take();
        if let Some(conn) = connection {
            let id = conn.id();
            conn.loop_handle()
                .queue_in_loop(move |ev| connection::destroy(ev, id));
        }
        let shared = self.shared.clone();
        self.loop_handle.queue_in_loop(move |ev| {
            if let Some(id) = shared.connector.lock().unwrap().take() {
                connector::destroy(ev, id);
            }
        });
    }
}
