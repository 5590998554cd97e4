//! TCP server facade: the acceptor on the base loop, connections
//! distributed round-robin over an I/O loop pool, and a name-keyed
//! connection registry.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tracing::{error, info};

use crate::acceptor::{self, BoundListener, NewConnectionCallback};
use crate::buffer::Buffer;
use crate::channel::AcceptorId;
use crate::connection::{
    self, Callbacks, CloseCallback, Conn, ConnectionCallback, DEFAULT_HIGH_WATER_MARK,
    HighWaterMarkCallback, MessageCallback, WriteCompleteCallback,
};
use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};
use crate::sockets;
use crate::thread_pool::EventLoopThreadPool;

struct ServerShared {
    name: String,
    /// Name-keyed registry of live connections. Only mutated from
    /// base-loop tasks; the mutex exists for the facade's own reads.
    connections: Mutex<HashMap<String, Conn>>,
    next_conn_id: AtomicU64,
    acceptor: Mutex<Option<AcceptorId>>,
}

/// A TCP server. Bind in `new`, configure callbacks, then `start`.
///
/// The base loop (whose handle is passed in) runs the acceptor; each
/// accepted connection is pinned to one pool loop for its lifetime.
pub struct TcpServer {
    base: LoopHandle,
    local_addr: SocketAddr,
    listener: Option<BoundListener>,
    pool: Arc<EventLoopThreadPool>,
    shared: Arc<ServerShared>,
    started: AtomicBool,
    connection_cb: Arc<ConnectionCallback>,
    message_cb: Arc<MessageCallback>,
    write_complete_cb: Option<Arc<WriteCompleteCallback>>,
    high_water_cb: Option<Arc<HighWaterMarkCallback>>,
    high_water_mark: usize,
    thread_init: Option<Arc<dyn Fn(&mut EventLoop) + Send + Sync>>,
}

impl TcpServer {
    pub fn new(base: LoopHandle, listen_addr: SocketAddr, name: &str) -> Result<TcpServer, Error> {
        TcpServer::with_options(base, listen_addr, name, false)
    }

    /// `reuse_port` opts the listener into `SO_REUSEPORT`.
    pub fn with_options(
        base: LoopHandle,
        listen_addr: SocketAddr,
        name: &str,
        reuse_port: bool,
    ) -> Result<TcpServer, Error> {
        let listener = acceptor::bind(listen_addr, reuse_port).map_err(|source| Error::Bind {
            addr: listen_addr.to_string(),
            source,
        })?;
        let local_addr = listener.addr;
        info!(name, addr = %local_addr, "server bound");
        Ok(TcpServer {
            pool: Arc::new(EventLoopThreadPool::new(base.clone(), name)),
            base,
            local_addr,
            listener: Some(listener),
            shared: Arc::new(ServerShared {
                name: name.to_string(),
                connections: Mutex::new(HashMap::new()),
                next_conn_id: AtomicU64::new(1),
                acceptor: Mutex::new(None),
            }),
            started: AtomicBool::new(false),
            connection_cb: Arc::new(connection::default_connection_callback),
            message_cb: Arc::new(connection::default_message_callback),
            write_complete_cb: None,
            high_water_cb: None,
            high_water_mark: DEFAULT_HIGH_WATER_MARK,
            thread_init: None,
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// The bound address, with an ephemeral port resolved.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of I/O loops; zero keeps all connections on the base loop.
    pub fn set_thread_num(&mut self, num_threads: usize) {
        Arc::get_mut(&mut self.pool)
            .expect("set_thread_num after start")
            .set_thread_num(num_threads);
    }

    pub fn set_thread_init_callback(
        &mut self,
        callback: impl Fn(&mut EventLoop) + Send + Sync + 'static,
    ) {
        self.thread_init = Some(Arc::new(callback));
    }

    /// Fired on connection up and down; check [`Conn::connected`].
    pub fn set_connection_callback(&mut self, callback: impl Fn(&Conn) + Send + Sync + 'static) {
        self.connection_cb = Arc::new(callback);
    }

    pub fn set_message_callback(
        &mut self,
        callback: impl Fn(&Conn, &mut Buffer, Instant) + Send + Sync + 'static,
    ) {
        self.message_cb = Arc::new(callback);
    }

    /// Fired each time a connection's output buffer fully drains.
    pub fn set_write_complete_callback(
        &mut self,
        callback: impl Fn(&Conn) + Send + Sync + 'static,
    ) {
        self.write_complete_cb = Some(Arc::new(callback));
    }

    /// Fired once per upward crossing of `mark` output-buffered bytes.
    pub fn set_high_water_mark_callback(
        &mut self,
        callback: impl Fn(&Conn, usize) + Send + Sync + 'static,
        mark: usize,
    ) {
        self.high_water_cb = Some(Arc::new(callback));
        self.high_water_mark = mark;
    }

    /// Current number of live connections.
    pub fn num_connections(&self) -> usize {
        self.shared.connections.lock().unwrap().len()
    }

    /// Start the pool and the acceptor. Idempotent; extra calls are
    /// no-ops.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        Arc::get_mut(&mut self.pool)
            .expect("pool already shared")
            .start(self.thread_init.clone())?;
        let listener = self.listener.take().expect("listener consumed");
        let callbacks = Arc::new(Callbacks {
            connection: self.connection_cb.clone(),
            message: self.message_cb.clone(),
            write_complete: self.write_complete_cb.clone(),
            high_water_mark: self.high_water_cb.clone(),
            high_water_mark_bytes: self.high_water_mark,
        });
        let pool = self.pool.clone();
        let shared = self.shared.clone();
        let base = self.base.clone();
        self.base.run_in_loop(move |ev| {
            let callback = new_connection_callback(pool, shared.clone(), base, callbacks);
            let id = acceptor::create(ev, listener, callback);
            *shared.acceptor.lock().unwrap() = Some(id);
            acceptor::listen(ev, id);
        });
        Ok(())
    }
}

/// Runs on the base loop for every accepted fd: pick an I/O loop, mint a
/// name, build the connection there, register it, establish it.
fn new_connection_callback(
    pool: Arc<EventLoopThreadPool>,
    shared: Arc<ServerShared>,
    base: LoopHandle,
    callbacks: Arc<Callbacks>,
) -> NewConnectionCallback {
    Box::new(move |_ev, socket, peer_addr| {
        let io_loop = pool.get_next_loop();
        let seq = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let local_addr = match sockets::local_addr(socket.fd()) {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "getsockname on accepted fd failed");
                return;
            }
        };
        let name = format!("{}-{}#{}", shared.name, local_addr, seq);
        info!(name = %name, peer = %peer_addr, "new connection");

        let close_cb = remove_connection_callback(base.clone(), shared.clone());
        let callbacks = callbacks.clone();
        let register_shared = shared.clone();
        let register_base = base.clone();
        io_loop.run_in_loop(move |ev| {
            let id = connection::create(
                ev,
                name,
                socket,
                local_addr,
                peer_addr,
                callbacks,
                Some(close_cb),
            );
            if let Some(handle) = connection::make_handle(ev, id) {
                register_base.queue_in_loop(move |_| {
                    let key = handle.name().to_string();
                    register_shared.connections.lock().unwrap().insert(key, handle);
                });
            }
            connection::establish(ev, id);
        });
    })
}

/// The internal close callback: erase from the registry on the base
/// loop, then tear the connection down on its own loop.
fn remove_connection_callback(base: LoopHandle, shared: Arc<ServerShared>) -> Arc<CloseCallback> {
    Arc::new(move |conn: &Conn| {
        let shared = shared.clone();
        let conn = conn.clone();
        base.run_in_loop(move |_| {
            info!(name = conn.name(), "removing connection");
            shared.connections.lock().unwrap().remove(conn.name());
            let id = conn.id();
            conn.loop_handle()
                .queue_in_loop(move |ev| connection::destroy(ev, id));
        });
    })
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        let connections: Vec<Conn> = self
            .shared
            .connections
            .lock()
            .unwrap()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in connections {
            let id = conn.id();
            conn.loop_handle()
                .queue_in_loop(move |ev| connection::destroy(ev, id));
        }
        let shared = self.shared.clone();
        self.base.queue_in_loop(move |ev| {
            if let Some(id) = shared.acceptor.lock().unwrap().take() {
                acceptor::destroy(ev, id);
            }
        });
        // Pool drop quits and joins the I/O threads after the destroy
        // tasks above have been queued to them.
    }
}
