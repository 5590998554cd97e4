//! revio — a multi-reactor TCP networking library for Unix-like
//! systems.
//!
//! One [`EventLoop`] per thread, each with a pluggable readiness
//! demultiplexer (epoll or poll), a timer queue, and an eventfd-driven
//! task queue for cross-thread work. [`TcpServer`] runs a passive
//! acceptor on a base loop and distributes connections round-robin over
//! an I/O thread pool; [`TcpClient`] performs active opens with
//! exponential-backoff retry. Applications hang protocol logic off
//! per-connection callbacks (up/down, message arrival, write-complete,
//! high-water) over a raw byte-stream [`Buffer`].
//!
//! Within one loop, callbacks run strictly sequentially; the only
//! thread-safe surfaces are [`LoopHandle`], [`Conn`], and the facade
//! start/connect entry points, all of which marshal work onto the
//! owning loop in FIFO order.

mod acceptor;
mod channel;
mod connector;
mod sockets;

pub mod buffer;
pub mod client;
pub mod connection;
pub mod endian;
pub mod error;
pub mod event_loop;
pub mod poller;
pub mod server;
pub mod thread_pool;
pub mod timer;

// Public API re-exports
pub use buffer::Buffer;
pub use client::TcpClient;
pub use connection::{
    Conn, ConnId, ConnState, ConnectionCallback, DEFAULT_HIGH_WATER_MARK, HighWaterMarkCallback,
    MessageCallback, WriteCompleteCallback,
};
pub use error::Error;
pub use event_loop::{EventLoop, LoopHandle, Task};
pub use poller::Backend;
pub use server::TcpServer;
pub use thread_pool::{EventLoopThread, EventLoopThreadPool, ThreadInitCallback};
pub use timer::{TimerCallback, TimerId};
