use std::fmt;
use std::io;

/// Errors returned by revio setup and facade operations.
///
/// Transient per-connection I/O errors never surface here; they are
/// handled inside the loop and reported through connection callbacks.
#[derive(Debug)]
pub enum Error {
    /// A kernel primitive (socket, eventfd, timerfd, epoll fd) could not
    /// be created or configured.
    Io(io::Error),
    /// A listen address could not be bound.
    Bind { addr: String, source: io::Error },
    /// An I/O worker thread could not be spawned or never reported its
    /// event loop back to the parent.
    ThreadSpawn(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::Bind { addr, source } => write!(f, "bind {addr}: {source}"),
            Error::ThreadSpawn(msg) => write!(f, "thread spawn: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Bind { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}
