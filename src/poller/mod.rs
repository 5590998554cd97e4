//! Pluggable I/O readiness backends.
//!
//! Both backends fill ready masks into the channels in place and append
//! the ready channel ids to `active`; the timestamp is taken immediately
//! after the kernel wait returns. All operations must run on the owning
//! loop's thread.

mod epoll;
mod poll;

use std::io;
use std::time::Instant;

use slab::Slab;

use crate::channel::{Channel, ChannelId};

pub(crate) use epoll::EpollPoller;
pub(crate) use poll::PollPoller;

pub(crate) trait Poller {
    /// Block up to `timeout_ms` for readiness. `EINTR` is not an error:
    /// the wait simply returns with no active channels.
    fn poll(
        &mut self,
        timeout_ms: i32,
        channels: &mut Slab<Channel>,
        active: &mut Vec<ChannelId>,
    ) -> Instant;

    /// Reconcile the backend's view of one channel with its interest
    /// mask and membership state.
    fn update_channel(&mut self, id: ChannelId, channels: &mut Slab<Channel>);

    /// Unregister a channel. Its interest mask must already be empty.
    fn remove_channel(&mut self, id: ChannelId, channels: &mut Slab<Channel>);
}

/// Demultiplexer backend, resolved once at loop construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Backend {
    Epoll,
    Poll,
}

impl Backend {
    /// The process default: epoll, unless `REVIO_USE_POLL` is set in the
    /// environment.
    pub fn from_env() -> Backend {
        if std::env::var_os("REVIO_USE_POLL").is_some() {
            Backend::Poll
        } else {
            Backend::Epoll
        }
    }

    pub(crate) fn create(self) -> io::Result<Box<dyn Poller>> {
        match self {
            Backend::Epoll => Ok(Box::new(EpollPoller::new()?)),
            Backend::Poll => Ok(Box::new(PollPoller::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelOwner, READ_EVENT};
    use std::os::fd::RawFd;

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        let ret = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        assert_eq!(ret, 0);
        (fds[0], fds[1])
    }

    fn readiness_round_trip(mut poller: Box<dyn Poller>) {
        let (rd, wr) = pipe();
        let mut channels = Slab::new();
        let id = channels.insert(Channel::new(rd, ChannelOwner::Wakeup));
        channels[id].add_interest(READ_EVENT);
        poller.update_channel(id, &mut channels);

        // Nothing written yet: no readiness.
        let mut active = Vec::new();
        poller.poll(0, &mut channels, &mut active);
        assert!(active.is_empty());

        let n = unsafe { libc::write(wr, b"x".as_ptr() as *const libc::c_void, 1) };
        assert_eq!(n, 1);
        poller.poll(100, &mut channels, &mut active);
        assert_eq!(active, vec![id]);
        assert_ne!(channels[id].revents() & READ_EVENT, 0);

        channels[id].clear_interest();
        poller.update_channel(id, &mut channels);
        poller.remove_channel(id, &mut channels);
        channels.remove(id);
        unsafe {
            libc::close(rd);
            libc::close(wr);
        }
    }

    #[test]
    fn epoll_readiness() {
        readiness_round_trip(Backend::Epoll.create().unwrap());
    }

    #[test]
    fn poll_readiness() {
        readiness_round_trip(Backend::Poll.create().unwrap());
    }

    #[test]
    fn env_selection_defaults_to_epoll() {
        // The suite does not set REVIO_USE_POLL.
        assert_eq!(Backend::from_env(), Backend::Epoll);
    }
}
