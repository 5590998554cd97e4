//! Readiness-set backend over `epoll(7)`.

use std::io;
use std::os::fd::RawFd;
use std::time::Instant;

use slab::Slab;
use tracing::{error, trace};

use crate::channel::{Channel, ChannelId};
use crate::poller::Poller;

// The interest masks are built from poll(2) constants; epoll reuses the
// same bit values, which is what lets one Channel mask serve both
// backends.
const _: () = {
    assert!(libc::POLLIN as u32 == libc::EPOLLIN as u32);
    assert!(libc::POLLPRI as u32 == libc::EPOLLPRI as u32);
    assert!(libc::POLLOUT as u32 == libc::EPOLLOUT as u32);
    assert!(libc::POLLERR as u32 == libc::EPOLLERR as u32);
    assert!(libc::POLLHUP as u32 == libc::EPOLLHUP as u32);
    assert!(libc::POLLRDHUP as u32 == libc::EPOLLRDHUP as u32);
};

/// Channel membership tri-state, stored in `Channel::index`.
const STATE_NEW: i32 = -1;
const STATE_ADDED: i32 = 1;
const STATE_DELETED: i32 = 2;

const INITIAL_EVENT_CAPACITY: usize = 16;
const MAX_EVENT_CAPACITY: usize = 65536;

pub(crate) struct EpollPoller {
    epoll_fd: RawFd,
    /// Output buffer for `epoll_wait`; grows 2x when a wait fills it.
    events: Vec<libc::epoll_event>,
}

impl EpollPoller {
    pub(crate) fn new() -> io::Result<EpollPoller> {
        let epoll_fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epoll_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(EpollPoller {
            epoll_fd,
            events: vec![libc::epoll_event { events: 0, u64: 0 }; INITIAL_EVENT_CAPACITY],
        })
    }

    fn ctl(&self, op: libc::c_int, id: ChannelId, ch: &Channel) {
        let mut ev = libc::epoll_event {
            events: ch.events(),
            u64: id as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epoll_fd, op, ch.fd(), &mut ev) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if op == libc::EPOLL_CTL_DEL {
                error!(fd = ch.fd(), error = %err, "epoll_ctl DEL failed");
            } else {
                panic!("epoll_ctl op {} fd {}: {}", op, ch.fd(), err);
            }
        }
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.epoll_fd);
        }
    }
}

impl Poller for EpollPoller {
    fn poll(
        &mut self,
        timeout_ms: i32,
        channels: &mut Slab<Channel>,
        active: &mut Vec<ChannelId>,
    ) -> Instant {
        let n = unsafe {
            libc::epoll_wait(
                self.epoll_fd,
                self.events.as_mut_ptr(),
                self.events.len() as libc::c_int,
                timeout_ms,
            )
        };
        let now = Instant::now();
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!(error = %err, "epoll_wait failed");
            }
            return now;
        }
        let n = n as usize;
        trace!(ready = n, "epoll_wait returned");
        for ev in &self.events[..n] {
            let id = ev.u64 as ChannelId;
            if let Some(ch) = channels.get_mut(id) {
                ch.set_revents(ev.events);
                active.push(id);
            }
        }
        if n == self.events.len() && self.events.len() < MAX_EVENT_CAPACITY {
            self.events
                .resize(self.events.len() * 2, libc::epoll_event { events: 0, u64: 0 });
        }
        now
    }

    fn update_channel(&mut self, id: ChannelId, channels: &mut Slab<Channel>) {
        let ch = &mut channels[id];
        match ch.index() {
            STATE_NEW | STATE_DELETED => {
                if !ch.is_none_event() {
                    self.ctl(libc::EPOLL_CTL_ADD, id, ch);
                    ch.set_index(STATE_ADDED);
                }
            }
            _ => {
                debug_assert_eq!(ch.index(), STATE_ADDED);
                if ch.is_none_event() {
                    self.ctl(libc::EPOLL_CTL_DEL, id, ch);
                    ch.set_index(STATE_DELETED);
                } else {
                    self.ctl(libc::EPOLL_CTL_MOD, id, ch);
                }
            }
        }
    }

    fn remove_channel(&mut self, id: ChannelId, channels: &mut Slab<Channel>) {
        let ch = &mut channels[id];
        assert!(ch.is_none_event());
        if ch.index() == STATE_ADDED {
            self.ctl(libc::EPOLL_CTL_DEL, id, ch);
        }
        ch.set_index(STATE_NEW);
    }
}
