//! Level-triggered array backend over `poll(2)`.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Instant;

use slab::Slab;
use tracing::error;

use crate::channel::{Channel, ChannelId};
use crate::poller::Poller;

pub(crate) struct PollPoller {
    /// Dense array handed to the kernel each wait.
    pollfds: Vec<libc::pollfd>,
    /// fd -> channel id, for routing revents back.
    fd_to_channel: HashMap<RawFd, ChannelId>,
}

impl PollPoller {
    pub(crate) fn new() -> PollPoller {
        PollPoller {
            pollfds: Vec::with_capacity(16),
            fd_to_channel: HashMap::new(),
        }
    }
}

impl Poller for PollPoller {
    fn poll(
        &mut self,
        timeout_ms: i32,
        channels: &mut Slab<Channel>,
        active: &mut Vec<ChannelId>,
    ) -> Instant {
        let n = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        let now = Instant::now();
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINTR) {
                error!(error = %err, "poll failed");
            }
            return now;
        }
        let mut remaining = n;
        for pfd in &self.pollfds {
            if remaining == 0 {
                break;
            }
            if pfd.revents == 0 {
                continue;
            }
            remaining -= 1;
            // Parked entries (negative fd) never report events.
            if let Some(&id) = self.fd_to_channel.get(&pfd.fd)
                && let Some(ch) = channels.get_mut(id)
            {
                ch.set_revents(pfd.revents as u32);
                active.push(id);
            }
        }
        now
    }

    fn update_channel(&mut self, id: ChannelId, channels: &mut Slab<Channel>) {
        let ch = &mut channels[id];
        if ch.index() < 0 {
            // First registration: append and record the slot. Parked
            // (zero-interest) entries keep the slot without being
            // watched.
            assert!(!self.fd_to_channel.contains_key(&ch.fd()));
            self.pollfds.push(libc::pollfd {
                fd: if ch.is_none_event() {
                    -ch.fd() - 1
                } else {
                    ch.fd()
                },
                events: ch.events() as i16,
                revents: 0,
            });
            ch.set_index((self.pollfds.len() - 1) as i32);
            self.fd_to_channel.insert(ch.fd(), id);
        } else {
            let slot = ch.index() as usize;
            let pfd = &mut self.pollfds[slot];
            pfd.events = ch.events() as i16;
            pfd.revents = 0;
            // Park zero-interest entries so the kernel skips them while
            // the slot stays reserved.
            pfd.fd = if ch.is_none_event() {
                -ch.fd() - 1
            } else {
                ch.fd()
            };
        }
    }

    fn remove_channel(&mut self, id: ChannelId, channels: &mut Slab<Channel>) {
        let (fd, slot) = {
            let ch = &channels[id];
            assert!(ch.is_none_event());
            assert!(ch.index() >= 0);
            (ch.fd(), ch.index() as usize)
        };
        self.fd_to_channel.remove(&fd);
        self.pollfds.swap_remove(slot);
        if slot < self.pollfds.len() {
            // Patch the back-index of the entry that moved into the hole.
            let mut moved_fd = self.pollfds[slot].fd;
            if moved_fd < 0 {
                moved_fd = -moved_fd - 1;
            }
            if let Some(&moved_id) = self.fd_to_channel.get(&moved_fd) {
                channels[moved_id].set_index(slot as i32);
            }
        }
        channels[id].set_index(-1);
    }
}
