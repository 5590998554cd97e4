//! Best-efforts timer queue, driven by a timerfd registered with the
//! owning loop.
//!
//! Two parallel views hold the same set of timers: a map ordered by
//! `(expiration, sequence)` decides fire order, and a map keyed by
//! sequence serves cancellation by handle. The monotonic sequence makes
//! keys unique even for simultaneous expirations.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tracing::{error, warn};

use crate::event_loop::EventLoop;

/// Handle for cancelling a scheduled timer.
///
/// Cancellation is best-effort: a callback already running finishes, but
/// a repeating timer cancelled mid-fire is not re-armed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

pub type TimerCallback = Box<dyn FnMut(&mut EventLoop) + Send>;

static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Sequences are allocated before the timer reaches its loop, so a
/// `TimerId` can be returned from any thread immediately.
pub(crate) fn next_sequence() -> u64 {
    NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed)
}

pub(crate) struct Timer {
    pub(crate) callback: TimerCallback,
    pub(crate) expiration: Instant,
    /// `None` for one-shot timers.
    pub(crate) interval: Option<Duration>,
    pub(crate) sequence: u64,
}

pub(crate) struct TimerQueue {
    timer_fd: RawFd,
    /// Pending timers by fire order.
    timers: BTreeMap<(Instant, u64), Timer>,
    /// The same timers by identity, for cancel().
    active: HashMap<u64, Instant>,
    calling_expired: bool,
    /// Timers cancelled while their callback was running this cycle.
    canceling: HashSet<u64>,
}

impl TimerQueue {
    pub(crate) fn new() -> io::Result<TimerQueue> {
        let timer_fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if timer_fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(TimerQueue {
            timer_fd,
            timers: BTreeMap::new(),
            active: HashMap::new(),
            calling_expired: false,
            canceling: HashSet::new(),
        })
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.timer_fd
    }

    pub(crate) fn add(&mut self, timer: Timer) {
        let earliest_changed = self.insert(timer);
        if earliest_changed {
            self.rearm();
        }
    }

    pub(crate) fn cancel(&mut self, id: TimerId) {
        if let Some(when) = self.active.remove(&id.0) {
            let removed = self.timers.remove(&(when, id.0));
            debug_assert!(removed.is_some());
        } else if self.calling_expired {
            // The timer is firing right now: suppress its re-arm.
            self.canceling.insert(id.0);
        }
    }

    pub(crate) fn pending(&self) -> usize {
        debug_assert_eq!(self.timers.len(), self.active.len());
        self.timers.len()
    }

    /// Insert into both views; true when the new timer became the
    /// earliest expiration.
    fn insert(&mut self, timer: Timer) -> bool {
        debug_assert_eq!(self.timers.len(), self.active.len());
        let when = timer.expiration;
        let earliest_changed = self
            .timers
            .keys()
            .next()
            .is_none_or(|&(earliest, _)| when < earliest);
        self.active.insert(timer.sequence, when);
        self.timers.insert((when, timer.sequence), timer);
        earliest_changed
    }

    /// Move every timer with `expiration <= now` out of both views.
    fn take_expired(&mut self, now: Instant) -> Vec<Timer> {
        let rest = self.timers.split_off(&(now, u64::MAX));
        let expired_map = std::mem::replace(&mut self.timers, rest);
        let mut expired = Vec::with_capacity(expired_map.len());
        for ((_, sequence), timer) in expired_map {
            self.active.remove(&sequence);
            expired.push(timer);
        }
        expired
    }

    fn rearm(&self) {
        if let Some(&(when, _)) = self.timers.keys().next() {
            arm_timer_fd(self.timer_fd, when);
        }
    }
}

impl Drop for TimerQueue {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.timer_fd);
        }
    }
}

/// timerfd read handler: run everything that is due, then restart the
/// survivors.
pub(crate) fn handle_expiry(ev: &mut EventLoop) {
    let fd = ev.timers.timer_fd;
    let mut count: u64 = 0;
    let n = unsafe { libc::read(fd, &mut count as *mut u64 as *mut libc::c_void, 8) };
    if n != 8 {
        warn!(bytes = n, "timerfd read returned an unexpected length");
    }

    let now = Instant::now();
    let mut expired = ev.timers.take_expired(now);
    ev.timers.canceling.clear();
    ev.timers.calling_expired = true;
    for timer in &mut expired {
        (timer.callback)(ev);
    }
    ev.timers.calling_expired = false;

    for mut timer in expired {
        if let Some(interval) = timer.interval
            && !ev.timers.canceling.contains(&timer.sequence)
        {
            timer.expiration = now + interval;
            ev.timers.insert(timer);
        }
    }
    ev.timers.canceling.clear();
    if !ev.timers.timers.is_empty() {
        ev.timers.rearm();
    }
}

fn arm_timer_fd(fd: RawFd, when: Instant) {
    // Relative arming with a small floor; zero would disarm the fd.
    let delay = when
        .saturating_duration_since(Instant::now())
        .max(Duration::from_micros(100));
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        },
        it_value: libc::timespec {
            tv_sec: delay.as_secs() as libc::time_t,
            tv_nsec: delay.subsec_nanos() as libc::c_long,
        },
    };
    let ret = unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) };
    if ret < 0 {
        error!(error = %io::Error::last_os_error(), "timerfd_settime failed");
    }
}
