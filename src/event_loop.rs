//! The single-threaded reactor.
//!
//! An `EventLoop` owns one demultiplexer, the channels registered with
//! it, and the arenas for the components driven by those channels
//! (connections, acceptors, connectors) plus the timer queue. At most
//! one loop may exist per thread, and all of its methods must run on
//! the thread that created it; the clonable [`LoopHandle`] is the only
//! cross-thread surface. Work from other threads arrives as boxed tasks
//! executed FIFO between poll cycles, with an eventfd to break the loop
//! out of a blocked wait.

use std::cell::Cell;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use slab::Slab;
use tracing::{trace, warn};

use crate::acceptor::{self, Acceptor};
use crate::channel::{Channel, ChannelId, ChannelOwner, READ_EVENT, WRITE_EVENT, mask_to_string};
use crate::connection::{self, TcpConnection};
use crate::connector::{self, Connector};
use crate::error::Error;
use crate::poller::{Backend, Poller};
use crate::timer::{self, Timer, TimerId, TimerQueue};

/// Upper bound on one kernel wait; timers and wakeups end it early.
const POLL_TIMEOUT_MS: i32 = 10_000;

/// A unit of work marshalled onto a loop's thread.
pub type Task = Box<dyn FnOnce(&mut EventLoop) + Send>;

thread_local! {
    static LOOP_ON_THREAD: Cell<bool> = const { Cell::new(false) };
}

pub(crate) struct LoopShared {
    thread_id: ThreadId,
    pending: Mutex<Vec<Task>>,
    wakeup_fd: RawFd,
    quit: AtomicBool,
    calling_pending: AtomicBool,
}

/// Clonable, thread-safe surface of an [`EventLoop`].
///
/// Everything here marshals onto the owning loop; nothing blocks on I/O.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Whether two handles refer to the same loop.
    pub fn same_loop(&self, other: &LoopHandle) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Run `task` on the loop. A handle cannot execute in place even
    /// from the loop thread (that fast path is
    /// [`EventLoop::run_in_loop`]); tasks queued from inside a callback
    /// still run before the current iteration ends.
    pub fn run_in_loop(&self, task: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.queue_in_loop(task);
    }

    /// Enqueue `task`; wakes the loop when called off-thread or while
    /// the loop is draining its task queue (a task queued by another
    /// task would otherwise sit through a full poll timeout).
    pub fn queue_in_loop(&self, task: impl FnOnce(&mut EventLoop) + Send + 'static) {
        {
            let mut pending = self.shared.pending.lock().unwrap();
            pending.push(Box::new(task));
        }
        if !self.is_in_loop_thread() || self.shared.calling_pending.load(Ordering::Acquire) {
            self.wakeup();
        }
    }

    /// Stop the loop after its current iteration.
    pub fn quit(&self) {
        self.shared.quit.store(true, Ordering::Release);
        if !self.is_in_loop_thread() {
            self.wakeup();
        }
    }

    pub fn run_at(
        &self,
        when: Instant,
        callback: impl FnMut(&mut EventLoop) + Send + 'static,
    ) -> TimerId {
        self.schedule(when, None, Box::new(callback))
    }

    pub fn run_after(
        &self,
        delay: Duration,
        callback: impl FnMut(&mut EventLoop) + Send + 'static,
    ) -> TimerId {
        self.schedule(Instant::now() + delay, None, Box::new(callback))
    }

    pub fn run_every(
        &self,
        interval: Duration,
        callback: impl FnMut(&mut EventLoop) + Send + 'static,
    ) -> TimerId {
        self.schedule(Instant::now() + interval, Some(interval), Box::new(callback))
    }

    /// Best-effort cancel; see [`TimerId`].
    pub fn cancel(&self, id: TimerId) {
        self.queue_in_loop(move |ev| ev.cancel(id));
    }

    fn schedule(
        &self,
        when: Instant,
        interval: Option<Duration>,
        callback: Box<dyn FnMut(&mut EventLoop) + Send>,
    ) -> TimerId {
        let id = TimerId(timer::next_sequence());
        self.queue_in_loop(move |ev| {
            ev.add_timer(Timer {
                callback,
                expiration: when,
                interval,
                sequence: id.0,
            });
        });
        id
    }

    pub(crate) fn wakeup(&self) {
        let one: u64 = 1;
        let n = unsafe {
            libc::write(
                self.shared.wakeup_fd,
                &one as *const u64 as *const libc::c_void,
                8,
            )
        };
        if n != 8 {
            warn!(bytes = n, "wakeup write was short");
        }
    }
}

pub struct EventLoop {
    shared: Arc<LoopShared>,
    poller: Box<dyn Poller>,
    pub(crate) channels: Slab<Channel>,
    /// Scratch list of ready channels, cleared each iteration.
    active: Vec<ChannelId>,
    pub(crate) timers: TimerQueue,
    pub(crate) conns: Slab<TcpConnection>,
    pub(crate) acceptors: Slab<Acceptor>,
    pub(crate) connectors: Slab<Connector>,
    /// Mints generations for connections and connector tokens.
    pub(crate) next_generation: u64,
    wakeup_channel: ChannelId,
    timer_channel: ChannelId,
    looping: bool,
    event_handling: bool,
    /// The channel currently being dispatched, for diagnostics.
    pub(crate) current_channel: Option<ChannelId>,
}

impl EventLoop {
    /// Create a loop on the current thread with the environment-selected
    /// backend.
    pub fn new() -> Result<EventLoop, Error> {
        EventLoop::with_backend(Backend::from_env())
    }

    pub fn with_backend(backend: Backend) -> Result<EventLoop, Error> {
        LOOP_ON_THREAD.with(|flag| {
            assert!(!flag.get(), "another EventLoop already exists on this thread");
        });
        let poller = backend.create()?;
        let timers = TimerQueue::new()?;
        let wakeup_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wakeup_fd < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let mut ev = EventLoop {
            shared: Arc::new(LoopShared {
                thread_id: thread::current().id(),
                pending: Mutex::new(Vec::new()),
                wakeup_fd,
                quit: AtomicBool::new(false),
                calling_pending: AtomicBool::new(false),
            }),
            poller,
            channels: Slab::new(),
            active: Vec::with_capacity(16),
            timers,
            conns: Slab::new(),
            acceptors: Slab::new(),
            connectors: Slab::new(),
            next_generation: 1,
            wakeup_channel: 0,
            timer_channel: 0,
            looping: false,
            event_handling: false,
            current_channel: None,
        };
        ev.wakeup_channel = ev.add_channel(wakeup_fd, ChannelOwner::Wakeup);
        ev.enable_reading(ev.wakeup_channel);
        let timer_fd = ev.timers.fd();
        ev.timer_channel = ev.add_channel(timer_fd, ChannelOwner::TimerFd);
        ev.enable_reading(ev.timer_channel);
        LOOP_ON_THREAD.with(|flag| flag.set(true));
        Ok(ev)
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            shared: self.shared.clone(),
        }
    }

    pub fn is_in_loop_thread(&self) -> bool {
        thread::current().id() == self.shared.thread_id
    }

    /// Fatal on violation: tolerating a wrong-thread call would corrupt
    /// loop state silently.
    pub fn assert_in_loop_thread(&self) {
        if !self.is_in_loop_thread() {
            panic!(
                "EventLoop owned by thread {:?} was accessed from thread {:?}",
                self.shared.thread_id,
                thread::current().id()
            );
        }
    }

    /// Run until [`quit`](EventLoop::quit). Must be called from the
    /// thread that created the loop.
    pub fn run(&mut self) {
        self.assert_in_loop_thread();
        assert!(!self.looping, "EventLoop::run called re-entrantly");
        self.looping = true;
        self.shared.quit.store(false, Ordering::Release);
        trace!("event loop starting");

        // Tasks queued before run() (from this thread, so without a
        // wakeup) must not wait out the first poll.
        self.drain_pending();

        while !self.shared.quit.load(Ordering::Acquire) {
            self.active.clear();
            let poll_time = self
                .poller
                .poll(POLL_TIMEOUT_MS, &mut self.channels, &mut self.active);

            self.event_handling = true;
            let active = std::mem::take(&mut self.active);
            for &id in &active {
                self.current_channel = Some(id);
                dispatch(self, id, poll_time);
            }
            self.current_channel = None;
            self.active = active;
            self.event_handling = false;

            self.drain_pending();
        }

        trace!("event loop stopping");
        self.looping = false;
    }

    /// Stop after the current iteration.
    pub fn quit(&self) {
        self.handle().quit();
    }

    /// Execute immediately; the loop is only reachable from its own
    /// thread, so there is nothing to marshal.
    pub fn run_in_loop(&mut self, task: impl FnOnce(&mut EventLoop)) {
        self.assert_in_loop_thread();
        task(self);
    }

    pub fn queue_in_loop(&self, task: impl FnOnce(&mut EventLoop) + Send + 'static) {
        self.handle().queue_in_loop(task);
    }

    pub fn run_at(
        &mut self,
        when: Instant,
        callback: impl FnMut(&mut EventLoop) + Send + 'static,
    ) -> TimerId {
        self.schedule(when, None, Box::new(callback))
    }

    pub fn run_after(
        &mut self,
        delay: Duration,
        callback: impl FnMut(&mut EventLoop) + Send + 'static,
    ) -> TimerId {
        self.schedule(Instant::now() + delay, None, Box::new(callback))
    }

    pub fn run_every(
        &mut self,
        interval: Duration,
        callback: impl FnMut(&mut EventLoop) + Send + 'static,
    ) -> TimerId {
        self.schedule(Instant::now() + interval, Some(interval), Box::new(callback))
    }

    pub fn cancel(&mut self, id: TimerId) {
        self.assert_in_loop_thread();
        self.timers.cancel(id);
    }

    fn schedule(
        &mut self,
        when: Instant,
        interval: Option<Duration>,
        callback: Box<dyn FnMut(&mut EventLoop) + Send>,
    ) -> TimerId {
        self.assert_in_loop_thread();
        let id = TimerId(timer::next_sequence());
        self.add_timer(Timer {
            callback,
            expiration: when,
            interval,
            sequence: id.0,
        });
        id
    }

    pub(crate) fn add_timer(&mut self, timer: Timer) {
        self.timers.add(timer);
    }

    /// Number of timers not yet fired.
    pub fn pending_timers(&self) -> usize {
        self.timers.pending()
    }

    pub(crate) fn add_channel(&mut self, fd: RawFd, owner: ChannelOwner) -> ChannelId {
        self.channels.insert(Channel::new(fd, owner))
    }

    pub(crate) fn update_channel(&mut self, id: ChannelId) {
        self.assert_in_loop_thread();
        self.poller.update_channel(id, &mut self.channels);
    }

    /// Unregister and drop a channel. Interest must already be cleared.
    pub(crate) fn remove_channel(&mut self, id: ChannelId) {
        self.assert_in_loop_thread();
        debug_assert!(self.has_channel(id));
        self.poller.remove_channel(id, &mut self.channels);
        self.channels.remove(id);
    }

    pub(crate) fn has_channel(&self, id: ChannelId) -> bool {
        self.channels.contains(id)
    }

    pub(crate) fn enable_reading(&mut self, id: ChannelId) {
        self.channels[id].add_interest(READ_EVENT);
        self.update_channel(id);
    }

    pub(crate) fn disable_reading(&mut self, id: ChannelId) {
        self.channels[id].remove_interest(READ_EVENT);
        self.update_channel(id);
    }

    pub(crate) fn enable_writing(&mut self, id: ChannelId) {
        self.channels[id].add_interest(WRITE_EVENT);
        self.update_channel(id);
    }

    pub(crate) fn disable_writing(&mut self, id: ChannelId) {
        self.channels[id].remove_interest(WRITE_EVENT);
        self.update_channel(id);
    }

    pub(crate) fn disable_all(&mut self, id: ChannelId) {
        self.channels[id].clear_interest();
        self.update_channel(id);
    }

    /// Swap the queue out under the mutex, then run the tasks without
    /// holding it; tasks may requeue themselves safely.
    fn drain_pending(&mut self) {
        let tasks: Vec<Task> = std::mem::take(&mut *self.shared.pending.lock().unwrap());
        if tasks.is_empty() {
            return;
        }
        self.shared.calling_pending.store(true, Ordering::Release);
        for task in tasks {
            task(self);
        }
        self.shared.calling_pending.store(false, Ordering::Release);
    }

    fn handle_wakeup_read(&mut self) {
        let mut buf: u64 = 0;
        let n = unsafe {
            libc::read(
                self.shared.wakeup_fd,
                &mut buf as *mut u64 as *mut libc::c_void,
                8,
            )
        };
        if n != 8 {
            warn!(bytes = n, "wakeup read was short");
        }
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        assert!(!self.looping, "EventLoop dropped while running");
        assert!(
            !self.event_handling && self.current_channel.is_none(),
            "EventLoop dropped during dispatch"
        );
        self.disable_all(self.wakeup_channel);
        self.remove_channel(self.wakeup_channel);
        self.disable_all(self.timer_channel);
        self.remove_channel(self.timer_channel);
        unsafe {
            libc::close(self.shared.wakeup_fd);
        }
        LOOP_ON_THREAD.with(|flag| flag.set(false));
    }
}

/// Route one ready channel to its owner. A channel removed earlier in
/// this batch (or a slot reused by a brand-new channel, whose ready mask
/// is still empty) falls through harmlessly.
fn dispatch(ev: &mut EventLoop, id: ChannelId, poll_time: Instant) {
    let Some(ch) = ev.channels.get(id) else {
        return;
    };
    let revents = ch.revents();
    let owner = ch.owner();
    trace!(fd = ch.fd(), revents = %mask_to_string(revents), "dispatching");
    match owner {
        ChannelOwner::Wakeup => {
            if revents & READ_EVENT != 0 {
                ev.handle_wakeup_read();
            }
        }
        ChannelOwner::TimerFd => {
            if revents & READ_EVENT != 0 {
                timer::handle_expiry(ev);
            }
        }
        ChannelOwner::Acceptor(aid) => {
            if revents & READ_EVENT != 0 {
                acceptor::handle_read(ev, aid);
            }
        }
        ChannelOwner::Connection(cid) => {
            connection::handle_event(ev, cid, revents, poll_time);
        }
        ChannelOwner::Connector(kid) => {
            connector::handle_event(ev, kid, revents);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn run_in_loop_executes_immediately() {
        let mut ev = EventLoop::new().unwrap();
        let mut ran = false;
        ev.run_in_loop(|_| ran = true);
        assert!(ran);
    }

    #[test]
    fn queued_tasks_run_fifo_before_quit() {
        let mut ev = EventLoop::new().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            ev.queue_in_loop(move |_| order.lock().unwrap().push(i));
        }
        let handle = ev.handle();
        ev.queue_in_loop(move |_| handle.quit());
        ev.run();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn cross_thread_wakeup_runs_task() {
        let mut ev = EventLoop::new().unwrap();
        let handle = ev.handle();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let t = thread::spawn(move || {
            handle.queue_in_loop(move |ev| {
                hits2.fetch_add(1, Ordering::SeqCst);
                ev.quit();
            });
        });
        ev.run();
        t.join().unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timer_fires_and_one_shot_is_removed() {
        let mut ev = EventLoop::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        ev.run_after(Duration::from_millis(20), move |ev| {
            fired2.fetch_add(1, Ordering::SeqCst);
            ev.quit();
        });
        assert_eq!(ev.pending_timers(), 1);
        ev.run();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(ev.pending_timers(), 0);
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut ev = EventLoop::new().unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let id = ev.run_after(Duration::from_millis(20), move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
        ev.cancel(id);
        ev.run_after(Duration::from_millis(60), |ev| ev.quit());
        ev.run();
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    #[should_panic(expected = "another EventLoop")]
    fn one_loop_per_thread() {
        let _a = EventLoop::new().unwrap();
        let _b = EventLoop::new();
    }
}
