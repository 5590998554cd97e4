//! One-loop-per-thread workers and the round-robin pool that hands
//! connections out to them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use tracing::debug;

use crate::error::Error;
use crate::event_loop::{EventLoop, LoopHandle};

/// Runs once inside each freshly-started I/O thread, before the loop.
pub type ThreadInitCallback = Box<dyn FnOnce(&mut EventLoop) + Send>;

/// A thread running a single event loop.
///
/// Dropping quits the loop and joins the thread.
pub struct EventLoopThread {
    handle: LoopHandle,
    join: Option<thread::JoinHandle<()>>,
}

impl EventLoopThread {
    /// Spawn a named thread, construct a loop inside it, run `init`, and
    /// hand the loop handle back once the loop is about to enter `run`.
    pub fn start(name: &str, init: Option<ThreadInitCallback>) -> Result<EventLoopThread, Error> {
        let (tx, rx) = crossbeam_channel::bounded(1);
        let join = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let mut ev = match EventLoop::new() {
                    Ok(ev) => ev,
                    // Loop fds are a startup requirement; nothing to
                    // degrade to.
                    Err(e) => panic!("event loop creation failed: {e}"),
                };
                if let Some(init) = init {
                    init(&mut ev);
                }
                tx.send(ev.handle()).expect("parent gone before loop start");
                ev.run();
                debug!("event loop thread exiting");
            })
            .map_err(Error::Io)?;
        let handle = rx.recv().map_err(|_| {
            Error::ThreadSpawn(format!("worker {name} exited before reporting its loop"))
        })?;
        Ok(EventLoopThread {
            handle,
            join: Some(join),
        })
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.handle
    }
}

impl Drop for EventLoopThread {
    fn drop(&mut self) {
        self.handle.quit();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// N event-loop threads plus round-robin assignment. With zero threads
/// everything runs on the base loop.
pub struct EventLoopThreadPool {
    base: LoopHandle,
    name: String,
    num_threads: usize,
    threads: Vec<EventLoopThread>,
    handles: Vec<LoopHandle>,
    next: AtomicUsize,
    started: bool,
}

impl EventLoopThreadPool {
    pub fn new(base: LoopHandle, name: &str) -> EventLoopThreadPool {
        EventLoopThreadPool {
            base,
            name: name.to_string(),
            num_threads: 0,
            threads: Vec::new(),
            handles: Vec::new(),
            next: AtomicUsize::new(0),
            started: false,
        }
    }

    /// Must be called before `start`.
    pub fn set_thread_num(&mut self, num_threads: usize) {
        assert!(!self.started);
        self.num_threads = num_threads;
    }

    pub fn start(
        &mut self,
        init: Option<Arc<dyn Fn(&mut EventLoop) + Send + Sync>>,
    ) -> Result<(), Error> {
        assert!(!self.started, "pool already started");
        self.started = true;
        for i in 0..self.num_threads {
            let name = format!("{}-io-{}", self.name, i);
            let init_cb: Option<ThreadInitCallback> = init
                .clone()
                .map(|f| Box::new(move |ev: &mut EventLoop| f(ev)) as ThreadInitCallback);
            let thread = EventLoopThread::start(&name, init_cb)?;
            self.handles.push(thread.loop_handle().clone());
            self.threads.push(thread);
        }
        if self.num_threads == 0
            && let Some(f) = init
        {
            self.base.run_in_loop(move |ev| f(ev));
        }
        Ok(())
    }

    pub fn started(&self) -> bool {
        self.started
    }

    /// Round-robin pick; the base loop when the pool is empty.
    pub fn get_next_loop(&self) -> LoopHandle {
        if self.handles.is_empty() {
            return self.base.clone();
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
        self.handles[i].clone()
    }

    /// Deterministic pick for session pinning.
    pub fn get_loop_for_hash(&self, hash: u64) -> LoopHandle {
        if self.handles.is_empty() {
            return self.base.clone();
        }
        self.handles[hash as usize % self.handles.len()].clone()
    }

    pub fn all_loops(&self) -> Vec<LoopHandle> {
        if self.handles.is_empty() {
            vec![self.base.clone()]
        } else {
            self.handles.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn start_loop_returns_usable_handle() {
        let thread = EventLoopThread::start("test-loop", None).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let (tx, rx) = crossbeam_channel::bounded(1);
        thread.loop_handle().run_in_loop(move |_| {
            ran2.store(true, Ordering::SeqCst);
            tx.send(()).unwrap();
        });
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn init_callback_runs_before_loop() {
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        let thread =
            EventLoopThread::start("init-loop", Some(Box::new(move |_| ran2.store(true, Ordering::SeqCst))))
                .unwrap();
        // start() only returns after init ran.
        assert!(ran.load(Ordering::SeqCst));
        drop(thread);
    }

    #[test]
    fn pool_round_robin_covers_all_loops() {
        let base_thread = EventLoopThread::start("pool-base", None).unwrap();
        let mut pool = EventLoopThreadPool::new(base_thread.loop_handle().clone(), "pool");
        pool.set_thread_num(3);
        pool.start(None).unwrap();
        let picks: Vec<LoopHandle> = (0..6).map(|_| pool.get_next_loop()).collect();
        // Rotation repeats with period N, and consecutive picks differ.
        for i in 0..3 {
            assert!(picks[i].same_loop(&picks[i + 3]));
            assert!(!picks[i].same_loop(&picks[(i + 1) % 3]));
        }
        assert_eq!(pool.all_loops().len(), 3);
        assert!(pool.get_loop_for_hash(7).same_loop(&pool.get_loop_for_hash(7)));
    }

    #[test]
    fn empty_pool_hands_out_base_loop() {
        let base_thread = EventLoopThread::start("empty-pool-base", None).unwrap();
        let mut pool = EventLoopThreadPool::new(base_thread.loop_handle().clone(), "empty");
        pool.start(None).unwrap();
        let handle = pool.get_next_loop();
        let (tx, rx) = crossbeam_channel::bounded(1);
        handle.run_in_loop(move |_| tx.send(()).unwrap());
        rx.recv_timeout(std::time::Duration::from_secs(5)).unwrap();
    }
}
