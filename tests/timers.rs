//! Timer queue behavior through a running loop.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

use revio::{EventLoopThread, TimerId};

#[test]
fn run_every_fires_on_cadence_until_cancelled() {
    common::init_logging();
    let worker = EventLoopThread::start("cadence", None).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    let id = worker
        .loop_handle()
        .run_every(Duration::from_millis(100), move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });

    thread::sleep(Duration::from_millis(1050));
    let fired = count.load(Ordering::SeqCst);
    assert!((8..=12).contains(&fired), "fired {fired} times");

    worker.loop_handle().cancel(id);
    thread::sleep(Duration::from_millis(150));
    let after_cancel = count.load(Ordering::SeqCst);
    thread::sleep(Duration::from_millis(350));
    assert_eq!(count.load(Ordering::SeqCst), after_cancel);
}

#[test]
fn cancel_from_inside_the_firing_callback_suppresses_rearm() {
    common::init_logging();
    let worker = EventLoopThread::start("self-cancel", None).unwrap();
    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    let id_cell: Arc<OnceLock<TimerId>> = Arc::new(OnceLock::new());
    let id_cell2 = id_cell.clone();
    let id = worker
        .loop_handle()
        .run_every(Duration::from_millis(50), move |ev| {
            let n = count2.fetch_add(1, Ordering::SeqCst) + 1;
            if n == 5 {
                // Cancelling mid-fire: this callback completes, but the
                // repeating timer must not be re-armed.
                ev.cancel(*id_cell2.get().unwrap());
            }
        });
    id_cell.set(id).unwrap();

    thread::sleep(Duration::from_millis(800));
    assert_eq!(count.load(Ordering::SeqCst), 5);
}

#[test]
fn one_shot_timers_fire_in_expiration_order() {
    common::init_logging();
    let worker = EventLoopThread::start("ordering", None).unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));
    let start = Instant::now();
    // Scheduled shortest-last on purpose.
    for (label, delay_ms) in [(3u32, 150u64), (2, 100), (1, 50)] {
        let order = order.clone();
        worker
            .loop_handle()
            .run_at(start + Duration::from_millis(delay_ms), move |_| {
                order.lock().unwrap().push(label);
            });
    }
    thread::sleep(Duration::from_millis(400));
    assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
}

#[test]
fn run_after_cancel_before_fire() {
    common::init_logging();
    let worker = EventLoopThread::start("cancel-early", None).unwrap();
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = fired.clone();
    let id = worker
        .loop_handle()
        .run_after(Duration::from_millis(200), move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        });
    worker.loop_handle().cancel(id);
    thread::sleep(Duration::from_millis(400));
    assert_eq!(fired.load(Ordering::SeqCst), 0);
}
