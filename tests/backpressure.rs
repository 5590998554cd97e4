//! Large send, high-water signalling, and drained shutdown.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;
use revio::{EventLoopThread, TcpClient, TcpServer};

const PAYLOAD_LEN: usize = 32 * 1024 * 1024;
const HIGH_WATER: usize = 1024 * 1024;

#[test]
fn high_water_fires_once_then_write_complete_then_shutdown() {
    common::init_logging();
    let payload: Arc<Vec<u8>> = Arc::new((0..PAYLOAD_LEN).map(|i| (i % 251) as u8).collect());

    let base = EventLoopThread::start("bp-base", None).unwrap();
    let mut server = TcpServer::new(
        base.loop_handle().clone(),
        "127.0.0.1:0".parse().unwrap(),
        "blast",
    )
    .unwrap();
    server.set_thread_num(1);

    let (hw_tx, hw_rx) = unbounded();
    server.set_high_water_mark_callback(
        move |_conn, queued| {
            let _ = hw_tx.send(queued);
        },
        HIGH_WATER,
    );
    let (wc_tx, wc_rx) = unbounded();
    server.set_write_complete_callback(move |conn| {
        let _ = wc_tx.send(());
        // Buffer-drained order: shut down only after everything left
        // the output buffer.
        conn.shutdown();
    });
    let send_payload = payload.clone();
    server.set_connection_callback(move |conn| {
        if conn.connected() {
            conn.send(&send_payload);
        }
    });
    server.start().unwrap();
    let addr = server.local_addr();

    let client_loop = EventLoopThread::start("bp-client", None).unwrap();
    let mut client = TcpClient::new(client_loop.loop_handle().clone(), addr, "bp-client");
    let received = Arc::new(AtomicUsize::new(0));
    let received2 = received.clone();
    let (down_tx, down_rx) = unbounded();
    client.set_message_callback(move |_conn, buffer, _when| {
        received2.fetch_add(buffer.readable_bytes(), Ordering::SeqCst);
        buffer.retrieve_all();
    });
    client.set_connection_callback(move |conn| {
        if !conn.connected() {
            let _ = down_tx.send(());
        }
    });
    client.connect();

    // High-water fires with at least the threshold queued.
    let queued = hw_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    assert!(queued >= HIGH_WATER, "high-water reported {queued} bytes");

    // Write-complete fires exactly once, after the full payload left
    // the buffer.
    wc_rx.recv_timeout(Duration::from_secs(30)).unwrap();

    // The shutdown from the write-complete callback reaches the client
    // as EOF once everything was delivered.
    down_rx.recv_timeout(Duration::from_secs(30)).unwrap();
    assert_eq!(received.load(Ordering::SeqCst), PAYLOAD_LEN);

    thread::sleep(Duration::from_millis(100));
    assert!(hw_rx.try_recv().is_err(), "high-water fired more than once");
    assert!(wc_rx.try_recv().is_err(), "write-complete fired more than once");
}
