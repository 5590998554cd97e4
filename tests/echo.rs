//! End-to-end echo: a pooled server, one client, ordered delivery.

mod common;

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;
use revio::{EventLoopThread, TcpClient, TcpServer};

#[test]
fn echo_round_trip_with_io_pool() {
    common::init_logging();
    let base = EventLoopThread::start("echo-base", None).unwrap();
    let mut server = TcpServer::new(
        base.loop_handle().clone(),
        "127.0.0.1:0".parse().unwrap(),
        "echo",
    )
    .unwrap();
    server.set_thread_num(4);
    server.set_message_callback(|conn, buffer, _when| {
        let data = buffer.retrieve_all_as_bytes();
        conn.send(&data);
    });
    server.start().unwrap();
    let addr = server.local_addr();

    let client_loop = EventLoopThread::start("echo-client", None).unwrap();
    let mut client = TcpClient::new(client_loop.loop_handle().clone(), addr, "echo-client");
    let (up_tx, up_rx) = unbounded();
    let (msg_tx, msg_rx) = unbounded();
    let (wc_tx, wc_rx) = unbounded();
    client.set_connection_callback(move |conn| {
        up_tx.send(conn.connected()).unwrap();
    });
    client.set_message_callback(move |_conn, buffer, _when| {
        if buffer.readable_bytes() >= 5 {
            msg_tx.send(buffer.retrieve_all_as_bytes()).unwrap();
        }
    });
    client.set_write_complete_callback(move |_conn| {
        let _ = wc_tx.send(());
    });
    client.connect();

    assert!(up_rx.recv_timeout(Duration::from_secs(5)).unwrap());
    let conn = client.connection().unwrap();
    conn.send(b"hello");

    let echoed = msg_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert_eq!(echoed, b"hello");

    // Write-complete fired exactly once for the single send.
    wc_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert!(wc_rx.try_recv().is_err());

    // Disconnect: the server observes EOF, tears down, and the client
    // sees the down transition.
    conn.shutdown();
    assert!(!up_rx.recv_timeout(Duration::from_secs(5)).unwrap());
}

#[test]
fn cross_thread_sends_arrive_in_order() {
    common::init_logging();
    const SENDS: usize = 1000;

    let base = EventLoopThread::start("order-base", None).unwrap();
    let mut server = TcpServer::new(
        base.loop_handle().clone(),
        "127.0.0.1:0".parse().unwrap(),
        "order",
    )
    .unwrap();
    server.set_thread_num(2);
    let received = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = unbounded();
    let received2 = received.clone();
    server.set_message_callback(move |_conn, buffer, _when| {
        let mut received = received2.lock().unwrap();
        received.extend_from_slice(&buffer.retrieve_all_as_bytes());
        if received.len() >= SENDS * 4 {
            let _ = done_tx.send(());
        }
    });
    server.start().unwrap();
    let addr = server.local_addr();

    let client_loop = EventLoopThread::start("order-client", None).unwrap();
    let mut client = TcpClient::new(client_loop.loop_handle().clone(), addr, "order-client");
    let (up_tx, up_rx) = unbounded();
    client.set_connection_callback(move |conn| {
        if conn.connected() {
            let _ = up_tx.send(conn.clone());
        }
    });
    client.connect();

    let conn = up_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    // A plain thread, not an I/O thread: every send marshals onto the
    // connection's loop.
    let sender = thread::spawn(move || {
        for i in 0..SENDS {
            let payload = format!("{i:04}");
            conn.send(payload.as_bytes());
        }
    });
    sender.join().unwrap();

    done_rx.recv_timeout(Duration::from_secs(10)).unwrap();
    let received = received.lock().unwrap();
    let expected: Vec<u8> = (0..SENDS).flat_map(|i| format!("{i:04}").into_bytes()).collect();
    assert_eq!(*received, expected);
}
