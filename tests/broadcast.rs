//! Length-prefixed chat broadcast over the server facade, including
//! oversize-frame rejection.

mod common;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::unbounded;
use revio::{Conn, EventLoopThread, TcpClient, TcpServer};

/// Frames longer than this are treated as hostile and the connection is
/// dropped without dispatching.
const MAX_FRAME: usize = 65536;

fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out
}

struct Chat {
    peers: Mutex<HashMap<String, Conn>>,
}

impl Chat {
    fn broadcast(&self, wire: &[u8]) {
        for peer in self.peers.lock().unwrap().values() {
            peer.send(wire);
        }
    }
}

#[test]
fn framed_broadcast_reaches_every_client_and_rejects_oversize() {
    common::init_logging();
    let base = EventLoopThread::start("chat-base", None).unwrap();
    let mut server = TcpServer::new(
        base.loop_handle().clone(),
        "127.0.0.1:0".parse().unwrap(),
        "chat",
    )
    .unwrap();
    server.set_thread_num(2);

    let chat = Arc::new(Chat {
        peers: Mutex::new(HashMap::new()),
    });
    let (joined_tx, joined_rx) = unbounded();
    let conn_chat = chat.clone();
    server.set_connection_callback(move |conn| {
        let mut peers = conn_chat.peers.lock().unwrap();
        if conn.connected() {
            peers.insert(conn.name().to_string(), conn.clone());
        } else {
            peers.remove(conn.name());
        }
        let _ = joined_tx.send(peers.len());
    });
    let msg_chat = chat.clone();
    server.set_message_callback(move |conn, buffer, _when| {
        while buffer.readable_bytes() >= 4 {
            // Byte-level big-endian decode; never a pointer cast.
            let declared = buffer.peek_u32() as usize;
            if declared > MAX_FRAME {
                conn.force_close();
                return;
            }
            if buffer.readable_bytes() < 4 + declared {
                break;
            }
            let wire = buffer.retrieve_as_bytes(4 + declared);
            msg_chat.broadcast(&wire);
        }
    });
    server.start().unwrap();
    let addr = server.local_addr();

    // Three clients; each records every byte it receives.
    let mut clients = Vec::new();
    for i in 0..3 {
        let client_loop = EventLoopThread::start(&format!("chat-client-{i}"), None).unwrap();
        let mut client =
            TcpClient::new(client_loop.loop_handle().clone(), addr, &format!("chat-{i}"));
        let (up_tx, up_rx) = unbounded();
        let (bytes_tx, bytes_rx) = unbounded();
        client.set_connection_callback(move |conn| {
            let _ = up_tx.send(conn.connected());
        });
        client.set_message_callback(move |_conn, buffer, _when| {
            let _ = bytes_tx.send(buffer.retrieve_all_as_bytes());
        });
        client.connect();
        assert!(up_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        clients.push((client, client_loop, up_rx, bytes_rx));
    }

    // Wait until the server-side registry holds all three.
    let mut seen = 0;
    while seen < 3 {
        seen = joined_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    // Client A speaks; everyone (A included) hears exactly the framed
    // message.
    let hello = frame(b"hello");
    assert_eq!(hello.len(), 9);
    clients[0].0.connection().unwrap().send(&hello);
    for (_, _, _, bytes_rx) in &clients {
        let mut got = Vec::new();
        while got.len() < hello.len() {
            got.extend(bytes_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        assert_eq!(got, hello);
    }

    // A frame declaring 65537 bytes closes the sender without any
    // broadcast.
    let mut oversize_header = Vec::new();
    oversize_header.extend_from_slice(&65537u32.to_be_bytes());
    clients[0].0.connection().unwrap().send(&oversize_header);
    assert!(
        !clients[0].2.recv_timeout(Duration::from_secs(5)).unwrap(),
        "offending client should observe the down transition"
    );
    thread::sleep(Duration::from_millis(200));
    assert!(
        clients[1].3.try_recv().is_err(),
        "no broadcast may result from a rejected frame"
    );
    assert!(clients[2].3.try_recv().is_err());
}
