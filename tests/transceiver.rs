//! Loopback integration tests for the transceiver and the socket-pair
//! primitive.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use muscle::transceiver::MESSAGE_ENCODING_DEFAULT;
use muscle::{loopback_socket_pair, socket_pair, Event, Message, Transceiver};
use serial_test::serial;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

fn wait_event(mtt: &Transceiver, timeout: Duration) -> Option<Event> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(event) = mtt.next_event(false) {
            return Some(event);
        }
        if Instant::now() >= deadline {
            return None;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

fn expect_connected(mtt: &Transceiver) {
    match wait_event(mtt, EVENT_TIMEOUT) {
        Some(Event::Connected) => {}
        other => panic!("expected Connected, got {:?}", other),
    }
}

fn chat_message(text: &str) -> Message {
    let mut m = Message::new(666);
    m.put_string("chat", text);
    m.put_int32("seq", [1, 2, 3]);
    m
}

// A wire frame as the transceiver would emit it.
fn frame_bytes(msg: &Message) -> Vec<u8> {
    let body = msg.to_flattened_buffer().unwrap();
    let mut bytes = Vec::with_capacity(8 + body.len());
    bytes.extend_from_slice(&(body.len() as u32).to_le_bytes());
    bytes.extend_from_slice(&MESSAGE_ENCODING_DEFAULT.to_le_bytes());
    bytes.extend_from_slice(&body);
    bytes
}

// Splits a byte stream into complete frames; returns the decoded Messages
// and how many trailing bytes did not form a whole frame.
fn split_frames(mut bytes: &[u8]) -> (Vec<Message>, usize) {
    let mut msgs = Vec::new();
    while bytes.len() >= 8 {
        let size = u32::from_le_bytes(bytes[0..4].try_into().unwrap()) as usize;
        let magic = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(magic, MESSAGE_ENCODING_DEFAULT, "bad frame magic");
        if bytes.len() < 8 + size {
            break;
        }
        let mut m = Message::new(0);
        m.set_from_flattened_buffer(&bytes[8..8 + size]).unwrap();
        msgs.push(m);
        bytes = &bytes[8 + size..];
    }
    (msgs, bytes.len())
}

#[test]
fn test_socket_pair_carries_bytes() {
    let (a, b) = socket_pair(true).unwrap();
    assert_eq!(a.send(b"ping").unwrap(), 4);
    let mut buf = [0u8; 16];
    assert_eq!(b.recv(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"ping");

    // and the other direction
    b.send(b"pong").unwrap();
    assert_eq!(a.recv(&mut buf).unwrap(), 4);
    assert_eq!(&buf[..4], b"pong");
}

#[test]
fn test_loopback_socket_pair_fallback() {
    for prefer_ipv6 in [false, true] {
        let (a, b) = loopback_socket_pair(true, prefer_ipv6).unwrap();
        a.send(b"hello").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(b.recv(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], b"hello");
    }
}

#[test]
#[serial]
fn test_passive_active_loopback() {
    let mut passive = Transceiver::new_passive(0, None, false).unwrap();
    let port = passive.port();
    assert_ne!(port, 0);
    passive.start().unwrap();

    let mut active = Transceiver::new_active("127.0.0.1", port, false).unwrap();
    active.start().unwrap();

    expect_connected(&active);
    expect_connected(&passive);

    // FIFO delivery, content preserved across the wire
    let sent: Vec<Message> = (0..3)
        .map(|i| chat_message(&format!("message {}", i)))
        .collect();
    for msg in &sent {
        active.send(msg.clone()).unwrap();
    }
    for expected in &sent {
        match wait_event(&passive, EVENT_TIMEOUT) {
            Some(Event::Received(got)) => assert_eq!(&got, expected),
            other => panic!("expected Received, got {:?}", other),
        }
    }

    // events were signalled on the notification socket too
    let mut drained = [0u8; 64];
    assert!(passive.notification_socket().recv(&mut drained).unwrap() > 0);

    // the other direction
    passive.send(chat_message("right back at you")).unwrap();
    match wait_event(&active, EVENT_TIMEOUT) {
        Some(Event::Received(got)) => assert_eq!(got.get_string("chat", 0), "right back at you"),
        other => panic!("expected Received, got {:?}", other),
    }

    // closing the active side is a peer disconnect from the passive side
    active.destroy();
    match wait_event(&passive, EVENT_TIMEOUT) {
        Some(Event::Disconnected) => {}
        other => panic!("expected Disconnected, got {:?}", other),
    }
    passive.destroy();
}

#[test]
#[serial]
fn test_shutdown_during_send_leaves_no_partial_frame() {
    let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let mut active = Transceiver::new_active("127.0.0.1", port, false).unwrap();
    active.start().unwrap();
    let sent: Vec<Message> = (0..100)
        .map(|i| chat_message(&format!("burst {}", i)))
        .collect();
    for msg in &sent {
        active.send(msg.clone()).unwrap();
    }
    active.destroy(); // worker drains the queue, then exits at a frame boundary

    let (mut peer, _) = listener.accept().unwrap();
    let mut bytes = Vec::new();
    peer.read_to_end(&mut bytes).unwrap(); // EOF once the worker closed

    let (msgs, leftover) = split_frames(&bytes);
    assert_eq!(leftover, 0, "worker must never cut a frame short");
    assert!(msgs.len() <= 100);
    for (got, expected) in msgs.iter().zip(&sent) {
        assert_eq!(got, expected);
    }
}

#[test]
#[serial]
fn test_partial_reads_byte_at_a_time() {
    let mut passive = Transceiver::new_passive(0, None, false).unwrap();
    let port = passive.port();
    passive.start().unwrap();

    let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    expect_connected(&passive);

    let msg = chat_message("one byte at a time");
    for &byte in &frame_bytes(&msg) {
        peer.write_all(&[byte]).unwrap();
        peer.flush().unwrap();
        thread::sleep(Duration::from_millis(1));
    }
    match wait_event(&passive, EVENT_TIMEOUT) {
        Some(Event::Received(got)) => assert_eq!(got, msg),
        other => panic!("expected Received, got {:?}", other),
    }

    // the same frame in one burst produces the same event
    peer.write_all(&frame_bytes(&msg)).unwrap();
    match wait_event(&passive, EVENT_TIMEOUT) {
        Some(Event::Received(got)) => assert_eq!(got, msg),
        other => panic!("expected Received, got {:?}", other),
    }

    passive.destroy();
}

#[test]
#[serial]
fn test_magic_mismatch_disconnects_once() {
    let mut passive = Transceiver::new_passive(0, None, false).unwrap();
    let port = passive.port();
    passive.start().unwrap();

    let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    expect_connected(&passive);

    let mut header = Vec::new();
    header.extend_from_slice(&12u32.to_le_bytes());
    header.extend_from_slice(&0xBAD0BAD0u32.to_le_bytes());
    peer.write_all(&header).unwrap();

    match wait_event(&passive, EVENT_TIMEOUT) {
        Some(Event::Disconnected) => {}
        other => panic!("expected Disconnected, got {:?}", other),
    }
    // exactly once: no Received, no second Disconnected
    assert_eq!(wait_event(&passive, Duration::from_millis(200)), None);

    passive.destroy();
}

#[test]
#[serial]
fn test_passive_reaccepts_after_disconnect() {
    let mut passive = Transceiver::new_passive(0, None, false).unwrap();
    let port = passive.port();
    passive.start().unwrap();

    let peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    expect_connected(&passive);
    drop(peer); // EOF
    match wait_event(&passive, EVENT_TIMEOUT) {
        Some(Event::Disconnected) => {}
        other => panic!("expected Disconnected, got {:?}", other),
    }

    // same port keeps accepting
    let mut peer = TcpStream::connect(("127.0.0.1", port)).unwrap();
    expect_connected(&passive);
    let msg = chat_message("second life");
    peer.write_all(&frame_bytes(&msg)).unwrap();
    match wait_event(&passive, EVENT_TIMEOUT) {
        Some(Event::Received(got)) => assert_eq!(got, msg),
        other => panic!("expected Received, got {:?}", other),
    }

    passive.destroy();
}

#[test]
#[serial]
fn test_destroy_is_idempotent() {
    let mut passive = Transceiver::new_passive(0, None, false).unwrap();
    passive.start().unwrap();
    passive.destroy();
    passive.destroy();
    assert_eq!(passive.next_event(true), None);
}

#[test]
#[serial]
fn test_active_connect_failure_reports_disconnected() {
    // bind a port and close it again so nothing is listening there
    let port = {
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        listener.local_addr().unwrap().port()
    };
    let mut active = Transceiver::new_active("127.0.0.1", port, false).unwrap();
    active.start().unwrap();
    match wait_event(&active, EVENT_TIMEOUT) {
        Some(Event::Disconnected) => {}
        other => panic!("expected Disconnected, got {:?}", other),
    }
    active.destroy();
}
