//! Shared-memory sink producer/consumer handoff tests.

use std::sync::atomic::{AtomicU32, Ordering};

use vstream::frame::{self, Frame};
use vstream::sink::{GetResult, Memsink, PutResult};

static SINK_SEQ: AtomicU32 = AtomicU32::new(0);

fn unique_name() -> String {
    format!(
        "vstream-test-{}-{}",
        std::process::id(),
        SINK_SEQ.fetch_add(1, Ordering::SeqCst)
    )
}

fn jpeg_frame(tag: u8, size: usize) -> Frame {
    let mut payload = vec![tag; size];
    payload[0] = 0xFF;
    payload[1] = 0xD8;
    let mut frame = Frame::new();
    frame.set_data(&payload);
    frame.width = 320;
    frame.height = 240;
    frame.format = frame::FOURCC_JPEG;
    frame.stride = 0;
    frame.online = true;
    frame.grab_ts = tag as f64;
    frame
}

#[test]
fn test_producer_consumer_roundtrip() {
    let name = unique_name();
    let mut server = Memsink::server(&name, 0o600, true, 10.0).unwrap();
    let mut client = Memsink::client(&name, 0.5).unwrap();

    // Nothing published yet.
    let mut out = Frame::new();
    assert_eq!(client.client_get(&mut out).unwrap(), GetResult::NoUpdate);
    // The first read stamped the client TTL, so the producer now cares.
    assert!(server.has_recent_clients());

    let sent = jpeg_frame(3, 4096);
    assert_eq!(server.server_put(&sent).unwrap(), PutResult::Put);

    assert_eq!(client.client_get(&mut out).unwrap(), GetResult::Frame);
    assert_eq!(out.data(), sent.data());
    assert_eq!(out.width, 320);
    assert_eq!(out.height, 240);
    assert_eq!(out.format, frame::FOURCC_JPEG);
    assert!(out.online);
    assert_eq!(out.grab_ts, sent.grab_ts);

    // Same id again: no update.
    assert_eq!(client.client_get(&mut out).unwrap(), GetResult::NoUpdate);
}

#[test]
fn test_consumer_sees_monotonic_updates() {
    let name = unique_name();
    let mut server = Memsink::server(&name, 0o600, true, 10.0).unwrap();
    let mut client = Memsink::client(&name, 0.5).unwrap();

    let mut out = Frame::new();
    let _ = client.client_get(&mut out); // Mark the client alive

    let mut seen = Vec::new();
    for tag in 1..=5u8 {
        let sent = jpeg_frame(tag, 2048);
        assert_eq!(server.server_put(&sent).unwrap(), PutResult::Put);
        if client.client_get(&mut out).unwrap() == GetResult::Frame {
            // Payload and metadata always belong to the same frame.
            assert_eq!(out.data()[2], tag);
            assert_eq!(out.grab_ts, tag as f64);
            seen.push(tag);
        }
    }
    assert!(!seen.is_empty());
    assert!(seen.windows(2).all(|w| w[0] < w[1]), "updates went backwards");
}

#[test]
fn test_server_check_requires_recent_client() {
    let name = unique_name();
    let server = Memsink::server(&name, 0o600, true, 10.0).unwrap();
    let frame = jpeg_frame(1, 512);

    // Nobody ever read: not worth encoding.
    assert!(!server.server_check(&frame));

    let mut client = Memsink::client(&name, 0.1).unwrap();
    let mut out = Frame::new();
    let _ = client.client_get(&mut out);
    assert!(server.server_check(&frame));

    // An empty frame is never worth publishing.
    assert!(!server.server_check(&Frame::new()));
}

#[test]
fn test_key_request_flag() {
    let name = unique_name();
    let server = Memsink::server(&name, 0o600, true, 10.0).unwrap();
    let client = Memsink::client(&name, 0.1).unwrap();

    assert!(!server.take_key_request());
    client.request_key();
    assert!(server.take_key_request());
    // One-shot: reading clears it.
    assert!(!server.take_key_request());
}

#[test]
fn test_client_without_server_fails() {
    assert!(Memsink::client(&unique_name(), 0.1).is_err());
}
