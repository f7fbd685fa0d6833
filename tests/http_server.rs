//! HTTP endpoint tests against a real listening server.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use vstream::encoder::{Encoder, EncoderType};
use vstream::frame::{self, Frame};
use vstream::server::{Server, ServerConfig};
use vstream::stream::StreamOutput;

struct TestServer {
    addr: SocketAddr,
    output: Arc<StreamOutput>,
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl TestServer {
    fn start(mut config: ServerConfig) -> Self {
        config.host = "127.0.0.1".into();
        config.port = 0;

        let output = Arc::new(StreamOutput::new());
        let encoder = Arc::new(Encoder::new(EncoderType::Cpu, 80));
        let server = Server::bind(&config, Arc::clone(&output), encoder, None).unwrap();
        let addr = server.local_addr().unwrap();

        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                server.run(stop).unwrap();
            })
        };

        Self {
            addr,
            output,
            stop,
            handle: Some(handle),
        }
    }

    fn publish(&self, payload: &[u8]) {
        let mut fresh = Frame::new();
        fresh.set_data(payload);
        fresh.width = 64;
        fresh.height = 48;
        fresh.format = frame::FOURCC_JPEG;
        fresh.online = true;
        fresh.grab_ts = 1.0;

        let mut exposed = self.output.frame.lock().unwrap();
        exposed.copy_from(&fresh);
        drop(exposed);
        self.output.online.store(true, Ordering::SeqCst);
        self.output.updated.store(true, Ordering::SeqCst);
    }

    fn request(&self, request: &str) -> (String, Vec<u8>) {
        let mut socket = TcpStream::connect(self.addr).unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        socket.write_all(request.as_bytes()).unwrap();
        let mut response = Vec::new();
        socket.read_to_end(&mut response).unwrap();

        let split = response
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("response has a header block");
        let head = String::from_utf8_lossy(&response[..split]).into_owned();
        let body = response[split + 4..].to_vec();
        (head, body)
    }

    fn get(&self, path: &str) -> (String, Vec<u8>) {
        self.request(&format!("GET {path} HTTP/1.0\r\n\r\n"))
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[test]
fn test_index_page() {
    let server = TestServer::start(ServerConfig::default());
    let (head, body) = server.get("/");
    assert!(head.starts_with("HTTP/1.0 200 OK"), "{head}");
    assert!(head.contains("Content-Type: text/html"));
    let body = String::from_utf8_lossy(&body);
    assert!(body.contains("/stream"));
    assert!(body.contains("/snapshot"));
}

#[test]
fn test_not_found() {
    let server = TestServer::start(ServerConfig::default());
    let (head, _) = server.get("/nope");
    assert!(head.starts_with("HTTP/1.0 404"), "{head}");
}

#[test]
fn test_head_request() {
    let server = TestServer::start(ServerConfig::default());
    let (head, body) = server.request("HEAD /snapshot HTTP/1.0\r\n\r\n");
    assert!(head.starts_with("HTTP/1.0 200 OK"), "{head}");
    assert!(body.is_empty());
}

#[test]
fn test_snapshot_roundtrip() {
    let server = TestServer::start(ServerConfig::default());
    let payload = b"\xFF\xD8fakejpegpayload\xFF\xD9";
    server.publish(payload);
    // Wait for a refresh tick to pick up the new frame.
    std::thread::sleep(Duration::from_millis(200));

    let (head, body) = server.get("/snapshot");
    assert!(head.starts_with("HTTP/1.0 200 OK"), "{head}");
    assert!(head.contains("Content-Type: image/jpeg"));
    assert!(head.contains("X-UStreamer-Online: true"));
    assert!(head.contains("X-UStreamer-Width: 64"));
    assert!(head.contains("X-UStreamer-Height: 48"));
    assert!(head.contains("X-Timestamp:"));
    assert_eq!(body, payload);
}

#[test]
fn test_snapshot_offline_serves_blank() {
    let server = TestServer::start(ServerConfig::default());
    std::thread::sleep(Duration::from_millis(100));
    let (head, body) = server.get("/snapshot");
    assert!(head.starts_with("HTTP/1.0 200 OK"), "{head}");
    assert!(head.contains("X-UStreamer-Online: false"));
    // The built-in placeholder is a valid JPEG.
    assert_eq!(&body[..2], &[0xFF, 0xD8]);
}

#[test]
fn test_state_endpoint() {
    let server = TestServer::start(ServerConfig::default());
    server.publish(b"\xFF\xD8x\xFF\xD9");
    std::thread::sleep(Duration::from_millis(200));

    let (head, body) = server.get("/state");
    assert!(head.starts_with("HTTP/1.0 200 OK"), "{head}");
    assert!(head.contains("Content-Type: application/json"));

    let state: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(state["ok"], true);
    let result = &state["result"];
    assert_eq!(result["encoder"]["type"], "CPU");
    assert_eq!(result["encoder"]["quality"], 80);
    assert_eq!(result["source"]["online"], true);
    assert_eq!(result["source"]["resolution"]["width"], 64);
    assert_eq!(result["stream"]["clients"], 0);
}

#[test]
fn test_basic_auth() {
    let config = ServerConfig {
        user: Some("admin".into()),
        passwd: "secret".into(),
        ..Default::default()
    };
    let server = TestServer::start(config);

    let (head, _) = server.get("/state");
    assert!(head.starts_with("HTTP/1.0 401"), "{head}");
    assert!(head.contains("WWW-Authenticate: Basic realm=\"Restricted area\""));

    // admin:secret
    let (head, _) = server.request(
        "GET /state HTTP/1.0\r\nAuthorization: Basic YWRtaW46c2VjcmV0\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.0 200 OK"), "{head}");

    let (head, _) = server.request(
        "GET /state HTTP/1.0\r\nAuthorization: Basic d3Jvbmc6d3Jvbmc=\r\n\r\n",
    );
    assert!(head.starts_with("HTTP/1.0 401"), "{head}");
}

#[test]
fn test_stream_multipart() {
    let server = TestServer::start(ServerConfig::default());

    let mut socket = TcpStream::connect(server.addr).unwrap();
    socket
        .set_read_timeout(Some(Duration::from_millis(500)))
        .unwrap();
    socket
        .write_all(b"GET /stream?extra_headers=1 HTTP/1.0\r\n\r\n")
        .unwrap();

    let mut received = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(5);
    let payload = b"\xFF\xD8streamed-frame-payload\xFF\xD9";
    let mut published = false;
    let mut buf = [0u8; 4096];
    while Instant::now() < deadline {
        match socket.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(_) => {} // Read timeout, keep collecting
        }
        if !published && !received.is_empty() {
            // The initial headers and first (placeholder) part arrived;
            // now publish a real frame.
            server.publish(payload);
            published = true;
        }
        if published
            && received
                .windows(payload.len())
                .any(|w| w == payload.as_slice())
        {
            break;
        }
    }

    let head = String::from_utf8_lossy(&received);
    assert!(head.starts_with("HTTP/1.0 200 OK"), "no status line");
    assert!(
        head.contains("Content-Type: multipart/x-mixed-replace;boundary=boundarydonotcross"),
        "missing multipart content type"
    );
    assert!(head.contains("--boundarydonotcross"), "missing boundary");
    assert!(head.contains("Set-Cookie: stream_client=0/"), "missing cookie");
    assert!(head.contains("Content-Type: image/jpeg"), "missing part header");
    assert!(head.contains("X-UStreamer-Online:"), "missing extra headers");
    assert!(
        received
            .windows(payload.len())
            .any(|w| w == payload.as_slice()),
        "published frame never reached the stream client"
    );
}

#[test]
fn test_stream_client_count_in_state() {
    let server = TestServer::start(ServerConfig::default());

    let mut socket = TcpStream::connect(server.addr).unwrap();
    socket
        .write_all(b"GET /stream HTTP/1.0\r\n\r\n")
        .unwrap();
    // Give the server a moment to register the client.
    std::thread::sleep(Duration::from_millis(300));

    let (_, body) = server.get("/state");
    let state: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(state["result"]["stream"]["clients"], 1);

    drop(socket);
    std::thread::sleep(Duration::from_millis(500));

    let (_, body) = server.get("/state");
    let state: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(state["result"]["stream"]["clients"], 0);
}
