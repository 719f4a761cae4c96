//! Public gateway and relay listener integration tests
//!
//! Agents are simulated with raw sockets so each test controls exactly what
//! travels over the relay connection.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::info;

use tunnelgate_proto::{HttpRequestParser, HttpResponseParser};
use tunnelgate_router::TunnelRegistry;
use tunnelgate_server::{GatewayConfig, PublicGateway, RelayListener};

// ============================================================================
// HELPER FUNCTIONS
// ============================================================================

struct TestRelay {
    public_addr: SocketAddr,
    relay_addr: SocketAddr,
    registry: Arc<TunnelRegistry>,
    _shutdown: watch::Sender<bool>,
}

fn test_config() -> GatewayConfig {
    GatewayConfig {
        public_addr: "127.0.0.1:0".parse().unwrap(),
        relay_addr: "127.0.0.1:0".parse().unwrap(),
        registration_grace: Duration::from_millis(500),
        request_read_timeout: Duration::from_millis(500),
        relay_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

async fn start_relay(config: GatewayConfig) -> TestRelay {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();

    let registry = Arc::new(TunnelRegistry::new());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let relay = RelayListener::bind(&config, registry.clone()).await.unwrap();
    let gateway = PublicGateway::bind(&config, registry.clone()).await.unwrap();
    let relay_addr = relay.local_addr().unwrap();
    let public_addr = gateway.local_addr().unwrap();

    tokio::spawn(relay.run(shutdown_rx.clone()));
    tokio::spawn(gateway.run(shutdown_rx));
    info!("✓ Relay on {}, gateway on {}", relay_addr, public_addr);

    TestRelay {
        public_addr,
        relay_addr,
        registry,
        _shutdown: shutdown_tx,
    }
}

/// Register `id` with a raw agent connection and wait until it is visible
async fn register_agent(relay: &TestRelay, id: &str) -> TcpStream {
    let mut agent = TcpStream::connect(relay.relay_addr).await.unwrap();
    agent.write_all(format!("{}\n", id).as_bytes()).await.unwrap();

    for _ in 0..100 {
        if relay.registry.contains(id) {
            return agent;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("tunnel {} never registered", id);
}

/// Read one forwarded request off the agent side of the relay connection
async fn read_forwarded_request(agent: &mut TcpStream) -> (String, Vec<u8>) {
    let mut parser = HttpRequestParser::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = agent.read(&mut buf).await.unwrap();
        assert!(n > 0, "relay closed before a request arrived");
        parser.feed(&buf[..n]).unwrap();
        if let Some((parsed, bytes)) = parser.take_request() {
            return (parsed.path, bytes);
        }
    }
}

fn text_response(body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .into_bytes()
}

/// Send raw bytes to the gateway and collect everything it answers
async fn send_raw(addr: SocketAddr, request: &[u8]) -> Vec<u8> {
    let mut client = TcpStream::connect(addr).await.unwrap();
    client.write_all(request).await.unwrap();

    let mut response = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        match client.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => response.extend_from_slice(&buf[..n]),
        }
    }
    response
}

async fn get(addr: SocketAddr, path: &str) -> (u16, String) {
    let request = format!("GET {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path);
    parse_response(&send_raw(addr, request.as_bytes()).await)
}

fn parse_response(bytes: &[u8]) -> (u16, String) {
    let mut parser = HttpResponseParser::new();
    parser.feed(bytes).unwrap();
    let status = parser.parsed().expect("no response headers").status;
    let body = String::from_utf8_lossy(parser.body_data().unwrap_or_default()).to_string();
    (status, body)
}

// ============================================================================
// PUBLIC SURFACE
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_root_serves_help_page() {
    let relay = start_relay(test_config()).await;

    let (status, body) = get(relay.public_addr, "/").await;

    assert_eq!(status, 200);
    assert!(body.contains("Tunnel Server"));
    assert_eq!(relay.registry.count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_tunnel_is_bad_gateway() {
    let relay = start_relay(test_config()).await;

    let (status, body) = get(relay.public_addr, "/ghost/x").await;

    assert_eq!(status, 502);
    assert!(body.contains("ghost"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_tunnel_id_is_bad_gateway() {
    let relay = start_relay(test_config()).await;

    let (status, body) = get(relay.public_addr, "/%3Cb%3E/x").await;

    assert_eq!(status, 502);
    assert!(body.contains("%3Cb%3E"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_path_is_rewritten() {
    let relay = start_relay(test_config()).await;
    let mut agent = register_agent(&relay, "t").await;

    let agent_task = tokio::spawn(async move {
        let (path, bytes) = read_forwarded_request(&mut agent).await;
        agent.write_all(&text_response(&path)).await.unwrap();
        (agent, bytes)
    });

    let (status, body) = get(relay.public_addr, "/t/foo/bar").await;
    assert_eq!(status, 200);
    assert_eq!(body, "/foo/bar");

    let (_agent, forwarded) = agent_task.await.unwrap();
    let forwarded = String::from_utf8(forwarded).unwrap();
    assert!(forwarded.starts_with("GET /foo/bar HTTP/1.1\r\n"));
    assert!(forwarded.contains("Host: localhost\r\n"));
    assert!(relay.registry.contains("t"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_request_body_and_query_are_forwarded() {
    let relay = start_relay(test_config()).await;
    let mut agent = register_agent(&relay, "api").await;

    let agent_task = tokio::spawn(async move {
        let (path, bytes) = read_forwarded_request(&mut agent).await;
        let body_start = bytes.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let echoed = format!("{} {}", path, String::from_utf8_lossy(&bytes[body_start..]));
        agent.write_all(&text_response(&echoed)).await.unwrap();
        agent
    });

    let request = b"POST /api?x=1 HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello";
    let (status, body) = parse_response(&send_raw(relay.public_addr, request).await);

    assert_eq!(status, 200);
    assert_eq!(body, "/?x=1 hello");
    agent_task.await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chunked_response_is_relayed() {
    let relay = start_relay(test_config()).await;
    let mut agent = register_agent(&relay, "chunky").await;

    tokio::spawn(async move {
        read_forwarded_request(&mut agent).await;
        agent
            .write_all(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        agent
            .write_all(b"5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n")
            .await
            .unwrap();
        agent
    });

    let raw = send_raw(relay.public_addr, b"GET /chunky/ HTTP/1.1\r\n\r\n").await;
    let raw = String::from_utf8(raw).unwrap();

    assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(raw.ends_with("5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n"));
    assert!(relay.registry.contains("chunky"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_interim_response_is_followed_by_final() {
    let relay = start_relay(test_config()).await;
    let mut agent = register_agent(&relay, "up").await;

    tokio::spawn(async move {
        read_forwarded_request(&mut agent).await;
        let mut response = b"HTTP/1.1 100 Continue\r\n\r\n".to_vec();
        response.extend_from_slice(&text_response("stored"));
        agent.write_all(&response).await.unwrap();

        let (path, _) = read_forwarded_request(&mut agent).await;
        agent.write_all(&text_response(&path)).await.unwrap();
        agent
    });

    let request =
        b"POST /up/files HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 4\r\n\r\ndata";
    let raw = send_raw(relay.public_addr, request).await;
    assert!(raw.starts_with(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n"));
    let (status, body) = parse_response(&raw);
    assert_eq!(status, 200);
    assert_eq!(body, "stored");

    // The relay connection is still aligned for the next exchange
    let (status, body) = get(relay.public_addr, "/up/next").await;
    assert_eq!((status, body.as_str()), (200, "/next"));
    assert!(relay.registry.contains("up"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_slow_response_body_is_relayed_whole() {
    let relay = start_relay(test_config()).await;
    let mut agent = register_agent(&relay, "wan").await;

    tokio::spawn(async move {
        read_forwarded_request(&mut agent).await;
        agent
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 22\r\n\r\nfirst-part ")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        agent.write_all(b"second-part").await.unwrap();

        let (path, _) = read_forwarded_request(&mut agent).await;
        agent.write_all(&text_response(&path)).await.unwrap();
        agent
    });

    let (status, body) = get(relay.public_addr, "/wan/big").await;
    assert_eq!((status, body.as_str()), (200, "first-part second-part"));

    let (status, body) = get(relay.public_addr, "/wan/after").await;
    assert_eq!((status, body.as_str()), (200, "/after"));
    assert!(relay.registry.contains("wan"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_close_delimited_response_ends_tunnel() {
    let relay = start_relay(test_config()).await;
    let mut agent = register_agent(&relay, "legacy").await;

    tokio::spawn(async move {
        read_forwarded_request(&mut agent).await;
        agent
            .write_all(b"HTTP/1.0 200 OK\r\n\r\nfirst-part ")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        agent.write_all(b"second-part").await.unwrap();
        // Closing the relay connection is the only end marker
        drop(agent);
    });

    let (status, body) = get(relay.public_addr, "/legacy/").await;

    assert_eq!(status, 200);
    assert_eq!(body, "first-part second-part");
    assert!(!relay.registry.contains("legacy"));
}

// ============================================================================
// SERIALIZATION
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_concurrent_requests_are_not_interleaved() {
    let relay = start_relay(test_config()).await;
    let mut agent = register_agent(&relay, "slow").await;

    let agent_task = tokio::spawn(async move {
        let mut paths = Vec::new();
        for _ in 0..2 {
            let (path, _) = read_forwarded_request(&mut agent).await;
            // Nothing else may arrive while this exchange is open
            tokio::time::sleep(Duration::from_millis(200)).await;
            let mut peek = [0u8; 1];
            assert!(
                agent.try_read(&mut peek).is_err(),
                "second request was written before the first response"
            );
            agent.write_all(&text_response(&path)).await.unwrap();
            paths.push(path);
        }
        paths
    });

    let addr = relay.public_addr;
    let first = tokio::spawn(async move { get(addr, "/slow/one").await });
    let second = tokio::spawn(async move { get(addr, "/slow/two").await });

    let (status1, body1) = first.await.unwrap();
    let (status2, body2) = second.await.unwrap();
    assert_eq!((status1, body1.as_str()), (200, "/one"));
    assert_eq!((status2, body2.as_str()), (200, "/two"));

    let mut paths = agent_task.await.unwrap();
    paths.sort();
    assert_eq!(paths, vec!["/one".to_string(), "/two".to_string()]);
}

// ============================================================================
// RELAY FAILURES
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_closed_relay_connection_is_evicted() {
    let relay = start_relay(test_config()).await;
    let agent = register_agent(&relay, "t").await;
    drop(agent);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let (status, body) = get(relay.public_addr, "/t/").await;

    assert_eq!(status, 502);
    assert!(body.contains("t"));
    assert!(relay.registry.lookup("t").is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reset_relay_connection_is_evicted() {
    let relay = start_relay(test_config()).await;
    let agent = register_agent(&relay, "rst").await;

    // Zero linger turns the close into a reset, so the next relay write fails
    socket2::SockRef::from(&agent)
        .set_linger(Some(Duration::ZERO))
        .unwrap();
    drop(agent);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (status, body) = get(relay.public_addr, "/rst/").await;

    assert_eq!(status, 502);
    assert!(body.contains("rst"));
    assert!(!relay.registry.contains("rst"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_agent_closing_mid_exchange_is_evicted() {
    let relay = start_relay(test_config()).await;
    let mut agent = register_agent(&relay, "flaky").await;

    tokio::spawn(async move {
        read_forwarded_request(&mut agent).await;
        drop(agent);
    });

    let (status, _) = get(relay.public_addr, "/flaky/x").await;

    assert_eq!(status, 502);
    assert!(!relay.registry.contains("flaky"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_tunnel_times_out() {
    let mut config = test_config();
    config.relay_timeout = Duration::from_millis(200);
    let relay = start_relay(config).await;
    let mut agent = register_agent(&relay, "mute").await;

    let agent_task = tokio::spawn(async move {
        read_forwarded_request(&mut agent).await;
        // Never answers; wait for the relay to give up on us
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), agent.read(&mut buf))
            .await
            .expect("relay never closed the connection")
            .unwrap_or(0);
        assert_eq!(n, 0);
    });

    let (status, body) = get(relay.public_addr, "/mute/").await;

    assert_eq!(status, 504);
    assert!(body.contains("mute"));
    assert!(!relay.registry.contains("mute"));
    agent_task.await.unwrap();
}

// ============================================================================
// REGISTRATION
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_reregistration_replaces_previous_agent() {
    let relay = start_relay(test_config()).await;
    let mut old_agent = register_agent(&relay, "app").await;
    let first = relay.registry.lookup("app").unwrap();

    let mut new_agent = TcpStream::connect(relay.relay_addr).await.unwrap();
    new_agent.write_all(b"app\n").await.unwrap();

    // The previous relay connection is closed once the new one registers
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), old_agent.read(&mut buf))
        .await
        .expect("old agent was not disconnected")
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(first.is_closed());

    tokio::spawn(async move {
        read_forwarded_request(&mut new_agent).await;
        new_agent.write_all(&text_response("new")).await.unwrap();
        new_agent
    });

    let (status, body) = get(relay.public_addr, "/app/").await;
    assert_eq!(status, 200);
    assert_eq!(body, "new");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_registrations_are_dropped() {
    let relay = start_relay(test_config()).await;

    for line in [&b"bad id\n"[..], b"\n", &[b'x'; 300][..]] {
        let mut agent = TcpStream::connect(relay.relay_addr).await.unwrap();
        agent.write_all(line).await.unwrap();

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), agent.read(&mut buf))
            .await
            .expect("relay kept an invalid registration open")
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    assert_eq!(relay.registry.count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_silent_agent_is_dropped_after_grace_period() {
    let relay = start_relay(test_config()).await;
    let mut agent = TcpStream::connect(relay.relay_addr).await.unwrap();

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(3), agent.read(&mut buf))
        .await
        .expect("relay never dropped the silent agent")
        .unwrap_or(0);

    assert_eq!(n, 0);
    assert_eq!(relay.registry.count(), 0);
}

// ============================================================================
// REQUEST FRAMING
// ============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_request_is_rejected() {
    let relay = start_relay(test_config()).await;

    let (status, _) = parse_response(&send_raw(relay.public_addr, b"NOT HTTP\r\n\r\n").await);

    assert_eq!(status, 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_chunked_request_requires_length() {
    let relay = start_relay(test_config()).await;
    let request =
        b"POST /t/ HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n";

    let (status, _) = parse_response(&send_raw(relay.public_addr, request).await);

    assert_eq!(status, 411);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oversized_headers_are_rejected() {
    let mut config = test_config();
    config.max_header_bytes = 1024;
    let relay = start_relay(config).await;
    let request = format!(
        "GET /t/ HTTP/1.1\r\nX-Filler: {}\r\n\r\n",
        "a".repeat(2048)
    );

    let (status, _) = parse_response(&send_raw(relay.public_addr, request.as_bytes()).await);

    assert_eq!(status, 431);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_oversized_body_is_rejected() {
    let mut config = test_config();
    config.max_body_bytes = 16;
    let relay = start_relay(config).await;
    let agent = register_agent(&relay, "t").await;

    let request = b"POST /t/ HTTP/1.1\r\nContent-Length: 1000\r\n\r\n";
    let (status, body) = parse_response(&send_raw(relay.public_addr, request).await);

    assert_eq!(status, 413);
    assert!(body.contains("16"));

    // Nothing reached the tunnel
    let mut buf = [0u8; 1];
    assert!(agent.try_read(&mut buf).is_err());
    assert!(relay.registry.contains("t"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_incomplete_request_times_out() {
    let relay = start_relay(test_config()).await;
    let mut client = TcpStream::connect(relay.public_addr).await.unwrap();
    client
        .write_all(b"POST /t/ HTTP/1.1\r\nContent-Length: 10\r\n\r\nabc")
        .await
        .unwrap();

    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(3), client.read_to_end(&mut response))
        .await
        .expect("gateway never answered")
        .unwrap();

    assert_eq!(parse_response(&response).0, 408);
}
