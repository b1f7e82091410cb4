//! End-to-end tests for the blocking connection against scripted peers.
//!
//! Run with: cargo test --test connection_test

use bolt_transport::messages::MessageTag;
use bolt_transport::packstream::{Reader, Writer};
use bolt_transport::version::{V4_4, V5_0, V5_3, V5_4};
use bolt_transport::{
    AuthToken, BoltError, Connection, ConnectionConfig, ConnectionState, Metadata, Value,
    encode_chunks, peek_tag,
};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

// -- scripted peer helpers ----------------------------------------------------

fn spawn_server(
    script: impl FnOnce(&mut TcpStream) + Send + 'static,
) -> (SocketAddr, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        script(&mut stream);
    });
    (addr, handle)
}

fn config_for(addr: SocketAddr) -> ConnectionConfig {
    init_tracing();
    let mut config = ConnectionConfig::new("127.0.0.1", addr.port());
    config.read_timeout = Duration::from_millis(2_000);
    config.write_timeout = Duration::from_millis(2_000);
    config
}

/// RUST_LOG-driven log output for debugging failing scenarios.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Reads the 20-byte handshake request, checks the magic, sends the reply.
fn serve_handshake(stream: &mut TcpStream, reply: [u8; 4]) -> [u8; 20] {
    let mut request = [0u8; 20];
    stream.read_exact(&mut request).unwrap();
    assert_eq!(&request[..4], &[0x60, 0x60, 0xB0, 0x17]);
    stream.write_all(&reply).unwrap();
    request
}

/// Reads one chunked message, skipping NOOPs, and returns its payload.
fn read_message(stream: &mut TcpStream) -> Vec<u8> {
    loop {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; 2];
            stream.read_exact(&mut header).unwrap();
            let len = u16::from_be_bytes(header) as usize;
            if len == 0 {
                break;
            }
            let start = payload.len();
            payload.resize(start + len, 0);
            stream.read_exact(&mut payload[start..]).unwrap();
        }
        if !payload.is_empty() {
            return payload;
        }
    }
}

fn write_message(stream: &mut TcpStream, payload: &[u8]) {
    stream.write_all(&encode_chunks(payload)).unwrap();
}

fn summary(tag: MessageTag, entries: &[(&str, Value)]) -> Vec<u8> {
    let mut writer = Writer::new();
    writer.write_struct_header(tag as u8, 1).unwrap();
    writer.write_map_header(entries.len()).unwrap();
    for (key, value) in entries {
        writer.write_string(key).unwrap();
        writer.write_value(value).unwrap();
    }
    writer.into_bytes()
}

fn success(entries: &[(&str, Value)]) -> Vec<u8> {
    summary(MessageTag::Success, entries)
}

fn failure(code: &str, message: &str) -> Vec<u8> {
    summary(
        MessageTag::Failure,
        &[
            ("code", Value::from(code)),
            ("message", Value::from(message)),
        ],
    )
}

fn ignored() -> Vec<u8> {
    let mut writer = Writer::new();
    writer
        .write_struct_header(MessageTag::Ignored as u8, 0)
        .unwrap();
    writer.into_bytes()
}

fn record() -> Vec<u8> {
    // RECORD with an empty field list.
    vec![0xB1, 0x71, 0x90]
}

/// Decodes the single extra map of a HELLO/LOGON payload.
fn extra_map(payload: &[u8], expected: MessageTag) -> Metadata {
    let mut reader = Reader::new(payload);
    let (tag, fields) = reader.read_struct_header().unwrap();
    assert_eq!(tag, expected as u8);
    assert_eq!(fields, 1);
    reader.read_map().unwrap()
}

/// Handshake + HELLO SUCCESS: the minimum script for a READY connection.
fn serve_ready(stream: &mut TcpStream, version_reply: [u8; 4]) {
    serve_handshake(stream, version_reply);
    let hello = read_message(stream);
    assert_eq!(peek_tag(&hello).unwrap(), MessageTag::Hello as u8);
    write_message(
        stream,
        &success(&[
            ("server", Value::from("Neo4j/5.13.0")),
            ("connection_id", Value::from("bolt-123")),
        ]),
    );
}

// A RUN-shaped request; the transport treats it as opaque bytes.
fn run_request() -> Vec<u8> {
    vec![0xB1, 0x10, 0x81, b'X']
}

// -- scenarios ----------------------------------------------------------------

#[test]
fn no_common_version_leaves_the_connection_defunct() {
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream, [0, 0, 0, 0]);
    });
    let mut config = config_for(addr);
    config.proposed_versions = vec![V5_4];

    let mut conn = Connection::new(config);
    let err = conn.establish().unwrap_err();
    assert_eq!(err, BoltError::HandshakeNoCommonVersion);
    assert!(conn.is_defunct());
    assert_eq!(conn.last_error(), Some(&BoltError::HandshakeNoCommonVersion));
    server.join().unwrap();
}

#[test]
fn negotiate_5_4_and_reach_ready() {
    let (addr, server) = spawn_server(|stream| {
        let request = serve_handshake(stream, [0x00, 0x00, 0x05, 0x04]);
        assert_eq!(
            request,
            [
                0x60, 0x60, 0xB0, 0x17, 0x00, 0x00, 0x05, 0x04, 0x00, 0x00, 0x05, 0x03, 0x00,
                0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            ]
        );
        let hello = read_message(stream);
        let extra = extra_map(&hello, MessageTag::Hello);
        assert!(extra.contains_key("user_agent"));
        write_message(
            stream,
            &success(&[
                ("server", Value::from("Neo4j/5.13.0")),
                ("connection_id", Value::from("bolt-123")),
            ]),
        );
    });
    let mut config = config_for(addr);
    config.proposed_versions = vec![V5_4, V5_3];

    let mut conn = Connection::new(config);
    conn.establish().unwrap();
    assert!(conn.is_ready());
    assert_eq!(conn.state(), ConnectionState::Ready);
    assert_eq!(conn.negotiated_version(), V5_4);
    assert_eq!(conn.server_agent(), "Neo4j/5.13.0");
    assert_eq!(conn.server_connection_id(), "bolt-123");
    assert!(conn.utc_patch_active());
    server.join().unwrap();
}

#[test]
fn auth_is_embedded_in_hello_below_5_1() {
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream, V5_0.encode_slot());
        let hello = read_message(stream);
        let extra = extra_map(&hello, MessageTag::Hello);
        assert_eq!(extra["scheme"].as_str(), Some("basic"));
        assert_eq!(extra["principal"].as_str(), Some("neo4j"));
        assert_eq!(extra["credentials"].as_str(), Some("secret"));
        write_message(stream, &success(&[("server", Value::from("Neo4j/4.4"))]));
    });
    let mut config = config_for(addr);
    config.proposed_versions = vec![V5_4, V5_0];
    config.auth = AuthToken::Basic {
        username: "neo4j".into(),
        password: "secret".into(),
        realm: None,
    };

    let mut conn = Connection::new(config);
    conn.establish().unwrap();
    assert!(conn.is_ready());
    server.join().unwrap();
}

#[test]
fn auth_travels_in_logon_from_5_1() {
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream, V5_4.encode_slot());
        let hello = read_message(stream);
        let extra = extra_map(&hello, MessageTag::Hello);
        assert!(!extra.contains_key("scheme"));
        write_message(
            stream,
            &success(&[("connection_id", Value::from("bolt-1"))]),
        );

        let logon = read_message(stream);
        let tokens = extra_map(&logon, MessageTag::Logon);
        assert_eq!(tokens["scheme"].as_str(), Some("basic"));
        assert_eq!(tokens["principal"].as_str(), Some("neo4j"));
        write_message(
            stream,
            &success(&[("connection_id", Value::from("bolt-2"))]),
        );
    });
    let mut config = config_for(addr);
    config.auth = AuthToken::Basic {
        username: "neo4j".into(),
        password: "secret".into(),
        realm: None,
    };

    let mut conn = Connection::new(config);
    conn.establish().unwrap();
    assert!(conn.is_ready());
    // LOGON re-issued the server-side id.
    assert_eq!(conn.server_connection_id(), "bolt-2");
    server.join().unwrap();
}

#[test]
fn utc_patch_active_only_when_echoed_on_4_4() {
    // Server echoes the offer back.
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream, V4_4.encode_slot());
        let hello = read_message(stream);
        let extra = extra_map(&hello, MessageTag::Hello);
        let patches = extra["patch_bolt"].as_list().unwrap();
        assert_eq!(patches, &[Value::from("utc")]);
        write_message(
            stream,
            &success(&[(
                "patch_bolt",
                Value::List(vec![Value::from("utc")]),
            )]),
        );
    });
    let mut config = config_for(addr);
    config.proposed_versions = vec![V5_4, V4_4];
    let mut conn = Connection::new(config);
    conn.establish().unwrap();
    assert!(conn.utc_patch_active());
    server.join().unwrap();

    // Server stays silent about the patch: inactive.
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream, V4_4.encode_slot());
        let _hello = read_message(stream);
        write_message(stream, &success(&[]));
    });
    let mut config = config_for(addr);
    config.proposed_versions = vec![V5_4, V4_4];
    let mut conn = Connection::new(config);
    conn.establish().unwrap();
    assert!(!conn.utc_patch_active());
    server.join().unwrap();
}

#[test]
fn security_failure_during_hello_is_fatal() {
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream, V5_4.encode_slot());
        let _hello = read_message(stream);
        write_message(
            stream,
            &failure(
                "Neo.ClientError.Security.Unauthorized",
                "The client is unauthorized due to authentication failure.",
            ),
        );
    });
    let mut conn = Connection::new(config_for(addr));
    let err = conn.establish().unwrap_err();
    assert!(matches!(err, BoltError::HandshakeFailed(_)), "{err:?}");
    assert!(conn.is_defunct());
    server.join().unwrap();
}

#[test]
fn stream_request_delivers_records_in_order_and_skips_noops() {
    let (addr, server) = spawn_server(|stream| {
        serve_ready(stream, V5_4.encode_slot());
        let request = read_message(stream);
        assert_eq!(peek_tag(&request).unwrap(), 0x10);
        // Two records with a NOOP wedged between, then the summary.
        write_message(stream, &record());
        stream.write_all(&[0x00, 0x00]).unwrap(); // NOOP keep-alive
        write_message(stream, &record());
        write_message(stream, &success(&[("t_last", Value::Integer(7))]));
    });
    let mut conn = Connection::new(config_for(addr));
    conn.establish().unwrap();

    let mut records = Vec::new();
    let meta = conn
        .send_request_receive_stream(&run_request(), |payload| {
            records.push(payload.to_vec());
            Ok(())
        })
        .unwrap();
    assert_eq!(records.len(), 2);
    assert!(records.iter().all(|r| r == &record()));
    assert_eq!(meta["t_last"], Value::Integer(7));
    assert!(conn.is_ready());
    server.join().unwrap();
}

#[test]
fn record_handler_errors_propagate() {
    let (addr, server) = spawn_server(|stream| {
        serve_ready(stream, V5_4.encode_slot());
        let _request = read_message(stream);
        write_message(stream, &record());
        // The client bails on the first record; anything else we write may
        // never be read.
        let _ = stream.write_all(&encode_chunks(&success(&[])));
    });
    let mut conn = Connection::new(config_for(addr));
    conn.establish().unwrap();

    let err = conn
        .send_request_receive_stream(&run_request(), |_payload| {
            Err(BoltError::UnknownError("handler rejected record".into()))
        })
        .unwrap_err();
    assert_eq!(err, BoltError::UnknownError("handler rejected record".into()));
    server.join().unwrap();
}

#[test]
fn transient_failure_then_reset_restores_ready() {
    let (addr, server) = spawn_server(|stream| {
        serve_ready(stream, V5_4.encode_slot());
        let _request = read_message(stream);
        write_message(
            stream,
            &failure(
                "Neo.TransientError.General.DatabaseUnavailable",
                "Database is busy",
            ),
        );
        let reset = read_message(stream);
        assert_eq!(peek_tag(&reset).unwrap(), MessageTag::Reset as u8);
        write_message(stream, &success(&[]));
        // Connection is usable again afterwards.
        let _request = read_message(stream);
        write_message(stream, &success(&[]));
    });
    let mut conn = Connection::new(config_for(addr));
    conn.establish().unwrap();

    let err = conn.send_request_receive_summary(&run_request()).unwrap_err();
    assert!(matches!(err, BoltError::NetworkError(_)), "{err:?}");
    assert!(err.is_retryable_server_failure());
    assert_eq!(conn.state(), ConnectionState::FailedServerReported);
    assert!(!conn.is_defunct());

    conn.reset().unwrap();
    assert!(conn.is_ready());
    conn.send_request_receive_summary(&run_request()).unwrap();
    server.join().unwrap();
}

#[test]
fn ignored_response_is_recoverable() {
    let (addr, server) = spawn_server(|stream| {
        serve_ready(stream, V5_4.encode_slot());
        let _request = read_message(stream);
        write_message(stream, &ignored());
        let _reset = read_message(stream);
        write_message(stream, &success(&[]));
    });
    let mut conn = Connection::new(config_for(addr));
    conn.establish().unwrap();

    let err = conn.send_request_receive_summary(&run_request()).unwrap_err();
    assert!(matches!(err, BoltError::UnknownError(_)), "{err:?}");
    assert_eq!(conn.state(), ConnectionState::FailedServerReported);
    conn.reset().unwrap();
    assert!(conn.is_ready());
    server.join().unwrap();
}

#[test]
fn unexpected_summary_tag_is_fatal() {
    let (addr, server) = spawn_server(|stream| {
        serve_ready(stream, V5_4.encode_slot());
        let _request = read_message(stream);
        // A RECORD where only a summary is legal.
        write_message(stream, &record());
    });
    let mut conn = Connection::new(config_for(addr));
    conn.establish().unwrap();

    let err = conn.send_request_receive_summary(&run_request()).unwrap_err();
    assert!(matches!(err, BoltError::InvalidMessageFormat(_)), "{err:?}");
    assert!(conn.is_defunct());
    // The stored error replays without touching the wire.
    let replay = conn.send_request_receive_summary(&run_request()).unwrap_err();
    assert_eq!(replay, err);
    server.join().unwrap();
}

#[test]
fn silent_peer_times_out_within_the_window() {
    let (addr, server) = spawn_server(|stream| {
        serve_ready(stream, V5_4.encode_slot());
        let _reset = read_message(stream);
        // Never answer; hold the socket open past the client timeout.
        std::thread::sleep(Duration::from_millis(400));
    });
    let mut config = config_for(addr);
    config.read_timeout = Duration::from_millis(50);
    let mut conn = Connection::new(config);
    conn.establish().unwrap();

    let start = Instant::now();
    let err = conn.ping().unwrap_err();
    let elapsed = start.elapsed();
    assert!(matches!(err, BoltError::NetworkError(_)), "{err:?}");
    assert!(
        elapsed >= Duration::from_millis(45) && elapsed < Duration::from_millis(250),
        "timed out after {elapsed:?}"
    );
    assert!(conn.is_defunct());
    server.join().unwrap();
}

#[test]
fn terminate_sends_goodbye() {
    let (addr, server) = spawn_server(|stream| {
        serve_ready(stream, V5_4.encode_slot());
        let goodbye = read_message(stream);
        assert_eq!(peek_tag(&goodbye).unwrap(), MessageTag::Goodbye as u8);
    });
    let mut conn = Connection::new(config_for(addr));
    conn.establish().unwrap();
    conn.terminate(true);
    assert_eq!(conn.state(), ConnectionState::Defunct);
    assert!(conn.is_defunct());
    server.join().unwrap();
}

#[test]
fn server_selecting_an_unoffered_version_is_rejected() {
    let (addr, server) = spawn_server(|stream| {
        serve_handshake(stream, V4_4.encode_slot());
    });
    let mut config = config_for(addr);
    config.proposed_versions = vec![V5_4, V5_3];
    let mut conn = Connection::new(config);
    let err = conn.establish().unwrap_err();
    assert!(matches!(err, BoltError::UnsupportedProtocolVersion(_)), "{err:?}");
    assert!(conn.is_defunct());
    server.join().unwrap();
}
