//! End-to-end WebSocket tests against a live server on loopback

mod common;

use std::io::Write;

use common::*;

const TEXT: u8 = 0x1;
const BINARY: u8 = 0x2;
const CLOSE: u8 = 0x8;
const PING: u8 = 0x9;
const PONG: u8 = 0xA;

#[test]
fn upgrade_happy_path() {
    let (server, addr) = start_echo_server(test_config());
    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(std::time::Duration::from_secs(3)))
        .unwrap();

    let head = request_upgrade(&mut stream, "");
    assert!(head.starts_with("HTTP/1.1 101"), "got: {}", head);
    assert!(head.contains("Upgrade: websocket\r\n"));
    assert!(head.contains("Connection: Upgrade\r\n"));
    assert!(head.contains(&format!("Sec-WebSocket-Accept: {}\r\n", SAMPLE_ACCEPT)));

    server.shutdown(1_000);
}

#[test]
fn rejects_wrong_websocket_version() {
    let (server, addr) = start_echo_server(test_config());
    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(std::time::Duration::from_secs(3)))
        .unwrap();
    let request = format!(
        "GET /ws HTTP/1.1\r\nHost: test\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: {}\r\nSec-WebSocket-Version: 8\r\n\r\n",
        SAMPLE_KEY
    );
    stream.write_all(request.as_bytes()).unwrap();
    let head = read_http_head(&mut stream);
    assert!(head.starts_with("HTTP/1.1 400"), "got: {}", head);
    server.shutdown(1_000);
}

#[test]
fn masked_text_frame_echoes() {
    let (server, addr) = start_echo_server(test_config());
    let mut stream = ws_connect(addr);

    // The spec sample frame: masked "Hello"
    stream
        .write_all(&[0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58])
        .unwrap();

    let (fin, payload) = read_frame_of(&mut stream, TEXT);
    assert!(fin);
    assert_eq!(&payload, b"Hello");

    server.shutdown(1_000);
}

#[test]
fn zero_length_text_roundtrip() {
    let (server, addr) = start_echo_server(test_config());
    let mut stream = ws_connect(addr);

    send_frame(&mut stream, TEXT, b"");
    let (fin, payload) = read_frame_of(&mut stream, TEXT);
    assert!(fin);
    assert!(payload.is_empty());

    server.shutdown(1_000);
}

#[test]
fn binary_roundtrip_boundary_sizes() {
    let (server, addr) = start_echo_server(test_config());
    let mut stream = ws_connect(addr);

    for &len in &[0usize, 1, 125, 126, 127, 65_535, 65_536, 1_048_576] {
        let payload: Vec<u8> = (0..len).map(|i| (i * 131) as u8).collect();
        send_frame(&mut stream, BINARY, &payload);
        let (fin, echoed) = read_frame_of(&mut stream, BINARY);
        assert!(fin, "len {}", len);
        assert_eq!(echoed.len(), len, "len {}", len);
        assert_eq!(echoed, payload, "len {}", len);
    }

    server.shutdown(1_000);
}

#[test]
fn fragmented_binary_is_assembled_once() {
    let (server, addr) = start_echo_server(test_config());
    let mut stream = ws_connect(addr);

    let mask = [0x11, 0x22, 0x33, 0x44];
    send_frame_raw(&mut stream, false, BINARY, b"abc", mask);
    send_frame_raw(&mut stream, true, 0x0, b"de", mask);

    // Exactly one echoed message covering the whole payload
    let (fin, payload) = read_frame_of(&mut stream, BINARY);
    assert!(fin);
    assert_eq!(&payload, b"abcde");
    expect_silence(&mut stream, 150);

    server.shutdown(1_000);
}

#[test]
fn ping_gets_pong_with_same_payload() {
    let (server, addr) = start_echo_server(test_config());
    let mut stream = ws_connect(addr);

    send_frame(&mut stream, PING, b"heartbeat-probe");
    let (fin, payload) = read_frame_of(&mut stream, PONG);
    assert!(fin);
    assert_eq!(&payload, b"heartbeat-probe");

    server.shutdown(1_000);
}

#[test]
fn close_handshake_echoes_status_1000() {
    let (server, addr) = start_echo_server(test_config());
    let mut stream = ws_connect(addr);

    assert!(wait_until(1_000, || server.registry().len() == 1));

    send_frame(&mut stream, CLOSE, &1000u16.to_be_bytes());
    let (fin, payload) = read_frame_of(&mut stream, CLOSE);
    assert!(fin);
    assert_eq!(payload.len(), 2);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1000);

    // Both sides exchanged Close: the transport goes away and the
    // connection leaves the registry
    assert!(wait_until(2_000, || server.registry().len() == 0));

    server.shutdown(1_000);
}

#[test]
fn interleaved_control_frame_during_fragments() {
    let (server, addr) = start_echo_server(test_config());
    let mut stream = ws_connect(addr);

    let mask = [9, 9, 9, 9];
    send_frame_raw(&mut stream, false, TEXT, b"first ", mask);
    // Control frames may interleave with a fragmented message
    send_frame(&mut stream, PING, b"mid");
    let (_, pong) = read_frame_of(&mut stream, PONG);
    assert_eq!(&pong, b"mid");

    send_frame_raw(&mut stream, true, 0x0, b"second", mask);
    let (_, text) = read_frame_of(&mut stream, TEXT);
    assert_eq!(&text, b"first second");

    server.shutdown(1_000);
}

#[test]
fn data_frame_during_fragment_closes_with_protocol_error() {
    let (server, addr) = start_echo_server(test_config());
    let mut stream = ws_connect(addr);

    let mask = [1, 2, 3, 4];
    send_frame_raw(&mut stream, false, TEXT, b"frag", mask);
    // A fresh data frame mid-message is a protocol violation
    send_frame(&mut stream, TEXT, b"illegal");

    let (_, payload) = read_frame_of(&mut stream, CLOSE);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1002);

    server.shutdown(1_000);
}

#[test]
fn unmasked_client_frame_is_rejected() {
    let (server, addr) = start_echo_server(test_config());
    let mut stream = ws_connect(addr);

    // Unmasked client text frame
    stream.write_all(&[0x81, 0x03, b'a', b'b', b'c']).unwrap();

    let (_, payload) = read_frame_of(&mut stream, CLOSE);
    assert_eq!(u16::from_be_bytes([payload[0], payload[1]]), 1002);
    assert!(wait_until(2_000, || server.registry().len() == 0));

    server.shutdown(1_000);
}

#[test]
fn broadcast_reaches_every_connection_once() {
    let (server, addr) = start_echo_server(test_config());
    let mut clients = vec![ws_connect(addr), ws_connect(addr), ws_connect(addr)];

    assert!(wait_until(1_000, || server.registry().len() == 3));

    let sent = server.broadcast("ping", &[], 1_000);
    assert_eq!(sent, 3);

    for stream in &mut clients {
        let (fin, payload) = read_frame_of(stream, TEXT);
        assert!(fin);
        assert_eq!(&payload, b"ping");
    }

    // Targeted broadcast with duplicated handles sends one copy each
    let handles: Vec<_> = server
        .registry()
        .snapshot()
        .iter()
        .map(|c| c.handle())
        .collect();
    let targets = vec![handles[0], handles[0], handles[1], handles[0]];
    let sent = server.broadcast("again", &targets, 1_000);
    assert_eq!(sent, 2);

    let (_, payload) = read_frame_of(&mut clients[0], TEXT);
    assert_eq!(&payload, b"again");
    expect_silence(&mut clients[0], 150);
    let (_, payload) = read_frame_of(&mut clients[1], TEXT);
    assert_eq!(&payload, b"again");
    expect_silence(&mut clients[2], 150);

    server.shutdown(1_000);
}

#[test]
fn queued_sends_are_gathered_by_the_writer_thread() {
    let (server, addr) = start_echo_server(test_config());
    let mut stream = ws_connect(addr);

    assert!(wait_until(1_000, || server.registry().len() == 1));
    let handle = server.registry().snapshot()[0].handle();

    assert!(server.send(handle, "one"));
    assert!(server.send(handle, "two"));
    assert!(server.send(handle, "three"));

    let mut received = Vec::new();
    for _ in 0..3 {
        let (_, payload) = read_frame_of(&mut stream, TEXT);
        received.push(String::from_utf8(payload).unwrap());
    }
    assert_eq!(received, ["one", "two", "three"]);

    server.shutdown(1_000);
}

#[test]
fn idle_heartbeat_pings_within_three_delays() {
    let config = riptide_ws::Config::builder()
        .thread_pool_count(2)
        .poll_timeout_ms(200)
        .heartbeat_delay_ms(100)
        .build();
    let (server, addr) = start_echo_server(config);
    let mut stream = ws_connect(addr);

    // Send no traffic; within 300 ms the server must have pinged
    let start = std::time::Instant::now();
    let (fin, _payload) = read_frame_of(&mut stream, PING);
    assert!(fin);
    assert!(
        start.elapsed() <= std::time::Duration::from_millis(300),
        "first ping took {:?}",
        start.elapsed()
    );

    server.shutdown(1_000);
}

#[test]
fn unanswered_heartbeats_drop_the_connection() {
    let config = riptide_ws::Config::builder()
        .thread_pool_count(2)
        .poll_timeout_ms(200)
        .heartbeat_delay_ms(100)
        .disconnect_after_invalid_heartbeat_count(2)
        .build();
    let (server, addr) = start_echo_server(config);
    let _stream = ws_connect(addr);

    assert!(wait_until(1_000, || server.registry().len() == 1));
    // Never answer the pings; the connection must be dropped after the
    // second unanswered heartbeat
    assert!(wait_until(3_000, || server.registry().len() == 0));

    server.shutdown(1_000);
}

#[test]
fn subprotocol_negotiation_end_to_end() {
    let mut protocols = riptide_ws::ProtocolRegistry::new();
    protocols.register(std::sync::Arc::new(EchoProto("chat.v1")));
    let server = riptide_ws::Server::bind("127.0.0.1:0", test_config(), protocols, None).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();

    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(std::time::Duration::from_secs(3)))
        .unwrap();
    let head = request_upgrade(&mut stream, "Sec-WebSocket-Protocol: other, chat.v1\r\n");
    assert!(head.starts_with("HTTP/1.1 101"), "got: {}", head);
    assert!(head.contains("Sec-WebSocket-Protocol: chat.v1\r\n"));

    // A client offering nothing the server knows is refused: no unnamed
    // default protocol is registered here
    let mut stream2 = std::net::TcpStream::connect(addr).unwrap();
    stream2
        .set_read_timeout(Some(std::time::Duration::from_secs(3)))
        .unwrap();
    let head = request_upgrade(&mut stream2, "Sec-WebSocket-Protocol: unknown\r\n");
    assert!(head.starts_with("HTTP/1.1 400"), "got: {}", head);

    server.shutdown(1_000);
}

#[test]
fn handles_are_strictly_increasing_across_accepts() {
    let (server, addr) = start_echo_server(test_config());

    let mut last = 0u32;
    for _ in 0..5 {
        let _stream = ws_connect(addr);
        assert!(wait_until(1_000, || !server.registry().snapshot().is_empty()));
        let max = server
            .registry()
            .snapshot()
            .iter()
            .map(|c| c.handle().value())
            .max()
            .unwrap();
        assert!(max > last);
        last = max;
    }

    server.shutdown(1_000);
}
