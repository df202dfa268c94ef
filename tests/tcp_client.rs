//! Integration tests driving the client against a scripted TCP server
//!
//! Each test binds a listener on an ephemeral port and plays the server
//! side of the exchange byte-for-byte, so framing, correlation, timeout,
//! and reconnection behavior are exercised over a real socket.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::sleep;

use modbus_link::{ClientConfig, LinkEvent, ModbusError, ModbusTcpClient};

/// Read exactly one request frame, returning (transaction id, unit id, PDU)
async fn read_request(stream: &mut TcpStream) -> (u16, u8, Vec<u8>) {
    let mut header = [0u8; 7];
    stream.read_exact(&mut header).await.unwrap();
    let transaction_id = u16::from_be_bytes([header[0], header[1]]);
    assert_eq!(u16::from_be_bytes([header[2], header[3]]), 0, "protocol id");
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    let unit_id = header[6];

    let mut pdu = vec![0u8; length - 1];
    stream.read_exact(&mut pdu).await.unwrap();
    (transaction_id, unit_id, pdu)
}

/// Build a response frame around a PDU
fn response_frame(transaction_id: u16, unit_id: u8, pdu: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(7 + pdu.len());
    frame.extend_from_slice(&transaction_id.to_be_bytes());
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.extend_from_slice(&((pdu.len() + 1) as u16).to_be_bytes());
    frame.push(unit_id);
    frame.extend_from_slice(pdu);
    frame
}

/// Bind an ephemeral listener and a config pointing at it
async fn bind_server(timeout_ms: u64) -> (TcpListener, ClientConfig) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let config = ClientConfig {
        host: "127.0.0.1".to_string(),
        port,
        timeout_ms,
        reconnect: false,
        ..ClientConfig::default()
    };
    (listener, config)
}

#[tokio::test]
async fn test_read_coils_roundtrip() {
    let (listener, config) = bind_server(2000).await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (tid, unit, pdu) = read_request(&mut stream).await;

        // FC01, address 0x0000, quantity 0x000A
        assert_eq!(pdu, vec![0x01, 0x00, 0x00, 0x00, 0x0A]);
        assert_eq!(unit, 1);

        // Byte count 2, bits [0xFF, 0x03]: first 10 bits set
        stream
            .write_all(&response_frame(tid, unit, &[0x01, 0x02, 0xFF, 0x03]))
            .await
            .unwrap();
    });

    let client = ModbusTcpClient::new(config);
    client.connect().await.unwrap();

    let coils = client.read_coils(0, 10).await.unwrap();
    assert_eq!(coils, vec![true; 10]);
    assert_eq!(client.pending_requests(), 0);

    server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn test_read_holding_registers_roundtrip() {
    let (listener, config) = bind_server(2000).await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (tid, unit, pdu) = read_request(&mut stream).await;
        assert_eq!(pdu, vec![0x03, 0x00, 0x10, 0x00, 0x02]);

        stream
            .write_all(&response_frame(
                tid,
                unit,
                &[0x03, 0x04, 0x12, 0x34, 0xAB, 0xCD],
            ))
            .await
            .unwrap();
    });

    let client = ModbusTcpClient::new(config);
    client.connect().await.unwrap();

    let registers = client.read_holding_registers(0x0010, 2).await.unwrap();
    assert_eq!(registers, vec![0x1234, 0xABCD]);

    server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn test_write_single_coil_sentinel_and_echo() {
    let (listener, config) = bind_server(2000).await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (tid, unit, pdu) = read_request(&mut stream).await;

        // Value field must be the ON sentinel
        assert_eq!(pdu, vec![0x05, 0x00, 0x05, 0xFF, 0x00]);

        // Device echoes the request
        stream
            .write_all(&response_frame(tid, unit, &pdu))
            .await
            .unwrap();
    });

    let client = ModbusTcpClient::new(config);
    client.connect().await.unwrap();

    let value = client.write_single_coil(5, true).await.unwrap();
    assert!(value);

    server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn test_write_multiple_registers_echo() {
    let (listener, config) = bind_server(2000).await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (tid, unit, pdu) = read_request(&mut stream).await;
        assert_eq!(
            pdu,
            vec![0x10, 0x00, 0x01, 0x00, 0x02, 0x04, 0x00, 0x0A, 0x01, 0x02]
        );

        stream
            .write_all(&response_frame(tid, unit, &[0x10, 0x00, 0x01, 0x00, 0x02]))
            .await
            .unwrap();
    });

    let client = ModbusTcpClient::new(config);
    client.connect().await.unwrap();

    let written = client
        .write_multiple_registers(1, &[0x000A, 0x0102])
        .await
        .unwrap();
    assert_eq!(written, 2);

    server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn test_concurrent_requests_resolve_out_of_order() {
    let (listener, config) = bind_server(2000).await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();

        let first = read_request(&mut stream).await;
        let second = read_request(&mut stream).await;

        // Answer in reverse submission order; correlation must still route
        // each response to the right caller.
        let respond = |&(tid, unit, ref pdu): &(u16, u8, Vec<u8>)| match pdu[0] {
            0x03 => response_frame(tid, unit, &[0x03, 0x02, 0x00, 0x2A]),
            0x01 => response_frame(tid, unit, &[0x01, 0x01, 0x55]),
            other => panic!("Unexpected function code {other:#04X}"),
        };

        stream.write_all(&respond(&second)).await.unwrap();
        stream.write_all(&respond(&first)).await.unwrap();
    });

    let client = ModbusTcpClient::new(config);
    client.connect().await.unwrap();

    let (registers, coils) = tokio::join!(
        client.read_holding_registers(0, 1),
        client.read_coils(0, 8)
    );
    assert_eq!(registers.unwrap(), vec![42]);
    assert_eq!(coils.unwrap(), vec![true, false, true, false, true, false, true, false]);
    assert_eq!(client.pending_requests(), 0);

    server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn test_response_split_across_many_reads() {
    let (listener, config) = bind_server(2000).await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (tid, unit, _pdu) = read_request(&mut stream).await;

        // Dribble the response out a few bytes at a time
        let response = response_frame(tid, unit, &[0x03, 0x04, 0x00, 0x01, 0x00, 0x02]);
        for piece in response.chunks(3) {
            stream.write_all(piece).await.unwrap();
            stream.flush().await.unwrap();
            sleep(Duration::from_millis(20)).await;
        }
    });

    let client = ModbusTcpClient::new(config);
    client.connect().await.unwrap();

    let registers = client.read_holding_registers(0, 2).await.unwrap();
    assert_eq!(registers, vec![1, 2]);

    server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn test_merged_responses_in_one_write() {
    let (listener, config) = bind_server(2000).await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let first = read_request(&mut stream).await;
        let second = read_request(&mut stream).await;

        // Both responses concatenated into a single TCP segment
        let mut merged = response_frame(first.0, first.1, &[0x03, 0x02, 0x00, 0x07]);
        merged.extend_from_slice(&response_frame(
            second.0,
            second.1,
            &[0x03, 0x02, 0x00, 0x09],
        ));
        stream.write_all(&merged).await.unwrap();
    });

    let client = ModbusTcpClient::new(config);
    client.connect().await.unwrap();

    let (a, b) = tokio::join!(
        client.read_holding_registers(0, 1),
        client.read_holding_registers(1, 1)
    );
    assert_eq!(a.unwrap(), vec![7]);
    assert_eq!(b.unwrap(), vec![9]);

    server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn test_modbus_exception_rejects_caller() {
    let (listener, config) = bind_server(2000).await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (tid, unit, _pdu) = read_request(&mut stream).await;

        // FC03 | 0x80 with exception code 2 (illegal data address)
        stream
            .write_all(&response_frame(tid, unit, &[0x83, 0x02]))
            .await
            .unwrap();
    });

    let client = ModbusTcpClient::new(config);
    client.connect().await.unwrap();

    let err = client.read_holding_registers(0, 1).await.unwrap_err();
    assert_eq!(err, ModbusError::Exception { code: 2 });
    assert!(err.to_string().contains("Illegal Data Address"));
    assert_eq!(client.pending_requests(), 0);

    server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn test_timeout_removes_entry_and_late_response_is_discarded() {
    let (listener, config) = bind_server(300).await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let first = read_request(&mut stream).await;

        // Miss the deadline, then answer anyway
        sleep(Duration::from_millis(600)).await;
        stream
            .write_all(&response_frame(first.0, first.1, &[0x03, 0x02, 0x11, 0x11]))
            .await
            .unwrap();

        // The connection must still be usable for the next request
        let second = read_request(&mut stream).await;
        stream
            .write_all(&response_frame(second.0, second.1, &[0x03, 0x02, 0x22, 0x22]))
            .await
            .unwrap();
    });

    let client = ModbusTcpClient::new(config);
    client.connect().await.unwrap();

    let err = client.read_holding_registers(0, 1).await.unwrap_err();
    assert_eq!(err, ModbusError::Timeout(300));
    assert_eq!(client.pending_requests(), 0);

    // Let the stale response arrive; it has no pending entry and vanishes
    sleep(Duration::from_millis(400)).await;
    assert_eq!(client.pending_requests(), 0);
    assert!(client.is_connected());

    let registers = client.read_holding_registers(0, 1).await.unwrap();
    assert_eq!(registers, vec![0x2222]);

    server.await.unwrap();
    client.disconnect().await;
}

#[tokio::test]
async fn test_disconnect_rejects_all_outstanding() {
    let (listener, config) = bind_server(10_000).await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let _ = read_request(&mut stream).await;
        let _ = read_request(&mut stream).await;
        // Never respond; hold the socket open until the client hangs up
        let mut sink = [0u8; 16];
        let _ = stream.read(&mut sink).await;
    });

    let client = ModbusTcpClient::new(config);
    client.connect().await.unwrap();

    let reader = {
        let client = client.clone();
        tokio::spawn(async move { client.read_holding_registers(0, 1).await })
    };
    let writer = {
        let client = client.clone();
        tokio::spawn(async move { client.write_single_coil(3, true).await })
    };

    // Wait until both requests are on the wire
    let mut waited = 0;
    while client.pending_requests() < 2 && waited < 100 {
        sleep(Duration::from_millis(10)).await;
        waited += 1;
    }
    assert_eq!(client.pending_requests(), 2);

    client.disconnect().await;

    assert_eq!(
        reader.await.unwrap().unwrap_err(),
        ModbusError::ConnectionClosed
    );
    assert_eq!(
        writer.await.unwrap().unwrap_err(),
        ModbusError::ConnectionClosed
    );
    assert_eq!(client.pending_requests(), 0);
    assert!(!client.is_connected());

    server.await.unwrap();
}

#[tokio::test]
async fn test_requests_after_disconnect_fail_fast() {
    let (listener, config) = bind_server(2000).await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut sink = [0u8; 16];
        let _ = stream.read(&mut sink).await;
    });

    let client = ModbusTcpClient::new(config);
    client.connect().await.unwrap();
    client.disconnect().await;

    assert_eq!(
        client.read_coils(0, 1).await.unwrap_err(),
        ModbusError::NotConnected
    );

    server.await.unwrap();
}

#[tokio::test]
async fn test_lifecycle_events_and_automatic_reconnect() {
    let (listener, mut config) = bind_server(2000).await;
    config.reconnect = true;
    config.reconnect_interval_ms = 100;

    let server = tokio::spawn(async move {
        // First connection: accept and immediately drop
        let (stream, _) = listener.accept().await.unwrap();
        drop(stream);

        // Second connection: serve one read
        let (mut stream, _) = listener.accept().await.unwrap();
        let (tid, unit, _pdu) = read_request(&mut stream).await;
        stream
            .write_all(&response_frame(tid, unit, &[0x03, 0x02, 0x00, 0x2A]))
            .await
            .unwrap();

        let mut sink = [0u8; 16];
        let _ = stream.read(&mut sink).await;
    });

    let client = ModbusTcpClient::new(config);
    let mut events = client.subscribe();

    client.connect().await.unwrap();
    assert_eq!(events.recv().await.unwrap(), LinkEvent::Connected);

    // The peer drops us; the engine notices, notifies, and self-heals
    assert_eq!(events.recv().await.unwrap(), LinkEvent::Disconnected);
    assert_eq!(events.recv().await.unwrap(), LinkEvent::Connected);
    assert!(client.is_connected());

    let registers = client.read_holding_registers(0, 1).await.unwrap();
    assert_eq!(registers, vec![42]);

    client.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_connect_when_connected_is_immediate() {
    let (listener, config) = bind_server(2000).await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut sink = [0u8; 16];
        let _ = stream.read(&mut sink).await;
    });

    let client = ModbusTcpClient::new(config);
    client.connect().await.unwrap();
    client.connect().await.unwrap();
    assert!(client.is_connected());

    client.disconnect().await;
    server.await.unwrap();
}

#[tokio::test]
async fn test_unobserved_lifecycle_channel_is_harmless() {
    // No subscriber ever attaches; connect failure must surface only to the
    // caller, never escalate.
    let config = ClientConfig {
        host: "127.0.0.1".to_string(),
        port: 1,
        timeout_ms: 1000,
        reconnect: false,
        ..ClientConfig::default()
    };
    let client = ModbusTcpClient::new(config);

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, ModbusError::Connection(_)));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn test_transaction_ids_increment_across_requests() {
    let (listener, config) = bind_server(2000).await;

    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut seen = Vec::new();
        for _ in 0..3 {
            let (tid, unit, _pdu) = read_request(&mut stream).await;
            seen.push(tid);
            stream
                .write_all(&response_frame(tid, unit, &[0x03, 0x02, 0x00, 0x00]))
                .await
                .unwrap();
        }
        seen
    });

    let client = ModbusTcpClient::new(config);
    client.connect().await.unwrap();

    for _ in 0..3 {
        client.read_holding_registers(0, 1).await.unwrap();
    }
    client.disconnect().await;

    let seen = server.await.unwrap();
    assert_eq!(seen, vec![1, 2, 3]);
}
