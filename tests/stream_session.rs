// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Streaming session tests over loopback TCP.

use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use videostreamer_link::codec;
use videostreamer_link::error::ErrorKind;
use videostreamer_link::stream::ConnectOutcome;
use videostreamer_link::{ConnectError, StreamingSession};

const TIMEOUT: Duration = Duration::from_secs(2);

async fn listener() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port().to_string();
    (listener, port)
}

#[tokio::test]
async fn test_frame_reaches_peer_intact() {
    let (listener, port) = listener().await;
    let session = StreamingSession::new();

    let outcome = session.connect("127.0.0.1", &port, TIMEOUT).await.unwrap();
    assert_eq!(outcome, ConnectOutcome::Connected);
    assert!(session.is_connected());
    let (mut peer, _) = listener.accept().await.unwrap();

    session.send(vec![
        0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00, 0x03, 0x00, 0x00, 0x00, 0x01, 0xFF,
    ]);

    let mut received = [0u8; 13];
    tokio::time::timeout(TIMEOUT, peer.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received.to_vec(), codec::encode(2, 3, &[0xFF]).unwrap());

    let mut state = session.watch();
    tokio::time::timeout(TIMEOUT, state.wait_for(|s| s.frames_sent == 1))
        .await
        .unwrap()
        .unwrap();

    session.close().await;
}

#[tokio::test]
async fn test_latest_frame_wins() {
    let (listener, port) = listener().await;
    let session = StreamingSession::new();
    session.connect("127.0.0.1", &port, TIMEOUT).await.unwrap();

    // No await between the sends, so the sender loop has not dequeued yet.
    session.send(vec![0xA1; 4]);
    session.send(vec![0xB2; 4]);
    session.send(vec![0xC3; 4]);
    assert_eq!(session.state().frames_superseded, 2);

    let (mut peer, _) = listener.accept().await.unwrap();
    let mut first = [0u8; 4];
    tokio::time::timeout(TIMEOUT, peer.read_exact(&mut first))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, [0xC3; 4]);

    session.close().await;
    let mut rest = Vec::new();
    tokio::time::timeout(TIMEOUT, peer.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
    assert_eq!(session.state().frames_sent, 1);
}

#[tokio::test]
async fn test_send_frame_encodes() {
    let (listener, port) = listener().await;
    let session = StreamingSession::new();
    session.connect("127.0.0.1", &port, TIMEOUT).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    session.send_frame(640, 480, b"jpeg");

    let mut received = vec![0u8; codec::HEADER_LEN + 4];
    tokio::time::timeout(TIMEOUT, peer.read_exact(&mut received))
        .await
        .unwrap()
        .unwrap();
    let message = codec::decode(&received).unwrap();
    assert_eq!(message.width, 640);
    assert_eq!(message.height, 480);
    assert_eq!(message.payload, b"jpeg".to_vec());

    session.close().await;
}

#[tokio::test]
async fn test_close_twice() {
    let (listener, port) = listener().await;
    let session = StreamingSession::new();
    session.connect("127.0.0.1", &port, TIMEOUT).await.unwrap();
    let (_peer, _) = listener.accept().await.unwrap();

    session.close().await;
    session.close().await;

    let state = session.state();
    assert!(!state.connected);
    assert!(state.last_error.is_none());
    assert!(session.inbound_values().is_none());
}

#[tokio::test]
async fn test_reconnect_after_close() {
    let (listener, port) = listener().await;
    let session = StreamingSession::new();

    session.connect("127.0.0.1", &port, TIMEOUT).await.unwrap();
    session.close().await;
    assert!(!session.is_connected());

    let outcome = session.connect("127.0.0.1", &port, TIMEOUT).await.unwrap();
    assert_eq!(outcome, ConnectOutcome::Connected);
    assert!(session.is_connected());
    drop(listener);
    session.close().await;
}

#[tokio::test]
async fn test_inbound_values_in_order() {
    let (listener, port) = listener().await;
    let session = StreamingSession::new();
    session.connect("127.0.0.1", &port, TIMEOUT).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    let mut values = session.inbound_values().unwrap();
    peer.write_all(&[5, 0, 1]).await.unwrap();

    for expected in [5u8, 0, 1] {
        let value = tokio::time::timeout(TIMEOUT, values.next_value())
            .await
            .unwrap();
        assert_eq!(value, Some(expected));
    }

    // Remote close ends the sequence and the session without an error.
    drop(peer);
    let end = tokio::time::timeout(TIMEOUT, values.next_value())
        .await
        .unwrap();
    assert_eq!(end, None);

    let mut state = session.watch();
    tokio::time::timeout(TIMEOUT, state.wait_for(|s| !s.connected))
        .await
        .unwrap()
        .unwrap();
    assert!(session.state().last_error.is_none());
}

#[tokio::test]
async fn test_unconsumed_values_are_dropped() {
    let (listener, port) = listener().await;
    let session = StreamingSession::new();
    session.connect("127.0.0.1", &port, TIMEOUT).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    peer.write_all(&[9]).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut values = session.inbound_values().unwrap();
    peer.write_all(&[7]).await.unwrap();
    let value = tokio::time::timeout(TIMEOUT, values.next_value())
        .await
        .unwrap();
    assert_eq!(value, Some(7));

    session.close().await;
}

#[tokio::test]
async fn test_peer_reset_records_io_error() {
    let (listener, port) = listener().await;
    let session = StreamingSession::new();
    session.connect("127.0.0.1", &port, TIMEOUT).await.unwrap();
    let (peer, _) = listener.accept().await.unwrap();

    // Zero linger makes the close send RST instead of FIN.
    peer.set_linger(Some(Duration::ZERO)).unwrap();
    drop(peer);

    let mut state = session.watch();
    tokio::time::timeout(TIMEOUT, state.wait_for(|s| !s.connected))
        .await
        .unwrap()
        .unwrap();

    let error = session.state().last_error.clone().unwrap();
    assert_eq!(error.kind, ErrorKind::Io);
    assert!(!session.is_connected());

    // The session can be reopened after a transport failure.
    let outcome = session.connect("127.0.0.1", &port, TIMEOUT).await.unwrap();
    assert_eq!(outcome, ConnectOutcome::Connected);
    assert!(session.state().last_error.is_none());
    session.close().await;
}

#[tokio::test]
async fn test_connect_timeout() {
    let socket = tokio::net::TcpSocket::new_v4().unwrap();
    socket.bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let addr = socket.local_addr().unwrap();
    let _listener = socket.listen(1).unwrap();

    // Never accepted: once the backlog is full further SYNs go unanswered.
    let mut fillers = Vec::new();
    for _ in 0..8 {
        if let Ok(Ok(stream)) = tokio::time::timeout(
            Duration::from_millis(100),
            tokio::net::TcpStream::connect(addr),
        )
        .await
        {
            fillers.push(stream);
        }
    }

    let session = StreamingSession::new();
    let limit = Duration::from_millis(200);
    let err = session
        .connect("127.0.0.1", &addr.port().to_string(), limit)
        .await
        .unwrap_err();

    assert_eq!(err, ConnectError::Timeout(limit));
    assert!(!session.is_connected());
    assert_eq!(
        session.state().last_error.as_ref().map(|e| e.kind),
        Some(ErrorKind::Timeout)
    );
}
