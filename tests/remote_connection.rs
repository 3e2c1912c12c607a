//! Remote connection against an in-process server


use integration_harness::*;
use remotectl_agent::{ConnectionOptions, ConnectionState};
use remotectl_protocol::{
    AuthResultMessage, CommandRequestMessage, CommandResponseMessage, Envelope, MessageType,
    PROTOCOL_VERSION, wire_type,
};
use serde_json::json;
use std::time::Duration;

#[tokio::test]
async fn test_handshake_authenticates() {
    let socket = MockSocketServer::start().await;
    let (handler, _events) = RecordingHandler::new();
    let running = RunningConnection::start(
        credentials(&socket.url, "", vec![pinned_certificate("h1")]),
        handler,
    );

    let mut server = socket.accept().await;
    server.send_welcome("h1").await;
    let (envelope, auth) = server.expect_auth().await;

    assert_eq!(envelope.from, MACHINE_ID);
    assert_eq!(envelope.message_type, wire_type::AUTH);
    assert_eq!(auth.token, "jwt-1");
    assert_eq!(auth.protocol_version, PROTOCOL_VERSION);
    assert_eq!(auth.public_key_pem, client_keys().public_key_pem().unwrap());
    assert_eq!(running.state(), ConnectionState::WelcomeReceived);

    let reply = envelope.respond_with(&accepted(), Some(wire_type::AUTH)).unwrap();
    server.send_to_client(&reply).await;
    running.wait_for(ConnectionState::Authenticated).await;

    assert!(running.shutdown().await.is_ok());
}

#[tokio::test]
async fn test_command_round_trip() {
    let socket = MockSocketServer::start().await;
    let (handler, mut events) = RecordingHandler::new();
    let running = RunningConnection::start(
        credentials(&socket.url, "", vec![pinned_certificate("h1")]),
        handler,
    );

    let mut server = socket.accept().await;
    server.complete_handshake("h1", accepted()).await;
    running.wait_for(ConnectionState::Authenticated).await;

    let command = Envelope::new("server", MACHINE_ID, wire_type::COMMAND)
        .with_payload(&CommandRequestMessage::new("GET", "/api/v1/serverstate"))
        .unwrap();
    server.send_to_client(&command).await;

    let request = recv(&mut events.commands).await;
    assert_eq!(request.method, "GET");
    assert_eq!(request.path, "/api/v1/serverstate");

    let reply = server.next_envelope().await.unwrap();
    assert_eq!(reply.message_id, command.message_id);
    assert_eq!(reply.classify(), MessageType::Command);
    assert_eq!(reply.from, MACHINE_ID);
    let response: CommandResponseMessage = reply.payload_as().unwrap();
    assert_eq!(response.status_code, 200);
    assert_eq!(response.body_bytes().unwrap(), b"/api/v1/serverstate");

    // Client originated
    let sent = running
        .connection
        .send_command(&CommandRequestMessage::new("POST", "/api/v1/backups/1/start"))
        .await
        .unwrap();
    assert!(sent);

    let outbound = server.next_envelope().await.unwrap();
    assert_eq!(outbound.classify(), MessageType::Command);
    let request: CommandRequestMessage = outbound.payload_as().unwrap();
    assert_eq!(request.path, "/api/v1/backups/1/start");

    assert!(running.shutdown().await.is_ok());
}

#[tokio::test]
async fn test_untrusted_key_triggers_certificate_refresh() {
    let http = MockHttp::start().await;
    *http.state.certificates.lock() = vec![certificate_entry("h-new")];

    let socket = MockSocketServer::start().await;
    let (handler, mut events) = RecordingHandler::new();
    let running = RunningConnection::start(
        credentials(
            &socket.url,
            &http.url("/certificates"),
            vec![pinned_certificate("h-old")],
        ),
        handler,
    );

    let mut first = socket.accept().await;
    first.send_welcome("h-new").await;
    assert!(first.next_envelope().await.is_none());

    let rekey = recv(&mut events.rekeys).await;
    assert_eq!(rekey.server_certificates.len(), 1);
    assert_eq!(rekey.server_certificates[0].public_key_hash, "h-new");
    assert_eq!(rekey.jwt, "jwt-1");
    assert!(http.state.certificate_calls() >= 1);

    let mut second = socket.accept().await;
    second.complete_handshake("h-new", accepted()).await;
    running.wait_for(ConnectionState::Authenticated).await;
    assert_eq!(
        running.connection.credentials().server_certificates[0].public_key_hash,
        "h-new"
    );

    assert!(running.shutdown().await.is_ok());
}

#[tokio::test]
async fn test_certificate_refresh_skips_malformed_entries() {
    let http = MockHttp::start().await;
    *http.state.certificates.lock() = vec![
        certificate_entry("h-new"),
        json!({ "publicKeyHash": "broken" }),
        json!("not an object"),
    ];

    let socket = MockSocketServer::start().await;
    let (handler, mut events) = RecordingHandler::new();
    let running = RunningConnection::start(
        credentials(
            &socket.url,
            &http.url("/certificates"),
            vec![pinned_certificate("h-old")],
        ),
        handler,
    );

    let mut first = socket.accept().await;
    first.send_welcome("h-new").await;
    assert!(first.next_envelope().await.is_none());

    let rekey = recv(&mut events.rekeys).await;
    let hashes: Vec<_> = rekey
        .server_certificates
        .iter()
        .map(|cert| cert.public_key_hash.as_str())
        .collect();
    assert_eq!(hashes, vec!["h-new"]);

    let mut second = socket.accept().await;
    second.complete_handshake("h-new", accepted()).await;
    running.wait_for(ConnectionState::Authenticated).await;

    assert!(running.shutdown().await.is_ok());
}

#[tokio::test]
async fn test_silent_server_times_out() {
    let socket = MockSocketServer::start().await;
    let (handler, _events) = RecordingHandler::new();
    let options = ConnectionOptions {
        heartbeat_interval: Duration::from_millis(500),
        ..test_options()
    };
    let running = RunningConnection::start_with(
        credentials(&socket.url, "", vec![pinned_certificate("h1")]),
        handler,
        options,
    );

    let mut server = socket.accept().await;
    server.complete_handshake("h1", accepted()).await;
    running.wait_for(ConnectionState::Authenticated).await;

    // Pings keep arriving but nothing is answered; the agent gives up on the socket
    assert!(server.next_envelope().await.is_none());

    let mut server = socket.accept().await;
    server.complete_handshake("h1", accepted()).await;
    running.wait_for(ConnectionState::Authenticated).await;

    assert!(running.shutdown().await.is_ok());
}

#[tokio::test]
async fn test_token_rotation_rekeys() {
    let socket = MockSocketServer::start().await;
    let (handler, mut events) = RecordingHandler::new();
    let running = RunningConnection::start(
        credentials(&socket.url, "", vec![pinned_certificate("h1")]),
        handler,
    );

    let mut server = socket.accept().await;
    let rotation = AuthResultMessage {
        accepted: Some(true),
        will_replace_token: Some(true),
        new_token: Some("jwt-2".to_string()),
    };
    let auth = server.complete_handshake("h1", rotation).await;
    assert_eq!(auth.token, "jwt-1");

    let rekey = recv(&mut events.rekeys).await;
    assert_eq!(rekey.jwt, "jwt-2");
    assert!(rekey.local_encryption_key.is_none());
    running.wait_for(ConnectionState::Authenticated).await;

    // The next socket authenticates with the rotated token
    server.close().await;
    let mut server = socket.accept().await;
    let auth = server.complete_handshake("h1", accepted()).await;
    assert_eq!(auth.token, "jwt-2");
    running.wait_for(ConnectionState::Authenticated).await;

    assert!(running.shutdown().await.is_ok());
}

#[tokio::test]
async fn test_rejected_auth_reconnects() {
    let socket = MockSocketServer::start().await;
    let (handler, _events) = RecordingHandler::new();
    let running = RunningConnection::start(
        credentials(&socket.url, "", vec![pinned_certificate("h1")]),
        handler,
    );

    let mut server = socket.accept().await;
    server
        .complete_handshake("h1", AuthResultMessage::default())
        .await;
    assert!(server.next_envelope().await.is_none());

    let mut server = socket.accept().await;
    server.complete_handshake("h1", accepted()).await;
    running.wait_for(ConnectionState::Authenticated).await;

    assert!(running.shutdown().await.is_ok());
}

#[tokio::test]
async fn test_first_frame_must_be_welcome() {
    let socket = MockSocketServer::start().await;
    let (handler, mut events) = RecordingHandler::new();
    let running = RunningConnection::start(
        credentials(&socket.url, "", vec![pinned_certificate("h1")]),
        handler,
    );

    let mut server = socket.accept().await;
    let command = Envelope::new("server", MACHINE_ID, wire_type::COMMAND)
        .with_payload(&CommandRequestMessage::new("GET", "/api/v1/serverstate"))
        .unwrap();
    server.send_raw(&command.to_json()).await;
    assert!(server.next_envelope().await.is_none());
    assert!(events.commands.try_recv().is_err());

    // Recovers on the next socket
    let mut server = socket.accept().await;
    server.complete_handshake("h1", accepted()).await;
    running.wait_for(ConnectionState::Authenticated).await;

    assert!(running.shutdown().await.is_ok());
}

#[tokio::test]
async fn test_stop_closes_socket() {
    let socket = MockSocketServer::start().await;
    let (handler, _events) = RecordingHandler::new();
    let running = RunningConnection::start(
        credentials(&socket.url, "", vec![pinned_certificate("h1")]),
        handler,
    );

    let mut server = socket.accept().await;
    server.complete_handshake("h1", accepted()).await;
    running.wait_for(ConnectionState::Authenticated).await;

    running.connection.stop();
    assert!(server.next_envelope().await.is_none());

    let connection = running.connection.clone();
    assert!(running.join().await.is_ok());
    assert_eq!(connection.state(), ConnectionState::NotConnected);

    let sent = connection
        .send_command(&CommandRequestMessage::new("GET", "/api/v1/serverstate"))
        .await
        .unwrap();
    assert!(!sent);
}
