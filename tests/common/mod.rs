//! Shared helpers for integration tests
#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

use chat_fusion_system::{
    ChatClient, ChatServer, ClientConfig, ClientEvent, ClientHandle, ServerConfig, ServerHandle,
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Start a server on an ephemeral port and drive it in the background
pub async fn start_server(name: &str) -> (ServerHandle, SocketAddr) {
    let config = ServerConfig::new(name, "127.0.0.1:0")
        .with_tick_interval(Duration::from_millis(50))
        .with_handshake_timeout(Duration::from_secs(10));
    let server = ChatServer::bind(config).await.expect("bind failed");
    let addr = server.local_addr();
    let handle = server.handle();
    tokio::spawn(server.run());
    (handle, addr)
}

/// Connect a client and complete registration
pub async fn connect_registered(
    addr: SocketAddr,
    name: &str,
) -> (ClientHandle, UnboundedReceiver<ClientEvent>) {
    let (client, handle, mut events) = ChatClient::connect(ClientConfig::new(addr.to_string()))
        .await
        .expect("connect failed");
    tokio::spawn(client.run());

    handle.register(name).expect("register command");
    let ev = wait_for(&mut events, |e| {
        matches!(
            e,
            ClientEvent::Registered { .. } | ClientEvent::RegistrationRefused { .. }
        )
    })
    .await;
    assert!(
        matches!(ev, ClientEvent::Registered { .. }),
        "registration of {:?} refused: {:?}",
        name,
        ev
    );
    (handle, events)
}

/// Receive events until one matches, or fail after the standard timeout
pub async fn wait_for(
    events: &mut UnboundedReceiver<ClientEvent>,
    pred: impl Fn(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let ev = events.recv().await.expect("event stream ended");
            if pred(&ev) {
                return ev;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

/// Poll the server's member list until it reaches the expected size
pub async fn wait_member_count(handle: &ServerHandle, expected: usize) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let members = handle.member_list().await.expect("member list");
        if members.len() == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "member list stuck at {:?}, wanted {} entries",
            members,
            expected
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until the named identity appears in the server's member list
pub async fn wait_member(handle: &ServerHandle, name: &str) {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let members = handle.member_list().await.expect("member list");
        if members.iter().any(|m| m.name == name) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "{:?} never appeared in {:?}",
            name,
            members
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
