//! Call monitor client against a local TCP listener standing in for the router

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use common::{init_tracing, profile, wait_until, within, MockRouter};
use routerphone_core::connection::{ConnectionRegistry, ConnectionType};
use routerphone_core::events::{EventEmitter, TelephonyEvent};
use routerphone_core::monitor::{CallMonitorClient, CallMonitorConfig, MonitorState};
use routerphone_core::profile::{Profile, ProfileManager};
use routerphone_core::router::{DialPort, RouterControl};
use routerphone_core::TelephonyResult;

fn config(port: u16) -> CallMonitorConfig {
    CallMonitorConfig {
        port,
        reconnect_delay: Duration::from_millis(20),
        ..Default::default()
    }
}

fn active_profiles() -> Arc<ProfileManager> {
    let profiles = Arc::new(ProfileManager::new(vec![profile()]));
    profiles.set_active(profiles.detect());
    profiles
}

async fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

#[tokio::test]
async fn test_lines_drive_the_registry() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let registry = Arc::new(ConnectionRegistry::new());
    let events = EventEmitter::new(64);
    let mut rx = events.subscribe();
    let client = CallMonitorClient::new(
        config(port),
        active_profiles(),
        registry.clone(),
        events,
        Arc::new(MockRouter::default()),
    );

    within(client.connect()).await.unwrap();
    assert_eq!(client.state(), MonitorState::Connected);

    let (mut socket, _) = within(listener.accept()).await.unwrap();

    // Two lines in one write, then one line split across writes
    socket
        .write_all(b"20:01:02;RING;7;0176555;030123;SIP0;\n20:01:03;CALL;8;10;030999;0401234;SIP0;\n")
        .await
        .unwrap();
    socket.write_all(b"20:01:09;CONN").await.unwrap();
    socket.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    socket.write_all(b"ECT;7;10;0176555;\r\nnot a line\n").await.unwrap();

    assert!(wait_until(Duration::from_secs(2), || client.stats().lines() == 3).await);

    let ring = registry.find_by_id(7).unwrap();
    assert_eq!(ring.kind(), ConnectionType::INCOMING | ConnectionType::CONNECT);
    assert_eq!(ring.local_number(), "030123");
    assert_eq!(ring.remote_number(), "0176555");

    let call = registry.find_by_id(8).unwrap();
    assert_eq!(call.kind(), ConnectionType::OUTGOING);
    assert_eq!(call.local_number(), "030999");
    assert_eq!(call.remote_number(), "0401234");
    assert_eq!(client.stats().dropped(), 1);

    socket.write_all(b"20:02:00;DISCONNECT;7;51;\n").await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || registry.find_by_id(7).is_none()).await);
    assert_eq!(registry.len(), 1);

    let mut incoming = 0;
    let mut disconnects = 0;
    while let Ok(event) = rx.try_recv() {
        match event {
            TelephonyEvent::ConnectionIncoming { connection } => {
                assert_eq!(connection.id, 7);
                incoming += 1;
            }
            TelephonyEvent::ConnectionDisconnect { connection } => {
                assert!(connection.kind.contains(ConnectionType::DISCONNECT));
                disconnects += 1;
            }
            _ => {}
        }
    }
    assert_eq!(incoming, 1);
    assert_eq!(disconnects, 1);

    client.disconnect().await;
    assert_eq!(client.state(), MonitorState::Disconnected);
}

#[tokio::test]
async fn test_peer_close_reports_disconnected() {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let events = EventEmitter::new(64);
    let mut rx = events.subscribe();
    let client = CallMonitorClient::new(
        config(port),
        active_profiles(),
        Arc::new(ConnectionRegistry::new()),
        events,
        Arc::new(MockRouter::default()),
    );

    within(client.connect()).await.unwrap();
    let (socket, _) = within(listener.accept()).await.unwrap();
    drop(socket);

    assert!(wait_until(Duration::from_secs(2), || client.state() == MonitorState::Disconnected).await);

    let mut reason = None;
    while let Ok(event) = rx.try_recv() {
        if let TelephonyEvent::MonitorStateChanged {
            state: MonitorState::Disconnected,
            reason: r,
        } = event
        {
            reason = r;
        }
    }
    assert!(reason.is_some());
}

#[tokio::test]
async fn test_connect_failure_enables_port_and_retries_once() {
    init_tracing();
    let port = free_port().await;
    let router = Arc::new(MockRouter::default());

    let client = CallMonitorClient::new(
        config(port),
        active_profiles(),
        Arc::new(ConnectionRegistry::new()),
        EventEmitter::new(16),
        router.clone(),
    );

    let result = within(client.connect()).await;
    assert!(result.is_err());
    assert_eq!(router.dialed(), vec!["#96*5*".to_string()]);
    assert_eq!(client.state(), MonitorState::Disconnected);
}

/// Router that opens the monitor port when asked to enable it
struct EnablingRouter {
    port: u16,
    listener: Mutex<Option<TcpListener>>,
}

#[async_trait]
impl RouterControl for EnablingRouter {
    async fn dial_number(&self, _profile: &Profile, _port: DialPort, number: &str) -> TelephonyResult<()> {
        assert_eq!(number, "#96*5*");
        let listener = TcpListener::bind(("127.0.0.1", self.port)).await?;
        *self.listener.lock() = Some(listener);
        Ok(())
    }
}

#[tokio::test]
async fn test_second_attempt_succeeds_after_enable() {
    init_tracing();
    let port = free_port().await;
    let router = Arc::new(EnablingRouter {
        port,
        listener: Mutex::new(None),
    });

    let client = CallMonitorClient::new(
        config(port),
        active_profiles(),
        Arc::new(ConnectionRegistry::new()),
        EventEmitter::new(16),
        router.clone(),
    );

    within(client.connect()).await.unwrap();
    assert_eq!(client.state(), MonitorState::Connected);
    assert!(router.listener.lock().is_some());

    client.disconnect().await;
}
