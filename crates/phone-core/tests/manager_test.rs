//! Phone manager wiring: network transitions, monitor and transport session

mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;

use common::{init_tracing, profile, wait_until, within, MockRouter, MockTransport};
use routerphone_core::config::TelephonyConfig;
use routerphone_core::connection::ConnectionType;
use routerphone_core::device::Device;
use routerphone_core::dialer::DialKind;
use routerphone_core::events::TelephonyEvent;
use routerphone_core::manager::{MONITOR_EVENT_NAME, TRANSPORT_EVENT_NAME};
use routerphone_core::monitor::MonitorState;
use routerphone_core::{PhoneManager, TelephonyError};

struct Fixture {
    manager: PhoneManager,
    transport: Arc<MockTransport>,
    router: Arc<MockRouter>,
    listener: TcpListener,
}

async fn fixture(transport: MockTransport) -> Fixture {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let config = TelephonyConfig::new()
        .with_monitor_port(port)
        .with_reconnect_delay(Duration::from_millis(20))
        .with_profile(profile());

    let transport = Arc::new(transport);
    let router = Arc::new(MockRouter::default());
    let manager = PhoneManager::new(config, transport.clone(), router.clone()).unwrap();

    Fixture {
        manager,
        transport,
        router,
        listener,
    }
}

#[tokio::test]
async fn test_online_connects_transport_and_monitor() {
    let fixture = fixture(MockTransport::new()).await;
    let manager = &fixture.manager;

    manager.start().await;
    assert_eq!(
        manager.bus().registered_names(),
        vec![TRANSPORT_EVENT_NAME.to_string(), MONITOR_EVENT_NAME.to_string()]
    );
    assert_eq!(fixture.transport.opens.load(Ordering::SeqCst), 0);

    within(manager.set_online(true)).await;
    assert!(manager.is_online());
    assert_eq!(fixture.transport.opens.load(Ordering::SeqCst), 1);
    assert_eq!(manager.monitor().state(), MonitorState::Connected);
    assert_eq!(manager.profiles().active().map(|p| p.name.clone()), Some("home".to_string()));

    let (mut socket, _) = within(fixture.listener.accept()).await.unwrap();
    socket.write_all(b"20:01:02;RING;7;0176555;030999;SIP0;\n").await.unwrap();

    let registry = manager.registry().clone();
    assert!(wait_until(Duration::from_secs(2), || registry.find_by_id(7).is_some()).await);
    let connection = registry.find_by_id(7).unwrap();
    assert_eq!(connection.kind(), ConnectionType::INCOMING);
    assert_eq!(connection.device(), Device::Fax);

    within(manager.set_online(false)).await;
    assert!(!manager.is_online());
    assert_eq!(fixture.transport.closes.load(Ordering::SeqCst), 1);
    assert_eq!(manager.monitor().state(), MonitorState::Disconnected);
    assert!(manager.profiles().active().is_none());

    within(manager.shutdown()).await;
    assert!(manager.bus().registered_names().is_empty());
}

#[tokio::test]
async fn test_monitor_peer_close_clears_bus_connection() {
    let fixture = fixture(MockTransport::new()).await;
    let manager = &fixture.manager;

    manager.start().await;
    within(manager.set_online(true)).await;

    let registrations = manager.registrations();
    let (transport_id, monitor_id) = (registrations[0], registrations[1]);
    assert_eq!(manager.bus().is_connected(monitor_id), Some(true));

    let (socket, _) = within(fixture.listener.accept()).await.unwrap();
    drop(socket);

    let monitor = manager.monitor().clone();
    assert!(wait_until(Duration::from_secs(2), || monitor.state() == MonitorState::Disconnected).await);
    assert_eq!(manager.bus().is_connected(monitor_id), Some(false));
    assert_eq!(manager.bus().is_connected(transport_id), Some(true));

    within(manager.reconnect()).await;
    assert_eq!(manager.bus().is_connected(monitor_id), Some(true));
}

#[tokio::test]
async fn test_transport_open_failure_enables_port() {
    let fixture = fixture(MockTransport::failing_opens(1)).await;
    let manager = &fixture.manager;

    manager.start().await;
    within(manager.set_online(true)).await;

    assert_eq!(fixture.transport.opens.load(Ordering::SeqCst), 2);
    assert_eq!(fixture.router.dialed(), vec!["#96*3*".to_string()]);
}

#[tokio::test]
async fn test_dial_requires_active_profile() {
    let fixture = fixture(MockTransport::new()).await;

    let result = fixture.manager.dial("0401234", false, DialKind::Phone).await;
    assert_eq!(result.unwrap_err(), TelephonyError::NoActiveProfile);
}

#[tokio::test]
async fn test_dial_and_hangup_through_manager() {
    let fixture = fixture(MockTransport::new()).await;
    let manager = &fixture.manager;
    let mut rx = manager.subscribe();

    manager.start().await;
    within(manager.set_online(true)).await;

    let connection = within(manager.dial("0401234", false, DialKind::Phone)).await.unwrap();
    assert!(manager.registry().find_by_bearer_id(connection.id()).is_some());

    within(manager.hangup(&connection)).await.unwrap();
    let registry = manager.registry().clone();
    let id = connection.id();
    assert!(wait_until(Duration::from_secs(2), || registry.find_by_bearer_id(id).is_none()).await);

    let mut online_events = 0;
    while let Ok(event) = rx.try_recv() {
        if let TelephonyEvent::NetworkStateChanged { online: true } = event {
            online_events += 1;
        }
    }
    assert_eq!(online_events, 1);
}

#[tokio::test]
async fn test_reconnect_reopens_transport() {
    let fixture = fixture(MockTransport::new()).await;
    let manager = &fixture.manager;

    manager.start().await;
    within(manager.set_online(true)).await;
    within(manager.reconnect()).await;

    assert!(manager.is_online());
    assert_eq!(fixture.transport.opens.load(Ordering::SeqCst), 2);
    assert_eq!(fixture.transport.closes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = TelephonyConfig::new().with_fax_chunk_size(0);
    let result = PhoneManager::new(config, Arc::new(MockTransport::new()), Arc::new(MockRouter::default()));
    assert!(matches!(result, Err(TelephonyError::InvalidConfiguration { .. })));
}
