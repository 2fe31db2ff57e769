//! Shared fixtures: loopback transport, recording router, profiles

#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use routerphone_core::profile::{Profile, ProfileSettings};
use routerphone_core::router::{DialPort, RouterControl};
use routerphone_core::transport::{
    BearerConnection, BearerState, CallRequest, CallTransport, TransportListener,
};
use routerphone_core::{TelephonyError, TelephonyResult};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("routerphone_core=debug")
        .with_test_writer()
        .try_init();
}

pub fn settings() -> ProfileSettings {
    ProfileSettings {
        router_host: "127.0.0.1".to_string(),
        phone_number: "030123".to_string(),
        phone_numbers: vec!["030123".to_string()],
        fax_number: "030999".to_string(),
        fax_numbers: vec!["030999".to_string()],
        fax_ident: "+49 30 999".to_string(),
        fax_header: "Test Fax".to_string(),
        ..Default::default()
    }
}

pub fn profile() -> Profile {
    Profile::new("home", settings())
}

/// Poll `condition` until it holds or `timeout` passes
pub async fn wait_until<F: Fn() -> bool>(timeout: Duration, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), future)
        .await
        .expect("timed out")
}

/// Loopback call transport
///
/// Calls connect after a short delay, every chunk is acknowledged
/// asynchronously and a hangup disconnects the bearer.
pub struct MockTransport {
    next_id: AtomicU32,
    max_in_flight: usize,
    ack_delay: Duration,
    hangup_delay: Duration,
    connect: bool,
    drop_after_chunks: Option<usize>,
    fail_after_chunks: Option<usize>,
    open_failures: AtomicU32,

    listener: Mutex<Option<Arc<dyn TransportListener>>>,
    bearers: Mutex<Vec<Arc<BearerConnection>>>,

    pub calls: Mutex<Vec<CallRequest>>,
    pub chunks: Mutex<Vec<Bytes>>,
    pub opens: AtomicU32,
    pub closes: AtomicU32,
    pub hangups: AtomicU32,
    pub max_seen_in_flight: AtomicUsize,
    active: AtomicUsize,
    pub max_concurrent: AtomicUsize,
}

impl Default for MockTransport {
    fn default() -> Self {
        Self {
            next_id: AtomicU32::new(100),
            max_in_flight: 6,
            ack_delay: Duration::from_millis(2),
            hangup_delay: Duration::from_millis(50),
            connect: true,
            drop_after_chunks: None,
            fail_after_chunks: None,
            open_failures: AtomicU32::new(0),
            listener: Mutex::new(None),
            bearers: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            chunks: Mutex::new(Vec::new()),
            opens: AtomicU32::new(0),
            closes: AtomicU32::new(0),
            hangups: AtomicU32::new(0),
            max_seen_in_flight: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_concurrent: AtomicUsize::new(0),
        }
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop the bearer once `chunks` chunks were handed over
    pub fn dropping_after(chunks: usize) -> Self {
        Self {
            drop_after_chunks: Some(chunks),
            ..Self::default()
        }
    }

    /// Reject every chunk once `chunks` chunks were accepted
    pub fn failing_sends_after(chunks: usize) -> Self {
        Self {
            fail_after_chunks: Some(chunks),
            ..Self::default()
        }
    }

    /// Calls never reach the connected state
    pub fn unanswered() -> Self {
        Self {
            connect: false,
            ..Self::default()
        }
    }

    pub fn failing_opens(count: u32) -> Self {
        let transport = Self::default();
        transport.open_failures.store(count, Ordering::SeqCst);
        transport
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.lock().len()
    }

    pub fn sent_bytes(&self) -> Vec<u8> {
        self.chunks.lock().iter().flat_map(|c| c.iter().copied()).collect()
    }

    pub fn bearer(&self, id: u32) -> Option<Arc<BearerConnection>> {
        self.bearers.lock().iter().find(|b| b.id() == id).cloned()
    }

    fn listener(&self) -> Option<Arc<dyn TransportListener>> {
        self.listener.lock().clone()
    }

    async fn serialized_section(&self) {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent.fetch_max(active, Ordering::SeqCst);
        tokio::task::yield_now().await;
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CallTransport for MockTransport {
    async fn open(&self, _host: &str, _controller: u8, listener: Arc<dyn TransportListener>) -> TelephonyResult<()> {
        self.serialized_section().await;
        self.opens.fetch_add(1, Ordering::SeqCst);

        let remaining = self.open_failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.open_failures.store(remaining - 1, Ordering::SeqCst);
            return Err(TelephonyError::transport_failed("port closed"));
        }

        *self.listener.lock() = Some(listener);
        Ok(())
    }

    async fn close(&self) -> TelephonyResult<()> {
        self.serialized_section().await;
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.listener.lock().take();
        Ok(())
    }

    async fn call(&self, request: &CallRequest) -> TelephonyResult<Arc<BearerConnection>> {
        self.serialized_section().await;
        self.calls.lock().push(request.clone());

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let bearer = Arc::new(BearerConnection::new(
            id,
            request.source.clone(),
            request.target.clone(),
            self.max_in_flight,
        ));
        bearer.set_state(BearerState::Connecting);
        self.bearers.lock().push(bearer.clone());

        let connect = self.connect;
        let listener = self.listener();
        let task_bearer = bearer.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            if connect {
                task_bearer.set_state(BearerState::Connected);
                if let Some(listener) = listener {
                    listener.established(&task_bearer);
                }
            } else {
                task_bearer.set_state(BearerState::Disconnected);
                if let Some(listener) = listener {
                    listener.terminated(&task_bearer);
                }
            }
        });

        Ok(bearer)
    }

    async fn send_data(&self, bearer: &BearerConnection, data: Bytes) -> TelephonyResult<()> {
        self.serialized_section().await;

        if !bearer.is_connected() {
            return Err(TelephonyError::TransportNotConnected);
        }

        if self.fail_after_chunks == Some(self.chunk_count()) {
            return Err(TelephonyError::transport_failed("data rejected by controller"));
        }

        self.max_seen_in_flight
            .fetch_max(bearer.window().in_flight(), Ordering::SeqCst);

        let sent = {
            let mut chunks = self.chunks.lock();
            chunks.push(data);
            chunks.len()
        };

        if self.drop_after_chunks == Some(sent) {
            bearer.set_state(BearerState::Disconnected);
            return Ok(());
        }

        let Some(bearer) = self.bearer(bearer.id()) else {
            return Ok(());
        };
        let delay = self.ack_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bearer.acknowledge_data();
        });

        Ok(())
    }

    async fn hangup(&self, bearer: &BearerConnection) -> TelephonyResult<()> {
        self.serialized_section().await;
        self.hangups.fetch_add(1, Ordering::SeqCst);

        let Some(bearer) = self.bearer(bearer.id()) else {
            return Ok(());
        };
        let delay = self.hangup_delay;
        let listener = self.listener();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if bearer.state() != BearerState::Disconnected {
                bearer.set_state(BearerState::Disconnected);
                if let Some(listener) = listener {
                    listener.terminated(&bearer);
                }
            }
        });

        Ok(())
    }
}

/// Router control recording every dial
#[derive(Default)]
pub struct MockRouter {
    pub dials: Mutex<Vec<(DialPort, String)>>,
}

impl MockRouter {
    pub fn dialed(&self) -> Vec<String> {
        self.dials.lock().iter().map(|(_, n)| n.clone()).collect()
    }
}

#[async_trait]
impl RouterControl for MockRouter {
    async fn dial_number(&self, _profile: &Profile, port: DialPort, number: &str) -> TelephonyResult<()> {
        self.dials.lock().push((port, number.to_string()));
        Ok(())
    }
}
