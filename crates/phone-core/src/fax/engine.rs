//! Fax transfer engine
//!
//! Streams the encoded header and page data of one document over an
//! established bearer connection. At most `max_in_flight` chunks are handed
//! to the transport without acknowledgment; every transport call goes
//! through the shared [`SerializedTransport`] lock.
//!
//! The transfer runs as its own task and stops early when the bearer leaves
//! the connected state. After the last chunk it requests a hangup and waits
//! for the outstanding chunks to drain.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{TelephonyError, TelephonyResult};
use crate::events::{EventEmitter, TelephonyEvent};
use crate::fax::{FaxJob, FaxPageHeader, FaxPhase, FAX_ERROR_BEARER_DROPPED, FAX_ERROR_TRANSPORT};
use crate::transport::{BearerConnection, BearerState, SerializedTransport};

/// Bytes per data chunk
pub const DEFAULT_CHUNK_SIZE: usize = 160;
/// Chunks handed to the transport without acknowledgment
pub const DEFAULT_MAX_IN_FLIGHT: usize = 6;

/// Chunking parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaxTransferConfig {
    pub chunk_size: usize,
    pub max_in_flight: usize,
}

impl Default for FaxTransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_in_flight: DEFAULT_MAX_IN_FLIGHT,
        }
    }
}

/// Document to send: page header plus raw page data
#[derive(Debug, Clone)]
pub struct FaxDocument {
    pub header: FaxPageHeader,
    pub pages: Bytes,
}

impl FaxDocument {
    pub fn new(header: FaxPageHeader, pages: impl Into<Bytes>) -> Self {
        Self {
            header,
            pages: pages.into(),
        }
    }

    /// Header followed by the page data
    pub fn encode(&self) -> TelephonyResult<Bytes> {
        let header = self.header.encode()?;
        let mut buf = BytesMut::with_capacity(header.len() + self.pages.len());
        buf.extend_from_slice(&header);
        buf.extend_from_slice(&self.pages);
        Ok(buf.freeze())
    }
}

enum Outcome {
    Sent,
    Dropped,
}

/// Sends fax documents over bearer connections
#[derive(Debug, Clone)]
pub struct FaxTransferEngine {
    transport: SerializedTransport,
    events: EventEmitter,
    config: FaxTransferConfig,
}

impl FaxTransferEngine {
    pub fn new(transport: SerializedTransport, events: EventEmitter, config: FaxTransferConfig) -> Self {
        let config = FaxTransferConfig {
            chunk_size: config.chunk_size.max(1),
            max_in_flight: config.max_in_flight.max(1),
        };
        Self {
            transport,
            events,
            config,
        }
    }

    pub fn config(&self) -> FaxTransferConfig {
        self.config
    }

    /// Run the transfer on its own task
    pub fn spawn(
        &self,
        bearer: Arc<BearerConnection>,
        job: Arc<FaxJob>,
        document: FaxDocument,
    ) -> JoinHandle<TelephonyResult<()>> {
        let engine = self.clone();
        tokio::spawn(async move { engine.run(bearer, job, document).await })
    }

    /// Transfer `document` over `bearer`, reporting progress through `job`
    pub async fn run(
        &self,
        bearer: Arc<BearerConnection>,
        job: Arc<FaxJob>,
        document: FaxDocument,
    ) -> TelephonyResult<()> {
        // An empty document has nothing to send, not even the header
        if document.pages.is_empty() {
            job.reset(0);
            job.complete();
            info!("Fax {}: empty document, nothing to send", bearer.id());
            self.report_progress(&bearer, &job);
            self.hangup(&bearer).await;
            self.events.emit(TelephonyEvent::ConnectionStatus {
                code: 0,
                connection_id: bearer.id(),
            });
            return Ok(());
        }

        let data = document.encode()?;
        job.reset(data.len());

        let state = bearer.wait_settled().await;
        if state != BearerState::Connected {
            return self.abort(&bearer, &job, FAX_ERROR_BEARER_DROPPED).await;
        }

        job.advance(FaxPhase::Connect);
        job.advance(FaxPhase::Transfer);
        self.report_progress(&bearer, &job);

        match self.stream(&bearer, &job, data).await? {
            Outcome::Sent => self.finish(&bearer, &job).await,
            Outcome::Dropped => self.abort(&bearer, &job, FAX_ERROR_BEARER_DROPPED).await,
        }
    }

    async fn stream(&self, bearer: &BearerConnection, job: &FaxJob, mut data: Bytes) -> TelephonyResult<Outcome> {
        let mut state = bearer.subscribe_state();
        let total = data.len();
        let mut sent = 0;

        debug!(
            "Fax {}: sending {} bytes in chunks of {}",
            bearer.id(),
            total,
            self.config.chunk_size
        );

        while !data.is_empty() {
            if *state.borrow_and_update() != BearerState::Connected {
                return Ok(Outcome::Dropped);
            }

            tokio::select! {
                biased;
                changed = state.changed() => {
                    if changed.is_err() {
                        return Ok(Outcome::Dropped);
                    }
                    continue;
                }
                acquired = bearer.window().acquire() => acquired?,
            }

            let chunk = data.split_to(self.config.chunk_size.min(data.len()));
            let len = chunk.len();

            if let Err(e) = self.transport.send_data(bearer, chunk).await {
                // Nothing will acknowledge the rejected chunk
                bearer.window().acknowledge();
                if !bearer.is_connected() {
                    debug!("Fax {}: send rejected, bearer went down: {}", bearer.id(), e);
                    return Ok(Outcome::Dropped);
                }

                warn!("Fax {}: send failed after {} bytes: {}", bearer.id(), sent, e);
                job.fail(FAX_ERROR_TRANSPORT);
                self.hangup(bearer).await;
                self.events.emit(TelephonyEvent::ConnectionStatus {
                    code: FAX_ERROR_TRANSPORT,
                    connection_id: bearer.id(),
                });
                return Err(e);
            }

            sent += len;
            job.record_sent(sent);
            self.report_progress(bearer, job);
        }

        Ok(Outcome::Sent)
    }

    async fn finish(&self, bearer: &BearerConnection, job: &FaxJob) -> TelephonyResult<()> {
        debug!("Fax {}: all data queued, requesting hangup", bearer.id());
        self.hangup(bearer).await;

        tokio::select! {
            _ = bearer.window().drained() => {}
            _ = bearer.wait_disconnected() => {}
        }

        job.complete();
        self.report_progress(bearer, job);
        self.events.emit(TelephonyEvent::ConnectionStatus {
            code: 0,
            connection_id: bearer.id(),
        });

        let status = job.status();
        info!("Fax {}: transfer complete, {} bytes", bearer.id(), status.bytes_sent);
        Ok(())
    }

    async fn abort(&self, bearer: &BearerConnection, job: &FaxJob, code: i32) -> TelephonyResult<()> {
        let status = job.status();
        warn!(
            "Fax {}: bearer left connected state after {} of {} bytes",
            bearer.id(),
            status.bytes_sent,
            status.bytes_total
        );

        job.fail(code);
        self.hangup(bearer).await;

        self.report_progress(bearer, job);
        self.events.emit(TelephonyEvent::ConnectionStatus {
            code,
            connection_id: bearer.id(),
        });

        Err(TelephonyError::BearerDropped {
            bearer_id: bearer.id(),
            bytes_sent: status.bytes_sent,
            bytes_total: status.bytes_total,
        })
    }

    /// Request a hangup unless the bearer is already going down
    async fn hangup(&self, bearer: &BearerConnection) {
        let state = bearer.state();
        if matches!(state, BearerState::Disconnecting | BearerState::Disconnected) {
            debug!("Fax {}: bearer {:?}, skipping hangup", bearer.id(), state);
            return;
        }

        if let Err(e) = self.transport.hangup(bearer).await {
            warn!("Fax {}: hangup failed: {}", bearer.id(), e);
        }
    }

    fn report_progress(&self, bearer: &BearerConnection, job: &FaxJob) {
        let status = job.status();
        self.events.emit(TelephonyEvent::FaxProgress {
            connection_id: bearer.id(),
            phase: status.phase,
            bytes_sent: status.bytes_sent,
            bytes_total: status.bytes_total,
        });
    }
}
