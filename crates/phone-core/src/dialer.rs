//! Outbound dialing and transport callbacks
//!
//! [`CallDialer`] places voice and fax calls through the serialized
//! transport, registers the resulting connection and, for fax calls, hands
//! the bearer to the [`FaxTransferEngine`]. It is also the
//! [`TransportListener`] the transport reports back to.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connection::{Connection, ConnectionOrigin, ConnectionRegistry, ConnectionType};
use crate::device::Device;
use crate::error::{TelephonyError, TelephonyResult};
use crate::events::{EventEmitter, TelephonyEvent};
use crate::fax::{FaxDocument, FaxJob, FaxPageHeader, FaxPhase, FaxTransferEngine, PageFormat, Resolution};
use crate::number::{canonicalize_number, scramble_number};
use crate::profile::{Profile, FAX_CIP_PREFERENCE_ISDN};
use crate::transport::{
    BearerConnection, BearerState, CallRequest, CallService, FaxMode, SerializedTransport, ServiceIndicator,
    TransportListener,
};

/// Message shown when no source number is configured
pub const SOURCE_NOT_SET_MESSAGE: &str = "Source MSN not set, cannot dial";

/// What to dial
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialKind {
    /// Voice call
    Phone,
    /// Fax call sending the page data stored in `file`
    Fax { file: PathBuf },
}

type TransferHandle = JoinHandle<TelephonyResult<()>>;

/// Places calls and tracks the fax transfers they start
pub struct CallDialer {
    transport: SerializedTransport,
    registry: Arc<ConnectionRegistry>,
    events: EventEmitter,
    engine: FaxTransferEngine,
    transfers: Mutex<HashMap<u32, TransferHandle>>,
}

impl CallDialer {
    pub fn new(
        transport: SerializedTransport,
        registry: Arc<ConnectionRegistry>,
        events: EventEmitter,
        engine: FaxTransferEngine,
    ) -> Self {
        Self {
            transport,
            registry,
            events,
            engine,
            transfers: Mutex::new(HashMap::new()),
        }
    }

    /// Dial `target` using the settings of `profile`.
    ///
    /// Without a configured source number nothing is dialed; a message
    /// event is emitted and `SourceNotConfigured` returned.
    pub async fn dial(
        &self,
        profile: &Profile,
        target: &str,
        anonymous: bool,
        kind: &DialKind,
    ) -> TelephonyResult<Arc<Connection>> {
        match kind {
            DialKind::Phone => self.dial_phone(profile, target, anonymous).await,
            DialKind::Fax { file } => {
                self.source_number(profile, Device::Fax)?;
                let pages = tokio::fs::read(file).await.map_err(|e| TelephonyError::Io {
                    reason: format!("{}: {}", file.display(), e),
                })?;
                self.dial_fax(profile, target, anonymous, Bytes::from(pages)).await
            }
        }
    }

    /// Place a voice call
    pub async fn dial_phone(&self, profile: &Profile, target: &str, anonymous: bool) -> TelephonyResult<Arc<Connection>> {
        let settings = &profile.settings;
        let source = self.source_number(profile, Device::Phone)?;

        let request = CallRequest {
            controller: settings.phone_controller + 1,
            source,
            target: canonicalize_number(target, &settings.international_prefix),
            anonymous,
            indicator: ServiceIndicator::Speech,
            service: CallService::Voice,
        };

        self.place(Device::Phone, &request).await
    }

    /// Place a fax call and start sending `pages` once the bearer is up
    pub async fn dial_fax(
        &self,
        profile: &Profile,
        target: &str,
        anonymous: bool,
        pages: Bytes,
    ) -> TelephonyResult<Arc<Connection>> {
        let settings = &profile.settings;
        let source = self.source_number(profile, Device::Fax)?;

        let format = if settings.fax_sff { PageFormat::Sff } else { PageFormat::PlainFax };
        let header = FaxPageHeader::new(Resolution::Standard, format, &settings.fax_ident, &settings.fax_header)?;

        let indicator = if settings.fax_cip == FAX_CIP_PREFERENCE_ISDN {
            ServiceIndicator::FaxGroup3
        } else {
            ServiceIndicator::Speech
        };

        let request = CallRequest {
            controller: settings.fax_controller + 1,
            source,
            target: canonicalize_number(target, &settings.international_prefix),
            anonymous,
            indicator,
            service: CallService::Fax {
                mode: if settings.fax_sff { FaxMode::Structured } else { FaxMode::Modem },
                modem: settings.fax_bitrate,
                ecm: settings.fax_ecm,
                header: header.clone(),
            },
        };

        let connection = self.place(Device::Fax, &request).await?;
        let Some(bearer) = connection.bearer() else {
            return Err(TelephonyError::internal_error("fax connection without bearer"));
        };

        let job = Arc::new(FaxJob::new(connection.id(), settings.fax_ecm, settings.fax_bitrate));
        connection.attach_fax_job(job.clone());

        let handle = self.engine.spawn(bearer, job, FaxDocument::new(header, pages));
        self.transfers.lock().insert(connection.id(), handle);

        Ok(connection)
    }

    /// Hang up `connection`. A running fax transfer stops on its own once
    /// the bearer leaves the connected state.
    pub async fn hangup(&self, connection: &Connection) -> TelephonyResult<()> {
        let bearer = connection.bearer().ok_or(TelephonyError::TransportNotConnected)?;

        info!("Hanging up connection {}", connection.id());
        if bearer.state() != BearerState::Disconnected {
            bearer.set_state(BearerState::Disconnecting);
        }
        self.transport.hangup(&bearer).await
    }

    /// Take the handle of the fax transfer started on bearer `bearer_id`.
    /// Handles not taken are released when the bearer terminates.
    pub fn take_transfer(&self, bearer_id: u32) -> Option<TransferHandle> {
        self.transfers.lock().remove(&bearer_id)
    }

    /// Fax transfers whose bearer has not terminated yet
    pub fn active_transfers(&self) -> usize {
        self.transfers.lock().len()
    }

    fn source_number(&self, profile: &Profile, device: Device) -> TelephonyResult<String> {
        let source = match device {
            Device::Fax => &profile.settings.fax_number,
            _ => &profile.settings.phone_number,
        };

        if source.is_empty() {
            warn!("No source number configured for {} in profile '{}'", device, profile.name);
            self.events.message(0, SOURCE_NOT_SET_MESSAGE);
            return Err(TelephonyError::source_not_configured(device.name()));
        }

        Ok(source.clone())
    }

    async fn place(&self, device: Device, request: &CallRequest) -> TelephonyResult<Arc<Connection>> {
        debug!(
            "Dialing {} -> {} ({}, cip {:#04x})",
            scramble_number(&request.source),
            scramble_number(&request.target),
            device,
            request.indicator.cip()
        );

        let bearer = self.transport.call(request).await?;

        let connection = match self.registry.add_bearer(
            device,
            bearer.id(),
            ConnectionType::OUTGOING,
            &request.source,
            &request.target,
        ) {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Could not register bearer {}: {}", bearer.id(), e);
                if let Err(hangup) = self.transport.hangup(&bearer).await {
                    warn!("Hangup of unregistered bearer {} failed: {}", bearer.id(), hangup);
                }
                return Err(e);
            }
        };

        connection.attach_bearer(bearer);
        self.events.emit(TelephonyEvent::ConnectionNotify {
            connection: connection.snapshot(),
        });

        Ok(connection)
    }
}

impl TransportListener for CallDialer {
    fn established(&self, bearer: &Arc<BearerConnection>) {
        let connection = self.registry.find_by_bearer(bearer);

        // Monitored calls get their type and timer from the call monitor
        if let Some(connection) = connection.as_ref().filter(|c| c.origin() == ConnectionOrigin::Transport) {
            self.registry.set_type(connection, ConnectionType::CONNECT);
            connection.start_duration_timer();
            if let Some(job) = connection.fax_job() {
                job.advance(FaxPhase::Connect);
            }
        }

        debug!("Bearer {} established", bearer.id());
        self.events.emit(TelephonyEvent::ConnectionEstablished {
            connection_id: bearer.id(),
            connection: connection.map(|c| c.snapshot()),
        });
    }

    fn terminated(&self, bearer: &Arc<BearerConnection>) {
        let connection = self.registry.find_by_bearer(bearer);
        let owned = connection
            .clone()
            .filter(|c| c.origin() == ConnectionOrigin::Transport);

        if let Some(connection) = &owned {
            self.registry.set_type(connection, ConnectionType::DISCONNECT);
            connection.stop_duration_timer();
        }

        if self.transfers.lock().remove(&bearer.id()).is_some() {
            debug!("Released fax transfer handle of bearer {}", bearer.id());
        }

        debug!("Bearer {} terminated", bearer.id());
        self.events.emit(TelephonyEvent::ConnectionTerminated {
            connection_id: bearer.id(),
            connection: connection.as_ref().map(|c| c.snapshot()),
        });

        if let Some(connection) = owned {
            if let Err(e) = self.registry.remove(&connection) {
                debug!("Connection {} already gone: {}", bearer.id(), e);
            }
        }
    }

    fn ring(&self, bearer: &Arc<BearerConnection>) {
        let Some(connection) = self.registry.find_by_remote_number(bearer.source()) else {
            debug!("Ring from {} without monitored connection", scramble_number(bearer.source()));
            return;
        };

        connection.attach_bearer(bearer.clone());
        self.events.emit(TelephonyEvent::ConnectionNotify {
            connection: connection.snapshot(),
        });
    }

    fn status(&self, bearer: &Arc<BearerConnection>, code: i32) {
        self.events.emit(TelephonyEvent::ConnectionStatus {
            code,
            connection_id: bearer.id(),
        });
    }

    fn fax_phase(&self, bearer: &Arc<BearerConnection>, phase: FaxPhase) {
        let Some(job) = self.registry.find_by_bearer(bearer).and_then(|c| c.fax_job()) else {
            return;
        };

        if job.advance(phase) {
            let status = job.status();
            self.events.emit(TelephonyEvent::FaxProgress {
                connection_id: bearer.id(),
                phase,
                bytes_sent: status.bytes_sent,
                bytes_total: status.bytes_total,
            });
        }
    }
}
