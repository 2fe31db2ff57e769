//! Fax job state

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Error code set when the bearer drops before all bytes were sent
pub const FAX_ERROR_BEARER_DROPPED: i32 = 1;
/// Error code set when the transport rejects a send
pub const FAX_ERROR_TRANSPORT: i32 = 2;

/// T.30 style transfer phases, in the order a job passes through them
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FaxPhase {
    Idle,
    /// Bearer connected
    Connect,
    /// Phase B: capabilities and station identification
    Identify,
    /// Phase C/D: page data transfer
    Transfer,
    /// Phase E: call release
    Release,
}

impl FaxPhase {
    /// Numeric phase code reported to status consumers
    pub fn code(self) -> i32 {
        match self {
            FaxPhase::Idle => -1,
            FaxPhase::Connect => 1,
            FaxPhase::Identify => 2,
            FaxPhase::Transfer => 3,
            FaxPhase::Release => 4,
        }
    }
}

/// Progress and outcome of one fax transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaxStatus {
    pub phase: FaxPhase,
    pub bytes_sent: usize,
    pub bytes_total: usize,
    pub page_current: u32,
    pub page_total: u32,
    pub error_code: i32,
    pub done: bool,
    /// Error correction mode
    pub ecm: bool,
    /// Modem rate selector
    pub modem: u8,
}

impl FaxStatus {
    pub fn new(ecm: bool, modem: u8) -> Self {
        Self {
            phase: FaxPhase::Idle,
            bytes_sent: 0,
            bytes_total: 0,
            page_current: 0,
            page_total: 0,
            error_code: 0,
            done: false,
            ecm,
            modem,
        }
    }

    pub fn percent(&self) -> u8 {
        if self.bytes_total == 0 {
            return if self.done { 100 } else { 0 };
        }
        (self.bytes_sent * 100 / self.bytes_total) as u8
    }
}

/// Shared fax job, updated by the transfer engine and read by everyone else
#[derive(Debug)]
pub struct FaxJob {
    connection_id: u32,
    status: RwLock<FaxStatus>,
}

impl FaxJob {
    pub fn new(connection_id: u32, ecm: bool, modem: u8) -> Self {
        Self {
            connection_id,
            status: RwLock::new(FaxStatus::new(ecm, modem)),
        }
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn status(&self) -> FaxStatus {
        self.status.read().clone()
    }

    pub fn phase(&self) -> FaxPhase {
        self.status.read().phase
    }

    /// Move to `phase` if it lies ahead of the current one
    pub fn advance(&self, phase: FaxPhase) -> bool {
        let mut status = self.status.write();
        if phase <= status.phase {
            return false;
        }
        debug!("Fax {}: phase {:?} -> {:?}", self.connection_id, status.phase, phase);
        status.phase = phase;
        true
    }

    /// Reset for a fresh transfer of `bytes_total` bytes
    pub fn reset(&self, bytes_total: usize) {
        let mut status = self.status.write();
        let (ecm, modem) = (status.ecm, status.modem);
        *status = FaxStatus::new(ecm, modem);
        status.bytes_total = bytes_total;
    }

    pub fn set_pages(&self, current: u32, total: u32) {
        let mut status = self.status.write();
        status.page_current = current;
        status.page_total = total;
    }

    /// Record the absolute number of bytes handed to the transport
    pub(crate) fn record_sent(&self, bytes_sent: usize) {
        let mut status = self.status.write();
        debug_assert!(bytes_sent >= status.bytes_sent);
        status.bytes_sent = bytes_sent.min(status.bytes_total);
    }

    pub(crate) fn complete(&self) {
        let mut status = self.status.write();
        status.phase = FaxPhase::Release;
        status.done = true;
    }

    pub(crate) fn fail(&self, error_code: i32) {
        let mut status = self.status.write();
        status.phase = FaxPhase::Release;
        status.error_code = error_code;
        status.done = true;
    }
}
