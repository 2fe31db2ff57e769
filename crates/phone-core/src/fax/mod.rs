//! Fax page transfer over an established bearer connection

pub mod engine;
pub mod header;
pub mod status;

pub use engine::{FaxDocument, FaxTransferConfig, FaxTransferEngine, DEFAULT_CHUNK_SIZE, DEFAULT_MAX_IN_FLIGHT};
pub use header::{FaxPageHeader, PageFormat, Resolution};
pub use status::{FaxJob, FaxPhase, FaxStatus, FAX_ERROR_BEARER_DROPPED, FAX_ERROR_TRANSPORT};
