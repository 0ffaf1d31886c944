//! Privacy-aware concurrent HTTP download engine.
//!
//! Transfers are submitted to a [`DownloadEngine`], queued FIFO, and driven
//! by a bounded worker pool. Each transfer is routed through the transport
//! its privacy mode calls for (direct, forward proxy, or a local SOCKS
//! anonymity relay), split into parallel byte-range segments when the
//! server cooperates, and reported through a broadcast [`EventHub`].

pub mod error;
pub mod events;
pub mod model;
pub mod postprocess;
pub mod privacy;
pub mod settings;
pub mod transport;

mod engine;

pub use engine::naming::{ConflictAction, ConflictResolver};
pub use engine::{AddRequest, DownloadEngine};
pub use error::EngineError;
pub use events::{EngineEvent, EventHub};
pub use model::{
  PrivacyMode, SegmentSnapshot, SegmentStatus, TransferSnapshot, TransferStatus,
};
pub use settings::{EngineConfig, SettingsStore};
