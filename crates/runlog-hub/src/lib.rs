pub mod bus;
pub mod config;
pub mod executor;
pub mod http;
pub mod hub;
pub mod logging;
pub mod registry;
pub mod rewind;

pub use bus::{EventBus, StreamGap, Subscription};
pub use hub::{HistorySnapshot, RunError, RunHub, RunSummary};
pub use registry::{ActiveRunClaim, ActiveRunRegistry, AdmissionConflict};
pub use rewind::RewindError;
