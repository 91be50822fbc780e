//! # Warden Core — shared plumbing for the behavioral detection engine
//!
//! Everything the flow and DNS analyzers have in common lives here: the
//! data model (flows, DNS transactions, evidence), the typed event bus the
//! ingestion pipeline publishes onto, the profile/time-window store the
//! analyzers correlate through, the bounded evidence log, the single-shot
//! deferral timer, and the organization directory used for exemptions.

pub mod config;
pub mod deferral;
pub mod error;
pub mod event_bus;
pub mod evidence;
pub mod orgs;
pub mod store;
pub mod types;

pub use config::DetectionConfig;
pub use error::{WardenError, WardenResult};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
