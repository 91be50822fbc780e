//! # Warden DNS — behavioral analysis of DNS transactions
//!
//! One stateful analyzer consuming the DNS-transaction topic, plus the
//! correlation helpers the flow side uses to decide whether a connection
//! had DNS justification.

pub mod analyzer;
pub mod correlation;
pub mod server_probe;

pub use analyzer::DnsAnalyzer;
pub use correlation::VersionCorrelation;
