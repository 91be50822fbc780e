//! # Warden Flow — behavioral analysis of completed connections
//!
//! One stateful analyzer consuming the flow-completed topic. Each flow runs
//! through every check synchronously; the only deferred work is the
//! connection-without-DNS re-check, which waits for late-arriving DNS
//! records on its own timer thread.

pub mod analyzer;
pub mod dns_expectation;
pub mod upload;

pub use analyzer::ConnAnalyzer;
