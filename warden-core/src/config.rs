//! Flat threshold configuration consumed by both analyzers.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{WardenError, WardenResult};

/// Which endpoints the engine analyzes: everything it sees, or only flows
/// originated by locally-owned addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisDirection {
    All,
    LocalOnly,
}

/// Every named threshold of the detection engine, with the shipped defaults.
/// Loadable from JSON; unknown fields fall back to their defaults so a
/// partial config file is valid.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Flows longer than this many seconds raise a long-connection finding.
    pub long_connection_secs: f64,
    /// A single flow sending at least this many MB raises an upload finding.
    pub flow_upload_mb: f64,
    /// Per-destination sent-byte total in a closing window that raises an
    /// exfiltration finding.
    pub window_upload_mb: f64,
    /// How long a connection waits for a late DNS record before the
    /// deferred re-check runs.
    pub dns_grace_secs: f64,
    /// Warm-up minutes after engine start before connection-without-DNS
    /// findings are raised in live capture.
    pub dns_warmup_mins: f64,
    /// How far back a cached resolution still justifies a connection.
    pub resolution_cache_hours: f64,
    /// NXDOMAIN responses accumulated per profile/window before a DGA
    /// finding fires.
    pub nxdomain_threshold: usize,
    /// Shannon entropy at or above which a TXT answer is suspicious.
    pub entropy_threshold: f64,
    /// Reverse-DNS queries within `arpa_scan_window_secs` that constitute
    /// a scan.
    pub arpa_scan_threshold: usize,
    pub arpa_scan_window_secs: f64,
    /// Registration age below which a domain counts as young, in days.
    pub young_domain_age_days: u32,
    /// Rejected attempts to one (saddr, daddr, dport) before a
    /// reconnection finding fires.
    pub reconnection_threshold: u32,
    /// High-port UDP hits on a single destination that classify it as P2P.
    pub p2p_single_dst_hits: u32,
    /// Distinct high-port UDP destinations that classify the traffic as P2P.
    pub p2p_distinct_dsts: usize,
    /// Whether unresolved destinations may be probed to see if they are
    /// DNS servers. Disable for offline replay.
    pub probe_dns_servers: bool,
    pub dns_probe_timeout_secs: u64,
    pub analysis_direction: AnalysisDirection,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            long_connection_secs: 1500.0,
            flow_upload_mb: 100.0,
            window_upload_mb: 500.0,
            dns_grace_secs: 15.0,
            dns_warmup_mins: 30.0,
            resolution_cache_hours: 24.0,
            nxdomain_threshold: 10,
            entropy_threshold: 4.0,
            arpa_scan_threshold: 10,
            arpa_scan_window_secs: 2.0,
            young_domain_age_days: 60,
            reconnection_threshold: 5,
            p2p_single_dst_hits: 6,
            p2p_distinct_dsts: 5,
            probe_dns_servers: true,
            dns_probe_timeout_secs: 2,
            analysis_direction: AnalysisDirection::All,
        }
    }
}

impl DetectionConfig {
    pub fn from_json(json: &str) -> WardenResult<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> WardenResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    fn validate(&self) -> WardenResult<()> {
        if self.nxdomain_threshold == 0 || self.arpa_scan_threshold == 0 {
            return Err(WardenError::Config(
                "counter thresholds must be at least 1".into(),
            ));
        }
        if self.long_connection_secs <= 0.0 || self.dns_grace_secs < 0.0 {
            return Err(WardenError::Config(
                "time thresholds must be positive".into(),
            ));
        }
        Ok(())
    }
}
