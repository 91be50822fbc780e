//! Data-upload monitoring: a per-flow threshold checked inline, and a
//! per-destination aggregate computed when a time window closes.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use warden_core::config::DetectionConfig;
use warden_core::evidence::EvidenceSink;
use warden_core::store::ProfileStore;
use warden_core::types::{
    bytes_to_mb, is_ignored_destination, Direction, Evidence, EvidenceCategory, EvidenceKind,
    Flow, ProfileWindow, ThreatLevel,
};

pub struct UploadMonitor {
    cfg: DetectionConfig,
    store: Arc<dyn ProfileStore>,
    sink: Arc<dyn EvidenceSink>,
}

impl UploadMonitor {
    pub fn new(
        cfg: DetectionConfig,
        store: Arc<dyn ProfileStore>,
        sink: Arc<dyn EvidenceSink>,
    ) -> Self {
        Self { cfg, store, sink }
    }

    /// A single flow sending at least the per-flow threshold is evidence on
    /// its own, without waiting for the window aggregate.
    pub fn check_flow(&self, flow: &Flow, pw: ProfileWindow) -> bool {
        if flow.sbytes == 0 || is_ignored_destination(flow.daddr, self.store.gateway_ip()) {
            return false;
        }
        let mbs = bytes_to_mb(flow.sbytes);
        if mbs < self.cfg.flow_upload_mb {
            return false;
        }

        self.sink.emit(
            Evidence::new(
                EvidenceKind::DataUpload,
                ThreatLevel::High,
                0.6,
                EvidenceCategory::Exfiltration,
                format!("{:.1} MB sent to {} in a single flow", mbs, flow.daddr),
                pw.profile,
                pw.window,
                flow.timestamp,
            )
            .with_attacker(Direction::Src, flow.saddr)
            .with_victim(Direction::Dst, flow.daddr)
            .with_uid(&flow.uid)
            .with_proto(flow.proto),
        );
        true
    }

    /// Window-close aggregate: total sent bytes per destination across the
    /// closing window; every destination at or above the threshold fires
    /// once with the contributing uids. Returns the number of findings.
    pub fn check_window(&self, pw: ProfileWindow) -> usize {
        let flows = self.store.window_flows(pw);
        if flows.is_empty() {
            return 0;
        }

        let gateway = self.store.gateway_ip();
        let mut per_dest: HashMap<IpAddr, (u64, Vec<String>, f64)> = HashMap::new();
        for sample in flows {
            if sample.sbytes == 0 || is_ignored_destination(sample.daddr, gateway) {
                continue;
            }
            let entry = per_dest.entry(sample.daddr).or_insert((0, Vec::new(), 0.0));
            entry.0 += sample.sbytes;
            entry.1.push(sample.uid);
            entry.2 = sample.timestamp;
        }

        let mut fired = 0;
        for (daddr, (bytes, uids, last_ts)) in per_dest {
            let mbs = bytes_to_mb(bytes);
            if mbs < self.cfg.window_upload_mb {
                continue;
            }
            let flow_count = uids.len();
            self.sink.emit(
                Evidence::new(
                    EvidenceKind::DataUpload,
                    ThreatLevel::High,
                    0.6,
                    EvidenceCategory::Exfiltration,
                    format!(
                        "{:.1} MB sent to {} across {} flows in {}",
                        mbs, daddr, flow_count, pw.window
                    ),
                    pw.profile,
                    pw.window,
                    last_ts,
                )
                .with_attacker(Direction::Src, pw.profile.ip())
                .with_victim(Direction::Dst, daddr)
                .with_uids(uids),
            );
            fired += 1;
        }
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::evidence::EvidenceLog;
    use warden_core::store::{MemoryStore, SentSample};
    use warden_core::types::{AppProto, ConnState, FlowType, ProfileId, Proto, TimeWindow};

    const MB: u64 = 1024 * 1024;

    fn monitor() -> (UploadMonitor, Arc<MemoryStore>, Arc<EvidenceLog>) {
        let store = Arc::new(MemoryStore::new());
        let sink = Arc::new(EvidenceLog::new());
        let monitor = UploadMonitor::new(
            DetectionConfig::default(),
            store.clone() as Arc<dyn ProfileStore>,
            sink.clone() as Arc<dyn EvidenceSink>,
        );
        (monitor, store, sink)
    }

    fn pw() -> ProfileWindow {
        ProfileWindow::new(ProfileId("10.0.0.2".parse().unwrap()), TimeWindow::new(1))
    }

    fn flow(uid: &str, daddr: &str, sbytes: u64) -> Flow {
        Flow {
            uid: uid.into(),
            saddr: "10.0.0.2".parse().unwrap(),
            daddr: daddr.parse().unwrap(),
            sport: 50_000,
            dport: 443,
            proto: Proto::Tcp,
            state: ConnState::Established,
            origstate: ConnState::Established,
            duration: 12.0,
            sbytes,
            allbytes: sbytes,
            appproto: Some(AppProto::Ssl),
            smac: None,
            flow_type: FlowType::Conn,
            timestamp: 1_000.0,
        }
    }

    #[test]
    fn test_single_flow_at_threshold_fires() {
        let (monitor, _, sink) = monitor();
        assert!(monitor.check_flow(&flow("u1", "34.1.1.1", 100 * MB), pw()));
        let ev = sink.drain();
        assert_eq!(ev[0].kind, EvidenceKind::DataUpload);
        assert_eq!(ev[0].uids, vec!["u1".to_string()]);
    }

    #[test]
    fn test_single_flow_below_threshold_is_silent() {
        let (monitor, _, sink) = monitor();
        assert!(!monitor.check_flow(&flow("u1", "34.1.1.1", 99 * MB), pw()));
        assert!(!monitor.check_flow(&flow("u2", "34.1.1.1", 0), pw()));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_ignored_destinations_are_exempt() {
        let (monitor, store, sink) = monitor();
        store.set_gateway_ip("10.0.0.1".parse().unwrap());
        assert!(!monitor.check_flow(&flow("u1", "10.0.0.1", 500 * MB), pw()));
        assert!(!monitor.check_flow(&flow("u2", "224.0.0.251", 500 * MB), pw()));
        assert!(!monitor.check_flow(&flow("u3", "169.254.1.1", 500 * MB), pw()));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_window_aggregate_sums_per_destination() {
        let (monitor, store, sink) = monitor();
        let exfil: IpAddr = "34.1.1.1".parse().unwrap();
        let benign: IpAddr = "35.2.2.2".parse().unwrap();
        for (uid, daddr, mb, ts) in [
            ("u1", exfil, 200, 10.0),
            ("u2", exfil, 300, 20.0),
            ("u3", benign, 50, 30.0),
        ] {
            store.record_flow(
                pw(),
                SentSample { uid: uid.into(), daddr, sbytes: mb * MB, timestamp: ts },
            );
        }

        assert_eq!(monitor.check_window(pw()), 1);
        let ev = sink.drain();
        assert_eq!(ev.len(), 1);
        assert_eq!(ev[0].victim.unwrap().ip, exfil);
        assert_eq!(ev[0].uids, vec!["u1".to_string(), "u2".to_string()]);
        assert_eq!(ev[0].timestamp, 20.0);
    }

    #[test]
    fn test_window_aggregate_below_threshold_is_silent() {
        let (monitor, store, sink) = monitor();
        store.record_flow(
            pw(),
            SentSample {
                uid: "u1".into(),
                daddr: "34.1.1.1".parse().unwrap(),
                sbytes: 499 * MB,
                timestamp: 10.0,
            },
        );
        assert_eq!(monitor.check_window(pw()), 0);
        assert!(sink.is_empty());
        // An empty window is a no-op too.
        assert_eq!(monitor.check_window(ProfileWindow::new(pw().profile, TimeWindow::new(9))), 0);
    }
}
