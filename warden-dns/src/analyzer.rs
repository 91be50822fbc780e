//! The DNS analyzer: every check runs synchronously against one
//! transaction, mutating small per-window trails. Counter-based checks are
//! edge-triggered: the event that crosses a threshold fires exactly once
//! and clears the accumulated state behind it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use warden_core::config::DetectionConfig;
use warden_core::event_bus::DetectionBus;
use warden_core::evidence::EvidenceSink;
use warden_core::orgs::OrgDirectory;
use warden_core::store::ProfileStore;
use warden_core::types::{
    DnsRcode, DnsTransaction, Evidence, EvidenceCategory, EvidenceKind, Direction, ProfileId,
    ProfileWindow, ThreatLevel, TimeWindow,
};

use crate::server_probe;

#[derive(Default)]
struct NxDomainTrail {
    domains: Vec<String>,
    uids: Vec<String>,
}

struct ArpaQuery {
    timestamp: f64,
    uid: String,
}

pub struct DnsAnalyzer {
    cfg: DetectionConfig,
    store: Arc<dyn ProfileStore>,
    orgs: Arc<OrgDirectory>,
    sink: Arc<dyn EvidenceSink>,
    /// NXDOMAIN accumulation per profile/window; cleared when it fires.
    nxdomains: Mutex<HashMap<ProfileWindow, NxDomainTrail>>,
    /// Reverse-DNS query trail per profile/window.
    arpa_trails: Mutex<HashMap<ProfileWindow, Vec<ArpaQuery>>>,
    /// Probe verdicts, cached so a destination is probed at most once.
    probed_servers: RwLock<HashMap<IpAddr, bool>>,
    queries_analyzed: AtomicU64,
    enabled: AtomicBool,
}

impl DnsAnalyzer {
    pub fn new(
        cfg: DetectionConfig,
        store: Arc<dyn ProfileStore>,
        orgs: Arc<OrgDirectory>,
        sink: Arc<dyn EvidenceSink>,
    ) -> Self {
        Self {
            cfg,
            store,
            orgs,
            sink,
            nxdomains: Mutex::new(HashMap::new()),
            arpa_trails: Mutex::new(HashMap::new()),
            probed_servers: RwLock::new(HashMap::new()),
            queries_analyzed: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Subscribe this analyzer to the DNS-transaction topic. Takes an
    /// owning handle; clone the `Arc` when the caller keeps one.
    pub fn attach(self: Arc<Self>, bus: &DetectionBus) {
        bus.on_dns(move |txn, profile, window| self.on_dns(txn, profile, window));
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn queries_analyzed(&self) -> u64 {
        self.queries_analyzed.load(Ordering::Relaxed)
    }

    /// Entry point for one DNS transaction.
    pub fn on_dns(&self, txn: &DnsTransaction, profile: ProfileId, window: TimeWindow) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        self.queries_analyzed.fetch_add(1, Ordering::Relaxed);
        let pw = ProfileWindow::new(profile, window);

        self.detect_dga(txn, pw);
        self.detect_young_domain(txn, pw);
        self.check_invalid_answers(txn, pw);
        self.check_high_entropy_answers(txn, pw);
        self.check_arpa_scan(txn, pw);
    }

    // ── DGA via NXDOMAIN accumulation ────────────────────────────────────

    /// Accumulate NXDOMAIN responses per profile/window; the response that
    /// reaches the threshold fires once with every accumulated uid and
    /// resets the trail.
    pub fn detect_dga(&self, txn: &DnsTransaction, pw: ProfileWindow) -> bool {
        if txn.rcode != DnsRcode::NxDomain {
            return false;
        }
        if Self::is_special_domain(&txn.query) {
            return false;
        }
        if self.orgs.is_domain_whitelisted(&txn.query) {
            return false;
        }

        let mut nx = self.nxdomains.lock();
        let trail = nx.entry(pw).or_default();
        trail.domains.push(txn.query.clone());
        trail.uids.push(txn.uid.clone());

        let count = trail.domains.len();
        if count < self.cfg.nxdomain_threshold {
            return false;
        }

        let uids = std::mem::take(&mut trail.uids);
        trail.domains.clear();
        drop(nx);

        self.sink.emit(
            Evidence::new(
                EvidenceKind::DgaNxdomains,
                ThreatLevel::High,
                (0.5 + count as f64 / 20.0).min(1.0),
                EvidenceCategory::Malware,
                format!(
                    "possible DGA: {} NXDOMAIN responses accumulated in {}",
                    count, pw.window
                ),
                pw.profile,
                pw.window,
                txn.timestamp,
            )
            .with_attacker(Direction::Src, pw.profile.ip())
            .with_uids(uids),
        );
        true
    }

    // ── Young-domain detection ───────────────────────────────────────────

    /// Registration age below the threshold is evidence; missing age data
    /// yields no detection.
    pub fn detect_young_domain(&self, txn: &DnsTransaction, pw: ProfileWindow) -> bool {
        if txn.query.is_empty() || Self::is_special_domain(&txn.query) {
            return false;
        }
        let Some(age) = self.store.domain_age_days(&txn.query) else {
            debug!(domain = %txn.query, "no registration age data, skipping");
            return false;
        };
        if age >= self.cfg.young_domain_age_days {
            return false;
        }

        self.sink.emit(
            Evidence::new(
                EvidenceKind::YoungDomain,
                ThreatLevel::Low,
                1.0,
                EvidenceCategory::AnomalyBehaviour,
                format!("connection to young domain {} registered {} days ago", txn.query, age),
                pw.profile,
                pw.window,
                txn.timestamp,
            )
            .with_attacker(Direction::Src, pw.profile.ip())
            .with_uid(&txn.uid),
        );
        true
    }

    // ── Invalid DNS answers ──────────────────────────────────────────────

    /// Loopback/unspecified answers for anything but `localhost` are
    /// evidence, and the poisoned cached resolution is removed so later
    /// correlation does not trust it. Returns how many answers fired.
    pub fn check_invalid_answers(&self, txn: &DnsTransaction, pw: ProfileWindow) -> usize {
        if txn.query == "localhost" {
            return 0;
        }
        let mut fired = 0;
        for answer in &txn.answers {
            let Ok(ip) = answer.parse::<IpAddr>() else {
                continue;
            };
            let invalid = match ip {
                IpAddr::V4(v4) => v4.is_loopback() || v4.is_unspecified(),
                IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
            };
            if !invalid {
                continue;
            }

            self.sink.emit(
                Evidence::new(
                    EvidenceKind::InvalidDnsAnswer,
                    ThreatLevel::Info,
                    0.7,
                    EvidenceCategory::AnomalyTraffic,
                    format!("invalid DNS answer {} for query {}", answer, txn.query),
                    pw.profile,
                    pw.window,
                    txn.timestamp,
                )
                .with_attacker(Direction::Src, pw.profile.ip())
                .with_uid(&txn.uid),
            );
            self.store.delete_dns_resolution(ip);
            fired += 1;
        }
        fired
    }

    // ── High-entropy TXT answers ─────────────────────────────────────────

    /// Only TXT answers are ever measured; one evidence per offending
    /// answer, carrying the computed entropy.
    pub fn check_high_entropy_answers(&self, txn: &DnsTransaction, pw: ProfileWindow) -> bool {
        let mut fired = false;
        for answer in &txn.answers {
            let Some(payload) = answer.strip_prefix("TXT") else {
                continue;
            };
            let entropy = Self::shannon_entropy(payload.trim_start());
            if entropy < self.cfg.entropy_threshold {
                continue;
            }

            self.sink.emit(
                Evidence::new(
                    EvidenceKind::HighEntropyDnsAnswer,
                    ThreatLevel::Medium,
                    0.6,
                    EvidenceCategory::AnomalyTraffic,
                    format!(
                        "high-entropy TXT answer for {}: '{}' (entropy {:.2})",
                        txn.query, answer, entropy
                    ),
                    pw.profile,
                    pw.window,
                    txn.timestamp,
                )
                .with_attacker(Direction::Src, pw.profile.ip())
                .with_uid(&txn.uid),
            );
            fired = true;
        }
        fired
    }

    // ── ARPA reverse-DNS scan ────────────────────────────────────────────

    /// A burst of reverse lookups (the threshold count inside the
    /// configured span) is reconnaissance; a slower trickle is not.
    pub fn check_arpa_scan(&self, txn: &DnsTransaction, pw: ProfileWindow) -> bool {
        if !txn.query.to_lowercase().ends_with(".in-addr.arpa") {
            return false;
        }

        let mut trails = self.arpa_trails.lock();
        let trail = trails.entry(pw).or_default();
        trail.push(ArpaQuery { timestamp: txn.timestamp, uid: txn.uid.clone() });

        let threshold = self.cfg.arpa_scan_threshold;
        if trail.len() < threshold {
            return false;
        }

        let window_start = trail[trail.len() - threshold].timestamp;
        let span = txn.timestamp - window_start;
        if span > self.cfg.arpa_scan_window_secs {
            // Too slow to be a scan; forget the oldest query and keep watching.
            trail.remove(0);
            return false;
        }

        let uids: Vec<String> = trail
            .drain(..)
            .map(|q| q.uid)
            .collect();
        let uids = uids[uids.len() - threshold..].to_vec();
        drop(trails);

        self.sink.emit(
            Evidence::new(
                EvidenceKind::DnsArpaScan,
                ThreatLevel::Medium,
                0.7,
                EvidenceCategory::ReconScanning,
                format!("{} reverse-DNS lookups within {:.1}s", threshold, span.max(0.0)),
                pw.profile,
                pw.window,
                txn.timestamp,
            )
            .with_attacker(Direction::Src, pw.profile.ip())
            .with_uids(uids),
        );
        true
    }

    // ── DNS-server identification ────────────────────────────────────────

    /// Best-effort: known servers from the store short-circuit; otherwise a
    /// one-shot bounded probe whose failure means "not a DNS server".
    /// Verdicts are cached so each candidate is probed at most once.
    pub fn is_dns_server(&self, ip: IpAddr) -> bool {
        if self.store.is_known_dns_server(ip) {
            return true;
        }
        if !self.cfg.probe_dns_servers {
            return false;
        }
        if let Some(&cached) = self.probed_servers.read().get(&ip) {
            return cached;
        }
        let verdict = server_probe::probe_dns_server(
            ip,
            Duration::from_secs(self.cfg.dns_probe_timeout_secs),
        );
        self.probed_servers.write().insert(ip, verdict);
        verdict
    }

    // ── Helpers ──────────────────────────────────────────────────────────

    /// Queries that never count towards behavioral detections: reverse
    /// zones, mDNS-style local names, and bare wildcard queries.
    fn is_special_domain(query: &str) -> bool {
        let q = query.to_lowercase();
        q.is_empty() || q == "*" || q.ends_with(".arpa") || q.ends_with(".local")
    }

    fn shannon_entropy(s: &str) -> f64 {
        if s.is_empty() {
            return 0.0;
        }
        let mut freq = [0u32; 256];
        for b in s.bytes() {
            freq[b as usize] += 1;
        }
        let len = s.len() as f64;
        freq.iter()
            .filter(|&&c| c > 0)
            .map(|&c| {
                let p = c as f64 / len;
                -p * p.log2()
            })
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warden_core::evidence::EvidenceLog;
    use warden_core::store::MemoryStore;

    fn analyzer() -> (Arc<DnsAnalyzer>, Arc<MemoryStore>, Arc<EvidenceLog>) {
        let mut cfg = DetectionConfig::default();
        cfg.probe_dns_servers = false;
        let store = Arc::new(MemoryStore::new());
        let orgs = Arc::new(OrgDirectory::new());
        orgs.whitelist_domain("cymru.com");
        let sink = Arc::new(EvidenceLog::new());
        let dns = Arc::new(DnsAnalyzer::new(
            cfg,
            store.clone() as Arc<dyn ProfileStore>,
            orgs,
            sink.clone() as Arc<dyn EvidenceSink>,
        ));
        (dns, store, sink)
    }

    fn pw() -> ProfileWindow {
        ProfileWindow::new(
            ProfileId("192.168.1.1".parse().unwrap()),
            TimeWindow::new(1),
        )
    }

    fn nxdomain(uid: &str, query: &str) -> DnsTransaction {
        DnsTransaction {
            uid: uid.into(),
            query: query.into(),
            answers: vec![],
            rcode: DnsRcode::NxDomain,
            timestamp: 1_000.0,
        }
    }

    fn answered(uid: &str, query: &str, answers: &[&str]) -> DnsTransaction {
        DnsTransaction {
            uid: uid.into(),
            query: query.into(),
            answers: answers.iter().map(|s| s.to_string()).collect(),
            rcode: DnsRcode::NoError,
            timestamp: 1_000.0,
        }
    }

    // ── DGA ──────────────────────────────────────────────────────────────

    #[test]
    fn test_dga_fires_on_threshold_with_all_uids_then_resets() {
        let (dns, _, sink) = analyzer();

        for i in 1..=9 {
            let fired = dns.detect_dga(&nxdomain(&format!("uid{}", i), &format!("example{}.com", i)), pw());
            assert!(!fired, "below threshold must not fire");
        }
        assert!(sink.is_empty());

        assert!(dns.detect_dga(&nxdomain("uid10", "example10.com"), pw()));
        let evidence = sink.drain();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].kind, EvidenceKind::DgaNxdomains);
        assert_eq!(evidence[0].uids.len(), 10);
        assert!(evidence[0].uids.contains(&"uid1".to_string()));
        assert!(evidence[0].uids.contains(&"uid10".to_string()));

        // Counter is empty again: the 11th NXDOMAIN starts from one.
        assert!(!dns.detect_dga(&nxdomain("uid11", "example11.com"), pw()));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_dga_ignores_noerror_special_and_whitelisted() {
        let (dns, _, sink) = analyzer();
        let mut ok = nxdomain("u1", "example.com");
        ok.rcode = DnsRcode::NoError;
        assert!(!dns.detect_dga(&ok, pw()));
        assert!(!dns.detect_dga(&nxdomain("u2", "example.in-addr.arpa"), pw()));
        assert!(!dns.detect_dga(&nxdomain("u3", "printer.local"), pw()));
        assert!(!dns.detect_dga(&nxdomain("u4", "*"), pw()));
        assert!(!dns.detect_dga(&nxdomain("u5", "example.cymru.com"), pw()));
        assert!(sink.is_empty());

        // None of the skipped queries accumulated state.
        for i in 0..9 {
            dns.detect_dga(&nxdomain(&format!("x{}", i), &format!("gen{}.net", i)), pw());
        }
        assert!(sink.is_empty());
        assert!(dns.detect_dga(&nxdomain("x9", "gen9.net"), pw()));
    }

    #[test]
    fn test_dga_windows_are_independent() {
        let (dns, _, sink) = analyzer();
        let other = ProfileWindow::new(pw().profile, TimeWindow::new(2));
        for i in 0..9 {
            dns.detect_dga(&nxdomain(&format!("a{}", i), "gen.example"), pw());
        }
        // The other window starts at zero.
        assert!(!dns.detect_dga(&nxdomain("b0", "gen.example"), other));
        assert!(sink.is_empty());
    }

    // ── Young domains ────────────────────────────────────────────────────

    #[test]
    fn test_young_domain_detection() {
        let (dns, store, sink) = analyzer();
        store.set_domain_age("fresh.com", 50);
        store.set_domain_age("mature.com", 1000);

        assert!(dns.detect_young_domain(&answered("u1", "fresh.com", &["1.2.3.4"]), pw()));
        assert_eq!(sink.drain()[0].kind, EvidenceKind::YoungDomain);

        assert!(!dns.detect_young_domain(&answered("u2", "mature.com", &["1.2.3.4"]), pw()));
        // Missing age data yields no detection.
        assert!(!dns.detect_young_domain(&answered("u3", "unknown.com", &["1.2.3.4"]), pw()));
        // Special domains are never aged.
        store.set_domain_age("example.arpa", 1);
        assert!(!dns.detect_young_domain(&answered("u4", "example.arpa", &["1.2.3.4"]), pw()));
        assert!(sink.is_empty());
    }

    // ── Invalid answers ──────────────────────────────────────────────────

    #[test]
    fn test_invalid_answer_fires_and_deletes_cached_resolution() {
        let (dns, store, sink) = analyzer();
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        store.cache_resolution(loopback, "example.com", None, 999.0);

        let fired = dns.check_invalid_answers(&answered("u1", "example.com", &["127.0.0.1"]), pw());
        assert_eq!(fired, 1);
        assert_eq!(sink.drain()[0].kind, EvidenceKind::InvalidDnsAnswer);
        assert!(store.dns_resolution(loopback).is_none());
    }

    #[test]
    fn test_invalid_answer_skips_localhost_and_valid_ips() {
        let (dns, store, sink) = analyzer();
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        store.cache_resolution(loopback, "localhost", None, 999.0);

        assert_eq!(dns.check_invalid_answers(&answered("u1", "localhost", &["127.0.0.1"]), pw()), 0);
        assert!(store.dns_resolution(loopback).is_some());

        assert_eq!(dns.check_invalid_answers(&answered("u2", "example.com", &["8.8.8.8"]), pw()), 0);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_unspecified_answer_is_invalid() {
        let (dns, _, sink) = analyzer();
        assert_eq!(dns.check_invalid_answers(&answered("u1", "example.com", &["0.0.0.0"]), pw()), 1);
        assert_eq!(sink.len(), 1);
    }

    // ── High entropy ─────────────────────────────────────────────────────

    #[test]
    fn test_entropy_fires_for_txt_answer_only() {
        let (dns, _, sink) = analyzer();
        let txn = answered(
            "u1",
            "example.com",
            &["A 1.2.3.4", "TXT abcdefghijklmnopqrstuvwxyz1234567890"],
        );
        assert!(dns.check_high_entropy_answers(&txn, pw()));
        let evidence = sink.drain();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].kind, EvidenceKind::HighEntropyDnsAnswer);
        assert!(evidence[0].description.contains("TXT"));
    }

    #[test]
    fn test_entropy_skips_non_txt_and_low_entropy() {
        let (dns, _, sink) = analyzer();
        // No TXT answer: the estimator is never consulted, nothing fires.
        assert!(!dns.check_high_entropy_answers(
            &answered("u1", "example.com", &["A 1.2.3.4", "AAAA 2001:db8::1"]),
            pw()
        ));
        // TXT below threshold.
        assert!(!dns.check_high_entropy_answers(
            &answered("u2", "example.com", &["TXT aaaa"]),
            pw()
        ));
        assert!(sink.is_empty());
    }

    #[test]
    fn test_shannon_entropy_bounds() {
        assert_eq!(DnsAnalyzer::shannon_entropy(""), 0.0);
        assert_eq!(DnsAnalyzer::shannon_entropy("aaaaaaaaaaaaaaaaaaaa"), 0.0);
        let mixed = DnsAnalyzer::shannon_entropy("qwerty123!@#$%^&*()_+");
        assert!(mixed >= 4.0, "got {}", mixed);
        let lowish = DnsAnalyzer::shannon_entropy("Hello world!");
        assert!(lowish < 4.0, "got {}", lowish);
    }

    // ── ARPA scan ────────────────────────────────────────────────────────

    fn arpa(uid: &str, ts: f64) -> DnsTransaction {
        DnsTransaction {
            uid: uid.into(),
            query: format!("{}.example.in-addr.arpa", uid),
            answers: vec![],
            rcode: DnsRcode::NoError,
            timestamp: ts,
        }
    }

    #[test]
    fn test_arpa_scan_fires_within_two_seconds() {
        let (dns, _, sink) = analyzer();
        let mut fired = false;
        for i in 0..10 {
            fired = dns.check_arpa_scan(&arpa(&format!("q{}", i), 1_000.0 + i as f64 * 0.1), pw());
        }
        assert!(fired);
        let evidence = sink.drain();
        assert_eq!(evidence.len(), 1);
        assert_eq!(evidence[0].kind, EvidenceKind::DnsArpaScan);
        assert_eq!(evidence[0].uids.len(), 10);
    }

    #[test]
    fn test_arpa_scan_slow_rate_never_fires() {
        let (dns, _, sink) = analyzer();
        let mut fired = false;
        for i in 0..10 {
            fired = dns.check_arpa_scan(&arpa(&format!("q{}", i), 1_000.0 + i as f64 * 0.3), pw());
        }
        assert!(!fired);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_arpa_scan_ignores_forward_queries() {
        let (dns, _, sink) = analyzer();
        for i in 0..20 {
            let txn = answered(&format!("u{}", i), "example.com", &[]);
            assert!(!dns.check_arpa_scan(&txn, pw()));
        }
        assert!(sink.is_empty());
    }

    #[test]
    fn test_arpa_scan_resets_after_firing() {
        let (dns, _, sink) = analyzer();
        for i in 0..10 {
            dns.check_arpa_scan(&arpa(&format!("q{}", i), 1_000.0 + i as f64 * 0.05), pw());
        }
        assert_eq!(sink.drain().len(), 1);
        // Trail cleared: the next fast burst needs a full threshold again.
        for i in 0..9 {
            assert!(!dns.check_arpa_scan(&arpa(&format!("r{}", i), 2_000.0 + i as f64 * 0.05), pw()));
        }
        assert!(sink.is_empty());
    }

    // ── Dispatch / infrastructure ────────────────────────────────────────

    #[test]
    fn test_on_dns_runs_all_checks() {
        let (dns, store, sink) = analyzer();
        store.set_domain_age("fresh.com", 10);

        let txn = DnsTransaction {
            uid: "u1".into(),
            query: "fresh.com".into(),
            answers: vec!["127.0.0.1".into(), "TXT qwerty123!@#$%^&*()_+".into()],
            rcode: DnsRcode::NoError,
            timestamp: 1_000.0,
        };
        dns.on_dns(&txn, pw().profile, pw().window);

        let kinds: Vec<EvidenceKind> = sink.drain().iter().map(|e| e.kind).collect();
        assert!(kinds.contains(&EvidenceKind::YoungDomain));
        assert!(kinds.contains(&EvidenceKind::InvalidDnsAnswer));
        assert!(kinds.contains(&EvidenceKind::HighEntropyDnsAnswer));
        assert_eq!(dns.queries_analyzed(), 1);
    }

    #[test]
    fn test_disabled_analyzer_is_inert() {
        let (dns, _, sink) = analyzer();
        dns.set_enabled(false);
        for i in 0..15 {
            dns.on_dns(&nxdomain(&format!("u{}", i), "gen.example"), pw().profile, pw().window);
        }
        assert!(sink.is_empty());
        assert_eq!(dns.queries_analyzed(), 0);
    }

    #[test]
    fn test_known_dns_server_from_store() {
        let (dns, store, _) = analyzer();
        let ip: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(!dns.is_dns_server(ip));
        store.add_dns_server(ip);
        assert!(dns.is_dns_server(ip));
    }
}
