//! The connection-without-DNS state machine.
//!
//! A connection to a destination nothing ever resolved is suspicious, but
//! the resolving answer may simply not have been ingested yet. So the first
//! sighting of an unresolved destination parks the flow's uid in a pending
//! set and schedules exactly one deferred re-check; the re-check either
//! finds a justification (late resolution, the device's other IP-version
//! address, a well-known organization) or confirms the anomaly.
//!
//! The pending set is the single point of truth for "has this uid been
//! decided": the deferred path removes membership exactly once, and a
//! removal that finds nothing is a benign no-op. Per uid there is at most
//! one deferred re-check, ever.

use std::collections::{HashMap, HashSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use warden_core::config::DetectionConfig;
use warden_core::deferral::DeferralTimer;
use warden_core::evidence::EvidenceSink;
use warden_core::orgs::OrgDirectory;
use warden_core::store::{IngestKind, ProfileStore};
use warden_core::types::{
    is_ignored_destination, AppProto, Direction, Evidence, EvidenceCategory, EvidenceKind, Flow,
    FlowType, ProfileId, ProfileWindow, ThreatLevel, TimeWindow,
};
use warden_dns::correlation::{made_by_other_ip_version, VersionCorrelation};
use warden_dns::DnsAnalyzer;

/// Uids tracked before the terminal-state map is reset wholesale.
const MAX_TRACKED_UIDS: usize = 100_000;

/// Where a uid sits in the check's lifecycle. Uids that were never parked
/// have no entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DnsCheckState {
    AwaitingDns,
    Resolved,
    ConfirmedAnomaly,
}

/// Everything the deferred re-check needs, captured at first sight.
#[derive(Debug, Clone)]
pub struct PendingCheck {
    pub uid: String,
    pub saddr: IpAddr,
    pub daddr: IpAddr,
    pub profile: ProfileId,
    pub window: TimeWindow,
    pub timestamp: f64,
}

/// Cheaply cloneable handle; the deferred closure holds the same inner
/// state the consuming path mutates.
#[derive(Clone)]
pub struct DnsExpectation {
    inner: Arc<Inner>,
}

struct Inner {
    cfg: DetectionConfig,
    store: Arc<dyn ProfileStore>,
    orgs: Arc<OrgDirectory>,
    sink: Arc<dyn EvidenceSink>,
    dns: Arc<DnsAnalyzer>,
    timer: Arc<DeferralTimer>,
    /// Uids awaiting their single deferred re-check.
    pending: Mutex<HashSet<String>>,
    /// Lifecycle of every uid that was ever parked.
    states: Mutex<HashMap<String, DnsCheckState>>,
    rechecks_run: AtomicU64,
    confirmed: AtomicU64,
}

impl DnsExpectation {
    pub fn new(
        cfg: DetectionConfig,
        store: Arc<dyn ProfileStore>,
        orgs: Arc<OrgDirectory>,
        sink: Arc<dyn EvidenceSink>,
        dns: Arc<DnsAnalyzer>,
        timer: Arc<DeferralTimer>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                cfg,
                store,
                orgs,
                sink,
                dns,
                timer,
                pending: Mutex::new(HashSet::new()),
                states: Mutex::new(HashMap::new()),
                rechecks_run: AtomicU64::new(0),
                confirmed: AtomicU64::new(0),
            }),
        }
    }

    /// Run the check against one flow on the consuming path.
    pub fn observe(&self, flow: &Flow, pw: ProfileWindow) {
        let inner = &self.inner;
        if inner.should_skip(flow) {
            return;
        }
        if !inner.passes_live_gate(flow) {
            return;
        }
        // A uid already awaiting its re-check, or already decided, is never
        // evaluated again from this path.
        if inner.states.lock().contains_key(&flow.uid) {
            return;
        }
        if inner.store.is_ip_resolved_within(
            flow.daddr,
            inner.cfg.resolution_cache_hours,
            flow.timestamp,
        ) {
            return;
        }

        {
            let mut states = inner.states.lock();
            if states.len() >= MAX_TRACKED_UIDS {
                states.clear();
            }
            states.insert(flow.uid.clone(), DnsCheckState::AwaitingDns);
        }
        inner.pending.lock().insert(flow.uid.clone());

        let req = PendingCheck {
            uid: flow.uid.clone(),
            saddr: flow.saddr,
            daddr: flow.daddr,
            profile: pw.profile,
            window: pw.window,
            timestamp: flow.timestamp,
        };
        debug!(uid = %req.uid, daddr = %req.daddr, "no resolution yet, deferring re-check");
        let deferred = Arc::clone(inner);
        inner.timer.schedule(
            Duration::from_secs_f64(inner.cfg.dns_grace_secs),
            move || deferred.recheck(req),
        );
    }

    /// The deferred half, callable directly for deterministic tests.
    pub fn recheck(&self, req: PendingCheck) {
        self.inner.recheck(req);
    }

    // ── Introspection ────────────────────────────────────────────────────

    pub fn state_of(&self, uid: &str) -> Option<DnsCheckState> {
        self.inner.states.lock().get(uid).copied()
    }

    pub fn pending_len(&self) -> usize {
        self.inner.pending.lock().len()
    }

    pub fn rechecks_run(&self) -> u64 {
        self.inner.rechecks_run.load(Ordering::Relaxed)
    }

    pub fn confirmed_count(&self) -> u64 {
        self.inner.confirmed.load(Ordering::Relaxed)
    }
}

impl Inner {
    /// Runs concurrently with the consuming path; the pending-set removal
    /// is what makes a duplicate firing a no-op.
    fn recheck(&self, req: PendingCheck) {
        self.rechecks_run.fetch_add(1, Ordering::Relaxed);
        if !self.pending.lock().remove(&req.uid) {
            return;
        }

        if self.is_resolved_now(&req) {
            self.states
                .lock()
                .insert(req.uid.clone(), DnsCheckState::Resolved);
            return;
        }

        self.states
            .lock()
            .insert(req.uid.clone(), DnsCheckState::ConfirmedAnomaly);
        self.confirmed.fetch_add(1, Ordering::Relaxed);
        self.sink.emit(
            Evidence::new(
                EvidenceKind::ConnectionWithoutDns,
                ThreatLevel::High,
                0.8,
                EvidenceCategory::AnomalyConnection,
                format!("connection to {} without a prior DNS resolution", req.daddr),
                req.profile,
                req.window,
                req.timestamp,
            )
            .with_attacker(Direction::Src, req.saddr)
            .with_victim(Direction::Dst, req.daddr)
            .with_uid(&req.uid),
        );
    }

    // ── Gates ────────────────────────────────────────────────────────────

    fn should_skip(&self, flow: &Flow) -> bool {
        if flow.flow_type != FlowType::Conn {
            return true;
        }
        if matches!(effective_appproto(flow), Some(AppProto::Dns | AppProto::Icmp)) {
            return true;
        }
        if is_ignored_destination(flow.daddr, self.store.gateway_ip()) {
            return true;
        }
        if self.store.own_ips().contains(&flow.daddr) {
            return true;
        }
        // A connection from outside to one of our clients had its
        // resolution made on the remote side.
        if self.store.client_ips().contains(&flow.daddr) {
            return true;
        }
        // A finished log file carries no DNS visibility guarantee.
        if self.store.ingest_kind() == IngestKind::LogFile {
            return true;
        }
        if self.store.is_doh_server(flow.daddr) {
            return true;
        }
        if self.dns.is_dns_server(flow.daddr) {
            return true;
        }
        false
    }

    /// Live capture starts mid-conversation: resolutions predating the
    /// engine are invisible, so the check stays quiet through a warm-up
    /// period and only judges flows originated by locally-owned addresses.
    fn passes_live_gate(&self, flow: &Flow) -> bool {
        match self.store.ingest_kind() {
            IngestKind::LiveInterface | IngestKind::GrowingLogDir => {
                if !self.store.own_ips().contains(&flow.saddr) {
                    return false;
                }
                let elapsed_mins = (flow.timestamp - self.store.start_time()) / 60.0;
                elapsed_mins >= self.cfg.dns_warmup_mins
            }
            IngestKind::LogFile => true,
        }
    }

    fn is_resolved_now(&self, req: &PendingCheck) -> bool {
        if self.store.is_ip_resolved_within(
            req.daddr,
            self.cfg.resolution_cache_hours,
            req.timestamp,
        ) {
            return true;
        }
        // The device may have resolved the name from its other IP-version
        // address.
        if let Some(resolution) = self.store.dns_resolution(req.daddr) {
            if let Some(other) = self.store.other_ip_version(req.profile) {
                if resolution.resolved_by.contains(&other) {
                    return true;
                }
            }
        }
        if made_by_other_ip_version(
            self.store.as_ref(),
            req.profile,
            req.window,
            &[req.daddr],
        ) == VersionCorrelation::Confirmed
        {
            return true;
        }
        self.is_well_known_org(req.daddr)
    }

    /// SNI, rDNS and ASN of the destination checked against every known
    /// organization, plus direct range membership.
    fn is_well_known_org(&self, ip: IpAddr) -> bool {
        let meta = self.store.ip_metadata(ip);
        for org in self.orgs.org_names() {
            if let Some(meta) = &meta {
                if let Some(asn) = &meta.asn {
                    if self.orgs.is_asn_in_org(asn, &org) {
                        return true;
                    }
                }
                for domain in [&meta.sni, &meta.rdns].into_iter().flatten() {
                    if self.orgs.is_domain_in_org(domain, &org) {
                        return true;
                    }
                }
            }
            if self.orgs.is_ip_in_org(ip, &org) {
                return true;
            }
        }
        false
    }
}

/// The protocol detector sometimes leaves the tag empty; the flow-type tag
/// is the fallback.
pub(crate) fn effective_appproto(flow: &Flow) -> Option<AppProto> {
    flow.appproto.or(match flow.flow_type {
        FlowType::Dns => Some(AppProto::Dns),
        _ => None,
    })
}
