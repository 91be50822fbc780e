//! The connection analyzer: one dispatch per completed flow into ~a dozen
//! independent checks. Checks are deliberately small and side-effect-free
//! toward each other; the only state they share is the profile store and
//! the evidence sink.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use warden_core::config::{AnalysisDirection, DetectionConfig};
use warden_core::deferral::DeferralTimer;
use warden_core::event_bus::DetectionBus;
use warden_core::evidence::EvidenceSink;
use warden_core::orgs::OrgDirectory;
use warden_core::store::{ProfileStore, Role};
use warden_core::types::{
    is_private_ip, is_private_ipv4, AppProto, ConnState, Direction, Evidence, EvidenceCategory,
    EvidenceKind, Flow, FlowType, PortProto, ProfileId, ProfileWindow, Proto, ReconnKey,
    ThreatLevel, TimeWindow,
};
use warden_dns::DnsAnalyzer;

use crate::dns_expectation::{effective_appproto, DnsExpectation};
use crate::upload::UploadMonitor;

pub struct ConnAnalyzer {
    cfg: DetectionConfig,
    store: Arc<dyn ProfileStore>,
    orgs: Arc<OrgDirectory>,
    sink: Arc<dyn EvidenceSink>,
    upload: UploadMonitor,
    expectation: DnsExpectation,
    /// High-port UDP hit counts per destination, feeding the P2P heuristic.
    p2p_hits: Mutex<HashMap<IpAddr, u32>>,
    flows_analyzed: AtomicU64,
    windows_closed: AtomicU64,
    enabled: AtomicBool,
}

impl ConnAnalyzer {
    pub fn new(
        cfg: DetectionConfig,
        store: Arc<dyn ProfileStore>,
        orgs: Arc<OrgDirectory>,
        sink: Arc<dyn EvidenceSink>,
        dns: Arc<DnsAnalyzer>,
        timer: Arc<DeferralTimer>,
    ) -> Self {
        let upload = UploadMonitor::new(cfg.clone(), store.clone(), sink.clone());
        let expectation = DnsExpectation::new(
            cfg.clone(),
            store.clone(),
            orgs.clone(),
            sink.clone(),
            dns,
            timer,
        );
        Self {
            cfg,
            store,
            orgs,
            sink,
            upload,
            expectation,
            p2p_hits: Mutex::new(HashMap::new()),
            flows_analyzed: AtomicU64::new(0),
            windows_closed: AtomicU64::new(0),
            enabled: AtomicBool::new(true),
        }
    }

    /// Subscribe this analyzer to the flow-completed and window-closed
    /// topics.
    pub fn attach(self: Arc<Self>, bus: &DetectionBus) {
        let this = Arc::clone(&self);
        bus.on_flow(move |flow, profile, window| this.on_flow(flow, profile, window));
        bus.on_window_closed(move |profile, window| self.on_window_closed(profile, window));
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn flows_analyzed(&self) -> u64 {
        self.flows_analyzed.load(Ordering::Relaxed)
    }

    pub fn windows_closed(&self) -> u64 {
        self.windows_closed.load(Ordering::Relaxed)
    }

    pub fn expectation(&self) -> &DnsExpectation {
        &self.expectation
    }

    /// Entry point for one completed flow.
    pub fn on_flow(&self, flow: &Flow, profile: ProfileId, window: TimeWindow) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        self.flows_analyzed.fetch_add(1, Ordering::Relaxed);
        let pw = ProfileWindow::new(profile, window);

        self.check_long_connection(flow, pw);
        self.check_unknown_port(flow, pw);
        self.check_reconnections(flow, pw);
        self.check_port_zero(flow, pw);
        self.check_localnet_usage(flow, pw, Direction::Src);
        self.check_localnet_usage(flow, pw, Direction::Dst);
        self.expectation.observe(flow, pw);
        self.check_multiple_ports(flow, pw);
        self.upload.check_flow(flow, pw);
        self.check_non_http_port_80(flow, pw);
        self.check_local_to_local(flow, pw);
        self.check_device_changing_ip(flow, pw);
    }

    /// Entry point for the window-closed signal: runs the cross-flow
    /// upload aggregate for the closing window.
    pub fn on_window_closed(&self, profile: ProfileId, window: TimeWindow) {
        if !self.enabled.load(Ordering::Relaxed) {
            return;
        }
        self.windows_closed.fetch_add(1, Ordering::Relaxed);
        self.upload.check_window(ProfileWindow::new(profile, window));
    }

    // ── Long connection ──────────────────────────────────────────────────

    pub fn check_long_connection(&self, flow: &Flow, pw: ProfileWindow) -> bool {
        if flow.saddr.is_multicast() || flow.daddr.is_multicast() {
            return false;
        }
        if flow.duration <= self.cfg.long_connection_secs {
            return false;
        }

        self.sink.emit(
            Evidence::new(
                EvidenceKind::LongConnection,
                ThreatLevel::Low,
                (flow.duration / 3600.0).min(1.0),
                EvidenceCategory::AnomalyConnection,
                format!(
                    "connection to {} lasted {:.0}s (threshold {:.0}s)",
                    flow.daddr, flow.duration, self.cfg.long_connection_secs
                ),
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

    // ── Unknown destination port ─────────────────────────────────────────

    /// Established connections to a port no service table, organization,
    /// P2P pattern or FTP convention explains.
    pub fn check_unknown_port(&self, flow: &Flow, pw: ProfileWindow) -> bool {
        if flow.dport == 0 || flow.state != ConnState::Established {
            return false;
        }
        let portproto = flow.portproto();
        if self.store.port_service(portproto).is_some() {
            return false;
        }
        if self.port_belongs_to_org(flow.daddr, portproto, pw.profile) {
            return false;
        }
        if flow.proto == Proto::Icmp {
            return false;
        }
        if self.is_p2p(flow) {
            return false;
        }
        if self.store.is_ftp_port(flow.dport) {
            return false;
        }

        self.sink.emit(
            Evidence::new(
                EvidenceKind::UnknownPort,
                ThreatLevel::High,
                1.0,
                EvidenceCategory::AnomalyConnection,
                format!(
                    "connection to unknown destination port {} of {}",
                    portproto, flow.daddr
                ),
                pw.profile,
                pw.window,
                flow.timestamp,
            )
            .with_attacker(Direction::Src, flow.saddr)
            .with_victim(Direction::Dst, flow.daddr)
            .with_uid(&flow.uid)
            .with_port(flow.dport)
            .with_proto(flow.proto),
        );
        true
    }

    /// High-port UDP fan-out. Not an evidence source: it only exempts the
    /// unknown-port check, since P2P clients legitimately spray unknown
    /// high ports.
    pub fn is_p2p(&self, flow: &Flow) -> bool {
        if flow.proto != Proto::Udp || flow.dport <= 30_000 {
            return false;
        }
        let mut hits = self.p2p_hits.lock();
        let count = hits.entry(flow.daddr).or_insert(0);
        *count += 1;
        *count >= self.cfg.p2p_single_dst_hits || hits.len() >= self.cfg.p2p_distinct_dsts
    }

    /// Whether a port known to belong to an organization is being used by
    /// that organization: direct IP/range membership, MAC-vendor substring,
    /// SNI/rDNS substring, or the org directory's own ranges.
    fn port_belongs_to_org(&self, daddr: IpAddr, portproto: PortProto, profile: ProfileId) -> bool {
        let Some(org) = self.store.organization_of_port(portproto) else {
            return false;
        };
        if org.ips.contains(&daddr) {
            return true;
        }
        if let IpAddr::V4(v4) = daddr {
            if org.ranges.iter().any(|r| r.contains(v4)) {
                return true;
            }
        }

        let src_vendor = self
            .store
            .mac_vendor(profile)
            .unwrap_or_default()
            .to_lowercase();
        let dst_vendor = self
            .store
            .mac_vendor(ProfileId(daddr))
            .unwrap_or_default()
            .to_lowercase();
        let mut identification = String::new();
        if let Some(meta) = self.store.ip_metadata(daddr) {
            if let Some(sni) = meta.sni {
                identification.push_str(&sni.to_lowercase());
                identification.push(' ');
            }
            if let Some(rdns) = meta.rdns {
                identification.push_str(&rdns.to_lowercase());
            }
        }

        for name in &org.names {
            let name = name.to_lowercase();
            if !src_vendor.is_empty() && src_vendor.contains(&name) {
                return true;
            }
            if !dst_vendor.is_empty() && dst_vendor.contains(&name) {
                return true;
            }
            if !identification.is_empty() && identification.contains(&name) {
                return true;
            }
            if self.orgs.is_ip_in_org(daddr, &name) {
                return true;
            }
        }
        false
    }

    // ── Reconnection storm ───────────────────────────────────────────────

    /// Rejected attempts accumulate per (saddr, daddr, dport) in the store;
    /// the attempt that reaches the threshold fires with every accumulated
    /// uid and resets that key to zero.
    pub fn check_reconnections(&self, flow: &Flow, pw: ProfileWindow) -> bool {
        if flow.origstate != ConnState::Rejected {
            return false;
        }
        let key = ReconnKey {
            saddr: flow.saddr,
            daddr: flow.daddr,
            dport: flow.dport,
        };

        let mut table = self.store.reconnections(pw);
        let fired = {
            let entry = table.entry(key).or_default();
            entry.attempts += 1;
            entry.uids.push(flow.uid.clone());
            if entry.attempts >= self.cfg.reconnection_threshold {
                let attempts = entry.attempts;
                let uids = std::mem::take(&mut entry.uids);
                entry.attempts = 0;
                Some((attempts, uids))
            } else {
                None
            }
        };
        self.store.set_reconnections(pw, table);

        let Some((attempts, uids)) = fired else {
            return false;
        };
        self.sink.emit(
            Evidence::new(
                EvidenceKind::MultipleReconnectionAttempts,
                ThreatLevel::Medium,
                (attempts as f64 / 10.0).min(1.0),
                EvidenceCategory::AnomalyTraffic,
                format!(
                    "{} rejected reconnection attempts from {} to {}:{}",
                    attempts, flow.saddr, flow.daddr, flow.dport
                ),
                pw.profile,
                pw.window,
                flow.timestamp,
            )
            .with_attacker(Direction::Src, flow.saddr)
            .with_victim(Direction::Dst, flow.daddr)
            .with_uids(uids)
            .with_port(flow.dport)
            .with_proto(flow.proto),
        );
        true
    }

    // ── Port 0 ───────────────────────────────────────────────────────────

    pub fn check_port_zero(&self, flow: &Flow, pw: ProfileWindow) -> bool {
        if matches!(flow.proto, Proto::Icmp | Proto::Igmp | Proto::Arp) {
            return false;
        }
        if flow.sport != 0 && flow.dport != 0 {
            return false;
        }

        // The side speaking from port 0 is the attacker.
        let (attacker, victim) = if flow.sport == 0 {
            ((Direction::Src, flow.saddr), (Direction::Dst, flow.daddr))
        } else {
            ((Direction::Dst, flow.daddr), (Direction::Src, flow.saddr))
        };
        self.sink.emit(
            Evidence::new(
                EvidenceKind::Port0Connection,
                ThreatLevel::High,
                0.8,
                EvidenceCategory::AnomalyConnection,
                format!(
                    "connection on port 0: {}:{} -> {}:{}",
                    flow.saddr, flow.sport, flow.daddr, flow.dport
                ),
                pw.profile,
                pw.window,
                flow.timestamp,
            )
            .with_attacker(attacker.0, attacker.1)
            .with_victim(victim.0, victim.1)
            .with_uid(&flow.uid)
            .with_proto(flow.proto),
        );
        true
    }

    // ── Differing-localnet usage ─────────────────────────────────────────

    /// A private address outside the configured local network prefix.
    /// Source and destination are judged independently; skipped entirely
    /// while the local network is not configured yet.
    pub fn check_localnet_usage(&self, flow: &Flow, pw: ProfileWindow, which: Direction) -> bool {
        let ip = match which {
            Direction::Src => flow.saddr,
            Direction::Dst => flow.daddr,
        };
        let Some(localnet) = self.store.local_network() else {
            return false;
        };
        let IpAddr::V4(v4) = ip else {
            return false;
        };
        if !v4.is_private() || localnet.contains(v4) {
            return false;
        }

        let side = match which {
            Direction::Src => "source",
            Direction::Dst => "destination",
        };
        self.sink.emit(
            Evidence::new(
                EvidenceKind::DifferentLocalnetUsage,
                ThreatLevel::Medium,
                1.0,
                EvidenceCategory::AnomalyTraffic,
                format!(
                    "{} {} is a private address outside the local network {}",
                    side, ip, localnet
                ),
                pw.profile,
                pw.window,
                flow.timestamp,
            )
            .with_attacker(which, ip)
            .with_uid(&flow.uid)
            .with_port(flow.dport)
            .with_proto(flow.proto),
        );
        true
    }

    // ── Local to local ───────────────────────────────────────────────────

    /// Private-to-private connections, exempting DNS to the gateway which
    /// would otherwise flood this finding.
    pub fn check_local_to_local(&self, flow: &Flow, pw: ProfileWindow) -> bool {
        let is_gateway_dns = flow.dport == 53
            && flow.proto == Proto::Udp
            && Some(flow.daddr) == self.store.gateway_ip();
        if is_gateway_dns {
            return false;
        }
        if !(is_private_ip(flow.saddr) && is_private_ip(flow.daddr)) {
            return false;
        }

        self.sink.emit(
            Evidence::new(
                EvidenceKind::ConnectionToPrivateIp,
                ThreatLevel::Info,
                1.0,
                EvidenceCategory::AnomalyConnection,
                format!(
                    "connection between private addresses {} -> {}:{}",
                    flow.saddr, flow.daddr, flow.dport
                ),
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

    // ── Multi-port scan to a single peer ─────────────────────────────────

    /// Established TCP to a service nothing identifies, where the store's
    /// aggregate shows more than one distinct established port between the
    /// same two endpoints.
    pub fn check_multiple_ports(&self, flow: &Flow, pw: ProfileWindow) -> bool {
        if flow.proto != Proto::Tcp || flow.state != ConnState::Established {
            return false;
        }
        if effective_appproto(flow).is_some() {
            return false;
        }
        if self.store.port_service(flow.portproto()).is_some() {
            return false;
        }

        if pw.profile.ip() == flow.saddr {
            // The profile is the client scanning a destination.
            let peers = self.store.established_peers(pw, Direction::Dst, Role::Client);
            let Some(peer) = peers.get(&flow.daddr) else {
                return false;
            };
            if peer.dstports.len() <= 1 {
                return false;
            }
            self.emit_multiple_ports(pw, flow, flow.saddr, flow.daddr, peer);
            true
        } else if pw.profile.ip() == flow.daddr
            && self.cfg.analysis_direction == AnalysisDirection::All
        {
            // Bidirectional capture: the profile is the server being scanned.
            let peers = self.store.established_peers(pw, Direction::Src, Role::Server);
            let Some(peer) = peers.get(&flow.saddr) else {
                return false;
            };
            if peer.dstports.len() <= 1 {
                return false;
            }
            self.emit_multiple_ports(pw, flow, flow.saddr, flow.daddr, peer);
            true
        } else {
            false
        }
    }

    fn emit_multiple_ports(
        &self,
        pw: ProfileWindow,
        flow: &Flow,
        attacker: IpAddr,
        victim: IpAddr,
        peer: &warden_core::store::PeerPorts,
    ) {
        let ports: Vec<String> = peer.dstports.iter().map(|p| p.to_string()).collect();
        self.sink.emit(
            Evidence::new(
                EvidenceKind::ConnectionToMultiplePorts,
                ThreatLevel::Medium,
                0.5,
                EvidenceCategory::ReconScanning,
                format!(
                    "established connections to multiple ports [{}] of {}",
                    ports.join(", "),
                    victim
                ),
                pw.profile,
                pw.window,
                flow.timestamp,
            )
            .with_attacker(Direction::Src, attacker)
            .with_victim(Direction::Dst, victim)
            .with_uids(peer.uids.clone())
            .with_proto(flow.proto),
        );
    }

    // ── Non-HTTP traffic on port 80 ──────────────────────────────────────

    pub fn check_non_http_port_80(&self, flow: &Flow, pw: ProfileWindow) -> bool {
        if flow.dport != 80
            || flow.proto != Proto::Tcp
            || flow.state != ConnState::Established
            || flow.allbytes == 0
        {
            return false;
        }
        if effective_appproto(flow) == Some(AppProto::Http) {
            return false;
        }

        self.sink.emit(
            Evidence::new(
                EvidenceKind::NonHttpPort80,
                ThreatLevel::Medium,
                0.8,
                EvidenceCategory::AnomalyTraffic,
                format!("non-HTTP established connection on port 80 to {}", flow.daddr),
                pw.profile,
                pw.window,
                flow.timestamp,
            )
            .with_attacker(Direction::Src, flow.saddr)
            .with_victim(Direction::Dst, flow.daddr)
            .with_uid(&flow.uid)
            .with_port(80)
            .with_proto(flow.proto),
        );
        true
    }

    // ── Device changing IPs ──────────────────────────────────────────────

    /// Evaluated once per unique source IP, on its first conn flow: a MAC
    /// already bound to a different private IPv4 means the device moved or
    /// someone is spoofing. IPv6-only prior bindings are not comparable.
    pub fn check_device_changing_ip(&self, flow: &Flow, pw: ProfileWindow) -> bool {
        if flow.flow_type != FlowType::Conn {
            return false;
        }
        let Some(smac) = &flow.smac else {
            return false;
        };
        let saddr = pw.profile.ip();
        if !is_private_ipv4(saddr) {
            return false;
        }
        if self.store.mark_srcip_seen(saddr) {
            // Not the first conn flow for this source.
            return false;
        }
        let Some(bound) = self.store.ips_of_mac(smac) else {
            return false;
        };
        let Some(old) = bound.iter().copied().find(|ip| ip.is_ipv4()) else {
            return false;
        };
        if old == saddr {
            return false;
        }

        self.sink.emit(
            Evidence::new(
                EvidenceKind::DeviceChangingIp,
                ThreatLevel::Medium,
                0.8,
                EvidenceCategory::AnomalyTraffic,
                format!("MAC {} of {} was previously bound to {}", smac, saddr, old),
                pw.profile,
                pw.window,
                flow.timestamp,
            )
            .with_attacker(Direction::Src, saddr)
            .with_uid(&flow.uid),
        );
        true
    }
}
