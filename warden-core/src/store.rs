//! The profile/time-window store: everything the analyzers know about a
//! monitored source IP beyond the event they are currently holding.
//!
//! The [`ProfileStore`] trait is the narrow get/set contract; absence is
//! always "unknown", never an error; a detector that cannot find what it
//! needs degrades to "no detection". [`MemoryStore`] is the in-process
//! implementation used by tests and single-node deployments; deployments
//! sharing aggregates across capture processes put a networked store behind
//! the same trait.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::IpAddr;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::types::{Direction, Ipv4Cidr, PortProto, ProfileId, ProfileWindow, ReconnKey};

// ── Contract types ───────────────────────────────────────────────────────────

/// Whether the engine is fed from a live interface, a log directory that is
/// still being written, or a finished log file with no DNS visibility
/// guarantees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IngestKind {
    LiveInterface,
    GrowingLogDir,
    LogFile,
}

/// Accumulated rejected-connection attempts for one [`ReconnKey`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconnEntry {
    pub attempts: u32,
    pub uids: Vec<String>,
}

/// A cached DNS resolution for one IP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsResolution {
    pub domains: Vec<String>,
    /// Source addresses that performed the resolving queries.
    pub resolved_by: Vec<IpAddr>,
    /// Epoch seconds of the latest resolving answer.
    pub last_seen: f64,
}

/// Established-connection aggregate for one peer of a profile/window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PeerPorts {
    pub dstports: BTreeSet<u16>,
    pub uids: Vec<String>,
}

/// The role the profile played in the aggregated connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    Client,
    Server,
}

/// Organizations known to use a given port/protocol pair.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PortOrganization {
    pub names: Vec<String>,
    pub ranges: Vec<Ipv4Cidr>,
    pub ips: Vec<IpAddr>,
}

/// Passive metadata collected for an IP.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IpMetadata {
    pub sni: Option<String>,
    pub rdns: Option<String>,
    pub asn: Option<String>,
}

/// The slice of a flow the window-close upload aggregate needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SentSample {
    pub uid: String,
    pub daddr: IpAddr,
    pub sbytes: u64,
    pub timestamp: f64,
}

// ── The contract ─────────────────────────────────────────────────────────────

pub trait ProfileStore: Send + Sync {
    // Reconnection table, round-tripped per profile/window.
    fn reconnections(&self, key: ProfileWindow) -> HashMap<ReconnKey, ReconnEntry>;
    fn set_reconnections(&self, key: ProfileWindow, table: HashMap<ReconnKey, ReconnEntry>);

    // Network facts.
    fn local_network(&self) -> Option<Ipv4Cidr>;
    fn gateway_ip(&self) -> Option<IpAddr>;
    fn client_ips(&self) -> Vec<IpAddr>;
    fn own_ips(&self) -> Vec<IpAddr>;

    // Cached DNS resolutions.
    fn dns_resolution(&self, ip: IpAddr) -> Option<DnsResolution>;
    /// Whether `ip` has a cached resolution no older than `max_age_hours`
    /// relative to `now` (epoch seconds).
    fn is_ip_resolved_within(&self, ip: IpAddr, max_age_hours: f64, now: f64) -> bool;
    fn delete_dns_resolution(&self, ip: IpAddr);
    /// IPs a domain is known to resolve to.
    fn domain_ips(&self, domain: &str) -> Vec<IpAddr>;

    // MAC bindings.
    fn ips_of_mac(&self, mac: &str) -> Option<Vec<IpAddr>>;
    fn mac_vendor(&self, profile: ProfileId) -> Option<String>;

    /// Atomically mark a source IP as seen in the connection log. Returns
    /// true when it had already been marked; callers use this as a
    /// check-once gate.
    fn mark_srcip_seen(&self, ip: IpAddr) -> bool;

    // Aggregates.
    fn established_peers(
        &self,
        key: ProfileWindow,
        direction: Direction,
        role: Role,
    ) -> HashMap<IpAddr, PeerPorts>;
    fn contacted_ips(&self, key: ProfileWindow) -> Vec<IpAddr>;
    fn window_flows(&self, key: ProfileWindow) -> Vec<SentSample>;

    // Port and domain knowledge.
    fn port_service(&self, portproto: PortProto) -> Option<String>;
    fn organization_of_port(&self, portproto: PortProto) -> Option<PortOrganization>;
    fn is_ftp_port(&self, port: u16) -> bool;
    fn domain_age_days(&self, domain: &str) -> Option<u32>;
    fn ip_metadata(&self, ip: IpAddr) -> Option<IpMetadata>;

    // Profile identity.
    fn other_ip_version(&self, profile: ProfileId) -> Option<IpAddr>;

    // DNS infrastructure.
    fn is_doh_server(&self, ip: IpAddr) -> bool;
    fn is_known_dns_server(&self, ip: IpAddr) -> bool;

    // Engine lifecycle facts.
    fn ingest_kind(&self) -> IngestKind;
    /// Epoch seconds at which the engine started consuming.
    fn start_time(&self) -> f64;
}

// ── In-memory implementation ─────────────────────────────────────────────────

type PeerKey = (ProfileWindow, Direction, Role);

pub struct MemoryStore {
    reconnections: RwLock<HashMap<ProfileWindow, HashMap<ReconnKey, ReconnEntry>>>,
    local_network: RwLock<Option<Ipv4Cidr>>,
    gateway: RwLock<Option<IpAddr>>,
    client_ips: RwLock<Vec<IpAddr>>,
    own_ips: RwLock<Vec<IpAddr>>,
    resolutions: RwLock<HashMap<IpAddr, DnsResolution>>,
    domains: RwLock<HashMap<String, Vec<IpAddr>>>,
    mac_ips: RwLock<HashMap<String, Vec<IpAddr>>>,
    mac_vendors: RwLock<HashMap<ProfileId, String>>,
    seen_srcips: Mutex<HashSet<IpAddr>>,
    peers: RwLock<HashMap<PeerKey, HashMap<IpAddr, PeerPorts>>>,
    contacted: RwLock<HashMap<ProfileWindow, Vec<IpAddr>>>,
    flows: RwLock<HashMap<ProfileWindow, Vec<SentSample>>>,
    port_services: RwLock<HashMap<PortProto, String>>,
    port_orgs: RwLock<HashMap<PortProto, PortOrganization>>,
    ftp_ports: RwLock<HashSet<u16>>,
    domain_ages: RwLock<HashMap<String, u32>>,
    ip_meta: RwLock<HashMap<IpAddr, IpMetadata>>,
    other_version: RwLock<HashMap<ProfileId, IpAddr>>,
    doh_servers: RwLock<HashSet<IpAddr>>,
    dns_servers: RwLock<HashSet<IpAddr>>,
    ingest_kind: RwLock<IngestKind>,
    start_time: RwLock<f64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            reconnections: RwLock::new(HashMap::new()),
            local_network: RwLock::new(None),
            gateway: RwLock::new(None),
            client_ips: RwLock::new(Vec::new()),
            own_ips: RwLock::new(Vec::new()),
            resolutions: RwLock::new(HashMap::new()),
            domains: RwLock::new(HashMap::new()),
            mac_ips: RwLock::new(HashMap::new()),
            mac_vendors: RwLock::new(HashMap::new()),
            seen_srcips: Mutex::new(HashSet::new()),
            peers: RwLock::new(HashMap::new()),
            contacted: RwLock::new(HashMap::new()),
            flows: RwLock::new(HashMap::new()),
            port_services: RwLock::new(HashMap::new()),
            port_orgs: RwLock::new(HashMap::new()),
            ftp_ports: RwLock::new(HashSet::from([20, 21, 990])),
            domain_ages: RwLock::new(HashMap::new()),
            ip_meta: RwLock::new(HashMap::new()),
            other_version: RwLock::new(HashMap::new()),
            doh_servers: RwLock::new(HashSet::new()),
            dns_servers: RwLock::new(HashSet::new()),
            ingest_kind: RwLock::new(IngestKind::LiveInterface),
            start_time: RwLock::new(0.0),
        }
    }

    // ── Seeding (the ingestion side's write surface) ─────────────────────

    pub fn set_local_network(&self, net: Ipv4Cidr) {
        *self.local_network.write() = Some(net);
    }

    pub fn set_gateway_ip(&self, ip: IpAddr) {
        *self.gateway.write() = Some(ip);
    }

    pub fn set_client_ips(&self, ips: Vec<IpAddr>) {
        *self.client_ips.write() = ips;
    }

    pub fn set_own_ips(&self, ips: Vec<IpAddr>) {
        *self.own_ips.write() = ips;
    }

    /// Record a resolution `domain -> ip`, made by `resolved_by`, at `ts`.
    pub fn cache_resolution(
        &self,
        ip: IpAddr,
        domain: &str,
        resolved_by: Option<IpAddr>,
        ts: f64,
    ) {
        let mut resolutions = self.resolutions.write();
        let entry = resolutions.entry(ip).or_default();
        if !entry.domains.iter().any(|d| d == domain) {
            entry.domains.push(domain.to_string());
        }
        if let Some(by) = resolved_by {
            if !entry.resolved_by.contains(&by) {
                entry.resolved_by.push(by);
            }
        }
        entry.last_seen = entry.last_seen.max(ts);

        let mut domains = self.domains.write();
        let ips = domains.entry(domain.to_string()).or_default();
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }

    pub fn set_domain_ips(&self, domain: &str, ips: Vec<IpAddr>) {
        self.domains.write().insert(domain.to_string(), ips);
    }

    pub fn bind_mac(&self, mac: &str, ips: Vec<IpAddr>) {
        self.mac_ips.write().insert(mac.to_lowercase(), ips);
    }

    pub fn set_mac_vendor(&self, profile: ProfileId, vendor: &str) {
        self.mac_vendors.write().insert(profile, vendor.to_string());
    }

    pub fn record_established_peer(
        &self,
        key: ProfileWindow,
        direction: Direction,
        role: Role,
        peer: IpAddr,
        dport: u16,
        uid: &str,
    ) {
        let mut peers = self.peers.write();
        let entry = peers
            .entry((key, direction, role))
            .or_default()
            .entry(peer)
            .or_default();
        entry.dstports.insert(dport);
        entry.uids.push(uid.to_string());
    }

    pub fn record_contacted_ip(&self, key: ProfileWindow, ip: IpAddr) {
        let mut contacted = self.contacted.write();
        let ips = contacted.entry(key).or_default();
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }

    pub fn record_flow(&self, key: ProfileWindow, sample: SentSample) {
        self.flows.write().entry(key).or_default().push(sample);
    }

    pub fn set_port_service(&self, portproto: PortProto, service: &str) {
        self.port_services.write().insert(portproto, service.to_string());
    }

    pub fn set_port_organization(&self, portproto: PortProto, org: PortOrganization) {
        self.port_orgs.write().insert(portproto, org);
    }

    pub fn add_ftp_port(&self, port: u16) {
        self.ftp_ports.write().insert(port);
    }

    pub fn set_domain_age(&self, domain: &str, age_days: u32) {
        self.domain_ages.write().insert(domain.to_string(), age_days);
    }

    pub fn set_ip_metadata(&self, ip: IpAddr, meta: IpMetadata) {
        self.ip_meta.write().insert(ip, meta);
    }

    pub fn set_other_ip_version(&self, profile: ProfileId, other: IpAddr) {
        self.other_version.write().insert(profile, other);
    }

    pub fn add_doh_server(&self, ip: IpAddr) {
        self.doh_servers.write().insert(ip);
    }

    pub fn add_dns_server(&self, ip: IpAddr) {
        self.dns_servers.write().insert(ip);
    }

    pub fn set_ingest_kind(&self, kind: IngestKind) {
        *self.ingest_kind.write() = kind;
    }

    pub fn set_start_time(&self, ts: f64) {
        *self.start_time.write() = ts;
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ProfileStore for MemoryStore {
    fn reconnections(&self, key: ProfileWindow) -> HashMap<ReconnKey, ReconnEntry> {
        self.reconnections.read().get(&key).cloned().unwrap_or_default()
    }

    fn set_reconnections(&self, key: ProfileWindow, table: HashMap<ReconnKey, ReconnEntry>) {
        self.reconnections.write().insert(key, table);
    }

    fn local_network(&self) -> Option<Ipv4Cidr> {
        *self.local_network.read()
    }

    fn gateway_ip(&self) -> Option<IpAddr> {
        *self.gateway.read()
    }

    fn client_ips(&self) -> Vec<IpAddr> {
        self.client_ips.read().clone()
    }

    fn own_ips(&self) -> Vec<IpAddr> {
        self.own_ips.read().clone()
    }

    fn dns_resolution(&self, ip: IpAddr) -> Option<DnsResolution> {
        self.resolutions.read().get(&ip).cloned()
    }

    fn is_ip_resolved_within(&self, ip: IpAddr, max_age_hours: f64, now: f64) -> bool {
        self.resolutions
            .read()
            .get(&ip)
            .map(|r| now - r.last_seen <= max_age_hours * 3600.0)
            .unwrap_or(false)
    }

    fn delete_dns_resolution(&self, ip: IpAddr) {
        self.resolutions.write().remove(&ip);
    }

    fn domain_ips(&self, domain: &str) -> Vec<IpAddr> {
        self.domains.read().get(domain).cloned().unwrap_or_default()
    }

    fn ips_of_mac(&self, mac: &str) -> Option<Vec<IpAddr>> {
        self.mac_ips.read().get(&mac.to_lowercase()).cloned()
    }

    fn mac_vendor(&self, profile: ProfileId) -> Option<String> {
        self.mac_vendors.read().get(&profile).cloned()
    }

    fn mark_srcip_seen(&self, ip: IpAddr) -> bool {
        !self.seen_srcips.lock().insert(ip)
    }

    fn established_peers(
        &self,
        key: ProfileWindow,
        direction: Direction,
        role: Role,
    ) -> HashMap<IpAddr, PeerPorts> {
        self.peers
            .read()
            .get(&(key, direction, role))
            .cloned()
            .unwrap_or_default()
    }

    fn contacted_ips(&self, key: ProfileWindow) -> Vec<IpAddr> {
        self.contacted.read().get(&key).cloned().unwrap_or_default()
    }

    fn window_flows(&self, key: ProfileWindow) -> Vec<SentSample> {
        self.flows.read().get(&key).cloned().unwrap_or_default()
    }

    fn port_service(&self, portproto: PortProto) -> Option<String> {
        self.port_services.read().get(&portproto).cloned()
    }

    fn organization_of_port(&self, portproto: PortProto) -> Option<PortOrganization> {
        self.port_orgs.read().get(&portproto).cloned()
    }

    fn is_ftp_port(&self, port: u16) -> bool {
        self.ftp_ports.read().contains(&port)
    }

    fn domain_age_days(&self, domain: &str) -> Option<u32> {
        self.domain_ages.read().get(domain).copied()
    }

    fn ip_metadata(&self, ip: IpAddr) -> Option<IpMetadata> {
        self.ip_meta.read().get(&ip).cloned()
    }

    fn other_ip_version(&self, profile: ProfileId) -> Option<IpAddr> {
        self.other_version.read().get(&profile).copied()
    }

    fn is_doh_server(&self, ip: IpAddr) -> bool {
        self.doh_servers.read().contains(&ip)
    }

    fn is_known_dns_server(&self, ip: IpAddr) -> bool {
        self.dns_servers.read().contains(&ip)
    }

    fn ingest_kind(&self) -> IngestKind {
        *self.ingest_kind.read()
    }

    fn start_time(&self) -> f64 {
        *self.start_time.read()
    }
}
