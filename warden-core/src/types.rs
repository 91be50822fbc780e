//! Shared types for the detection engine.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ── Transport / application protocols ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Proto {
    Tcp,
    Udp,
    Icmp,
    Igmp,
    Arp,
    Other(u8),
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
            Proto::Icmp => write!(f, "icmp"),
            Proto::Igmp => write!(f, "igmp"),
            Proto::Arp => write!(f, "arp"),
            Proto::Other(n) => write!(f, "proto-{}", n),
        }
    }
}

/// Application protocol as tagged by the upstream protocol detector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppProto {
    Http,
    Dns,
    Ssl,
    Ssh,
    Icmp,
    Other,
}

/// Connection outcome reported by the flow collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnState {
    Established,
    /// The peer rejected the connection attempt (e.g. a TCP RST to a SYN).
    Rejected,
    Other,
}

/// The kind of record a flow event carries. Closed set: anything the
/// collector emits that we do not analyze lands on `Other` explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowType {
    Conn,
    Dns,
    Other,
}

// ── Flow / DNS events ─────────────────────────────────────────────────────────

/// One completed connection record, the fundamental unit of flow analysis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub uid: String,
    pub saddr: IpAddr,
    pub daddr: IpAddr,
    pub sport: u16,
    pub dport: u16,
    pub proto: Proto,
    pub state: ConnState,
    pub origstate: ConnState,
    /// Flow duration in seconds.
    pub duration: f64,
    /// Bytes sent by the originator.
    pub sbytes: u64,
    /// Total bytes in both directions.
    pub allbytes: u64,
    pub appproto: Option<AppProto>,
    /// Source MAC address, when the capture layer saw one.
    pub smac: Option<String>,
    pub flow_type: FlowType,
    /// Epoch seconds of the flow start.
    pub timestamp: f64,
}

impl Flow {
    pub fn portproto(&self) -> PortProto {
        PortProto { port: self.dport, proto: self.proto }
    }
}

/// DNS response code. Only the codes the detectors branch on are named.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DnsRcode {
    NoError,
    NxDomain,
    ServFail,
    Other(u16),
}

/// One DNS query/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsTransaction {
    pub uid: String,
    pub query: String,
    /// Answers as the collector renders them: bare IPs, domain names for
    /// CNAME chains, or `"<TYPE> <payload>"` for typed records.
    pub answers: Vec<String>,
    pub rcode: DnsRcode,
    /// Epoch seconds of the query.
    pub timestamp: f64,
}

// ── Profiles and time windows ─────────────────────────────────────────────────

/// The monitoring context of one locally-observed source IP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileId(pub IpAddr);

impl ProfileId {
    pub fn ip(&self) -> IpAddr {
        self.0
    }
}

impl fmt::Display for ProfileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "profile_{}", self.0)
    }
}

/// Ordinal, bounded interval of wall-clock time scoped to a profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeWindow {
    pub number: u32,
}

impl TimeWindow {
    pub fn new(number: u32) -> Self {
        Self { number }
    }
}

impl fmt::Display for TimeWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timewindow{}", self.number)
    }
}

/// Composite key scoping window-bound state. Structured on purpose: string
/// joins of profile and window are ambiguous the moment a delimiter shows up
/// inside a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProfileWindow {
    pub profile: ProfileId,
    pub window: TimeWindow,
}

impl ProfileWindow {
    pub fn new(profile: ProfileId, window: TimeWindow) -> Self {
        Self { profile, window }
    }
}

/// Key of a reconnection-attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReconnKey {
    pub saddr: IpAddr,
    pub daddr: IpAddr,
    pub dport: u16,
}

/// A destination port paired with its transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortProto {
    pub port: u16,
    pub proto: Proto,
}

impl fmt::Display for PortProto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.port, self.proto)
    }
}

// ── Evidence ─────────────────────────────────────────────────────────────────

/// Threat level of a finding, ordered from benign to critical.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum ThreatLevel {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

/// The closed set of finding kinds this engine produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvidenceKind {
    LongConnection,
    UnknownPort,
    MultipleReconnectionAttempts,
    Port0Connection,
    DifferentLocalnetUsage,
    ConnectionToPrivateIp,
    ConnectionWithoutDns,
    ConnectionToMultiplePorts,
    DataUpload,
    NonHttpPort80,
    DeviceChangingIp,
    DgaNxdomains,
    YoungDomain,
    InvalidDnsAnswer,
    HighEntropyDnsAnswer,
    DnsArpaScan,
}

/// Coarse taxonomy tag carried alongside the concrete kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EvidenceCategory {
    AnomalyConnection,
    AnomalyTraffic,
    AnomalyBehaviour,
    ReconScanning,
    Exfiltration,
    Malware,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Src,
    Dst,
}

/// One side of a finding: which direction it sat on and its address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub direction: Direction,
    pub ip: IpAddr,
}

/// A structured, confidence-scored detection output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Evidence {
    pub kind: EvidenceKind,
    pub threat_level: ThreatLevel,
    /// 0.0–1.0.
    pub confidence: f64,
    pub category: EvidenceCategory,
    pub description: String,
    pub attacker: Option<Endpoint>,
    pub victim: Option<Endpoint>,
    pub profile: ProfileId,
    pub window: TimeWindow,
    /// Contributing flow/DNS ids.
    pub uids: Vec<String>,
    pub timestamp: f64,
    pub proto: Option<Proto>,
    pub port: Option<u16>,
}

impl Evidence {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kind: EvidenceKind,
        threat_level: ThreatLevel,
        confidence: f64,
        category: EvidenceCategory,
        description: impl Into<String>,
        profile: ProfileId,
        window: TimeWindow,
        timestamp: f64,
    ) -> Self {
        Self {
            kind,
            threat_level,
            confidence: confidence.clamp(0.0, 1.0),
            category,
            description: description.into(),
            attacker: None,
            victim: None,
            profile,
            window,
            uids: Vec::new(),
            timestamp,
            proto: None,
            port: None,
        }
    }

    pub fn with_attacker(mut self, direction: Direction, ip: IpAddr) -> Self {
        self.attacker = Some(Endpoint { direction, ip });
        self
    }

    pub fn with_victim(mut self, direction: Direction, ip: IpAddr) -> Self {
        self.victim = Some(Endpoint { direction, ip });
        self
    }

    pub fn with_uid(mut self, uid: impl Into<String>) -> Self {
        self.uids.push(uid.into());
        self
    }

    pub fn with_uids(mut self, uids: Vec<String>) -> Self {
        self.uids = uids;
        self
    }

    pub fn with_proto(mut self, proto: Proto) -> Self {
        self.proto = Some(proto);
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }
}

// ── Addressing helpers ───────────────────────────────────────────────────────

/// An IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ipv4Cidr {
    pub addr: Ipv4Addr,
    pub prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(addr: Ipv4Addr, prefix: u8) -> Self {
        Self { addr, prefix: prefix.min(32) }
    }

    fn mask(&self) -> u32 {
        if self.prefix == 0 {
            0
        } else {
            u32::MAX << (32 - self.prefix as u32)
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = self.mask();
        u32::from(ip) & mask == u32::from(self.addr) & mask
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = match s.split_once('/') {
            Some((a, p)) => (
                a.parse::<Ipv4Addr>().map_err(|e| e.to_string())?,
                p.parse::<u8>().map_err(|e| e.to_string())?,
            ),
            None => (s.parse::<Ipv4Addr>().map_err(|e| e.to_string())?, 32),
        };
        if prefix > 32 {
            return Err(format!("prefix /{} out of range", prefix));
        }
        Ok(Self { addr, prefix })
    }
}

/// RFC 1918 private IPv4, or IPv6 unique-local.
pub fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xfe00) == 0xfc00,
    }
}

pub fn is_private_ipv4(ip: IpAddr) -> bool {
    matches!(ip, IpAddr::V4(v4) if v4.is_private())
}

/// Destinations that never warrant an upload or DNS-justification verdict:
/// the local gateway, multicast, link-local, broadcast, loopback and
/// unspecified addresses.
pub fn is_ignored_destination(ip: IpAddr, gateway: Option<IpAddr>) -> bool {
    if Some(ip) == gateway {
        return true;
    }
    match ip {
        IpAddr::V4(v4) => {
            v4.is_multicast()
                || v4.is_link_local()
                || v4.is_broadcast()
                || v4.is_loopback()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => v6.is_multicast() || v6.is_loopback() || v6.is_unspecified(),
    }
}

pub fn bytes_to_mb(bytes: u64) -> f64 {
    bytes as f64 / (1024.0 * 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_contains() {
        let net: Ipv4Cidr = "192.168.1.0/24".parse().unwrap();
        assert!(net.contains(Ipv4Addr::new(192, 168, 1, 77)));
        assert!(!net.contains(Ipv4Addr::new(192, 168, 2, 1)));
        assert!(!net.contains(Ipv4Addr::new(10, 0, 0, 1)));

        let all: Ipv4Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(all.contains(Ipv4Addr::new(8, 8, 8, 8)));

        let host: Ipv4Cidr = "10.1.2.3".parse().unwrap();
        assert!(host.contains(Ipv4Addr::new(10, 1, 2, 3)));
        assert!(!host.contains(Ipv4Addr::new(10, 1, 2, 4)));
    }

    #[test]
    fn test_cidr_parse_rejects_bad_prefix() {
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("not-an-ip/8".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_private_ip_classification() {
        assert!(is_private_ip("192.168.0.5".parse().unwrap()));
        assert!(is_private_ip("10.44.0.1".parse().unwrap()));
        assert!(is_private_ip("172.31.255.1".parse().unwrap()));
        assert!(!is_private_ip("172.32.0.1".parse().unwrap()));
        assert!(!is_private_ip("8.8.8.8".parse().unwrap()));
        assert!(is_private_ip("fd00::1".parse().unwrap()));
        assert!(!is_private_ip("2001:db8::1".parse().unwrap()));
    }

    #[test]
    fn test_ignored_destination() {
        let gw: IpAddr = "192.168.1.1".parse().unwrap();
        assert!(is_ignored_destination(gw, Some(gw)));
        assert!(is_ignored_destination("224.0.0.251".parse().unwrap(), None));
        assert!(is_ignored_destination("169.254.10.1".parse().unwrap(), None));
        assert!(is_ignored_destination("255.255.255.255".parse().unwrap(), None));
        assert!(is_ignored_destination("127.0.0.1".parse().unwrap(), None));
        assert!(!is_ignored_destination("1.1.1.1".parse().unwrap(), Some(gw)));
    }

    #[test]
    fn test_display_formats() {
        let profile = ProfileId("10.0.0.9".parse().unwrap());
        assert_eq!(profile.to_string(), "profile_10.0.0.9");
        assert_eq!(TimeWindow::new(3).to_string(), "timewindow3");
        let pp = PortProto { port: 443, proto: Proto::Tcp };
        assert_eq!(pp.to_string(), "443/tcp");
    }

    #[test]
    fn test_evidence_builder_clamps_confidence() {
        let profile = ProfileId("10.0.0.9".parse().unwrap());
        let ev = Evidence::new(
            EvidenceKind::LongConnection,
            ThreatLevel::Low,
            1.7,
            EvidenceCategory::AnomalyConnection,
            "test",
            profile,
            TimeWindow::new(1),
            0.0,
        )
        .with_uid("uid-1")
        .with_port(443)
        .with_proto(Proto::Tcp);
        assert_eq!(ev.confidence, 1.0);
        assert_eq!(ev.uids, vec!["uid-1".to_string()]);
        assert_eq!(ev.port, Some(443));
    }

    #[test]
    fn test_threat_level_ordering() {
        assert!(ThreatLevel::Info < ThreatLevel::Low);
        assert!(ThreatLevel::Medium < ThreatLevel::High);
        assert!(ThreatLevel::High < ThreatLevel::Critical);
    }

    #[test]
    fn test_bytes_to_mb() {
        assert_eq!(bytes_to_mb(104_857_600), 100.0);
        assert!(bytes_to_mb(1) < 0.001);
    }
}
