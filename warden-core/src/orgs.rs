//! Organization directory: which domains are whitelisted outright, and
//! which IP ranges, ASNs and domain suffixes belong to which well-known
//! organization. The analyzers consult it for exemptions, never for
//! detections of its own.

use std::collections::HashMap;
use std::net::IpAddr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::types::Ipv4Cidr;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrgInfo {
    /// CIDR ranges announced by the organization.
    pub ranges: Vec<Ipv4Cidr>,
    /// Individual addresses known to belong to it.
    pub ips: Vec<IpAddr>,
    /// Autonomous-system identifiers, matched case-insensitively.
    pub asns: Vec<String>,
    /// Domain suffixes (e.g. `google.com`).
    pub domains: Vec<String>,
}

#[derive(Default)]
pub struct OrgDirectory {
    orgs: RwLock<HashMap<String, OrgInfo>>,
    whitelisted_domains: RwLock<Vec<String>>,
}

impl OrgDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Seeding ──────────────────────────────────────────────────────────

    pub fn add_org(&self, name: &str, info: OrgInfo) {
        self.orgs.write().insert(name.to_lowercase(), info);
    }

    pub fn whitelist_domain(&self, domain: &str) {
        self.whitelisted_domains.write().push(domain.to_lowercase());
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn org_names(&self) -> Vec<String> {
        self.orgs.read().keys().cloned().collect()
    }

    pub fn is_domain_whitelisted(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        self.whitelisted_domains
            .read()
            .iter()
            .any(|w| domain == *w || domain.ends_with(&format!(".{}", w)))
    }

    pub fn is_ip_in_org(&self, ip: IpAddr, org: &str) -> bool {
        let orgs = self.orgs.read();
        let Some(info) = orgs.get(&org.to_lowercase()) else {
            return false;
        };
        if info.ips.contains(&ip) {
            return true;
        }
        match ip {
            IpAddr::V4(v4) => info.ranges.iter().any(|r| r.contains(v4)),
            IpAddr::V6(_) => false,
        }
    }

    pub fn is_asn_in_org(&self, asn: &str, org: &str) -> bool {
        let orgs = self.orgs.read();
        let Some(info) = orgs.get(&org.to_lowercase()) else {
            return false;
        };
        let asn = asn.to_lowercase();
        info.asns.iter().any(|a| a.to_lowercase() == asn)
    }

    pub fn is_domain_in_org(&self, domain: &str, org: &str) -> bool {
        let orgs = self.orgs.read();
        let Some(info) = orgs.get(&org.to_lowercase()) else {
            return false;
        };
        let domain = domain.to_lowercase();
        info.domains
            .iter()
            .any(|d| domain == *d || domain.ends_with(&format!(".{}", d)))
    }
}
