//! Cross-stream correlation helpers: did some DNS activity justify a
//! connection the flow analyzer is suspicious about?

use std::net::IpAddr;

use warden_core::store::ProfileStore;
use warden_core::types::{ProfileId, ProfileWindow, TimeWindow};

/// Outcome of the cross-IP-version correlation. Three-way on purpose:
/// "checked and negative" and "nothing to check against" are different
/// answers, and callers branch differently on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCorrelation {
    /// The profile's other-version address contacted a candidate.
    Confirmed,
    /// Data was present on both sides and no candidate matched.
    NoMatch,
    /// Either side had no data; nothing can be concluded.
    Undetermined,
}

/// Answers that are plain addresses.
pub fn extract_ips_from_answers(answers: &[String]) -> Vec<IpAddr> {
    answers.iter().filter_map(|a| a.parse().ok()).collect()
}

/// A CNAME-shaped answer: a domain name, not an address and not a typed
/// record rendering like `MX=...` or `TXT ...`.
fn is_cname_answer(answer: &str) -> bool {
    answer.parse::<IpAddr>().is_err()
        && answer.contains('.')
        && !answer.contains('=')
        && !answer.contains(char::is_whitespace)
}

/// Whether any CNAME in `answers` resolves (via the store's domain table)
/// to an IP the profile actually contacted. Used to suppress false
/// connection-without-DNS positives when the flow went to a CNAME target.
pub fn is_cname_contacted(
    store: &dyn ProfileStore,
    answers: &[String],
    contacted: &[IpAddr],
) -> bool {
    for answer in answers {
        if !is_cname_answer(answer) {
            continue;
        }
        for ip in store.domain_ips(answer) {
            if contacted.contains(&ip) {
                return true;
            }
        }
    }
    false
}

/// Whether the profile's other-IP-version address already contacted any of
/// `candidates` in this window.
pub fn made_by_other_ip_version(
    store: &dyn ProfileStore,
    profile: ProfileId,
    window: TimeWindow,
    candidates: &[IpAddr],
) -> VersionCorrelation {
    let Some(other) = store.other_ip_version(profile) else {
        return VersionCorrelation::Undetermined;
    };
    let contacted = store.contacted_ips(ProfileWindow::new(ProfileId(other), window));
    if contacted.is_empty() || candidates.is_empty() {
        return VersionCorrelation::Undetermined;
    }
    if candidates.iter().any(|c| contacted.contains(c)) {
        VersionCorrelation::Confirmed
    } else {
        VersionCorrelation::NoMatch
    }
}
