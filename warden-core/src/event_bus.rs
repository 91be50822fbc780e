//! Typed event bus between the ingestion pipeline and the analyzers.
//!
//! Three topics: flow-completed, DNS-transaction, and window-closed.
//! Delivery is synchronous on the publisher's thread, so each topic's
//! subscribers observe events in strict arrival order, which is the
//! ordering guarantee the analyzers' counter updates rely on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::types::{DnsTransaction, Flow, ProfileId, TimeWindow};

pub type FlowSubscriber = Arc<dyn Fn(&Flow, ProfileId, TimeWindow) + Send + Sync>;
pub type DnsSubscriber = Arc<dyn Fn(&DnsTransaction, ProfileId, TimeWindow) + Send + Sync>;
pub type WindowSubscriber = Arc<dyn Fn(ProfileId, TimeWindow) + Send + Sync>;

#[derive(Default)]
pub struct DetectionBus {
    flow_subs: RwLock<Vec<FlowSubscriber>>,
    dns_subs: RwLock<Vec<DnsSubscriber>>,
    window_subs: RwLock<Vec<WindowSubscriber>>,
    flows_published: AtomicU64,
    dns_published: AtomicU64,
    windows_published: AtomicU64,
    total_delivered: AtomicU64,
}

impl DetectionBus {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Subscribing ──────────────────────────────────────────────────────

    pub fn on_flow(&self, f: impl Fn(&Flow, ProfileId, TimeWindow) + Send + Sync + 'static) {
        self.flow_subs.write().push(Arc::new(f));
    }

    pub fn on_dns(
        &self,
        f: impl Fn(&DnsTransaction, ProfileId, TimeWindow) + Send + Sync + 'static,
    ) {
        self.dns_subs.write().push(Arc::new(f));
    }

    pub fn on_window_closed(&self, f: impl Fn(ProfileId, TimeWindow) + Send + Sync + 'static) {
        self.window_subs.write().push(Arc::new(f));
    }

    // ── Publishing ───────────────────────────────────────────────────────

    pub fn publish_flow(&self, flow: &Flow, profile: ProfileId, window: TimeWindow) {
        self.flows_published.fetch_add(1, Ordering::Relaxed);
        debug!(uid = %flow.uid, profile = %profile, "flow published");
        for sub in self.flow_subs.read().iter() {
            sub(flow, profile, window);
            self.total_delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn publish_dns(&self, txn: &DnsTransaction, profile: ProfileId, window: TimeWindow) {
        self.dns_published.fetch_add(1, Ordering::Relaxed);
        debug!(uid = %txn.uid, query = %txn.query, "dns transaction published");
        for sub in self.dns_subs.read().iter() {
            sub(txn, profile, window);
            self.total_delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn publish_window_closed(&self, profile: ProfileId, window: TimeWindow) {
        self.windows_published.fetch_add(1, Ordering::Relaxed);
        debug!(profile = %profile, window = %window, "time window closed");
        for sub in self.window_subs.read().iter() {
            sub(profile, window);
            self.total_delivered.fetch_add(1, Ordering::Relaxed);
        }
    }

    // ── Stats ────────────────────────────────────────────────────────────

    pub fn flows_published(&self) -> u64 {
        self.flows_published.load(Ordering::Relaxed)
    }

    pub fn dns_published(&self) -> u64 {
        self.dns_published.load(Ordering::Relaxed)
    }

    pub fn windows_published(&self) -> u64 {
        self.windows_published.load(Ordering::Relaxed)
    }

    pub fn total_delivered(&self) -> u64 {
        self.total_delivered.load(Ordering::Relaxed)
    }

    pub fn subscriber_count(&self) -> usize {
        self.flow_subs.read().len() + self.dns_subs.read().len() + self.window_subs.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AppProto, ConnState, DnsRcode, FlowType, Proto};
    use std::sync::atomic::AtomicUsize;

    fn flow(uid: &str) -> Flow {
        Flow {
            uid: uid.into(),
            saddr: "10.0.0.2".parse().unwrap(),
            daddr: "1.2.3.4".parse().unwrap(),
            sport: 50_000,
            dport: 443,
            proto: Proto::Tcp,
            state: ConnState::Established,
            origstate: ConnState::Established,
            duration: 1.0,
            sbytes: 100,
            allbytes: 200,
            appproto: Some(AppProto::Ssl),
            smac: None,
            flow_type: FlowType::Conn,
            timestamp: 1_700_000_000.0,
        }
    }

    fn ctx() -> (ProfileId, TimeWindow) {
        (ProfileId("10.0.0.2".parse().unwrap()), TimeWindow::new(1))
    }

    #[test]
    fn test_flow_delivery_and_counters() {
        let bus = DetectionBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        bus.on_flow(move |_, _, _| {
            s.fetch_add(1, Ordering::Relaxed);
        });

        let (profile, window) = ctx();
        bus.publish_flow(&flow("a"), profile, window);
        bus.publish_flow(&flow("b"), profile, window);

        assert_eq!(seen.load(Ordering::Relaxed), 2);
        assert_eq!(bus.flows_published(), 2);
        assert_eq!(bus.total_delivered(), 2);
    }

    #[test]
    fn test_topics_are_independent() {
        let bus = DetectionBus::new();
        let flows = Arc::new(AtomicUsize::new(0));
        let windows = Arc::new(AtomicUsize::new(0));
        let f = flows.clone();
        let w = windows.clone();
        bus.on_flow(move |_, _, _| {
            f.fetch_add(1, Ordering::Relaxed);
        });
        bus.on_window_closed(move |_, _| {
            w.fetch_add(1, Ordering::Relaxed);
        });

        let (profile, window) = ctx();
        bus.publish_window_closed(profile, window);
        assert_eq!(flows.load(Ordering::Relaxed), 0);
        assert_eq!(windows.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_dns_delivery_preserves_order() {
        let bus = DetectionBus::new();
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let o = order.clone();
        bus.on_dns(move |txn, _, _| o.lock().push(txn.uid.clone()));

        let (profile, window) = ctx();
        for uid in ["q1", "q2", "q3"] {
            let txn = DnsTransaction {
                uid: uid.into(),
                query: "example.com".into(),
                answers: vec![],
                rcode: DnsRcode::NoError,
                timestamp: 0.0,
            };
            bus.publish_dns(&txn, profile, window);
        }
        assert_eq!(*order.lock(), vec!["q1", "q2", "q3"]);
    }

    #[test]
    fn test_subscriber_count() {
        let bus = DetectionBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.on_flow(|_, _, _| {});
        bus.on_dns(|_, _, _| {});
        assert_eq!(bus.subscriber_count(), 2);
    }
}
