//! Best-effort DNS-server identification.
//!
//! Sends one recursion-desired A query to the candidate on port 53 and
//! accepts anything that echoes the transaction id with the response bit
//! set. Every failure mode (bind, send, timeout, short or foreign reply)
//! is "not a DNS server"; the probe can never surface as an analyzer fault.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::debug;

const QUERY_ID: u16 = 0x5744;
const PROBE_NAME: &str = "example.com";

/// Probe `ip:53`. Blocking for at most roughly `timeout`; intended for the
/// deferred path or a cached-verdict call site, not a per-event hot loop.
pub fn probe_dns_server(ip: IpAddr, timeout: Duration) -> bool {
    probe_dns_server_at(ip, 53, timeout)
}

pub(crate) fn probe_dns_server_at(ip: IpAddr, port: u16, timeout: Duration) -> bool {
    let local: SocketAddr = match ip {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = match UdpSocket::bind(local) {
        Ok(s) => s,
        Err(e) => {
            debug!(error = %e, "probe socket bind failed");
            return false;
        }
    };
    if socket.set_read_timeout(Some(timeout)).is_err() {
        return false;
    }

    let query = build_query(PROBE_NAME, QUERY_ID);
    if let Err(e) = socket.send_to(&query, (ip, port)) {
        debug!(target = %ip, error = %e, "probe send failed");
        return false;
    }

    let mut buf = [0u8; 512];
    match socket.recv_from(&mut buf) {
        Ok((n, _)) if n >= 12 => {
            let id = u16::from_be_bytes([buf[0], buf[1]]);
            let is_response = buf[2] & 0x80 != 0;
            id == QUERY_ID && is_response
        }
        Ok(_) => false,
        Err(e) => {
            debug!(target = %ip, error = %e, "no DNS reply");
            false
        }
    }
}

/// A minimal wire-format query: header, one QNAME, QTYPE=A, QCLASS=IN.
fn build_query(name: &str, id: u16) -> Vec<u8> {
    let mut packet = Vec::with_capacity(12 + name.len() + 6);
    packet.extend_from_slice(&id.to_be_bytes());
    packet.extend_from_slice(&0x0100u16.to_be_bytes()); // recursion desired
    packet.extend_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    packet.extend_from_slice(&[0; 6]); // AN/NS/AR counts
    for label in name.split('.').filter(|l| !l.is_empty()) {
        packet.push(label.len() as u8);
        packet.extend_from_slice(label.as_bytes());
    }
    packet.push(0);
    packet.extend_from_slice(&1u16.to_be_bytes()); // QTYPE A
    packet.extend_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    packet
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_wire_layout() {
        let q = build_query("example.com", 0xabcd);
        assert_eq!(&q[0..2], &[0xab, 0xcd]);
        assert_eq!(&q[2..4], &[0x01, 0x00]);
        assert_eq!(&q[4..6], &[0x00, 0x01]);
        // First label: length 7 then "example".
        assert_eq!(q[12], 7);
        assert_eq!(&q[13..20], b"example");
        assert_eq!(q[20], 3);
        assert_eq!(&q[21..24], b"com");
        assert_eq!(q[24], 0);
        // QTYPE A, QCLASS IN.
        assert_eq!(&q[25..29], &[0x00, 0x01, 0x00, 0x01]);
    }

    #[test]
    fn test_probe_accepts_echoing_responder() {
        let responder = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = responder.local_addr().unwrap().port();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            let (n, from) = responder.recv_from(&mut buf).unwrap();
            // Echo the header with the QR bit set.
            buf[2] |= 0x80;
            responder.send_to(&buf[..n], from).unwrap();
        });

        let verdict = probe_dns_server_at(
            "127.0.0.1".parse().unwrap(),
            port,
            Duration::from_secs(2),
        );
        handle.join().unwrap();
        assert!(verdict);
    }

    #[test]
    fn test_probe_timeout_is_negative_verdict() {
        // Nothing listens on this socket's port once it is dropped.
        let port = {
            let s = UdpSocket::bind("127.0.0.1:0").unwrap();
            s.local_addr().unwrap().port()
        };
        let verdict = probe_dns_server_at(
            "127.0.0.1".parse().unwrap(),
            port,
            Duration::from_millis(100),
        );
        assert!(!verdict);
    }

    #[test]
    fn test_probe_rejects_wrong_id() {
        let responder = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = responder.local_addr().unwrap().port();

        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 512];
            let (n, from) = responder.recv_from(&mut buf).unwrap();
            buf[0] = buf[0].wrapping_add(1); // corrupt the id
            buf[2] |= 0x80;
            responder.send_to(&buf[..n], from).unwrap();
        });

        let verdict = probe_dns_server_at(
            "127.0.0.1".parse().unwrap(),
            port,
            Duration::from_secs(2),
        );
        handle.join().unwrap();
        assert!(!verdict);
    }
}
