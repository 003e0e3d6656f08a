//! Streaming Attack Trackers
//!
//! In-memory per-source counters for detectors that watch the live
//! connection stream rather than the event store: port scans, brute-force
//! bursts on remote-access ports, and packet floods.
//!
//! State is keyed by (endpoint_id, source IP), guarded by one mutex, and
//! evicted on a TTL so the maps stay bounded under churn.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::Serialize;

// ============================================================================
// THRESHOLDS
// ============================================================================

/// Distinct destination ports within the window that indicate a scan.
pub const PORT_SCAN_THRESHOLD: usize = 10;
pub const PORT_SCAN_WINDOW_SECS: i64 = 10;

/// Hits on SSH/RDP ports within the window that indicate brute force.
pub const BRUTE_FORCE_THRESHOLD: usize = 5;
pub const BRUTE_FORCE_WINDOW_SECS: i64 = 60;
pub const BRUTE_FORCE_PORTS: &[u16] = &[22, 3389];

/// Packets within the window that indicate a flood.
pub const FLOOD_THRESHOLD: usize = 100;
pub const FLOOD_WINDOW_SECS: i64 = 10;

/// Idle sources are forgotten after this long.
pub const TRACKER_IDLE_TTL_SECS: i64 = 300;

// ============================================================================
// TYPES
// ============================================================================

/// One observation from the live network stream.
#[derive(Debug, Clone)]
pub struct PacketSample {
    pub endpoint_id: String,
    pub src_ip: String,
    pub dst_port: Option<u16>,
    pub size: Option<u64>,
}

/// Streaming detector verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamAlert {
    PortScan,
    BruteForce,
    Flood,
}

#[derive(Debug, Default)]
struct SourceState {
    /// (port, seen-at) pairs inside the scan window.
    ports: Vec<(u16, DateTime<Utc>)>,
    /// Remote-access port hits inside the brute-force window.
    auth_hits: Vec<DateTime<Utc>>,
    /// Sized packets inside the flood window.
    packets: Vec<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
}

// ============================================================================
// TRACKER
// ============================================================================

/// Shared tracker instance; all producers observe through the same mutex.
#[derive(Default)]
pub struct AttackTracker {
    state: Mutex<HashMap<(String, String), SourceState>>,
}

impl AttackTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one sample; returns every alert that crossed its threshold at
    /// this observation. `now` is taken by the caller once per sample so
    /// all three windows share the same anchor.
    pub fn observe(&self, sample: &PacketSample, now: DateTime<Utc>) -> Vec<StreamAlert> {
        let mut alerts = Vec::new();
        let key = (sample.endpoint_id.clone(), sample.src_ip.clone());

        let mut state = self.state.lock();
        evict_idle(&mut state, now);

        let entry = state.entry(key).or_default();
        entry.last_seen = Some(now);

        if let Some(port) = sample.dst_port {
            entry.ports.push((port, now));
            entry
                .ports
                .retain(|(_, t)| now - *t <= Duration::seconds(PORT_SCAN_WINDOW_SECS));

            let mut unique: Vec<u16> = entry.ports.iter().map(|(p, _)| *p).collect();
            unique.sort_unstable();
            unique.dedup();
            if unique.len() >= PORT_SCAN_THRESHOLD {
                alerts.push(StreamAlert::PortScan);
            }

            if BRUTE_FORCE_PORTS.contains(&port) {
                entry.auth_hits.push(now);
                entry
                    .auth_hits
                    .retain(|t| now - *t <= Duration::seconds(BRUTE_FORCE_WINDOW_SECS));
                if entry.auth_hits.len() >= BRUTE_FORCE_THRESHOLD {
                    alerts.push(StreamAlert::BruteForce);
                }
            }
        }

        if sample.size.is_some() {
            entry.packets.push(now);
            entry
                .packets
                .retain(|t| now - *t <= Duration::seconds(FLOOD_WINDOW_SECS));
            if entry.packets.len() >= FLOOD_THRESHOLD {
                alerts.push(StreamAlert::Flood);
            }
        }

        alerts
    }

    /// Tracked source count (observability).
    pub fn tracked_sources(&self) -> usize {
        self.state.lock().len()
    }
}

fn evict_idle(state: &mut HashMap<(String, String), SourceState>, now: DateTime<Utc>) {
    state.retain(|_, s| match s.last_seen {
        Some(t) => now - t <= Duration::seconds(TRACKER_IDLE_TTL_SECS),
        None => false,
    });
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(endpoint: &str, ip: &str, port: Option<u16>, size: Option<u64>) -> PacketSample {
        PacketSample {
            endpoint_id: endpoint.to_string(),
            src_ip: ip.to_string(),
            dst_port: port,
            size,
        }
    }

    #[test]
    fn test_port_scan_needs_distinct_ports() {
        let tracker = AttackTracker::new();
        let now = Utc::now();

        // Same port over and over: not a scan.
        for _ in 0..PORT_SCAN_THRESHOLD * 2 {
            let alerts = tracker.observe(&sample("ep-1", "203.0.113.5", Some(443), None), now);
            assert!(!alerts.contains(&StreamAlert::PortScan));
        }

        for port in 1000..1000 + PORT_SCAN_THRESHOLD as u16 - 1 {
            let alerts = tracker.observe(&sample("ep-1", "203.0.113.6", Some(port), None), now);
            assert!(!alerts.contains(&StreamAlert::PortScan));
        }
        let alerts = tracker.observe(
            &sample("ep-1", "203.0.113.6", Some(2000), None),
            now,
        );
        assert!(alerts.contains(&StreamAlert::PortScan));
    }

    #[test]
    fn test_brute_force_only_on_remote_access_ports() {
        let tracker = AttackTracker::new();
        let now = Utc::now();

        for i in 0..BRUTE_FORCE_THRESHOLD {
            let alerts = tracker.observe(&sample("ep-1", "198.51.100.2", Some(3389), None), now);
            if i + 1 < BRUTE_FORCE_THRESHOLD {
                assert!(!alerts.contains(&StreamAlert::BruteForce));
            } else {
                assert!(alerts.contains(&StreamAlert::BruteForce));
            }
        }

        // Port 80 hammering never counts as auth brute force.
        let tracker = AttackTracker::new();
        for _ in 0..BRUTE_FORCE_THRESHOLD * 3 {
            let alerts = tracker.observe(&sample("ep-1", "198.51.100.2", Some(80), None), now);
            assert!(!alerts.contains(&StreamAlert::BruteForce));
        }
    }

    #[test]
    fn test_flood_threshold_and_window() {
        let tracker = AttackTracker::new();
        let now = Utc::now();

        for i in 0..FLOOD_THRESHOLD - 1 {
            let alerts = tracker.observe(
                &sample("ep-1", "198.51.100.9", None, Some(512)),
                now + Duration::milliseconds(i as i64),
            );
            assert!(alerts.is_empty());
        }
        let alerts = tracker.observe(
            &sample("ep-1", "198.51.100.9", None, Some(512)),
            now + Duration::milliseconds(FLOOD_THRESHOLD as i64),
        );
        assert!(alerts.contains(&StreamAlert::Flood));

        // Far outside the window the counter has drained.
        let later = now + Duration::seconds(FLOOD_WINDOW_SECS + 30);
        let alerts = tracker.observe(&sample("ep-1", "198.51.100.9", None, Some(512)), later);
        assert!(alerts.is_empty());
    }

    #[test]
    fn test_sources_keyed_per_endpoint() {
        let tracker = AttackTracker::new();
        let now = Utc::now();

        // Same IP on two endpoints: counters stay separate.
        for _ in 0..BRUTE_FORCE_THRESHOLD - 1 {
            tracker.observe(&sample("ep-1", "198.51.100.2", Some(22), None), now);
        }
        let alerts = tracker.observe(&sample("ep-2", "198.51.100.2", Some(22), None), now);
        assert!(!alerts.contains(&StreamAlert::BruteForce));
    }

    #[test]
    fn test_idle_sources_evicted() {
        let tracker = AttackTracker::new();
        let now = Utc::now();
        tracker.observe(&sample("ep-1", "203.0.113.1", Some(80), None), now);
        tracker.observe(&sample("ep-1", "203.0.113.2", Some(80), None), now);
        assert_eq!(tracker.tracked_sources(), 2);

        let much_later = now + Duration::seconds(TRACKER_IDLE_TTL_SECS + 60);
        tracker.observe(&sample("ep-1", "203.0.113.3", Some(80), None), much_later);
        assert_eq!(tracker.tracked_sources(), 1);
    }
}
