//! TLS-churn detection: clients that open many connections but send almost
//! no requests per connection.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use truthgate_core::config::ChurnConfig;

#[derive(Debug)]
struct Window {
    started: Instant,
    new_connections: u64,
    requests: u64,
}

/// Per-IP sliding observation windows, fed by the TLS acceptor and the
/// request path.
pub struct ChurnDetector {
    windows: DashMap<IpAddr, Window>,
}

impl Default for ChurnDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChurnDetector {
    pub fn new() -> Self {
        ChurnDetector {
            windows: DashMap::new(),
        }
    }

    /// Record a new TLS connection from `ip`. Returns true when the
    /// completed observation window trips the churn condition.
    pub fn note_connection(&self, ip: IpAddr, config: &ChurnConfig) -> bool {
        let window_len = Duration::from_secs(config.window_secs.max(1));
        let mut entry = self.windows.entry(ip).or_insert_with(|| Window {
            started: Instant::now(),
            new_connections: 0,
            requests: 0,
        });

        let elapsed = entry.started.elapsed();
        if elapsed >= window_len {
            // Evaluate the completed window, then start a new one.
            let seconds = elapsed.as_secs_f64().max(1.0);
            let rate = entry.new_connections as f64 / seconds;
            let avg_requests = if entry.new_connections > 0 {
                entry.requests as f64 / entry.new_connections as f64
            } else {
                f64::MAX
            };
            let tripped = rate > config.new_connections_per_sec
                && avg_requests < config.min_avg_requests_per_conn;

            entry.started = Instant::now();
            entry.new_connections = 1;
            entry.requests = 0;
            return tripped;
        }

        entry.new_connections += 1;
        false
    }

    pub fn note_request(&self, ip: IpAddr) {
        if let Some(mut entry) = self.windows.get_mut(&ip) {
            entry.requests += 1;
        }
    }

    /// Drop windows idle for longer than twice the configured length.
    pub fn prune(&self, config: &ChurnConfig) {
        let horizon = Duration::from_secs(config.window_secs.max(1) * 2);
        self.windows
            .retain(|_, window| window.started.elapsed() < horizon);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChurnConfig {
        ChurnConfig {
            window_secs: 1,
            new_connections_per_sec: 5.0,
            min_avg_requests_per_conn: 1.0,
        }
    }

    #[test]
    fn request_heavy_traffic_never_trips() {
        let detector = ChurnDetector::new();
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let config = config();

        for _ in 0..50 {
            detector.note_connection(ip, &config);
            detector.note_request(ip);
            detector.note_request(ip);
        }
        std::thread::sleep(Duration::from_millis(1100));
        assert!(!detector.note_connection(ip, &config));
    }

    #[test]
    fn connection_floods_with_no_requests_trip() {
        let detector = ChurnDetector::new();
        let ip: IpAddr = "10.0.0.2".parse().unwrap();
        let config = config();

        for _ in 0..50 {
            detector.note_connection(ip, &config);
        }
        std::thread::sleep(Duration::from_millis(1100));
        assert!(detector.note_connection(ip, &config));
    }
}
