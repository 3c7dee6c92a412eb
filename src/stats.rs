//! Per-port and per-connection throughput statistics.
//!
//! A rolling window of recent transfers, queried through [`StatsReport`].
//! The engine only updates counters here; reporting subsystems read them.

use std::collections::HashSet;
use std::time::Instant;

const WINDOW: usize = 100;

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    elements: usize,
    queue_fraction: f64,
}

/// Rolling statistics for one port or connection.
#[derive(Debug)]
pub struct PortStatistics {
    name: String,
    element_bits: usize,
    window: Vec<Sample>,
    active_streams: HashSet<String>,
    enabled: bool,
    last_call: Option<Instant>,
}

impl PortStatistics {
    pub fn new(name: impl Into<String>, element_size_bytes: usize) -> Self {
        PortStatistics {
            name: name.into(),
            element_bits: element_size_bytes * 8,
            window: Vec::with_capacity(WINDOW),
            active_streams: HashSet::new(),
            enabled: true,
            last_call: None,
        }
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.window.clear();
        }
    }

    /// Record one transfer. `queue_fraction` is current depth over
    /// capacity for input ports, 0.0 for output connections.
    pub fn update(&mut self, elements: usize, queue_fraction: f64, stream_id: &str, eos: bool) {
        self.last_call = Some(Instant::now());
        if eos {
            self.active_streams.remove(stream_id);
        } else {
            self.active_streams.insert(stream_id.to_string());
        }
        if !self.enabled {
            return;
        }
        if self.window.len() == WINDOW {
            self.window.remove(0);
        }
        self.window.push(Sample { at: Instant::now(), elements, queue_fraction });
    }

    /// Snapshot the current rates.
    pub fn retrieve(&self) -> StatsReport {
        let mut report = StatsReport {
            name: self.name.clone(),
            elements_per_second: 0.0,
            bits_per_second: 0.0,
            calls_per_second: 0.0,
            average_queue_depth: 0.0,
            time_since_last_call: self.last_call.map(|t| t.elapsed().as_secs_f64()),
            active_stream_ids: {
                let mut ids: Vec<_> = self.active_streams.iter().cloned().collect();
                ids.sort();
                ids
            },
        };
        if self.window.len() < 2 {
            return report;
        }
        let span = self.window[self.window.len() - 1]
            .at
            .duration_since(self.window[0].at)
            .as_secs_f64();
        if span <= 0.0 {
            return report;
        }
        let total_elements: usize = self.window.iter().map(|s| s.elements).sum();
        report.elements_per_second = total_elements as f64 / span;
        report.bits_per_second = report.elements_per_second * self.element_bits as f64;
        report.calls_per_second = self.window.len() as f64 / span;
        report.average_queue_depth =
            self.window.iter().map(|s| s.queue_fraction).sum::<f64>() / self.window.len() as f64;
        report
    }
}

/// A point-in-time statistics snapshot.
#[derive(Debug, Clone)]
pub struct StatsReport {
    pub name: String,
    pub elements_per_second: f64,
    pub bits_per_second: f64,
    pub calls_per_second: f64,
    pub average_queue_depth: f64,
    pub time_since_last_call: Option<f64>,
    pub active_stream_ids: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn active_streams_track_eos() {
        let mut stats = PortStatistics::new("in", 4);
        stats.update(100, 0.1, "a", false);
        stats.update(100, 0.1, "b", false);
        assert_eq!(stats.retrieve().active_stream_ids, vec!["a", "b"]);
        stats.update(0, 0.0, "a", true);
        assert_eq!(stats.retrieve().active_stream_ids, vec!["b"]);
    }

    #[test]
    fn disabled_stats_record_nothing() {
        let mut stats = PortStatistics::new("in", 2);
        stats.set_enabled(false);
        stats.update(512, 0.5, "a", false);
        stats.update(512, 0.5, "a", false);
        let report = stats.retrieve();
        assert_eq!(report.elements_per_second, 0.0);
        // Last-call time and stream tracking still work while disabled
        assert!(report.time_since_last_call.is_some());
    }

    #[test]
    fn rates_scale_with_element_size() {
        let mut stats = PortStatistics::new("in", 8);
        stats.update(100, 0.0, "a", false);
        std::thread::sleep(std::time::Duration::from_millis(5));
        stats.update(100, 0.0, "a", false);
        let report = stats.retrieve();
        assert!(report.elements_per_second > 0.0);
        assert_eq!(report.bits_per_second, report.elements_per_second * 64.0);
    }
}
