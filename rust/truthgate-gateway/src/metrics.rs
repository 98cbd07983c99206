//! Fixed-window ring of process and system samples, plus an opt-in
//! per-thread hot-spot collector.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sysinfo::{CpuExt, ProcessExt, System, SystemExt};
use tokio::task::JoinHandle;
use truthgate_core::config::MetricsConfig;

#[derive(Clone, Debug, Serialize)]
pub struct ThreadSample {
    pub tid: u32,
    pub cpu_ticks_delta: u64,
}

#[derive(Clone, Debug, Serialize)]
pub struct MetricsSample {
    pub ts: DateTime<Utc>,
    pub process_cpu_pct: f32,
    pub process_rss_kb: u64,
    pub thread_count: usize,
    pub system_cpu_pct: f32,
    pub system_used_mem_kb: u64,
    pub system_total_mem_kb: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hot_threads: Vec<ThreadSample>,
}

/// The ring itself: bounded, oldest samples evicted first.
pub struct MetricsRing {
    samples: Mutex<VecDeque<MetricsSample>>,
    capacity: usize,
}

impl MetricsRing {
    pub fn new(capacity: usize) -> Self {
        MetricsRing {
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, sample: MetricsSample) {
        if let Ok(mut samples) = self.samples.lock() {
            if samples.len() == self.capacity {
                samples.pop_front();
            }
            samples.push_back(sample);
        }
    }

    pub fn snapshot(&self) -> Vec<MetricsSample> {
        self.samples
            .lock()
            .map(|samples| samples.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.samples.lock().map(|s| s.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Spawn the sampler task feeding `ring` on the configured interval.
pub fn spawn_sampler(ring: Arc<MetricsRing>, config: MetricsConfig) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut system = System::new();
        let pid = match sysinfo::get_current_pid() {
            Ok(pid) => pid,
            Err(error) => {
                warn!("metrics sampler disabled: {}", error);
                return;
            }
        };
        let mut thread_tracker = ThreadCpuTracker::default();
        let interval = std::time::Duration::from_secs(config.sample_interval_secs.max(1));

        loop {
            tokio::time::sleep(interval).await;
            system.refresh_cpu();
            system.refresh_memory();
            system.refresh_process(pid);

            let (process_cpu_pct, process_rss_kb) = match system.process(pid) {
                Some(process) => (process.cpu_usage(), process.memory()),
                None => (0.0, 0),
            };
            let hot_threads = if config.per_thread {
                thread_tracker.hottest(config.per_thread_top)
            } else {
                Vec::new()
            };

            ring.push(MetricsSample {
                ts: Utc::now(),
                process_cpu_pct,
                process_rss_kb,
                thread_count: current_thread_count(),
                system_cpu_pct: system.global_cpu_info().cpu_usage(),
                system_used_mem_kb: system.used_memory(),
                system_total_mem_kb: system.total_memory(),
                hot_threads,
            });
        }
    })
}

#[cfg(target_os = "linux")]
fn current_thread_count() -> usize {
    std::fs::read_dir("/proc/self/task")
        .map(|entries| entries.count())
        .unwrap_or(0)
}

#[cfg(not(target_os = "linux"))]
fn current_thread_count() -> usize {
    0
}

/// Tracks per-thread CPU tick deltas between samples via
/// `/proc/self/task/<tid>/stat`. Linux only; elsewhere it yields nothing.
#[derive(Default)]
struct ThreadCpuTracker {
    previous: HashMap<u32, u64>,
}

impl ThreadCpuTracker {
    #[cfg(target_os = "linux")]
    fn hottest(&mut self, top: usize) -> Vec<ThreadSample> {
        let mut current: HashMap<u32, u64> = HashMap::new();
        if let Ok(entries) = std::fs::read_dir("/proc/self/task") {
            for entry in entries.flatten() {
                let Some(tid) = entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.parse::<u32>().ok())
                else {
                    continue;
                };
                if let Some(ticks) = read_thread_ticks(tid) {
                    current.insert(tid, ticks);
                }
            }
        }

        let mut deltas: Vec<ThreadSample> = current
            .iter()
            .map(|(tid, ticks)| ThreadSample {
                tid: *tid,
                cpu_ticks_delta: ticks.saturating_sub(*self.previous.get(tid).unwrap_or(&0)),
            })
            .collect();
        deltas.sort_by(|a, b| b.cpu_ticks_delta.cmp(&a.cpu_ticks_delta));
        deltas.truncate(top);
        self.previous = current;
        deltas
    }

    #[cfg(not(target_os = "linux"))]
    fn hottest(&mut self, _top: usize) -> Vec<ThreadSample> {
        Vec::new()
    }
}

/// Fields 14 and 15 of the stat line are utime and stime in clock ticks.
#[cfg(target_os = "linux")]
fn read_thread_ticks(tid: u32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/self/task/{}/stat", tid)).ok()?;
    // The comm field may contain spaces; skip past its closing paren.
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(cpu: f32) -> MetricsSample {
        MetricsSample {
            ts: Utc::now(),
            process_cpu_pct: cpu,
            process_rss_kb: 1024,
            thread_count: 4,
            system_cpu_pct: 10.0,
            system_used_mem_kb: 500,
            system_total_mem_kb: 1000,
            hot_threads: Vec::new(),
        }
    }

    #[test]
    fn the_ring_is_bounded_and_fifo() {
        let ring = MetricsRing::new(3);
        for cpu in [1.0, 2.0, 3.0, 4.0] {
            ring.push(sample(cpu));
        }
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].process_cpu_pct, 2.0);
        assert_eq!(snapshot[2].process_cpu_pct, 4.0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn thread_tick_parsing_handles_spaced_comm_names() {
        // Any live thread of this test process will do.
        let count = current_thread_count();
        assert!(count >= 1);
    }
}
