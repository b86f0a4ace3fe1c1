//! Per-core CPU utilization sampling for `GET /health`.
//!
//! Each sample computes deltas between the current cumulative busy/idle
//! counters and those recorded at the previous sample. The baseline is taken
//! at construction, so the first sample reports the lifetime average since
//! process start.

use std::sync::Mutex;

/// Cumulative per-core counters from `/proc/stat`, in clock ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreTimes {
    pub user: u64,
    pub system: u64,
    pub idle: u64,
}

impl CoreTimes {
    fn total(&self) -> u64 {
        self.user + self.system + self.idle
    }
}

/// Samples per-core utilization as values in [0.0, 1.0].
pub struct CpuSampler {
    prev: Mutex<Vec<CoreTimes>>,
}

impl CpuSampler {
    /// Record the process-start baseline.
    pub fn new() -> Self {
        let baseline = read_core_times().unwrap_or_default();
        Self {
            prev: Mutex::new(baseline),
        }
    }

    /// Take a sample relative to the previous call (or the baseline).
    pub fn sample(&self) -> Vec<f64> {
        let current = match read_core_times() {
            Ok(times) => times,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to read CPU counters");
                return Vec::new();
            }
        };

        let mut prev = self.prev.lock().expect("cpu sampler lock poisoned");
        let usage = current
            .iter()
            .enumerate()
            .map(|(i, now)| {
                let before = prev.get(i).copied().unwrap_or_default();
                utilization(before, *now)
            })
            .collect();
        *prev = current;
        usage
    }
}

impl Default for CpuSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// `1 - idle_delta / (user_delta + sys_delta + idle_delta)`, clamped to
/// [0.0, 1.0]. A zero-width window reports idle.
fn utilization(before: CoreTimes, now: CoreTimes) -> f64 {
    let total = now.total().saturating_sub(before.total());
    if total == 0 {
        return 0.0;
    }
    let idle = now.idle.saturating_sub(before.idle);
    (1.0 - idle as f64 / total as f64).clamp(0.0, 1.0)
}

fn read_core_times() -> std::io::Result<Vec<CoreTimes>> {
    let stat = std::fs::read_to_string("/proc/stat")?;
    Ok(parse_proc_stat(&stat))
}

/// Parse the `cpuN` lines of `/proc/stat`. The aggregate `cpu` line is
/// skipped; user time includes nice.
fn parse_proc_stat(stat: &str) -> Vec<CoreTimes> {
    let mut cores = Vec::new();
    for line in stat.lines() {
        let mut fields = line.split_whitespace();
        let label = match fields.next() {
            Some(l) if l.starts_with("cpu") && l.len() > 3 => l,
            _ => continue,
        };
        let mut next = || fields.next().and_then(|f| f.parse::<u64>().ok());
        let (user, nice, system, idle) = match (next(), next(), next(), next()) {
            (Some(u), Some(n), Some(s), Some(i)) => (u, n, s, i),
            _ => {
                tracing::debug!(label, "Skipping malformed /proc/stat line");
                continue;
            }
        };
        cores.push(CoreTimes {
            user: user + nice,
            system,
            idle,
        });
    }
    cores
}
