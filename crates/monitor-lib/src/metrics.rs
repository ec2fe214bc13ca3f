//! Normalized metric computation from raw engine counters
//!
//! CPU percent is a derivative of two consecutive cumulative readings;
//! memory is computed directly from the current reading. These functions
//! are pure so the arithmetic can be pinned down with literal fixtures.

use crate::models::RawStatsSample;

/// Memory usage derived from one raw reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryUsage {
    pub used_mb: f64,
    pub percent: f64,
}

/// Compute CPU usage percent from two consecutive cumulative readings.
///
/// `(cpu_delta / system_delta) * online_cpus * 100`, rounded to two
/// decimals. A non-positive system delta or a negative cpu delta yields
/// `0.0`; the result is never negative or NaN. When the engine reports
/// `online_cpus` as 0 the length of the per-core usage array is used
/// instead.
pub fn cpu_percent(current: &RawStatsSample, previous: &RawStatsSample) -> f64 {
    let cpu_delta = current.cpu_total_usage as i64 - previous.cpu_total_usage as i64;
    let system_delta = current.system_cpu_usage as i64 - previous.system_cpu_usage as i64;

    if system_delta <= 0 || cpu_delta < 0 {
        return 0.0;
    }

    let online_cpus = if current.online_cpus > 0 {
        current.online_cpus
    } else {
        current.percpu_count
    };

    let pct = (cpu_delta as f64 / system_delta as f64) * online_cpus as f64 * 100.0;
    round2(pct)
}

/// Compute memory usage from one raw reading.
///
/// Page cache is subtracted from the reported usage when present, since
/// cache pages are reclaimable and inflate the reading. A zero limit
/// (unlimited or unreported) yields `0.0` percent.
pub fn memory_usage(usage_bytes: u64, cache_bytes: u64, limit_bytes: u64) -> MemoryUsage {
    let actual = if cache_bytes > 0 {
        usage_bytes.saturating_sub(cache_bytes)
    } else {
        usage_bytes
    };

    let used_mb = round2(actual as f64 / 1_048_576.0);
    let percent = if limit_bytes > 0 {
        round2(actual as f64 / limit_bytes as f64 * 100.0)
    } else {
        0.0
    };

    MemoryUsage { used_mb, percent }
}

/// Memory usage for a full raw sample
pub fn memory_usage_of(sample: &RawStatsSample) -> MemoryUsage {
    memory_usage(
        sample.memory_usage_bytes,
        sample.memory_cache_bytes,
        sample.memory_limit_bytes,
    )
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(total: u64, system: u64, online: u32) -> RawStatsSample {
        RawStatsSample {
            cpu_total_usage: total,
            system_cpu_usage: system,
            online_cpus: online,
            ..Default::default()
        }
    }

    #[test]
    fn cpu_percent_basic() {
        // (200 / 1000) * 4 * 100 = 80.00
        let prev = sample(800, 4000, 4);
        let cur = sample(1000, 5000, 4);
        assert_eq!(cpu_percent(&cur, &prev), 80.0);
    }

    #[test]
    fn cpu_percent_zero_system_delta() {
        let prev = sample(800, 5000, 4);
        let cur = sample(1000, 5000, 4);
        assert_eq!(cpu_percent(&cur, &prev), 0.0);
    }

    #[test]
    fn cpu_percent_negative_deltas() {
        // Counters reset (container restart) must not produce a negative
        // or NaN percentage.
        let prev = sample(9000, 90000, 2);
        let cur = sample(100, 100000, 2);
        assert_eq!(cpu_percent(&cur, &prev), 0.0);

        let prev = sample(100, 90000, 2);
        let cur = sample(200, 80000, 2);
        assert_eq!(cpu_percent(&cur, &prev), 0.0);
    }

    #[test]
    fn cpu_percent_is_pure() {
        let prev = sample(800, 4000, 4);
        let cur = sample(1000, 5000, 4);
        assert_eq!(cpu_percent(&cur, &prev), cpu_percent(&cur, &prev));
    }

    #[test]
    fn cpu_percent_online_cpu_fallback() {
        let prev = sample(800, 4000, 0);
        let mut cur = sample(1000, 5000, 0);
        cur.percpu_count = 4;
        assert_eq!(cpu_percent(&cur, &prev), 80.0);

        // No fallback information at all: percent collapses to zero
        cur.percpu_count = 0;
        assert_eq!(cpu_percent(&cur, &prev), 0.0);
    }

    #[test]
    fn cpu_percent_rounds_to_two_decimals() {
        // (1 / 3) * 1 * 100 = 33.333... -> 33.33
        let prev = sample(0, 0, 1);
        let cur = sample(1, 3, 1);
        assert_eq!(cpu_percent(&cur, &prev), 33.33);
    }

    #[test]
    fn memory_usage_subtracts_cache() {
        let mb = 1024 * 1024;
        let usage = memory_usage(300 * mb, 50 * mb, 500 * mb);
        assert_eq!(usage.used_mb, 250.0);
        assert_eq!(usage.percent, 50.0);
    }

    #[test]
    fn memory_usage_without_cache() {
        let mb = 1024 * 1024;
        let usage = memory_usage(250 * mb, 0, 500 * mb);
        assert_eq!(usage.used_mb, 250.0);
        assert_eq!(usage.percent, 50.0);
    }

    #[test]
    fn memory_usage_zero_limit() {
        let usage = memory_usage(300 * 1024 * 1024, 0, 0);
        assert_eq!(usage.percent, 0.0);
        assert_eq!(usage.used_mb, 300.0);
    }

    #[test]
    fn memory_usage_monotonic_in_usage() {
        let limit = 500 * 1024 * 1024;
        let mut last = -1.0;
        for usage_mb in [0u64, 50, 100, 250, 400, 500] {
            let usage = memory_usage(usage_mb * 1024 * 1024, 0, limit);
            assert!(usage.percent >= last);
            last = usage.percent;
        }
    }

    #[test]
    fn memory_usage_cache_larger_than_usage() {
        // Saturating subtraction guards a cache reading that races ahead
        // of the usage reading.
        let usage = memory_usage(100, 200, 1024);
        assert_eq!(usage.used_mb, 0.0);
        assert_eq!(usage.percent, 0.0);
    }
}
