//! Host-wide resource sampling
//!
//! The scaling policy refuses to create clones when the host itself is
//! short on memory or CPU. These readings are host-wide, not
//! per-container, so they come from the OS rather than the engine.

use sysinfo::System;

/// Host-wide free resource reading
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HostResources {
    pub free_memory_bytes: u64,
    pub free_cpu_percent: f64,
}

/// Seam for host resource readings so policy tests can fix them
pub trait HostSampler: Send + Sync {
    fn sample(&mut self) -> HostResources;
}

/// Samples via the OS through `sysinfo`
pub struct SysinfoSampler {
    system: System,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        // Prime the CPU counters; the first usage reading after creation
        // is always zero.
        system.refresh_cpu_usage();
        Self { system }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl HostSampler for SysinfoSampler {
    fn sample(&mut self) -> HostResources {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();

        let used = f64::from(self.system.global_cpu_info().cpu_usage());
        HostResources {
            free_memory_bytes: self.system.available_memory(),
            free_cpu_percent: (100.0 - used).max(0.0),
        }
    }
}

/// Fixed sampler for tests and for running with host checks disabled
#[derive(Debug, Clone, Copy)]
pub struct FixedSampler(pub HostResources);

impl HostSampler for FixedSampler {
    fn sample(&mut self) -> HostResources {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sysinfo_sampler_stays_in_range() {
        let mut sampler = SysinfoSampler::new();
        let reading = sampler.sample();
        assert!(reading.free_cpu_percent >= 0.0);
        assert!(reading.free_cpu_percent <= 100.0);
    }

    #[test]
    fn fixed_sampler_returns_given_reading() {
        let reading = HostResources {
            free_memory_bytes: 1 << 30,
            free_cpu_percent: 42.0,
        };
        let mut sampler = FixedSampler(reading);
        assert_eq!(sampler.sample(), reading);
    }
}
