//! Named admission pools.
//!
//! Each build step acquires `step` first, then the pool matching its
//! dispatch (`local`, `remote`, or `cache`), and possibly a secondary
//! pool such as `preproc` or `scandeps`.

use std::sync::Arc;

use crate::PrioritySemaphore;

/// Pool capacities. Zero disables a pool's behavior entirely (a zero
/// pool never grants).
#[derive(Debug, Clone)]
pub struct LimitsConfig {
    pub step: usize,
    pub preproc: usize,
    pub scandeps: usize,
    pub local: usize,
    pub fastlocal: usize,
    pub startlocal: usize,
    pub remote: usize,
    pub rewrap: usize,
    pub cache: usize,
    pub thread: usize,
}

impl LimitsConfig {
    /// Defaults for a host with `num_cpu` cores talking to a remote
    /// backend that admits `remote` concurrent actions.
    pub fn default_for(num_cpu: usize, remote: usize) -> Self {
        let num_cpu = num_cpu.max(1);
        Self {
            step: num_cpu + remote,
            preproc: num_cpu,
            scandeps: num_cpu,
            local: num_cpu,
            fastlocal: (num_cpu / 4).max(1),
            startlocal: num_cpu,
            remote,
            rewrap: (num_cpu / 2).max(1),
            cache: num_cpu * 10,
            thread: num_cpu,
        }
    }
}

/// The set of named priority semaphores gating step concurrency.
pub struct Limits {
    pub step: Arc<PrioritySemaphore>,
    pub preproc: Arc<PrioritySemaphore>,
    pub scandeps: Arc<PrioritySemaphore>,
    pub local: Arc<PrioritySemaphore>,
    pub fastlocal: Arc<PrioritySemaphore>,
    pub startlocal: Arc<PrioritySemaphore>,
    pub remote: Arc<PrioritySemaphore>,
    pub rewrap: Arc<PrioritySemaphore>,
    pub cache: Arc<PrioritySemaphore>,
    pub thread: Arc<PrioritySemaphore>,
}

impl Limits {
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            step: PrioritySemaphore::new("step", config.step),
            preproc: PrioritySemaphore::new("preproc", config.preproc),
            scandeps: PrioritySemaphore::new("scandeps", config.scandeps),
            local: PrioritySemaphore::new("local", config.local),
            fastlocal: PrioritySemaphore::new("fastlocal", config.fastlocal),
            startlocal: PrioritySemaphore::new("startlocal", config.startlocal),
            remote: PrioritySemaphore::new("remote", config.remote),
            rewrap: PrioritySemaphore::new("rewrap", config.rewrap),
            cache: PrioritySemaphore::new("cache", config.cache),
            thread: PrioritySemaphore::new("thread", config.thread),
        }
    }

    /// Whether the fastlocal heuristic is enabled at all.
    pub fn fastlocal_enabled(&self) -> bool {
        self.fastlocal.capacity() > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_scale_with_cpu_and_remote() {
        let c = LimitsConfig::default_for(8, 80);
        assert_eq!(c.step, 88);
        assert_eq!(c.local, 8);
        assert_eq!(c.remote, 80);
        assert_eq!(c.fastlocal, 2);
        let limits = Limits::new(&c);
        assert_eq!(limits.step.capacity(), 88);
        assert!(limits.fastlocal_enabled());
    }

    #[test]
    fn fastlocal_zero_disables() {
        let mut c = LimitsConfig::default_for(4, 0);
        c.fastlocal = 0;
        let limits = Limits::new(&c);
        assert!(!limits.fastlocal_enabled());
    }
}
