//! Process-wide engine settings.

use std::thread;

/// Upper bound on encryption worker threads.
pub const MAX_THREAD_COUNT: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// CPUs left free for the rest of the system when sizing the pool.
    pub encryption_free_cpu_count: usize,
    /// Explicit worker count. Overrides CPU detection when set.
    pub thread_count: Option<usize>,
    /// Use AES-NI (or equivalent) when the CPU has it.
    pub hardware_acceleration: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            encryption_free_cpu_count: 0,
            thread_count: None,
            hardware_acceleration: true,
        }
    }
}

impl EngineConfig {
    pub fn with_free_cpu_count(mut self, count: usize) -> Self {
        self.encryption_free_cpu_count = count;
        self
    }

    pub fn with_thread_count(mut self, count: usize) -> Self {
        self.thread_count = Some(count);
        self
    }

    pub fn with_hardware_acceleration(mut self, enable: bool) -> Self {
        self.hardware_acceleration = enable;
        self
    }

    /// Number of worker threads the pool should run.
    pub fn effective_thread_count(&self) -> usize {
        let count = match self.thread_count {
            Some(count) => count,
            None => {
                let cpus = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
                cpus.saturating_sub(self.encryption_free_cpu_count)
            }
        };
        count.min(MAX_THREAD_COUNT)
    }
}
