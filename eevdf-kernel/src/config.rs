use crate::param::NCPU;

/// Runtime knobs chosen by whoever boots the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    /// Number of CPUs that will run `scheduler`, between 1 and [`NCPU`]
    pub cpus: usize,
    /// Maximum level forwarded to the logger
    pub log_level: log::LevelFilter,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            cpus: 1,
            log_level: log::LevelFilter::Info,
        }
    }
}

impl KernelConfig {
    #[must_use]
    pub fn with_cpus(self, cpus: usize) -> Self {
        Self { cpus, ..self }
    }

    #[must_use]
    pub fn with_log_level(self, log_level: log::LevelFilter) -> Self {
        Self { log_level, ..self }
    }

    pub(crate) fn validate(&self) -> bool {
        (1..=NCPU).contains(&self.cpus)
    }
}
