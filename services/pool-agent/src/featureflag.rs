//! Feature flags, read once from `FROST_FEATUREFLAG` (comma separated).

/// Flag name: only frozen instances count toward the pool.
pub const COUNT_WITHOUT_RUNNING: &str = "count-without-running";

#[derive(Debug, Clone, Copy, Default)]
pub struct FeatureFlags {
    /// When set, a runner that has started executing a job no longer
    /// counts toward the pool. By default it does, until it is claimed.
    pub count_without_running: bool,
}

impl FeatureFlags {
    pub fn from_env() -> Self {
        Self::parse(&std::env::var("FROST_FEATUREFLAG").unwrap_or_default())
    }

    pub fn parse(raw: &str) -> Self {
        let mut flags = Self::default();
        for flag in raw.split(',') {
            if flag.trim() == COUNT_WITHOUT_RUNNING {
                flags.count_without_running = true;
            }
        }
        flags
    }
}
