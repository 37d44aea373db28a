use std::path::PathBuf;
use std::time::Duration;

/// Default number of concurrent readers on a record lock.
pub const READ_CONCURRENCY: usize = 10;

/// How waiters compete for permits on a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fairness {
    /// Whoever finds enough free permits first wins. A writer waiting for
    /// every permit can be starved by a steady stream of readers.
    #[default]
    Barging,
    /// Waiters are served in arrival order; a queued writer holds back
    /// readers that arrive after it.
    Fifo,
}

/// Configuration for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Data directory holding operation files and the live index
    pub dir: PathBuf,

    /// Permits on a record-scope lock (default: 10)
    pub read_concurrency: usize,

    /// How often idle locks are swept from the registry (default: 60s)
    pub lock_sweep_interval: Duration,

    /// How long a free lock must be untouched before it is evicted (default: 30s)
    pub lock_idle_window: Duration,

    /// Permit handout policy for registry locks (default: barging)
    pub fairness: Fairness,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./tenantdb"),
            read_concurrency: READ_CONCURRENCY,
            lock_sweep_interval: Duration::from_secs(60),
            lock_idle_window: Duration::from_secs(30),
            fairness: Fairness::Barging,
        }
    }
}

impl EngineConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the number of concurrent readers on a record lock
    pub fn read_concurrency(mut self, permits: usize) -> Self {
        self.read_concurrency = permits.max(1);
        self
    }

    /// Set the idle-lock sweep interval
    pub fn lock_sweep_interval(mut self, interval: Duration) -> Self {
        self.lock_sweep_interval = interval;
        self
    }

    /// Set the idle window after which free locks are evicted
    pub fn lock_idle_window(mut self, window: Duration) -> Self {
        self.lock_idle_window = window;
        self
    }

    /// Set the permit handout policy
    pub fn fairness(mut self, fairness: Fairness) -> Self {
        self.fairness = fairness;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.read_concurrency, 10);
        assert_eq!(config.lock_sweep_interval, Duration::from_secs(60));
        assert_eq!(config.lock_idle_window, Duration::from_secs(30));
        assert_eq!(config.fairness, Fairness::Barging);
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new("/tmp/x")
            .read_concurrency(0)
            .lock_idle_window(Duration::from_millis(5))
            .fairness(Fairness::Fifo);
        assert_eq!(config.dir, PathBuf::from("/tmp/x"));
        assert_eq!(config.read_concurrency, 1, "at least one permit");
        assert_eq!(config.lock_idle_window, Duration::from_millis(5));
        assert_eq!(config.fairness, Fairness::Fifo);
    }
}
