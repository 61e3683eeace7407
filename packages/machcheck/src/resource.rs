//! Time and memory budgets, checked cooperatively at step boundaries.

use std::time::{Duration, Instant};

use memory_stats::memory_stats;
use tracing::warn;

use crate::error::ResourceExceeded;

/// Callback deciding whether the search may continue.
pub trait BudgetCheck: Send + Sync {
    fn check(&self) -> Result<(), ResourceExceeded>;
}

/// A budget that never runs out.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unlimited;

impl BudgetCheck for Unlimited {
    fn check(&self) -> Result<(), ResourceExceeded> {
        Ok(())
    }
}

/// Resident memory of this process in megabytes, if the platform reports it.
pub fn resident_memory_mb() -> Option<f64> {
    memory_stats().map(|stats| stats.physical_mem as f64 / (1024.0 * 1024.0))
}

/// Wall-clock and resident-memory budget for one search.
#[derive(Debug, Clone)]
pub struct ResourceMonitor {
    started: Instant,
    time_limit: Option<Duration>,
    mem_limit_mb: Option<f64>,
}

impl ResourceMonitor {
    /// Start the clock now. Zero limits mean unlimited.
    pub fn new(time_limit_secs: f64, mem_limit_mb: f64) -> Self {
        Self {
            started: Instant::now(),
            time_limit: (time_limit_secs > 0.0).then(|| Duration::from_secs_f64(time_limit_secs)),
            mem_limit_mb: (mem_limit_mb > 0.0).then_some(mem_limit_mb),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl BudgetCheck for ResourceMonitor {
    fn check(&self) -> Result<(), ResourceExceeded> {
        if let Some(limit) = self.time_limit {
            if self.started.elapsed() > limit {
                warn!(limit_secs = limit.as_secs_f64(), "time limit exceeded");
                return Err(ResourceExceeded::Timeout {
                    limit_secs: limit.as_secs_f64(),
                });
            }
        }
        if let Some(limit_mb) = self.mem_limit_mb {
            if let Some(used_mb) = resident_memory_mb() {
                if used_mb > limit_mb {
                    warn!(limit_mb, used_mb, "memory limit exceeded");
                    return Err(ResourceExceeded::Memout { limit_mb, used_mb });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_budget() {
        assert!(Unlimited.check().is_ok());
        assert!(ResourceMonitor::new(0.0, 0.0).check().is_ok());
    }

    #[test]
    fn test_expired_time_limit() {
        let monitor = ResourceMonitor {
            started: Instant::now() - Duration::from_secs(5),
            time_limit: Some(Duration::from_secs(1)),
            mem_limit_mb: None,
        };
        assert!(matches!(monitor.check(), Err(ResourceExceeded::Timeout { .. })));
    }

    #[test]
    fn test_tiny_memory_limit_trips_when_measurable() {
        let monitor = ResourceMonitor::new(0.0, 0.001);
        match resident_memory_mb() {
            Some(_) => assert!(matches!(monitor.check(), Err(ResourceExceeded::Memout { .. }))),
            None => assert!(monitor.check().is_ok()),
        }
    }
}
