use crate::{BrowserPool, BrowserPoolStats, WorkerPool, WorkerStats};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub overall: HealthLevel,
    pub browsers: HealthLevel,
    pub queue: HealthLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser_pool: Option<BrowserPoolStats>,
    pub queue_depth: usize,
    pub queue_capacity: usize,
    pub active_workers: usize,
    pub jobs_processed: usize,
    pub jobs_failed: usize,
    pub workers: Vec<WorkerStats>,
    pub timestamp: DateTime<Utc>,
}

/// Browser pool health from its counters
///
/// Slots that were never launched do not count against the pool; they are
/// launched on demand.
pub fn assess_browser_pool(stats: &BrowserPoolStats) -> HealthLevel {
    if stats.launched_instances == 0 {
        return HealthLevel::Healthy;
    }

    let failure_rate = stats.failed_instances as f64 / stats.launched_instances as f64;
    if failure_rate > 0.5 {
        error!(
            "Browser pool health critical: failure rate {:.2}%",
            failure_rate * 100.0
        );
        return HealthLevel::Critical;
    }
    if failure_rate > 0.2 {
        warn!(
            "Browser pool health warning: failure rate {:.2}%",
            failure_rate * 100.0
        );
        return HealthLevel::Warning;
    }

    HealthLevel::Healthy
}

/// Queue health from its fill ratio
pub fn assess_queue(depth: usize, capacity: usize) -> HealthLevel {
    if capacity == 0 {
        return HealthLevel::Critical;
    }
    let fill = depth as f64 / capacity as f64;
    if fill >= 1.0 {
        error!("Print queue full: {} pending jobs", depth);
        HealthLevel::Critical
    } else if fill > 0.8 {
        warn!("Print queue nearly full: {}/{}", depth, capacity);
        HealthLevel::Warning
    } else {
        HealthLevel::Healthy
    }
}

/// Health snapshot source for the `/health` route
pub struct HealthChecker {
    browser_pool: Option<BrowserPool>,
    workers: Arc<WorkerPool>,
}

impl HealthChecker {
    pub fn new(browser_pool: Option<BrowserPool>, workers: Arc<WorkerPool>) -> Self {
        Self {
            browser_pool,
            workers,
        }
    }

    pub async fn check(&self) -> HealthStatus {
        let browser_pool = match &self.browser_pool {
            Some(pool) => Some(pool.get_stats().await),
            None => None,
        };

        let browsers = browser_pool
            .as_ref()
            .map(assess_browser_pool)
            .unwrap_or(HealthLevel::Healthy);
        let queue_depth = self.workers.queue_depth();
        let queue = assess_queue(queue_depth, self.workers.capacity());

        HealthStatus {
            overall: browsers.max(queue),
            browsers,
            queue,
            browser_pool,
            queue_depth,
            queue_capacity: self.workers.capacity(),
            active_workers: self.workers.active_workers(),
            jobs_processed: self.workers.total_processed(),
            jobs_failed: self.workers.total_errors(),
            workers: self.workers.get_worker_stats(),
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlaunched_pool_is_healthy() {
        let stats = BrowserPoolStats {
            total_instances: 2,
            ..Default::default()
        };
        assert_eq!(assess_browser_pool(&stats), HealthLevel::Healthy);
    }

    #[test]
    fn test_failed_browsers_degrade_health() {
        let stats = BrowserPoolStats {
            total_instances: 4,
            launched_instances: 4,
            healthy_instances: 1,
            failed_instances: 3,
            ..Default::default()
        };
        assert_eq!(assess_browser_pool(&stats), HealthLevel::Critical);

        let stats = BrowserPoolStats {
            failed_instances: 1,
            healthy_instances: 3,
            ..stats
        };
        assert_eq!(assess_browser_pool(&stats), HealthLevel::Warning);
    }

    #[test]
    fn test_queue_levels() {
        assert_eq!(assess_queue(0, 64), HealthLevel::Healthy);
        assert_eq!(assess_queue(60, 64), HealthLevel::Warning);
        assert_eq!(assess_queue(64, 64), HealthLevel::Critical);
        assert_eq!(
            HealthLevel::Warning.max(HealthLevel::Critical),
            HealthLevel::Critical
        );
    }
}
