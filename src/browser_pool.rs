//! Browser pool management for capture jobs
//!
//! Keeps a fixed number of headless Chrome processes alive and leases them to
//! capture jobs one at a time. Each lease hands out a fresh browser context
//! (see [`crate::capture`]), so jobs sharing a process never share cookies,
//! storage or cache.
//!
//! Instances are launched lazily. A slot whose process died or that failed
//! too often is relaunched on its next lease.

use crate::{create_browser_config_with_instance_id, CaptureError, Config};
use chromiumoxide::browser::Browser;
use futures::StreamExt;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Failures after which an instance is replaced
const MAX_FAILURES: usize = 3;

/// Instances older than this are recycled when idle
const MAX_INSTANCE_AGE: Duration = Duration::from_secs(60 * 60);

/// Current status of a browser instance in the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Ready to be leased
    Healthy,
    /// Leased to a capture job
    Busy,
    /// Needs a relaunch before the next lease
    Failed,
}

/// A single Chrome process in the pool
#[derive(Debug)]
pub struct BrowserInstance {
    pub id: usize,
    pub browser: Arc<Mutex<Browser>>,
    /// Task polling the DevTools connection
    pub handler: tokio::task::JoinHandle<()>,
    pub last_used: Instant,
    pub lease_count: usize,
    pub status: InstanceStatus,
    pub created_at: Instant,
    pub failure_count: usize,
}

impl BrowserInstance {
    pub fn new(id: usize, browser: Browser, handler: tokio::task::JoinHandle<()>) -> Self {
        Self {
            id,
            browser: Arc::new(Mutex::new(browser)),
            handler,
            last_used: Instant::now(),
            lease_count: 0,
            status: InstanceStatus::Healthy,
            created_at: Instant::now(),
            failure_count: 0,
        }
    }

    pub fn mark_used(&mut self) {
        self.last_used = Instant::now();
        self.lease_count += 1;
        self.status = InstanceStatus::Busy;
    }

    pub fn mark_available(&mut self) {
        self.status = InstanceStatus::Healthy;
    }

    pub fn mark_failed(&mut self) {
        self.failure_count += 1;
        if self.failure_count >= MAX_FAILURES {
            self.status = InstanceStatus::Failed;
        } else {
            self.status = InstanceStatus::Healthy;
        }
    }

    /// Usable for a new lease without a relaunch
    pub fn is_usable(&self) -> bool {
        self.status == InstanceStatus::Healthy && !self.handler.is_finished()
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    pub async fn shutdown(self) {
        let _ = self.browser.lock().await.close().await;
        self.handler.abort();
    }
}

/// Exclusive use of one pooled browser
///
/// Dropping the lease returns the instance to the pool.
pub struct BrowserLease {
    pub browser: Arc<Mutex<Browser>>,
    pub instance_id: usize,
    pool: BrowserPool,
    permit: Option<OwnedSemaphorePermit>,
    failed: bool,
}

impl BrowserLease {
    /// Record a browser-level failure against the leased instance
    pub fn mark_failed(&mut self) {
        self.failed = true;
    }
}

impl Drop for BrowserLease {
    fn drop(&mut self) {
        let pool = self.pool.clone();
        let instance_id = self.instance_id;
        let failed = self.failed;
        let permit = self.permit.take();

        // The permit is released only once the slot is back in the queue.
        tokio::spawn(async move {
            pool.return_browser(instance_id, failed).await;
            drop(permit);
        });
    }
}

/// Fixed-size pool of headless Chrome processes
#[derive(Clone)]
pub struct BrowserPool {
    instances: Arc<Mutex<Vec<Option<BrowserInstance>>>>,
    available: Arc<Mutex<VecDeque<usize>>>,
    semaphore: Arc<Semaphore>,
    config: Config,
    is_shutting_down: Arc<AtomicBool>,
}

impl BrowserPool {
    pub fn new(config: Config) -> Self {
        let size = config.browser_pool_size;
        Self {
            instances: Arc::new(Mutex::new((0..size).map(|_| None).collect())),
            available: Arc::new(Mutex::new((0..size).collect())),
            semaphore: Arc::new(Semaphore::new(size)),
            config,
            is_shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Launch every instance up front
    ///
    /// Launch failures are logged and retried on the first lease.
    pub async fn warm_up(&self) -> usize {
        let mut launched = 0;
        for id in 0..self.config.browser_pool_size {
            if id > 0 {
                // staggered launches avoid profile directory races
                sleep(Duration::from_millis(500)).await;
            }

            match Self::launch_instance(&self.config, id).await {
                Ok(instance) => {
                    self.instances.lock().await[id] = Some(instance);
                    launched += 1;
                    info!("Browser instance {} launched", id);
                }
                Err(e) => warn!("Browser instance {} failed to launch: {}", id, e),
            }
        }
        info!(
            "Browser pool warmed up with {}/{} instances",
            launched, self.config.browser_pool_size
        );
        launched
    }

    async fn launch_instance(config: &Config, id: usize) -> Result<BrowserInstance, CaptureError> {
        let browser_config = create_browser_config_with_instance_id(config, Some(id))
            .map_err(CaptureError::BrowserLaunch)?;

        let (browser, mut handler) = Browser::launch(browser_config)
            .await
            .map_err(|e| CaptureError::BrowserLaunch(e.to_string()))?;

        // The handler stream must be polled for the connection to make progress
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    debug!("Browser {} handler error: {}", id, e);
                }
            }
            debug!("Browser {} handler stream ended", id);
        });

        Ok(BrowserInstance::new(id, browser, handler_task))
    }

    /// Lease a browser, waiting while all instances are busy
    pub async fn acquire(&self) -> Result<BrowserLease, CaptureError> {
        if self.is_shutting_down.load(Ordering::Relaxed) {
            return Err(CaptureError::BrowserUnavailable);
        }

        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| CaptureError::BrowserUnavailable)?;

        let instance_id = self
            .available
            .lock()
            .await
            .pop_front()
            .ok_or(CaptureError::BrowserUnavailable)?;

        match self.checkout(instance_id).await {
            Ok(browser) => Ok(BrowserLease {
                browser,
                instance_id,
                pool: self.clone(),
                permit: Some(permit),
                failed: false,
            }),
            Err(e) => {
                self.available.lock().await.push_back(instance_id);
                Err(e)
            }
        }
    }

    async fn checkout(&self, instance_id: usize) -> Result<Arc<Mutex<Browser>>, CaptureError> {
        let stale = {
            let mut instances = self.instances.lock().await;
            let slot = instances
                .get_mut(instance_id)
                .ok_or(CaptureError::BrowserUnavailable)?;

            if let Some(instance) = slot.as_mut().filter(|i| i.is_usable()) {
                instance.mark_used();
                return Ok(instance.browser.clone());
            }
            slot.take()
        };

        if let Some(old) = stale {
            warn!(
                "Relaunching browser instance {} (failures: {})",
                instance_id, old.failure_count
            );
            old.shutdown().await;
        }

        let mut instance = Self::launch_instance(&self.config, instance_id).await?;
        instance.mark_used();
        let browser = instance.browser.clone();
        self.instances.lock().await[instance_id] = Some(instance);
        Ok(browser)
    }

    pub async fn return_browser(&self, instance_id: usize, failed: bool) {
        {
            let mut instances = self.instances.lock().await;
            if let Some(Some(instance)) = instances.get_mut(instance_id) {
                if failed {
                    instance.mark_failed();
                } else {
                    instance.mark_available();
                }
            }
        }
        self.available.lock().await.push_back(instance_id);
    }

    pub async fn health_check(&self) -> Vec<InstanceHealth> {
        let instances = self.instances.lock().await;
        instances
            .iter()
            .flatten()
            .map(|instance| InstanceHealth {
                id: instance.id,
                status: instance.status,
                lease_count: instance.lease_count,
                age_secs: instance.age().as_secs(),
                idle_secs: instance.idle_time().as_secs(),
                failure_count: instance.failure_count,
                handler_alive: !instance.handler.is_finished(),
            })
            .collect()
    }

    /// Periodically flag dead or worn-out instances for relaunch
    pub fn start_health_check_task(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            while !pool.is_shutting_down.load(Ordering::Relaxed) {
                interval.tick().await;
                pool.flag_unhealthy().await;
            }
        })
    }

    async fn flag_unhealthy(&self) {
        let mut instances = self.instances.lock().await;
        for instance in instances.iter_mut().flatten() {
            if instance.status == InstanceStatus::Busy {
                continue;
            }
            let dead = instance.handler.is_finished();
            let worn = instance.age() > MAX_INSTANCE_AGE;
            if dead || worn {
                info!(
                    "Flagging browser instance {} for relaunch: handler_alive={}, age={:?}",
                    instance.id, !dead, instance.age()
                );
                instance.status = InstanceStatus::Failed;
            }
        }
    }

    pub async fn shutdown(&self) {
        info!("Shutting down browser pool...");
        self.is_shutting_down.store(true, Ordering::Relaxed);

        // Give leased instances a moment to come back
        for _ in 0..10 {
            if self.available.lock().await.len() == self.config.browser_pool_size {
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }

        let mut instances = self.instances.lock().await;
        for slot in instances.iter_mut() {
            if let Some(instance) = slot.take() {
                instance.shutdown().await;
            }
        }

        info!("Browser pool shutdown complete");
    }

    pub async fn get_stats(&self) -> BrowserPoolStats {
        let instances = self.instances.lock().await;
        let available = self.available.lock().await.len();

        let mut stats = BrowserPoolStats {
            total_instances: instances.len(),
            launched_instances: 0,
            healthy_instances: 0,
            busy_instances: 0,
            failed_instances: 0,
            available_instances: available,
            total_leases: 0,
        };

        for instance in instances.iter().flatten() {
            stats.launched_instances += 1;
            stats.total_leases += instance.lease_count;
            match instance.status {
                InstanceStatus::Healthy => stats.healthy_instances += 1,
                InstanceStatus::Busy => stats.busy_instances += 1,
                InstanceStatus::Failed => stats.failed_instances += 1,
            }
        }

        stats
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InstanceHealth {
    pub id: usize,
    pub status: InstanceStatus,
    pub lease_count: usize,
    pub age_secs: u64,
    pub idle_secs: u64,
    pub failure_count: usize,
    pub handler_alive: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BrowserPoolStats {
    /// Configured slots
    pub total_instances: usize,
    /// Slots with a running process
    pub launched_instances: usize,
    pub healthy_instances: usize,
    pub busy_instances: usize,
    pub failed_instances: usize,
    pub available_instances: usize,
    pub total_leases: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_new_pool_is_lazy() {
        let pool = BrowserPool::new(Config {
            browser_pool_size: 3,
            ..Default::default()
        });
        let stats = pool.get_stats().await;
        assert_eq!(stats.total_instances, 3);
        assert_eq!(stats.launched_instances, 0);
        assert_eq!(stats.available_instances, 3);
        assert!(pool.health_check().await.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_leases() {
        let pool = BrowserPool::new(Config::default());
        pool.shutdown().await;
        assert!(matches!(
            pool.acquire().await,
            Err(CaptureError::BrowserUnavailable)
        ));
    }
}
