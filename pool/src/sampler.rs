//! Background loop publishing resource gauges.
//!
//! The sampler may start before the pool exists: it watches a
//! `watch::Receiver<Option<WorkerPool>>` and skips ticks while it is `None`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::MetricsConfig;
use crate::coordinator::WorkerPool;
use crate::gauges::{GaugeSink, Sample};
use crate::monitor::ResourceMonitor;

pub struct MetricsSampler {
    pool: watch::Receiver<Option<WorkerPool>>,
    monitor: ResourceMonitor,
    sink: Arc<dyn GaugeSink>,
    interval: Duration,
    startup_delay: Duration,
}

impl MetricsSampler {
    pub fn new(
        pool: watch::Receiver<Option<WorkerPool>>,
        sink: Arc<dyn GaugeSink>,
        config: &MetricsConfig,
    ) -> Self {
        Self {
            pool,
            monitor: ResourceMonitor::for_pids(Vec::new()),
            sink,
            interval: config.interval(),
            startup_delay: config.startup_delay(),
        }
    }

    /// Take one sample and publish it. Returns `Ok(None)` when there is no pool yet.
    ///
    /// CPU figures cover the time since the previous call, so the first
    /// sample reports zero CPU.
    pub fn sample_once(&mut self) -> Result<Option<Sample>> {
        let pids = match self.pool.borrow().as_ref() {
            Some(pool) => pool.worker_pids(),
            None => return Ok(None),
        };
        self.monitor.set_pids(pids);
        let sample = self.monitor.sample();
        self.sink.publish(&sample)?;
        Ok(Some(sample))
    }

    /// Sample every interval until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            startup_delay_secs = self.startup_delay.as_secs(),
            "Metrics sampler started"
        );
        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Metrics sampler cancelled before first sample");
                return;
            }
            _ = tokio::time::sleep(self.startup_delay) => {}
        }

        loop {
            match self.sample_once() {
                Ok(Some(sample)) => debug!(
                    workers = sample.memory.worker_count,
                    total_memory_bytes = sample.memory.total(),
                    "Published resource sample"
                ),
                Ok(None) => debug!("Pool not started, skipping sample"),
                Err(e) => error!(error = %e, "Failed to publish resource sample"),
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Metrics sampler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gauges::PoolGauges;

    fn fast_config() -> MetricsConfig {
        MetricsConfig {
            interval_secs: 1,
            startup_delay_secs: 0,
        }
    }

    #[test]
    fn test_sample_without_pool_is_skipped() {
        let (_tx, rx) = watch::channel(None);
        let mut sampler = MetricsSampler::new(rx, Arc::new(PoolGauges::new()), &fast_config());

        assert!(sampler.sample_once().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_without_pool_stops_on_cancel() {
        let (_tx, rx) = watch::channel(None);
        let cancel = CancellationToken::new();
        let sampler = MetricsSampler::new(rx, Arc::new(PoolGauges::new()), &fast_config());
        let handle = tokio::spawn(sampler.run(cancel.clone()));

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancel_interrupts_startup_delay() {
        let (_tx, rx) = watch::channel(None);
        let config = MetricsConfig {
            interval_secs: 3600,
            startup_delay_secs: 3600,
        };
        let sampler = MetricsSampler::new(rx, Arc::new(PoolGauges::new()), &config);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(sampler.run(cancel.clone()));

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
