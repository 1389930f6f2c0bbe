use futures::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::models::{ErrorKind, Sample, Target};
use crate::probe::Probe;

/// Slack on top of the probe timeout before the scheduler gives up on a probe
/// that does not honour its own deadline.
const PROBE_GRACE: Duration = Duration::from_millis(250);
const RETRY_PAUSE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy)]
pub struct ScheduleSettings {
    pub interval: Duration,
    pub timeout: Duration,
    pub max_concurrency: usize,
    pub retries: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub probes: usize,
    pub failures: usize,
    pub elapsed: Duration,
}

pub struct Scheduler<P: Probe> {
    probe: Arc<P>,
    targets: watch::Receiver<Arc<[Target]>>,
    settings: ScheduleSettings,
    concurrency_limiter: Arc<Semaphore>,
}

impl<P: Probe> Scheduler<P> {
    /// `targets` may be replaced between ticks by whoever holds the sender.
    pub fn new(
        probe: P,
        targets: watch::Receiver<Arc<[Target]>>,
        settings: ScheduleSettings,
    ) -> Result<Self, ConfigError> {
        if targets.borrow().is_empty() {
            return Err(ConfigError::EmptyTargets);
        }
        if settings.interval.is_zero() {
            return Err(ConfigError::InvalidInterval);
        }
        if settings.timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }
        if settings.max_concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency);
        }

        Ok(Self {
            probe: Arc::new(probe),
            targets,
            settings,
            concurrency_limiter: Arc::new(Semaphore::new(settings.max_concurrency)),
        })
    }

    /// Fixed target list that never changes.
    pub fn with_targets(probe: P, targets: Vec<Target>, settings: ScheduleSettings) -> Result<Self, ConfigError> {
        let (_tx, rx) = watch::channel(Arc::<[Target]>::from(targets));
        Self::new(probe, rx, settings)
    }

    /// Ticks every `interval` until `cancel` fires. A tick that overruns the
    /// interval delays the next one; ticks never overlap. Cancellation is only
    /// observed between ticks, so in-flight probes always complete (each within
    /// its own timeout). Returns the number of completed ticks.
    pub async fn run<F>(&self, cancel: CancellationToken, mut on_sample: F) -> u64
    where
        F: FnMut(Sample),
    {
        info!(
            interval_secs = self.settings.interval.as_secs_f64(),
            timeout_ms = self.settings.timeout.as_millis() as u64,
            max_concurrency = self.settings.max_concurrency,
            "Probe scheduler active"
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut ticks = 0u64;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let summary = self.tick(&mut on_sample).await;
            ticks += 1;
            info!(
                "Cycle {} completed {} probes ({} failed) in {:.2}s",
                ticks,
                summary.probes,
                summary.failures,
                summary.elapsed.as_secs_f64()
            );
            if summary.elapsed > self.settings.interval {
                warn!(
                    elapsed_secs = summary.elapsed.as_secs_f64(),
                    "Cycle overran the probe interval; next cycle delayed"
                );
            }
        }

        info!(ticks, "Probe scheduler stopped");
        ticks
    }

    /// Probes every current target once, delivering samples in completion order.
    pub async fn tick<F>(&self, on_sample: &mut F) -> TickSummary
    where
        F: FnMut(Sample),
    {
        let targets: Arc<[Target]> = self.targets.borrow().clone();
        let start = Instant::now();
        let mut tasks = FuturesUnordered::new();

        for target in targets.iter() {
            let probe = Arc::clone(&self.probe);
            let limiter = Arc::clone(&self.concurrency_limiter);
            let settings = self.settings;
            let t = target.clone();

            let handle = tokio::spawn(async move {
                let _permit = limiter.acquire_owned().await.ok();
                run_check_with_retry(probe.as_ref(), &t, settings.timeout, settings.retries).await
            });
            let target = target.clone();
            tasks.push(async move { (target, handle.await) });
        }

        let mut summary = TickSummary::default();
        while let Some((target, joined)) = tasks.next().await {
            let sample = match joined {
                Ok(sample) => sample,
                Err(e) => {
                    warn!(probe = %target, error = %e, "Probe task aborted");
                    Sample::failure(&target, ErrorKind::Other)
                }
            };
            summary.probes += 1;
            if !sample.success {
                summary.failures += 1;
            }
            debug!(
                probe = %target,
                success = sample.success,
                latency_ms = sample.latency_ms,
                error = sample.error.map(|e| e.as_str()),
                "sample"
            );
            on_sample(sample);
        }

        summary.elapsed = start.elapsed();
        summary
    }
}

async fn run_check_with_retry<P: Probe>(probe: &P, target: &Target, timeout: Duration, retries: u32) -> Sample {
    let mut last_result = perform_check(probe, target, timeout).await;

    if !last_result.success && retries > 0 {
        for _ in 1..=retries {
            tokio::time::sleep(RETRY_PAUSE).await;
            last_result = perform_check(probe, target, timeout).await;
            if last_result.success {
                break;
            }
        }
    }
    last_result
}

async fn perform_check<P: Probe>(probe: &P, target: &Target, timeout: Duration) -> Sample {
    match tokio::time::timeout(timeout + PROBE_GRACE, probe.probe(target, timeout)).await {
        Ok(sample) => sample,
        Err(_) => {
            warn!(probe = %target, "Probe overran its deadline");
            Sample::failure(target, ErrorKind::Timeout)
        }
    }
}
