use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::aggregator::Aggregator;
use crate::alert::{AlertEvent, StatusTracker};
use crate::models::Sample;
use crate::writer::LogWriter;

/// Serializes every sample through the log writer, then into the aggregator.
///
/// Runs on a dedicated blocking thread that owns the [`LogWriter`], so file
/// lines appear in the order samples were submitted (probe completion order).
pub struct Collector {
    tx: mpsc::UnboundedSender<Sample>,
    handle: JoinHandle<u64>,
}

impl Collector {
    pub fn spawn(
        writer: LogWriter,
        aggregator: Arc<Aggregator>,
        alerts: Option<mpsc::UnboundedSender<AlertEvent>>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::task::spawn_blocking(move || collect(rx, writer, aggregator, alerts));
        Self { tx, handle }
    }

    pub fn sender(&self) -> mpsc::UnboundedSender<Sample> {
        self.tx.clone()
    }

    /// Closes the intake and waits until every queued sample has been handled.
    /// Returns the number of samples processed.
    pub async fn shutdown(self) -> u64 {
        drop(self.tx);
        match self.handle.await {
            Ok(processed) => processed,
            Err(e) => {
                warn!(error = %e, "Collector thread ended abnormally");
                0
            }
        }
    }
}

fn collect(
    mut rx: mpsc::UnboundedReceiver<Sample>,
    mut writer: LogWriter,
    aggregator: Arc<Aggregator>,
    alerts: Option<mpsc::UnboundedSender<AlertEvent>>,
) -> u64 {
    let mut tracker = StatusTracker::new();
    let mut processed = 0u64;

    while let Some(sample) = rx.blocking_recv() {
        let was_degraded = writer.is_degraded();
        if let Err(e) = writer.append(sample.clone()) {
            debug!(error = %e, "sample queued for retry");
        }
        let status = writer.status();
        aggregator.set_persistence(status.clone());

        let mut events = Vec::new();
        match (was_degraded, status.degraded) {
            (false, true) => events.push(AlertEvent::Degraded(status)),
            (true, false) => events.push(AlertEvent::Recovered),
            _ => {}
        }
        if let Some(event) = tracker.observe(&sample) {
            events.push(event);
        }
        if let Some(alerts) = &alerts {
            for event in events {
                let _ = alerts.send(event);
            }
        }

        aggregator.ingest(sample);
        processed += 1;
    }

    if let Err(e) = writer.close() {
        warn!(error = %e, "Final log flush failed");
    }
    aggregator.set_persistence(writer.status());
    info!(processed, "Collector drained");
    processed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::WindowKey;
    use crate::models::{now_millis, CheckKind, ErrorKind};
    use crate::writer::LogOutput;

    fn sample(endpoint: &str, success: bool) -> Sample {
        Sample {
            timestamp: now_millis(),
            endpoint: endpoint.into(),
            check: CheckKind::Port(2598),
            success,
            latency_ms: success.then_some(2.0),
            error: (!success).then_some(ErrorKind::Unreachable),
            src_ip: None,
            dst_ip: None,
        }
    }

    #[tokio::test]
    async fn samples_reach_disk_and_aggregator() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let aggregator = Arc::new(Aggregator::new(100));
        let (alert_tx, mut alert_rx) = mpsc::unbounded_channel();

        let collector = Collector::spawn(
            LogWriter::new(LogOutput::Fixed { path: path.clone() }),
            Arc::clone(&aggregator),
            Some(alert_tx),
        );
        let tx = collector.sender();
        tx.send(sample("vda01", true)).unwrap();
        tx.send(sample("vda02", false)).unwrap();
        drop(tx);
        assert_eq!(collector.shutdown().await, 2);

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body.lines().count(), 3);
        let first = body.lines().nth(1).unwrap();
        assert!(first.contains(",vda01,"));

        let stats = aggregator.snapshot(&WindowKey::All).stats;
        assert_eq!(stats.count, 2);
        assert_eq!(stats.success_pct, Some(50.0));

        match alert_rx.recv().await {
            Some(AlertEvent::Transition { route, .. }) => assert_eq!(route.endpoint, "vda02"),
            other => panic!("unexpected alert: {:?}", other),
        }
        assert!(alert_rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn write_failures_surface_in_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let aggregator = Arc::new(Aggregator::new(100));
        let collector = Collector::spawn(
            LogWriter::new(LogOutput::Fixed { path: dir.path().to_path_buf() }).with_degraded_after(2),
            Arc::clone(&aggregator),
            None,
        );
        let tx = collector.sender();
        for _ in 0..2 {
            tx.send(sample("vda01", true)).unwrap();
        }
        drop(tx);
        collector.shutdown().await;

        let snap = aggregator.snapshot(&WindowKey::All);
        assert_eq!(snap.stats.count, 2);
        assert!(snap.persistence.degraded);
        assert!(snap.persistence.last_error.is_some());
    }

    #[tokio::test]
    async fn queued_samples_are_written_at_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("late.csv");
        std::fs::create_dir(&path).unwrap();

        let aggregator = Arc::new(Aggregator::new(100));
        let collector = Collector::spawn(
            LogWriter::new(LogOutput::Fixed { path: path.clone() }),
            Arc::clone(&aggregator),
            None,
        );
        let tx = collector.sender();
        for _ in 0..3 {
            tx.send(sample("vda01", true)).unwrap();
        }
        drop(tx);

        while aggregator.snapshot(&WindowKey::All).stats.count < 3 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        std::fs::remove_dir(&path).unwrap();
        assert_eq!(collector.shutdown().await, 3);

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body.lines().count(), 4);
        let persistence = aggregator.snapshot(&WindowKey::All).persistence;
        assert_eq!(persistence.dropped, 0);
        assert!(persistence.last_error.is_none());
    }
}
