use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpListener;
use vdapulse::report::read_samples;
use vdapulse::{
    Aggregator, Collector, ErrorKind, LogOutput, LogWriter, NetworkProbe, ScheduleSettings, Scheduler, Target,
    WindowKey,
};

async fn open_port() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, port)
}

fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn settings(timeout: Duration, max_concurrency: usize) -> ScheduleSettings {
    ScheduleSettings { interval: Duration::from_secs(1), timeout, max_concurrency, retries: 0 }
}

#[tokio::test]
async fn one_cycle_logs_and_aggregates_every_target() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("cycle.csv");
    let (_listener, up_port) = open_port().await;
    let down_port = closed_port();

    let targets = vec![
        Target::Tcp { host: "127.0.0.1".into(), port: up_port },
        Target::Tcp { host: "127.0.0.1".into(), port: down_port },
    ];
    let scheduler = Scheduler::with_targets(NetworkProbe::new(), targets, settings(Duration::from_secs(1), 8)).unwrap();

    let aggregator = Arc::new(Aggregator::new(600));
    let collector = Collector::spawn(LogWriter::new(LogOutput::Fixed { path: path.clone() }), Arc::clone(&aggregator), None);
    let sink = collector.sender();

    let summary = scheduler
        .tick(&mut |sample| {
            sink.send(sample).unwrap();
        })
        .await;
    drop(sink);
    assert_eq!(summary.probes, 2);
    assert_eq!(summary.failures, 1);
    assert_eq!(collector.shutdown().await, 2);

    let content = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = content.lines().collect();
    assert_eq!(lines.len(), 3);
    assert!(lines[0].starts_with("timestamp_utc,endpoint,port_or_qtype,success"));

    let all = aggregator.snapshot(&WindowKey::All).stats;
    assert_eq!(all.count, 2);
    assert_eq!(all.success_pct, Some(50.0));

    let loaded = read_samples(&path).unwrap();
    let refused = loaded.samples.iter().find(|s| !s.success).unwrap();
    assert_eq!(refused.error, Some(ErrorKind::Refused));
    assert_eq!(refused.check.to_string(), down_port.to_string());

    // Success and failure on loopback share the same route identity.
    let routes = aggregator.routes();
    assert_eq!(routes.len(), 2);
    assert!(routes.iter().all(|r| r.route() == "127.0.0.1->127.0.0.1"));
}

#[tokio::test]
async fn slow_targets_do_not_stretch_the_cycle() {
    let mut listeners = Vec::new();
    let mut targets = Vec::new();
    for _ in 0..49 {
        let (listener, port) = open_port().await;
        listeners.push(listener);
        targets.push(Target::Tcp { host: "127.0.0.1".into(), port });
    }
    // Non-routable: either times out or fails fast, never blocks the rest.
    targets.push(Target::Tcp { host: "10.255.255.1".into(), port: 2598 });

    let timeout = Duration::from_secs(2);
    let scheduler = Scheduler::with_targets(NetworkProbe::new(), targets, settings(timeout, 64)).unwrap();

    let mut samples = Vec::new();
    let start = Instant::now();
    scheduler.tick(&mut |sample| samples.push(sample)).await;
    let elapsed = start.elapsed();

    assert!(elapsed < timeout + Duration::from_millis(750), "cycle took {:?}", elapsed);
    assert_eq!(samples.len(), 50);
    let unique: HashSet<(String, String)> = samples.iter().map(|s| (s.endpoint.clone(), s.check.to_string())).collect();
    assert_eq!(unique.len(), 50);
    assert_eq!(samples.iter().filter(|s| s.success).count(), 49);

    let slow = samples.iter().find(|s| s.endpoint == "10.255.255.1").unwrap();
    assert!(!slow.success);
    assert!(matches!(slow.error, Some(ErrorKind::Timeout | ErrorKind::Unreachable | ErrorKind::Other)));
    drop(listeners);
}

#[tokio::test]
async fn rotating_output_uses_the_sample_date() {
    let dir = tempfile::tempdir().unwrap();
    let (_listener, port) = open_port().await;
    let scheduler = Scheduler::with_targets(
        NetworkProbe::new(),
        vec![Target::Tcp { host: "127.0.0.1".into(), port }],
        settings(Duration::from_secs(1), 4),
    )
    .unwrap();

    let output = LogOutput::Rotating { dir: dir.path().to_path_buf(), prefix: "sr_trend".into(), suffix: Some(port.to_string()) };
    let aggregator = Arc::new(Aggregator::new(10));
    let collector = Collector::spawn(LogWriter::new(output.clone()), Arc::clone(&aggregator), None);
    let sink = collector.sender();

    let mut dates = Vec::new();
    scheduler
        .tick(&mut |sample| {
            dates.push(sample.timestamp.date_naive());
            sink.send(sample).unwrap();
        })
        .await;
    drop(sink);
    collector.shutdown().await;

    let expected = output.path_for(dates[0]);
    assert!(expected.exists(), "missing {}", expected.display());
    assert_eq!(read_samples(&expected).unwrap().samples.len(), 1);
}
