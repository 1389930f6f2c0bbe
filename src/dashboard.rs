//! Refreshing terminal table over live aggregator snapshots.

use chrono::Utc;
use colored::Colorize;
use crossterm::cursor::MoveTo;
use crossterm::execute;
use crossterm::terminal::{Clear, ClearType};
use regex::Regex;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::aggregator::{Aggregator, FullSnapshot, PersistenceStatus, SeriesSnapshot, WindowStats};
use crate::config::{ConfigError, DashboardConfig, GroupBy};
use crate::models::RouteKey;

const KEY_W: usize = 60;
const N_W: usize = 5;
const OK_W: usize = 7;
const MS_W: usize = 8;
const AGE_W: usize = 6;
const THR_W: usize = 3;

pub fn fmt_ms(value: Option<f64>, width: usize) -> String {
    match value {
        None => format!("{:>width$}", "\u{2014}"),
        Some(ms) if ms < 1000.0 => format!("{:>w$}ms", ms.round() as i64, w = width.saturating_sub(2)),
        Some(ms) => format!("{:>w$.2}s", ms / 1000.0, w = width.saturating_sub(1)),
    }
}

pub fn fmt_pct(value: Option<f64>, width: usize) -> String {
    match value {
        None => format!("{:>width$}", "\u{2014}"),
        Some(pct) => format!("{:>w$.1}%", pct, w = width.saturating_sub(1)),
    }
}

struct CompiledRule {
    regex: Regex,
    ok_pct: Option<f64>,
    p95_ms: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub ok_pct: f64,
    pub p95_ms: f64,
    pub custom: bool,
}

/// Global thresholds plus regex overrides matched against `series route`.
pub struct ThresholdBook {
    ok_pct: f64,
    p95_ms: f64,
    rules: Vec<CompiledRule>,
}

impl ThresholdBook {
    pub fn from_config(config: &DashboardConfig) -> Result<Self, ConfigError> {
        let rules = config
            .rules
            .iter()
            .filter(|r| r.ok_pct.is_some() || r.p95_ms.is_some())
            .map(|r| {
                Regex::new(&r.pattern)
                    .map(|regex| CompiledRule { regex, ok_pct: r.ok_pct, p95_ms: r.p95_ms })
                    .map_err(|source| ConfigError::InvalidRule { pattern: r.pattern.clone(), source })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { ok_pct: config.ok_threshold, p95_ms: config.p95_threshold_ms, rules })
    }

    pub fn global(ok_pct: f64, p95_ms: f64) -> Self {
        Self { ok_pct, p95_ms, rules: Vec::new() }
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    pub fn for_route(&self, route: &RouteKey) -> Thresholds {
        self.for_subject(&format!("{} {}", route.series(), route.route()))
    }

    /// Rules are matched against `endpoint:check route`, or `endpoint:check`
    /// alone for merged rows.
    pub fn for_subject(&self, subject: &str) -> Thresholds {
        for rule in &self.rules {
            if rule.regex.is_match(subject) {
                return Thresholds {
                    ok_pct: rule.ok_pct.unwrap_or(self.ok_pct),
                    p95_ms: rule.p95_ms.unwrap_or(self.p95_ms),
                    custom: true,
                };
            }
        }
        Thresholds { ok_pct: self.ok_pct, p95_ms: self.p95_ms, custom: false }
    }
}

/// Worst first: lowest success rate, then highest p95.
pub fn worst_first(a: &WindowStats, b: &WindowStats) -> std::cmp::Ordering {
    let ok = |s: &WindowStats| s.success_pct.unwrap_or(0.0);
    let p95 = |s: &WindowStats| s.p95_ms.unwrap_or(-1.0);
    ok(a).total_cmp(&ok(b)).then_with(|| p95(b).total_cmp(&p95(a)))
}

/// One table row; colors are applied after padding so columns stay aligned.
pub fn render_row(label: &str, stats: &WindowStats, thresholds: Thresholds, show_mean: bool) -> String {
    let key: String = label.chars().take(KEY_W).collect();

    let ok_raw = fmt_pct(stats.success_pct, OK_W);
    let ok = match stats.success_pct {
        None => ok_raw,
        Some(pct) if pct < thresholds.ok_pct => ok_raw.red().to_string(),
        Some(pct) if pct < 99.9 => ok_raw.yellow().to_string(),
        Some(_) => ok_raw.green().to_string(),
    };

    let p95_raw = fmt_ms(stats.p95_ms, MS_W);
    let p95 = match stats.p95_ms {
        Some(ms) if ms > thresholds.p95_ms => p95_raw.red().to_string(),
        _ => p95_raw,
    };

    let age = match stats.age {
        Some(age) => format!("{:>w$}s", age.as_secs(), w = AGE_W - 1),
        None => format!("{:>AGE_W$}", "\u{2014}"),
    };
    let marker = if thresholds.custom { "*" } else { "" };

    let mut line = format!(
        "{:<KEY_W$} {:>N_W$} {} {} {} {} {} {:>THR_W$}",
        key,
        stats.count,
        ok,
        fmt_ms(stats.p50_ms, MS_W),
        p95,
        fmt_ms(stats.last_ms, MS_W),
        age,
        marker,
    );
    if show_mean {
        let mean_raw = fmt_ms(stats.mean_ms, MS_W);
        let mean = match stats.mean_ms {
            Some(ms) if ms > thresholds.p95_ms => mean_raw.yellow().to_string(),
            _ => mean_raw,
        };
        line.push(' ');
        line.push_str(&mean);
    }
    line
}

fn persistence_line(status: &PersistenceStatus) -> Option<String> {
    if status.degraded {
        let line = format!(
            "LOG WRITES FAILING ({} consecutive, {} dropped): {}",
            status.consecutive_failures,
            status.dropped,
            status.last_error.as_deref().unwrap_or("unknown error")
        );
        Some(line.red().to_string())
    } else {
        status
            .last_error
            .as_deref()
            .map(|e| format!("Last log write failed, retrying: {}", e).yellow().to_string())
    }
}

/// One frame. `series` supplies the rows when grouping by endpoint.
pub fn render(
    snapshot: &FullSnapshot,
    series: &[SeriesSnapshot],
    book: &ThresholdBook,
    config: &DashboardConfig,
    capacity: usize,
) -> String {
    let mut out = String::new();
    let width = KEY_W + N_W + OK_W + MS_W * 3 + AGE_W + THR_W + 7 + if config.show_mean { MS_W + 1 } else { 0 };
    let sep = "-".repeat(width);

    out.push_str(&format!(
        "vdapulse | Window: {}  Refresh: {}s  UTC: {}\n",
        capacity,
        config.refresh_secs,
        Utc::now().format("%Y-%m-%d %H:%M:%S")
    ));
    if book.rule_count() > 0 {
        out.push_str(&format!("Rules: {} loaded (first match wins)\n", book.rule_count()));
    }
    if let Some(line) = persistence_line(&snapshot.persistence) {
        out.push_str(&line);
        out.push('\n');
    }
    out.push_str(&sep);
    out.push('\n');

    let key_title = match config.group_by {
        GroupBy::Endpoint => "Series (all routes)",
        GroupBy::Route => "Series [Route]",
    };
    let mut header = format!(
        "{:<KEY_W$} {:>N_W$} {:>OK_W$} {:>MS_W$} {:>MS_W$} {:>MS_W$} {:>AGE_W$} {:>THR_W$}",
        key_title, "N", "OK%", "p50", "p95", "Last", "Age", "Thr"
    );
    if config.show_mean {
        header.push_str(&format!(" {:>MS_W$}", "Mean"));
    }
    out.push_str(&header);
    out.push('\n');
    out.push_str(&sep);
    out.push('\n');

    let mut rows: Vec<(String, &WindowStats, Thresholds)> = match config.group_by {
        GroupBy::Endpoint => series
            .iter()
            .map(|s| {
                let label = if s.routes > 1 { format!("{} ({} routes)", s.series, s.routes) } else { s.series.clone() };
                (label, &s.stats, book.for_subject(&s.series))
            })
            .collect(),
        GroupBy::Route => snapshot
            .routes
            .iter()
            .map(|r| (r.route.to_string(), &r.stats, book.for_route(&r.route)))
            .collect(),
    };
    rows.retain(|(_, stats, _)| !stats.is_empty());
    if rows.is_empty() {
        out.push_str("(waiting for data\u{2026})\n");
    } else {
        rows.sort_by(|a, b| worst_first(a.1, b.1));
        for (label, stats, thresholds) in rows {
            out.push_str(&render_row(&label, stats, thresholds, config.show_mean));
            out.push('\n');
        }
    }

    out.push_str(&sep);
    out.push('\n');
    out.push_str(&format!(
        "All routes: N={} OK%={} p50={} p95={}\n",
        snapshot.all.count,
        fmt_pct(snapshot.all.success_pct, 0).trim(),
        fmt_ms(snapshot.all.p50_ms, 0).trim(),
        fmt_ms(snapshot.all.p95_ms, 0).trim(),
    ));
    out.push_str("Legend: OK% < thr \u{2192} RED | p95 > thr \u{2192} RED | Thr=* has custom rule\n");
    out
}

/// Redraws the table every `refresh_secs` until cancelled.
pub async fn run_dashboard(aggregator: Arc<Aggregator>, config: DashboardConfig, cancel: CancellationToken) {
    let book = match ThresholdBook::from_config(&config) {
        Ok(book) => book,
        Err(e) => {
            warn!(error = %e, "Dashboard rules invalid, using global thresholds");
            ThresholdBook::global(config.ok_threshold, config.p95_threshold_ms)
        }
    };
    let refresh = Duration::from_secs_f64(config.refresh_secs.max(0.2));
    let mut ticker = tokio::time::interval(refresh);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        let series = match config.group_by {
            GroupBy::Endpoint => aggregator.snapshot_series(),
            GroupBy::Route => Vec::new(),
        };
        let frame = render(&aggregator.snapshot_all(), &series, &book, &config, aggregator.capacity());
        let mut stdout = std::io::stdout().lock();
        if let Err(e) = execute!(stdout, Clear(ClearType::All), MoveTo(0, 0)) {
            warn!(error = %e, "Dashboard redraw failed");
        }
        let _ = write!(stdout, "{}", frame);
        let _ = stdout.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThresholdRule;
    use crate::models::{now_millis, CheckKind, ErrorKind, Sample};

    fn route(endpoint: &str) -> RouteKey {
        RouteKey {
            endpoint: endpoint.into(),
            check: CheckKind::Port(2598),
            src_ip: Some("10.0.0.5".parse().unwrap()),
            dst_ip: Some("10.0.1.7".parse().unwrap()),
        }
    }

    fn stats(ok: f64, p95: Option<f64>) -> WindowStats {
        WindowStats {
            count: 10,
            failures: 0,
            success_pct: Some(ok),
            p50_ms: p95,
            p95_ms: p95,
            mean_ms: p95,
            last_ms: p95,
            age: Some(Duration::from_secs(3)),
        }
    }

    #[test]
    fn millisecond_formatting() {
        assert_eq!(fmt_ms(Some(12.4), 8), "    12ms");
        assert_eq!(fmt_ms(Some(1500.0), 8), "   1.50s");
        assert_eq!(fmt_ms(None, 3), "  \u{2014}");
        assert_eq!(fmt_pct(Some(99.95), 7), " 100.0%");
    }

    #[test]
    fn first_matching_rule_wins() {
        let config = DashboardConfig {
            rules: vec![
                ThresholdRule { pattern: "^vda".into(), ok_pct: Some(95.0), p95_ms: None },
                ThresholdRule { pattern: "vda01".into(), ok_pct: Some(50.0), p95_ms: Some(5.0) },
                ThresholdRule { pattern: "ignored".into(), ok_pct: None, p95_ms: None },
            ],
            ..Default::default()
        };
        let book = ThresholdBook::from_config(&config).unwrap();
        assert_eq!(book.rule_count(), 2);

        let t = book.for_route(&route("vda01.corp.local"));
        assert_eq!(t, Thresholds { ok_pct: 95.0, p95_ms: 50.0, custom: true });

        let t = book.for_route(&route("storefront.corp.local"));
        assert_eq!(t, Thresholds { ok_pct: 99.0, p95_ms: 50.0, custom: false });

        let t = ThresholdBook::from_config(&config).unwrap().for_route(&route("x 10.0.0.5->10.0.1.7"));
        assert!(!t.custom);
    }

    #[test]
    fn rows_colour_by_threshold() {
        colored::control::set_override(true);
        let thresholds = Thresholds { ok_pct: 99.0, p95_ms: 50.0, custom: false };
        let label = route("vda01").to_string();

        let bad = render_row(&label, &stats(80.0, Some(120.0)), thresholds, false);
        assert!(bad.contains(&"  80.0%".red().to_string()));
        assert!(bad.contains(&"   120ms".red().to_string()));

        let good = render_row(&label, &stats(100.0, Some(3.0)), thresholds, true);
        assert!(good.contains(&" 100.0%".green().to_string()));
        assert!(good.ends_with("     3ms"));

        let warm = render_row(&label, &stats(99.5, Some(3.0)), thresholds, false);
        assert!(warm.contains(&"  99.5%".yellow().to_string()));
    }

    #[test]
    fn worst_routes_sort_first() {
        let mut rows = vec![stats(100.0, Some(3.0)), stats(90.0, Some(3.0)), stats(100.0, Some(30.0))];
        rows.sort_by(worst_first);
        assert_eq!(rows[0].success_pct, Some(90.0));
        assert_eq!(rows[1].p95_ms, Some(30.0));
    }

    #[test]
    fn frame_shows_waiting_and_write_failures() {
        let agg = Aggregator::new(10);
        let config = DashboardConfig::default();
        let book = ThresholdBook::from_config(&config).unwrap();

        let config = DashboardConfig { group_by: GroupBy::Route, ..config };
        let frame = render(&agg.snapshot_all(), &[], &book, &config, agg.capacity());
        assert!(frame.contains("(waiting for data"));

        agg.ingest(Sample {
            timestamp: now_millis(),
            endpoint: "vda01".into(),
            check: CheckKind::Port(2598),
            success: false,
            latency_ms: None,
            error: Some(ErrorKind::Timeout),
            src_ip: None,
            dst_ip: None,
        });
        agg.set_persistence(PersistenceStatus {
            last_error: Some("No space left on device".into()),
            consecutive_failures: 6,
            degraded: true,
            dropped: 2,
        });
        let frame = render(&agg.snapshot_all(), &[], &book, &config, agg.capacity());
        assert!(frame.contains("LOG WRITES FAILING (6 consecutive, 2 dropped)"));
        assert!(frame.contains("vda01:2598 [n/a]"));
        assert!(frame.contains("All routes: N=1 OK%=0.0%"));
    }

    #[test]
    fn endpoint_grouping_merges_routes_into_one_row() {
        let agg = Aggregator::new(10);
        for (src, success) in [("10.0.0.5", true), ("10.0.0.6", false), ("10.0.0.5", true)] {
            agg.ingest(Sample {
                timestamp: now_millis(),
                endpoint: "vda01".into(),
                check: CheckKind::Port(2598),
                success,
                latency_ms: success.then_some(4.0),
                error: (!success).then_some(ErrorKind::Refused),
                src_ip: Some(src.parse().unwrap()),
                dst_ip: Some("10.0.1.7".parse().unwrap()),
            });
        }
        let config = DashboardConfig {
            rules: vec![ThresholdRule { pattern: "^vda01:2598$".into(), ok_pct: Some(50.0), p95_ms: None }],
            ..Default::default()
        };
        let book = ThresholdBook::from_config(&config).unwrap();

        let frame = render(&agg.snapshot_all(), &agg.snapshot_series(), &book, &config, agg.capacity());
        assert!(frame.contains("Series (all routes)"));
        assert!(frame.contains("vda01:2598 (2 routes)"));
        assert!(!frame.contains("10.0.0.6"));
        assert!(frame.lines().any(|l| l.starts_with("vda01:2598 (2 routes)") && l.trim_end().ends_with('*')));

        let by_route = DashboardConfig { group_by: GroupBy::Route, ..config };
        let frame = render(&agg.snapshot_all(), &[], &book, &by_route, agg.capacity());
        assert!(frame.contains("vda01:2598 [10.0.0.6->10.0.1.7]"));
        assert!(frame.contains("vda01:2598 [10.0.0.5->10.0.1.7]"));
    }
}
