//! Batch summaries over historical log files.

use chrono::{DateTime, NaiveDate, Utc};
use regex::Regex;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

use crate::aggregator::WindowStats;
use crate::dashboard::{fmt_ms, fmt_pct, worst_first, ThresholdBook};
use crate::models::{CheckKind, RouteKey, Sample};

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("no {prefix}_*.csv files found in {dir}")]
    NoLogs { dir: PathBuf, prefix: String },
    #[error("no matching samples")]
    NoSamples,
}

/// A log file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFileInfo {
    pub path: PathBuf,
    pub date: NaiveDate,
    pub suffix: Option<String>,
}

/// Lists `<prefix>_<date>[_<suffix>].csv` files in `dir`, newest date first.
pub fn discover_logs(dir: &Path, prefix: &str) -> Result<Vec<LogFileInfo>, ReportError> {
    let pattern = format!(r"^{}_(\d{{4}}-\d{{2}}-\d{{2}})(?:_([^.]+))?\.csv$", regex::escape(prefix));
    let file_name = Regex::new(&pattern).map_err(|e| ReportError::Io {
        path: dir.to_path_buf(),
        source: std::io::Error::new(std::io::ErrorKind::InvalidInput, e),
    })?;

    let entries = std::fs::read_dir(dir).map_err(|source| ReportError::Io { path: dir.to_path_buf(), source })?;
    let mut found = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(caps) = file_name.captures(name) else { continue };
        let Ok(date) = NaiveDate::parse_from_str(&caps[1], "%Y-%m-%d") else { continue };
        found.push(LogFileInfo {
            path: entry.path(),
            date,
            suffix: caps.get(2).map(|m| m.as_str().to_string()),
        });
    }

    found.sort_by(|a, b| b.date.cmp(&a.date).then_with(|| a.suffix.cmp(&b.suffix)));
    Ok(found)
}

#[derive(Debug, Default)]
pub struct LoadedSamples {
    pub samples: Vec<Sample>,
    pub skipped: usize,
}

/// Reads every record of a log file. Header rows (including repeated ones from
/// concatenated files) are skipped; malformed rows are counted, not fatal.
pub fn read_samples(path: &Path) -> Result<LoadedSamples, ReportError> {
    let file = File::open(path).map_err(|source| ReportError::Io { path: path.to_path_buf(), source })?;
    let mut reader = csv::ReaderBuilder::new().has_headers(false).flexible(true).from_reader(file);

    let mut loaded = LoadedSamples::default();
    for record in reader.records() {
        let record = record.map_err(|source| ReportError::Csv { path: path.to_path_buf(), source })?;
        if record.get(0).is_some_and(|f| f.trim().eq_ignore_ascii_case("timestamp_utc")) {
            continue;
        }
        match record.deserialize::<Sample>(None) {
            Ok(sample) => loaded.samples.push(sample),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "skipping malformed row");
                loaded.skipped += 1;
            }
        }
    }
    Ok(loaded)
}

#[derive(Debug, Clone, Default)]
pub struct ReportFilter {
    pub since: Option<DateTime<Utc>>,
    pub check: Option<CheckKind>,
    /// Empty admits every endpoint. Matched case-insensitively.
    pub endpoints: Vec<String>,
    /// Empty admits every destination (resolver, for DNS logs).
    pub destinations: Vec<IpAddr>,
}

impl ReportFilter {
    fn admits(&self, sample: &Sample) -> bool {
        self.since.is_none_or(|since| sample.timestamp >= since)
            && self.check.is_none_or(|check| sample.check == check)
            && (self.endpoints.is_empty() || self.endpoints.iter().any(|e| e.eq_ignore_ascii_case(&sample.endpoint)))
            && (self.destinations.is_empty() || sample.dst_ip.is_some_and(|dst| self.destinations.contains(&dst)))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteSummary {
    pub route: RouteKey,
    pub stats: WindowStats,
    pub last_seen: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub overall: WindowStats,
    pub first: DateTime<Utc>,
    pub last: DateTime<Utc>,
    /// Worst first.
    pub routes: Vec<RouteSummary>,
}

pub fn build_report(samples: &[Sample], filter: &ReportFilter) -> Result<Report, ReportError> {
    let selected: Vec<&Sample> = samples.iter().filter(|s| filter.admits(s)).collect();
    let (Some(first), Some(last)) = (
        selected.iter().map(|s| s.timestamp).min(),
        selected.iter().map(|s| s.timestamp).max(),
    ) else {
        return Err(ReportError::NoSamples);
    };

    let mut by_route: HashMap<RouteKey, Vec<&Sample>> = HashMap::new();
    for sample in selected.iter().copied() {
        by_route.entry(sample.route()).or_default().push(sample);
    }

    let mut routes: Vec<RouteSummary> = by_route
        .into_iter()
        .map(|(route, samples)| {
            let last_seen = samples.iter().map(|s| s.timestamp).max().unwrap_or(last);
            RouteSummary { route, stats: WindowStats::compute(samples.iter().copied(), None), last_seen }
        })
        .collect();
    routes.sort_by(|a, b| worst_first(&a.stats, &b.stats).then_with(|| a.route.to_string().cmp(&b.route.to_string())));

    Ok(Report {
        overall: WindowStats::compute(selected.iter().copied(), None),
        first,
        last,
        routes,
    })
}

pub fn render_report(report: &Report, book: &ThresholdBook, top: usize) -> String {
    let mut out = String::new();
    let o = &report.overall;
    out.push_str(&format!(
        "Samples {} .. {} UTC\n",
        report.first.format("%Y-%m-%d %H:%M:%S"),
        report.last.format("%Y-%m-%d %H:%M:%S")
    ));
    out.push_str(&format!(
        "Total: {}  OK%: {}  Failures: {}  p50: {}  p95: {}  mean: {}\n",
        o.count,
        fmt_pct(o.success_pct, 0),
        o.failures,
        fmt_ms(o.p50_ms, 0),
        fmt_ms(o.p95_ms, 0),
        fmt_ms(o.mean_ms, 0),
    ));

    out.push_str(&format!("\nTop {} offenders (target [route])\n", top.min(report.routes.len())));
    for (rank, summary) in report.routes.iter().take(top).enumerate() {
        let thresholds = book.for_route(&summary.route);
        let s = &summary.stats;
        let breach = match (s.success_pct, s.p95_ms) {
            (Some(ok), _) if ok < thresholds.ok_pct => " !ok",
            (_, Some(p95)) if p95 > thresholds.p95_ms => " !p95",
            _ => "",
        };
        out.push_str(&format!(
            "{:>2}. {:<60} n={:<5} ok={} p95={} fail={} last={}{}\n",
            rank + 1,
            summary.route.to_string(),
            s.count,
            fmt_pct(s.success_pct, 0),
            fmt_ms(s.p95_ms, 0),
            s.failures,
            summary.last_seen.format("%H:%M:%S"),
            breach,
        ));
    }
    out
}
