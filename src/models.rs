use chrono::{DateTime, SubsecRound, Utc};
use hickory_proto::rr::RecordType;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Up,
    Down,
}

impl From<bool> for Status {
    fn from(success: bool) -> Self {
        if success { Status::Up } else { Status::Down }
    }
}

/// What a probe exercises on an endpoint: a TCP port or a DNS record type.
///
/// Rendered into the `port_or_qtype` CSV column, so a numeric value always
/// means TCP and anything else is a query type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum CheckKind {
    Port(u16),
    Query(RecordType),
}

impl fmt::Display for CheckKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckKind::Port(port) => write!(f, "{}", port),
            CheckKind::Query(rtype) => write!(f, "{}", rtype),
        }
    }
}

impl FromStr for CheckKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Ok(port) = s.parse::<u16>() {
            return Ok(CheckKind::Port(port));
        }
        RecordType::from_str(&s.to_ascii_uppercase())
            .map(CheckKind::Query)
            .map_err(|_| format!("'{}' is neither a TCP port nor a DNS record type", s))
    }
}

impl From<CheckKind> for String {
    fn from(kind: CheckKind) -> Self {
        kind.to_string()
    }
}

impl TryFrom<String> for CheckKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// A single (endpoint, check) pair the scheduler probes every tick.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Tcp { host: String, port: u16 },
    Dns { name: String, record_type: RecordType, resolver: IpAddr },
}

impl Target {
    pub fn endpoint(&self) -> &str {
        match self {
            Target::Tcp { host, .. } => host,
            Target::Dns { name, .. } => name,
        }
    }

    pub fn check(&self) -> CheckKind {
        match self {
            Target::Tcp { port, .. } => CheckKind::Port(*port),
            Target::Dns { record_type, .. } => CheckKind::Query(*record_type),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Tcp { host, port } => write!(f, "tcp://{}:{}", host, port),
            Target::Dns { name, record_type, resolver } => {
                write!(f, "dns://{}/{}?{}", resolver, name, record_type)
            }
        }
    }
}

/// Failure classification recorded in the `error` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    Timeout,
    Refused,
    Unreachable,
    DnsFailure,
    Servfail,
    Nxdomain,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Refused => "refused",
            ErrorKind::Unreachable => "unreachable",
            ErrorKind::DnsFailure => "dns-failure",
            ErrorKind::Servfail => "servfail",
            ErrorKind::Nxdomain => "nxdomain",
            ErrorKind::Other => "other",
        }
    }

    /// Maps a legacy free-text error cell onto a class; unknown text is `Other`.
    pub fn from_legacy(text: &str) -> Self {
        let lower = text.to_ascii_lowercase();
        match lower.as_str() {
            "timeout" => ErrorKind::Timeout,
            "refused" => ErrorKind::Refused,
            "unreachable" => ErrorKind::Unreachable,
            "dns-failure" => ErrorKind::DnsFailure,
            "servfail" => ErrorKind::Servfail,
            "nxdomain" => ErrorKind::Nxdomain,
            _ if lower.contains("timed out") || lower.contains("timeout") => ErrorKind::Timeout,
            _ if lower.contains("refused") => ErrorKind::Refused,
            _ if lower.contains("unreachable") => ErrorKind::Unreachable,
            _ if lower.contains("gaierror") || lower.contains("name or service") => ErrorKind::DnsFailure,
            _ => ErrorKind::Other,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One probe outcome. This is also the CSV record: field order and names are
/// the on-disk column layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    #[serde(
        rename = "timestamp_utc",
        serialize_with = "ser_timestamp",
        deserialize_with = "de_timestamp"
    )]
    pub timestamp: DateTime<Utc>,
    pub endpoint: String,
    #[serde(rename = "port_or_qtype")]
    pub check: CheckKind,
    #[serde(deserialize_with = "de_success")]
    pub success: bool,
    pub latency_ms: Option<f64>,
    #[serde(deserialize_with = "de_error")]
    pub error: Option<ErrorKind>,
    #[serde(deserialize_with = "de_ip")]
    pub src_ip: Option<IpAddr>,
    #[serde(deserialize_with = "de_ip")]
    pub dst_ip: Option<IpAddr>,
}

impl Sample {
    pub fn success(target: &Target, latency_ms: f64, src_ip: Option<IpAddr>, dst_ip: Option<IpAddr>) -> Self {
        Self {
            timestamp: now_millis(),
            endpoint: target.endpoint().to_string(),
            check: target.check(),
            success: true,
            latency_ms: Some(round_latency(latency_ms)),
            error: None,
            src_ip,
            dst_ip,
        }
    }

    pub fn failure(target: &Target, error: ErrorKind) -> Self {
        Self {
            timestamp: now_millis(),
            endpoint: target.endpoint().to_string(),
            check: target.check(),
            success: false,
            latency_ms: None,
            error: Some(error),
            src_ip: None,
            dst_ip: None,
        }
    }

    /// Records the time of a definitive negative answer (refusal, NXDOMAIN).
    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = Some(round_latency(latency_ms));
        self
    }

    pub fn with_addrs(mut self, src_ip: Option<IpAddr>, dst_ip: Option<IpAddr>) -> Self {
        self.src_ip = src_ip;
        self.dst_ip = dst_ip;
        self
    }

    pub fn route(&self) -> RouteKey {
        RouteKey {
            endpoint: self.endpoint.clone(),
            check: self.check,
            src_ip: self.src_ip,
            dst_ip: self.dst_ip,
        }
    }
}

/// Grouping key for per-route statistics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RouteKey {
    pub endpoint: String,
    pub check: CheckKind,
    pub src_ip: Option<IpAddr>,
    pub dst_ip: Option<IpAddr>,
}

impl RouteKey {
    pub fn series(&self) -> String {
        format!("{}:{}", self.endpoint, self.check)
    }

    pub fn route(&self) -> String {
        match (self.src_ip, self.dst_ip) {
            (None, None) => "n/a".to_string(),
            (src, dst) => format!("{}->{}", opt_ip(src), opt_ip(dst)),
        }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.series(), self.route())
    }
}

fn opt_ip(ip: Option<IpAddr>) -> String {
    ip.map(|ip| ip.to_string()).unwrap_or_default()
}

pub fn now_millis() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn round_latency(ms: f64) -> f64 {
    (ms * 1000.0).round() / 1000.0
}

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

fn ser_timestamp<S: Serializer>(ts: &DateTime<Utc>, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(&ts.format(TIMESTAMP_FORMAT))
}

fn de_timestamp<'de, D: Deserializer<'de>>(d: D) -> Result<DateTime<Utc>, D::Error> {
    let raw = String::deserialize(d)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

/// Accepts RFC 3339 with `Z` or an offset, and naive timestamps taken as UTC.
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))
}

fn de_success<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let raw = String::deserialize(d)?;
    match raw.trim() {
        "true" | "True" | "TRUE" | "1" => Ok(true),
        "false" | "False" | "FALSE" | "0" | "" => Ok(false),
        other => Err(serde::de::Error::custom(format!("invalid success flag '{}'", other))),
    }
}

fn de_error<'de, D: Deserializer<'de>>(d: D) -> Result<Option<ErrorKind>, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    Ok(raw
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .map(|s| ErrorKind::from_legacy(&s)))
}

fn de_ip<'de, D: Deserializer<'de>>(d: D) -> Result<Option<IpAddr>, D::Error> {
    let raw = Option::<String>::deserialize(d)?;
    match raw.as_deref().map(str::trim) {
        None | Some("") => Ok(None),
        Some(s) => s.parse().map(Some).map_err(serde::de::Error::custom),
    }
}
