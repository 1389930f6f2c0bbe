use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::ProtoError;
use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use std::future::Future;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::net::{TcpStream, UdpSocket};
use tracing::{debug, info, warn};

use crate::models::{ErrorKind, Sample, Target};

const DNS_PORT: u16 = 53;
const MAX_UDP_RESPONSE: usize = 4096;

/// One health check against one target.
///
/// Implementations perform exactly one attempt and must return within
/// `timeout` plus scheduling overhead. Failures are encoded in the returned
/// [`Sample`], never as an error.
pub trait Probe: Send + Sync + 'static {
    fn probe(&self, target: &Target, timeout: Duration) -> impl Future<Output = Sample> + Send;
}

/// TCP-connect and single-query DNS checks over the real network.
pub struct NetworkProbe {
    resolver: TokioResolver,
    dns_port: u16,
}

impl NetworkProbe {
    pub fn new() -> Self {
        let (config, mut opts) = match hickory_resolver::system_conf::read_system_conf() {
            Ok(conf) => {
                info!("Host resolution uses the system resolver configuration");
                conf
            }
            Err(e) => {
                warn!("System resolver configuration unavailable ({}), falling back to Cloudflare", e);
                (ResolverConfig::cloudflare(), ResolverOpts::default())
            }
        };
        // Resolution time counts against the probe budget; the resolver must not retry on its own.
        opts.attempts = 1;

        let resolver = TokioResolver::builder_with_config(config, TokioConnectionProvider::default())
            .with_options(opts)
            .build();

        Self { resolver, dns_port: DNS_PORT }
    }

    /// Sends DNS checks to this port on each resolver instead of 53.
    pub fn with_dns_port(mut self, port: u16) -> Self {
        self.dns_port = port;
        self
    }

    async fn resolve(&self, host: &str) -> Result<IpAddr, String> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(ip);
        }
        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => lookup
                .iter()
                .find(IpAddr::is_ipv4)
                .or_else(|| lookup.iter().next())
                .ok_or_else(|| "no address records".to_string()),
            Err(e) => Err(e.to_string()),
        }
    }

    async fn check_tcp(&self, target: &Target, host: &str, port: u16, timeout: Duration) -> Sample {
        let budget_start = Instant::now();
        let ip = match tokio::time::timeout(timeout, self.resolve(host)).await {
            Ok(Ok(ip)) => ip,
            Ok(Err(e)) => {
                debug!(probe = %target, error = %e, "host resolution failed");
                return Sample::failure(target, ErrorKind::DnsFailure);
            }
            Err(_) => {
                debug!(probe = %target, "host resolution timed out");
                return Sample::failure(target, ErrorKind::DnsFailure);
            }
        };

        let remaining = timeout.saturating_sub(budget_start.elapsed());
        let start = Instant::now();
        match tokio::time::timeout(remaining, TcpStream::connect((ip, port))).await {
            Ok(Ok(stream)) => {
                let src = stream.local_addr().ok().map(|a| a.ip());
                Sample::success(target, elapsed_ms(start), src, Some(ip))
            }
            Ok(Err(e)) => {
                let kind = classify_tcp_error(&e);
                debug!(probe = %target, error = %e, class = %kind, "tcp connect failed");
                let sample = Sample::failure(target, kind).with_addrs(source_for(ip), Some(ip));
                if kind == ErrorKind::Refused {
                    sample.with_latency(elapsed_ms(start))
                } else {
                    sample
                }
            }
            Err(_) => Sample::failure(target, ErrorKind::Timeout).with_addrs(source_for(ip), Some(ip)),
        }
    }

    async fn check_dns(
        &self,
        target: &Target,
        name: &str,
        record_type: RecordType,
        resolver: IpAddr,
        timeout: Duration,
    ) -> Sample {
        let server = SocketAddr::new(resolver, self.dns_port);
        let query = match build_query(name, record_type) {
            Ok(q) => q,
            Err(e) => {
                warn!(probe = %target, error = %e, "could not encode dns query");
                return Sample::failure(target, ErrorKind::Other).with_addrs(source_for(resolver), Some(resolver));
            }
        };

        match tokio::time::timeout(timeout, exchange(server, &query)).await {
            Ok(Ok(reply)) => {
                let src = Some(reply.local.ip());
                match classify_rcode(reply.message.response_code()) {
                    None => Sample::success(target, reply.latency_ms, src, Some(resolver)),
                    Some(kind) => {
                        debug!(probe = %target, rcode = %reply.message.response_code(), "dns query answered with error");
                        Sample::failure(target, kind)
                            .with_latency(reply.latency_ms)
                            .with_addrs(src, Some(resolver))
                    }
                }
            }
            Ok(Err(e)) => {
                debug!(probe = %target, error = %e, "dns exchange failed");
                Sample::failure(target, e.kind()).with_addrs(source_for(resolver), Some(resolver))
            }
            Err(_) => Sample::failure(target, ErrorKind::Timeout).with_addrs(source_for(resolver), Some(resolver)),
        }
    }
}

impl Default for NetworkProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl Probe for NetworkProbe {
    async fn probe(&self, target: &Target, timeout: Duration) -> Sample {
        match target {
            Target::Tcp { host, port } => self.check_tcp(target, host, *port, timeout).await,
            Target::Dns { name, record_type, resolver } => {
                self.check_dns(target, name, *record_type, *resolver, timeout).await
            }
        }
    }
}

#[derive(Debug, Error)]
enum ExchangeError {
    #[error("socket error: {0}")]
    Io(#[from] io::Error),
}

impl ExchangeError {
    fn kind(&self) -> ErrorKind {
        match self {
            // ICMP port-unreachable from the resolver host surfaces as a refused recv.
            ExchangeError::Io(e) if e.kind() == io::ErrorKind::ConnectionRefused => ErrorKind::Refused,
            ExchangeError::Io(e) if e.kind() == io::ErrorKind::TimedOut => ErrorKind::Timeout,
            _ => ErrorKind::Other,
        }
    }
}

struct DnsQuery {
    id: u16,
    wire: Vec<u8>,
}

struct DnsReply {
    message: Message,
    latency_ms: f64,
    local: SocketAddr,
}

fn build_query(name: &str, record_type: RecordType) -> Result<DnsQuery, ProtoError> {
    let mut fqdn = Name::from_ascii(name)?;
    fqdn.set_fqdn(true);

    let id: u16 = rand::random();
    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(fqdn, record_type));

    Ok(DnsQuery { id, wire: message.to_vec()? })
}

/// Sends the query once over UDP and waits for the matching reply.
/// Undecodable datagrams and foreign ids are ignored; the caller bounds the wait.
async fn exchange(server: SocketAddr, query: &DnsQuery) -> Result<DnsReply, ExchangeError> {
    let bind: SocketAddr = match server {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(bind).await?;
    socket.connect(server).await?;
    let local = socket.local_addr()?;

    let start = Instant::now();
    socket.send(&query.wire).await?;

    let mut buf = vec![0u8; MAX_UDP_RESPONSE];
    loop {
        let n = socket.recv(&mut buf).await?;
        let latency_ms = elapsed_ms(start);
        let message = match Message::from_vec(&buf[..n]) {
            Ok(message) => message,
            Err(e) => {
                debug!(%server, error = %e, len = n, "ignoring undecodable datagram");
                continue;
            }
        };
        if message.id() != query.id || message.message_type() != MessageType::Response {
            continue;
        }
        return Ok(DnsReply { message, latency_ms, local });
    }
}

fn classify_rcode(rcode: ResponseCode) -> Option<ErrorKind> {
    match rcode {
        ResponseCode::NoError => None,
        ResponseCode::ServFail => Some(ErrorKind::Servfail),
        ResponseCode::NXDomain => Some(ErrorKind::Nxdomain),
        ResponseCode::Refused => Some(ErrorKind::Refused),
        _ => Some(ErrorKind::Other),
    }
}

fn classify_tcp_error(e: &io::Error) -> ErrorKind {
    match e.kind() {
        io::ErrorKind::ConnectionRefused => ErrorKind::Refused,
        io::ErrorKind::TimedOut => ErrorKind::Timeout,
        io::ErrorKind::HostUnreachable | io::ErrorKind::NetworkUnreachable => ErrorKind::Unreachable,
        _ => ErrorKind::Other,
    }
}

/// Local address the OS would use to reach `dst`, so failed attempts group
/// with successful ones on the same route. Connecting a UDP socket sends nothing.
pub fn source_for(dst: IpAddr) -> Option<IpAddr> {
    let bind: SocketAddr = match dst {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = std::net::UdpSocket::bind(bind).ok()?;
    socket.connect((dst, DNS_PORT)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}

fn elapsed_ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn response_codes_map_to_failure_classes() {
        assert_eq!(classify_rcode(ResponseCode::NoError), None);
        assert_eq!(classify_rcode(ResponseCode::ServFail), Some(ErrorKind::Servfail));
        assert_eq!(classify_rcode(ResponseCode::NXDomain), Some(ErrorKind::Nxdomain));
        assert_eq!(classify_rcode(ResponseCode::Refused), Some(ErrorKind::Refused));
        assert_eq!(classify_rcode(ResponseCode::NotImp), Some(ErrorKind::Other));
    }

    #[test]
    fn io_errors_map_to_failure_classes() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        let unreachable = io::Error::from(io::ErrorKind::HostUnreachable);
        let weird = io::Error::other("boom");
        assert_eq!(classify_tcp_error(&refused), ErrorKind::Refused);
        assert_eq!(classify_tcp_error(&unreachable), ErrorKind::Unreachable);
        assert_eq!(classify_tcp_error(&weird), ErrorKind::Other);
    }

    #[test]
    fn query_wire_format_carries_the_question() {
        let query = build_query("_ldap._tcp.corp.local", RecordType::SRV).unwrap();
        let parsed = Message::from_vec(&query.wire).unwrap();
        assert_eq!(parsed.id(), query.id);
        assert!(parsed.recursion_desired());
        assert_eq!(parsed.queries().len(), 1);
        assert_eq!(parsed.queries()[0].query_type(), RecordType::SRV);
    }

    #[tokio::test]
    async fn tcp_probe_succeeds_against_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let probe = NetworkProbe::new();
        let target = Target::Tcp { host: "127.0.0.1".into(), port };
        let sample = probe.probe(&target, Duration::from_secs(2)).await;

        assert!(sample.success);
        assert!(sample.latency_ms.is_some());
        assert_eq!(sample.error, None);
        assert_eq!(sample.dst_ip, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(sample.src_ip, Some("127.0.0.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn tcp_probe_reports_refused_for_closed_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let probe = NetworkProbe::new();
        let target = Target::Tcp { host: "127.0.0.1".into(), port };
        let sample = probe.probe(&target, Duration::from_secs(2)).await;

        assert!(!sample.success);
        assert_eq!(sample.error, Some(ErrorKind::Refused));
        assert_eq!(sample.src_ip, Some("127.0.0.1".parse().unwrap()));
        assert_eq!(sample.dst_ip, Some("127.0.0.1".parse().unwrap()));
    }

    /// Answers every query once, preceded by a junk datagram and a stray reply
    /// with the wrong id. Names under `missing.` get NXDOMAIN.
    async fn fake_resolver() -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 512];
            while let Ok((n, peer)) = socket.recv_from(&mut buf).await {
                let query = Message::from_vec(&buf[..n]).unwrap();
                let name = query.queries()[0].name().to_ascii();
                let rcode = if name.starts_with("missing.") { ResponseCode::NXDomain } else { ResponseCode::NoError };

                socket.send_to(b"\xde\xad", peer).await.unwrap();

                let mut stray = Message::new();
                stray.set_id(query.id().wrapping_add(1)).set_message_type(MessageType::Response);
                socket.send_to(&stray.to_vec().unwrap(), peer).await.unwrap();

                let mut reply = Message::new();
                reply
                    .set_id(query.id())
                    .set_message_type(MessageType::Response)
                    .set_response_code(rcode)
                    .add_queries(query.queries().to_vec());
                socket.send_to(&reply.to_vec().unwrap(), peer).await.unwrap();
            }
        });
        addr
    }

    #[tokio::test]
    async fn dns_exchange_matches_reply_and_classifies_rcode() {
        let server = fake_resolver().await;

        let query = build_query("vda01.corp.local", RecordType::A).unwrap();
        let reply = exchange(server, &query).await.unwrap();
        assert_eq!(reply.message.id(), query.id);
        assert_eq!(classify_rcode(reply.message.response_code()), None);
        assert!(reply.latency_ms >= 0.0);
        assert_eq!(reply.local.ip(), "127.0.0.1".parse::<IpAddr>().unwrap());

        let query = build_query("missing.corp.local", RecordType::A).unwrap();
        let reply = exchange(server, &query).await.unwrap();
        assert_eq!(classify_rcode(reply.message.response_code()), Some(ErrorKind::Nxdomain));
    }

    #[tokio::test]
    async fn dns_exchange_keeps_waiting_when_resolver_is_silent() {
        // Bound but silent: the query is swallowed.
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let port = silent.local_addr().unwrap().port();
        let server = SocketAddr::new("127.0.0.1".parse().unwrap(), port);
        let query = build_query("vda01.corp.local", RecordType::A).unwrap();

        let res = tokio::time::timeout(Duration::from_millis(200), exchange(server, &query)).await;
        assert!(res.is_err());
        drop(silent);
    }

    #[tokio::test]
    async fn dns_check_times_answers_and_error_codes() {
        let server = fake_resolver().await;
        let checker = NetworkProbe::new().with_dns_port(server.port());
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();

        let found = Target::Dns { name: "vda01.corp.local".into(), record_type: RecordType::A, resolver: loopback };
        let sample = checker.probe(&found, Duration::from_secs(2)).await;
        assert!(sample.success);
        assert_eq!(sample.error, None);
        assert!(sample.latency_ms.is_some_and(|ms| ms >= 0.0));
        assert_eq!(sample.src_ip, Some(loopback));
        assert_eq!(sample.dst_ip, Some(loopback));
        assert_eq!(sample.endpoint, "vda01.corp.local");

        let missing = Target::Dns { name: "missing.corp.local".into(), record_type: RecordType::A, resolver: loopback };
        let sample = checker.probe(&missing, Duration::from_secs(2)).await;
        assert!(!sample.success);
        assert_eq!(sample.error, Some(ErrorKind::Nxdomain));
        assert!(sample.latency_ms.is_some());
        assert_eq!(sample.src_ip, Some(loopback));
        assert_eq!(sample.dst_ip, Some(loopback));
    }

    #[tokio::test]
    async fn dns_check_times_out_without_latency() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let checker = NetworkProbe::new().with_dns_port(silent.local_addr().unwrap().port());
        let loopback: IpAddr = "127.0.0.1".parse().unwrap();
        let target = Target::Dns { name: "vda01.corp.local".into(), record_type: RecordType::A, resolver: loopback };

        let start = Instant::now();
        let sample = checker.probe(&target, Duration::from_millis(200)).await;
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!sample.success);
        assert_eq!(sample.error, Some(ErrorKind::Timeout));
        assert_eq!(sample.latency_ms, None);
        assert_eq!(sample.src_ip, Some(loopback));
        assert_eq!(sample.dst_ip, Some(loopback));
        drop(silent);
    }

    #[tokio::test]
    async fn tcp_connect_that_never_answers_has_no_latency() {
        // Non-routable: depending on the host this times out or fails as unreachable.
        let target = Target::Tcp { host: "10.255.255.1".into(), port: 2598 };
        let start = Instant::now();
        let sample = NetworkProbe::new().probe(&target, Duration::from_millis(300)).await;

        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!sample.success);
        assert_eq!(sample.latency_ms, None);
        assert!(matches!(sample.error, Some(ErrorKind::Timeout | ErrorKind::Unreachable | ErrorKind::Other)));
        assert_eq!(sample.dst_ip, Some("10.255.255.1".parse().unwrap()));
    }
}
