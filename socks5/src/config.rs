use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use clap::Parser;

use crate::dns::{self, DNS_PORT, DnsClient};
use crate::resolver::{AddressResolver, Family, Upstream};

pub const DEFAULT_PORT: u16 = 1080;

#[derive(Parser, Debug)]
#[command(name = "socks5")]
#[command(about = "SOCKS5 proxy server (CONNECT, no authentication)")]
pub struct Args {
    /// IPv4 listen address, e.g. -4=127.0.0.1
    #[arg(short = '4', value_name = "IPV4", conflicts_with = "ipv6")]
    pub ipv4: Option<Ipv4Addr>,

    /// IPv6 listen address, e.g. -6=::1
    #[arg(short = '6', value_name = "IPV6")]
    pub ipv6: Option<Ipv6Addr>,

    /// Listen port (0 selects the default)
    #[arg(value_name = "PORT")]
    pub port: Option<u16>,

    /// DNS server used to resolve domain targets, defaults to the first nameserver in /etc/resolv.conf
    #[arg(long, value_name = "ADDR", value_parser = parse_nameserver)]
    pub dns: Option<SocketAddr>,

    /// Resolve domain targets to IPv6 first
    #[arg(long)]
    pub prefer_ipv6: bool,

    /// Seconds allowed for method negotiation
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub handshake_timeout: u64,

    /// Seconds allowed for reading the request
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub request_timeout: u64,

    /// Seconds allowed for resolving a domain
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    pub dns_timeout: u64,

    /// Seconds allowed for connecting to the target
    #[arg(long, value_name = "SECS", default_value_t = 10)]
    pub connect_timeout: u64,

    /// Seconds to wait for open connections on shutdown
    #[arg(long, value_name = "SECS", default_value_t = 5)]
    pub drain_timeout: u64,
}

/// `1.1.1.1`、`1.1.1.1:5353`、`::1` 或 `[::1]:53`
fn parse_nameserver(value: &str) -> Result<SocketAddr, String> {
    if let Ok(addr) = value.parse::<SocketAddr>() {
        return Ok(addr);
    }
    value
        .parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .map_err(|_| format!("无效的 DNS 服务器地址: {}", value))
}

/// 监听地址，构造之后不再修改
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenEndpoint {
    addr: SocketAddr,
}

impl ListenEndpoint {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        ListenEndpoint {
            addr: SocketAddr::new(ip, port),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }
}

impl Default for ListenEndpoint {
    fn default() -> Self {
        ListenEndpoint::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), DEFAULT_PORT)
    }
}

/// 每个阶段独立的超时
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub handshake: Duration,
    pub request: Duration,
    pub dns: Duration,
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            handshake: Duration::from_secs(10),
            request: Duration::from_secs(10),
            dns: Duration::from_secs(5),
            connect: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub endpoint: ListenEndpoint,
    pub timeouts: Timeouts,
    pub upstream: Upstream,
    pub prefer: Family,
    pub drain_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            endpoint: ListenEndpoint::default(),
            timeouts: Timeouts::default(),
            upstream: Upstream::System,
            prefer: Family::V4,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

impl Config {
    pub fn resolver(&self) -> AddressResolver {
        AddressResolver::new(self.upstream.clone(), self.prefer)
    }
}

impl Args {
    /// 没有指定 `--dns` 时从 `resolv_conf` 中找 nameserver，找不到就用系统解析器
    pub fn into_config(self, resolv_conf: impl AsRef<Path>) -> Config {
        let ip = match (self.ipv4, self.ipv6) {
            (_, Some(ip)) => IpAddr::V6(ip),
            (Some(ip), None) => IpAddr::V4(ip),
            (None, None) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let port = match self.port {
            None | Some(0) => DEFAULT_PORT,
            Some(port) => port,
        };

        let upstream = match self.dns.or_else(|| dns::system_nameserver(resolv_conf)) {
            Some(server) => Upstream::Dns(DnsClient::new(server)),
            None => Upstream::System,
        };

        Config {
            endpoint: ListenEndpoint::new(ip, port),
            timeouts: Timeouts {
                handshake: Duration::from_secs(self.handshake_timeout),
                request: Duration::from_secs(self.request_timeout),
                dns: Duration::from_secs(self.dns_timeout),
                connect: Duration::from_secs(self.connect_timeout),
            },
            upstream,
            prefer: if self.prefer_ipv6 { Family::V6 } else { Family::V4 },
            drain_timeout: Duration::from_secs(self.drain_timeout),
        }
    }
}
