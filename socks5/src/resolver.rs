//! 把请求中的目标地址变成可以直接连接的 SocketAddr
//!
//! 域名只会得到一个结果：优先地址族的第一条记录，没有才退到另一个地址族。
//! 不会在多个结果之间做连接重试。

use std::net::{IpAddr, SocketAddr};

use log::debug;

use crate::dns::{DnsClient, DnsError, TYPE_A, TYPE_AAAA};
use crate::error::{Error, Result};
use crate::protocol::TargetAddr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Family {
    #[default]
    V4,
    V6,
}

impl Family {
    fn other(self) -> Self {
        match self {
            Family::V4 => Family::V6,
            Family::V6 => Family::V4,
        }
    }

    fn matches(self, ip: &IpAddr) -> bool {
        match self {
            Family::V4 => ip.is_ipv4(),
            Family::V6 => ip.is_ipv6(),
        }
    }

    fn qtype(self) -> u16 {
        match self {
            Family::V4 => TYPE_A,
            Family::V6 => TYPE_AAAA,
        }
    }
}

/// 域名查询的途径
#[derive(Debug, Clone)]
pub enum Upstream {
    /// 操作系统的解析器 (getaddrinfo)
    System,
    /// 直接向 DNS 服务器发 UDP 查询
    Dns(DnsClient),
}

#[derive(Debug, Clone)]
pub struct AddressResolver {
    upstream: Upstream,
    prefer: Family,
}

impl AddressResolver {
    pub fn new(upstream: Upstream, prefer: Family) -> Self {
        AddressResolver { upstream, prefer }
    }

    pub async fn resolve(&self, target: &TargetAddr) -> Result<SocketAddr> {
        match target {
            TargetAddr::V4(addr) => Ok(SocketAddr::V4(*addr)),
            TargetAddr::V6(addr) => Ok(SocketAddr::V6(*addr)),
            TargetAddr::Domain(domain, port) => {
                // IP 字面量不需要查询
                if let Ok(ip) = domain.parse::<IpAddr>() {
                    return Ok(SocketAddr::new(ip, *port));
                }

                let ip = self
                    .lookup(domain, *port)
                    .await
                    .map_err(|source| Error::Resolution {
                        domain: domain.clone(),
                        source,
                    })?;
                debug!("域名 {} 解析为 {}", domain, ip);
                Ok(SocketAddr::new(ip, *port))
            }
        }
    }

    async fn lookup(&self, domain: &str, port: u16) -> std::result::Result<IpAddr, DnsError> {
        match &self.upstream {
            Upstream::System => {
                let addrs: Vec<IpAddr> = tokio::net::lookup_host((domain, port))
                    .await?
                    .map(|addr| addr.ip())
                    .collect();
                pick(&addrs, self.prefer).ok_or(DnsError::NoRecords)
            }
            Upstream::Dns(client) => {
                match client.lookup(domain, self.prefer.qtype()).await {
                    Ok(addrs) => return pick(&addrs, self.prefer).ok_or(DnsError::NoRecords),
                    Err(DnsError::NoRecords) => {}
                    Err(e) => return Err(e),
                }
                let fallback = self.prefer.other();
                let addrs = client.lookup(domain, fallback.qtype()).await?;
                pick(&addrs, fallback).ok_or(DnsError::NoRecords)
            }
        }
    }
}

/// 优先地址族的第一个地址，没有则取任意地址族的第一个
fn pick(addrs: &[IpAddr], prefer: Family) -> Option<IpAddr> {
    addrs
        .iter()
        .find(|ip| prefer.matches(ip))
        .or_else(|| addrs.first())
        .copied()
}
