//! 专用的 DNS 解析通道
//!
//! 只实现代理需要的最小子集：向上游服务器发送一个 A 或 AAAA 递归查询，
//! 解析响应中的地址记录。不支持 TCP 回退，带 TC 标志的响应直接视为失败。

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;

use bytes::{BufMut, BytesMut};
use log::debug;
use thiserror::Error;
use tokio::net::UdpSocket;

pub const TYPE_A: u16 = 1;
pub const TYPE_CNAME: u16 = 5;
pub const TYPE_AAAA: u16 = 28;
pub const CLASS_IN: u16 = 1;

pub const DNS_PORT: u16 = 53;
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

const FLAG_QR: u16 = 1 << 15;
const FLAG_TC: u16 = 1 << 9;
const FLAG_RD: u16 = 1 << 8;
const MASK_RCODE: u16 = 0x000F;

pub const RCODE_NXDOMAIN: u16 = 3;

const HEADER_LEN: usize = 12;
const MAX_NAME_LEN: usize = 253;
const MAX_LABEL_LEN: usize = 63;
const MAX_POINTER_HOPS: usize = 32;
const MAX_MESSAGE_SIZE: usize = 4096;

#[derive(Debug, Error)]
pub enum DnsError {
    #[error("dns: 报文被截断")]
    Truncated,

    #[error("dns: 无效的域名")]
    InvalidName,

    #[error("dns: 域名过长")]
    NameTooLong,

    #[error("dns: 标签过长 (最大 63)")]
    LabelTooLong,

    #[error("dns: 压缩指针循环")]
    PointerLoop,

    #[error("dns: 响应 id 不匹配")]
    IdMismatch,

    #[error("dns: 响应的问题区与查询不一致")]
    QuestionMismatch,

    #[error("dns: 收到的不是响应报文")]
    NotResponse,

    #[error("dns: 响应被截断 (TC)")]
    TruncatedResponse,

    #[error("dns: 服务器返回错误码 {0}")]
    Rcode(u16),

    #[error("dns: 没有可用的地址记录")]
    NoRecords,

    #[error("dns: {0}")]
    Io(#[from] io::Error),
}

/// 连接到单个上游服务器的 UDP 解析器
#[derive(Debug, Clone)]
pub struct DnsClient {
    server: SocketAddr,
}

impl DnsClient {
    pub fn new(server: SocketAddr) -> Self {
        DnsClient { server }
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    /// 查询一种记录类型，按响应中的顺序返回地址
    pub async fn lookup(&self, name: &str, qtype: u16) -> Result<Vec<IpAddr>, DnsError> {
        let id: u16 = rand::random();
        let query = encode_query(id, name, qtype)?;

        let socket = open_socket(self.server).await?;
        socket.send(&query).await?;
        debug!("dns 查询 {} (type {}) -> {}", name, qtype, self.server);

        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        loop {
            let n = socket.recv(&mut buf).await?;
            match parse_response(&buf[..n], id, name, qtype) {
                Err(DnsError::IdMismatch) | Err(DnsError::QuestionMismatch) => continue,
                result => return result,
            }
        }
    }
}

async fn open_socket(server: SocketAddr) -> io::Result<UdpSocket> {
    let local: SocketAddr = match server {
        SocketAddr::V4(_) => (Ipv4Addr::UNSPECIFIED, 0).into(),
        SocketAddr::V6(_) => (Ipv6Addr::UNSPECIFIED, 0).into(),
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(server).await?;
    Ok(socket)
}

/// 从 resolv.conf 内容中取第一个可用的 nameserver
pub fn parse_resolv_conf(contents: &str) -> Option<SocketAddr> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#') && !line.starts_with(';'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            match (fields.next(), fields.next()) {
                (Some("nameserver"), Some(addr)) => addr.parse::<IpAddr>().ok(),
                _ => None,
            }
        })
        .map(|ip| SocketAddr::new(ip, DNS_PORT))
        .next()
}

pub fn system_nameserver(path: impl AsRef<Path>) -> Option<SocketAddr> {
    std::fs::read_to_string(path).ok().as_deref().and_then(parse_resolv_conf)
}

pub fn encode_query(id: u16, name: &str, qtype: u16) -> Result<BytesMut, DnsError> {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + MAX_NAME_LEN + 6);
    buf.put_u16(id);
    buf.put_u16(FLAG_RD);
    buf.put_u16(1); // QDCOUNT
    buf.put_u16(0);
    buf.put_u16(0);
    buf.put_u16(0);
    encode_name(&mut buf, name)?;
    buf.put_u16(qtype);
    buf.put_u16(CLASS_IN);
    Ok(buf)
}

pub fn encode_name(buf: &mut BytesMut, name: &str) -> Result<(), DnsError> {
    let name = name.trim_end_matches('.');
    if name.is_empty() {
        return Err(DnsError::InvalidName);
    }
    if name.len() > MAX_NAME_LEN {
        return Err(DnsError::NameTooLong);
    }

    for label in name.split('.') {
        if label.is_empty() {
            return Err(DnsError::InvalidName);
        }
        if label.len() > MAX_LABEL_LEN {
            return Err(DnsError::LabelTooLong);
        }
        buf.put_u8(label.len() as u8);
        buf.put_slice(label.as_bytes());
    }
    buf.put_u8(0);
    Ok(())
}

/// 解码域名，支持压缩指针。返回 (域名, 从 offset 起消费的字节数)
pub fn decode_name(data: &[u8], offset: usize) -> Result<(String, usize), DnsError> {
    let mut labels: Vec<String> = Vec::new();
    let mut pos = offset;
    let mut consumed = None;
    let mut hops = 0;

    loop {
        let len = *data.get(pos).ok_or(DnsError::Truncated)? as usize;

        if len == 0 {
            consumed.get_or_insert(pos + 1 - offset);
            break;
        }

        if len & 0xC0 == 0xC0 {
            let low = *data.get(pos + 1).ok_or(DnsError::Truncated)? as usize;
            consumed.get_or_insert(pos + 2 - offset);
            hops += 1;
            if hops > MAX_POINTER_HOPS {
                return Err(DnsError::PointerLoop);
            }
            pos = ((len & 0x3F) << 8) | low;
            continue;
        }

        if len > MAX_LABEL_LEN {
            return Err(DnsError::LabelTooLong);
        }
        let label = data.get(pos + 1..pos + 1 + len).ok_or(DnsError::Truncated)?;
        labels.push(String::from_utf8_lossy(label).into_owned());
        pos += 1 + len;
    }

    let name = labels.join(".");
    if name.len() > MAX_NAME_LEN {
        return Err(DnsError::NameTooLong);
    }
    Ok((name, consumed.unwrap_or(0)))
}

fn read_u16(data: &[u8], pos: usize) -> Result<u16, DnsError> {
    data.get(pos..pos + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
        .ok_or(DnsError::Truncated)
}

/// 校验响应并提取 `qtype` 类型的地址记录
///
/// 响应必须带回唯一的问题，且名字 (不区分大小写)、类型和类都与查询一致。
pub fn parse_response(data: &[u8], id: u16, name: &str, qtype: u16) -> Result<Vec<IpAddr>, DnsError> {
    if data.len() < HEADER_LEN {
        return Err(DnsError::Truncated);
    }
    if read_u16(data, 0)? != id {
        return Err(DnsError::IdMismatch);
    }

    let flags = read_u16(data, 2)?;
    if flags & FLAG_QR == 0 {
        return Err(DnsError::NotResponse);
    }
    if flags & FLAG_TC != 0 {
        return Err(DnsError::TruncatedResponse);
    }

    let qd_count = read_u16(data, 4)?;
    let an_count = read_u16(data, 6)?;

    if qd_count != 1 {
        return Err(DnsError::QuestionMismatch);
    }
    let (question, consumed) = decode_name(data, HEADER_LEN)?;
    let mut offset = HEADER_LEN + consumed;
    let question_type = read_u16(data, offset)?;
    let question_class = read_u16(data, offset + 2)?;
    offset += 4;
    if !question.eq_ignore_ascii_case(name.trim_end_matches('.'))
        || question_type != qtype
        || question_class != CLASS_IN
    {
        return Err(DnsError::QuestionMismatch);
    }

    let rcode = flags & MASK_RCODE;
    if rcode != 0 {
        return Err(DnsError::Rcode(rcode));
    }

    let mut addrs = Vec::new();
    for _ in 0..an_count {
        let (name, consumed) = decode_name(data, offset)?;
        offset += consumed;

        let rtype = read_u16(data, offset)?;
        let rclass = read_u16(data, offset + 2)?;
        let rd_len = read_u16(data, offset + 8)? as usize;
        offset += 10;

        let rdata = data.get(offset..offset + rd_len).ok_or(DnsError::Truncated)?;
        offset += rd_len;

        if rclass != CLASS_IN || rtype != qtype {
            if rtype == TYPE_CNAME {
                debug!("dns: 跳过 {} 的 CNAME 记录", name);
            }
            continue;
        }

        match (rtype, rd_len) {
            (TYPE_A, 4) => addrs.push(IpAddr::V4(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3]))),
            (TYPE_AAAA, 16) => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(rdata);
                addrs.push(IpAddr::V6(Ipv6Addr::from(octets)));
            }
            _ => {}
        }
    }

    if addrs.is_empty() {
        return Err(DnsError::NoRecords);
    }
    Ok(addrs)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::time::Duration;

    /// 构造一个针对 `query` 的响应，answers 的名字用指向问题区的压缩指针
    pub(crate) fn build_response(query: &[u8], rcode: u16, answers: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut resp = query.to_vec();
        let flags = FLAG_QR | FLAG_RD | (1 << 7) | rcode;
        resp[2..4].copy_from_slice(&flags.to_be_bytes());
        resp[6..8].copy_from_slice(&(answers.len() as u16).to_be_bytes());
        for (rtype, rdata) in answers {
            resp.extend_from_slice(&[0xC0, 0x0C]);
            resp.extend_from_slice(&rtype.to_be_bytes());
            resp.extend_from_slice(&CLASS_IN.to_be_bytes());
            resp.extend_from_slice(&60u32.to_be_bytes());
            resp.extend_from_slice(&(rdata.len() as u16).to_be_bytes());
            resp.extend_from_slice(rdata);
        }
        resp
    }

    /// 只回答一次的 UDP DNS 服务器
    pub(crate) async fn mock_server<F>(answer: F) -> SocketAddr
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + 'static,
    {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 512];
            loop {
                let Ok((n, peer)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                let resp = answer(&buf[..n]);
                let _ = socket.send_to(&resp, peer).await;
            }
        });
        addr
    }

    #[test]
    fn test_encode_name() {
        let mut buf = BytesMut::new();
        encode_name(&mut buf, "example.com.").unwrap();
        assert_eq!(
            &buf[..],
            &[7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0]
        );

        let long_label = "a".repeat(64) + ".com";
        assert!(matches!(encode_name(&mut buf, &long_label), Err(DnsError::LabelTooLong)));
        assert!(matches!(encode_name(&mut buf, "example..com"), Err(DnsError::InvalidName)));
        assert!(matches!(encode_name(&mut buf, ""), Err(DnsError::InvalidName)));
    }

    #[test]
    fn test_decode_name_compression() {
        let mut data = vec![7, b'e', b'x', b'a', b'm', b'p', b'l', b'e', 3, b'c', b'o', b'm', 0];
        data.extend_from_slice(&[3, b'w', b'w', b'w', 0xC0, 0x00]);

        let (name, consumed) = decode_name(&data, 13).unwrap();
        assert_eq!(name, "www.example.com");
        assert_eq!(consumed, 6);
    }

    #[test]
    fn test_decode_name_pointer_loop() {
        let data = [0xC0, 0x00];
        assert!(matches!(decode_name(&data, 0), Err(DnsError::PointerLoop)));
    }

    #[test]
    fn test_parse_response_skips_cname() {
        let query = encode_query(0x1234, "www.example.com", TYPE_A).unwrap();
        let resp = build_response(
            &query,
            0,
            &[
                (TYPE_CNAME, vec![3, b'c', b'd', b'n', 0xC0, 0x0C]),
                (TYPE_A, vec![93, 184, 216, 34]),
                (TYPE_A, vec![93, 184, 216, 35]),
            ],
        );

        let addrs = parse_response(&resp, 0x1234, "www.example.com", TYPE_A).unwrap();
        assert_eq!(
            addrs,
            vec![
                IpAddr::from([93, 184, 216, 34]),
                IpAddr::from([93, 184, 216, 35]),
            ]
        );
    }

    #[test]
    fn test_parse_response_errors() {
        let query = encode_query(7, "nowhere.example", TYPE_A).unwrap();

        let nxdomain = build_response(&query, RCODE_NXDOMAIN, &[]);
        assert!(matches!(parse_response(&nxdomain, 7, "nowhere.example", TYPE_A), Err(DnsError::Rcode(RCODE_NXDOMAIN))));
        assert!(matches!(parse_response(&nxdomain, 8, "nowhere.example", TYPE_A), Err(DnsError::IdMismatch)));
        assert!(matches!(parse_response(&query, 7, "nowhere.example", TYPE_A), Err(DnsError::NotResponse)));

        let empty = build_response(&query, 0, &[]);
        assert!(matches!(parse_response(&empty, 7, "nowhere.example", TYPE_A), Err(DnsError::NoRecords)));

        let truncated = build_response(&query, 0, &[(TYPE_A, vec![1, 2, 3, 4])]);
        let cut = &truncated[..truncated.len() - 2];
        assert!(matches!(parse_response(cut, 7, "nowhere.example", TYPE_A), Err(DnsError::Truncated)));
    }

    #[test]
    fn test_parse_response_rejects_other_question() {
        let query = encode_query(9, "wanted.test", TYPE_A).unwrap();
        let resp = build_response(&query, 0, &[(TYPE_A, vec![10, 0, 0, 1])]);

        let addrs = parse_response(&resp, 9, "WANTED.test.", TYPE_A).unwrap();
        assert_eq!(addrs, vec![IpAddr::from([10, 0, 0, 1])]);

        assert!(matches!(
            parse_response(&resp, 9, "other.test", TYPE_A),
            Err(DnsError::QuestionMismatch)
        ));
        assert!(matches!(
            parse_response(&resp, 9, "wanted.test", TYPE_AAAA),
            Err(DnsError::QuestionMismatch)
        ));

        // 没有问题区的响应
        let mut bare = resp[..HEADER_LEN].to_vec();
        bare[4..6].copy_from_slice(&0u16.to_be_bytes());
        bare[6..8].copy_from_slice(&0u16.to_be_bytes());
        assert!(matches!(
            parse_response(&bare, 9, "wanted.test", TYPE_A),
            Err(DnsError::QuestionMismatch)
        ));
    }

    #[tokio::test]
    async fn test_lookup_ignores_answer_for_other_name() {
        let server = mock_server(|query| {
            let id = u16::from_be_bytes([query[0], query[1]]);
            let forged = encode_query(id, "evil.test", TYPE_A).unwrap();
            build_response(&forged, 0, &[(TYPE_A, vec![6, 6, 6, 6])])
        })
        .await;

        let client = DnsClient::new(server);
        let lookup = client.lookup("good.test", TYPE_A);
        assert!(tokio::time::timeout(Duration::from_millis(200), lookup).await.is_err());
    }

    #[test]
    fn test_parse_resolv_conf() {
        let contents = "# generated\n; comment\nsearch lan\nnameserver fe80::1%eth0\nnameserver 10.0.0.53\nnameserver 1.1.1.1\n";
        assert_eq!(parse_resolv_conf(contents), Some("10.0.0.53:53".parse().unwrap()));
        assert_eq!(parse_resolv_conf("search lan\n"), None);
    }

    #[tokio::test]
    async fn test_lookup_against_mock_server() {
        let server = mock_server(|query| {
            let qtype = u16::from_be_bytes([query[query.len() - 4], query[query.len() - 3]]);
            let ip = if qtype == TYPE_AAAA {
                Ipv6Addr::LOCALHOST.octets().to_vec()
            } else {
                vec![127, 0, 0, 1]
            };
            build_response(query, 0, &[(qtype, ip)])
        })
        .await;

        let client = DnsClient::new(server);
        let v4 = client.lookup("proxy.test", TYPE_A).await.unwrap();
        assert_eq!(v4, vec![IpAddr::V4(Ipv4Addr::LOCALHOST)]);

        let v6 = client.lookup("proxy.test", TYPE_AAAA).await.unwrap();
        assert_eq!(v6, vec![IpAddr::V6(Ipv6Addr::LOCALHOST)]);
    }

    #[tokio::test]
    async fn test_lookup_nxdomain() {
        let server = mock_server(|query| build_response(query, RCODE_NXDOMAIN, &[])).await;
        let client = DnsClient::new(server);
        let err = client.lookup("missing.test", TYPE_A).await.unwrap_err();
        assert!(matches!(err, DnsError::Rcode(RCODE_NXDOMAIN)));
    }
}
