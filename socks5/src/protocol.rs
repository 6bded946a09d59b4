//! SOCKS5 线路格式 (RFC 1928)
//!
//! 只包含编解码，不涉及任何会话状态。

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::ProtocolError;

pub const SOCKS_VERSION: u8 = 0x05;
pub const NO_AUTHENTICATION: u8 = 0x00;
pub const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

pub const CONNECT_COMMAND: u8 = 0x01;
pub const BIND_COMMAND: u8 = 0x02;
pub const UDP_ASSOCIATE_COMMAND: u8 = 0x03;

pub const IPV4_ADDRESS: u8 = 0x01;
pub const DOMAIN_NAME: u8 = 0x03;
pub const IPV6_ADDRESS: u8 = 0x04;

/// RFC 1035 2.3.4，不含结尾的 0
pub const MAX_DOMAIN_LEN: usize = 255;

/// 应答中的 REP 字段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    NotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl ReplyCode {
    pub const ALL: [ReplyCode; 9] = [
        ReplyCode::Succeeded,
        ReplyCode::GeneralFailure,
        ReplyCode::NotAllowed,
        ReplyCode::NetworkUnreachable,
        ReplyCode::HostUnreachable,
        ReplyCode::ConnectionRefused,
        ReplyCode::TtlExpired,
        ReplyCode::CommandNotSupported,
        ReplyCode::AddressTypeNotSupported,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.into_iter().find(|code| *code as u8 == value)
    }

    /// 把连接目标时的 IO 错误映射为应答码
    pub fn from_connect_error(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ReplyCode::ConnectionRefused,
            io::ErrorKind::NetworkUnreachable => ReplyCode::NetworkUnreachable,
            io::ErrorKind::HostUnreachable | io::ErrorKind::TimedOut => ReplyCode::HostUnreachable,
            io::ErrorKind::PermissionDenied => ReplyCode::NotAllowed,
            _ => ReplyCode::GeneralFailure,
        }
    }
}

impl From<ReplyCode> for u8 {
    fn from(code: ReplyCode) -> u8 {
        code as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Bind,
    UdpAssociate,
}

impl Command {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            CONNECT_COMMAND => Some(Command::Connect),
            BIND_COMMAND => Some(Command::Bind),
            UDP_ASSOCIATE_COMMAND => Some(Command::UdpAssociate),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Command::Connect => CONNECT_COMMAND,
            Command::Bind => BIND_COMMAND,
            Command::UdpAssociate => UDP_ASSOCIATE_COMMAND,
        }
    }
}

/// 请求或应答中携带的地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
    Domain(String, u16),
}

impl TargetAddr {
    pub fn port(&self) -> u16 {
        match self {
            TargetAddr::V4(addr) => addr.port(),
            TargetAddr::V6(addr) => addr.port(),
            TargetAddr::Domain(_, port) => *port,
        }
    }

    pub fn atyp(&self) -> u8 {
        match self {
            TargetAddr::V4(_) => IPV4_ADDRESS,
            TargetAddr::V6(_) => IPV6_ADDRESS,
            TargetAddr::Domain(..) => DOMAIN_NAME,
        }
    }

    /// 未指定地址 0.0.0.0:0，失败应答使用
    pub fn unspecified() -> Self {
        TargetAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
    }

    /// 读取 ATYP 之后的地址和端口
    ///
    /// 只消费该地址类型声明的字节数，流中后续的数据保持不动。
    pub async fn read_from<R>(reader: &mut R, atyp: u8) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        match atyp {
            IPV4_ADDRESS => {
                let mut buf = [0u8; 6];
                reader.read_exact(&mut buf).await?;
                let ip = Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
                let port = u16::from_be_bytes([buf[4], buf[5]]);
                Ok(TargetAddr::V4(SocketAddrV4::new(ip, port)))
            }
            DOMAIN_NAME => {
                let len = reader.read_u8().await? as usize;
                if len == 0 {
                    return Err(ProtocolError::EmptyDomain);
                }
                let mut buf = vec![0u8; len + 2];
                reader.read_exact(&mut buf).await?;
                let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
                buf.truncate(len);
                let domain = String::from_utf8(buf).map_err(|_| ProtocolError::InvalidDomain)?;
                Ok(TargetAddr::Domain(domain, port))
            }
            IPV6_ADDRESS => {
                let mut buf = [0u8; 18];
                reader.read_exact(&mut buf).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[..16]);
                let port = u16::from_be_bytes([buf[16], buf[17]]);
                Ok(TargetAddr::V6(SocketAddrV6::new(Ipv6Addr::from(octets), port, 0, 0)))
            }
            other => Err(ProtocolError::AddressType(other)),
        }
    }

    /// 写入 ATYP + 地址 + 端口
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.put_u8(self.atyp());
        match self {
            TargetAddr::V4(addr) => buf.put_slice(&addr.ip().octets()),
            TargetAddr::V6(addr) => buf.put_slice(&addr.ip().octets()),
            TargetAddr::Domain(domain, _) => {
                if domain.is_empty() {
                    return Err(ProtocolError::EmptyDomain);
                }
                if domain.len() > MAX_DOMAIN_LEN {
                    return Err(ProtocolError::InvalidDomain);
                }
                buf.put_u8(domain.len() as u8);
                buf.put_slice(domain.as_bytes());
            }
        }
        buf.put_u16(self.port());
        Ok(())
    }
}

impl From<SocketAddr> for TargetAddr {
    fn from(addr: SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(addr) => TargetAddr::V4(addr),
            SocketAddr::V6(addr) => match addr.ip().to_ipv4_mapped() {
                Some(ip) => TargetAddr::V4(SocketAddrV4::new(ip, addr.port())),
                None => TargetAddr::V6(addr),
            },
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TargetAddr::V4(addr) => write!(f, "{}", addr),
            TargetAddr::V6(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(domain, port) => write!(f, "{}:{}", domain, port),
        }
    }
}

/// 方法协商请求: VER NMETHODS METHODS...
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    pub methods: Vec<u8>,
}

impl Greeting {
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 2];
        reader.read_exact(&mut buf).await?;

        let version = buf[0];
        let nmethods = buf[1];

        if version != SOCKS_VERSION {
            return Err(ProtocolError::Version(version));
        }
        if nmethods == 0 {
            return Err(ProtocolError::NoMethods);
        }

        let mut methods = vec![0u8; nmethods as usize];
        reader.read_exact(&mut methods).await?;

        Ok(Greeting { methods })
    }

    /// NMETHODS 只有一个字节，方法列表必须是 1..=255 个
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let nmethods = match u8::try_from(self.methods.len()) {
            Ok(0) => return Err(ProtocolError::NoMethods),
            Ok(n) => n,
            Err(_) => return Err(ProtocolError::TooManyMethods(self.methods.len())),
        };
        let mut buf = BytesMut::with_capacity(2 + self.methods.len());
        buf.put_u8(SOCKS_VERSION);
        buf.put_u8(nmethods);
        buf.put_slice(&self.methods);
        Ok(buf)
    }
}

/// 请求: VER CMD RSV ATYP DST.ADDR DST.PORT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub command: Command,
    pub target: TargetAddr,
}

impl Request {
    pub fn connect(target: TargetAddr) -> Self {
        Request {
            command: Command::Connect,
            target,
        }
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await?;

        let version = buf[0];
        let command = buf[1];
        let _reserved = buf[2];
        let address_type = buf[3];

        if version != SOCKS_VERSION {
            return Err(ProtocolError::Version(version));
        }

        let command = Command::from_u8(command).ok_or(ProtocolError::Command(command))?;
        let target = TargetAddr::read_from(reader, address_type).await?;

        Ok(Request { command, target })
    }

    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(6 + 1 + MAX_DOMAIN_LEN);
        buf.put_u8(SOCKS_VERSION);
        buf.put_u8(self.command.as_u8());
        buf.put_u8(0x00);
        self.target.encode(&mut buf)?;
        Ok(buf)
    }
}

/// 应答: VER REP RSV ATYP BND.ADDR BND.PORT
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: ReplyCode,
    pub bound: TargetAddr,
}

impl Reply {
    pub fn success(bound: SocketAddr) -> Self {
        Reply {
            code: ReplyCode::Succeeded,
            bound: TargetAddr::from(bound),
        }
    }

    pub fn failure(code: ReplyCode) -> Self {
        Reply {
            code,
            bound: TargetAddr::unspecified(),
        }
    }

    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::with_capacity(22);
        buf.put_u8(SOCKS_VERSION);
        buf.put_u8(self.code.into());
        buf.put_u8(0x00);
        self.bound.encode(&mut buf)?;
        Ok(buf)
    }

    /// 客户端一侧读取应答
    pub async fn read_from<R>(reader: &mut R) -> Result<Self, ProtocolError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = [0u8; 4];
        reader.read_exact(&mut buf).await?;

        if buf[0] != SOCKS_VERSION {
            return Err(ProtocolError::Version(buf[0]));
        }
        let code = ReplyCode::from_u8(buf[1]).ok_or(ProtocolError::ReplyCode(buf[1]))?;
        let bound = TargetAddr::read_from(reader, buf[3]).await?;

        Ok(Reply { code, bound })
    }

    pub fn bound_ip(&self) -> Option<IpAddr> {
        match &self.bound {
            TargetAddr::V4(addr) => Some(IpAddr::V4(*addr.ip())),
            TargetAddr::V6(addr) => Some(IpAddr::V6(*addr.ip())),
            TargetAddr::Domain(..) => None,
        }
    }
}
