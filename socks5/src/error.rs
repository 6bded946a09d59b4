use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::dns::DnsError;
use crate::protocol::ReplyCode;
use crate::session::State;

pub type Result<T> = std::result::Result<T, Error>;

/// 握手和请求阶段的报文错误
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("不支持的SOCKS版本: {0}")]
    Version(u8),

    #[error("客户端没有提供任何认证方法")]
    NoMethods,

    #[error("认证方法过多: {0} (最多 255)")]
    TooManyMethods(usize),

    #[error("不支持的命令: {0:#04x}")]
    Command(u8),

    #[error("不支持的地址类型: {0:#04x}")]
    AddressType(u8),

    #[error("域名长度为 0")]
    EmptyDomain,

    #[error("无效的域名")]
    InvalidDomain,

    #[error("未知的应答码: {0:#04x}")]
    ReplyCode(u8),

    #[error("读取报文失败: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("无法监听 {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("监听已关闭")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("客户端不支持无认证方法")]
    AuthNegotiationFailed,

    #[error("无法解析域名 {domain}: {source}")]
    Resolution {
        domain: String,
        #[source]
        source: DnsError,
    },

    #[error("连接目标服务器失败: {addr} - {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("转发数据出错 ({direction}): {source}")]
    Relay {
        direction: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{0:?} 阶段超时")]
    Timeout(State),

    #[error("服务器正在关闭")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// 会话失败的分类，记录在 `State::Failed` 中
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Protocol,
    AuthNegotiation,
    Resolution,
    Connect,
    Timeout,
    Cancelled,
    Io,
}

impl Error {
    pub fn kind(&self) -> FailureKind {
        match self {
            Error::Protocol(_) => FailureKind::Protocol,
            Error::AuthNegotiationFailed => FailureKind::AuthNegotiation,
            Error::Resolution { .. } => FailureKind::Resolution,
            Error::Connect { .. } => FailureKind::Connect,
            Error::Timeout(_) => FailureKind::Timeout,
            Error::Cancelled | Error::Closed => FailureKind::Cancelled,
            Error::Bind { .. } | Error::Relay { .. } | Error::Io(_) => FailureKind::Io,
        }
    }

    /// 失败时应当回给客户端的应答码，`None` 表示协议没有对应的应答
    pub fn reply_code(&self) -> Option<ReplyCode> {
        match self {
            Error::Protocol(ProtocolError::Version(_)) | Error::Protocol(ProtocolError::NoMethods) => None,
            Error::Protocol(ProtocolError::Command(_)) => Some(ReplyCode::CommandNotSupported),
            Error::Protocol(ProtocolError::AddressType(_)) => Some(ReplyCode::AddressTypeNotSupported),
            Error::Protocol(_) => Some(ReplyCode::GeneralFailure),
            Error::AuthNegotiationFailed => None,
            Error::Resolution { .. } => Some(ReplyCode::HostUnreachable),
            Error::Connect { source, .. } => Some(ReplyCode::from_connect_error(source)),
            Error::Timeout(State::Resolving) | Error::Timeout(State::Connecting) => {
                Some(ReplyCode::HostUnreachable)
            }
            Error::Timeout(_) => Some(ReplyCode::GeneralFailure),
            Error::Cancelled => Some(ReplyCode::GeneralFailure),
            // 已经收到合法请求之后的本地错误，例如取不到出站套接字的地址
            Error::Io(_) => Some(ReplyCode::GeneralFailure),
            Error::Bind { .. } | Error::Closed | Error::Relay { .. } => None,
        }
    }
}
