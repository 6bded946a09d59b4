use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::{Greeting, NO_ACCEPTABLE_METHODS, NO_AUTHENTICATION, SOCKS_VERSION};

/// 方法协商的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    Selected(u8),
    NoAcceptableMethod,
}

/// 只接受 "无需认证"
pub fn select_method(offered: &[u8]) -> Negotiation {
    if offered.contains(&NO_AUTHENTICATION) {
        Negotiation::Selected(NO_AUTHENTICATION)
    } else {
        Negotiation::NoAcceptableMethod
    }
}

/// 读取客户端问候并回复选中的方法
///
/// 报文格式错误时不回复任何内容；没有可接受的方法时回复 `05 FF`，
/// 之后调用方必须关闭连接。
pub async fn negotiate<S>(stream: &mut S) -> Result<u8>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let greeting = Greeting::read_from(stream).await?;
    debug!("客户端提供的认证方法: {:02x?}", greeting.methods);

    match select_method(&greeting.methods) {
        Negotiation::Selected(method) => {
            stream.write_all(&[SOCKS_VERSION, method]).await?;
            Ok(method)
        }
        Negotiation::NoAcceptableMethod => {
            stream.write_all(&[SOCKS_VERSION, NO_ACCEPTABLE_METHODS]).await?;
            stream.flush().await?;
            Err(Error::AuthNegotiationFailed)
        }
    }
}
