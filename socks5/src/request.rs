use log::debug;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::error::{ProtocolError, Result};
use crate::protocol::{Command, Reply, Request, TargetAddr};

/// 读取 CONNECT 请求
///
/// BIND 和 UDP ASSOCIATE 能识别，但一律以 "不支持的命令" 拒绝。
pub async fn read_connect<R>(reader: &mut R) -> Result<TargetAddr>
where
    R: AsyncRead + Unpin,
{
    let request = Request::read_from(reader).await?;
    match request.command {
        Command::Connect => Ok(request.target),
        other => {
            debug!("拒绝 {:?} 请求, 目标 {}", other, request.target);
            Err(ProtocolError::Command(other.as_u8()).into())
        }
    }
}

pub async fn write_reply<W>(writer: &mut W, reply: &Reply) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let buf = reply.encode()?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}
