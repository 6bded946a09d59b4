use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::Error;

const BUFFER_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => write!(f, "客户端"),
            Side::Target => write!(f, "目标"),
        }
    }
}

/// 一次转发的统计，只用于日志
#[derive(Debug)]
pub struct RelayResult {
    /// 先结束读取的一侧
    pub first_closed: Side,
    pub client_to_target: u64,
    pub target_to_client: u64,
    pub error: Option<Error>,
}

struct Pumped {
    bytes: u64,
    error: Option<io::Error>,
}

/// 单向拷贝直到 EOF 或出错，然后关闭写端让对方看到 EOF
async fn pump<R, W>(reader: &mut R, writer: &mut W) -> Pumped
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; BUFFER_SIZE];
    let mut bytes = 0u64;
    let mut error = None;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                error = Some(e);
                break;
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            error = Some(e);
            break;
        }
        bytes += n as u64;
    }

    // 半关闭
    let _ = writer.shutdown().await;
    Pumped { bytes, error }
}

/// 双向转发客户端和目标之间的数据
///
/// 某个方向结束 (EOF 或出错) 后只关闭对应的写端，另一个方向继续转发直到它也结束。
/// 出错的一侧已经关闭了对端的写方向，对端随后关闭或写入失败，另一个方向不会一直挂起。
pub async fn relay(client: &mut TcpStream, target: &mut TcpStream) -> RelayResult {
    let (mut client_read, mut client_write) = client.split();
    let (mut target_read, mut target_write) = target.split();

    let client_to_target = pump(&mut client_read, &mut target_write);
    let target_to_client = pump(&mut target_read, &mut client_write);
    tokio::pin!(client_to_target);
    tokio::pin!(target_to_client);

    let (first_closed, up, down) = tokio::select! {
        up = &mut client_to_target => (Side::Client, up, target_to_client.await),
        down = &mut target_to_client => (Side::Target, client_to_target.await, down),
    };

    let error = match (up.error, down.error) {
        (Some(source), _) => Some(Error::Relay {
            direction: "客户端 -> 目标",
            source,
        }),
        (None, Some(source)) => Some(Error::Relay {
            direction: "目标 -> 客户端",
            source,
        }),
        (None, None) => None,
    };

    RelayResult {
        first_closed,
        client_to_target: up.bytes,
        target_to_client: down.bytes,
        error,
    }
}
