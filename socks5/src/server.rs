use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use log::{debug, error, info};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::task::TaskTracker;

use crate::config::{Config, ListenEndpoint};
use crate::error::{Error, Result};
use crate::session::ConnectionHandler;
use crate::shutdown::Shutdown;

/// 接收失败后的退避，避免文件描述符耗尽时空转
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// 监听套接字，只归接收循环所有
pub struct Listener {
    inner: TcpListener,
    shutdown: Shutdown,
}

impl Listener {
    pub async fn bind(endpoint: ListenEndpoint, shutdown: Shutdown) -> Result<Self> {
        let addr = endpoint.addr();
        let inner = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { addr, source })?;
        Ok(Listener { inner, shutdown })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// 等待新连接；关闭开始之后返回 `Error::Closed`
    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr)> {
        if self.shutdown.is_triggered() {
            return Err(Error::Closed);
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => Err(Error::Closed),
            result = self.inner.accept() => Ok(result?),
        }
    }
}

pub struct Server {
    listener: Listener,
    handler: ConnectionHandler,
    tracker: TaskTracker,
}

impl Server {
    pub async fn bind(config: &Config, shutdown: Shutdown) -> Result<Self> {
        let listener = Listener::bind(config.endpoint, shutdown.clone()).await?;
        let handler = ConnectionHandler::new(config.resolver(), config.timeouts, shutdown);
        Ok(Server {
            listener,
            handler,
            tracker: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// 接收连接直到关闭，每个连接一个独立的任务
    ///
    /// 返回时监听套接字已经释放，返回的 `Drain` 用来等待仍在进行的会话。
    pub async fn run(self) -> Drain {
        let Server {
            listener,
            handler,
            tracker,
        } = self;

        if let Ok(addr) = listener.local_addr() {
            info!("SOCKS5 代理服务器启动在 {}", addr);
        }

        loop {
            match listener.accept().await {
                Ok((socket, addr)) => {
                    debug!("新连接来自: {}", addr);
                    let handler = handler.clone();
                    tracker.spawn(async move {
                        handler.handle(socket, addr).await;
                    });
                }
                Err(Error::Closed) => break,
                Err(e) => {
                    error!("接受连接时出错: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            }
        }

        drop(listener);
        tracker.close();
        info!("停止接受新连接, 还有 {} 个连接在处理", tracker.len());
        Drain { tracker }
    }
}

/// 关闭时等待进行中的会话
pub struct Drain {
    tracker: TaskTracker,
}

impl Drain {
    pub fn active(&self) -> usize {
        self.tracker.len()
    }

    /// 所有会话在 `limit` 内结束时返回 true
    pub async fn wait(self, limit: Duration) -> bool {
        tokio::time::timeout(limit, self.tracker.wait()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn loopback_config() -> Config {
        Config {
            endpoint: ListenEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0),
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_bind_error_when_address_in_use() {
        let shutdown = Shutdown::new();
        let first = Listener::bind(ListenEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), shutdown.clone())
            .await
            .unwrap();
        let taken = first.local_addr().unwrap();

        let err = Listener::bind(ListenEndpoint::new(taken.ip(), taken.port()), shutdown)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Bind { addr, .. } if addr == taken));
    }

    #[tokio::test]
    async fn test_accept_fails_with_closed_after_shutdown() {
        let shutdown = Shutdown::new();
        let listener = Listener::bind(ListenEndpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 0), shutdown.clone())
            .await
            .unwrap();

        let pending = tokio::spawn(async move { listener.accept().await.map(|_| ()) });
        tokio::task::yield_now().await;
        shutdown.trigger();

        let result = pending.await.unwrap();
        assert!(matches!(result, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_slow_client_does_not_block_accept() {
        let shutdown = Shutdown::new();
        let server = Server::bind(&loopback_config(), shutdown.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let running = tokio::spawn(server.run());

        // 第一个客户端连上之后什么都不发
        let _idle = TcpStream::connect(addr).await.unwrap();

        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut reply = [0u8; 2];
        tokio::time::timeout(Duration::from_secs(2), second.read_exact(&mut reply))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, [0x05, 0x00]);

        shutdown.trigger();
        let drain = running.await.unwrap();
        assert!(drain.wait(Duration::from_secs(2)).await);
    }

    #[tokio::test]
    async fn test_shutdown_twice_releases_listener_once() {
        let shutdown = Shutdown::new();
        let server = Server::bind(&loopback_config(), shutdown.clone()).await.unwrap();
        let addr = server.local_addr().unwrap();
        let running = tokio::spawn(server.run());

        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());

        let drain = running.await.unwrap();
        assert_eq!(drain.active(), 0);
        assert!(drain.wait(Duration::from_millis(100)).await);

        // 监听套接字已经释放，可以再次绑定同一个端口
        let rebound = TcpListener::bind(addr).await;
        assert!(rebound.is_ok());
    }
}
