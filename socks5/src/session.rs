//! 单个客户端连接的处理流程
//!
//! Accepted -> Negotiating -> Requesting -> Resolving -> Connecting -> Relaying -> Closed
//!
//! 任何阶段失败都会进入 `Failed(kind)`，然后立即关闭。

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use uuid::Uuid;

use crate::config::Timeouts;
use crate::error::{Error, FailureKind, Result};
use crate::handshake;
use crate::protocol::{Reply, TargetAddr};
use crate::relay::{self, RelayResult};
use crate::request;
use crate::resolver::AddressResolver;
use crate::shutdown::Shutdown;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Accepted,
    Negotiating,
    Requesting,
    Resolving,
    Connecting,
    Relaying,
    Closed,
    Failed(FailureKind),
}

impl State {
    /// 在这些阶段失败时，客户端已经发来了合法的请求版本号，需要回复应答帧
    fn expects_reply(self) -> bool {
        matches!(self, State::Requesting | State::Resolving | State::Connecting)
    }
}

/// 会话结束后的汇总
#[derive(Debug)]
pub struct SessionOutcome {
    pub id: String,
    pub peer: SocketAddr,
    pub trace: Vec<State>,
    pub method: Option<u8>,
    pub target: Option<TargetAddr>,
    pub relay: Option<RelayResult>,
    pub error: Option<Error>,
}

impl SessionOutcome {
    pub fn failure(&self) -> Option<FailureKind> {
        self.trace.iter().find_map(|state| match state {
            State::Failed(kind) => Some(*kind),
            _ => None,
        })
    }

    pub fn reached(&self, state: State) -> bool {
        self.trace.contains(&state)
    }
}

/// 每个连接共享的只读上下文
#[derive(Debug, Clone)]
pub struct ConnectionHandler {
    resolver: Arc<AddressResolver>,
    timeouts: Timeouts,
    shutdown: Shutdown,
}

impl ConnectionHandler {
    pub fn new(resolver: AddressResolver, timeouts: Timeouts, shutdown: Shutdown) -> Self {
        ConnectionHandler {
            resolver: Arc::new(resolver),
            timeouts,
            shutdown,
        }
    }

    pub async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> SessionOutcome {
        ClientSession::new(stream, peer).run(self).await
    }
}

struct ClientSession {
    id: String,
    peer: SocketAddr,
    client: TcpStream,
    method: Option<u8>,
    target: Option<TargetAddr>,
    state: State,
    trace: Vec<State>,
}

impl ClientSession {
    fn new(client: TcpStream, peer: SocketAddr) -> Self {
        let mut id = Uuid::new_v4().simple().to_string();
        id.truncate(8);
        ClientSession {
            id,
            peer,
            client,
            method: None,
            target: None,
            state: State::Accepted,
            trace: vec![State::Accepted],
        }
    }

    fn enter(&mut self, next: State) {
        debug!("[{}] {:?} -> {:?}", self.id, self.state, next);
        self.state = next;
        self.trace.push(next);
    }

    async fn run(mut self, handler: &ConnectionHandler) -> SessionOutcome {
        let (relay, error) = match self.drive(handler).await {
            Ok(result) => {
                self.report(&result);
                (Some(result), None)
            }
            Err(err) => {
                self.fail(&err, handler).await;
                (None, Some(err))
            }
        };

        let _ = self.client.shutdown().await;
        self.enter(State::Closed);

        SessionOutcome {
            id: self.id,
            peer: self.peer,
            trace: self.trace,
            method: self.method,
            target: self.target,
            relay,
            error,
        }
    }

    async fn drive(&mut self, handler: &ConnectionHandler) -> Result<RelayResult> {
        let timeouts = handler.timeouts;
        let shutdown = &handler.shutdown;

        self.enter(State::Negotiating);
        let method = bounded(
            shutdown,
            timeouts.handshake,
            State::Negotiating,
            handshake::negotiate(&mut self.client),
        )
        .await?;
        debug!("[{}] 选择认证方法 {:#04x}", self.id, method);
        self.method = Some(method);

        self.enter(State::Requesting);
        let target = bounded(
            shutdown,
            timeouts.request,
            State::Requesting,
            request::read_connect(&mut self.client),
        )
        .await?;
        info!("[{}] {} 请求连接 {}", self.id, self.peer, target);
        self.target = Some(target.clone());

        self.enter(State::Resolving);
        let addr = bounded(
            shutdown,
            timeouts.dns,
            State::Resolving,
            handler.resolver.resolve(&target),
        )
        .await?;

        self.enter(State::Connecting);
        let mut remote = bounded(shutdown, timeouts.connect, State::Connecting, connect(addr)).await?;
        let bound = remote.local_addr()?;
        request::write_reply(&mut self.client, &Reply::success(bound)).await?;
        info!("[{}] 成功连接到目标服务器: {} (本地地址 {})", self.id, addr, bound);

        // 进入转发后不再响应关闭信号，让已建立的连接自然结束
        self.enter(State::Relaying);
        Ok(relay::relay(&mut self.client, &mut remote).await)
    }

    async fn fail(&mut self, err: &Error, handler: &ConnectionHandler) {
        let failed_at = self.state;
        match err {
            Error::Cancelled => info!("[{}] {} 服务器关闭, 放弃 {:?} 阶段", self.id, self.peer, failed_at),
            _ => warn!("[{}] {} 在 {:?} 阶段失败: {}", self.id, self.peer, failed_at, err),
        }

        if failed_at.expects_reply() {
            if let Some(code) = err.reply_code() {
                let reply = Reply::failure(code);
                let sent = tokio::time::timeout(
                    handler.timeouts.request,
                    request::write_reply(&mut self.client, &reply),
                )
                .await;
                if !matches!(sent, Ok(Ok(()))) {
                    debug!("[{}] 无法发送失败应答 {:?}", self.id, code);
                }
            }
        }

        self.enter(State::Failed(err.kind()));
    }

    fn report(&self, result: &RelayResult) {
        let target = self.target.as_ref().map(ToString::to_string).unwrap_or_default();
        info!(
            "[{}] {} <-> {} 转发结束: 上行 {} 字节, 下行 {} 字节, {}先关闭",
            self.id, self.peer, target, result.client_to_target, result.target_to_client, result.first_closed
        );
        if let Some(err) = &result.error {
            warn!("[{}] {}", self.id, err);
        }
    }
}

async fn connect(addr: SocketAddr) -> Result<TcpStream> {
    TcpStream::connect(addr)
        .await
        .map_err(|source| Error::Connect { addr, source })
}

/// 给一个阶段加上超时，并在服务器关闭时提前结束
async fn bounded<T, F>(shutdown: &Shutdown, limit: Duration, stage: State, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        _ = shutdown.cancelled() => Err(Error::Cancelled),
        result = tokio::time::timeout(limit, fut) => result.map_err(|_| Error::Timeout(stage))?,
    }
}
