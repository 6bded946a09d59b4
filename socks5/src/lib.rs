//! Implementation of a SOCKS Protocol Version 5 proxy server
//!
//! http://www.ietf.org/rfc/rfc1928.txt
//!
//! 只支持 CONNECT 命令和 "无需认证" 方法。

pub mod config;
pub mod dns;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod relay;
pub mod request;
pub mod resolver;
pub mod server;
pub mod session;
pub mod shutdown;

pub use config::{Args, Config, ListenEndpoint, Timeouts};
pub use error::{Error, FailureKind, ProtocolError, Result};
pub use protocol::{Reply, ReplyCode, Request, TargetAddr};
pub use resolver::{AddressResolver, Family, Upstream};
pub use server::{Drain, Listener, Server};
pub use session::{ConnectionHandler, SessionOutcome, State};
pub use shutdown::Shutdown;
