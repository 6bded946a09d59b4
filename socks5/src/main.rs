use anyhow::Result;
use clap::Parser;
use log::{info, warn};

use socks5::dns::RESOLV_CONF;
use socks5::shutdown::{self, Shutdown};
use socks5::{Args, Server, Upstream};

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let config = args.into_config(RESOLV_CONF);

    match &config.upstream {
        Upstream::Dns(client) => info!("域名解析使用 DNS 服务器 {}", client.server()),
        Upstream::System => info!("域名解析使用系统解析器"),
    }

    let shutdown = Shutdown::new();
    let server = Server::bind(&config, shutdown.clone()).await?;
    shutdown::listen_for_signals(shutdown);

    let drain = server.run().await;
    let active = drain.active();
    if active > 0 {
        info!("等待 {} 个连接结束...", active);
    }
    if !drain.wait(config.drain_timeout).await {
        warn!("仍有连接未结束, 强制关闭");
    }

    info!("服务器已关闭");
    Ok(())
}
