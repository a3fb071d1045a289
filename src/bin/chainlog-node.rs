//! chainlog node process: loads a config, serves peer RPCs over TCP and runs
//! until interrupted.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use chainlog::network::{RpcServer, TcpChannel};
use chainlog::{Node, NodeConfig, NoopStateMachine, PeerConfig, StoreKind};

/// chainlog 节点配置
#[derive(Parser, Debug)]
#[command(name = "chainlog-node")]
#[command(about = "Replicated append-only log node")]
struct Args {
    /// JSON config file; flags below override its fields
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// 节点 ID
    #[arg(long)]
    id: Option<String>,

    /// Log group name
    #[arg(long)]
    group: Option<String>,

    /// Address the peer RPC server binds to
    #[arg(short, long)]
    listen: Option<String>,

    /// Another member, as `id=host:port`; repeat for each peer
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<PeerConfig>,

    /// Leader to assume at start-up
    #[arg(long)]
    leader: Option<String>,

    /// 数据存储目录
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Keep the log in anonymous memory only
    #[arg(long)]
    memory: bool,

    /// 日志级别, used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn parse_peer(raw: &str) -> Result<PeerConfig, String> {
    let (id, addr) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected id=host:port, got {:?}", raw))?;
    if id.is_empty() || addr.is_empty() {
        return Err(format!("expected id=host:port, got {:?}", raw));
    }
    Ok(PeerConfig {
        id: id.to_string(),
        addr: addr.to_string(),
        api_port: 0,
    })
}

impl Args {
    fn into_config(self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::from_json_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => NodeConfig::default(),
        };
        if let Some(id) = self.id {
            config.self_id = id;
        }
        if let Some(group) = self.group {
            config.group = group;
        }
        if let Some(listen) = self.listen {
            config.self_addr = listen;
        }
        if !self.peers.is_empty() {
            config.peers = self.peers;
        }
        if let Some(leader) = self.leader {
            config.leader_id = Some(leader);
        }
        if let Some(dir) = self.data_dir {
            config.base_file_path = dir;
        }
        if self.memory {
            config.store_kind = StoreKind::Memory;
        }
        if config.self_id.is_empty() {
            bail!("a node id is required (--id or self_id in the config file)");
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 初始化日志
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = args.into_config()?;
    info!(
        "Starting node {} in group {} ({} peers)",
        config.self_id,
        config.group,
        config.peers.len()
    );
    info!("Data directory: {:?} ({:?})", config.base_file_path, config.store_kind);

    let channel = Arc::new(TcpChannel::from_config(&config));
    let listen = config.self_addr.clone();
    let node = Node::new(config, Arc::new(NoopStateMachine), channel)?;
    let server = RpcServer::bind(&listen, node.clone()).await?;
    node.start();
    info!("Node {} serving on {}", node.self_id(), server.local_addr());

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");
    server.shutdown().await;
    node.shutdown().await?;
    Ok(())
}
