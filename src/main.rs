use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::Semaphore;
use tracing::info;

use shardstore::config::ClusterConfig;
use shardstore::coordinator::repair::ReplicationWorker;
use shardstore::coordinator::service::Coordinator;
use shardstore::membership::service::{ClusterView, FailureDetector};
use shardstore::membership::types::NodeId;
use shardstore::metalog::client::MetaClient;
use shardstore::metalog::raft::RaftNode;
use shardstore::metrics::Metrics;
use shardstore::node::load::{detect_disk_capacity, LoadSampler};
use shardstore::node::service::NodeService;
use shardstore::node::store::ShardStore;
use shardstore::rpc::RpcClient;
use shardstore::cache::writeback::WritebackQueue;
use shardstore::cache::HybridCache;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut config_path: Option<String> = None;
    let mut role: Option<String> = None;
    let mut listen: Option<String> = None;

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                config_path = args.get(i + 1).cloned();
                i += 2;
            }
            "--role" => {
                role = args.get(i + 1).cloned();
                i += 2;
            }
            "--listen" => {
                listen = args.get(i + 1).cloned();
                i += 2;
            }
            _ => {
                i += 1;
            }
        }
    }

    let (Some(config_path), Some(role)) = (config_path, role) else {
        eprintln!("Usage: {} --config <cluster.json> --role <node|coordinator> [--listen <host:port>]", args[0]);
        eprintln!("Example: {} --config cluster.json --role coordinator", args[0]);
        eprintln!(
            "Example: {} --config cluster.json --role node --listen 127.0.0.1:9001",
            args[0]
        );
        std::process::exit(1);
    };

    let config = ClusterConfig::load(Path::new(&config_path))?;

    match role.as_str() {
        "node" => {
            let listen = listen
                .ok_or_else(|| anyhow::anyhow!("--listen is required for the node role"))?;
            run_node(config, listen).await
        }
        "coordinator" => run_coordinator(config).await,
        other => anyhow::bail!("unknown role {other:?}, expected node or coordinator"),
    }
}

async fn run_node(config: ClusterConfig, listen: String) -> anyhow::Result<()> {
    let node_config = config
        .find_node(&listen)
        .ok_or_else(|| anyhow::anyhow!("{listen} is not in the configured node roster"))?
        .clone();

    let metrics = Arc::new(Metrics::new());
    let rpc = Arc::new(RpcClient::new(metrics.clone()));

    let node_dir = config.data_dir.join(listen.replace(':', "_"));
    std::fs::create_dir_all(&node_dir)?;
    let disk_capacity = detect_disk_capacity(&node_dir);

    let store = Arc::new(ShardStore::open(
        node_dir.join("shards"),
        disk_capacity,
        config.disk_high_water,
    )?);
    let cache = Arc::new(HybridCache::new(config.lru_capacity));
    let (writeback, _writeback_worker) = WritebackQueue::start(
        node_dir.join("cache"),
        config.writeback_high_water,
        metrics.clone(),
    )?;

    let service = NodeService::new(
        NodeId(listen.clone()),
        store,
        cache,
        Arc::new(writeback),
        LoadSampler::new(),
        rpc.clone(),
        metrics.clone(),
    );

    // Metadata log participant on the raft port.
    let raft_addr = node_config.raft_addr();
    let peers: Vec<NodeId> = config
        .nodes
        .iter()
        .map(|n| n.raft_addr())
        .filter(|addr| addr != &raft_addr)
        .map(NodeId)
        .collect();
    let raft = RaftNode::new(
        NodeId(raft_addr.clone()),
        peers,
        node_dir.join("state"),
        rpc.clone(),
        metrics.clone(),
        node_config.primary,
    )?;
    tokio::spawn(raft.clone().run());

    let raft_app = shardstore::metalog::handlers::router(raft, metrics.clone());
    let raft_listener = TcpListener::bind(&raft_addr).await?;
    info!("Metadata log participant listening on {}", raft_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(raft_listener, raft_app).await {
            tracing::error!("Raft server exited: {}", e);
        }
    });

    let permits = Arc::new(Semaphore::new(config.worker_pool_size));
    let max_body_bytes = config.upload_shard_size.saturating_mul(2);
    let app = shardstore::node::handlers::router(service, metrics, permits, max_body_bytes);

    info!("Storage node listening on {}", listen);
    info!("Press Ctrl+C to shutdown");
    let listener = TcpListener::bind(&listen).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

async fn run_coordinator(config: ClusterConfig) -> anyhow::Result<()> {
    let metrics = Arc::new(Metrics::new());
    let rpc = Arc::new(RpcClient::new(metrics.clone()));

    let view = Arc::new(ClusterView::new(
        config.nodes.iter().map(|n| NodeId(n.chunk_addr())),
    ));
    metrics.total_nodes.set(config.nodes.len() as u64);

    let detector = FailureDetector::new(
        view.clone(),
        rpc.clone(),
        metrics.clone(),
        config.heartbeat_interval(),
        config.suspect_threshold,
        config.dead_threshold(),
    );
    tokio::spawn(detector.run());

    let bootstrap = config
        .nodes
        .iter()
        .find(|n| n.primary)
        .map(|n| n.raft_addr());
    let meta = Arc::new(MetaClient::new(
        rpc.clone(),
        config.nodes.iter().map(|n| n.raft_addr()).collect(),
        bootstrap,
    ));

    let coordinator = Coordinator::new(
        config.clone(),
        view.clone(),
        meta.clone(),
        rpc.clone(),
        metrics.clone(),
    );

    let (worker, _repair_shutdown) = ReplicationWorker::new(
        view,
        meta,
        rpc,
        metrics.clone(),
        config.replication_factor,
        config.disk_high_water,
    );
    tokio::spawn(worker.run());

    let permits = Arc::new(Semaphore::new(config.worker_pool_size));
    let app = shardstore::coordinator::handlers::router(coordinator, metrics, permits);

    info!("Coordinator listening on {}", config.super_node_address);
    info!("Press Ctrl+C to shutdown");
    let listener = TcpListener::bind(&config.super_node_address).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
