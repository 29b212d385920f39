use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

use logmesh::{
    AssignAll, Keypair, LoopbackBroker, MemoryStore, MessageRef, Node, NodeConfig, QueryOptions,
    QueryRequest, Storage, StoredMessage,
};

/// Demo: an in-process cluster where every node stores a different slice of
/// one stream, then one node answers a range query by reconciling with the
/// others.
#[derive(Parser, Debug)]
#[command(name = "logmesh")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of nodes in the in-process cluster.
    #[arg(short, long, default_value = "3")]
    nodes: usize,

    /// Messages published into the stream, spread across the nodes.
    #[arg(short, long, default_value = "30")]
    messages: i64,

    /// Seconds to wait for heartbeats before querying.
    #[arg(long, default_value = "1")]
    warmup: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    anyhow::ensure!(args.nodes >= 1, "need at least one node");

    let broker = LoopbackBroker::new();
    let publisher = Keypair::generate();
    let config = NodeConfig {
        heartbeat_interval: Duration::from_millis(200),
        endpoint: "http://127.0.0.1:0".to_string(),
        ..NodeConfig::default()
    };

    let mut nodes = Vec::with_capacity(args.nodes);
    for index in 0..args.nodes {
        let keypair = Keypair::generate();
        let identity = keypair.identity();
        let store = MemoryStore::shared();

        // Every node gets a disjoint slice of the stream.
        for ts in 1..=args.messages {
            if ts as usize % args.nodes == index {
                let message =
                    StoredMessage::sign(&publisher, "demo", 0, ts, 0, "chain", format!("payload {ts}").into_bytes());
                store.store(message).await?;
            }
        }

        let node = Node::network(
            identity,
            Arc::new(broker.client(identity)),
            store,
            Arc::new(AssignAll),
            config.clone(),
        )
        .await?;
        info!(node = %identity, slice = index, "node started");
        nodes.push(node);
    }

    // Let heartbeats establish the roster.
    tokio::time::sleep(Duration::from_secs(args.warmup)).await;

    let front = &nodes[0];
    info!(online = front.online_nodes().await.len(), "querying first node");

    let request = QueryRequest::new(
        "demo-consumer",
        "demo",
        0,
        QueryOptions::From {
            from: MessageRef::new(0, 0),
            publisher: None,
        },
    );
    let mut answer = front.process_query_request(request).await?;
    info!(participants = answer.participants.len(), "resolution ready");

    let mut received = 0usize;
    while let Some(chunk) = answer.data.recv().await {
        for message in &chunk {
            println!("{}  {}", message.reference(), String::from_utf8_lossy(&message.payload));
        }
        received += chunk.len();
    }

    let telemetry = front.telemetry().await;
    info!(
        received,
        expected = args.messages,
        online_peers = telemetry.online_peers.len(),
        "query complete"
    );
    anyhow::ensure!(received as i64 == args.messages, "merged stream is incomplete");
    Ok(())
}
