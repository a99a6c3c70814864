use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::Parser;
use synapse::relay::{
    hex::{parse_key, HexDisplayExt},
    Fanout, MemoryBoard, MemoryCompiler, NodeIdentity, Relay, RelayConfig, Submission,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Runs a relay node with in-memory boards.
#[derive(Parser, Debug)]
#[command(name = "synapse", version)]
struct Args {
    /// Address to listen on for peers.
    #[arg(long, default_value = "0.0.0.0:4710")]
    listen: SocketAddr,

    /// Peers to dial on startup.
    #[arg(long)]
    connect: Vec<SocketAddr>,

    /// PEM certificate. A fresh identity is generated when omitted.
    #[arg(long, requires = "key")]
    cert: Option<PathBuf>,

    /// PEM PKCS#8 private key for `--cert`.
    #[arg(long, requires = "cert")]
    key: Option<PathBuf>,

    /// Hex key of a board this node masters. Repeatable.
    #[arg(long = "master-board")]
    master_boards: Vec<String>,

    /// Hex key of a board this node follows. Repeatable.
    #[arg(long = "follow-board")]
    follow_boards: Vec<String>,

    /// Only write submissions to the target peer instead of every peer.
    #[arg(long)]
    targeted: bool,

    /// Submit this payload once connected, then exit.
    #[arg(long, requires_all = ["board", "target"])]
    submit: Option<String>,

    /// Board for `--submit`.
    #[arg(long)]
    board: Option<String>,

    /// Hex key of the master to submit to.
    #[arg(long)]
    target: Option<String>,

    /// How long `--submit` waits for an answer.
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let identity = match (&args.cert, &args.key) {
        (Some(cert), Some(key)) => NodeIdentity::from_pem_files(cert, key)
            .context("failed to load identity")?,
        _ => NodeIdentity::generate().context("failed to generate identity")?,
    };

    let compiler = Arc::new(MemoryCompiler::new());
    for board in &args.master_boards {
        compiler.insert(parse_key(board)?, MemoryBoard::master());
    }
    for board in &args.follow_boards {
        compiler.insert(parse_key(board)?, MemoryBoard::follower());
    }

    let config = RelayConfig::builder()
        .listen(args.listen)
        .fanout(if args.targeted {
            Fanout::Target
        } else {
            Fanout::Broadcast
        })
        .build();
    let relay = Relay::open(config, identity, compiler).await?;
    println!("{}", relay.local_key().hex());

    for addr in &args.connect {
        match relay.connect(*addr).await {
            Ok(key) => info!(%addr, peer = %key.short(), "dialed peer"),
            Err(e) => warn!(%addr, error = %e, "failed to dial peer"),
        }
    }

    if let (Some(payload), Some(board), Some(target)) = (&args.submit, &args.board, &args.target) {
        let submission = Submission::new(parse_key(board)?, payload.clone().into_bytes());
        let result = relay
            .submit_timeout(
                parse_key(target)?,
                &submission,
                Duration::from_secs(args.timeout_secs),
            )
            .await;
        relay.close().await;
        match result {
            Ok(seq) => {
                println!("{} {}", submission.content_hash.hex(), seq);
                return Ok(());
            }
            Err(e) => bail!("submission failed: {}", e),
        }
    }

    let mut disconnections = relay.disconnections();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            addr = disconnections.recv() => match addr {
                Ok(addr) => info!(%addr, "peer disconnected"),
                Err(e) => warn!(error = %e, "missed disconnect notifications"),
            },
        }
    }

    relay.close().await;
    Ok(())
}
