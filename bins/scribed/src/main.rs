// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Scribe daemon: serves collaborative documents over `/ws`.
//!
//! Each `--doc target-id=secret` pair registers one document. Clients
//! authorize a target through the `meta` challenge-response and then drive
//! the session RPC surface. Storage is the in-memory backend; swap the
//! file construction here to serve from a durable one.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use scribe_doc::DocHost;
use scribe_file::{MemoryFile, TransactionalFile};
use scribe_proto::Codec;
use scribe_server::{router, ServerState, TargetDirectory};

#[derive(Parser, Debug)]
#[command(author, version, about = "Scribe document service daemon")]
struct Args {
    /// TCP listener for clients (e.g. 127.0.0.1:8390)
    #[arg(long, default_value = "127.0.0.1:8390")]
    listen: SocketAddr,
    /// Documents to serve, as repeatable `target-id=secret` pairs.
    /// The default is a development credential; do not ship it.
    #[arg(long = "doc", default_value = "scratch=insecure-dev-secret")]
    docs: Vec<String>,
}

fn parse_doc(spec: &str) -> Result<(&str, &str)> {
    spec.split_once('=')
        .filter(|(id, secret)| !id.is_empty() && !secret.is_empty())
        .with_context(|| format!("malformed --doc {spec:?}; expected target-id=secret"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let codec = Codec::new();
    let directory = Arc::new(TargetDirectory::new());
    for spec in &args.docs {
        let (target_id, secret) = parse_doc(spec)?;
        let file: Arc<dyn TransactionalFile> = Arc::new(MemoryFile::new(target_id));
        let host = DocHost::open(file, codec)
            .await
            .with_context(|| format!("open document {target_id}"))?;
        directory.register(target_id, secret.as_bytes(), host).await;
        info!(target = target_id, "document registered");
    }

    let state = ServerState::new(codec, directory);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(args.listen)
        .await
        .with_context(|| format!("bind {}", args.listen))?;
    info!("scribed listening on {}", args.listen);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await
        .context("serve")?;
    Ok(())
}
