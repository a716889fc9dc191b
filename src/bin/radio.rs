//! `radio serve -c <path>`: parses configuration, wires up every component,
//! and blocks until the process-wide shutdown signal fires.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use radio::bucket::MirrorBindings;
use radio::config::Config;
use radio::health;
use radio::journal::{self, HealJournal};
use radio::lock::{DistributedLock, LocalLockTable, LocalPeer, LockServerState, PeerLockClient, RemotePeer};
use radio::multipart::MultipartRegistry;
use radio::pipeline::Pipeline;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "radio", about = "S3-compatible object storage mirroring gateway")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the gateway server.
    Serve {
        /// Path to the YAML configuration document, or "-" for stdin.
        #[arg(short = 'c', long = "config")]
        config: String,

        /// Address this node's own peer lock server binds to. Also used to
        /// identify this node among `distribute.peers` so its own entry is
        /// served in-process instead of looped back over HTTP.
        #[arg(long, default_value = "0.0.0.0:7070")]
        listen: SocketAddr,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();

    let cli = Cli::parse();
    let exit_code = match cli.command {
        Command::Serve { config, listen } => match serve(&config, listen).await {
            Ok(()) => 0,
            Err(e) => {
                log::error!("fatal: {e:?}");
                1
            }
        },
    };
    std::process::exit(exit_code);
}

async fn serve(config_path: &str, listen: SocketAddr) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    log::info!("loaded configuration with {} bucket(s)", config.buckets.len());

    let bindings = Arc::new(MirrorBindings::from_config(&config));
    for binding in bindings.iter() {
        for replica in binding.replicas.iter() {
            replica
                .wait_until_ready()
                .await
                .map_err(|e| anyhow::anyhow!("bucket {}: replica {} failed startup probe: {e}", binding.name, replica.id))?;
        }
    }

    let shutdown = CancellationToken::new();

    tokio::spawn({
        let bindings = Arc::clone(&bindings);
        let shutdown = shutdown.clone();
        async move { health::run(&bindings, shutdown).await }
    });

    let journal = HealJournal::spawn(config.journal.dir.clone().into(), shutdown.clone());
    tokio::spawn({
        let journal = Arc::clone(&journal);
        let bindings = Arc::clone(&bindings);
        let shutdown = shutdown.clone();
        async move { journal::run_replay(journal, bindings, shutdown).await }
    });

    let local_table = Arc::new(LocalLockTable::new());
    let peers: Vec<Arc<dyn PeerLockClient>> = config
        .distribute
        .peers
        .iter()
        .map(|addr| {
            if is_self(addr, listen) {
                Arc::new(LocalPeer::new(Arc::clone(&local_table))) as Arc<dyn PeerLockClient>
            } else {
                Arc::new(RemotePeer::new(format!("http://{addr}"), config.distribute.token.clone())) as Arc<dyn PeerLockClient>
            }
        })
        .collect();
    let lock = Arc::new(DistributedLock::new(peers));

    let lock_server_state = LockServerState {
        table: local_table,
        token: Arc::new(config.distribute.token.clone()),
    };
    let lock_router = radio::lock::router(lock_server_state);
    let lock_listener = tokio::net::TcpListener::bind(listen)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind peer lock server on {listen}: {e}"))?;
    log::info!("peer lock server listening on {listen}");
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = axum::serve(lock_listener, lock_router) => {
                    if let Err(e) = result {
                        log::error!("peer lock server exited: {e}");
                    }
                }
            }
        }
    });

    let registry = Arc::new(MultipartRegistry::new());
    let _pipeline = Arc::new(Pipeline::new(bindings, lock, journal, registry));
    // The S3 front-end (out of scope per this gateway's design) takes
    // `_pipeline` from here and invokes it per request.

    wait_for_shutdown_signal().await;
    log::info!("shutdown signal received, draining background tasks");
    shutdown.cancel();
    Ok(())
}

fn is_self(peer_addr: &str, listen: SocketAddr) -> bool {
    peer_addr == listen.to_string() || peer_addr.starts_with(&format!(":{}", listen.port()))
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        sigterm.recv().await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_self_matches_exact_address() {
        let listen: SocketAddr = "127.0.0.1:7070".parse().unwrap();
        assert!(is_self("127.0.0.1:7070", listen));
        assert!(!is_self("127.0.0.1:7071", listen));
    }
}
