//! Process host for the pgstate pluggable state store.
//!
//! Binds the gRPC service to the Unix domain socket the sidecar watches,
//! owns the process-global provisioner singleton, and wires shutdown:
//! SIGTERM/ctrl-c drains the server, stops the janitor and removes the
//! socket file.

pub mod service;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use pgstate_proto::v1::state_store_server::StateStoreServer;
use pgstate_store::{ResourceProvisioner, StateStore};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::service::StateStoreService;

#[derive(Parser, Debug)]
#[command(
    name = "pgstate",
    about = "Tenant-isolating PostgreSQL pluggable state store"
)]
pub struct Options {
    /// Directory the sidecar watches for pluggable component sockets.
    #[arg(
        long,
        env = "DAPR_COMPONENT_SOCKETS_FOLDER",
        default_value = "/tmp/dapr-components-sockets"
    )]
    pub sockets_folder: PathBuf,

    /// Component name; the listener binds `<sockets-folder>/<name>.sock`.
    #[arg(long, env = "PGSTATE_COMPONENT_NAME", default_value = "pgstate")]
    pub component_name: String,

    /// Bind this exact socket path instead of the folder/name pair.
    #[arg(long, env = "PGSTATE_SOCKET_PATH")]
    pub socket_path: Option<PathBuf>,
}

impl Options {
    pub fn resolved_socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(|| {
            self.sockets_folder
                .join(format!("{}.sock", self.component_name))
        })
    }
}

/// Serve until the host signals shutdown.
pub async fn run(options: Options) -> anyhow::Result<()> {
    let socket_path = options.resolved_socket_path();
    if let Some(parent) = socket_path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating sockets folder {}", parent.display()))?;
    }
    remove_stale_socket(&socket_path).await?;

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let provisioner = Arc::new(ResourceProvisioner::new());
    let store = Arc::new(StateStore::new(provisioner, &shutdown));
    let service = StateStoreService::new(Arc::clone(&store));

    let listener = UnixListener::bind(&socket_path)
        .with_context(|| format!("binding component socket {}", socket_path.display()))?;
    let incoming = UnixListenerStream::new(listener);
    info!(socket = %socket_path.display(), "pgstate listening");

    let drain = shutdown.clone();
    tonic::transport::Server::builder()
        .add_service(StateStoreServer::new(service))
        .serve_with_incoming_shutdown(incoming, async move { drain.cancelled().await })
        .await
        .context("grpc server failed")?;

    store.shutdown().await;
    if let Err(err) = tokio::fs::remove_file(&socket_path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            warn!(%err, "failed to remove component socket");
        }
    }
    info!("pgstate stopped");
    Ok(())
}

/// A socket file left over from an unclean exit would make the bind fail.
async fn remove_stale_socket(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            warn!(socket = %path.display(), "removed stale component socket");
            Ok(())
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => {
            Err(err).with_context(|| format!("removing stale socket {}", path.display()))
        }
    }
}

fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(err) => {
                    warn!(%err, "failed to install SIGTERM handler; ctrl-c only");
                    let _ = tokio::signal::ctrl_c().await;
                    shutdown.cancel();
                    return;
                }
            };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received ctrl-c, shutting down"),
            _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
        }
        shutdown.cancel();
    });
}
