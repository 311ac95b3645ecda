use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{registry::Registry, session};

/// Accepts TCP connections and hands each one to its own session task.
pub struct Server {
    listener: TcpListener,
    registry: Arc<Registry>,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self {
            listener,
            registry: Arc::new(Registry::new()),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Accepts until the listening socket fails.
    pub async fn run(self) -> Result<()> {
        self.run_until(std::future::pending()).await
    }

    /// Accepts until `shutdown` resolves or the listening socket fails, then
    /// drops the listener. Sessions that are already running keep going.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server { listener, registry } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    info!("server no longer accepting connections");
                    break;
                }
                accept_result = listener.accept() => {
                    if !handle_accept_result(accept_result, &registry) {
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &Arc<Registry>,
) -> bool {
    match result {
        Ok((stream, peer)) => {
            spawn_session(stream, peer, registry);
            true
        }
        Err(err) => {
            warn!(error = ?err, "listening socket failed; accept loop stopping");
            false
        }
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, registry: &Arc<Registry>) {
    info!(%peer, "client connected");
    let (reader, writer) = stream.into_split();
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        let exit = session::run(registry, reader, writer).await;
        debug!(%peer, ?exit, "session finished");
    });
}
