//! TCP listener, accept loop, and shutdown.

use std::io::ErrorKind;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use ruflet_core::config::Config;
use ruflet_core::props::{IconLookup, NumericIcons};

use crate::connection::handle_connection;
use crate::state::{App, ServerState};

/// Bind `host:port`, moving to the next port while the address is in use.
///
/// Returns the listener and the port actually bound.
pub async fn bind_with_retry(host: &str, port: u16, max_attempts: u32) -> anyhow::Result<(TcpListener, u16)> {
    let mut candidate = port;
    for _ in 0..max_attempts.max(1) {
        match TcpListener::bind((host, candidate)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                if candidate != port {
                    warn!(requested = port, bound, "Port in use, bound to a fallback port");
                }
                return Ok((listener, bound));
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => {
                candidate = candidate
                    .checked_add(1)
                    .context("ran out of ports while looking for a free one")?;
            }
            Err(e) => return Err(e).with_context(|| format!("failed to bind {host}:{candidate}")),
        }
    }
    anyhow::bail!("no free port in {port}..{candidate} after {max_attempts} attempts")
}

/// A running server. Dropping it does not stop it; call [`Server::stop`].
pub struct Server {
    state: Arc<ServerState>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    stopped: AtomicBool,
}

impl Server {
    /// Bind and start accepting connections in the background.
    pub async fn start(config: Config, app: App) -> anyhow::Result<Self> {
        Self::start_with_icons(config, app, Arc::new(NumericIcons)).await
    }

    /// Like [`Server::start`], resolving icon names on every page through `icons`.
    pub async fn start_with_icons(config: Config, app: App, icons: Arc<dyn IconLookup>) -> anyhow::Result<Self> {
        let (listener, port) =
            bind_with_retry(&config.server_host(), config.server_port(), config.max_bind_attempts()).await?;
        let local_addr = listener.local_addr()?;
        let path = config.ws_path();

        let state = Arc::new(ServerState::new(Arc::new(config), app).with_icons(icons));
        info!("Ruflet server listening on ws://{}:{port}{path}", local_addr.ip());

        let accept_task = tokio::spawn(accept_loop(listener, state.clone()));
        Ok(Self {
            state,
            local_addr,
            accept_task,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Stop accepting, then close every tracked connection. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Stopping server");
        self.accept_task.abort();
        self.state.close_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

async fn accept_loop(listener: TcpListener, state: Arc<ServerState>) {
    let shutdown = state.shutdown_token().clone();
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                tokio::spawn(handle_connection(state.clone(), stream, peer.to_string()));
            }
            Err(e) => error!(error = %e, "Failed to accept connection"),
        }
    }
}

/// Start the server, run until Ctrl-C, then stop it.
pub async fn run(config: Config, app: App) -> anyhow::Result<()> {
    let server = Server::start(config, app).await?;
    shutdown_signal().await;
    server.stop();
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to install Ctrl-C handler");
        return;
    }
    info!("Shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::make_app;

    #[tokio::test]
    async fn test_bind_with_retry_falls_back_to_next_port() {
        let (first, port) = bind_with_retry("127.0.0.1", 0, 1).await.unwrap();
        let (second, bound) = bind_with_retry("127.0.0.1", port, 10).await.unwrap();
        assert_ne!(bound, port);
        assert!(bound > port);
        drop((first, second));
    }

    #[tokio::test]
    async fn test_bind_with_retry_gives_up() {
        let (_held, port) = bind_with_retry("127.0.0.1", 0, 1).await.unwrap();
        assert!(bind_with_retry("127.0.0.1", port, 1).await.is_err());
    }

    struct OneIcon;

    impl IconLookup for OneIcon {
        fn codepoint_for(&self, name: &str) -> Option<i64> {
            (name == "home").then_some(0xe88a)
        }
    }

    #[tokio::test]
    async fn test_start_with_icons_reaches_state() {
        let config = Config::default().with_overrides(Some("127.0.0.1".into()), Some(0));
        let server = Server::start_with_icons(config, make_app(|_| Ok(())), Arc::new(OneIcon))
            .await
            .unwrap();
        assert_eq!(server.state().icons().codepoint_for("home"), Some(0xe88a));
        server.stop();
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let mut config = Config::default().with_overrides(Some("127.0.0.1".into()), Some(0));
        config.server.get_or_insert_with(Default::default).max_bind_attempts = 1;
        let server = Server::start(config, make_app(|_| Ok(()))).await.unwrap();
        assert!(!server.is_stopped());
        server.stop();
        server.stop();
        assert!(server.is_stopped());
        assert!(server.state().shutdown_token().is_cancelled());
    }
}
