//! The accept loop (spec.md §4.E / §5): binds a single listening socket
//! and spawns one task per accepted connection.
//!
//! Grounded in `router-core/src/system/protocol/server.rs`'s
//! `run_server` (bind, loop-accept-and-spawn, log-then-continue on
//! transient accept errors), generalized from its `AtomicBool` shutdown
//! flag to the crate-wide `CancellationToken` used everywhere else in
//! this engine, and from its unconditional spawn to a soft connection
//! cap enforced pre-greeting (spec.md §5: "once the live session count
//! reaches the configured maximum, new connections are accepted off the
//! socket, sent nothing, and dropped").

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::session::{self, Services};

/// Bind `listen_addr` and serve connections until `services.shutdown`
/// fires. Returns once the listener has been torn down; in-flight
/// sessions are not waited on here (the caller awaits those separately
/// during shutdown).
pub async fn run(listen_addr: &str, services: Arc<Services>) -> io::Result<()> {
    let listener = TcpListener::bind(listen_addr).await.map_err(|e| {
        log::error!("failed to bind {listen_addr}: {e}");
        e
    })?;
    log::info!("listening on {listen_addr}");

    let max_connections = services.config.proxy.max_connections;

    loop {
        tokio::select! {
            _ = services.shutdown.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((socket, peer_addr)) => {
                        if max_connections > 0 && services.counters.active() as usize >= max_connections {
                            log::warn!("connection cap ({max_connections}) reached, dropping {peer_addr}");
                            drop(socket);
                            continue;
                        }
                        log::debug!("accepted connection from {peer_addr}");
                        let services = services.clone();
                        tokio::spawn(async move {
                            if let Err(e) = session::handle_connection(socket, peer_addr, services).await {
                                log::info!("session with {peer_addr} ended: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        log::warn!("accept failed: {e}");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }
    }

    log::info!("accept loop shutting down");
    Ok(())
}

pub fn trigger_shutdown(token: &CancellationToken) {
    token.cancel();
}
