//! Control socket server
//!
//! One connection per client request: read a single JSON message to EOF,
//! send exactly one JSON response, close. Each connection runs on its own
//! task so a slow client never blocks the rest.

use crate::daemon::Daemon;
use rampipe_proto::{Request, Response};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Accept connections until the shutdown signal fires, then drain in-flight
/// connections bounded by the grace period
pub async fn run(
    daemon: Arc<Daemon>,
    listener: UnixListener,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    grace: Duration,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _addr)) => {
                    let daemon = daemon.clone();
                    connections.spawn(handle_connection(daemon, stream));
                }
                Err(e) => warn!("accept failed: {e}"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    drop(listener);

    if connections.is_empty() {
        return;
    }
    info!("draining {} in-flight connection(s)", connections.len());
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        warn!("shutdown grace elapsed; aborting remaining connections");
    }
}

/// Serve one client connection
async fn handle_connection(daemon: Arc<Daemon>, mut stream: UnixStream) {
    let mut buf = Vec::new();
    if let Err(e) = stream.read_to_end(&mut buf).await {
        warn!("failed to read request: {e}");
        return;
    }
    // A connection yielding no data is a no-op, not an error
    if buf.is_empty() {
        debug!("empty connection closed");
        return;
    }
    let response = match Request::decode(&buf) {
        Ok(request) => daemon.handle(request).await,
        Err(e) => Response::error(e),
    };
    if let Err(e) = stream.write_all(&response.encode()).await {
        warn!("failed to send response: {e}");
        return;
    }
    if let Err(e) = stream.shutdown().await {
        debug!("connection shutdown: {e}");
    }
}
