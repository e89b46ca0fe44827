//! Listener (spec.md §4.D): binds the configured addresses, accepts
//! connections, and spawns a `ConnectedClient` context per connection
//! with its own cancellation scope rooted under the server's.

use crate::protocol::{handle_connection, ConnectedClientContext};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub async fn run(
    addrs: &[std::net::SocketAddr],
    ctx: Arc<ConnectedClientContext>,
    root_cancellation: CancellationToken,
) -> anyhow::Result<()> {
    let mut listeners = Vec::new();
    for addr in addrs {
        match TcpListener::bind(addr).await {
            Ok(listener) => {
                info!(%addr, "listening");
                listeners.push(listener);
            }
            Err(e) => error!(%addr, "failed to bind: {e}"),
        }
    }
    if listeners.is_empty() {
        anyhow::bail!("no listen address could be bound");
    }

    let mut accept_tasks = Vec::new();
    for listener in listeners {
        let ctx = ctx.clone();
        let root_cancellation = root_cancellation.clone();
        accept_tasks.push(tokio::spawn(accept_loop(listener, ctx, root_cancellation)));
    }

    for task in accept_tasks {
        let _ = task.await;
    }
    Ok(())
}

async fn accept_loop(listener: TcpListener, ctx: Arc<ConnectedClientContext>, root_cancellation: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            a = listener.accept() => a,
            _ = root_cancellation.cancelled() => return,
        };
        let (stream, peer) = match accepted {
            Ok(v) => v,
            Err(e) => {
                error!("accept failed: {e}");
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            error!(%peer, "failed to set TCP_NODELAY: {e}");
        }
        info!(%peer, "accepted connection");

        let connection_cancellation = root_cancellation.child_token();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            handle_connection(stream, peer, ctx, connection_cancellation).await;
        });
    }
}
