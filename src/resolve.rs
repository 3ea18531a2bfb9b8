//! Hostname resolution worker
//!
//! Blocking DNS lookups run on a separate worker connected to the main
//! loop by bounded channels; the worker never touches peer state. Lookups
//! per peer are rate-limited by the caller through the peer's resolve
//! gate.

use std::net::{SocketAddr, ToSocketAddrs};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::peer::PeerId;
use crate::socket::simplify;

/// Outstanding lookups before requesters see backpressure.
const RESOLVE_QUEUE: usize = 32;

pub struct ResolveRequest {
    pub peer: PeerId,
    pub host: String,
    pub port: u16,
}

pub struct ResolveReply {
    pub peer: PeerId,
    pub host: String,
    pub addr: Option<SocketAddr>,
}

/// Spawn the resolver worker; returns the request sender and reply
/// receiver for the main loop.
pub fn spawn_resolver() -> (mpsc::Sender<ResolveRequest>, mpsc::Receiver<ResolveReply>) {
    let (req_tx, mut req_rx) = mpsc::channel::<ResolveRequest>(RESOLVE_QUEUE);
    let (reply_tx, reply_rx) = mpsc::channel::<ResolveReply>(RESOLVE_QUEUE);

    tokio::spawn(async move {
        while let Some(request) = req_rx.recv().await {
            let target = format!("{}:{}", request.host, request.port);
            let lookup = tokio::task::spawn_blocking(move || {
                target.to_socket_addrs().map(|mut addrs| addrs.next())
            })
            .await;

            let addr = match lookup {
                Ok(Ok(Some(addr))) => {
                    let addr = simplify(addr);
                    debug!("resolved {} to {}", request.host, addr);
                    Some(addr)
                }
                Ok(Ok(None)) => {
                    warn!("no addresses for {}", request.host);
                    None
                }
                Ok(Err(e)) => {
                    warn!("failed to resolve {}: {}", request.host, e);
                    None
                }
                Err(_) => None,
            };

            let reply = ResolveReply { peer: request.peer, host: request.host, addr };
            if reply_tx.send(reply).await.is_err() {
                return;
            }
        }
    });

    (req_tx, reply_rx)
}
