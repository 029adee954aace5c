use std::sync::Arc;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use webrtc::peer_connection::RTCPeerConnection;

/// Process-wide set of live peer connections.
///
/// Every session registers its peer connection on startup and unregisters it
/// during cleanup; shutdown fans a close out to whatever is still registered.
/// The runtime is multi-threaded, so the set is guarded by a mutex.
#[derive(Default)]
pub struct PeerRegistry {
    peers: Mutex<Vec<Arc<RTCPeerConnection>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, pc: Arc<RTCPeerConnection>) {
        let mut peers = self.peers.lock().await;
        peers.push(pc);
        info!(active = peers.len(), "Registered peer connection");
    }

    /// Close and remove a peer connection. Unknown connections are ignored.
    pub async fn unregister(&self, pc: &Arc<RTCPeerConnection>) {
        let remaining = {
            let mut peers = self.peers.lock().await;
            let before = peers.len();
            peers.retain(|other| !Arc::ptr_eq(other, pc));
            (peers.len() < before).then_some(peers.len())
        };
        let Some(active) = remaining else {
            return;
        };
        if let Err(e) = pc.close().await {
            debug!("Closing peer connection during unregister: {e}");
        }
        info!(active, "Unregistered peer connection");
    }

    /// Close every registered peer connection concurrently and clear the
    /// set. Individual close failures are logged and swallowed.
    pub async fn close_all(&self) {
        let peers = std::mem::take(&mut *self.peers.lock().await);
        info!(count = peers.len(), "Closing all peer connections");
        for result in join_all(peers.iter().map(|pc| pc.close())).await {
            if let Err(e) = result {
                warn!("Error closing peer connection during shutdown: {e}");
            }
        }
    }

    /// Number of live peer connections.
    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.peers.lock().await.len()
    }
}
