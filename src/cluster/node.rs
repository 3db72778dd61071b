//! Apply worker.
//!
//! Each node drains its inbox on a dedicated thread, so replicated writes
//! reach the entry store in the order they were delivered and never run on
//! the caller that originated them.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tracing::{debug, warn};

use super::message::{ReplicationRequest, ReplicationResponse};
use super::transport::{decode, encode, Envelope, Inbox};
use super::NodeId;
use crate::cache::EntryStore;
use crate::error::{CacheError, Result};

/// Starts the apply worker for `store`; returns the inbox that feeds it.
///
/// The worker exits once every sender for the inbox is dropped.
pub fn spawn_worker(
    id: NodeId,
    store: Arc<EntryStore>,
) -> Result<(Inbox, JoinHandle<()>)> {
    let (tx, rx) = unbounded_channel();
    let handle = thread::Builder::new()
        .name(format!("mesh-cache-apply-{}", id.0))
        .spawn(move || apply_loop(id, rx, store))
        .map_err(|err| CacheError::Internal(format!("failed to start worker for {}: {}", id, err)))?;
    Ok((tx, handle))
}

fn apply_loop(id: NodeId, mut rx: UnboundedReceiver<Envelope>, store: Arc<EntryStore>) {
    while let Some(envelope) = rx.blocking_recv() {
        let response = match decode::<ReplicationRequest>(&envelope.payload) {
            Ok(request) => store.handle(request),
            Err(err) => {
                warn!(node = %id, "undecodable replication request: {}", err);
                ReplicationResponse::Failed(err.to_string())
            }
        };
        match encode(&response) {
            // The origin may have given up waiting already
            Ok(bytes) => {
                let _ = envelope.reply.send(bytes);
            }
            Err(err) => warn!(node = %id, "failed to encode response: {}", err),
        }
    }
    debug!(node = %id, "apply worker stopped");
}
