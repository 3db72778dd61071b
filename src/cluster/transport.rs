//! Transport seam for shipping replication requests to nodes.
//!
//! [`LocalTransport`] connects nodes living in one process. Requests and
//! responses still cross it as encoded bytes so codec failures surface the
//! same way they would over a network.

use std::collections::HashMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use super::message::{ReplicationRequest, ReplicationResponse};
use super::NodeId;
use crate::error::{CacheError, Result};

/// Encoded request plus the channel its encoded response goes back on.
///
/// Replies travel on a std channel: the origin waits for them from plain
/// threads with a deadline.
#[derive(Debug)]
pub struct Envelope {
    pub payload: Vec<u8>,
    pub reply: mpsc::Sender<Vec<u8>>,
}

/// Sending half of a node's request queue.
pub type Inbox = UnboundedSender<Envelope>;

pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(message)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    Ok(serde_json::from_slice(bytes)?)
}

/// Response still in flight from one node.
#[derive(Debug)]
pub struct PendingReply {
    node: NodeId,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl PendingReply {
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Waits up to `timeout` for the node's response.
    pub fn wait(&self, timeout: Duration) -> Result<ReplicationResponse> {
        match self.rx.recv_timeout(timeout) {
            Ok(bytes) => decode(&bytes),
            Err(RecvTimeoutError::Timeout) => Err(CacheError::ReplicationTimeout {
                node: self.node,
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(CacheError::NodeUnavailable(format!(
                "{} dropped the request",
                self.node
            ))),
        }
    }
}

/// Delivers replication requests to cluster members.
pub trait Transport: Send + Sync {
    fn send(&self, to: NodeId, request: &ReplicationRequest) -> Result<PendingReply>;
}

/// In-process transport keyed by node id.
#[derive(Debug, Default)]
pub struct LocalTransport {
    inboxes: RwLock<HashMap<NodeId, Inbox>>,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, node: NodeId, inbox: Inbox) {
        self.inboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node, inbox);
    }

    /// Drops the node's inbox, which stops its apply worker once drained.
    pub fn deregister(&self, node: NodeId) -> bool {
        self.inboxes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&node)
            .is_some()
    }
}

impl Transport for LocalTransport {
    fn send(&self, to: NodeId, request: &ReplicationRequest) -> Result<PendingReply> {
        let payload = encode(request)?;
        let inbox = self
            .inboxes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&to)
            .cloned()
            .ok_or_else(|| CacheError::NodeUnavailable(format!("{} is not reachable", to)))?;

        let (reply, rx) = mpsc::channel();
        inbox
            .send(Envelope { payload, reply })
            .map_err(|_| CacheError::NodeUnavailable(format!("{} stopped accepting requests", to)))?;

        Ok(PendingReply { node: to, rx })
    }
}
