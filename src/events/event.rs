//! Cache change events.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cache::{current_timestamp_ms, Version};
use crate::cluster::NodeId;

/// Kind of change applied to a node's entry store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// put, replace, put-if-absent insert, processor write
    Put,
    /// remove, remove-if-matches success, processor remove
    Removed,
    /// Entry crossed its deadline on this node
    Expired,
    /// Entry dropped by capacity eviction on this node
    Evicted,
}

impl EventType {
    /// The two types every replicated mutation produces.
    pub const MUTATIONS: [EventType; 2] = [EventType::Put, EventType::Removed];
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Put => "PUT",
            EventType::Removed => "REMOVED",
            EventType::Expired => "EXPIRED",
            EventType::Evicted => "EVICTED",
        };
        f.write_str(name)
    }
}

/// A change observed on one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEvent {
    pub event_type: EventType,
    pub key: String,
    /// New value for `Put`, previous value otherwise
    pub value: Option<String>,
    /// Node whose call produced the change
    pub origin: NodeId,
    /// Node this event fired on
    pub node: NodeId,
    pub version: Version,
    /// Unix milliseconds when the change was applied locally
    pub timestamp: u64,
}

impl CacheEvent {
    pub fn new(
        event_type: EventType,
        key: impl Into<String>,
        value: Option<String>,
        version: Version,
        node: NodeId,
    ) -> Self {
        Self {
            event_type,
            key: key.into(),
            value,
            origin: version.node,
            node,
            version,
            timestamp: current_timestamp_ms(),
        }
    }
}

impl fmt::Display for CacheEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} key={} version={} on {}",
            self.event_type, self.key, self.version, self.node
        )
    }
}
