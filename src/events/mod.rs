//! Events Module
//!
//! Local notification of changes applied to a node's entry store, whether
//! the change originated on this node or arrived through replication.

mod bus;
mod event;

pub use bus::{EventBus, ListenerFn, ListenerId};
pub use event::{CacheEvent, EventType};
