//! Background Tasks Module
//!
//! Contains background tasks that run periodically during server operation.
//!
//! # Tasks
//! - Expiry Reaper: Sweeps every node's expired entries at a configured interval

mod reaper;

pub use reaper::spawn_reaper_task;
