//! Agent-side coordination: a hub client with bounded waits and reconnect, and a
//! coordinator that falls back to on-disk locks when no hub is running.

pub mod client;
pub mod coordinator;

pub use client::{resolve_hub_url, ClientConfig, ClientError, HubClient, LockReply};
pub use coordinator::{Coordinator, CoordinatorError, LocalLocks};
