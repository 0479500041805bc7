//! Cluster-coordinator membership for Shoal.
//!
//! This crate is the coordinator's authoritative record of which servers
//! belong to the cluster. It keeps a slotted, generation-numbered table of
//! enlisted servers, buffers every change as a versioned delta, and runs a
//! background updater that pushes deltas (or full snapshots, for servers
//! that have never been updated) to every membership subscriber until the
//! whole cluster has caught up. In-process trackers observe every
//! add/crash/remove in order.
//!
//! The RPC transport and the coordinator's recovery log are supplied by the
//! embedding process through the `UpdateTransport` trait and `LogEntryId`
//! handles.

mod entry;
mod error;
mod id;
mod registry;
mod tracker;
mod transport;
mod updater;
mod wire;

pub use entry::{Entry, LogEntryId, ServerStatus, ServiceKind, ServiceMask};
pub use error::{PushError, RegistryError};
pub use id::ServerId;
pub use registry::ServerRegistry;
pub use tracker::{ChannelTracker, ServerChange, ServerChangeKind, Tracker};
pub use transport::{UpdateRpc, UpdateTransport};
pub use updater::{MembershipUpdater, UpdaterConfig};
pub use wire::{MembershipUpdate, UpdateKind, WireEntry};
