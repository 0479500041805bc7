//! Push-RPC surface consumed by the membership updater.
//!
//! The coordinator does not own a transport; it drives whatever
//! implementation the embedding process supplies. The contract is a one-shot,
//! cancellable push per subscriber: `push` starts the RPC and returns a
//! handle, the updater polls readiness without holding the registry lock,
//! and either consumes the result or cancels on timeout/shutdown.

use crate::error::PushError;
use crate::id::ServerId;
use crate::wire::MembershipUpdate;

/// Handle to one outstanding membership push.
pub trait UpdateRpc: Send {
    /// True once `wait` would return without blocking.
    fn is_ready(&self) -> bool;

    /// Consume the handle and return the push outcome. Only called after
    /// `is_ready` reports true.
    fn wait(self: Box<Self>) -> Result<(), PushError>;

    /// Abort the in-flight push. Called before an abandoned handle is
    /// dropped (timeout or shutdown).
    fn cancel(&mut self);
}

/// Transport able to push membership messages to cluster servers.
///
/// `push` must start the RPC and return without blocking; slow targets are
/// handled by the updater's timeout, not by the transport. The message is
/// borrowed only for the duration of the call.
pub trait UpdateTransport: Send + Sync {
    fn push(
        &self,
        target: ServerId,
        locator: &str,
        update: &MembershipUpdate,
    ) -> Box<dyn UpdateRpc>;
}
