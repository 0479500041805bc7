//! Background dissemination of membership updates.
//!
//! A single worker thread keeps a fixed pool of update slots, each holding
//! at most one outstanding push RPC. The worker repeatedly progresses every
//! slot (collect a finished push, cancel one past its deadline, start the
//! next one) and parks on the registry's condition variable when the whole
//! cluster is caught up. Mutators never wait on the worker; they commit and
//! return, and the worker picks the change up on its next scan.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Context;

use crate::error::PushError;
use crate::id::ServerId;
use crate::registry::ServerRegistry;
use crate::transport::{UpdateRpc, UpdateTransport};

/// Completion/timeout poll cadence while pushes are in flight.
const POLL_INTERVAL: Duration = Duration::from_micros(100);

/// Tuning for the membership update dispatcher.
#[derive(Clone, Copy, Debug)]
pub struct UpdaterConfig {
    /// Number of push RPCs kept in flight at once.
    pub concurrent_rpcs: usize,
    /// Deadline for a single push before it is cancelled and retried.
    pub rpc_timeout: Duration,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            concurrent_rpcs: 5,
            rpc_timeout: Duration::from_millis(10),
        }
    }
}

/// One in-flight (or idle) push RPC owned by the worker.
struct UpdateSlot {
    rpc: Option<Box<dyn UpdateRpc>>,
    server_id: ServerId,
    /// Ack restored if the push fails, times out, or is cancelled.
    original_version: u64,
    /// Version the in-flight message carries; becomes the ack on success.
    sent_version: u64,
    started_at: Instant,
}

impl UpdateSlot {
    fn idle() -> Self {
        Self {
            rpc: None,
            server_id: ServerId::new(0, 0),
            original_version: 0,
            sent_version: 0,
            started_at: Instant::now(),
        }
    }
}

/// Owner of the background worker. Dropping it halts the worker, cancelling
/// outstanding pushes and restoring their acks; callers wanting the cluster
/// current at shutdown should `ServerRegistry::sync` first.
pub struct MembershipUpdater {
    registry: ServerRegistry,
    thread: Option<JoinHandle<()>>,
}

impl MembershipUpdater {
    /// Start the worker thread. The registry may be mutated before and after
    /// this call; the worker catches up from whatever state it finds.
    pub fn spawn(
        registry: ServerRegistry,
        transport: Arc<dyn UpdateTransport>,
        config: UpdaterConfig,
    ) -> anyhow::Result<Self> {
        registry.resume_updater();
        let worker_registry = registry.clone();
        let thread = thread::Builder::new()
            .name("membership-updater".to_string())
            .spawn(move || update_loop(worker_registry, transport, config))
            .context("spawn membership updater thread")?;
        Ok(Self {
            registry,
            thread: Some(thread),
        })
    }

    /// Stop the worker and join it. Outstanding pushes are cancelled and
    /// their acks restored, which may leave the cluster behind.
    pub fn halt(&mut self) {
        self.registry.request_stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("membership updater thread panicked");
            }
        }
    }
}

impl Drop for MembershipUpdater {
    fn drop(&mut self) {
        self.halt();
    }
}

fn update_loop(
    registry: ServerRegistry,
    transport: Arc<dyn UpdateTransport>,
    config: UpdaterConfig,
) {
    let mut slots: Vec<UpdateSlot> = Vec::new();
    slots.resize_with(config.concurrent_rpcs.max(1), UpdateSlot::idle);

    while !registry.stop_requested() {
        let mut any_active = false;
        for slot in &mut slots {
            if registry.stop_requested() {
                break;
            }
            if progress_slot(&registry, transport.as_ref(), &config, slot) {
                any_active = true;
            }
        }

        // With nothing in flight and nothing to send, park until a commit
        // (or a halt) arrives. The registry broadcasts quiescence while the
        // scan stays empty. Otherwise nap briefly between completion polls.
        if !any_active {
            registry.wait_for_updates();
        } else {
            thread::sleep(POLL_INTERVAL);
        }
    }

    for slot in &mut slots {
        if let Some(mut rpc) = slot.rpc.take() {
            rpc.cancel();
            registry.ack_entry(slot.server_id, slot.original_version);
        }
    }
}

/// Progress one slot: collect a finished push, time out a stale one, then
/// start the next pending update if the slot is free. Returns whether the
/// slot holds an active RPC afterwards.
fn progress_slot(
    registry: &ServerRegistry,
    transport: &dyn UpdateTransport,
    config: &UpdaterConfig,
    slot: &mut UpdateSlot,
) -> bool {
    let ready = slot.rpc.as_ref().is_some_and(|rpc| rpc.is_ready());
    if ready {
        if let Some(rpc) = slot.rpc.take() {
            let acked = match rpc.wait() {
                Ok(()) => slot.sent_version,
                Err(PushError::ServerNotUp) => {
                    tracing::info!(
                        server = %slot.server_id,
                        "membership push raced with crash/remove; restoring ack"
                    );
                    slot.original_version
                }
                Err(PushError::Transport(err)) => {
                    tracing::warn!(
                        server = %slot.server_id,
                        error = ?err,
                        "membership push failed; will retry"
                    );
                    slot.original_version
                }
            };
            registry.ack_entry(slot.server_id, acked);
        }
    } else if slot.rpc.is_some() && slot.started_at.elapsed() >= config.rpc_timeout {
        if let Some(mut rpc) = slot.rpc.take() {
            rpc.cancel();
        }
        tracing::debug!(
            server = %slot.server_id,
            timeout_ms = config.rpc_timeout.as_millis() as u64,
            "membership push timed out; restoring ack"
        );
        registry.ack_entry(slot.server_id, slot.original_version);
    }

    if slot.rpc.is_some() {
        return true;
    }

    let Some(update) = registry.load_next_update() else {
        return false;
    };
    slot.server_id = update.server_id;
    slot.original_version = update.original_version;
    slot.sent_version = update.message.version_number;
    slot.started_at = Instant::now();
    slot.rpc = Some(transport.push(update.server_id, &update.locator, &update.message));
    true
}
