//! Shared stub transports for dissemination tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use shoal_coord::{MembershipUpdate, PushError, ServerId, UpdateRpc, UpdateTransport};

/// Poll `cond` until it holds or the timeout elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

/// Transport whose pushes succeed immediately, recording every message.
#[derive(Clone, Default)]
pub struct InstantTransport {
    pushes: Arc<Mutex<Vec<(ServerId, MembershipUpdate)>>>,
}

impl InstantTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pushes(&self) -> Vec<(ServerId, MembershipUpdate)> {
        self.pushes.lock().unwrap().clone()
    }
}

struct DoneRpc {
    outcome: Option<Result<(), PushError>>,
}

impl UpdateRpc for DoneRpc {
    fn is_ready(&self) -> bool {
        true
    }

    fn wait(mut self: Box<Self>) -> Result<(), PushError> {
        self.outcome.take().unwrap_or(Ok(()))
    }

    fn cancel(&mut self) {}
}

impl UpdateTransport for InstantTransport {
    fn push(
        &self,
        target: ServerId,
        _locator: &str,
        update: &MembershipUpdate,
    ) -> Box<dyn UpdateRpc> {
        self.pushes.lock().unwrap().push((target, update.clone()));
        Box::new(DoneRpc { outcome: Some(Ok(())) })
    }
}

/// Transport whose pushes never complete; counts pushes and cancellations.
#[derive(Clone, Default)]
pub struct StalledTransport {
    pub pushes: Arc<AtomicUsize>,
    pub cancels: Arc<AtomicUsize>,
}

impl StalledTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

struct StalledRpc {
    cancels: Arc<AtomicUsize>,
}

impl UpdateRpc for StalledRpc {
    fn is_ready(&self) -> bool {
        false
    }

    fn wait(self: Box<Self>) -> Result<(), PushError> {
        unreachable!("stalled rpc never reports ready")
    }

    fn cancel(&mut self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

impl UpdateTransport for StalledTransport {
    fn push(
        &self,
        _target: ServerId,
        _locator: &str,
        _update: &MembershipUpdate,
    ) -> Box<dyn UpdateRpc> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Box::new(StalledRpc {
            cancels: self.cancels.clone(),
        })
    }
}

/// Transport whose pushes succeed after a fixed delay, so updates are
/// observably in flight while the cluster drains to quiescence.
#[derive(Clone)]
pub struct LatencyTransport {
    delay: Duration,
    pub pushes: Arc<AtomicUsize>,
}

impl LatencyTransport {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pushes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

struct DelayedRpc {
    ready_at: Instant,
}

impl UpdateRpc for DelayedRpc {
    fn is_ready(&self) -> bool {
        Instant::now() >= self.ready_at
    }

    fn wait(self: Box<Self>) -> Result<(), PushError> {
        Ok(())
    }

    fn cancel(&mut self) {}
}

impl UpdateTransport for LatencyTransport {
    fn push(
        &self,
        _target: ServerId,
        _locator: &str,
        _update: &MembershipUpdate,
    ) -> Box<dyn UpdateRpc> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        Box::new(DelayedRpc {
            ready_at: Instant::now() + self.delay,
        })
    }
}

/// Transport that reports `ServerNotUp` for the first `failures` pushes and
/// succeeds afterwards.
#[derive(Clone)]
pub struct FlakyTransport {
    remaining_failures: Arc<AtomicUsize>,
    pub pushes: Arc<AtomicUsize>,
}

impl FlakyTransport {
    pub fn new(failures: usize) -> Self {
        Self {
            remaining_failures: Arc::new(AtomicUsize::new(failures)),
            pushes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl UpdateTransport for FlakyTransport {
    fn push(
        &self,
        _target: ServerId,
        _locator: &str,
        _update: &MembershipUpdate,
    ) -> Box<dyn UpdateRpc> {
        self.pushes.fetch_add(1, Ordering::SeqCst);
        let fail = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        let outcome = if fail {
            Err(PushError::ServerNotUp)
        } else {
            Ok(())
        };
        Box::new(DoneRpc {
            outcome: Some(outcome),
        })
    }
}
