//! Authoritative server table, versioned update log, and tracker fan-out.
//!
//! All registry state lives behind one mutex: the slotted table, the
//! master/backup counters, the in-progress delta buffer, the committed
//! update queue, the version counter, the updater's scan cursor, and the
//! tracker set. A mutating operation updates the table, appends the changed
//! entry's wire form to the delta buffer, notifies trackers, and commits,
//! all in one critical section. The updater (see `updater`) consumes the
//! committed queue through the crate-internal scan/load/ack operations and
//! never performs RPC I/O while the lock is held.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::entry::{Entry, LogEntryId, ServerStatus, ServiceKind, ServiceMask};
use crate::error::RegistryError;
use crate::id::ServerId;
use crate::tracker::{ServerChangeKind, Tracker};
use crate::wire::{MembershipUpdate, UpdateKind, WireEntry};

/// One slot in the server table.
///
/// `next_generation` outlives the entry so a reused index never yields an id
/// equal to a past enlistment's.
#[derive(Default)]
struct Slot {
    next_generation: u32,
    entry: Option<Entry>,
}

/// Persistent cursor state for the updater's eligibility scan.
#[derive(Default)]
struct ScanState {
    /// Index the next scan starts from.
    search_index: usize,
    /// Minimum non-zero acked version observed since the last wrap; feeds
    /// queue pruning when the scan crosses index 0. Zero means "none seen".
    min_version: u64,
    /// Short-circuits scans while nothing is known to be out of date.
    no_updates_found: bool,
}

struct RegistryInner {
    slots: Vec<Slot>,
    /// Up entries advertising the master service.
    masters: usize,
    /// Up entries advertising the backup service.
    backups: usize,
    /// Bumped exactly once per non-empty commit.
    version: u64,
    /// Wire entries serialized since the last commit.
    delta: Vec<WireEntry>,
    /// Committed updates, contiguous versions, oldest first.
    updates: VecDeque<MembershipUpdate>,
    scan: ScanState,
    trackers: Vec<Box<dyn Tracker>>,
    stop_updater: bool,
}

struct Shared {
    inner: Mutex<RegistryInner>,
    /// Signalled by commit and by updater start/halt.
    has_updates_or_stop: Condvar,
    /// Signalled when every membership subscriber is current.
    list_up_to_date: Condvar,
}

/// Work item handed to the updater: one message bound for one subscriber.
pub(crate) struct LoadedUpdate {
    pub server_id: ServerId,
    pub locator: String,
    /// Ack to restore if the push fails, times out, or is cancelled.
    pub original_version: u64,
    pub message: MembershipUpdate,
}

/// Handle to the coordinator's membership registry. Cheap to clone; all
/// clones share the same table.
#[derive(Clone)]
pub struct ServerRegistry {
    shared: Arc<Shared>,
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerRegistry {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(RegistryInner {
                    slots: Vec::new(),
                    masters: 0,
                    backups: 0,
                    version: 0,
                    delta: Vec::new(),
                    updates: VecDeque::new(),
                    scan: ScanState::default(),
                    trackers: Vec::new(),
                    stop_updater: true,
                }),
                has_updates_or_stop: Condvar::new(),
                list_up_to_date: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.shared.inner.lock().unwrap()
    }

    /// Reserve a fresh id: the smallest vacant index at its slot's next
    /// generation. The slot is left holding a placeholder entry so repeated
    /// calls reserve distinct indexes. Never returns index 0.
    pub fn generate_id(&self) -> ServerId {
        let mut inner = self.lock();
        let index = first_free_index(&mut inner);
        let slot = &mut inner.slots[index];
        let id = ServerId::new(index as u32, slot.next_generation);
        slot.next_generation = slot.next_generation.wrapping_add(1);
        slot.entry = Some(Entry::new(id, String::new(), ServiceMask::empty()));
        id
    }

    /// Enlist a server under `id`, overwriting the slot's placeholder.
    ///
    /// The slot must be vacant or hold the placeholder installed by the
    /// `generate_id` call that produced `id`; during coordinator recovery
    /// the table is grown as needed when ids outrun it. `read_speed` is
    /// recorded only for backups. Commits and wakes the updater before
    /// returning.
    pub fn add(&self, id: ServerId, locator: &str, services: ServiceMask, read_speed: u32) {
        let mut inner = self.lock();
        add_locked(&mut inner, id, locator.to_string(), services, read_speed);
        self.commit_locked(&mut inner);
    }

    /// Mark a server crashed: its recovery is pending and its resources must
    /// be retained. No-op if already crashed.
    pub fn crashed(&self, id: ServerId) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        crashed_locked(&mut inner, id)?;
        self.commit_locked(&mut inner);
        Ok(())
    }

    /// Drop a server from the table once it is fully recovered. Runs the
    /// crash step first when the server is still up, so observers always see
    /// crashed before removed.
    pub fn remove(&self, id: ServerId) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        remove_locked(&mut inner, id)?;
        self.commit_locked(&mut inner);
        Ok(())
    }

    /// Snapshot of the entry enlisted under `id`.
    pub fn at(&self, id: ServerId) -> Result<Entry, RegistryError> {
        let inner = self.lock();
        entry_ref(&inner, id).cloned()
    }

    /// Snapshot of the entry at a table index, `None` for a vacant slot.
    pub fn entry_at(&self, index: u32) -> Result<Option<Entry>, RegistryError> {
        let inner = self.lock();
        match inner.slots.get(index as usize) {
            Some(slot) => Ok(slot.entry.clone()),
            None => Err(RegistryError::IndexOutOfRange {
                index,
                len: inner.slots.len(),
            }),
        }
    }

    /// Number of slots in the table, vacant ones included.
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().slots.is_empty()
    }

    /// Up masters; crashed entries do not count.
    pub fn master_count(&self) -> usize {
        self.lock().masters
    }

    /// Up backups; crashed entries do not count.
    pub fn backup_count(&self) -> usize {
        self.lock().backups
    }

    /// First index at or after `start` holding an up master.
    pub fn next_master_index(&self, start: u32) -> Option<u32> {
        self.next_index_with(start, ServiceKind::Master)
    }

    /// First index at or after `start` holding an up backup.
    pub fn next_backup_index(&self, start: u32) -> Option<u32> {
        self.next_index_with(start, ServiceKind::Backup)
    }

    fn next_index_with(&self, start: u32, kind: ServiceKind) -> Option<u32> {
        let inner = self.lock();
        inner
            .slots
            .iter()
            .enumerate()
            .skip(start as usize)
            .find_map(|(i, slot)| {
                let entry = slot.entry.as_ref()?;
                (entry.status == ServerStatus::Up && entry.services.has(kind))
                    .then_some(i as u32)
            })
    }

    /// Raise a server's minimum open segment id. Values at or below the
    /// current one leave it unchanged.
    pub fn set_min_open_segment_id(
        &self,
        id: ServerId,
        segment_id: u64,
    ) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        let entry = entry_mut(&mut inner, id)?;
        if entry.min_open_segment_id < segment_id {
            entry.min_open_segment_id = segment_id;
        }
        Ok(())
    }

    /// Assign a server's replication group id.
    pub fn set_replication_id(
        &self,
        id: ServerId,
        replication_id: u64,
    ) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        entry_mut(&mut inner, id)?.replication_id = replication_id;
        Ok(())
    }

    /// Record the recovery-log entry holding the server's enlistment record.
    pub fn set_info_log_id(&self, id: ServerId, log_id: LogEntryId) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        entry_mut(&mut inner, id)?.info_log_id = Some(log_id);
        Ok(())
    }

    pub fn info_log_id(&self, id: ServerId) -> Result<Option<LogEntryId>, RegistryError> {
        let inner = self.lock();
        Ok(entry_ref(&inner, id)?.info_log_id)
    }

    /// Record the recovery-log entry holding the server's latest update.
    pub fn set_update_log_id(&self, id: ServerId, log_id: LogEntryId) -> Result<(), RegistryError> {
        let mut inner = self.lock();
        entry_mut(&mut inner, id)?.update_log_id = Some(log_id);
        Ok(())
    }

    pub fn update_log_id(&self, id: ServerId) -> Result<Option<LogEntryId>, RegistryError> {
        let inner = self.lock();
        Ok(entry_ref(&inner, id)?.update_log_id)
    }

    /// Version of the most recent committed update.
    pub fn version(&self) -> u64 {
        self.lock().version
    }

    /// Register an observer. Trackers see every subsequent add/crash/remove
    /// in mutation order, while the registry lock is held.
    pub fn register_tracker(&self, tracker: Box<dyn Tracker>) {
        self.lock().trackers.push(tracker);
    }

    /// Full list of present master/backup entries at the current version.
    pub fn snapshot(&self) -> MembershipUpdate {
        self.snapshot_for(ServiceMask::of(&[ServiceKind::Master, ServiceKind::Backup]))
    }

    /// Full list restricted to entries advertising any of `services`
    /// (master/backup membership only, as on the wire).
    pub fn snapshot_for(&self, services: ServiceMask) -> MembershipUpdate {
        serialize_locked(&self.lock(), services)
    }

    /// True when every up membership subscriber has acked the current
    /// version and nothing is in flight.
    pub fn is_up_to_date(&self) -> bool {
        is_up_to_date_locked(&self.lock())
    }

    /// Block until the whole cluster is up to date. Needs a running updater
    /// to make progress.
    pub fn sync(&self) {
        let mut inner = self.lock();
        while !is_up_to_date_locked(&inner) {
            inner = self.shared.list_up_to_date.wait(inner).unwrap();
        }
    }

    /// Stamp and queue the in-progress delta, then wake the updater.
    /// Empty deltas are silently ignored.
    fn commit_locked(&self, inner: &mut RegistryInner) {
        if inner.delta.is_empty() {
            return;
        }
        inner.version += 1;
        let update = MembershipUpdate {
            servers: std::mem::take(&mut inner.delta),
            version_number: inner.version,
            kind: UpdateKind::Update,
        };
        inner.updates.push_back(update);
        inner.scan.no_updates_found = false;
        self.shared.has_updates_or_stop.notify_one();
    }

    /// Drop queued updates at or below `threshold`. Broadcasts quiescence
    /// when the queue drains.
    fn prune_locked(&self, inner: &mut RegistryInner, threshold: u64) {
        debug_assert!(threshold <= inner.version);
        while inner
            .updates
            .front()
            .is_some_and(|update| update.version_number <= threshold)
        {
            inner.updates.pop_front();
        }
        if inner.updates.is_empty() {
            self.shared.list_up_to_date.notify_all();
        }
    }

    /// Scan for a subscriber that is behind and not already being updated.
    ///
    /// Walks from the cursor, wrapping; crossing index 0 prunes the queue
    /// below the minimum acked version observed on the previous lap. On a
    /// hit the cursor is left at the hit index for `load_next_update`. A
    /// clean lap sets the no-updates hint so later calls return immediately
    /// until a commit or a regressed ack clears it.
    fn has_updates_locked(&self, inner: &mut RegistryInner) -> bool {
        if inner.scan.no_updates_found || inner.slots.is_empty() {
            return false;
        }

        let len = inner.slots.len();
        let start = inner.scan.search_index % len;
        let mut i = start;
        loop {
            if i == 0 {
                let threshold = inner.scan.min_version;
                self.prune_locked(inner, threshold);
                inner.scan.min_version = 0;
            }

            if let Some(entry) = inner.slots[i].entry.as_ref() {
                if entry.services.has(ServiceKind::Membership)
                    && entry.status == ServerStatus::Up
                {
                    // Acks of zero mean the subscriber needs a snapshot, not
                    // a delta, so they never constrain pruning.
                    if inner.scan.min_version == 0
                        || (entry.acked_version > 0
                            && entry.acked_version < inner.scan.min_version)
                    {
                        inner.scan.min_version = entry.acked_version;
                    }

                    if entry.acked_version != inner.version && !entry.update_in_flight {
                        inner.scan.search_index = i;
                        inner.scan.no_updates_found = false;
                        return true;
                    }
                }
            }

            i = (i + 1) % len;
            if i == start {
                break;
            }
        }

        inner.scan.no_updates_found = true;
        false
    }

    /// Pick the next subscriber needing an update and package the message
    /// for it: a fresh snapshot for never-acked subscribers, otherwise the
    /// queued delta immediately after its ack. Marks the entry in flight;
    /// the caller must follow up with `ack_entry` whatever happens.
    pub(crate) fn load_next_update(&self) -> Option<LoadedUpdate> {
        let mut inner = self.lock();
        if !self.has_updates_locked(&mut inner) {
            return None;
        }

        let index = inner.scan.search_index;
        let len = inner.slots.len();
        inner.scan.search_index = (index + 1) % len;

        let Some(entry) = inner.slots[index].entry.as_mut() else {
            return None;
        };
        entry.update_in_flight = true;
        let server_id = entry.server_id;
        let locator = entry.service_locator.clone();
        let original_version = entry.acked_version;

        let message = if original_version == 0 {
            serialize_locked(
                &inner,
                ServiceMask::of(&[ServiceKind::Master, ServiceKind::Backup]),
            )
        } else {
            let target = original_version + 1;
            match queued_delta(&inner, target) {
                Some(update) => update,
                None => {
                    // The queue cannot serve this delta; the subscriber is
                    // brought forward with a full list instead.
                    serialize_locked(
                        &inner,
                        ServiceMask::of(&[ServiceKind::Master, ServiceKind::Backup]),
                    )
                }
            }
        };

        Some(LoadedUpdate {
            server_id,
            locator,
            original_version,
            message,
        })
    }

    /// Record a subscriber's acked version and clear its in-flight flag.
    /// Ids that have since been removed are ignored.
    pub(crate) fn ack_entry(&self, id: ServerId, version: u64) {
        let mut inner = self.lock();
        let current = inner.version;
        let Ok(entry) = entry_mut(&mut inner, id) else {
            tracing::debug!(server = %id, "ack for a server no longer enlisted");
            return;
        };
        tracing::debug!(
            server = %id,
            from = entry.acked_version,
            to = version,
            "membership ack"
        );
        entry.acked_version = version;
        entry.update_in_flight = false;
        if version < current {
            inner.scan.no_updates_found = false;
        }
    }

    /// Park the updater until there is work or a stop request. Broadcasts
    /// quiescence each time the scan comes up empty.
    pub(crate) fn wait_for_updates(&self) {
        let mut inner = self.lock();
        while !self.has_updates_locked(&mut inner) && !inner.stop_updater {
            self.shared.list_up_to_date.notify_all();
            inner = self.shared.has_updates_or_stop.wait(inner).unwrap();
        }
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.lock().stop_updater
    }

    /// Clear the stop flag and nudge the updater awake.
    pub(crate) fn resume_updater(&self) {
        let mut inner = self.lock();
        inner.stop_updater = false;
        self.shared.has_updates_or_stop.notify_one();
    }

    /// Request the updater to stop and wake it if parked.
    pub(crate) fn request_stop(&self) {
        let mut inner = self.lock();
        inner.stop_updater = true;
        self.shared.has_updates_or_stop.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn queued_versions(&self) -> Vec<u64> {
        self.lock()
            .updates
            .iter()
            .map(|update| update.version_number)
            .collect()
    }
}

/// Smallest vacant index at or above 1, growing the table when full.
fn first_free_index(inner: &mut RegistryInner) -> usize {
    let mut index = 1;
    while index < inner.slots.len() && inner.slots[index].entry.is_some() {
        index += 1;
    }
    if index >= inner.slots.len() {
        inner.slots.resize_with(index + 1, Slot::default);
    }
    index
}

fn entry_ref<'a>(
    inner: &'a RegistryInner,
    id: ServerId,
) -> Result<&'a Entry, RegistryError> {
    match inner
        .slots
        .get(id.index() as usize)
        .and_then(|slot| slot.entry.as_ref())
    {
        Some(entry) if entry.server_id == id => Ok(entry),
        _ => Err(RegistryError::UnknownServer(id)),
    }
}

fn entry_mut<'a>(
    inner: &'a mut RegistryInner,
    id: ServerId,
) -> Result<&'a mut Entry, RegistryError> {
    match inner
        .slots
        .get_mut(id.index() as usize)
        .and_then(|slot| slot.entry.as_mut())
    {
        Some(entry) if entry.server_id == id => Ok(entry),
        _ => Err(RegistryError::UnknownServer(id)),
    }
}

fn add_locked(
    inner: &mut RegistryInner,
    id: ServerId,
    locator: String,
    services: ServiceMask,
    read_speed: u32,
) {
    let index = id.index() as usize;
    if index >= inner.slots.len() {
        inner.slots.resize_with(index + 1, Slot::default);
    }

    let mut entry = Entry::new(id, locator, services);
    if services.has(ServiceKind::Master) {
        inner.masters += 1;
    }
    if services.has(ServiceKind::Backup) {
        inner.backups += 1;
        entry.expected_read_mbytes_per_sec = read_speed;
    }

    let slot = &mut inner.slots[index];
    slot.next_generation = id.generation().wrapping_add(1);
    slot.entry = Some(entry.clone());

    tracing::debug!(server = %id, locator = %entry.service_locator, "server enlisted");
    inner.delta.push(entry.to_wire());
    notify_trackers(inner, &entry, ServerChangeKind::Added);
}

/// Flip an up server to crashed; an already-crashed server is left
/// untouched and nothing is recorded.
fn crashed_locked(inner: &mut RegistryInner, id: ServerId) -> Result<(), RegistryError> {
    let entry = entry_mut(inner, id)?;
    if entry.status == ServerStatus::Crashed {
        return Ok(());
    }
    debug_assert!(
        entry.status != ServerStatus::Down,
        "crash requested for a server already removed"
    );

    entry.status = ServerStatus::Crashed;
    let snapshot = entry.clone();

    if snapshot.is_master() {
        inner.masters -= 1;
    }
    if snapshot.is_backup() {
        inner.backups -= 1;
    }

    tracing::info!(server = %id, "server crashed");
    inner.delta.push(snapshot.to_wire());
    notify_trackers(inner, &snapshot, ServerChangeKind::Crashed);
    Ok(())
}

fn remove_locked(inner: &mut RegistryInner, id: ServerId) -> Result<(), RegistryError> {
    entry_ref(inner, id)?;
    crashed_locked(inner, id)?;

    let entry = entry_mut(inner, id)?;
    // The entry is destroyed right after, but the status still has to be
    // right in the serialized update.
    entry.status = ServerStatus::Down;
    let removed = entry.clone();

    inner.delta.push(removed.to_wire());
    inner.slots[id.index() as usize].entry = None;

    tracing::info!(server = %id, "server removed");
    notify_trackers(inner, &removed, ServerChangeKind::Removed);
    Ok(())
}

fn notify_trackers(inner: &mut RegistryInner, entry: &Entry, kind: ServerChangeKind) {
    for tracker in &mut inner.trackers {
        tracker.enqueue_change(entry, kind);
    }
    for tracker in &mut inner.trackers {
        tracker.fire_callback();
    }
}

/// Full list of present entries whose services intersect `services` on the
/// master/backup bits, stamped with the current version.
fn serialize_locked(inner: &RegistryInner, services: ServiceMask) -> MembershipUpdate {
    let mut servers = Vec::new();
    for slot in &inner.slots {
        let Some(entry) = slot.entry.as_ref() else {
            continue;
        };
        let wanted = (entry.services.has(ServiceKind::Master)
            && services.has(ServiceKind::Master))
            || (entry.services.has(ServiceKind::Backup) && services.has(ServiceKind::Backup));
        if wanted {
            servers.push(entry.to_wire());
        }
    }
    MembershipUpdate {
        servers,
        version_number: inner.version,
        kind: UpdateKind::FullList,
    }
}

/// The queued delta carrying exactly `target`, when the queue spans it.
fn queued_delta(inner: &RegistryInner, target: u64) -> Option<MembershipUpdate> {
    let head = inner.updates.front()?.version_number;
    if target < head {
        return None;
    }
    debug_assert!(inner
        .updates
        .back()
        .is_some_and(|update| update.version_number >= target));
    inner.updates.get((target - head) as usize).cloned()
}

fn is_up_to_date_locked(inner: &RegistryInner) -> bool {
    inner
        .slots
        .iter()
        .filter_map(|slot| slot.entry.as_ref())
        .all(|entry| {
            !(entry.services.has(ServiceKind::Membership)
                && entry.status == ServerStatus::Up
                && (entry.acked_version != inner.version || entry.update_in_flight))
        })
}
