//! Per-server records kept by the coordinator.

use crate::id::ServerId;
use crate::wire::WireEntry;

/// Roles a server can advertise when it enlists.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServiceKind {
    Master,
    Backup,
    Membership,
    Ping,
}

impl ServiceKind {
    const fn bit(self) -> u32 {
        match self {
            ServiceKind::Master => 1 << 0,
            ServiceKind::Backup => 1 << 1,
            ServiceKind::Membership => 1 << 2,
            ServiceKind::Ping => 1 << 3,
        }
    }
}

/// Bitset over `ServiceKind`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServiceMask {
    bits: u32,
}

impl ServiceMask {
    pub const fn empty() -> Self {
        Self { bits: 0 }
    }

    pub fn of(kinds: &[ServiceKind]) -> Self {
        let mut mask = Self::empty();
        for kind in kinds {
            mask.bits |= kind.bit();
        }
        mask
    }

    pub const fn has(self, kind: ServiceKind) -> bool {
        self.bits & kind.bit() != 0
    }

    /// Raw bits as written to the wire.
    pub const fn bits(self) -> u32 {
        self.bits
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self { bits }
    }
}

/// Lifecycle status of an enlisted server. Transitions are forward-only:
/// `Up` to `Crashed` to `Down`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ServerStatus {
    Up,
    Crashed,
    Down,
}

impl ServerStatus {
    pub(crate) const fn wire_code(self) -> u32 {
        match self {
            ServerStatus::Up => 0,
            ServerStatus::Crashed => 1,
            ServerStatus::Down => 2,
        }
    }
}

/// Opaque handle to an entry in the coordinator's recovery log.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogEntryId(pub u64);

/// Everything the coordinator tracks about one enlisted server.
///
/// Registry lookups return copies of this record; mutation happens only
/// through `ServerRegistry` operations.
#[derive(Clone, Debug)]
pub struct Entry {
    pub server_id: ServerId,
    /// Opaque locator string used to address the server.
    pub service_locator: String,
    pub services: ServiceMask,
    pub status: ServerStatus,
    /// Read bandwidth advertised by backups, in MB/s. Zero for non-backups.
    pub expected_read_mbytes_per_sec: u32,
    /// Lowest segment id the server may still hold open. Never decreases.
    pub min_open_segment_id: u64,
    pub replication_id: u64,
    /// Highest membership version this server has confirmed receiving.
    /// Zero means it has never been sent one.
    pub acked_version: u64,
    /// True while the dispatcher owns an outstanding push RPC for this entry.
    pub update_in_flight: bool,
    /// Recovery-log entry holding the server's enlistment record.
    pub info_log_id: Option<LogEntryId>,
    /// Recovery-log entry holding the server's latest update record.
    pub update_log_id: Option<LogEntryId>,
}

impl Entry {
    pub(crate) fn new(server_id: ServerId, service_locator: String, services: ServiceMask) -> Self {
        Self {
            server_id,
            service_locator,
            services,
            status: ServerStatus::Up,
            expected_read_mbytes_per_sec: 0,
            min_open_segment_id: 0,
            replication_id: 0,
            acked_version: 0,
            update_in_flight: false,
            info_log_id: None,
            update_log_id: None,
        }
    }

    pub fn is_master(&self) -> bool {
        self.services.has(ServiceKind::Master)
    }

    pub fn is_backup(&self) -> bool {
        self.services.has(ServiceKind::Backup)
    }

    pub(crate) fn to_wire(&self) -> WireEntry {
        WireEntry {
            services: self.services.bits(),
            server_id: self.server_id.packed(),
            service_locator: self.service_locator.clone(),
            status: self.status.wire_code(),
            // Receivers expect the field even for non-backups.
            expected_read_mbytes_per_sec: if self.is_backup() {
                self.expected_read_mbytes_per_sec
            } else {
                0
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_membership() {
        let mask = ServiceMask::of(&[ServiceKind::Master, ServiceKind::Membership]);
        assert!(mask.has(ServiceKind::Master));
        assert!(mask.has(ServiceKind::Membership));
        assert!(!mask.has(ServiceKind::Backup));
        assert_eq!(ServiceMask::from_bits(mask.bits()), mask);
    }

    #[test]
    fn wire_form_zeroes_read_speed_for_non_backups() {
        let mut entry = Entry::new(
            ServerId::new(1, 0),
            "tcp:host=a".to_string(),
            ServiceMask::of(&[ServiceKind::Master]),
        );
        entry.expected_read_mbytes_per_sec = 500;
        let wire = entry.to_wire();
        assert_eq!(wire.expected_read_mbytes_per_sec, 0);
        assert_eq!(wire.server_id, ServerId::new(1, 0).packed());
        assert_eq!(wire.status, 0);
    }

    #[test]
    fn wire_form_carries_backup_read_speed() {
        let mut entry = Entry::new(
            ServerId::new(2, 1),
            "tcp:host=b".to_string(),
            ServiceMask::of(&[ServiceKind::Backup]),
        );
        entry.expected_read_mbytes_per_sec = 480;
        entry.status = ServerStatus::Crashed;
        let wire = entry.to_wire();
        assert_eq!(wire.expected_read_mbytes_per_sec, 480);
        assert_eq!(wire.status, 1);
    }
}
