//! Wire forms for membership dissemination.
//!
//! These are the messages pushed to membership subscribers: either a full
//! list replacing whatever the receiver holds, or a delta to be applied on
//! top of the receiver's current version.

use serde::{Deserialize, Serialize};

/// How a `MembershipUpdate` is applied by the receiver.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UpdateKind {
    FullList,
    Update,
}

/// One serialized server record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireEntry {
    /// Service bits, see `ServiceMask::bits`.
    pub services: u32,
    /// Packed `ServerId`.
    pub server_id: u64,
    pub service_locator: String,
    /// 0 = up, 1 = crashed, 2 = down.
    pub status: u32,
    /// Always present; zero for non-backups.
    pub expected_read_mbytes_per_sec: u32,
}

/// A versioned membership message pushed to subscribers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipUpdate {
    #[serde(rename = "server")]
    pub servers: Vec<WireEntry>,
    pub version_number: u64,
    #[serde(rename = "type")]
    pub kind: UpdateKind,
}

impl MembershipUpdate {
    pub fn encode(&self) -> anyhow::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(data: &[u8]) -> anyhow::Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_the_stable_field_names() {
        let data = br#"{
            "server": [{
                "services": 5,
                "server_id": 4294967297,
                "service_locator": "tcp:host=a",
                "status": 0,
                "expected_read_mbytes_per_sec": 0
            }],
            "version_number": 3,
            "type": "UPDATE"
        }"#;
        let update = MembershipUpdate::decode(data).expect("decode");
        assert_eq!(update.version_number, 3);
        assert_eq!(update.kind, UpdateKind::Update);
        assert_eq!(update.servers.len(), 1);
        assert_eq!(update.servers[0].server_id, (1u64 << 32) | 1);

        let encoded = update.encode().expect("encode");
        let text = String::from_utf8(encoded).expect("utf8");
        assert!(text.contains("\"type\":\"UPDATE\""));
        assert!(text.contains("\"version_number\":3"));
    }
}
