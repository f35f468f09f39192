//! Serialized form of a tree node.
//!
//! A node record holds the stat, the ordinary xattrs, the content-chunk
//! references, and the child references (name plus storage key, sorted by
//! name). Records are bincode-encoded and stored in the CAS like any other
//! blob, which is what makes the tree a Merkle tree: a node's key covers
//! its entire subtree.

use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use serde::Deserialize;
use serde::Serialize;

use crate::mode::FileMode;
use crate::store::Key;

#[derive(Serialize, Deserialize)]
pub(crate) struct NodeRecord {
    pub stat: StatRecord,
    pub xattrs: Vec<(String, Vec<u8>)>,
    pub blocks: Vec<BlockRecord>,
    pub children: Vec<ChildRecord>,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct StatRecord {
    pub mode: FileMode,
    pub mtime_secs: i64,
    pub mtime_nanos: u32,
    pub owner_id: u32,
    pub group_id: u32,
}

#[derive(Serialize, Deserialize, Clone, Copy)]
pub(crate) struct BlockRecord {
    pub key: Key,
    pub size: u64,
}

#[derive(Serialize, Deserialize)]
pub(crate) struct ChildRecord {
    pub name: String,
    pub key: Key,
}

/// Signed seconds plus nanoseconds since the epoch, negative before it.
pub(crate) fn time_to_wire(time: SystemTime) -> (i64, u32) {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos()),
        Err(before) => (
            -(before.duration().as_secs() as i64),
            before.duration().subsec_nanos(),
        ),
    }
}

pub(crate) fn time_from_wire(secs: i64, nanos: u32) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nanos)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, nanos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_round_trips() {
        let now = SystemTime::now();
        let (secs, nanos) = time_to_wire(now);
        assert_eq!(time_from_wire(secs, nanos), now);
    }

    #[test]
    fn pre_epoch_times_survive() {
        let t = UNIX_EPOCH - Duration::new(5, 250);
        let (secs, nanos) = time_to_wire(t);
        assert!(secs < 0);
        assert_eq!(time_from_wire(secs, nanos), t);
    }
}
