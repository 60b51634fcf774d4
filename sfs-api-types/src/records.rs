use serde::{Deserialize, Serialize};

use crate::ChunkPartType;

const TODEL_FLAG: u32 = 0x8000_0000;

/// One entry of the damaged/lost report queues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkWithType {
    pub id: u64,
    pub chunk_type: ChunkPartType,
}

/// One entry of the new-chunks report queue. The version carries the to-del
/// flag in its top bit, see [`combine_version_with_todel_flag`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkWithVersionAndType {
    pub id: u64,
    pub version: u32,
    pub chunk_type: ChunkPartType,
}

/// Marks a chunk version as residing on a disk scheduled for deletion.
pub fn combine_version_with_todel_flag(version: u32, todel: bool) -> u32 {
    if todel {
        version | TODEL_FLAG
    } else {
        version & !TODEL_FLAG
    }
}

pub fn split_version_and_todel_flag(combined: u32) -> (u32, bool) {
    (combined & !TODEL_FLAG, combined & TODEL_FLAG != 0)
}

/// Space accounting summary sent to the master, split between regular disks
/// and disks marked for deletion.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpaceUsage {
    pub used_space: u64,
    pub total_space: u64,
    pub chunk_count: u32,
    pub to_del_used_space: u64,
    pub to_del_total_space: u64,
    pub to_del_chunk_count: u32,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn todel_flag_round_trip() {
        let combined = combine_version_with_todel_flag(7, true);
        assert_eq!(split_version_and_todel_flag(combined), (7, true));
        let combined = combine_version_with_todel_flag(7, false);
        assert_eq!(split_version_and_todel_flag(combined), (7, false));
    }
}
