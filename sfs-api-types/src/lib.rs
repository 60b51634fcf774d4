//! Types shared between the chunk server storage engine and the layers that
//! talk to the master (registration, reports, space accounting).

mod chunk_part_type;
mod records;

pub use chunk_part_type::{ChunkPartType, XOR_PARITY_PART};
pub use records::{
    combine_version_with_todel_flag, split_version_and_todel_flag, ChunkWithType,
    ChunkWithVersionAndType, SpaceUsage,
};

/// Size of one chunk block, the unit of CRC.
pub const SFSBLOCKSIZE: u32 = 65536;

/// Number of blocks in a full (standard) chunk.
pub const SFSBLOCKSINCHUNK: u32 = 1024;

/// Maximum size of the data carried by one chunk (64 MiB).
pub const SFSCHUNKSIZE: u32 = SFSBLOCKSIZE * SFSBLOCKSINCHUNK;
