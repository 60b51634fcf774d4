//! SaunaFS chunk server.
//!
//! This crate wires the storage engine ([`sfs_datastore`]) to the daemon
//! surface: configuration file ingestion and the re-exported engine API the
//! network layers drive.

pub mod cfg;

pub use sfs_api_types::{
    ChunkPartType, ChunkWithType, ChunkWithVersionAndType, SpaceUsage, SFSBLOCKSINCHUNK,
    SFSBLOCKSIZE, SFSCHUNKSIZE,
};
pub use sfs_datastore::{ChunkOpError, HddConfig, HddEngine};
