//! Chunk file naming.
//!
//! Every chunk part is stored as two files under a `chunksNN` subfolder,
//! where `NN` is the second byte of the chunk id in uppercase hex:
//!
//! ```text
//! chunks01/chunk_0000000000010203_00000001.met
//! chunks01/chunk_xor_2_of_5_0000000000010203_00000001.dat
//! chunks01/chunk_ec2_1_of_8_2_0000000000010203_00000001.met
//! ```

use std::path::{Path, PathBuf};

use lazy_static::lazy_static;
use regex::Regex;

use sfs_api_types::{ChunkPartType, XOR_PARITY_PART};

pub const METADATA_EXTENSION: &str = "met";
pub const DATA_EXTENSION: &str = "dat";

pub const NUMBER_OF_SUBFOLDERS: u32 = 256;

pub fn subfolder_number(chunk_id: u64) -> u8 {
    ((chunk_id >> 16) & 0xff) as u8
}

pub fn subfolder_name(subfolder: u8) -> String {
    format!("chunks{subfolder:02X}")
}

pub fn subfolder_name_for_chunk_id(chunk_id: u64) -> String {
    subfolder_name(subfolder_number(chunk_id))
}

/// Builds the full path of a chunk file below `root` (the disk's meta or data
/// directory).
pub fn generate(
    root: &Path,
    chunk_id: u64,
    version: u32,
    ctype: ChunkPartType,
    is_for_metadata: bool,
) -> PathBuf {
    let extension = if is_for_metadata {
        METADATA_EXTENSION
    } else {
        DATA_EXTENSION
    };
    let name = format!(
        "chunk_{}{chunk_id:016X}_{version:08X}.{extension}",
        ctype.filename_tag()
    );

    let mut path = root.join(subfolder_name_for_chunk_id(chunk_id));
    path.push(name);
    path
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParsedChunkFilename {
    pub chunk_id: u64,
    pub version: u32,
    pub chunk_type: ChunkPartType,
    pub is_for_metadata: bool,
}

lazy_static! {
    static ref CHUNK_FILENAME_REGEX: Regex = Regex::new(
        r"^chunk_(?:xor_(?:parity_of_(?P<xpl>\d+)|(?P<xp>\d+)_of_(?P<xl>\d+))_|ec2_(?P<ecp>\d+)_of_(?P<ecd>\d+)_(?P<ecr>\d+)_)?(?P<id>[0-9A-F]{16})_(?P<ver>[0-9A-F]{8})\.(?P<ext>met|dat)$"
    )
    .unwrap();
}

/// Parses a chunk filename (no directory components). Returns `None` for
/// anything that is not a well-formed chunk file name.
pub fn parse(filename: &str) -> Option<ParsedChunkFilename> {
    let captures = CHUNK_FILENAME_REGEX.captures(filename)?;

    let chunk_type = if let Some(level) = captures.name("xpl") {
        ChunkPartType::xor(level.as_str().parse().ok()?, XOR_PARITY_PART).ok()?
    } else if let Some(level) = captures.name("xl") {
        let part: u8 = captures.name("xp")?.as_str().parse().ok()?;
        if part == XOR_PARITY_PART {
            return None;
        }
        ChunkPartType::xor(level.as_str().parse().ok()?, part).ok()?
    } else if let Some(data) = captures.name("ecd") {
        let part: u8 = captures.name("ecp")?.as_str().parse().ok()?;
        if part == 0 {
            return None;
        }
        ChunkPartType::ec(
            data.as_str().parse().ok()?,
            captures.name("ecr")?.as_str().parse().ok()?,
            part - 1,
        )
        .ok()?
    } else {
        ChunkPartType::standard()
    };

    Some(ParsedChunkFilename {
        chunk_id: u64::from_str_radix(captures.name("id")?.as_str(), 16).ok()?,
        version: u32::from_str_radix(captures.name("ver")?.as_str(), 16).ok()?,
        chunk_type,
        is_for_metadata: captures.name("ext")?.as_str() == METADATA_EXTENSION,
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn generate_and_parse_round_trip() {
        let types = [
            ChunkPartType::standard(),
            ChunkPartType::xor(5, 2).unwrap(),
            ChunkPartType::xor(5, XOR_PARITY_PART).unwrap(),
            ChunkPartType::ec(8, 2, 0).unwrap(),
            ChunkPartType::ec(8, 2, 9).unwrap(),
        ];
        for ctype in types {
            for is_meta in [true, false] {
                let path = generate(Path::new("/mnt/hdd0"), 0x12345678, 0x11, ctype, is_meta);
                assert!(path.starts_with("/mnt/hdd0/chunks34"));
                let name = path.file_name().unwrap().to_str().unwrap();
                let parsed = parse(name).expect(name);
                assert_eq!(parsed.chunk_id, 0x12345678);
                assert_eq!(parsed.version, 0x11);
                assert_eq!(parsed.chunk_type, ctype);
                assert_eq!(parsed.is_for_metadata, is_meta);
            }
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        for name in [
            "",
            ".",
            "..",
            "chunk_0000000000010203_00000001.tmp",
            "chunk_000000000001020_00000001.met",
            "chunk_xor_0_of_5_0000000000010203_00000001.met",
            "chunk_ec2_0_of_8_2_0000000000010203_00000001.met",
            "somefile.txt",
            "chunk_0000000000g10203_00000001.met",
        ] {
            assert!(parse(name).is_none(), "{name}");
        }
    }

    #[test]
    fn subfolders() {
        assert_eq!(subfolder_number(0x100), 0);
        assert_eq!(subfolder_number(0xAB0000), 0xAB);
        assert_eq!(subfolder_name(0xAB), "chunksAB");
    }
}
