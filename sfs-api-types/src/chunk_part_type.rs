use std::fmt;

use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

use crate::SFSBLOCKSINCHUNK;

/// Part index reserved for the parity part of a XOR chunk.
pub const XOR_PARITY_PART: u8 = 0;

const XOR_MIN_LEVEL: u8 = 2;
const XOR_MAX_LEVEL: u8 = 10;
const EC_MIN_DATA_PARTS: u8 = 2;
const EC_MAX_DATA_PARTS: u8 = 32;
const EC_MIN_PARITY_PARTS: u8 = 1;
const EC_MAX_PARITY_PARTS: u8 = 16;

const TYPE_ID_STANDARD: u8 = 0;
const TYPE_ID_XOR: u8 = 1;
const TYPE_ID_EC: u8 = 2;

/// Identifies which part of a chunk a file on disk holds.
///
/// A chunk is either stored whole (`Standard`), split into XOR parts (one of
/// them being the parity), or split into Reed-Solomon data+parity parts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChunkPartType {
    Standard,
    /// `part` is [`XOR_PARITY_PART`] for the parity part, `1..=level` otherwise.
    Xor { level: u8, part: u8 },
    /// `part` indexes the data parts first, then the parity parts.
    Ec { data: u8, parity: u8, part: u8 },
}

impl ChunkPartType {
    pub fn standard() -> Self {
        ChunkPartType::Standard
    }

    pub fn xor(level: u8, part: u8) -> Result<Self, Error> {
        if !(XOR_MIN_LEVEL..=XOR_MAX_LEVEL).contains(&level) {
            bail!("xor level {level} out of range");
        }
        if part != XOR_PARITY_PART && part > level {
            bail!("xor part {part} out of range for level {level}");
        }
        Ok(ChunkPartType::Xor { level, part })
    }

    pub fn ec(data: u8, parity: u8, part: u8) -> Result<Self, Error> {
        if !(EC_MIN_DATA_PARTS..=EC_MAX_DATA_PARTS).contains(&data) {
            bail!("ec data part count {data} out of range");
        }
        if !(EC_MIN_PARITY_PARTS..=EC_MAX_PARITY_PARTS).contains(&parity) {
            bail!("ec parity part count {parity} out of range");
        }
        if part >= data + parity {
            bail!("ec part index {part} out of range for ec({data},{parity})");
        }
        Ok(ChunkPartType::Ec { data, parity, part })
    }

    /// Number of data parts the full chunk is split into.
    pub fn data_parts(&self) -> u32 {
        match self {
            ChunkPartType::Standard => 1,
            ChunkPartType::Xor { level, .. } => u32::from(*level),
            ChunkPartType::Ec { data, .. } => u32::from(*data),
        }
    }

    /// Maximum number of blocks a part of this type can hold.
    pub fn max_blocks_in_file(&self) -> u32 {
        let data_parts = self.data_parts();
        (SFSBLOCKSINCHUNK + data_parts - 1) / data_parts
    }

    /// On-disk encoding: one type-id byte followed by the variant parameters.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            ChunkPartType::Standard => out.push(TYPE_ID_STANDARD),
            ChunkPartType::Xor { level, part } => {
                out.extend_from_slice(&[TYPE_ID_XOR, *level, *part]);
            }
            ChunkPartType::Ec { data, parity, part } => {
                out.extend_from_slice(&[TYPE_ID_EC, *data, *parity, *part]);
            }
        }
    }

    /// Decodes [`Self::encode`] output, returning the type and consumed length.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), Error> {
        match buf.first() {
            Some(&TYPE_ID_STANDARD) => Ok((ChunkPartType::Standard, 1)),
            Some(&TYPE_ID_XOR) => {
                if buf.len() < 3 {
                    bail!("truncated xor chunk type encoding");
                }
                Ok((Self::xor(buf[1], buf[2])?, 3))
            }
            Some(&TYPE_ID_EC) => {
                if buf.len() < 4 {
                    bail!("truncated ec chunk type encoding");
                }
                Ok((Self::ec(buf[1], buf[2], buf[3])?, 4))
            }
            Some(id) => bail!("unknown chunk type id {id}"),
            None => bail!("empty chunk type encoding"),
        }
    }

    /// Compact 16-bit form used by metadata cache records and master reports.
    pub fn to_u16(&self) -> u16 {
        match self {
            ChunkPartType::Standard => 0,
            ChunkPartType::Xor { level, part } => {
                0x1000 | (u16::from(*level) << 8) | u16::from(*part)
            }
            ChunkPartType::Ec { data, parity, part } => {
                0x8000
                    | (u16::from(data - 2) << 10)
                    | (u16::from(parity - 1) << 6)
                    | u16::from(*part)
            }
        }
    }

    pub fn from_u16(value: u16) -> Result<Self, Error> {
        let decoded = if value == 0 {
            ChunkPartType::Standard
        } else if value & 0x8000 != 0 {
            let data = ((value >> 10) & 0x1f) as u8 + 2;
            let parity = ((value >> 6) & 0x0f) as u8 + 1;
            let part = (value & 0x3f) as u8;
            Self::ec(data, parity, part)?
        } else if value & 0x1000 != 0 {
            let level = ((value >> 8) & 0x0f) as u8;
            let part = (value & 0xff) as u8;
            Self::xor(level, part)?
        } else {
            bail!("invalid packed chunk type {value:#06x}")
        };
        if decoded.to_u16() != value {
            bail!("invalid packed chunk type {value:#06x}");
        }
        Ok(decoded)
    }

    /// The type marker embedded in chunk filenames, empty for standard chunks.
    pub fn filename_tag(&self) -> String {
        match self {
            ChunkPartType::Standard => String::new(),
            ChunkPartType::Xor { level, part } if *part == XOR_PARITY_PART => {
                format!("xor_parity_of_{level}_")
            }
            ChunkPartType::Xor { level, part } => format!("xor_{part}_of_{level}_"),
            ChunkPartType::Ec { data, parity, part } => {
                format!("ec2_{}_of_{}_{}_", part + 1, data, parity)
            }
        }
    }
}

impl fmt::Display for ChunkPartType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChunkPartType::Standard => write!(f, "standard"),
            ChunkPartType::Xor { level, part } if *part == XOR_PARITY_PART => {
                write!(f, "xor_parity_of_{level}")
            }
            ChunkPartType::Xor { level, part } => write!(f, "xor_{part}_of_{level}"),
            ChunkPartType::Ec { data, parity, part } => {
                write!(f, "ec({data},{parity})_part_{part}")
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_types() -> Vec<ChunkPartType> {
        let mut types = vec![ChunkPartType::standard()];
        for level in XOR_MIN_LEVEL..=XOR_MAX_LEVEL {
            for part in 0..=level {
                types.push(ChunkPartType::xor(level, part).unwrap());
            }
        }
        for (data, parity) in [(2, 1), (3, 2), (8, 2), (32, 16)] {
            for part in 0..data + parity {
                types.push(ChunkPartType::ec(data, parity, part).unwrap());
            }
        }
        types
    }

    #[test]
    fn encoding_round_trips() {
        for ctype in sample_types() {
            let mut buf = Vec::new();
            ctype.encode(&mut buf);
            let (decoded, used) = ChunkPartType::decode(&buf).unwrap();
            assert_eq!(decoded, ctype);
            assert_eq!(used, buf.len());

            assert_eq!(ChunkPartType::from_u16(ctype.to_u16()).unwrap(), ctype);
        }
    }

    #[test]
    fn max_blocks() {
        assert_eq!(ChunkPartType::standard().max_blocks_in_file(), 1024);
        assert_eq!(ChunkPartType::xor(3, 1).unwrap().max_blocks_in_file(), 342);
        assert_eq!(ChunkPartType::ec(4, 2, 5).unwrap().max_blocks_in_file(), 256);
        assert_eq!(ChunkPartType::ec(32, 16, 0).unwrap().max_blocks_in_file(), 32);
    }

    #[test]
    fn rejects_out_of_range_parameters() {
        assert!(ChunkPartType::xor(1, 0).is_err());
        assert!(ChunkPartType::xor(11, 0).is_err());
        assert!(ChunkPartType::xor(4, 5).is_err());
        assert!(ChunkPartType::ec(1, 1, 0).is_err());
        assert!(ChunkPartType::ec(2, 17, 0).is_err());
        assert!(ChunkPartType::ec(2, 1, 3).is_err());
        assert!(ChunkPartType::decode(&[7]).is_err());
        assert!(ChunkPartType::from_u16(0x4242).is_err());
    }

    #[test]
    fn filename_tags() {
        assert_eq!(ChunkPartType::standard().filename_tag(), "");
        assert_eq!(
            ChunkPartType::xor(5, 2).unwrap().filename_tag(),
            "xor_2_of_5_"
        );
        assert_eq!(
            ChunkPartType::xor(5, XOR_PARITY_PART).unwrap().filename_tag(),
            "xor_parity_of_5_"
        );
        assert_eq!(
            ChunkPartType::ec(8, 2, 0).unwrap().filename_tag(),
            "ec2_1_of_8_2_"
        );
    }
}
