//! Signature block opening every chunk metadata file.
//!
//! Layout of the first [`SIGNATURE_BLOCK_SIZE`](crate::SIGNATURE_BLOCK_SIZE)
//! bytes, zero padded:
//!
//! ```text
//! offset  0: magic  b"SAUC 1.0"
//! offset  8: chunk id, u64 BE
//! offset 16: chunk version, u32 BE
//! offset 20: chunk part type encoding (1..4 bytes)
//! ```

use std::os::unix::io::RawFd;

use nix::sys::uio::pread;

use sfs_api_types::ChunkPartType;

use crate::error::ChunkOpError;

pub const SIGNATURE_MAGIC: &[u8; 8] = b"SAUC 1.0";

/// Byte offset of the version field, the only field rewritten in place.
pub const VERSION_OFFSET: i64 = 16;

const MAX_SERIALIZED_SIZE: usize = 8 + 8 + 4 + 4;

#[derive(Clone, Debug)]
pub struct ChunkSignature {
    chunk_id: u64,
    chunk_version: u32,
    chunk_type: ChunkPartType,
    has_valid_magic: bool,
}

impl ChunkSignature {
    pub fn new(chunk_id: u64, chunk_version: u32, chunk_type: ChunkPartType) -> Self {
        Self {
            chunk_id,
            chunk_version,
            chunk_type,
            has_valid_magic: true,
        }
    }

    pub fn chunk_id(&self) -> u64 {
        self.chunk_id
    }

    pub fn chunk_version(&self) -> u32 {
        self.chunk_version
    }

    pub fn chunk_type(&self) -> ChunkPartType {
        self.chunk_type
    }

    pub fn has_valid_magic(&self) -> bool {
        self.has_valid_magic
    }

    pub fn serialize(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(SIGNATURE_MAGIC);
        out.extend_from_slice(&self.chunk_id.to_be_bytes());
        out.extend_from_slice(&self.chunk_version.to_be_bytes());
        self.chunk_type.encode(out);
    }

    pub fn deserialize(buffer: &[u8]) -> Result<Self, ChunkOpError> {
        if buffer.len() < MAX_SERIALIZED_SIZE {
            return Err(ChunkOpError::Io(nix::errno::Errno::EIO));
        }

        let has_valid_magic = &buffer[..8] == SIGNATURE_MAGIC;
        let chunk_id = u64::from_be_bytes(buffer[8..16].try_into().unwrap());
        let chunk_version = u32::from_be_bytes(buffer[16..20].try_into().unwrap());
        let chunk_type = if has_valid_magic {
            ChunkPartType::decode(&buffer[20..])
                .map_err(|_| ChunkOpError::Io(nix::errno::Errno::EIO))?
                .0
        } else {
            ChunkPartType::standard()
        };

        Ok(Self {
            chunk_id,
            chunk_version,
            chunk_type,
            has_valid_magic,
        })
    }

    /// Reads the signature from an open metadata file descriptor.
    pub fn read_from_fd(fd: RawFd, offset: i64) -> Result<Self, ChunkOpError> {
        let mut buffer = [0u8; MAX_SERIALIZED_SIZE];
        let bytes_read = pread(fd, &mut buffer, offset)?;
        if bytes_read != buffer.len() {
            return Err(ChunkOpError::Io(nix::errno::Errno::EIO));
        }
        Self::deserialize(&buffer)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn serialize_deserialize_round_trip() {
        for ctype in [
            ChunkPartType::standard(),
            ChunkPartType::xor(3, 0).unwrap(),
            ChunkPartType::ec(8, 2, 4).unwrap(),
        ] {
            let signature = ChunkSignature::new(0xDEAD_BEEF_0001, 42, ctype);
            let mut buffer = Vec::new();
            signature.serialize(&mut buffer);
            assert_eq!(&buffer[..8], SIGNATURE_MAGIC);

            buffer.resize(MAX_SERIALIZED_SIZE, 0);
            let parsed = ChunkSignature::deserialize(&buffer).unwrap();
            assert!(parsed.has_valid_magic());
            assert_eq!(parsed.chunk_id(), 0xDEAD_BEEF_0001);
            assert_eq!(parsed.chunk_version(), 42);
            assert_eq!(parsed.chunk_type(), ctype);
        }
    }

    #[test]
    fn version_offset_matches_layout() {
        let signature = ChunkSignature::new(1, 0x0102_0304, ChunkPartType::standard());
        let mut buffer = Vec::new();
        signature.serialize(&mut buffer);
        assert_eq!(
            &buffer[VERSION_OFFSET as usize..VERSION_OFFSET as usize + 4],
            &[1, 2, 3, 4]
        );
    }

    #[test]
    fn bad_magic_is_detected() {
        let buffer = [0u8; MAX_SERIALIZED_SIZE];
        let parsed = ChunkSignature::deserialize(&buffer).unwrap();
        assert!(!parsed.has_valid_magic());
    }
}
