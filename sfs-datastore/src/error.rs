use nix::errno::Errno;

/// Result of a chunk operation. None of these are fatal: the engine keeps
/// serving other chunks and the caller decides how to report the failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChunkOpError {
    #[error("no such chunk")]
    NoChunk,
    #[error("wrong chunk version")]
    WrongVersion,
    #[error("chunk already exists")]
    ChunkExists,
    #[error("no space for a new chunk")]
    NoSpace,
    #[error("crc mismatch")]
    Crc,
    #[error("wrong size")]
    WrongSize,
    #[error("wrong offset")]
    WrongOffset,
    #[error("block number too big")]
    BlockNumTooBig,
    #[error("timed out waiting for chunk lock")]
    Timeout,
    #[error("invalid operation arguments")]
    Invalid,
    #[error("I/O error: {0}")]
    Io(#[from] Errno),
}

impl From<std::io::Error> for ChunkOpError {
    fn from(err: std::io::Error) -> Self {
        ChunkOpError::Io(Errno::from_i32(err.raw_os_error().unwrap_or(libc::EIO)))
    }
}

impl ChunkOpError {
    /// The errno recorded in the disk error ring for this failure.
    pub fn errno(&self) -> i32 {
        match self {
            ChunkOpError::Io(errno) => *errno as i32,
            _ => 0,
        }
    }
}
