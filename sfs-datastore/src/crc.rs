//! CRC32 helpers for the per-block checksums.
//!
//! The on-disk checksum is the standard CRC-32 (polynomial 0xEDB88320, the
//! same one zlib uses). `crc32_combine` implements the GF(2) matrix trick so
//! partial-block writes can splice a new slice checksum into an existing
//! block checksum without re-reading the unchanged bytes.

use once_cell::sync::Lazy;

use crate::SFSBLOCKSIZE;

const CRC_POLY: u32 = 0xEDB8_8320;

/// CRC32 of a full block of zeros, used for backfilled and sparse blocks.
pub static EMPTY_BLOCK_CRC: Lazy<u32> = Lazy::new(|| crc32_zeros(SFSBLOCKSIZE as usize));

pub fn crc32(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// Continues a running CRC with more data.
pub fn crc32_continue(crc: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(crc);
    hasher.update(data);
    hasher.finalize()
}

/// CRC32 of `len` zero bytes.
pub fn crc32_zeros(mut len: usize) -> u32 {
    static ZEROES: [u8; 4096] = [0u8; 4096];
    let mut hasher = crc32fast::Hasher::new();
    while len > 0 {
        let step = len.min(ZEROES.len());
        hasher.update(&ZEROES[..step]);
        len -= step;
    }
    hasher.finalize()
}

/// CRC of `data` followed by `zeros` zero bytes, given `crc = crc32(data)`.
pub fn crc32_zero_expanded(crc: u32, zeros: usize) -> u32 {
    crc32_combine(crc, crc32_zeros(zeros), zeros as u64)
}

fn gf2_matrix_times(mat: &[u32; 32], mut vec: u32) -> u32 {
    let mut sum = 0;
    let mut index = 0;
    while vec != 0 {
        if vec & 1 != 0 {
            sum ^= mat[index];
        }
        vec >>= 1;
        index += 1;
    }
    sum
}

fn gf2_matrix_square(square: &mut [u32; 32], mat: &[u32; 32]) {
    for n in 0..32 {
        square[n] = gf2_matrix_times(mat, mat[n]);
    }
}

/// `crc32(a ++ b)` from `crc1 = crc32(a)`, `crc2 = crc32(b)` and `len2 = b.len()`.
pub fn crc32_combine(crc1: u32, crc2: u32, mut len2: u64) -> u32 {
    if len2 == 0 {
        return crc1;
    }

    let mut even = [0u32; 32]; // operator for 2^n zero bytes
    let mut odd = [0u32; 32];

    // operator for one zero bit
    odd[0] = CRC_POLY;
    let mut row: u32 = 1;
    for entry in odd.iter_mut().skip(1) {
        *entry = row;
        row <<= 1;
    }

    // put operator for one zero byte in even, two in odd
    gf2_matrix_square(&mut even, &odd);
    gf2_matrix_square(&mut odd, &even);

    let mut crc1 = crc1;
    loop {
        gf2_matrix_square(&mut even, &odd);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&even, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }

        gf2_matrix_square(&mut odd, &even);
        if len2 & 1 != 0 {
            crc1 = gf2_matrix_times(&odd, crc1);
        }
        len2 >>= 1;
        if len2 == 0 {
            break;
        }
    }

    crc1 ^ crc2
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn combine_matches_direct_computation() {
        let data: Vec<u8> = (0..100_000u32).map(|v| (v * 31 % 251) as u8).collect();
        for split in [0usize, 1, 63, 64, 65, 4096, 65535, 65536, 99_999, 100_000] {
            let (left, right) = data.split_at(split);
            assert_eq!(
                crc32_combine(crc32(left), crc32(right), right.len() as u64),
                crc32(&data),
                "split at {split}"
            );
        }
    }

    #[test]
    fn zero_expansion_matches_direct_computation() {
        let data = b"partial tail of a truncated block";
        let mut padded = data.to_vec();
        padded.resize(data.len() + 12345, 0);
        assert_eq!(crc32_zero_expanded(crc32(data), 12345), crc32(&padded));
    }

    #[test]
    fn empty_block_crc() {
        assert_eq!(*EMPTY_BLOCK_CRC, crc32(&vec![0u8; SFSBLOCKSIZE as usize]));
        assert_eq!(crc32_zeros(0), 0);
    }

    #[test]
    fn continue_matches_one_shot() {
        let data = b"0123456789abcdef";
        assert_eq!(crc32_continue(crc32(&data[..7]), &data[7..]), crc32(data));
    }
}
