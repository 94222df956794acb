//! CRC-32C checksums and the mask applied before a checksum is stored.
//!
//! Stored CRCs are masked so that computing the CRC of a byte run that
//! itself embeds CRCs does not degenerate. The mask is a rotation plus a
//! constant; an all-zero masked field never unmasks to the CRC of
//! all-zero data, which catches accidentally zeroed regions.

use crc::{Crc, CRC_32_ISCSI};

/// CRC-32C (Castagnoli), the checksum every on-disk structure uses.
pub const CASTAGNOLI: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

const MASK_DELTA: u32 = 0xa282ead8;

/// CRC-32C of `data`.
pub fn value(data: &[u8]) -> u32 {
    CASTAGNOLI.checksum(data)
}

/// CRC-32C of the concatenation of `parts`, without materializing it.
pub fn value_of_parts(parts: &[&[u8]]) -> u32 {
    let mut digest = CASTAGNOLI.digest();
    for part in parts {
        digest.update(part);
    }
    digest.finalize()
}

/// Masks a CRC for storage.
pub fn mask(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Inverse of [`mask`].
pub fn unmask(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}
