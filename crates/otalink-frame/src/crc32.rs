//! CRC-32 (IEEE 802.3, reflected polynomial `0xEDB88320`).
//!
//! The one-shot [`crc32`] is what the frame codec uses. [`update`] and
//! [`finalize`] allow checksumming data that arrives in pieces.

/// Reflected IEEE polynomial.
pub const POLYNOMIAL: u32 = 0xEDB8_8320;

/// Initial register value for an incremental computation.
pub const CRC32_INIT: u32 = 0xFFFF_FFFF;

static TABLE: [u32; 256] = build_table();

const fn build_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut crc = i as u32;
        let mut bit = 0;
        while bit < 8 {
            crc = if crc & 1 != 0 {
                (crc >> 1) ^ POLYNOMIAL
            } else {
                crc >> 1
            };
            bit += 1;
        }
        table[i] = crc;
        i += 1;
    }
    table
}

/// Fold `data` into a running register. No final XOR is applied.
pub fn update(data: &[u8], running: u32) -> u32 {
    data.iter().fold(running, |crc, &b| {
        TABLE[((crc ^ b as u32) & 0xFF) as usize] ^ (crc >> 8)
    })
}

/// Apply the final XOR to a running register.
pub fn finalize(running: u32) -> u32 {
    running ^ 0xFFFF_FFFF
}

/// Checksum of `data` starting from `initial`, final XOR applied.
///
/// Pass [`CRC32_INIT`] for a standalone checksum, or an unfinalized running
/// register to continue one.
pub fn crc32(data: &[u8], initial: u32) -> u32 {
    finalize(update(data, initial))
}
