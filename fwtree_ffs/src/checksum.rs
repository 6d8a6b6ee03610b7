//! Additive checksums used by FFS structures.
//!
//! Both are two's-complement sums: adding the stored checksum back over
//! the covered bytes yields zero.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

/// 8-bit additive checksum: `-sum(bytes) mod 256`.
pub fn checksum8(data: &[u8]) -> u8 {
    0u8.wrapping_sub(data.iter().fold(0u8, |sum, &b| sum.wrapping_add(b)))
}

/// 16-bit additive checksum over little-endian words. A trailing odd byte
/// is ignored, matching the header structures this is applied to (all of
/// which are even-sized).
pub fn checksum16(data: &[u8]) -> u16 {
    0u16.wrapping_sub(
        data.chunks_exact(2).fold(0u16, |sum, w| sum.wrapping_add(u16::from_le_bytes(w.try_into().unwrap()))),
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn checksum8_balances_to_zero() {
        let data = [0x12u8, 0x34, 0x56, 0x78];
        let checksum = checksum8(&data);
        let total = data.iter().fold(checksum, |sum, &b| sum.wrapping_add(b));
        assert_eq!(total, 0);
        assert_eq!(checksum8(&[]), 0);
    }

    #[test]
    fn checksum16_balances_to_zero() {
        let data = [0xAAu8, 0x00, 0x55, 0xFF, 0x01, 0x02];
        let checksum = checksum16(&data);
        let total = data
            .chunks_exact(2)
            .fold(checksum, |sum, w| sum.wrapping_add(u16::from_le_bytes(w.try_into().unwrap())));
        assert_eq!(total, 0);
    }

    #[test]
    fn checksum16_is_little_endian() {
        assert_eq!(checksum16(&[0x01, 0x00]), 0u16.wrapping_sub(0x0001));
        assert_eq!(checksum16(&[0x00, 0x01]), 0u16.wrapping_sub(0x0100));
    }
}
