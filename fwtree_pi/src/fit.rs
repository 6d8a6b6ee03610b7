//! Firmware Interface Table (FIT) and Boot Guard structure definitions.
//!
//! The FIT is a table of physical-address records placed below 4 GiB and
//! referenced from a fixed pointer near the top of the flash. Several of
//! its entry types point at Boot Guard artifacts: the startup ACM, the key
//! manifest, and the boot policy manifest with its IBB protected ranges.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

/// FIT table signature, stored in the first entry.
pub const FIT_SIGNATURE: [u8; 8] = *b"_FIT_   ";
/// Offset of the FIT pointer, counted back from the end of the last VTF.
pub const FIT_POINTER_OFFSET: usize = 0x40;

/// FIT entry types (low 7 bits of the type byte).
pub mod entry_type {
    pub const HEADER: u8 = 0x00;
    pub const MICROCODE: u8 = 0x01;
    pub const BIOS_AC_MODULE: u8 = 0x02;
    pub const BIOS_INIT_MODULE: u8 = 0x07;
    pub const TPM_POLICY: u8 = 0x08;
    pub const BIOS_POLICY_DATA: u8 = 0x09;
    pub const TXT_CONF_POLICY: u8 = 0x0A;
    pub const AC_KEY_MANIFEST: u8 = 0x0B;
    pub const AC_BOOT_POLICY: u8 = 0x0C;
    pub const EMPTY: u8 = 0x7F;
}

/// Checksum-valid flag in the entry type byte.
pub const FIT_ENTRY_CHECKSUM_VALID: u8 = 0x80;

/// One 16-byte FIT entry.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FitEntry {
    /// Physical address of the component (or the signature for the header)
    pub address: u64,
    /// 24-bit size in 16-byte units for the header, bytes otherwise
    pub size: [u8; 3],
    pub reserved: u8,
    pub version: u16,
    /// Type byte; bit 7 flags a valid checksum
    pub entry_type: u8,
    pub checksum: u8,
}

impl FitEntry {
    pub const SIZE: usize = 16;

    /// Entry type with the checksum flag stripped.
    pub fn type_masked(&self) -> u8 {
        self.entry_type & 0x7F
    }

    /// Whether the checksum byte is meaningful for this entry.
    pub fn checksum_valid(&self) -> bool {
        self.entry_type & FIT_ENTRY_CHECKSUM_VALID != 0
    }

    /// The 24-bit size field as a u32.
    pub fn size24(&self) -> u32 {
        u32::from_le_bytes([self.size[0], self.size[1], self.size[2], 0])
    }
}

/// Intel microcode update header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MicrocodeHeader {
    pub header_version: u32,
    pub update_revision: u32,
    pub date: u32,
    pub processor_signature: u32,
    pub checksum: u32,
    pub loader_revision: u32,
    pub processor_flags: u32,
    pub data_size: u32,
    pub total_size: u32,
    pub reserved: [u32; 3],
}

/// Only defined value of `MicrocodeHeader::header_version`.
pub const MICROCODE_HEADER_VERSION: u32 = 0x0000_0001;
/// Only defined value of `MicrocodeHeader::loader_revision`.
pub const MICROCODE_LOADER_REVISION: u32 = 0x0000_0001;

/// Leading fields of an Authenticated Code Module.
///
/// The RSA public key and signature follow at fixed offsets; their sizes
/// come from `key_size` (in dwords).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AcmHeader {
    pub module_type: u16,
    pub module_subtype: u16,
    /// Header length in dwords
    pub header_length: u32,
    pub header_version: u32,
    pub chipset_id: u16,
    pub flags: u16,
    pub module_vendor: u32,
    /// BCD date, yyyymmdd
    pub date: u32,
    /// Module size in dwords
    pub module_size: u32,
    pub acm_svn: u16,
    pub se_svn: u16,
    pub code_control: u32,
    pub error_entry_point: u32,
    pub gdt_limit: u32,
    pub gdt_base: u32,
    pub segment_sel: u32,
    pub entry_point: u32,
    pub reserved: [u8; 64],
    /// RSA key size in dwords
    pub key_size: u32,
    pub scratch_size: u32,
}

/// `AcmHeader::module_type` of an authenticated code module.
pub const ACM_MODULE_TYPE: u16 = 0x0002;
/// `AcmHeader::module_vendor` of Intel-signed modules.
pub const ACM_MODULE_VENDOR_INTEL: u32 = 0x8086;

/// Boot Guard structure tags.
pub mod bg_tag {
    pub const KEY_MANIFEST: [u8; 8] = *b"__KEYM__";
    pub const BOOT_POLICY: [u8; 8] = *b"__ACBP__";
    pub const IBB_ELEMENT: [u8; 8] = *b"__IBBS__";
    pub const PM_DATA_ELEMENT: [u8; 8] = *b"__PMDA__";
    pub const SIGNATURE_ELEMENT: [u8; 8] = *b"__PMSG__";
}

/// Hash algorithm identifiers used inside Boot Guard structures.
pub const BG_HASH_ALGORITHM_SHA256: u16 = 0x000B;
/// Byte size of a SHA-256 digest.
pub const SHA256_DIGEST_SIZE: usize = 32;

/// Boot Guard hash record: algorithm id, byte size, then the digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgHash {
    pub hash_algorithm_id: u16,
    pub size: u16,
    pub hash: alloc::vec::Vec<u8>,
}

impl BgHash {
    /// Parses a hash record, returning it and the number of bytes consumed.
    pub fn from_bytes(data: &[u8]) -> Option<(Self, usize)> {
        let head = data.get(..4)?;
        let hash_algorithm_id = u16::from_le_bytes(head[..2].try_into().ok()?);
        let size = u16::from_le_bytes(head[2..4].try_into().ok()?);
        let hash = data.get(4..4 + size as usize)?.to_vec();
        Some((Self { hash_algorithm_id, size, hash }, 4 + size as usize))
    }
}

/// Fixed lead of the Boot Guard key manifest (tag `__KEYM__`). The boot
/// policy key hash and the manifest signature follow.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct KeyManifestHeader {
    pub tag: [u8; 8],
    pub version: u8,
    pub km_version: u8,
    pub km_svn: u8,
    pub km_id: u8,
}

/// Fixed lead of the Boot Guard boot policy manifest (tag `__ACBP__`).
/// Chained elements (`__IBBS__`, `__PMDA__`, `__PMSG__`) follow.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BootPolicyHeader {
    pub tag: [u8; 8],
    pub version: u8,
    pub header_specific: u8,
    pub total_size: u16,
}

/// Fixed lead of the IBB element, up to the first variable-size hash.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IbbElementHeader {
    pub tag: [u8; 8],
    pub version: u8,
    pub reserved0: u8,
    pub reserved1: u16,
    pub flags: u32,
    pub ibb_mch_bar: u64,
    pub vtd_bar: u64,
    pub dma_protection_base0: u32,
    pub dma_protection_limit0: u32,
    pub dma_protection_base1: u64,
    pub dma_protection_limit1: u64,
}

/// One IBB segment record: a protected flash range.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IbbSegment {
    pub reserved: u16,
    pub flags: u16,
    /// Physical base address of the segment
    pub base: u32,
    /// Segment size in bytes
    pub size: u32,
}

/// Fixed lead of the platform manufacturer data element.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PmDataElementHeader {
    pub tag: [u8; 8],
    pub version: u8,
    pub reserved: u8,
    pub data_size: u16,
}

/// Fixed lead of the boot policy signature element; the RSA public key and
/// signature follow.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SignatureElementHeader {
    pub tag: [u8; 8],
    pub version: u8,
    pub reserved: u8,
    pub sig_scheme: u16,
}

/// RSA public key record used by the key manifest and signature element:
/// version byte, key size in bits, exponent, then the modulus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BgRsaPublicKey {
    pub version: u8,
    pub key_size_bits: u16,
    pub exponent: u32,
    pub modulus: alloc::vec::Vec<u8>,
}

impl BgRsaPublicKey {
    /// Parses a key record, returning it and the number of bytes consumed.
    pub fn from_bytes(data: &[u8]) -> Option<(Self, usize)> {
        let head = data.get(..7)?;
        let version = head[0];
        let key_size_bits = u16::from_le_bytes(head[1..3].try_into().ok()?);
        let exponent = u32::from_le_bytes(head[3..7].try_into().ok()?);
        let modulus_size = (key_size_bits as usize) / 8;
        let modulus = data.get(7..7 + modulus_size)?.to_vec();
        Some((Self { version, key_size_bits, exponent, modulus }, 7 + modulus_size))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use core::mem;

    #[test]
    fn fit_entry_is_16_bytes() {
        assert_eq!(mem::size_of::<FitEntry>(), FitEntry::SIZE);
    }

    #[test]
    fn fit_entry_type_masking() {
        let entry = FitEntry {
            address: 0,
            size: [2, 0, 0],
            reserved: 0,
            version: 0x0100,
            entry_type: FIT_ENTRY_CHECKSUM_VALID | entry_type::MICROCODE,
            checksum: 0,
        };
        assert_eq!(entry.type_masked(), entry_type::MICROCODE);
        assert!(entry.checksum_valid());
        assert_eq!(entry.size24(), 2);
    }

    #[test]
    fn bg_hash_consumes_declared_size() {
        let mut data = alloc::vec![0x0Bu8, 0x00, 0x20, 0x00];
        data.extend([0xAB; 32]);
        data.extend([0xFF; 4]);
        let (hash, used) = BgHash::from_bytes(&data).unwrap();
        assert_eq!(used, 36);
        assert_eq!(hash.size, 32);
        assert_eq!(hash.hash, [0xAB; 32]);
    }

    #[test]
    fn rsa_key_modulus_from_bit_size() {
        let mut data = alloc::vec![0x10u8];
        data.extend(2048u16.to_le_bytes());
        data.extend(0x10001u32.to_le_bytes());
        data.extend([0x5A; 256]);
        let (key, used) = BgRsaPublicKey::from_bytes(&data).unwrap();
        assert_eq!(used, 7 + 256);
        assert_eq!(key.exponent, 0x10001);
        assert_eq!(key.modulus.len(), 256);
    }
}
