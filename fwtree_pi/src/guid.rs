//! GUID constants recognised by the flash image parser.
//!
//! Capsule envelopes, firmware filesystems, special FFS files, GUID-defined
//! sections, and vendor hash files are all identified by the values below.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use alloc::format;
use alloc::string::String;
use r_efi::efi;

// Capsule envelopes.
pub const EFI_CAPSULE_GUID: efi::Guid =
    efi::Guid::from_fields(0x3B6686BD, 0x0D76, 0x4030, 0xB7, 0x0E, &[0xB5, 0x51, 0x9E, 0x2F, 0xC5, 0xA0]);
pub const INTEL_CAPSULE_GUID: efi::Guid =
    efi::Guid::from_fields(0x539182B9, 0xABB5, 0x4391, 0xB6, 0x9A, &[0xE3, 0xA9, 0x43, 0xF7, 0x2F, 0xCC]);
pub const LENOVO_CAPSULE_GUID: efi::Guid =
    efi::Guid::from_fields(0xE20BAFD3, 0x9914, 0x4F4F, 0x95, 0x37, &[0x31, 0x29, 0xE0, 0x90, 0xEB, 0x3C]);
pub const LENOVO2_CAPSULE_GUID: efi::Guid =
    efi::Guid::from_fields(0x25B5FE76, 0x8243, 0x4A5C, 0xA9, 0xBD, &[0x7E, 0xE3, 0x24, 0x61, 0x98, 0xB5]);
pub const TOSHIBA_CAPSULE_GUID: efi::Guid =
    efi::Guid::from_fields(0x3BE07062, 0x1D51, 0x45D2, 0x83, 0x2B, &[0xF0, 0x93, 0x25, 0x7E, 0xD4, 0x61]);
pub const APTIO_SIGNED_CAPSULE_GUID: efi::Guid =
    efi::Guid::from_fields(0x4A3CA68B, 0x7723, 0x48FB, 0x80, 0x3D, &[0x57, 0x8C, 0xC1, 0xFE, 0xC4, 0x4D]);
pub const APTIO_UNSIGNED_CAPSULE_GUID: efi::Guid =
    efi::Guid::from_fields(0x14EEBB90, 0x890A, 0x43DB, 0xAE, 0xD1, &[0x5D, 0x3C, 0x45, 0x88, 0xA4, 0x18]);

// Firmware filesystems, FFSv2 flavor.
pub const EFI_FIRMWARE_FILE_SYSTEM_GUID: efi::Guid =
    efi::Guid::from_fields(0x7A9354D9, 0x0468, 0x444A, 0x81, 0xCE, &[0x0B, 0xF6, 0x17, 0xD8, 0x90, 0xDF]);
pub const EFI_FIRMWARE_FILE_SYSTEM2_GUID: efi::Guid =
    efi::Guid::from_fields(0x8C8CE578, 0x8A3D, 0x4F1C, 0x99, 0x35, &[0x89, 0x61, 0x85, 0xC3, 0x2D, 0xD3]);
pub const EFI_APPLE_BOOT_VOLUME_FILE_SYSTEM_GUID: efi::Guid =
    efi::Guid::from_fields(0x04ADEEAD, 0x61FF, 0x4D31, 0xB6, 0xBA, &[0x64, 0xF8, 0xBF, 0x90, 0x1F, 0x5A]);
pub const EFI_APPLE_BOOT_VOLUME_FILE_SYSTEM2_GUID: efi::Guid =
    efi::Guid::from_fields(0xBD001B8C, 0x6A71, 0x487B, 0xA1, 0x4F, &[0x0C, 0x2A, 0x2D, 0xCF, 0x7A, 0x5D]);
pub const EFI_INTEL_FILE_SYSTEM_GUID: efi::Guid =
    efi::Guid::from_fields(0xAD3FFFFF, 0xD28B, 0x44C4, 0x9F, 0x13, &[0x9E, 0xA9, 0x8A, 0x97, 0xF9, 0xF0]);
pub const EFI_INTEL_FILE_SYSTEM2_GUID: efi::Guid =
    efi::Guid::from_fields(0xD6A1CD70, 0x4B33, 0x4994, 0xA6, 0xEA, &[0x37, 0x5F, 0x2C, 0xCC, 0x54, 0x37]);
pub const EFI_SONY_FILE_SYSTEM_GUID: efi::Guid =
    efi::Guid::from_fields(0x4F494156, 0xAED6, 0x4D64, 0xA5, 0x37, &[0xB8, 0xA5, 0x55, 0x7B, 0xCE, 0xEC]);

// Firmware filesystem, FFSv3 flavor.
pub const EFI_FIRMWARE_FILE_SYSTEM3_GUID: efi::Guid =
    efi::Guid::from_fields(0x5473C07A, 0x3DCB, 0x4DCA, 0xBD, 0x6F, &[0x1E, 0x96, 0x89, 0xE7, 0x34, 0x9A]);

// NVRAM volumes are recognised but left to an external store parser.
pub const NVRAM_MAIN_STORE_VOLUME_GUID: efi::Guid =
    efi::Guid::from_fields(0xFFF12B8D, 0x7696, 0x4C8B, 0xA9, 0x85, &[0x27, 0x47, 0x07, 0x5B, 0x4F, 0x50]);
pub const NVRAM_ADDITIONAL_STORE_VOLUME_GUID: efi::Guid =
    efi::Guid::from_fields(0x00504624, 0x8A59, 0x4EEB, 0xBD, 0x0F, &[0x6B, 0x36, 0xE9, 0x61, 0x28, 0xE0]);
pub const NVRAM_NVAR_STORE_FILE_GUID: efi::Guid =
    efi::Guid::from_fields(0xCEF5B9A3, 0x476D, 0x497F, 0x9F, 0xDC, &[0xE9, 0x81, 0x43, 0xE0, 0x42, 0x2C]);

// Special FFS files.
pub const EFI_FFS_VOLUME_TOP_FILE_GUID: efi::Guid =
    efi::Guid::from_fields(0x1BA0062E, 0xC779, 0x4582, 0x85, 0x66, &[0x33, 0x6A, 0xE8, 0xF7, 0x8F, 0x09]);
pub const EFI_DXE_CORE_GUID: efi::Guid =
    efi::Guid::from_fields(0xD6A2CB7F, 0x6A18, 0x4E2F, 0xB4, 0x3B, &[0x99, 0x20, 0xA7, 0x33, 0x70, 0x0A]);
pub const EFI_PEI_APRIORI_FILE_GUID: efi::Guid =
    efi::Guid::from_fields(0x1B45CC0A, 0x156A, 0x428A, 0xAF, 0x62, &[0x49, 0x86, 0x4D, 0xA0, 0xE6, 0xE6]);
pub const EFI_DXE_APRIORI_FILE_GUID: efi::Guid =
    efi::Guid::from_fields(0xFC510EE7, 0xFFDC, 0x11D4, 0xBD, 0x41, &[0x00, 0x80, 0xC7, 0x3C, 0x88, 0x81]);

// GUID-defined section processors.
pub const EFI_GUIDED_SECTION_CRC32: efi::Guid =
    efi::Guid::from_fields(0xFC1BCDB0, 0x7D31, 0x49AA, 0x93, 0x6A, &[0xA4, 0x60, 0x0D, 0x9D, 0xD0, 0x83]);
pub const EFI_GUIDED_SECTION_TIANO: efi::Guid =
    efi::Guid::from_fields(0xA31280AD, 0x481E, 0x41B6, 0x95, 0xE8, &[0x12, 0x7F, 0x4C, 0x98, 0x47, 0x79]);
pub const EFI_GUIDED_SECTION_LZMA: efi::Guid =
    efi::Guid::from_fields(0xEE4E5898, 0x3914, 0x4259, 0x9D, 0x6E, &[0xDC, 0x7B, 0xD7, 0x94, 0x03, 0xCF]);
pub const EFI_GUIDED_SECTION_LZMAF86: efi::Guid =
    efi::Guid::from_fields(0xD42AE6BD, 0x1352, 0x4BFB, 0x90, 0x9A, &[0xCA, 0x72, 0xA6, 0xEA, 0xE8, 0x89]);
pub const EFI_FIRMWARE_CONTENTS_SIGNED_GUID: efi::Guid =
    efi::Guid::from_fields(0x0F9D89E8, 0x9259, 0x4F76, 0xA5, 0xAF, &[0x0C, 0x89, 0xE3, 0x40, 0x23, 0xDF]);
pub const EFI_CERT_TYPE_RSA2048_SHA256_GUID: efi::Guid =
    efi::Guid::from_fields(0xA7717414, 0xC616, 0x4977, 0x94, 0x20, &[0x84, 0x47, 0x12, 0xA7, 0x35, 0xBF]);

// Vendor hash files carrying protected flash ranges.
pub const VENDOR_HASH_FILE_GUID_PHOENIX: efi::Guid =
    efi::Guid::from_fields(0x389CC6F2, 0x1EA8, 0x467B, 0xAB, 0x8A, &[0x78, 0xE7, 0x69, 0xAE, 0x2A, 0x15]);
pub const VENDOR_HASH_FILE_GUID_AMI_OLD: efi::Guid =
    efi::Guid::from_fields(0xCBC91F44, 0xA4BC, 0x4A5B, 0x86, 0x96, &[0x70, 0x34, 0x51, 0xD0, 0xB0, 0x53]);
pub const VENDOR_HASH_FILE_GUID_AMI_NEW: efi::Guid =
    efi::Guid::from_fields(0x7CE75114, 0x61B2, 0x4657, 0xAE, 0x3A, &[0x4D, 0x8D, 0x25, 0x52, 0x55, 0x92]);

/// GUIDs that mark a volume as FFSv2.
pub const FFS_V2_VOLUMES: [efi::Guid; 7] = [
    EFI_FIRMWARE_FILE_SYSTEM_GUID,
    EFI_FIRMWARE_FILE_SYSTEM2_GUID,
    EFI_APPLE_BOOT_VOLUME_FILE_SYSTEM_GUID,
    EFI_APPLE_BOOT_VOLUME_FILE_SYSTEM2_GUID,
    EFI_INTEL_FILE_SYSTEM_GUID,
    EFI_INTEL_FILE_SYSTEM2_GUID,
    EFI_SONY_FILE_SYSTEM_GUID,
];

/// GUIDs that mark a volume as FFSv3.
pub const FFS_V3_VOLUMES: [efi::Guid; 1] = [EFI_FIRMWARE_FILE_SYSTEM3_GUID];

/// GUIDs that mark a volume as an NVRAM store.
pub const NVRAM_VOLUMES: [efi::Guid; 2] = [NVRAM_MAIN_STORE_VOLUME_GUID, NVRAM_ADDITIONAL_STORE_VOLUME_GUID];

/// Renders a GUID in registry format, uppercase, without braces.
pub fn guid_to_string(guid: &efi::Guid) -> String {
    let (time_low, time_mid, time_hi, clk_hi, clk_low, node) = guid.as_fields();
    format!(
        "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        time_low, time_mid, time_hi, clk_hi, clk_low, node[0], node[1], node[2], node[3], node[4], node[5]
    )
}

/// Reads a GUID from the first 16 bytes of `data`, if present.
pub fn guid_from_bytes(data: &[u8]) -> Option<efi::Guid> {
    let raw: &[u8; 16] = data.get(..16)?.try_into().ok()?;
    Some(efi::Guid::from_bytes(raw))
}

#[cfg(test)]
mod test {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn guid_string_matches_registry_format() {
        assert_eq!(guid_to_string(&EFI_FIRMWARE_FILE_SYSTEM2_GUID), "8C8CE578-8A3D-4F1C-9935-896185C32DD3");
        assert_eq!(guid_to_string(&EFI_GUIDED_SECTION_LZMA), "EE4E5898-3914-4259-9D6E-DC7BD79403CF");
    }

    #[test]
    fn guid_byte_order_round_trips_through_uuid() {
        let uuid = Uuid::from_bytes_le(*EFI_FFS_VOLUME_TOP_FILE_GUID.as_bytes());
        assert_eq!(uuid.to_string().to_uppercase(), guid_to_string(&EFI_FFS_VOLUME_TOP_FILE_GUID));
    }

    #[test]
    fn guid_from_bytes_requires_full_guid() {
        let bytes = *EFI_DXE_CORE_GUID.as_bytes();
        assert_eq!(guid_from_bytes(&bytes), Some(EFI_DXE_CORE_GUID));
        assert_eq!(guid_from_bytes(&bytes[..15]), None);
    }
}
