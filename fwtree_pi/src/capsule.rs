//! Update capsule header definitions.
//!
//! Capsules wrap a flash image for delivery through the OS; the parser
//! strips them before looking for the flash descriptor. The UEFI header is
//! shared by the Intel and Lenovo flavors; Toshiba and AMI Aptio use their
//! own layouts.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use r_efi::efi;

/// EFI_CAPSULE_HEADER
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct CapsuleHeader {
    /// GUID identifying the capsule vendor/format
    pub capsule_guid: efi::Guid,
    /// Size of the capsule header, image starts right after it
    pub header_size: u32,
    /// Capsule flags
    pub flags: u32,
    /// Size of the whole capsule, header included
    pub capsule_image_size: u32,
}

/// Toshiba-specific capsule header; same shape, different field order.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ToshibaCapsuleHeader {
    /// GUID identifying the capsule vendor/format
    pub capsule_guid: efi::Guid,
    /// Size of the capsule header
    pub header_size: u32,
    /// Size of the whole capsule
    pub full_size: u32,
    /// Capsule flags
    pub flags: u32,
}

/// AMI Aptio capsule header, wraps the standard one.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AptioCapsuleHeader {
    /// Embedded standard capsule header
    pub capsule_header: CapsuleHeader,
    /// Offset of the ROM image from the capsule start
    pub rom_image_offset: u16,
    /// Offset of the ROM layout structure
    pub rom_layout_offset: u16,
}
