//! Intel Management Engine region surface structures.
//!
//! The ME region is opaque to this parser; the only thing extracted is the
//! firmware version, located by scanning for a manifest signature.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

/// Legacy manifest version signature.
pub const ME_VERSION_SIGNATURE: [u8; 4] = *b"$MAN";
/// Current manifest version signature.
pub const ME_VERSION_SIGNATURE2: [u8; 4] = *b"$MN2";

/// Version record found right at a manifest signature.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct MeVersion {
    pub signature: u32,
    pub reserved: u32,
    pub major: u16,
    pub minor: u16,
    pub bugfix: u16,
    pub build: u16,
}
