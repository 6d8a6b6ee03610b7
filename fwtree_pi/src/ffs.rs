//! Firmware File System (FFS) definitions.
//!
//! Based on the values defined in the UEFI Platform Initialization (PI)
//! Specification V1.8A Section 3.2.2 Firmware File System, plus the vendor
//! extensions (Apple section headers, Insyde/Phoenix postcode sections)
//! found in shipping images.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
pub mod file;
pub mod section;

/// Compression type byte of a compression section.
pub mod compression_type {
    pub const NOT_COMPRESSED: u8 = 0x00;
    pub const STANDARD_COMPRESSION: u8 = 0x01;
    pub const CUSTOMIZED_COMPRESSION: u8 = 0x02;
}

/// Dependency expression opcodes.
pub mod depex {
    pub const BEFORE: u8 = 0x00;
    pub const AFTER: u8 = 0x01;
    pub const PUSH: u8 = 0x02;
    pub const AND: u8 = 0x03;
    pub const OR: u8 = 0x04;
    pub const NOT: u8 = 0x05;
    pub const TRUE: u8 = 0x06;
    pub const FALSE: u8 = 0x07;
    pub const END: u8 = 0x08;
    pub const SOR: u8 = 0x09;

    /// Every opcode occupies one byte.
    pub const OPCODE_SIZE: usize = 1;
}
