//! Multi-pass UEFI flash image parser.
//!
//! [`parser::FfsParser`] takes an opaque flash chip image and produces a
//! labelled tree of everything it finds: update capsules, the Intel flash
//! descriptor with its regions, firmware volumes, FFS files, nested
//! sections, and the padding/free space between them. After the structural
//! pass it propagates physical memory addresses back from the last Volume
//! Top File, locates the Firmware Interface Table, and validates the Boot
//! Guard / vendor hash protected ranges.
//!
//! The tree ([`model::TreeModel`]) plus the ordered message log
//! ([`msg::Messages`]) are the complete parser output; extractors,
//! rebuilders, and interactive viewers all work from those.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!

pub mod bootguard;
pub mod bytes;
pub mod checksum;
pub mod err;
pub mod fit;
pub mod model;
pub mod msg;
pub mod parser;

pub use err::ParseError;
pub use parser::FfsParser;
