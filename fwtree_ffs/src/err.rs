//! Error codes surfaced by the parser.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use std::fmt;

/// Parser error codes. Most are absorbed close to where they occur (logged
/// into the message channel while parsing continues); only root-level
/// failures reach the caller of `parse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// A parameter provided to a function is invalid (or the buffer is
    /// smaller than the smallest parseable structure).
    InvalidParameter,
    /// A capsule header failed its size invariants.
    InvalidCapsule,
    /// The Intel flash descriptor is malformed.
    InvalidFlashDescriptor,
    /// A region extends past the end of the opened image.
    TruncatedImage,
    /// A descriptor region has no bytes.
    EmptyRegion,
    /// A region body failed its surface checks.
    InvalidRegion,
    /// A volume header failed validation.
    InvalidVolume,
    /// A raw area contains no recognisable volume.
    VolumesNotFound,
    /// An FFS file header failed validation.
    InvalidFile,
    /// A section header failed validation.
    InvalidSection,
    /// A dependency expression could not be interpreted.
    DepexParseFailed,
    /// The FIT table failed validation.
    InvalidFit,
    /// A FIT microcode entry failed validation.
    InvalidMicrocode,
    /// A FIT ACM entry failed validation.
    InvalidAcm,
    /// A Boot Guard key manifest failed validation.
    InvalidKeyManifest,
    /// A Boot Guard boot policy failed validation.
    InvalidBootPolicy,
    /// A tree node of an unexpected type was encountered during a walk.
    UnknownItemType,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ParseError::InvalidParameter => "invalid parameter",
            ParseError::InvalidCapsule => "invalid capsule",
            ParseError::InvalidFlashDescriptor => "invalid flash descriptor",
            ParseError::TruncatedImage => "truncated image",
            ParseError::EmptyRegion => "empty region",
            ParseError::InvalidRegion => "invalid region",
            ParseError::InvalidVolume => "invalid volume",
            ParseError::VolumesNotFound => "volumes not found",
            ParseError::InvalidFile => "invalid file",
            ParseError::InvalidSection => "invalid section",
            ParseError::DepexParseFailed => "dependency expression parsing failed",
            ParseError::InvalidFit => "invalid FIT table",
            ParseError::InvalidMicrocode => "invalid microcode",
            ParseError::InvalidAcm => "invalid ACM",
            ParseError::InvalidKeyManifest => "invalid key manifest",
            ParseError::InvalidBootPolicy => "invalid boot policy",
            ParseError::UnknownItemType => "unknown item type",
        };
        f.write_str(text)
    }
}

impl std::error::Error for ParseError {}
