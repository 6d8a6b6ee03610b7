//! Decompression facade for UEFI flash image parsing.
//!
//! Compression sections declare their algorithm with a single type byte
//! that is not always sufficient: type 1 ("standard") covers both the
//! EFI 1.1 and the Tiano encoding, which share a bitstream format but
//! differ in how match distances are encoded. Both decoders accept most
//! inputs of the other and silently produce garbage, so when their outputs
//! disagree the caller has to disambiguate by attempting to parse each
//! candidate. [`decompress`] exposes exactly that contract: it returns the
//! detected [`Algorithm`] together with both candidate buffers, and
//! [`Algorithm::Undecided`] when only the caller can tell them apart.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use std::fmt;
use std::io::Cursor;

use mu_rust_helpers::uefi_decompress::{decompress_into_with_algo, DecompressionAlgorithm};

/// Compression type byte of a compression section.
pub const NOT_COMPRESSED: u8 = 0x00;
/// Standard compression: EFI 1.1 or Tiano.
pub const STANDARD_COMPRESSION: u8 = 0x01;
/// Customized compression: LZMA.
pub const CUSTOMIZED_COMPRESSION: u8 = 0x02;

/// First properties byte of the usual UEFI LZMA parameter set. The
/// Intel-modified variant ships a nonstandard byte there; normalising it
/// is what makes those payloads decodable.
const LZMA_DEFAULT_PROPERTIES: u8 = 0x5D;
/// Size of the LZMA stream header (properties + dictionary + unpacked size).
const LZMA_HEADER_SIZE: usize = 13;

/// Detected compression algorithm of a section body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// Body was stored uncompressed
    None,
    /// EFI 1.1 compression
    Efi11,
    /// Tiano compression
    Tiano,
    /// Plain LZMA
    Lzma,
    /// LZMA with the Intel properties-byte tweak
    IntelLzma,
    /// Type byte 1 and the EFI 1.1 / Tiano decoders disagree; the caller
    /// must pre-parse both outputs to decide
    Undecided,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::None => "None",
            Algorithm::Efi11 => "EFI 1.1",
            Algorithm::Tiano => "Tiano",
            Algorithm::Lzma => "LZMA",
            Algorithm::IntelLzma => "Intel modified LZMA",
            Algorithm::Undecided => "Undecided",
        };
        f.write_str(name)
    }
}

/// Decompression failure; carried as a value, never panicked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecompressError {
    /// The compression type byte is not one this facade understands
    UnknownType(u8),
    /// The compressed stream header is truncated or inconsistent
    InvalidData,
    /// Every applicable decoder rejected the stream
    DecoderFailed,
}

impl fmt::Display for DecompressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecompressError::UnknownType(t) => write!(f, "unknown compression type {:02X}h", t),
            DecompressError::InvalidData => f.write_str("invalid compressed data"),
            DecompressError::DecoderFailed => f.write_str("decompression failed"),
        }
    }
}

impl std::error::Error for DecompressError {}

/// Result of a [`decompress`] call.
///
/// `data` is the primary candidate. For [`Algorithm::Undecided`],
/// `data` holds the Tiano decoder's output and `efi11_data` the EFI 1.1
/// decoder's output; otherwise `efi11_data` is empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decompressed {
    pub algorithm: Algorithm,
    pub data: Vec<u8>,
    pub efi11_data: Vec<u8>,
}

impl Decompressed {
    fn decided(algorithm: Algorithm, data: Vec<u8>) -> Self {
        Self { algorithm, data, efi11_data: Vec::new() }
    }
}

/// Decompresses a compression-section body according to its type byte.
pub fn decompress(compression_type: u8, compressed: &[u8]) -> Result<Decompressed, DecompressError> {
    match compression_type {
        NOT_COMPRESSED => Ok(Decompressed::decided(Algorithm::None, compressed.to_vec())),
        STANDARD_COMPRESSION => decompress_standard(compressed),
        CUSTOMIZED_COMPRESSION => decompress_lzma(compressed),
        other => Err(DecompressError::UnknownType(other)),
    }
}

/// Runs one of the EFI 1.1 / Tiano decoders over a standard-compression
/// stream. The stream leads with two u32 sizes (compressed, decompressed).
fn uefi_decompress(compressed: &[u8], algo: DecompressionAlgorithm) -> Result<Vec<u8>, DecompressError> {
    if compressed.len() < 8 {
        return Err(DecompressError::InvalidData);
    }
    let compressed_size = u32::from_le_bytes(compressed[0..4].try_into().unwrap()) as usize;
    if compressed_size > compressed.len() {
        return Err(DecompressError::InvalidData);
    }
    let decompressed_size = u32::from_le_bytes(compressed[4..8].try_into().unwrap()) as usize;
    let mut decompressed = vec![0u8; decompressed_size];
    decompress_into_with_algo(compressed, &mut decompressed, algo).map_err(|_| DecompressError::DecoderFailed)?;
    Ok(decompressed)
}

fn decompress_standard(compressed: &[u8]) -> Result<Decompressed, DecompressError> {
    let tiano = uefi_decompress(compressed, DecompressionAlgorithm::TianoDecompress);
    let efi11 = uefi_decompress(compressed, DecompressionAlgorithm::UefiDecompress);

    match (tiano, efi11) {
        (Ok(tiano_data), Ok(efi11_data)) => {
            if tiano_data == efi11_data {
                // Identical outputs mean distance encoding never diverged;
                // either name is correct, Tiano is reported.
                Ok(Decompressed::decided(Algorithm::Tiano, tiano_data))
            } else {
                Ok(Decompressed { algorithm: Algorithm::Undecided, data: tiano_data, efi11_data })
            }
        }
        (Ok(tiano_data), Err(_)) => Ok(Decompressed::decided(Algorithm::Tiano, tiano_data)),
        (Err(_), Ok(efi11_data)) => Ok(Decompressed::decided(Algorithm::Efi11, efi11_data)),
        (Err(_), Err(_)) => Err(DecompressError::DecoderFailed),
    }
}

fn lzma_decompress(compressed: &[u8]) -> Result<Vec<u8>, DecompressError> {
    if compressed.len() < LZMA_HEADER_SIZE {
        return Err(DecompressError::InvalidData);
    }
    let mut decompressed = Vec::new();
    lzma_rs::lzma_decompress(&mut Cursor::new(compressed), &mut decompressed)
        .map_err(|_| DecompressError::DecoderFailed)?;
    Ok(decompressed)
}

fn decompress_lzma(compressed: &[u8]) -> Result<Decompressed, DecompressError> {
    match lzma_decompress(compressed) {
        Ok(data) => Ok(Decompressed::decided(Algorithm::Lzma, data)),
        Err(DecompressError::DecoderFailed) if compressed.len() >= LZMA_HEADER_SIZE => {
            // Intel-modified streams carry a vendor value in the properties
            // byte; retry with the standard parameter set.
            let mut patched = compressed.to_vec();
            patched[0] = LZMA_DEFAULT_PROPERTIES;
            let data = lzma_decompress(&patched)?;
            Ok(Decompressed::decided(Algorithm::IntelLzma, data))
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    fn lzma_compress(data: &[u8]) -> Vec<u8> {
        let mut compressed = Vec::new();
        let options = lzma_rs::compress::Options {
            unpacked_size: lzma_rs::compress::UnpackedSize::WriteToHeader(Some(data.len() as u64)),
        };
        lzma_rs::lzma_compress_with_options(&mut Cursor::new(data), &mut compressed, &options).unwrap();
        compressed
    }

    #[test]
    fn not_compressed_passes_through() {
        let body = [0x01u8, 0x02, 0x03, 0x04];
        let result = decompress(NOT_COMPRESSED, &body).unwrap();
        assert_eq!(result.algorithm, Algorithm::None);
        assert_eq!(result.data, body);
        assert!(result.efi11_data.is_empty());
    }

    #[test]
    fn unknown_type_is_reported() {
        assert_eq!(decompress(0x77, &[0u8; 16]).unwrap_err(), DecompressError::UnknownType(0x77));
    }

    #[test]
    fn lzma_round_trip() {
        let payload = b"firmware payload firmware payload firmware payload".to_vec();
        let compressed = lzma_compress(&payload);
        let result = decompress(CUSTOMIZED_COMPRESSION, &compressed).unwrap();
        assert_eq!(result.algorithm, Algorithm::Lzma);
        assert_eq!(result.data, payload);
    }

    #[test]
    fn intel_lzma_properties_byte_is_normalised() {
        let payload = b"the quick brown fox jumps over the lazy dog".to_vec();
        let mut compressed = lzma_compress(&payload);
        // Corrupt the properties byte the way Intel's encoder does.
        compressed[0] = 0xFF;
        let result = decompress(CUSTOMIZED_COMPRESSION, &compressed).unwrap();
        assert_eq!(result.algorithm, Algorithm::IntelLzma);
        assert_eq!(result.data, payload);
    }

    #[test]
    fn standard_compression_rejects_truncated_lead() {
        assert_eq!(decompress(STANDARD_COMPRESSION, &[0u8; 4]).unwrap_err(), DecompressError::InvalidData);
    }

    #[test]
    fn standard_compression_rejects_oversized_declared_size() {
        let mut stream = Vec::new();
        stream.extend(0xFFFF_FFF0u32.to_le_bytes());
        stream.extend(16u32.to_le_bytes());
        stream.extend([0u8; 8]);
        assert_eq!(decompress(STANDARD_COMPRESSION, &stream).unwrap_err(), DecompressError::InvalidData);
    }
}
