//! Protected range validation (fourth pass).
//!
//! Protected ranges come from two places: the Boot Guard boot policy's IBB
//! segments (collected while parsing the FIT) and vendor hash files that
//! OEM tooling drops into the BIOS region. Once the address difference is
//! known, every range can be resolved back to image bytes, hashed, and
//! compared against its declared digest. Nodes covered by a violated range
//! get marked so viewers can colour them.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use sha2::{Digest, Sha256};

use fwtree_pi::fit::SHA256_DIGEST_SIZE;

use crate::err::ParseError;
use crate::model::{ItemId, ItemType, Marking};
use crate::msg::Severity;
use crate::parser::{size_string, FfsParser};

/// Vendor hash file flavor, recognised by file GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VendorHashDialect {
    Phoenix,
    AmiOld,
    AmiNew,
}

/// Where a protected range's offset is rooted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectedRangeKind {
    /// Boot Guard IBB segment; offset is a physical address
    IbbBootGuard,
    /// Phoenix entry; offset is relative to the first volume
    VendorPhoenix,
    /// Old AMI entry; rooted at the DXE volume, offset is always zero
    VendorAmiOld,
    /// New AMI entry; offset is a physical address
    VendorAmiNew,
}

/// One flash range whose content is pinned by a digest.
#[derive(Debug, Clone)]
pub struct ProtectedRange {
    pub offset: u64,
    pub size: u64,
    pub kind: ProtectedRangeKind,
    pub hash: Vec<u8>,
}

/// Phoenix hash file signature.
pub const PHOENIX_HASH_FILE_SIGNATURE: [u8; 4] = *b"$HS2";

const PHOENIX_HEADER_SIZE: usize = 8;
const RANGE_ENTRY_SIZE: usize = 8 + SHA256_DIGEST_SIZE;
const AMI_OLD_BODY_SIZE: usize = 4 + SHA256_DIGEST_SIZE;

impl FfsParser {
    /// Parses a vendor hash file body and records its protected ranges.
    /// Called from the file body dispatch.
    pub(crate) fn parse_vendor_hash_file(
        &mut self,
        dialect: VendorHashDialect,
        index: ItemId,
    ) -> Result<(), ParseError> {
        let body = self.model.body(index).clone();
        let mut info = String::new();

        match dialect {
            VendorHashDialect::Phoenix => {
                if body.len() < PHOENIX_HEADER_SIZE || !body.starts_with(&PHOENIX_HASH_FILE_SIGNATURE) {
                    self.msg(Some(index), Severity::Error, "parseVendorHashFile: invalid Phoenix hash file signature");
                    return Err(ParseError::InvalidFile);
                }
                let entry_count = body.read_u32(4).unwrap_or(0) as usize;
                if PHOENIX_HEADER_SIZE + entry_count * RANGE_ENTRY_SIZE > body.len() {
                    self.msg(
                        Some(index),
                        Severity::Error,
                        "parseVendorHashFile: Phoenix hash file entry count exceeds the file body",
                    );
                    return Err(ParseError::InvalidFile);
                }
                for entry_index in 0..entry_count {
                    let entry_offset = PHOENIX_HEADER_SIZE + entry_index * RANGE_ENTRY_SIZE;
                    let offset = body.read_u32(entry_offset).unwrap_or(0) as u64;
                    let size = body.read_u32(entry_offset + 4).unwrap_or(0) as u64;
                    let hash = body.as_slice()[entry_offset + 8..entry_offset + RANGE_ENTRY_SIZE].to_vec();
                    if size == 0 {
                        continue;
                    }
                    info.push_str(&format!("\nProtected range: offset {:X}h, size {}", offset, size_string(size as usize)));
                    self.protected_ranges.push(ProtectedRange {
                        offset,
                        size,
                        kind: ProtectedRangeKind::VendorPhoenix,
                        hash,
                    });
                }
            }
            VendorHashDialect::AmiNew => {
                if body.is_empty() || body.len() % RANGE_ENTRY_SIZE != 0 {
                    self.msg(Some(index), Severity::Error, "parseVendorHashFile: invalid AMI hash file size");
                    return Err(ParseError::InvalidFile);
                }
                for entry_offset in (0..body.len()).step_by(RANGE_ENTRY_SIZE) {
                    let offset = body.read_u32(entry_offset).unwrap_or(0) as u64;
                    let size = body.read_u32(entry_offset + 4).unwrap_or(0) as u64;
                    let hash = body.as_slice()[entry_offset + 8..entry_offset + RANGE_ENTRY_SIZE].to_vec();
                    if size == 0 {
                        continue;
                    }
                    info.push_str(&format!(
                        "\nProtected range: address {:X}h, size {}",
                        offset,
                        size_string(size as usize)
                    ));
                    self.protected_ranges.push(ProtectedRange {
                        offset,
                        size,
                        kind: ProtectedRangeKind::VendorAmiNew,
                        hash,
                    });
                }
            }
            VendorHashDialect::AmiOld => {
                if body.len() < AMI_OLD_BODY_SIZE {
                    self.msg(Some(index), Severity::Error, "parseVendorHashFile: invalid AMI hash file size");
                    return Err(ParseError::InvalidFile);
                }
                let size = body.read_u32(0).unwrap_or(0) as u64;
                let hash = body.as_slice()[4..AMI_OLD_BODY_SIZE].to_vec();
                if size != 0 {
                    info.push_str(&format!(
                        "\nProtected range: DXE volume based, size {}",
                        size_string(size as usize)
                    ));
                    // The range is declared from offset zero but really
                    // starts at the volume holding the first DXE core,
                    // resolved after the FIT pass.
                    self.protected_ranges.push(ProtectedRange {
                        offset: 0,
                        size,
                        kind: ProtectedRangeKind::VendorAmiOld,
                        hash,
                    });
                }
            }
        }

        if !info.is_empty() {
            self.model.add_info(index, &info, true);
        }
        self.vendor_hash_files.push((dialect, index));
        Ok(())
    }

    /// Recomputes every protected range digest and marks violated ranges
    ///. Never fails the parse.
    pub(crate) fn check_protected_ranges(&mut self) {
        let Some(diff) = self.address_diff else {
            return;
        };
        log::debug!(
            "checking {} protected ranges from {} vendor hash files",
            self.protected_ranges.len(),
            self.vendor_hash_files.len()
        );

        // Boot Guard IBB segments hash as one concatenated blob against
        // the boot policy digest.
        let mut ibb_ranges: Vec<ProtectedRange> = self
            .protected_ranges
            .iter()
            .filter(|r| r.kind == ProtectedRangeKind::IbbBootGuard)
            .cloned()
            .collect();
        if !ibb_ranges.is_empty() {
            ibb_ranges.sort_by_key(|r| r.offset);
            let mut ibb_bytes = Vec::new();
            let mut resolvable = true;
            for range in &ibb_ranges {
                match self.range_to_image_span(range.offset.wrapping_sub(diff), range.size) {
                    Some((start, end)) => ibb_bytes.extend_from_slice(&self.image.as_slice()[start..end]),
                    None => {
                        self.msg(
                            None,
                            Severity::Warning,
                            format!(
                                "checkProtectedRanges: BG-protected range at address {:X}h does not map into the image",
                                range.offset
                            ),
                        );
                        resolvable = false;
                    }
                }
            }
            if resolvable {
                let calculated: Vec<u8> = Sha256::digest(&ibb_bytes).to_vec();
                let declared = self.bg_bp_digest.clone().unwrap_or_default();
                if calculated != declared {
                    self.msg(
                        None,
                        Severity::Error,
                        "checkProtectedRanges: BG-protected ranges hash mismatch, opened image may refuse to boot",
                    );
                    for range in &ibb_ranges {
                        if let Some((start, end)) = self.range_to_image_span(range.offset.wrapping_sub(diff), range.size)
                        {
                            self.mark_protected_range(start, end);
                        }
                    }
                }
            }
        }

        // Vendor ranges carry their own per-range digest.
        let vendor_ranges: Vec<ProtectedRange> = self
            .protected_ranges
            .iter()
            .filter(|r| r.kind != ProtectedRangeKind::IbbBootGuard)
            .cloned()
            .collect();
        for range in vendor_ranges {
            let image_offset = match range.kind {
                ProtectedRangeKind::VendorPhoenix => match self.first_volume_offset() {
                    Some(base) => base as u64 + range.offset,
                    None => {
                        self.msg(
                            None,
                            Severity::Warning,
                            "checkProtectedRanges: Phoenix protected range found, but no volume exists to root it",
                        );
                        continue;
                    }
                },
                ProtectedRangeKind::VendorAmiOld => match self.dxe_root_volume_offset() {
                    Some(base) => base as u64,
                    None => {
                        self.msg(
                            None,
                            Severity::Warning,
                            "checkProtectedRanges: AMI protected range found, but no DXE core file exists to root it",
                        );
                        continue;
                    }
                },
                ProtectedRangeKind::VendorAmiNew => range.offset.wrapping_sub(diff),
                ProtectedRangeKind::IbbBootGuard => unreachable!(),
            };

            let Some((start, end)) = self.range_to_image_span(image_offset, range.size) else {
                self.msg(
                    None,
                    Severity::Warning,
                    format!(
                        "checkProtectedRanges: vendor protected range at offset {:X}h does not map into the image",
                        image_offset
                    ),
                );
                continue;
            };

            let calculated: Vec<u8> = Sha256::digest(&self.image.as_slice()[start..end]).to_vec();
            if calculated != range.hash {
                self.msg(
                    None,
                    Severity::Error,
                    format!(
                        "checkProtectedRanges: vendor hash mismatch for range at offset {:X}h, size {}",
                        start,
                        size_string(range.size as usize)
                    ),
                );
                self.mark_protected_range(start, end);
            }
        }
    }

    fn range_to_image_span(&self, image_offset: u64, size: u64) -> Option<(usize, usize)> {
        let start = usize::try_from(image_offset).ok()?;
        let end = start.checked_add(usize::try_from(size).ok()?)?;
        if end > self.image.len() {
            return None;
        }
        Some((start, end))
    }

    /// Offset of the first volume in tree order; the Phoenix range root.
    fn first_volume_offset(&self) -> Option<usize> {
        self.model
            .depth_first()
            .into_iter()
            .find(|&id| self.model.item_type(id) == ItemType::Volume && !self.model.compressed(id))
            .map(|id| self.model.offset(id))
    }

    /// Offset of the volume holding the first DXE core file; the old AMI
    /// range root.
    fn dxe_root_volume_offset(&self) -> Option<usize> {
        let dxe_core = self.dxe_core?;
        let volume = self.model.find_parent_of_type(dxe_core, ItemType::Volume)?;
        Some(self.model.offset(volume))
    }

    /// Marks every uncompressed node intersecting `[start, end)`; nodes
    /// fully inside get the stronger marking.
    fn mark_protected_range(&mut self, start: usize, end: usize) {
        for index in self.model.depth_first() {
            if self.model.compressed(index) {
                continue;
            }
            let node_start = self.model.offset(index);
            let node_end = node_start + self.model.full_size(index);
            if node_end <= start || node_start >= end {
                continue;
            }
            let marking = if node_start >= start && node_end <= end {
                Marking::InRange
            } else {
                Marking::OverlapsRange
            };
            self.model.set_marking(index, marking);
        }
    }
}
