//! Multi-pass recursive descent parser for flash images.
//!
//! The first pass builds the tree: capsule stripping, Intel descriptor
//! region mapping, volume discovery, FFS file and section walking. The
//! second pass propagates physical memory addresses back from the last
//! Volume Top File; the third locates the FIT table; the fourth validates
//! Boot Guard / vendor hash protected ranges. Later passes only annotate,
//! they never change the tree shape.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use log::debug;

use fwtree_pi::{capsule, descriptor, guid};

use crate::bootguard::{ProtectedRange, VendorHashDialect};
use crate::bytes::Bytes;
use crate::err::ParseError;
use crate::fit::FitRow;
use crate::model::{
    CapsuleSubtype, ImageSubtype, InsertMode, ItemId, ItemType, PaddingSubtype, ParsingData, Subtype, TreeModel,
};
use crate::msg::{Messages, Severity};

mod file;
mod intel;
mod rebase;
mod section;
mod volume;

/// Aligns up to an 8-byte boundary.
pub(crate) fn align8(value: usize) -> usize {
    (value + 7) & !7
}

/// Aligns up to a 4-byte boundary.
pub(crate) fn align4(value: usize) -> usize {
    (value + 3) & !3
}

/// Renders a size the way the tree info text does everywhere: hex then
/// decimal.
pub(crate) fn size_string(size: usize) -> String {
    format!("{:X}h ({})", size, size)
}

/// The parser. One instance parses one image; all discovered state ends up
/// in [`model`](Self::model), [`messages`](Self::messages), and
/// [`fit_table`](Self::fit_table).
pub struct FfsParser {
    pub(crate) model: TreeModel,
    pub(crate) messages: Messages,
    pub(crate) image: Bytes,
    /// Size of a stripped capsule header; volume alignment is computed
    /// relative to the flash image, not the capsule file
    pub(crate) capsule_offset_fixup: usize,
    /// The last Volume Top File seen during the first pass
    pub(crate) last_vtf: Option<ItemId>,
    /// The first DXE core file seen during the first pass
    pub(crate) dxe_core: Option<ItemId>,
    /// `0xFFFFFFFF - last_vtf_end + 1`, computed by the second pass
    pub(crate) address_diff: Option<u64>,
    pub(crate) fit_table: Vec<FitRow>,
    pub(crate) protected_ranges: Vec<ProtectedRange>,
    /// Vendor hash files found during the first pass, resolved after FIT
    pub(crate) vendor_hash_files: Vec<(VendorHashDialect, ItemId)>,
    pub(crate) bg_acm_found: bool,
    pub(crate) bg_key_manifest_found: bool,
    pub(crate) bg_boot_policy_found: bool,
    /// Boot Policy key hash recorded from the key manifest
    pub(crate) bg_km_bp_key_hash: Option<Vec<u8>>,
    /// IBB digest recorded from the boot policy
    pub(crate) bg_bp_digest: Option<Vec<u8>>,
    /// Boot Policy signing key modulus, for the KM cross-check
    pub(crate) bg_bp_public_key: Option<Vec<u8>>,
}

impl FfsParser {
    pub fn new() -> Self {
        Self {
            model: TreeModel::new(),
            messages: Messages::new(),
            image: Bytes::new(),
            capsule_offset_fixup: 0,
            last_vtf: None,
            dxe_core: None,
            address_diff: None,
            fit_table: Vec::new(),
            protected_ranges: Vec::new(),
            vendor_hash_files: Vec::new(),
            bg_acm_found: false,
            bg_key_manifest_found: false,
            bg_boot_policy_found: false,
            bg_km_bp_key_hash: None,
            bg_bp_digest: None,
            bg_bp_public_key: None,
        }
    }

    pub fn model(&self) -> &TreeModel {
        &self.model
    }

    pub fn messages(&self) -> &Messages {
        &self.messages
    }

    /// FIT table rows, present when the third pass found a referenced FIT.
    pub fn fit_table(&self) -> &[FitRow] {
        &self.fit_table
    }

    pub(crate) fn msg(&mut self, item: Option<ItemId>, severity: Severity, text: impl Into<String>) {
        self.messages.push(item, severity, text);
    }

    /// Parses a complete flash image. The tree and message log remain
    /// available even when an error is returned; only root-level failures
    /// (no descriptor, buffer too small) leave the tree empty.
    pub fn parse(&mut self, buffer: &[u8]) -> Result<(), ParseError> {
        *self = Self::new();
        self.image = Bytes::from(buffer);
        debug!("parsing image of {:#x} bytes", buffer.len());

        let result = self.perform_first_pass();
        self.add_offsets_recursive(self.model.root());
        result?;

        if self.last_vtf.is_some() {
            self.perform_second_pass();
        } else {
            self.msg(
                None,
                Severity::Warning,
                "parse: not a single Volume Top File is found, the image may be corrupted",
            );
        }

        // The later passes log and skip, they never fail the parse.
        if self.address_diff.is_some() {
            self.parse_fit();
            self.check_protected_ranges();
        }
        Ok(())
    }

    fn perform_first_pass(&mut self) -> Result<(), ParseError> {
        let buffer = self.image.clone();

        if buffer.len() <= core::mem::size_of::<capsule::CapsuleHeader>() {
            self.msg(
                None,
                Severity::Error,
                "performFirstPass: image file is smaller than minimum size of 1Ch (28) bytes",
            );
            return Err(ParseError::InvalidParameter);
        }

        let mut capsule_index = None;
        let mut capsule_header_size = 0usize;

        if buffer.starts_with(guid::EFI_CAPSULE_GUID.as_bytes())
            || buffer.starts_with(guid::INTEL_CAPSULE_GUID.as_bytes())
            || buffer.starts_with(guid::LENOVO_CAPSULE_GUID.as_bytes())
            || buffer.starts_with(guid::LENOVO2_CAPSULE_GUID.as_bytes())
        {
            let header: capsule::CapsuleHeader = buffer.read_struct(0).ok_or(ParseError::InvalidCapsule)?;
            if header.header_size == 0
                || header.header_size as usize > buffer.len()
                || header.header_size > header.capsule_image_size
            {
                self.msg(
                    None,
                    Severity::Error,
                    format!(
                        "performFirstPass: UEFI capsule header size of {} bytes is invalid",
                        size_string(header.header_size as usize)
                    ),
                );
                return Err(ParseError::InvalidCapsule);
            }
            if header.capsule_image_size == 0 || header.capsule_image_size as usize > buffer.len() {
                self.msg(
                    None,
                    Severity::Error,
                    format!(
                        "performFirstPass: UEFI capsule image size of {} bytes is invalid",
                        size_string(header.capsule_image_size as usize)
                    ),
                );
                return Err(ParseError::InvalidCapsule);
            }

            capsule_header_size = header.header_size as usize;
            let info = format!(
                "Capsule GUID: {}\nFull size: {}\nHeader size: {}\nImage size: {}\nFlags: {:08X}h",
                guid::guid_to_string(&header.capsule_guid),
                size_string(buffer.len()),
                size_string(capsule_header_size),
                size_string(header.capsule_image_size as usize - capsule_header_size),
                header.flags
            );
            self.capsule_offset_fixup = capsule_header_size;
            capsule_index = Some(self.model.add_item(
                0,
                ItemType::Capsule,
                Subtype::Capsule(CapsuleSubtype::Uefi),
                "UEFI capsule",
                "",
                info,
                buffer.left(capsule_header_size),
                buffer.from_offset(capsule_header_size),
                true,
                ParsingData::None,
                None,
                InsertMode::Append,
            ));
        } else if buffer.starts_with(guid::TOSHIBA_CAPSULE_GUID.as_bytes()) {
            let header: capsule::ToshibaCapsuleHeader = buffer.read_struct(0).ok_or(ParseError::InvalidCapsule)?;
            if header.header_size == 0
                || header.header_size as usize > buffer.len()
                || header.header_size > header.full_size
            {
                self.msg(
                    None,
                    Severity::Error,
                    format!(
                        "performFirstPass: Toshiba capsule header size of {} bytes is invalid",
                        size_string(header.header_size as usize)
                    ),
                );
                return Err(ParseError::InvalidCapsule);
            }
            if header.full_size == 0 || header.full_size as usize > buffer.len() {
                self.msg(
                    None,
                    Severity::Error,
                    format!(
                        "performFirstPass: Toshiba capsule full size of {} bytes is invalid",
                        size_string(header.full_size as usize)
                    ),
                );
                return Err(ParseError::InvalidCapsule);
            }

            capsule_header_size = header.header_size as usize;
            let info = format!(
                "Capsule GUID: {}\nFull size: {}\nHeader size: {}\nImage size: {}\nFlags: {:08X}h",
                guid::guid_to_string(&header.capsule_guid),
                size_string(buffer.len()),
                size_string(capsule_header_size),
                size_string(header.full_size as usize - capsule_header_size),
                header.flags
            );
            self.capsule_offset_fixup = capsule_header_size;
            capsule_index = Some(self.model.add_item(
                0,
                ItemType::Capsule,
                Subtype::Capsule(CapsuleSubtype::Toshiba),
                "Toshiba capsule",
                "",
                info,
                buffer.left(capsule_header_size),
                buffer.from_offset(capsule_header_size),
                true,
                ParsingData::None,
                None,
                InsertMode::Append,
            ));
        } else if buffer.starts_with(guid::APTIO_SIGNED_CAPSULE_GUID.as_bytes())
            || buffer.starts_with(guid::APTIO_UNSIGNED_CAPSULE_GUID.as_bytes())
        {
            let signed = buffer.starts_with(guid::APTIO_SIGNED_CAPSULE_GUID.as_bytes());

            if buffer.len() <= core::mem::size_of::<capsule::AptioCapsuleHeader>() {
                self.msg(
                    None,
                    Severity::Error,
                    "performFirstPass: AMI capsule image file is smaller than minimum size of 20h (32) bytes",
                );
                return Err(ParseError::InvalidParameter);
            }

            let header: capsule::AptioCapsuleHeader = buffer.read_struct(0).ok_or(ParseError::InvalidCapsule)?;
            if header.rom_image_offset == 0
                || header.rom_image_offset as usize > buffer.len()
                || header.rom_image_offset as u32 > header.capsule_header.capsule_image_size
            {
                self.msg(
                    None,
                    Severity::Error,
                    format!(
                        "performFirstPass: AMI capsule image offset of {} bytes is invalid",
                        size_string(header.rom_image_offset as usize)
                    ),
                );
                return Err(ParseError::InvalidCapsule);
            }
            if header.capsule_header.capsule_image_size == 0
                || header.capsule_header.capsule_image_size as usize > buffer.len()
            {
                self.msg(
                    None,
                    Severity::Error,
                    format!(
                        "performFirstPass: AMI capsule image size of {} bytes is invalid",
                        size_string(header.capsule_header.capsule_image_size as usize)
                    ),
                );
                return Err(ParseError::InvalidCapsule);
            }

            capsule_header_size = header.rom_image_offset as usize;
            let info = format!(
                "Capsule GUID: {}\nFull size: {}\nHeader size: {}\nImage size: {}\nFlags: {:08X}h",
                guid::guid_to_string(&header.capsule_header.capsule_guid),
                size_string(buffer.len()),
                size_string(capsule_header_size),
                size_string(header.capsule_header.capsule_image_size as usize - capsule_header_size),
                header.capsule_header.flags
            );
            self.capsule_offset_fixup = capsule_header_size;
            let subtype =
                if signed { CapsuleSubtype::AptioSigned } else { CapsuleSubtype::AptioUnsigned };
            let index = self.model.add_item(
                0,
                ItemType::Capsule,
                Subtype::Capsule(subtype),
                "AMI Aptio capsule",
                "",
                info,
                buffer.left(capsule_header_size),
                buffer.from_offset(capsule_header_size),
                true,
                ParsingData::None,
                None,
                InsertMode::Append,
            );
            capsule_index = Some(index);

            if signed {
                self.msg(
                    Some(index),
                    Severity::Warning,
                    "performFirstPass: Aptio capsule signature may become invalid after image modifications",
                );
            }
        }

        // Skip the capsule header to get the flash chip image.
        let flash_image = buffer.from_offset(capsule_header_size);

        // Check for an Intel flash descriptor.
        let descriptor_signature =
            flash_image.read_struct::<descriptor::DescriptorHeader>(0).map(|header| header.signature);
        if descriptor_signature == Some(descriptor::FLASH_DESCRIPTOR_SIGNATURE) {
            match self.parse_intel_image(&flash_image, capsule_header_size, capsule_index) {
                Err(ParseError::InvalidFlashDescriptor) => {
                    // Fall through and parse as a plain UEFI image.
                }
                result => return result,
            }
        }

        let info = format!("Full size: {}", size_string(flash_image.len()));
        let image_index = self.model.add_item(
            capsule_header_size,
            ItemType::Image,
            Subtype::Image(ImageSubtype::Uefi),
            "UEFI image",
            "",
            info,
            Bytes::new(),
            flash_image,
            true,
            ParsingData::None,
            capsule_index,
            InsertMode::Append,
        );

        self.parse_raw_area(image_index)
    }

    /// Classifies padding content: all-0x00, all-0xFF, or arbitrary data.
    pub(crate) fn padding_subtype(padding: &Bytes) -> PaddingSubtype {
        if padding.all(0x00) {
            PaddingSubtype::Zero
        } else if padding.all(0xFF) {
            PaddingSubtype::One
        } else {
            PaddingSubtype::Data
        }
    }

    pub(crate) fn add_padding_item(
        &mut self,
        offset: usize,
        name: &str,
        padding: Bytes,
        parent: ItemId,
    ) -> ItemId {
        let info = format!("Full size: {}", size_string(padding.len()));
        self.model.add_item(
            offset,
            ItemType::Padding,
            Subtype::Padding(Self::padding_subtype(&padding)),
            name,
            "",
            info,
            Bytes::new(),
            padding,
            true,
            ParsingData::None,
            Some(parent),
            InsertMode::Append,
        )
    }

    /// Walks a byte range that may contain any number of firmware volumes
    /// separated by padding. `parent`'s body is the range walked.
    pub(crate) fn parse_raw_area(&mut self, parent: ItemId) -> Result<(), ParseError> {
        let data = self.model.body(parent).clone();
        let base_offset = self.model.offset(parent) + self.model.header(parent).len();

        // Find the first volume.
        let mut result = self.find_next_volume(parent, &data, base_offset, 0);
        let mut prev_volume_offset = match result {
            Ok(offset) => offset,
            Err(err) => return Err(err),
        };

        // Bytes before the first volume are padding.
        if prev_volume_offset > 0 {
            self.add_padding_item(base_offset, "Padding", data.left(prev_volume_offset), parent);
        }

        let mut prev_volume_size = 0usize;
        let mut first_error = Ok(());

        while let Ok(volume_offset) = result {
            // Padding between volumes.
            if volume_offset > prev_volume_offset + prev_volume_size {
                let padding_offset = prev_volume_offset + prev_volume_size;
                let padding = data.mid(padding_offset, volume_offset - padding_offset);
                self.add_padding_item(base_offset + padding_offset, "Padding", padding, parent);
            }

            let (volume_size, bm_volume_size) = match self.get_volume_size(&data, volume_offset) {
                Ok(sizes) => sizes,
                Err(err) => {
                    self.msg(
                        Some(parent),
                        Severity::Error,
                        format!("parseRawArea: getVolumeSize failed with error \"{}\"", err),
                    );
                    return Err(err);
                }
            };

            // A volume that overlaps the end of the area truncates the walk:
            // the remaining bytes become padding.
            if volume_offset + volume_size > data.len() {
                let padding = data.from_offset(volume_offset);
                let padding_index =
                    self.add_padding_item(base_offset + volume_offset, "Padding", padding, parent);
                self.msg(
                    Some(padding_index),
                    Severity::Warning,
                    "parseRawArea: one of volumes inside overlaps the end of data",
                );
                if first_error.is_ok() {
                    first_error = Err(ParseError::InvalidVolume);
                }
                prev_volume_offset = volume_offset;
                prev_volume_size = data.len() - volume_offset;
                break;
            }

            let volume = data.mid(volume_offset, volume_size);
            match self.parse_volume_header(&volume, self.model.header(parent).len() + volume_offset, parent) {
                Ok(volume_index) => {
                    if volume_size != bm_volume_size {
                        self.msg(
                            Some(volume_index),
                            Severity::Warning,
                            format!(
                                "parseRawArea: volume size stored in header {} differs from size calculated using block map {}",
                                size_string(volume_size),
                                size_string(bm_volume_size)
                            ),
                        );
                    }
                }
                Err(err) => {
                    self.msg(
                        Some(parent),
                        Severity::Error,
                        format!("parseRawArea: volume header parsing failed with error \"{}\"", err),
                    );
                    if first_error.is_ok() {
                        first_error = Err(err);
                    }
                }
            }

            prev_volume_offset = volume_offset;
            prev_volume_size = volume_size;
            result = self.find_next_volume(parent, &data, base_offset, volume_offset + volume_size);
        }

        // Padding at the end of the area.
        let end_offset = prev_volume_offset + prev_volume_size;
        if data.len() > end_offset {
            self.add_padding_item(base_offset + end_offset, "Padding", data.from_offset(end_offset), parent);
        }

        // Parse the volume bodies.
        for child in self.model.children(parent).to_vec() {
            match self.model.item_type(child) {
                ItemType::Volume => self.parse_volume_body(child)?,
                ItemType::Padding => {} // no parsing required
                _ => return Err(ParseError::UnknownItemType),
            }
        }

        first_error
    }

    /// Annotates every node with its offset (uncompressed nodes only, plus
    /// the first level below a compressed boundary) and the
    /// compressed/fixed flags.
    fn add_offsets_recursive(&mut self, index: ItemId) {
        if index != self.model.root() {
            let show_offset = !self.model.compressed(index)
                || self.model.parent(index).is_some_and(|p| !self.model.compressed(p));
            if show_offset {
                let offset_info = format!("Offset: {:X}h\n", self.model.offset(index));
                self.model.add_info(index, &offset_info, false);
            }
            let compressed = self.model.compressed(index);
            self.model.add_info(index, if compressed { "\nCompressed: Yes" } else { "\nCompressed: No" }, true);
            let fixed = self.model.fixed(index);
            self.model.add_info(index, if fixed { "\nFixed: Yes" } else { "\nFixed: No" }, true);
        }

        for child in self.model.children(index).to_vec() {
            self.add_offsets_recursive(child);
        }
    }
}

impl Default for FfsParser {
    fn default() -> Self {
        Self::new()
    }
}
