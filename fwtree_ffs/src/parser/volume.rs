//! Firmware volume discovery and parsing.
//!
//! Volumes are found by scanning raw areas for the `_FVH` signature,
//! backing off to the header start, and validating the candidate before
//! trusting its declared length. The volume body walk produces File,
//! FreeSpace, and Padding children.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use fwtree_pi::ffs::file as pi_file;
use fwtree_pi::fv;
use fwtree_pi::guid;

use crate::bytes::Bytes;
use crate::checksum::checksum16;
use crate::err::ParseError;
use crate::model::{
    InsertMode, ItemId, ItemType, PaddingSubtype, ParsingData, Subtype, VolumeParsingData, VolumeSubtype,
};
use crate::msg::Severity;
use crate::parser::{align8, size_string, FfsParser};

const VOLUME_HEADER_SIZE: usize = core::mem::size_of::<fv::Header>();
const BLOCK_MAP_ENTRY_SIZE: usize = core::mem::size_of::<fv::BlockMapEntry>();

/// Offset of the `checksum` field inside the volume header.
const VOLUME_CHECKSUM_OFFSET: usize = 50;

impl FfsParser {
    /// Finds the next valid volume at or after `from` within `data`.
    /// Candidates with an insane length, reserved byte, or revision are
    /// skipped with a message and the scan continues.
    pub(crate) fn find_next_volume(
        &mut self,
        parent: ItemId,
        data: &Bytes,
        parent_offset: usize,
        from: usize,
    ) -> Result<usize, ParseError> {
        let mut candidate = data.index_of(&fv::FV_SIGNATURE, from);
        while let Some(signature_index) = candidate {
            let next = data.index_of(&fv::FV_SIGNATURE, signature_index + 1);
            if signature_index < fv::FV_SIGNATURE_OFFSET {
                candidate = next;
                continue;
            }
            let volume_offset = signature_index - fv::FV_SIGNATURE_OFFSET;
            let Some(header) = data.read_struct::<fv::Header>(volume_offset) else {
                candidate = next;
                continue;
            };
            if header.fv_length < (VOLUME_HEADER_SIZE + 2 * BLOCK_MAP_ENTRY_SIZE) as u64
                || header.fv_length >= 0xFFFF_FFFF
            {
                self.msg(
                    Some(parent),
                    Severity::Warning,
                    format!(
                        "findNextVolume: volume candidate at offset {:X}h skipped, has invalid FvLength {:X}h",
                        parent_offset + volume_offset,
                        header.fv_length
                    ),
                );
                candidate = next;
                continue;
            }
            if header.revision != 1 && header.revision != 2 {
                self.msg(
                    Some(parent),
                    Severity::Warning,
                    format!(
                        "findNextVolume: volume candidate at offset {:X}h skipped, has invalid Revision byte value {}",
                        parent_offset + volume_offset,
                        header.revision
                    ),
                );
                candidate = next;
                continue;
            }
            // Revision 2 headers repurpose nothing here, but revision 1
            // requires the reserved byte to match an erased or zeroed cell.
            if header.revision == 1 && header.reserved != 0xFF && header.reserved != 0x00 {
                self.msg(
                    Some(parent),
                    Severity::Warning,
                    format!(
                        "findNextVolume: volume candidate at offset {:X}h skipped, has invalid Reserved byte value {}",
                        parent_offset + volume_offset,
                        header.reserved
                    ),
                );
                candidate = next;
                continue;
            }
            return Ok(volume_offset);
        }
        Err(ParseError::VolumesNotFound)
    }

    /// Volume size from the header plus the size computed from the block
    /// map, for the cross-check message.
    pub(crate) fn get_volume_size(&self, data: &Bytes, volume_offset: usize) -> Result<(usize, usize), ParseError> {
        if data.len() < volume_offset + VOLUME_HEADER_SIZE + 2 * BLOCK_MAP_ENTRY_SIZE {
            return Err(ParseError::InvalidVolume);
        }
        let header: fv::Header = data.read_struct(volume_offset).ok_or(ParseError::InvalidVolume)?;
        if header.signature.to_le_bytes() != fv::FV_SIGNATURE {
            return Err(ParseError::InvalidVolume);
        }

        let mut bm_volume_size = 0usize;
        let mut entry_offset = volume_offset + VOLUME_HEADER_SIZE;
        while let Some(entry) = data.read_struct::<fv::BlockMapEntry>(entry_offset) {
            if entry.num_blocks == 0 || entry.length == 0 {
                break;
            }
            bm_volume_size += (entry.num_blocks as usize) * (entry.length as usize);
            entry_offset += BLOCK_MAP_ENTRY_SIZE;
        }

        let volume_size = header.fv_length as usize;
        if volume_size == 0 {
            return Err(ParseError::InvalidVolume);
        }
        Ok((volume_size, bm_volume_size))
    }

    /// Parses one volume header and emits the Volume node. `local_offset`
    /// is relative to the parent node's start.
    pub(crate) fn parse_volume_header(
        &mut self,
        volume: &Bytes,
        local_offset: usize,
        parent: ItemId,
    ) -> Result<ItemId, ParseError> {
        if volume.is_empty() {
            return Err(ParseError::InvalidParameter);
        }
        if volume.len() < VOLUME_HEADER_SIZE {
            self.msg(
                None,
                Severity::Error,
                format!(
                    "parseVolumeHeader: input volume size {} is smaller than volume header size 38h (56)",
                    size_string(volume.len())
                ),
            );
            return Err(ParseError::InvalidVolume);
        }

        let header: fv::Header = volume.read_struct(0).ok_or(ParseError::InvalidVolume)?;

        if (header.header_length as usize) < VOLUME_HEADER_SIZE {
            self.msg(None, Severity::Error, "parseVolumeHeader: volume header length is smaller than the fixed header");
            return Err(ParseError::InvalidVolume);
        }
        if align8(header.header_length as usize) > volume.len() {
            self.msg(None, Severity::Error, "parseVolumeHeader: volume header overlaps the end of data");
            return Err(ParseError::InvalidVolume);
        }
        if header.revision > 1
            && header.ext_header_offset != 0
            && align8(header.ext_header_offset as usize + core::mem::size_of::<fv::ExtHeader>()) > volume.len()
        {
            self.msg(None, Severity::Error, "parseVolumeHeader: extended volume header overlaps the end of data");
            return Err(ParseError::InvalidVolume);
        }

        // Effective header size includes the extended header when present.
        let mut has_extended_header = false;
        let mut extended_header_guid = r_efi::efi::Guid::from_bytes(&[0u8; 16]);
        let mut header_size = header.header_length as usize;
        if header.revision > 1 && header.ext_header_offset != 0 {
            has_extended_header = true;
            let ext_header: fv::ExtHeader =
                volume.read_struct(header.ext_header_offset as usize).ok_or(ParseError::InvalidVolume)?;
            header_size = header.ext_header_offset as usize + ext_header.ext_header_size as usize;
            extended_header_guid = ext_header.fv_name;
        }
        // Extended header end can be unaligned.
        header_size = align8(header_size).min(volume.len());

        // Filesystem classification.
        let mut subtype = VolumeSubtype::Unknown;
        let mut ffs_version = 0u8;
        if guid::FFS_V2_VOLUMES.contains(&header.file_system_guid) {
            subtype = VolumeSubtype::Ffs2;
            ffs_version = 2;
        } else if guid::FFS_V3_VOLUMES.contains(&header.file_system_guid) {
            subtype = VolumeSubtype::Ffs3;
            ffs_version = 3;
        } else if guid::NVRAM_VOLUMES.contains(&header.file_system_guid) {
            subtype = VolumeSubtype::Nvram;
        }
        let is_unknown = subtype == VolumeSubtype::Unknown;

        // Revision and alignment checks.
        let mut msg_alignment_bits_set = false;
        let mut msg_unaligned = false;
        let mut msg_unknown_revision = false;
        let mut alignment = 65536u32; // default volume alignment is 64K
        if header.revision == 1 {
            // Revision 1 alignment attributes are ignored on purpose; the
            // capability bit is only used to flag inconsistent headers.
            let alignment_cap = header.attributes & fv::attributes::ALIGNMENT_CAP != 0;
            if !alignment_cap && (header.attributes & 0xFFFF_0000) != 0 {
                msg_alignment_bits_set = true;
            }
        } else if header.revision == 2 {
            alignment = 1u32 << ((header.attributes & fv::attributes::ALIGNMENT) >> 16);
            let absolute = self.model.offset(parent) + local_offset;
            if !is_unknown
                && !self.model.compressed(parent)
                && (absolute - self.capsule_offset_fixup) % alignment as usize != 0
            {
                msg_unaligned = true;
            }
        } else {
            msg_unknown_revision = true;
        }

        let empty_byte: u8 = if header.attributes & fv::attributes::ERASE_POLARITY != 0 { 0xFF } else { 0x00 };

        // Apple extensions hide in the zero vector: a CRC32 of the volume
        // body at word 2 and a used-space offset at word 3.
        let mut has_apple_crc32 = false;
        let mut used_space = false;
        let apple_crc32 = volume.read_u32(8).unwrap_or(0);
        let apple_free_space_offset = volume.read_u32(12).unwrap_or(0);
        if apple_crc32 != 0 {
            let crc = crc32fast::hash(&volume.as_slice()[header.header_length as usize..]);
            if crc == apple_crc32 {
                has_apple_crc32 = true;
                if apple_free_space_offset != 0 {
                    used_space = true;
                }
            }
        }

        // Recompute the header checksum with the checksum field zeroed.
        let mut temp_header = volume.as_slice()[..header.header_length as usize].to_vec();
        temp_header[VOLUME_CHECKSUM_OFFSET] = 0;
        temp_header[VOLUME_CHECKSUM_OFFSET + 1] = 0;
        let calculated = checksum16(&temp_header);
        let msg_invalid_checksum = header.checksum != calculated;
        let checksum_string = if msg_invalid_checksum {
            format!("invalid, should be {:04X}h", calculated)
        } else {
            String::from("valid")
        };

        let header_bytes = volume.left(header_size);
        let body_bytes = volume.from_offset(header_size);
        let name = guid::guid_to_string(&header.file_system_guid);
        let zv = &volume.as_slice()[..16];
        let mut info = format!(
            "ZeroVector:\n{:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X}\n{:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X} {:02X}",
            zv[0], zv[1], zv[2], zv[3], zv[4], zv[5], zv[6], zv[7], zv[8], zv[9], zv[10], zv[11], zv[12], zv[13],
            zv[14], zv[15]
        );
        info.push_str(&format!(
            "\nFileSystem GUID: {}\nFull size: {}\nHeader size: {}\nBody size: {}\nRevision: {}\nAttributes: {:08X}h\nErase polarity: {}\nChecksum: {:04X}h, {}",
            name,
            size_string(volume.len()),
            size_string(header_size),
            size_string(volume.len() - header_size),
            header.revision,
            header.attributes,
            if empty_byte == 0xFF { "1" } else { "0" },
            header.checksum,
            checksum_string
        ));
        if has_extended_header {
            info.push_str(&format!("\nVolume GUID: {}", guid::guid_to_string(&extended_header_guid)));
        }

        let mut text = String::new();
        if has_apple_crc32 {
            text.push_str("AppleCRC32 ");
        }
        if used_space {
            text.push_str("UsedSpace ");
        }

        let parsing_data = ParsingData::Volume(VolumeParsingData {
            empty_byte,
            ffs_version,
            has_extended_header,
            extended_header_guid,
            alignment,
            revision: header.revision,
            has_apple_crc32,
            used_space,
            is_weak_aligned: header.revision > 1 && (header.attributes & fv::attributes::WEAK_ALIGNMENT) != 0,
        });

        let absolute_offset = self.model.offset(parent) + local_offset;
        let index = self.model.add_item(
            absolute_offset,
            ItemType::Volume,
            Subtype::Volume(subtype),
            name,
            text,
            info,
            header_bytes,
            body_bytes,
            true,
            parsing_data,
            Some(parent),
            InsertMode::Append,
        );

        if is_unknown {
            self.msg(
                Some(index),
                Severity::Warning,
                format!("parseVolumeHeader: unknown file system {}", guid::guid_to_string(&header.file_system_guid)),
            );
        }
        if msg_invalid_checksum {
            self.msg(Some(index), Severity::Warning, "parseVolumeHeader: volume header checksum is invalid");
        }
        if msg_alignment_bits_set {
            self.msg(
                Some(index),
                Severity::Warning,
                "parseVolumeHeader: alignment bits set on volume without alignment capability",
            );
        }
        if msg_unaligned {
            self.msg(Some(index), Severity::Warning, "parseVolumeHeader: unaligned volume");
        }
        if msg_unknown_revision {
            self.msg(Some(index), Severity::Warning, "parseVolumeHeader: unknown volume revision");
        }

        Ok(index)
    }

    /// Walks the files of a parsed volume.
    pub(crate) fn parse_volume_body(&mut self, index: ItemId) -> Result<(), ParseError> {
        let volume_body = self.model.body(index).clone();
        let volume_header_size = self.model.header(index).len();

        let ParsingData::Volume(pdata) = self.model.parsing_data(index).clone() else {
            return Err(ParseError::InvalidParameter);
        };
        if pdata.ffs_version != 2 && pdata.ffs_version != 3 {
            // Unknown and NVRAM volumes are left unparsed.
            return Ok(());
        }
        let empty_byte = pdata.empty_byte;

        let volume_body_size = volume_body.len();
        let mut file_offset = 0usize;

        while file_offset < volume_body_size {
            let file_size = Self::get_file_size(&volume_body, file_offset, pdata.ffs_version);

            if file_size < core::mem::size_of::<pi_file::Header>() || file_size > volume_body_size - file_offset {
                // Either free space or damaged data from here on.
                let header_probe = volume_body.mid(file_offset, core::mem::size_of::<pi_file::Header>());
                if header_probe.all(empty_byte) {
                    let free_space = volume_body.from_offset(file_offset);
                    if !free_space.all(empty_byte) {
                        // Search for the first non-empty byte.
                        let first_used =
                            free_space.as_slice().iter().position(|&b| b != empty_byte).unwrap_or(free_space.len());
                        // Align the split down to the file alignment; the
                        // leading empty run is known to be at least a
                        // header long, so this cannot underflow.
                        let mut split = first_used;
                        if split != align8(split) {
                            split = align8(split) - 8;
                        }

                        if split > 0 {
                            let free = free_space.left(split);
                            let info = format!("Full size: {}", size_string(free.len()));
                            self.model.add_item(
                                self.model.offset(index) + volume_header_size + file_offset,
                                ItemType::FreeSpace,
                                Subtype::None,
                                "Volume free space",
                                "",
                                info,
                                Bytes::new(),
                                free,
                                false,
                                ParsingData::None,
                                Some(index),
                                InsertMode::Append,
                            );
                        }
                        self.parse_volume_non_uefi_data(
                            free_space.from_offset(split),
                            volume_header_size + file_offset + split,
                            index,
                        );
                    } else {
                        let info = format!("Full size: {}", size_string(free_space.len()));
                        self.model.add_item(
                            self.model.offset(index) + volume_header_size + file_offset,
                            ItemType::FreeSpace,
                            Subtype::None,
                            "Volume free space",
                            "",
                            info,
                            Bytes::new(),
                            free_space,
                            false,
                            ParsingData::None,
                            Some(index),
                            InsertMode::Append,
                        );
                    }
                } else {
                    // Not empty: non-UEFI data fills the rest.
                    self.parse_volume_non_uefi_data(
                        volume_body.from_offset(file_offset),
                        volume_header_size + file_offset,
                        index,
                    );
                }
                break;
            }

            let file = volume_body.mid(file_offset, file_size);
            if let Err(err) = self.parse_file_header(&file, volume_header_size + file_offset, index) {
                self.msg(
                    Some(index),
                    Severity::Error,
                    format!("parseVolumeBody: file header parsing failed with error \"{}\"", err),
                );
            }

            file_offset += file_size;
            file_offset = align8(file_offset);
        }

        // Duplicate GUIDs between non-pad files are always suspicious.
        let children = self.model.children(index).to_vec();
        for (position, &current) in children.iter().enumerate() {
            if self.model.item_type(current) != ItemType::File
                || self.model.subtype(current) == Subtype::File(pi_file::raw::r#type::FFS_PAD)
            {
                continue;
            }
            let current_guid = guid::guid_from_bytes(self.model.header(current).as_slice());
            for &another in &children[position + 1..] {
                if self.model.item_type(another) != ItemType::File {
                    continue;
                }
                let another_guid = guid::guid_from_bytes(self.model.header(another).as_slice());
                if current_guid.is_some() && current_guid == another_guid {
                    self.msg(
                        Some(another),
                        Severity::Warning,
                        format!(
                            "parseVolumeBody: file with duplicate GUID {}",
                            guid::guid_to_string(&another_guid.unwrap())
                        ),
                    );
                }
            }
        }

        // Parse the file bodies.
        for child in children {
            match self.model.item_type(child) {
                ItemType::File => {
                    let _ = self.parse_file_body(child);
                }
                ItemType::Padding | ItemType::FreeSpace => {} // no parsing required
                _ => return Err(ParseError::UnknownItemType),
            }
        }

        Ok(())
    }

    /// Handles a range of volume free space that turned out not to be
    /// empty. A Volume Top File hiding at the end of the range is
    /// recovered; everything before it is reported as non-UEFI data.
    pub(crate) fn parse_volume_non_uefi_data(&mut self, data: Bytes, local_offset: usize, index: ItemId) {
        let ffs_version = match self.model.parsing_data(index) {
            ParsingData::Volume(pdata) => pdata.ffs_version,
            _ => 2,
        };

        let mut padding = data.clone();
        let mut vtf = None;
        if let Some(vtf_index) = data.last_index_of(guid::EFI_FFS_VOLUME_TOP_FILE_GUID.as_bytes()) {
            let candidate = data.from_offset(vtf_index);
            let large_file = candidate
                .read_struct::<pi_file::Header>(0)
                .map(|h| ffs_version == 3 && h.attributes & pi_file::raw::attribute::LARGE_FILE != 0)
                .unwrap_or(false);
            let minimum = if large_file {
                core::mem::size_of::<pi_file::Header2>()
            } else {
                core::mem::size_of::<pi_file::Header>()
            };
            if candidate.len() >= minimum {
                padding = data.left(vtf_index);
                vtf = Some((vtf_index, candidate));
            }
        }

        let info = format!("Full size: {}", size_string(padding.len()));
        let padding_index = self.model.add_item(
            self.model.offset(index) + local_offset,
            ItemType::Padding,
            Subtype::Padding(PaddingSubtype::Data),
            "Non-UEFI data",
            "",
            info,
            Bytes::new(),
            padding,
            true,
            ParsingData::None,
            Some(index),
            InsertMode::Append,
        );
        self.msg(
            Some(padding_index),
            Severity::Warning,
            "parseVolumeNonUefiData: non-UEFI data found in volume's free space",
        );

        if let Some((vtf_index, vtf_bytes)) = vtf {
            if let Err(err) = self.parse_file_header(&vtf_bytes, local_offset + vtf_index, index) {
                self.msg(
                    Some(index),
                    Severity::Error,
                    format!("parseVolumeNonUefiData: VTF file header parsing failed with error \"{}\"", err),
                );
                let info = format!("Full size: {}", size_string(vtf_bytes.len()));
                let rest_index = self.model.add_item(
                    self.model.offset(index) + local_offset + vtf_index,
                    ItemType::Padding,
                    Subtype::Padding(PaddingSubtype::Data),
                    "Non-UEFI data",
                    "",
                    info,
                    Bytes::new(),
                    vtf_bytes,
                    true,
                    ParsingData::None,
                    Some(index),
                    InsertMode::Append,
                );
                self.msg(
                    Some(rest_index),
                    Severity::Warning,
                    "parseVolumeNonUefiData: non-UEFI data found in volume's free space",
                );
            }
        }
    }
}
