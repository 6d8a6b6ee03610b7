//! FFS file header and body parsing.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use fwtree_pi::ffs::file as pi_file;
use fwtree_pi::guid;

use crate::bootguard::VendorHashDialect;
use crate::bytes::Bytes;
use crate::checksum::checksum8;
use crate::err::ParseError;
use crate::model::{
    FileParsingData, InsertMode, ItemId, ItemType, PaddingSubtype, ParsingData, Subtype, VolumeParsingData,
};
use crate::msg::Severity;
use crate::parser::{align8, size_string, FfsParser};

impl FfsParser {
    /// File size at `file_offset`, honoring the FFSv3 extended header.
    /// Returns 0 when the header cannot be read.
    pub(crate) fn get_file_size(volume_body: &Bytes, file_offset: usize, ffs_version: u8) -> usize {
        match ffs_version {
            2 => volume_body
                .read_struct::<pi_file::Header>(file_offset)
                .map(|h| (u32::from_le_bytes([h.size[0], h.size[1], h.size[2], 0])) as usize)
                .unwrap_or(0),
            3 => match volume_body.read_struct::<pi_file::Header2>(file_offset) {
                Some(h) if h.header.attributes & pi_file::raw::attribute::LARGE_FILE != 0 => {
                    h.extended_size as usize
                }
                _ => volume_body
                    .read_struct::<pi_file::Header>(file_offset)
                    .map(|h| (u32::from_le_bytes([h.size[0], h.size[1], h.size[2], 0])) as usize)
                    .unwrap_or(0),
            },
            _ => 0,
        }
    }

    /// Parses one file header and emits the File node.
    /// `local_offset` is relative to the parent volume node's start.
    pub(crate) fn parse_file_header(
        &mut self,
        file: &Bytes,
        local_offset: usize,
        parent: ItemId,
    ) -> Result<ItemId, ParseError> {
        if file.is_empty() {
            return Err(ParseError::InvalidParameter);
        }
        if file.len() < core::mem::size_of::<pi_file::Header>() {
            return Err(ParseError::InvalidFile);
        }

        let volume_pdata: VolumeParsingData = match self.model.parsing_data(parent) {
            ParsingData::Volume(pdata) => pdata.clone(),
            _ => return Err(ParseError::InvalidParameter),
        };

        let header: pi_file::Header = file.read_struct(0).ok_or(ParseError::InvalidFile)?;
        let mut header_size = core::mem::size_of::<pi_file::Header>();
        if volume_pdata.ffs_version == 3 && header.attributes & pi_file::raw::attribute::LARGE_FILE != 0 {
            if file.len() < core::mem::size_of::<pi_file::Header2>() {
                return Err(ParseError::InvalidFile);
            }
            header_size = core::mem::size_of::<pi_file::Header2>();
        }
        let header_bytes = file.left(header_size);

        // Data alignment from the 3-bit field, checked against both the
        // data base and the parent volume's alignment.
        let alignment_power =
            pi_file::ALIGNMENT_POWERS[((header.attributes & pi_file::raw::attribute::DATA_ALIGNMENT) >> 3) as usize];
        let alignment = 1u32 << alignment_power;
        let msg_unaligned_file = (local_offset + header_size) % alignment as usize != 0;
        let msg_alignment_above_volume = !volume_pdata.is_weak_aligned && volume_pdata.alignment < alignment;

        // Header checksum over the header with both integrity bytes zeroed.
        let mut temp_header = header_bytes.as_slice().to_vec();
        temp_header[16] = 0; // IntegrityCheck.Checksum.Header
        temp_header[17] = 0; // IntegrityCheck.Checksum.File
        let calculated_header = checksum8(&temp_header[..temp_header.len() - 1]);
        let msg_invalid_header_checksum = header.integrity_check_header != calculated_header;
        let header_checksum_string = if msg_invalid_header_checksum {
            format!("invalid, should be {:02X}h", calculated_header)
        } else {
            String::from("valid")
        };

        // Body and optional revision 1 tail.
        let mut body = file.from_offset(header_size);
        let mut tail = Bytes::new();
        let mut msg_invalid_tail_value = false;
        let has_tail =
            volume_pdata.revision == 1 && header.attributes & pi_file::raw::attribute::TAIL_PRESENT != 0;
        if has_tail && body.len() >= 2 {
            let tail_bytes = body.right(2);
            let tail_value = tail_bytes.read_u16(0).unwrap_or(0);
            if header.tail_reference() != !tail_value {
                msg_invalid_tail_value = true;
            }
            body = body.left(body.len() - 2);
            tail = tail_bytes;
        }

        // Data checksum: computed when the attribute is set, a fixed
        // constant otherwise.
        let expected_data_checksum = if header.attributes & pi_file::raw::attribute::CHECKSUM != 0 {
            checksum8(body.as_slice())
        } else {
            pi_file::FFS_FIXED_CHECKSUM
        };
        let msg_invalid_data_checksum = header.integrity_check_file != expected_data_checksum;
        let data_checksum_string = if msg_invalid_data_checksum {
            format!("invalid, should be {:02X}h", expected_data_checksum)
        } else {
            String::from("valid")
        };

        // Types above the documented range are reported, pad files aside.
        let msg_unknown_type = header.file_type > pi_file::raw::r#type::MM_CORE_STANDALONE
            && header.file_type != pi_file::raw::r#type::FFS_PAD;

        let name = if header.file_type != pi_file::raw::r#type::FFS_PAD {
            guid::guid_to_string(&header.name)
        } else {
            String::from("Pad-file")
        };
        let mut info = format!(
            "File GUID: {}\nType: {:02X}h\nAttributes: {:02X}h\nFull size: {}\nHeader size: {}\nBody size: {}",
            guid::guid_to_string(&header.name),
            header.file_type,
            header.attributes,
            size_string(header_bytes.len() + body.len() + tail.len()),
            size_string(header_bytes.len()),
            size_string(body.len())
        );
        info.push_str(&format!(
            "\nState: {:02X}h\nHeader checksum: {:02X}h, {}\nData checksum: {:02X}h, {}",
            header.state, header.integrity_check_header, header_checksum_string, header.integrity_check_file,
            data_checksum_string
        ));

        // The last VTF anchors the second pass; the first DXE core roots
        // the old-style AMI protected range.
        let is_vtf = header.name == guid::EFI_FFS_VOLUME_TOP_FILE_GUID;
        let text = if is_vtf { "Volume Top File" } else { "" };

        let fixed = header.attributes & pi_file::raw::attribute::FIXED != 0;
        let parsing_data = ParsingData::File(FileParsingData { empty_byte: volume_pdata.empty_byte, guid: header.name });

        let index = self.model.add_item(
            self.model.offset(parent) + local_offset,
            ItemType::File,
            Subtype::File(header.file_type),
            name,
            text,
            info,
            header_bytes,
            body,
            fixed,
            parsing_data,
            Some(parent),
            InsertMode::Append,
        );
        if !tail.is_empty() {
            self.model.set_tail(index, tail);
        }

        if is_vtf {
            // Latest wins: only the last VTF maps to 0xFFFFFFFF.
            self.last_vtf = Some(index);
        }
        if header.file_type == pi_file::raw::r#type::DXE_CORE && self.dxe_core.is_none() {
            self.dxe_core = Some(index);
        }

        if msg_unaligned_file {
            self.msg(Some(index), Severity::Warning, "parseFileHeader: unaligned file");
        }
        if msg_alignment_above_volume {
            self.msg(
                Some(index),
                Severity::Warning,
                format!(
                    "parseFileHeader: file alignment {:X}h is greater than parent volume alignment {:X}h",
                    alignment, volume_pdata.alignment
                ),
            );
        }
        if msg_invalid_header_checksum {
            self.msg(Some(index), Severity::Warning, "parseFileHeader: invalid header checksum");
        }
        if msg_invalid_data_checksum {
            self.msg(Some(index), Severity::Warning, "parseFileHeader: invalid data checksum");
        }
        if msg_invalid_tail_value {
            self.msg(Some(index), Severity::Warning, "parseFileHeader: invalid tail value");
        }
        if msg_unknown_type {
            self.msg(
                Some(index),
                Severity::Warning,
                format!("parseFileHeader: unknown file type {:02X}h", header.file_type),
            );
        }

        Ok(index)
    }

    /// Dispatches a file body by its type.
    pub(crate) fn parse_file_body(&mut self, index: ItemId) -> Result<(), ParseError> {
        if self.model.item_type(index) != ItemType::File {
            return Ok(());
        }
        let Subtype::File(file_type) = self.model.subtype(index) else {
            return Ok(());
        };

        if file_type == pi_file::raw::r#type::FFS_PAD {
            return self.parse_pad_file_body(index);
        }

        // Vendor hash files and the NVAR store are recognised by GUID
        // regardless of the declared file type; the NVAR store belongs to
        // the external NVRAM parser.
        if let ParsingData::File(pdata) = self.model.parsing_data(index) {
            let file_guid = pdata.guid;
            if file_guid == guid::VENDOR_HASH_FILE_GUID_PHOENIX {
                return self.parse_vendor_hash_file(VendorHashDialect::Phoenix, index);
            }
            if file_guid == guid::VENDOR_HASH_FILE_GUID_AMI_NEW {
                return self.parse_vendor_hash_file(VendorHashDialect::AmiNew, index);
            }
            if file_guid == guid::VENDOR_HASH_FILE_GUID_AMI_OLD {
                return self.parse_vendor_hash_file(VendorHashDialect::AmiOld, index);
            }
            if file_guid == guid::NVRAM_NVAR_STORE_FILE_GUID {
                return Ok(());
            }
        }

        if file_type == pi_file::raw::r#type::RAW || file_type == pi_file::raw::r#type::ALL {
            return match self.parse_raw_area(index) {
                Err(ParseError::VolumesNotFound) => Ok(()),
                result => result,
            };
        }

        let body = self.model.body(index).clone();
        self.parse_sections(&body, index, false)
    }

    /// Pad file bodies must be entirely empty; anything else is split into
    /// leading free space and trailing non-UEFI data.
    pub(crate) fn parse_pad_file_body(&mut self, index: ItemId) -> Result<(), ParseError> {
        let empty_byte = match self.model.parsing_data(index) {
            ParsingData::File(pdata) => pdata.empty_byte,
            _ => 0xFF,
        };

        let body = self.model.body(index).clone();
        if body.all(empty_byte) {
            return Ok(());
        }

        let first_used = body.as_slice().iter().position(|&b| b != empty_byte).unwrap_or(0);
        let mut split = first_used;
        if split >= 8 {
            if split != align8(split) {
                split = align8(split) - 8;
            }
            let free = body.left(split);
            let info = format!("Full size: {}", size_string(free.len()));
            self.model.add_item(
                self.model.offset(index) + self.model.header(index).len(),
                ItemType::FreeSpace,
                Subtype::None,
                "Free space",
                "",
                info,
                Bytes::new(),
                free,
                false,
                ParsingData::None,
                Some(index),
                InsertMode::Append,
            );
        } else {
            split = 0;
        }

        let padding = body.from_offset(split);
        let info = format!("Full size: {}", size_string(padding.len()));
        let data_index = self.model.add_item(
            self.model.offset(index) + self.model.header(index).len() + split,
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
        self.msg(Some(data_index), Severity::Warning, "parsePadFileBody: non-UEFI data found in pad-file");
        self.model.set_name(index, "Non-empty pad-file");
        Ok(())
    }
}
