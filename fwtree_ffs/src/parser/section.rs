//! FFS section parsing: headers, encapsulation bodies, structured leaves.
//!
//! Section enumeration runs in two modes. The final mode adds tree nodes
//! and logs messages. The pre-parse mode validates only: it is used to
//! disambiguate the "undecided" compression algorithm by checking which
//! candidate output enumerates cleanly as sections, and must not leave any
//! trace in the tree or the log.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use fwtree_extract::Algorithm;
use fwtree_pi::ffs::{depex, section as pi_section};
use fwtree_pi::{guid, pe};

use crate::bytes::Bytes;
use crate::err::ParseError;
use crate::model::{
    CompressedSectionParsingData, FreeformSubtypeGuidSectionParsingData, GuidedSectionParsingData, InsertMode,
    ItemId, ItemType, PaddingSubtype, ParsingData, Subtype, TeImageSectionParsingData,
};
use crate::msg::Severity;
use crate::parser::{align4, size_string, FfsParser};

use fwtree_pi::ffs::section::raw_type;

impl FfsParser {
    /// FFS version governing section size encoding, taken from the
    /// nearest ancestor volume.
    fn ffs_version_for(&self, index: ItemId) -> u8 {
        let volume = match self.model.parsing_data(index) {
            ParsingData::Volume(pdata) => return pdata.ffs_version,
            _ => self.model.find_parent_of_type(index, ItemType::Volume),
        };
        match volume.map(|v| self.model.parsing_data(v)) {
            Some(ParsingData::Volume(pdata)) => pdata.ffs_version,
            _ => 2,
        }
    }

    /// Section size at `section_offset`, honoring the FFSv3 extended size
    /// sentinel. Returns 0 when the header cannot be read.
    pub(crate) fn get_section_size(sections: &Bytes, section_offset: usize, ffs_version: u8) -> usize {
        let Some(header) = sections.read_struct::<pi_section::Header>(section_offset) else {
            return 0;
        };
        let size = header.size24();
        if ffs_version == 3 && size == pi_section::SECTION2_IS_USED {
            sections.read_u32(section_offset + 4).map(|s| s as usize).unwrap_or(0)
        } else {
            size as usize
        }
    }

    /// Size of the common lead of a section: 4 bytes, 8 with the FFSv3
    /// extended size, 8 with the Apple reserved word.
    fn section_lead_size(section: &Bytes, ffs_version: u8) -> usize {
        let Some(header) = section.read_struct::<pi_section::Header>(0) else {
            return pi_section::Header::SIZE;
        };
        if ffs_version == 3 && header.size24() == pi_section::SECTION2_IS_USED {
            return pi_section::Header2::SIZE;
        }
        if section.read_u32(4) == Some(pi_section::APPLE_RESERVED) {
            return pi_section::Header2::SIZE;
        }
        pi_section::Header::SIZE
    }

    /// Enumerates the sections of `sections` under `index`.
    pub(crate) fn parse_sections(
        &mut self,
        sections: &Bytes,
        index: ItemId,
        preparse: bool,
    ) -> Result<(), ParseError> {
        let ffs_version = self.ffs_version_for(index);
        let body_size = sections.len();
        let header_size = self.model.header(index).len();
        let mut section_offset = 0usize;

        while section_offset < body_size {
            let section_size = Self::get_section_size(sections, section_offset, ffs_version);

            if section_size < pi_section::Header::SIZE || section_size > body_size - section_offset {
                if preparse {
                    return Err(ParseError::InvalidSection);
                }
                // Fill the rest of the area as data padding.
                let padding = sections.from_offset(section_offset);
                let info = format!("Full size: {}", size_string(padding.len()));
                let data_index = self.model.add_item(
                    self.model.offset(index) + header_size + section_offset,
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
                self.msg(Some(data_index), Severity::Warning, "parseSections: non-UEFI data found in sections area");
                break;
            }

            let section = sections.mid(section_offset, section_size);
            if let Err(err) =
                self.parse_section_header(&section, header_size + section_offset, index, ffs_version, preparse)
            {
                if preparse {
                    return Err(ParseError::InvalidSection);
                }
                self.msg(
                    Some(index),
                    Severity::Error,
                    format!("parseSections: section header parsing failed with error \"{}\"", err),
                );
            }

            section_offset = align4(section_offset + section_size);
        }

        if preparse {
            return Ok(());
        }

        // Parse the section bodies.
        for child in self.model.children(index).to_vec() {
            match self.model.item_type(child) {
                ItemType::Section => {
                    let _ = self.parse_section_body(child);
                }
                ItemType::Padding => {} // no parsing required
                _ => return Err(ParseError::UnknownItemType),
            }
        }

        Ok(())
    }

    fn parse_section_header(
        &mut self,
        section: &Bytes,
        local_offset: usize,
        parent: ItemId,
        ffs_version: u8,
        preparse: bool,
    ) -> Result<(), ParseError> {
        let header = section.read_struct::<pi_section::Header>(0).ok_or(ParseError::InvalidSection)?;
        match header.section_type {
            raw_type::encapsulated::COMPRESSION => {
                self.parse_compressed_section_header(section, local_offset, parent, ffs_version, preparse)
            }
            raw_type::encapsulated::GUID_DEFINED => {
                self.parse_guided_section_header(section, local_offset, parent, ffs_version, preparse)
            }
            raw_type::FREEFORM_SUBTYPE_GUID => {
                self.parse_freeform_guided_section_header(section, local_offset, parent, ffs_version, preparse)
            }
            raw_type::VERSION => {
                self.parse_version_section_header(section, local_offset, parent, ffs_version, preparse)
            }
            raw_type::INSYDE_POSTCODE | raw_type::PHOENIX_POSTCODE => {
                self.parse_postcode_section_header(section, local_offset, parent, ffs_version, preparse)
            }
            raw_type::encapsulated::DISPOSABLE
            | raw_type::DXE_DEPEX
            | raw_type::PEI_DEPEX
            | raw_type::MM_DEPEX
            | raw_type::PE32
            | raw_type::PIC
            | raw_type::TE
            | raw_type::COMPATIBILITY16
            | raw_type::USER_INTERFACE
            | raw_type::FIRMWARE_VOLUME_IMAGE
            | raw_type::RAW => self.parse_common_section_header(section, local_offset, parent, ffs_version, preparse),
            unknown_type => {
                let result = self.parse_common_section_header(section, local_offset, parent, ffs_version, preparse);
                if !preparse {
                    self.msg(
                        None,
                        Severity::Warning,
                        format!("parseSectionHeader: section with unknown type {:02X}h", unknown_type),
                    );
                }
                result
            }
        }
    }

    fn add_section_item(
        &mut self,
        section: &Bytes,
        local_offset: usize,
        parent: ItemId,
        header_size: usize,
        name: String,
        info: String,
        parsing_data: ParsingData,
    ) -> ItemId {
        let section_type = section.as_slice()[3];
        self.model.add_item(
            self.model.offset(parent) + local_offset,
            ItemType::Section,
            Subtype::Section(section_type),
            name,
            "",
            info,
            section.left(header_size),
            section.from_offset(header_size),
            false,
            parsing_data,
            Some(parent),
            InsertMode::Append,
        )
    }

    fn parse_common_section_header(
        &mut self,
        section: &Bytes,
        local_offset: usize,
        parent: ItemId,
        ffs_version: u8,
        preparse: bool,
    ) -> Result<(), ParseError> {
        if section.len() < pi_section::Header::SIZE {
            return Err(ParseError::InvalidSection);
        }
        let section_type = section.as_slice()[3];
        let header_size = Self::section_lead_size(section, ffs_version);

        if !preparse {
            let name = format!("{} section", pi_section::section_type_to_string(section_type));
            let info = format!(
                "Type: {:02X}h\nFull size: {}\nHeader size: {}\nBody size: {}",
                section_type,
                size_string(section.len()),
                size_string(header_size),
                size_string(section.len() - header_size)
            );
            self.add_section_item(section, local_offset, parent, header_size, name, info, ParsingData::None);
        }
        Ok(())
    }

    fn parse_compressed_section_header(
        &mut self,
        section: &Bytes,
        local_offset: usize,
        parent: ItemId,
        ffs_version: u8,
        preparse: bool,
    ) -> Result<(), ParseError> {
        let lead = Self::section_lead_size(section, ffs_version);
        let extra = pi_section::CompressionExtra::from_bytes(&section.as_slice()[lead.min(section.len())..])
            .ok_or(ParseError::InvalidSection)?;
        let header_size = lead + pi_section::CompressionExtra::SIZE;
        let section_type = section.as_slice()[3];

        if !preparse {
            let name = format!("{} section", pi_section::section_type_to_string(section_type));
            let info = format!(
                "Type: {:02X}h\nFull size: {}\nHeader size: {}\nBody size: {}\nCompression type: {:02X}h\nDecompressed size: {}",
                section_type,
                size_string(section.len()),
                size_string(header_size),
                size_string(section.len() - header_size),
                extra.compression_type,
                size_string(extra.uncompressed_length as usize)
            );
            let parsing_data = ParsingData::CompressedSection(CompressedSectionParsingData {
                compression_type: extra.compression_type,
                uncompressed_size: extra.uncompressed_length,
                algorithm: None,
            });
            self.add_section_item(section, local_offset, parent, header_size, name, info, parsing_data);
        }
        Ok(())
    }

    fn parse_guided_section_header(
        &mut self,
        section: &Bytes,
        local_offset: usize,
        parent: ItemId,
        ffs_version: u8,
        preparse: bool,
    ) -> Result<(), ParseError> {
        let lead = Self::section_lead_size(section, ffs_version);
        let extra = pi_section::GuidDefinedExtra::from_bytes(&section.as_slice()[lead.min(section.len())..])
            .ok_or(ParseError::InvalidSection)?;
        let next_header_offset = lead + pi_section::GuidDefinedExtra::SIZE;
        let section_guid = extra.section_definition_guid;
        let attributes = extra.attributes;
        let mut data_offset = extra.data_offset as usize;
        if data_offset > section.len() || data_offset < next_header_offset {
            return Err(ParseError::InvalidSection);
        }

        let mut additional_info = String::new();
        let mut msg_signed_section_found = false;
        let mut msg_no_auth_status_attribute = false;
        let mut msg_no_processing_required_compressed = false;
        let mut msg_no_processing_required_signed = false;
        let mut msg_invalid_crc = false;
        let mut msg_unknown_cert_type = false;
        let mut msg_unknown_cert_subtype = false;

        if section_guid == guid::EFI_GUIDED_SECTION_CRC32 {
            if attributes & pi_section::guided_attributes::AUTH_STATUS_VALID == 0 {
                msg_no_auth_status_attribute = true;
            }
            let crc = section.read_u32(next_header_offset).ok_or(ParseError::InvalidSection)?;
            additional_info.push_str("\nChecksum type: CRC32");
            let calculated = crc32fast::hash(&section.as_slice()[data_offset..]);
            if crc == calculated {
                additional_info.push_str(&format!("\nChecksum: {:08X}h, valid", crc));
            } else {
                additional_info.push_str(&format!("\nChecksum: {:08X}h, invalid, should be {:08X}h", crc, calculated));
                msg_invalid_crc = true;
            }
        } else if section_guid == guid::EFI_GUIDED_SECTION_LZMA
            || section_guid == guid::EFI_GUIDED_SECTION_LZMAF86
            || section_guid == guid::EFI_GUIDED_SECTION_TIANO
        {
            if attributes & pi_section::guided_attributes::PROCESSING_REQUIRED == 0 {
                msg_no_processing_required_compressed = true;
            }
        } else if section_guid == guid::EFI_FIRMWARE_CONTENTS_SIGNED_GUID {
            if attributes & pi_section::guided_attributes::PROCESSING_REQUIRED == 0 {
                msg_no_processing_required_signed = true;
            }

            // WIN_CERTIFICATE: length, revision, certificate type.
            let cert_length = section.read_u32(next_header_offset).ok_or(ParseError::InvalidSection)? as usize;
            let cert_type = section.read_u16(next_header_offset + 6).ok_or(ParseError::InvalidSection)?;

            data_offset += cert_length;
            if data_offset > section.len() {
                return Err(ParseError::InvalidSection);
            }

            if cert_type == pi_section::WIN_CERT_TYPE_EFI_GUID {
                additional_info.push_str("\nCertificate type: UEFI");
                let cert_guid = guid::guid_from_bytes(&section.as_slice()[next_header_offset + 8..])
                    .ok_or(ParseError::InvalidSection)?;
                if cert_guid == guid::EFI_CERT_TYPE_RSA2048_SHA256_GUID {
                    additional_info.push_str("\nCertificate subtype: RSA2048/SHA256");
                } else {
                    additional_info.push_str(&format!(
                        "\nCertificate subtype: unknown, GUID {}",
                        guid::guid_to_string(&cert_guid)
                    ));
                    msg_unknown_cert_subtype = true;
                }
            } else {
                additional_info.push_str(&format!("\nCertificate type: unknown {:04X}h", cert_type));
                msg_unknown_cert_type = true;
            }
            msg_signed_section_found = true;
        }

        if preparse {
            return Ok(());
        }

        let name = guid::guid_to_string(&section_guid);
        let section_type = section.as_slice()[3];
        let mut info = format!(
            "Section GUID: {}\nType: {:02X}h\nFull size: {}\nHeader size: {}\nBody size: {}\nData offset: {:X}h\nAttributes: {:04X}h",
            name,
            section_type,
            size_string(section.len()),
            size_string(data_offset),
            size_string(section.len() - data_offset),
            data_offset,
            attributes
        );
        info.push_str(&additional_info);

        let parsing_data = ParsingData::GuidedSection(GuidedSectionParsingData { guid: section_guid });
        let index = self.add_section_item(section, local_offset, parent, data_offset, name, info, parsing_data);

        if msg_signed_section_found {
            self.msg(
                Some(index),
                Severity::Warning,
                "parseGuidedSectionHeader: section signature may become invalid after any modification",
            );
        }
        if msg_no_auth_status_attribute {
            self.msg(
                Some(index),
                Severity::Warning,
                "parseGuidedSectionHeader: CRC32 GUIDed section without AuthStatusValid attribute",
            );
        }
        if msg_no_processing_required_compressed {
            self.msg(
                Some(index),
                Severity::Warning,
                "parseGuidedSectionHeader: compressed GUIDed section without ProcessingRequired attribute",
            );
        }
        if msg_no_processing_required_signed {
            self.msg(
                Some(index),
                Severity::Warning,
                "parseGuidedSectionHeader: signed GUIDed section without ProcessingRequired attribute",
            );
        }
        if msg_invalid_crc {
            self.msg(Some(index), Severity::Warning, "parseGuidedSectionHeader: GUID defined section with invalid CRC32");
        }
        if msg_unknown_cert_type {
            self.msg(Some(index), Severity::Warning, "parseGuidedSectionHeader: signed GUIDed section with unknown type");
        }
        if msg_unknown_cert_subtype {
            self.msg(
                Some(index),
                Severity::Warning,
                "parseGuidedSectionHeader: signed GUIDed section with unknown subtype",
            );
        }

        Ok(())
    }

    fn parse_freeform_guided_section_header(
        &mut self,
        section: &Bytes,
        local_offset: usize,
        parent: ItemId,
        ffs_version: u8,
        preparse: bool,
    ) -> Result<(), ParseError> {
        let lead = Self::section_lead_size(section, ffs_version);
        let extra = pi_section::FreeformSubtypeGuidExtra::from_bytes(&section.as_slice()[lead.min(section.len())..])
            .ok_or(ParseError::InvalidSection)?;
        let header_size = lead + pi_section::FreeformSubtypeGuidExtra::SIZE;
        let section_type = section.as_slice()[3];

        if !preparse {
            let info = format!(
                "Type: {:02X}h\nFull size: {}\nHeader size: {}\nBody size: {}\nSubtype GUID: {}",
                section_type,
                size_string(section.len()),
                size_string(header_size),
                size_string(section.len() - header_size),
                guid::guid_to_string(&extra.sub_type_guid)
            );
            let parsing_data = ParsingData::FreeformSubtypeGuidSection(FreeformSubtypeGuidSectionParsingData {
                guid: extra.sub_type_guid,
            });
            let name = guid::guid_to_string(&extra.sub_type_guid);
            self.add_section_item(section, local_offset, parent, header_size, name, info, parsing_data);
        }
        Ok(())
    }

    fn parse_version_section_header(
        &mut self,
        section: &Bytes,
        local_offset: usize,
        parent: ItemId,
        ffs_version: u8,
        preparse: bool,
    ) -> Result<(), ParseError> {
        let lead = Self::section_lead_size(section, ffs_version);
        let extra = pi_section::VersionExtra::from_bytes(&section.as_slice()[lead.min(section.len())..])
            .ok_or(ParseError::InvalidSection)?;
        let header_size = lead + pi_section::VersionExtra::SIZE;
        let section_type = section.as_slice()[3];

        if !preparse {
            let name = format!("{} section", pi_section::section_type_to_string(section_type));
            let info = format!(
                "Type: {:02X}h\nFull size: {}\nHeader size: {}\nBody size: {}\nBuild number: {}",
                section_type,
                size_string(section.len()),
                size_string(header_size),
                size_string(section.len() - header_size),
                extra.build_number
            );
            self.add_section_item(section, local_offset, parent, header_size, name, info, ParsingData::None);
        }
        Ok(())
    }

    fn parse_postcode_section_header(
        &mut self,
        section: &Bytes,
        local_offset: usize,
        parent: ItemId,
        ffs_version: u8,
        preparse: bool,
    ) -> Result<(), ParseError> {
        let lead = Self::section_lead_size(section, ffs_version);
        let extra = pi_section::PostcodeExtra::from_bytes(&section.as_slice()[lead.min(section.len())..])
            .ok_or(ParseError::InvalidSection)?;
        let header_size = lead + pi_section::PostcodeExtra::SIZE;
        let section_type = section.as_slice()[3];

        if !preparse {
            let name = format!("{} section", pi_section::section_type_to_string(section_type));
            let info = format!(
                "Type: {:02X}h\nFull size: {}\nHeader size: {}\nBody size: {}\nPostcode: {:X}h",
                section_type,
                size_string(section.len()),
                size_string(header_size),
                size_string(section.len() - header_size),
                extra.postcode
            );
            self.add_section_item(section, local_offset, parent, header_size, name, info, ParsingData::None);
        }
        Ok(())
    }

    /// Dispatches a parsed section body.
    pub(crate) fn parse_section_body(&mut self, index: ItemId) -> Result<(), ParseError> {
        let Subtype::Section(section_type) = self.model.subtype(index) else {
            return Err(ParseError::InvalidParameter);
        };

        match section_type {
            raw_type::encapsulated::COMPRESSION => self.parse_compressed_section_body(index),
            raw_type::encapsulated::GUID_DEFINED => self.parse_guided_section_body(index),
            raw_type::encapsulated::DISPOSABLE => {
                let body = self.model.body(index).clone();
                self.parse_sections(&body, index, false)
            }
            raw_type::FREEFORM_SUBTYPE_GUID | raw_type::FIRMWARE_VOLUME_IMAGE => {
                match self.parse_raw_area(index) {
                    Err(ParseError::VolumesNotFound) => Ok(()),
                    result => result,
                }
            }
            raw_type::VERSION => self.parse_version_section_body(index),
            raw_type::DXE_DEPEX | raw_type::PEI_DEPEX | raw_type::MM_DEPEX => self.parse_depex_section_body(index),
            raw_type::TE => self.parse_te_image_section_body(index),
            raw_type::PE32 | raw_type::PIC => self.parse_pe_image_section_body(index),
            raw_type::USER_INTERFACE => self.parse_ui_section_body(index),
            raw_type::RAW => self.parse_raw_section_body(index),
            // 16-bit images and postcodes carry no parsed payload.
            _ => Ok(()),
        }
    }

    /// Resolves the "undecided" standard-compression outcome by
    /// pre-parsing both candidate outputs as sections.
    fn resolve_undecided(
        &mut self,
        index: ItemId,
        decompressed: &mut fwtree_extract::Decompressed,
        context: &str,
    ) -> Algorithm {
        if decompressed.algorithm != Algorithm::Undecided {
            return decompressed.algorithm;
        }
        let tiano_candidate = Bytes::from(decompressed.data.as_slice());
        if self.parse_sections(&tiano_candidate, index, true).is_ok() {
            return Algorithm::Tiano;
        }
        let efi11_candidate = Bytes::from(decompressed.efi11_data.as_slice());
        if self.parse_sections(&efi11_candidate, index, true).is_ok() {
            decompressed.data = core::mem::take(&mut decompressed.efi11_data);
            return Algorithm::Efi11;
        }
        self.msg(
            Some(index),
            Severity::Warning,
            format!("{}: can't guess the correct decompression algorithm, both preparse steps are failed", context),
        );
        Algorithm::Undecided
    }

    fn parse_compressed_section_body(&mut self, index: ItemId) -> Result<(), ParseError> {
        let ParsingData::CompressedSection(mut pdata) = self.model.parsing_data(index).clone() else {
            return Err(ParseError::InvalidParameter);
        };

        let body = self.model.body(index).clone();
        let mut decompressed = match fwtree_extract::decompress(pdata.compression_type, body.as_slice()) {
            Ok(decompressed) => decompressed,
            Err(err) => {
                self.msg(
                    Some(index),
                    Severity::Warning,
                    format!("parseCompressedSectionBody: decompression failed with error \"{}\"", err),
                );
                return Ok(());
            }
        };

        if pdata.uncompressed_size as usize != decompressed.data.len() {
            self.msg(
                Some(index),
                Severity::Warning,
                format!(
                    "parseCompressedSectionBody: decompressed size stored in header {} differs from actual {}",
                    size_string(pdata.uncompressed_size as usize),
                    size_string(decompressed.data.len())
                ),
            );
            let info = format!("\nActual decompressed size: {}", size_string(decompressed.data.len()));
            self.model.add_info(index, &info, true);
        }

        let algorithm = self.resolve_undecided(index, &mut decompressed, "parseCompressedSectionBody");

        let info = format!("\nCompression algorithm: {}", algorithm);
        self.model.add_info(index, &info, true);

        pdata.algorithm = Some(algorithm);
        self.model.set_parsing_data(index, ParsingData::CompressedSection(pdata));
        if algorithm != Algorithm::None {
            self.model.set_compressed(index, true);
        }

        let data = Bytes::from(decompressed.data);
        self.parse_sections(&data, index, false)
    }

    fn parse_guided_section_body(&mut self, index: ItemId) -> Result<(), ParseError> {
        let ParsingData::GuidedSection(pdata) = self.model.parsing_data(index).clone() else {
            return Err(ParseError::InvalidParameter);
        };

        let body = self.model.body(index).clone();
        let mut processed = body.clone();
        let mut algorithm = Algorithm::None;
        let mut info = String::new();

        if pdata.guid == guid::EFI_GUIDED_SECTION_TIANO {
            let mut decompressed =
                match fwtree_extract::decompress(fwtree_extract::STANDARD_COMPRESSION, body.as_slice()) {
                    Ok(decompressed) => decompressed,
                    Err(err) => {
                        self.msg(
                            Some(index),
                            Severity::Warning,
                            format!("parseGuidedSectionBody: decompression failed with error \"{}\"", err),
                        );
                        return Ok(());
                    }
                };
            algorithm = self.resolve_undecided(index, &mut decompressed, "parseGuidedSectionBody");
            info.push_str(&format!("\nCompression algorithm: {}", algorithm));
            info.push_str(&format!("\nDecompressed size: {}", size_string(decompressed.data.len())));
            processed = Bytes::from(decompressed.data);
        } else if pdata.guid == guid::EFI_GUIDED_SECTION_LZMA || pdata.guid == guid::EFI_GUIDED_SECTION_LZMAF86 {
            let decompressed =
                match fwtree_extract::decompress(fwtree_extract::CUSTOMIZED_COMPRESSION, body.as_slice()) {
                    Ok(decompressed) => decompressed,
                    Err(err) => {
                        self.msg(
                            Some(index),
                            Severity::Warning,
                            format!("parseGuidedSectionBody: decompression failed with error \"{}\"", err),
                        );
                        return Ok(());
                    }
                };
            algorithm = decompressed.algorithm;
            info.push_str(&format!("\nCompression algorithm: {}", algorithm));
            info.push_str(&format!("\nDecompressed size: {}", size_string(decompressed.data.len())));
            processed = Bytes::from(decompressed.data);
        }

        if !info.is_empty() {
            self.model.add_info(index, &info, true);
        }
        if algorithm != Algorithm::None {
            self.model.set_compressed(index, true);
        }

        self.parse_sections(&processed, index, false)
    }

    fn parse_version_section_body(&mut self, index: ItemId) -> Result<(), ParseError> {
        let version = ucs2_string(self.model.body(index));
        let info = format!("\nVersion string: {}", version);
        self.model.add_info(index, &info, true);
        Ok(())
    }

    fn parse_depex_section_body(&mut self, index: ItemId) -> Result<(), ParseError> {
        let body = self.model.body(index).clone();

        // A minimal sane expression is TRUE + END.
        if body.len() < 2 * depex::OPCODE_SIZE {
            self.msg(Some(index), Severity::Warning, "parseDepexSectionBody: DEPEX section too short");
            return Err(ParseError::DepexParseFailed);
        }

        let data = body.as_slice();
        let mut parsed = String::new();
        let mut current = 0usize;
        let guid_size = 16;

        // BEFORE and AFTER must be alone; SOR must come first.
        match data[0] {
            depex::BEFORE | depex::AFTER => {
                let op = if data[0] == depex::BEFORE { "BEFORE" } else { "AFTER" };
                if body.len() != 2 * depex::OPCODE_SIZE + guid_size {
                    self.msg(
                        Some(index),
                        Severity::Warning,
                        format!("parseDepexSectionBody: DEPEX section too long for a section starting with {} opcode", op),
                    );
                    return Ok(());
                }
                let dep_guid = guid::guid_from_bytes(&data[depex::OPCODE_SIZE..]).ok_or(ParseError::DepexParseFailed)?;
                parsed.push_str(&format!("\n{} {}", op, guid::guid_to_string(&dep_guid)));
                if data[depex::OPCODE_SIZE + guid_size] != depex::END {
                    self.msg(Some(index), Severity::Warning, "parseDepexSectionBody: DEPEX section ends with non-END opcode");
                    return Ok(());
                }
                let info = format!("\nParsed expression:{}", parsed);
                self.model.add_info(index, &info, true);
                return Ok(());
            }
            depex::SOR => {
                if body.len() <= 2 * depex::OPCODE_SIZE {
                    self.msg(
                        Some(index),
                        Severity::Warning,
                        "parseDepexSectionBody: DEPEX section too short for a section starting with SOR opcode",
                    );
                    return Ok(());
                }
                parsed.push_str("\nSOR");
                current += depex::OPCODE_SIZE;
            }
            _ => {}
        }

        while current < body.len() {
            match data[current] {
                depex::BEFORE => {
                    self.msg(Some(index), Severity::Warning, "parseDepexSectionBody: misplaced BEFORE opcode");
                    return Ok(());
                }
                depex::AFTER => {
                    self.msg(Some(index), Severity::Warning, "parseDepexSectionBody: misplaced AFTER opcode");
                    return Ok(());
                }
                depex::SOR => {
                    self.msg(Some(index), Severity::Warning, "parseDepexSectionBody: misplaced SOR opcode");
                    return Ok(());
                }
                depex::PUSH => {
                    if body.len() - current <= depex::OPCODE_SIZE + guid_size {
                        self.msg(
                            Some(index),
                            Severity::Warning,
                            "parseDepexSectionBody: remains of DEPEX section too short for PUSH opcode",
                        );
                        return Ok(());
                    }
                    let dep_guid = guid::guid_from_bytes(&data[current + depex::OPCODE_SIZE..])
                        .ok_or(ParseError::DepexParseFailed)?;
                    parsed.push_str(&format!("\nPUSH {}", guid::guid_to_string(&dep_guid)));
                    current += depex::OPCODE_SIZE + guid_size;
                }
                depex::AND => {
                    parsed.push_str("\nAND");
                    current += depex::OPCODE_SIZE;
                }
                depex::OR => {
                    parsed.push_str("\nOR");
                    current += depex::OPCODE_SIZE;
                }
                depex::NOT => {
                    parsed.push_str("\nNOT");
                    current += depex::OPCODE_SIZE;
                }
                depex::TRUE => {
                    parsed.push_str("\nTRUE");
                    current += depex::OPCODE_SIZE;
                }
                depex::FALSE => {
                    parsed.push_str("\nFALSE");
                    current += depex::OPCODE_SIZE;
                }
                depex::END => {
                    parsed.push_str("\nEND");
                    current += depex::OPCODE_SIZE;
                    if current < body.len() {
                        self.msg(
                            Some(index),
                            Severity::Warning,
                            "parseDepexSectionBody: DEPEX section ends with non-END opcode",
                        );
                        return Ok(());
                    }
                }
                _ => {
                    self.msg(Some(index), Severity::Warning, "parseDepexSectionBody: unknown opcode");
                    return Ok(());
                }
            }
        }

        let info = format!("\nParsed expression:{}", parsed);
        self.model.add_info(index, &info, true);
        Ok(())
    }

    fn parse_ui_section_body(&mut self, index: ItemId) -> Result<(), ParseError> {
        let text = ucs2_string(self.model.body(index));
        // The UI string names the containing file.
        if let Some(file) = self.model.find_parent_of_type(index, ItemType::File) {
            self.model.set_text(file, text.clone());
        }
        let info = format!("\nText: {}", text);
        self.model.add_info(index, &info, true);
        Ok(())
    }

    fn parse_apriori_raw_section(&mut self, body: &Bytes) -> String {
        if body.len() % 16 != 0 {
            self.msg(None, Severity::Warning, "parseAprioriRawSection: apriori file has size not a multiple of 16");
        }
        let mut parsed = String::new();
        for chunk_offset in (0..body.len() / 16 * 16).step_by(16) {
            if let Some(entry_guid) = guid::guid_from_bytes(&body.as_slice()[chunk_offset..]) {
                parsed.push_str(&format!("\n{}", guid::guid_to_string(&entry_guid)));
            }
        }
        parsed
    }

    fn parse_raw_section_body(&mut self, index: ItemId) -> Result<(), ParseError> {
        let parent_file = self.model.find_parent_of_type(index, ItemType::File);
        let parent_guid = parent_file.and_then(|file| match self.model.parsing_data(file) {
            ParsingData::File(pdata) => Some(pdata.guid),
            _ => None,
        });

        if parent_guid == Some(guid::EFI_PEI_APRIORI_FILE_GUID) || parent_guid == Some(guid::EFI_DXE_APRIORI_FILE_GUID) {
            let body = self.model.body(index).clone();
            let list = self.parse_apriori_raw_section(&body);
            if !list.is_empty() {
                let info = format!("\nFile list:{}", list);
                self.model.add_info(index, &info, true);
            }
            let text = if parent_guid == Some(guid::EFI_PEI_APRIORI_FILE_GUID) {
                "PEI apriori file"
            } else {
                "DXE apriori file"
            };
            self.model.set_text(parent_file.unwrap(), text);
            return Ok(());
        }

        match self.parse_raw_area(index) {
            Err(ParseError::VolumesNotFound) => Ok(()),
            result => result,
        }
    }

    fn parse_pe_image_section_body(&mut self, index: ItemId) -> Result<(), ParseError> {
        let body = self.model.body(index).clone();
        if body.len() < core::mem::size_of::<pe::DosHeader>() {
            self.msg(
                Some(index),
                Severity::Warning,
                "parsePeImageSectionBody: section body size is smaller than DOS header size",
            );
            return Ok(());
        }

        let mut info = String::new();
        let dos_header: pe::DosHeader = body.read_struct(0).ok_or(ParseError::InvalidSection)?;
        if dos_header.e_magic != pe::DOS_SIGNATURE {
            info.push_str(&format!("\nDOS signature: {:04X}h, invalid", dos_header.e_magic));
            self.msg(Some(index), Severity::Warning, "parsePeImageSectionBody: PE32 image with invalid DOS signature");
            self.model.add_info(index, &info, true);
            return Ok(());
        }

        let pe_offset = dos_header.e_lfanew as usize;
        let Some(pe_signature) = body.read_u32(pe_offset) else {
            info.push_str("\nDOS header: invalid");
            self.msg(Some(index), Severity::Warning, "parsePeImageSectionBody: PE32 image with invalid DOS header");
            self.model.add_info(index, &info, true);
            return Ok(());
        };
        if pe_signature != pe::PE_SIGNATURE {
            info.push_str(&format!("\nPE signature: {:08X}h, invalid", pe_signature));
            self.msg(Some(index), Severity::Warning, "parsePeImageSectionBody: PE32 image with invalid PE signature");
            self.model.add_info(index, &info, true);
            return Ok(());
        }

        let Some(file_header) = body.read_struct::<pe::FileHeader>(pe_offset + 4) else {
            info.push_str("\nPE header: invalid");
            self.msg(Some(index), Severity::Warning, "parsePeImageSectionBody: PE32 image with invalid PE header");
            self.model.add_info(index, &info, true);
            return Ok(());
        };

        info.push_str(&format!(
            "\nDOS signature: {:04X}h\nPE signature: {:08X}h\nMachine type: {}\nNumber of sections: {}\nCharacteristics: {:04X}h",
            dos_header.e_magic,
            pe_signature,
            pe::machine_type_to_string(file_header.machine),
            file_header.number_of_sections,
            file_header.characteristics
        ));

        let optional_offset = pe_offset + 4 + core::mem::size_of::<pe::FileHeader>();
        let optional_slice = &body.as_slice()[optional_offset.min(body.len())..];
        match pe::OptionalHeader::from_bytes(optional_slice) {
            None => {
                info.push_str("\nPE optional header: invalid");
                self.msg(
                    Some(index),
                    Severity::Warning,
                    "parsePeImageSectionBody: PE32 image with invalid PE optional header",
                );
            }
            Some(optional) => {
                if optional.magic == pe::PE_OPTIONAL_HDR32_MAGIC || optional.magic == pe::PE_OPTIONAL_HDR64_MAGIC {
                    info.push_str(&format!(
                        "\nOptional header signature: {:04X}h\nSubsystem: {:04X}h\nAddress of entry point: {:X}h\nBase of code: {:X}h\nImage base: {:X}h",
                        optional.magic,
                        optional.subsystem,
                        optional.address_of_entry_point,
                        optional.base_of_code,
                        optional.image_base
                    ));
                } else {
                    info.push_str(&format!("\nOptional header signature: {:04X}h, unknown", optional.magic));
                    self.msg(
                        Some(index),
                        Severity::Warning,
                        "parsePeImageSectionBody: PE32 image with invalid optional PE header signature",
                    );
                }
            }
        }

        self.model.add_info(index, &info, true);
        Ok(())
    }

    fn parse_te_image_section_body(&mut self, index: ItemId) -> Result<(), ParseError> {
        let body = self.model.body(index).clone();
        if body.len() < core::mem::size_of::<pe::TeHeader>() {
            self.msg(
                Some(index),
                Severity::Warning,
                "parseTeImageSectionBody: section body size is smaller than TE header size",
            );
            return Ok(());
        }

        let te_header: pe::TeHeader = body.read_struct(0).ok_or(ParseError::InvalidSection)?;
        let adjusted_image_base = te_header
            .image_base
            .wrapping_add(te_header.stripped_size as u64)
            .wrapping_sub(core::mem::size_of::<pe::TeHeader>() as u64);

        let mut info = String::new();
        if te_header.signature != pe::TE_SIGNATURE {
            info.push_str(&format!("\nSignature: {:04X}h, invalid", te_header.signature));
            self.msg(Some(index), Severity::Warning, "parseTeImageSectionBody: TE image with invalid TE signature");
        } else {
            info.push_str(&format!(
                "\nSignature: {:04X}h\nMachine type: {}\nNumber of sections: {}\nSubsystem: {:02X}h\nStripped size: {}\nBase of code: {:X}h\nAddress of entry point: {:X}h\nImage base: {:X}h\nAdjusted image base: {:X}h",
                te_header.signature,
                pe::machine_type_to_string(te_header.machine),
                te_header.number_of_sections,
                te_header.subsystem,
                size_string(te_header.stripped_size as usize),
                te_header.base_of_code,
                te_header.address_of_entry_point,
                te_header.image_base,
                adjusted_image_base
            ));
        }

        self.model.set_parsing_data(
            index,
            ParsingData::TeImageSection(TeImageSectionParsingData {
                image_base: te_header.image_base,
                adjusted_image_base,
                base_type: crate::model::TeBaseType::Other,
            }),
        );
        self.model.add_info(index, &info, true);
        Ok(())
    }
}

/// Decodes a UCS-2/UTF-16LE string body, dropping the terminator.
fn ucs2_string(body: &Bytes) -> String {
    let units: Vec<u16> = body.as_slice().chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16_lossy(&units).trim_end_matches('\0').to_string()
}
