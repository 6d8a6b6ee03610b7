//! Firmware Interface Table parsing (third pass).
//!
//! A FIT candidate is only trusted when its physical address matches the
//! pointer stored at a fixed offset from the end of the last VTF; random
//! `_FIT_` strings inside file payloads are reported but ignored. Boot
//! Guard entries (ACM, key manifest, boot policy) are parsed here because
//! the FIT is the only thing that locates them.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use sha2::{Digest, Sha256};

use fwtree_pi::fit as pi_fit;

use crate::bootguard::{ProtectedRange, ProtectedRangeKind};
use crate::bytes::Bytes;
use crate::err::ParseError;
use crate::model::ItemId;
use crate::msg::Severity;
use crate::parser::{size_string, FfsParser};

/// One rendered FIT table row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitRow {
    pub address: String,
    pub size: String,
    pub version: String,
    pub checksum: String,
    pub entry_type: String,
    pub info: String,
}

fn fit_entry_type_to_string(entry_type: u8) -> &'static str {
    match entry_type & 0x7F {
        pi_fit::entry_type::HEADER => "Header",
        pi_fit::entry_type::MICROCODE => "Microcode",
        pi_fit::entry_type::BIOS_AC_MODULE => "BIOS ACM",
        pi_fit::entry_type::BIOS_INIT_MODULE => "BIOS Init",
        pi_fit::entry_type::TPM_POLICY => "TPM Policy",
        pi_fit::entry_type::BIOS_POLICY_DATA => "BIOS Policy Data",
        pi_fit::entry_type::TXT_CONF_POLICY => "TXT Conf Policy",
        pi_fit::entry_type::AC_KEY_MANIFEST => "BG Key Manifest",
        pi_fit::entry_type::AC_BOOT_POLICY => "BG Boot Policy",
        pi_fit::entry_type::EMPTY => "Empty",
        _ => "Unknown Type",
    }
}

impl FfsParser {
    /// Locates and parses the FIT table. Never fails the parse.
    pub(crate) fn parse_fit(&mut self) {
        let Some(diff) = self.address_diff else {
            return;
        };
        let Some(last_vtf) = self.last_vtf else {
            return;
        };

        // The FIT pointer lives at a fixed offset from the VTF end.
        let vtf_body = self.model.body(last_vtf).clone();
        if vtf_body.len() < pi_fit::FIT_POINTER_OFFSET {
            return;
        }
        let Some(fit_pointer) = vtf_body.read_u32(vtf_body.len() - pi_fit::FIT_POINTER_OFFSET) else {
            return;
        };

        let root = self.model.root();
        let Some((fit_index, fit_offset)) = self.find_fit_recursive(root, diff, fit_pointer as u64) else {
            return;
        };

        // The FIT and everything it references must not move on rebuild.
        self.model.set_fixed(fit_index, true);

        let body = self.model.body(fit_index).clone();
        let Some(header) = body.read_struct::<pi_fit::FitEntry>(fit_offset) else {
            self.msg(Some(fit_index), Severity::Error, format!("parseFit: {}", ParseError::InvalidFit));
            return;
        };

        // Entry count lives in the header's size field; the byte size of
        // the table is that count of 16-byte entries.
        let entry_count = header.size24() as usize;
        let fit_size = entry_count * pi_fit::FitEntry::SIZE;
        if fit_offset + fit_size > body.len() || entry_count == 0 {
            self.msg(Some(fit_index), Severity::Error, format!("parseFit: {}", ParseError::InvalidFit));
            return;
        }

        // Table checksum, when the header claims one.
        if header.checksum_valid() {
            let mut temp_table = body.as_slice()[fit_offset..fit_offset + fit_size].to_vec();
            temp_table[15] = 0; // header checksum byte
            let calculated = crate::checksum::checksum8(&temp_table);
            if calculated != header.checksum {
                self.msg(
                    Some(fit_index),
                    Severity::Warning,
                    format!("parseFit: invalid FIT table checksum {:02X}h, should be {:02X}h", header.checksum, calculated),
                );
            }
        }

        if header.type_masked() != pi_fit::entry_type::HEADER {
            self.msg(Some(fit_index), Severity::Warning, "parseFit: invalid FIT header type");
        }

        self.fit_table.push(FitRow {
            address: String::from_utf8_lossy(&pi_fit::FIT_SIGNATURE).into_owned(),
            size: format!("{:08X}", fit_size),
            version: format!("{:04X}", header.version),
            checksum: format!("{:02X}", header.checksum),
            entry_type: fit_entry_type_to_string(header.entry_type).to_string(),
            info: String::new(),
        });

        let mut msg_modified_image_may_not_work = false;
        for entry_index in 1..entry_count {
            let Some(entry) = body.read_struct::<pi_fit::FitEntry>(fit_offset + entry_index * pi_fit::FitEntry::SIZE)
            else {
                break;
            };

            let info = match entry.type_masked() {
                pi_fit::entry_type::HEADER => {
                    self.msg(Some(fit_index), Severity::Warning, "parseFit: second FIT header found, the table is damaged");
                    String::new()
                }
                pi_fit::entry_type::EMPTY => String::new(),
                pi_fit::entry_type::MICROCODE => self.parse_fit_entry_microcode(&entry, diff),
                pi_fit::entry_type::BIOS_AC_MODULE => {
                    msg_modified_image_may_not_work = true;
                    self.parse_fit_entry_acm(&entry, diff)
                }
                pi_fit::entry_type::AC_KEY_MANIFEST => {
                    msg_modified_image_may_not_work = true;
                    self.parse_fit_entry_key_manifest(&entry, diff)
                }
                pi_fit::entry_type::AC_BOOT_POLICY => {
                    msg_modified_image_may_not_work = true;
                    self.parse_fit_entry_boot_policy(&entry, diff)
                }
                _ => {
                    msg_modified_image_may_not_work = true;
                    String::new()
                }
            };

            self.fit_table.push(FitRow {
                address: format!("{:08X}", entry.address),
                size: format!("{:08X}", entry.size24()),
                version: format!("{:04X}", entry.version),
                checksum: format!("{:02X}", entry.checksum),
                entry_type: fit_entry_type_to_string(entry.entry_type).to_string(),
                info,
            });
        }

        if msg_modified_image_may_not_work {
            self.msg(None, Severity::Warning, "parseFit: opened image may not work after any modification");
        }

        // Boot Guard consistency across entries.
        if self.bg_acm_found && (!self.bg_key_manifest_found || !self.bg_boot_policy_found) {
            self.msg(
                None,
                Severity::Warning,
                "parseFit: startup ACM found, but Key Manifest or Boot Policy is missing",
            );
        }
        if let (Some(km_hash), Some(bp_key)) = (self.bg_km_bp_key_hash.clone(), self.bg_bp_public_key.clone()) {
            let calculated: Vec<u8> = Sha256::digest(&bp_key).to_vec();
            if calculated != km_hash {
                self.msg(
                    None,
                    Severity::Error,
                    "parseFit: Boot Policy key hash stored in Key Manifest differs from the hash of Boot Policy public key",
                );
            }
        }
    }

    /// Scans node bodies for the FIT signature, children before parents,
    /// and accepts the candidate the last VTF points at.
    fn find_fit_recursive(&mut self, index: ItemId, diff: u64, fit_pointer: u64) -> Option<(ItemId, usize)> {
        for child in self.model.children(index).to_vec() {
            if let Some(found) = self.find_fit_recursive(child, diff, fit_pointer) {
                return Some(found);
            }
        }

        if index == self.model.root() || self.model.compressed(index) {
            return None;
        }

        let body = self.model.body(index).clone();
        let mut search_from = 0usize;
        while let Some(offset_in_body) = body.index_of(&pi_fit::FIT_SIGNATURE, search_from) {
            let fit_address =
                diff + self.model.offset(index) as u64 + self.model.header(index).len() as u64 + offset_in_body as u64;
            if fit_address == fit_pointer {
                self.msg(
                    Some(index),
                    Severity::Info,
                    format!("findFitRecursive: real FIT table found at physical address {:08X}h", fit_address),
                );
                return Some((index, offset_in_body));
            }
            if self.model.children(index).is_empty() {
                self.msg(
                    Some(index),
                    Severity::Warning,
                    "findFitRecursive: FIT table candidate found, but not referenced from the last VTF",
                );
            }
            search_from = offset_in_body + 1;
        }
        None
    }

    /// Bytes at a physical address, resolved through the address
    /// difference back into the image.
    fn physical_address_bytes(&self, address: u64, diff: u64) -> Option<Bytes> {
        let offset = address.checked_sub(diff)?;
        if offset as usize >= self.image.len() {
            return None;
        }
        Some(self.image.from_offset(offset as usize))
    }

    fn parse_fit_entry_microcode(&mut self, entry: &pi_fit::FitEntry, diff: u64) -> String {
        let item = self.model.find_by_offset(entry.address.wrapping_sub(diff) as usize);
        let Some(data) = self.physical_address_bytes(entry.address, diff) else {
            self.msg(item, Severity::Error, format!("parseFitEntryMicrocode: {}", ParseError::InvalidMicrocode));
            return String::new();
        };
        let Some(header) = data.read_struct::<pi_fit::MicrocodeHeader>(0) else {
            self.msg(item, Severity::Error, format!("parseFitEntryMicrocode: {}", ParseError::InvalidMicrocode));
            return String::new();
        };

        if header.header_version != pi_fit::MICROCODE_HEADER_VERSION
            || header.loader_revision != pi_fit::MICROCODE_LOADER_REVISION
            || header.reserved != [0, 0, 0]
        {
            self.msg(item, Severity::Error, format!("parseFitEntryMicrocode: {}", ParseError::InvalidMicrocode));
            return String::new();
        }

        format!(
            "CPU signature: {:08X}h, Revision: {:08X}h, Date: {:08X}h",
            header.processor_signature, header.update_revision, header.date
        )
    }

    fn parse_fit_entry_acm(&mut self, entry: &pi_fit::FitEntry, diff: u64) -> String {
        let item = self.model.find_by_offset(entry.address.wrapping_sub(diff) as usize);
        let Some(data) = self.physical_address_bytes(entry.address, diff) else {
            self.msg(item, Severity::Error, format!("parseFitEntryAcm: {}", ParseError::InvalidAcm));
            return String::new();
        };
        let Some(header) = data.read_struct::<pi_fit::AcmHeader>(0) else {
            self.msg(item, Severity::Error, format!("parseFitEntryAcm: {}", ParseError::InvalidAcm));
            return String::new();
        };

        if header.module_type != pi_fit::ACM_MODULE_TYPE {
            self.msg(item, Severity::Error, format!("parseFitEntryAcm: {}", ParseError::InvalidAcm));
            return String::new();
        }
        if header.module_vendor != pi_fit::ACM_MODULE_VENDOR_INTEL {
            self.msg(
                item,
                Severity::Error,
                format!("parseFitEntryAcm: ACM module vendor {:04X}h is not Intel", header.module_vendor),
            );
            return String::new();
        }

        self.bg_acm_found = true;

        // The RSA public key and signature trail the fixed header; their
        // validation belongs to the platform, only their presence matters
        // for the manifest cross-checks.
        format!(
            "ACM SVN: {}, Date: {:08X}h, Size: {}",
            header.acm_svn,
            header.date,
            size_string(header.module_size as usize * 4)
        )
    }

    fn parse_fit_entry_key_manifest(&mut self, entry: &pi_fit::FitEntry, diff: u64) -> String {
        let item = self.model.find_by_offset(entry.address.wrapping_sub(diff) as usize);
        let Some(data) = self.physical_address_bytes(entry.address, diff) else {
            self.msg(item, Severity::Error, format!("parseFitEntryKeyManifest: {}", ParseError::InvalidKeyManifest));
            return String::new();
        };
        let Some(header) = data.read_struct::<pi_fit::KeyManifestHeader>(0) else {
            self.msg(item, Severity::Error, format!("parseFitEntryKeyManifest: {}", ParseError::InvalidKeyManifest));
            return String::new();
        };
        if header.tag != pi_fit::bg_tag::KEY_MANIFEST {
            self.msg(item, Severity::Error, format!("parseFitEntryKeyManifest: {}", ParseError::InvalidKeyManifest));
            return String::new();
        }

        self.bg_key_manifest_found = true;

        let hash_offset = core::mem::size_of::<pi_fit::KeyManifestHeader>();
        if let Some((bp_key_hash, _)) = pi_fit::BgHash::from_bytes(&data.as_slice()[hash_offset.min(data.len())..]) {
            self.bg_km_bp_key_hash = Some(bp_key_hash.hash);
        }

        format!("KM version: {}, KM SVN: {}, KM ID: {}", header.km_version, header.km_svn, header.km_id)
    }

    fn parse_fit_entry_boot_policy(&mut self, entry: &pi_fit::FitEntry, diff: u64) -> String {
        let item = self.model.find_by_offset(entry.address.wrapping_sub(diff) as usize);
        let Some(data) = self.physical_address_bytes(entry.address, diff) else {
            self.msg(item, Severity::Error, format!("parseFitEntryBootPolicy: {}", ParseError::InvalidBootPolicy));
            return String::new();
        };
        let Some(header) = data.read_struct::<pi_fit::BootPolicyHeader>(0) else {
            self.msg(item, Severity::Error, format!("parseFitEntryBootPolicy: {}", ParseError::InvalidBootPolicy));
            return String::new();
        };
        if header.tag != pi_fit::bg_tag::BOOT_POLICY {
            self.msg(item, Severity::Error, format!("parseFitEntryBootPolicy: {}", ParseError::InvalidBootPolicy));
            return String::new();
        }

        self.bg_boot_policy_found = true;

        // Chained elements follow the policy header.
        let mut element_offset = core::mem::size_of::<pi_fit::BootPolicyHeader>();
        let mut ibb_segments = 0usize;
        let limit = (header.total_size as usize).min(data.len());
        while element_offset + 8 <= limit {
            let tag: [u8; 8] = data.as_slice()[element_offset..element_offset + 8].try_into().unwrap();
            if tag == pi_fit::bg_tag::IBB_ELEMENT {
                match self.parse_ibb_element(&data, element_offset) {
                    Some((consumed, segments)) => {
                        ibb_segments += segments;
                        element_offset += consumed;
                    }
                    None => {
                        self.msg(
                            item,
                            Severity::Error,
                            format!("parseFitEntryBootPolicy: {}", ParseError::InvalidBootPolicy),
                        );
                        break;
                    }
                }
            } else if tag == pi_fit::bg_tag::PM_DATA_ELEMENT {
                let Some(pmda) = data.read_struct::<pi_fit::PmDataElementHeader>(element_offset) else {
                    break;
                };
                element_offset +=
                    core::mem::size_of::<pi_fit::PmDataElementHeader>() + pmda.data_size as usize;
            } else if tag == pi_fit::bg_tag::SIGNATURE_ELEMENT {
                let key_offset = element_offset + core::mem::size_of::<pi_fit::SignatureElementHeader>();
                if let Some((key, _)) = pi_fit::BgRsaPublicKey::from_bytes(&data.as_slice()[key_offset.min(data.len())..])
                {
                    self.bg_bp_public_key = Some(key.modulus);
                }
                // The signature terminates the element chain.
                break;
            } else {
                break;
            }
        }

        format!("BP elements: IBB segments: {}", ibb_segments)
    }

    /// Parses an IBB element, accumulating its segments as Boot
    /// Guard protected ranges. Returns (bytes consumed, segment count).
    fn parse_ibb_element(&mut self, data: &Bytes, element_offset: usize) -> Option<(usize, usize)> {
        let mut cursor = element_offset + core::mem::size_of::<pi_fit::IbbElementHeader>();
        data.read_struct::<pi_fit::IbbElementHeader>(element_offset)?;

        let (_post_ibb_hash, consumed) = pi_fit::BgHash::from_bytes(&data.as_slice()[cursor.min(data.len())..])?;
        cursor += consumed;

        // IBB entry point sits between the two hashes.
        data.read_u32(cursor)?;
        cursor += 4;

        let (digest, consumed) = pi_fit::BgHash::from_bytes(&data.as_slice()[cursor.min(data.len())..])?;
        cursor += consumed;
        self.bg_bp_digest = Some(digest.hash.clone());

        let segment_count = *data.as_slice().get(cursor)? as usize;
        cursor += 1;

        let segment_size = core::mem::size_of::<pi_fit::IbbSegment>();
        let mut segments = 0usize;
        for _ in 0..segment_count {
            let segment = data.read_struct::<pi_fit::IbbSegment>(cursor)?;
            cursor += segment_size;
            if segment.size == 0 {
                continue;
            }
            self.protected_ranges.push(ProtectedRange {
                offset: segment.base as u64,
                size: segment.size as u64,
                kind: ProtectedRangeKind::IbbBootGuard,
                hash: digest.hash.clone(),
            });
            segments += 1;
        }

        Some((cursor - element_offset, segments))
    }
}
