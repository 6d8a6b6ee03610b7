//! Intel flash descriptor and region parsing.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use fwtree_pi::descriptor::{self, gbe, FLASH_DESCRIPTOR_SIZE};
use fwtree_pi::me;

use crate::bytes::Bytes;
use crate::err::ParseError;
use crate::model::{ImageSubtype, InsertMode, ItemId, ItemType, ParsingData, RegionSubtype, Subtype};
use crate::msg::Severity;
use crate::parser::{size_string, FfsParser};

/// One region candidate before tree emission.
#[derive(Debug, Clone, Copy)]
struct RegionInfo {
    offset: usize,
    length: usize,
    kind: RegionKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RegionKind {
    Region(RegionSubtype),
    Padding,
}

fn region_name(subtype: RegionSubtype) -> &'static str {
    match subtype {
        RegionSubtype::Descriptor => "Descriptor",
        RegionSubtype::Bios => "BIOS",
        RegionSubtype::Me => "ME",
        RegionSubtype::Gbe => "GbE",
        RegionSubtype::Pdr => "PDR",
        RegionSubtype::Reserved1 => "Reserved1",
        RegionSubtype::Reserved2 => "Reserved2",
        RegionSubtype::Reserved3 => "Reserved3",
        RegionSubtype::Ec => "EC",
        RegionSubtype::Reserved4 => "Reserved4",
    }
}

fn access_string(bits: u16, mask: u16) -> &'static str {
    if bits & mask != 0 {
        "Yes "
    } else {
        "No  "
    }
}

impl FfsParser {
    /// Parses an Intel image: descriptor, regions, synthesised padding.
    /// `parent_offset` is the offset of the flash image inside the input
    /// (the capsule header size when a capsule was stripped).
    pub(crate) fn parse_intel_image(
        &mut self,
        intel_image: &Bytes,
        parent_offset: usize,
        parent: Option<ItemId>,
    ) -> Result<(), ParseError> {
        if intel_image.is_empty() {
            return Err(ParseError::InvalidParameter);
        }
        if intel_image.len() < FLASH_DESCRIPTOR_SIZE {
            self.msg(
                None,
                Severity::Error,
                "parseIntelImage: input file is smaller than minimum descriptor size of 1000h (4096) bytes",
            );
            return Err(ParseError::InvalidFlashDescriptor);
        }

        let map: descriptor::DescriptorMap = intel_image
            .read_struct(core::mem::size_of::<descriptor::DescriptorHeader>())
            .ok_or(ParseError::InvalidFlashDescriptor)?;

        // Sanity of the section bases.
        if map.master_base() > descriptor::FLASH_DESCRIPTOR_MAX_BASE
            || map.master_base() == map.region_base()
            || map.master_base() == map.component_base()
        {
            self.msg(
                None,
                Severity::Error,
                format!("parseIntelImage: invalid descriptor master base {:02X}h", map.master_base()),
            );
            return Err(ParseError::InvalidFlashDescriptor);
        }
        if map.region_base() > descriptor::FLASH_DESCRIPTOR_MAX_BASE || map.region_base() == map.component_base() {
            self.msg(
                None,
                Severity::Error,
                format!("parseIntelImage: invalid descriptor region base {:02X}h", map.region_base()),
            );
            return Err(ParseError::InvalidFlashDescriptor);
        }
        if map.component_base() > descriptor::FLASH_DESCRIPTOR_MAX_BASE {
            self.msg(
                None,
                Severity::Error,
                format!("parseIntelImage: invalid descriptor component base {:02X}h", map.component_base()),
            );
            return Err(ParseError::InvalidFlashDescriptor);
        }

        let region_section: descriptor::RegionSection = intel_image
            .read_struct(descriptor::section_offset(map.region_base()))
            .ok_or(ParseError::InvalidFlashDescriptor)?;
        let component_section: descriptor::ComponentSection = intel_image
            .read_struct(descriptor::section_offset(map.component_base()))
            .ok_or(ParseError::InvalidFlashDescriptor)?;

        // 20 MHz read clock marks the old descriptor layout; everything
        // since Skylake reports another frequency and uses the v2 layout.
        let descriptor_version =
            if component_section.read_clock_frequency() == descriptor::FLASH_FREQUENCY_20MHZ { 1 } else { 2 };

        let mut regions: Vec<RegionInfo> = Vec::new();
        let candidate = |subtype: RegionSubtype, base: u16, limit: u16| {
            if limit == 0 || (base == 0xFFFF && limit == 0xFFFF) {
                return None;
            }
            let region = RegionInfo {
                offset: descriptor::region_offset(base),
                length: descriptor::region_size(base, limit),
                kind: RegionKind::Region(subtype),
            };
            Some(region)
        };

        let me_region = candidate(RegionSubtype::Me, region_section.me_base, region_section.me_limit);
        if let Some(region) = me_region {
            regions.push(region);
        }

        // BIOS region is mandatory.
        let Some(mut bios) = candidate(RegionSubtype::Bios, region_section.bios_base, region_section.bios_limit)
        else {
            self.msg(
                None,
                Severity::Error,
                "parseIntelImage: descriptor parsing failed, BIOS region not found in descriptor",
            );
            return Err(ParseError::InvalidFlashDescriptor);
        };
        // Gigabyte-specific descriptors declare the BIOS region over the
        // whole chip; the real BIOS area starts where the ME region ends.
        if bios.length == intel_image.len() {
            let Some(me) = me_region else {
                self.msg(
                    None,
                    Severity::Error,
                    "parseIntelImage: can't determine BIOS region start from Gigabyte-specific descriptor",
                );
                return Err(ParseError::InvalidFlashDescriptor);
            };
            bios.offset = me.offset + me.length;
            bios.length = intel_image.len() - bios.offset;
        }
        regions.push(bios);

        for (subtype, base, limit) in [
            (RegionSubtype::Gbe, region_section.gbe_base, region_section.gbe_limit),
            (RegionSubtype::Pdr, region_section.pdr_base, region_section.pdr_limit),
            (RegionSubtype::Reserved1, region_section.reserved1_base, region_section.reserved1_limit),
            (RegionSubtype::Reserved2, region_section.reserved2_base, region_section.reserved2_limit),
        ] {
            if let Some(region) = candidate(subtype, base, limit) {
                regions.push(region);
            }
        }

        // EC and the remaining reserved regions only exist on v2.
        if descriptor_version == 2 {
            for (subtype, base, limit) in [
                (RegionSubtype::Reserved3, region_section.reserved3_base, region_section.reserved3_limit),
                (RegionSubtype::Ec, region_section.ec_base, region_section.ec_limit),
                (RegionSubtype::Reserved4, region_section.reserved4_base, region_section.reserved4_limit),
            ] {
                if let Some(region) = candidate(subtype, base, limit) {
                    regions.push(region);
                }
            }
        }

        regions.sort_by_key(|r| r.offset);

        // The first region must start at or after the descriptor end.
        if regions[0].offset < FLASH_DESCRIPTOR_SIZE {
            let name = match regions[0].kind {
                RegionKind::Region(subtype) => region_name(subtype),
                RegionKind::Padding => "Padding",
            };
            self.msg(
                None,
                Severity::Error,
                format!("parseIntelImage: {} region has intersection with flash descriptor", name),
            );
            return Err(ParseError::InvalidFlashDescriptor);
        }
        if regions[0].offset > FLASH_DESCRIPTOR_SIZE {
            let padding = RegionInfo {
                offset: FLASH_DESCRIPTOR_SIZE,
                length: regions[0].offset - FLASH_DESCRIPTOR_SIZE,
                kind: RegionKind::Padding,
            };
            regions.insert(0, padding);
        }

        // Intersections and gaps between adjacent regions.
        let mut i = 1;
        while i < regions.len() {
            let previous_end = regions[i - 1].offset + regions[i - 1].length;
            let current = regions[i];
            if current.offset + current.length > intel_image.len() {
                let name = match current.kind {
                    RegionKind::Region(subtype) => region_name(subtype),
                    RegionKind::Padding => "Padding",
                };
                self.msg(
                    None,
                    Severity::Error,
                    format!(
                        "parseIntelImage: {} region is located outside of the opened image, if your system uses dual-chip storage, please append another part to the opened image",
                        name
                    ),
                );
                return Err(ParseError::TruncatedImage);
            }
            if current.offset < previous_end {
                let (current_name, previous_name) = match (current.kind, regions[i - 1].kind) {
                    (RegionKind::Region(c), RegionKind::Region(p)) => (region_name(c), region_name(p)),
                    _ => ("Padding", "Padding"),
                };
                self.msg(
                    None,
                    Severity::Error,
                    format!(
                        "parseIntelImage: {} region has intersection with {} region",
                        current_name, previous_name
                    ),
                );
                return Err(ParseError::InvalidFlashDescriptor);
            }
            if current.offset > previous_end {
                let padding = RegionInfo {
                    offset: previous_end,
                    length: current.offset - previous_end,
                    kind: RegionKind::Padding,
                };
                regions.insert(i, padding);
                i += 1;
            }
            i += 1;
        }

        // Trailing padding after the last region.
        let last_end = regions.last().map(|r| r.offset + r.length).unwrap_or(0);
        if last_end < intel_image.len() {
            regions.push(RegionInfo { offset: last_end, length: intel_image.len() - last_end, kind: RegionKind::Padding });
        }

        // Region map is consistent; emit the image node.
        let mut info = format!(
            "Full size: {}\nFlash chips: {}\nRegions: {}\nMasters: {}\nPCH straps: {}\nPROC straps: {}",
            size_string(intel_image.len()),
            map.number_of_flash_chips() + 1, // zero-based in storage
            map.number_of_regions() + 1,
            map.number_of_masters() + 1,
            map.number_of_pch_straps(),
            map.number_of_proc_straps()
        );
        let image_index = self.model.add_item(
            parent_offset,
            ItemType::Image,
            Subtype::Image(ImageSubtype::Intel),
            "Intel image",
            "",
            info,
            Bytes::new(),
            intel_image.clone(),
            true,
            ParsingData::None,
            parent,
            InsertMode::Append,
        );

        // Descriptor region node.
        info = String::from("Full size: 1000h (4096)");
        for region in &regions {
            if let RegionKind::Region(subtype) = region.kind {
                info.push_str(&format!(
                    "\n{} region offset: {:X}h",
                    region_name(subtype),
                    region.offset + parent_offset
                ));
            }
        }

        if descriptor_version == 1 {
            let masters: descriptor::MasterSection = intel_image
                .read_struct(descriptor::section_offset(map.master_base()))
                .ok_or(ParseError::InvalidFlashDescriptor)?;
            info.push_str("\nRegion access settings:");
            info.push_str(&format!(
                "\nBIOS: {:02X}h {:02X}h ME: {:02X}h {:02X}h\nGbE:  {:02X}h {:02X}h",
                masters.bios_read, masters.bios_write, masters.me_read, masters.me_write, masters.gbe_read,
                masters.gbe_write
            ));
            info.push_str("\nBIOS access table:");
            info.push_str("\n      Read  Write");
            info.push_str(&format!(
                "\nDesc  {}  {}",
                access_string(masters.bios_read as u16, descriptor::region_access::DESC),
                access_string(masters.bios_write as u16, descriptor::region_access::DESC)
            ));
            info.push_str("\nBIOS  Yes   Yes");
            info.push_str(&format!(
                "\nME    {}  {}",
                access_string(masters.bios_read as u16, descriptor::region_access::ME),
                access_string(masters.bios_write as u16, descriptor::region_access::ME)
            ));
            info.push_str(&format!(
                "\nGbE   {}  {}",
                access_string(masters.bios_read as u16, descriptor::region_access::GBE),
                access_string(masters.bios_write as u16, descriptor::region_access::GBE)
            ));
            info.push_str(&format!(
                "\nPDR   {}  {}",
                access_string(masters.bios_read as u16, descriptor::region_access::PDR),
                access_string(masters.bios_write as u16, descriptor::region_access::PDR)
            ));
        } else {
            let masters: descriptor::MasterSectionV2 = intel_image
                .read_struct(descriptor::section_offset(map.master_base()))
                .ok_or(ParseError::InvalidFlashDescriptor)?;
            info.push_str("\nRegion access settings:");
            info.push_str(&format!(
                "\nBIOS: {:03X}h {:03X}h ME: {:03X}h {:03X}h\nGbE:  {:03X}h {:03X}h EC: {:03X}h {:03X}h",
                masters.bios_read(),
                masters.bios_write(),
                masters.me_read(),
                masters.me_write(),
                masters.gbe_read(),
                masters.gbe_write(),
                masters.ec_read(),
                masters.ec_write()
            ));
            info.push_str("\nBIOS access table:");
            info.push_str("\n      Read  Write");
            info.push_str(&format!(
                "\nDesc  {}  {}",
                access_string(masters.bios_read(), descriptor::region_access::DESC),
                access_string(masters.bios_write(), descriptor::region_access::DESC)
            ));
            info.push_str("\nBIOS  Yes   Yes");
            info.push_str(&format!(
                "\nME    {}  {}",
                access_string(masters.bios_read(), descriptor::region_access::ME),
                access_string(masters.bios_write(), descriptor::region_access::ME)
            ));
            info.push_str(&format!(
                "\nGbE   {}  {}",
                access_string(masters.bios_read(), descriptor::region_access::GBE),
                access_string(masters.bios_write(), descriptor::region_access::GBE)
            ));
            info.push_str(&format!(
                "\nPDR   {}  {}",
                access_string(masters.bios_read(), descriptor::region_access::PDR),
                access_string(masters.bios_write(), descriptor::region_access::PDR)
            ));
            info.push_str(&format!(
                "\nEC    {}  {}",
                access_string(masters.bios_read(), descriptor::region_access::EC),
                access_string(masters.bios_write(), descriptor::region_access::EC)
            ));
        }

        // VSCC table from the upper map.
        if let Some(upper_map) = intel_image.read_struct::<descriptor::UpperMap>(descriptor::FLASH_DESCRIPTOR_UPPER_MAP_BASE)
        {
            info.push_str("\nFlash chips in VSCC table:");
            let table_offset = (upper_map.vscc_table_base as usize) << 4;
            let entry_size = core::mem::size_of::<descriptor::VsccTableEntry>();
            let entry_count = (upper_map.vscc_table_size as usize) * 4 / entry_size;
            for index in 0..entry_count {
                if let Some(entry) =
                    intel_image.read_struct::<descriptor::VsccTableEntry>(table_offset + index * entry_size)
                {
                    info.push_str(&format!("\n{:02X}{:02X}{:02X}h", entry.vendor_id, entry.device_id0, entry.device_id1));
                }
            }
        }

        self.model.add_item(
            parent_offset,
            ItemType::Region,
            Subtype::Region(RegionSubtype::Descriptor),
            "Descriptor region",
            "",
            info,
            Bytes::new(),
            intel_image.left(FLASH_DESCRIPTOR_SIZE),
            true,
            ParsingData::None,
            Some(image_index),
            InsertMode::Append,
        );

        // Parse the remaining regions in layout order; keep the first
        // failure as the final result but finish the map regardless.
        let mut parse_result = Ok(());
        for region in &regions {
            let region_bytes = intel_image.mid(region.offset, region.length);
            let absolute_offset = parent_offset + region.offset;
            let result = match region.kind {
                RegionKind::Region(RegionSubtype::Bios) => {
                    self.parse_bios_region(&region_bytes, absolute_offset, image_index)
                }
                RegionKind::Region(RegionSubtype::Me) => {
                    self.parse_me_region(&region_bytes, absolute_offset, image_index)
                }
                RegionKind::Region(RegionSubtype::Gbe) => {
                    self.parse_gbe_region(&region_bytes, absolute_offset, image_index)
                }
                RegionKind::Region(RegionSubtype::Pdr) => {
                    self.parse_pdr_region(&region_bytes, absolute_offset, image_index)
                }
                RegionKind::Region(subtype) => {
                    self.parse_general_region(subtype, &region_bytes, absolute_offset, image_index)
                }
                RegionKind::Padding => {
                    self.add_padding_item(absolute_offset, "Padding", region_bytes, image_index);
                    Ok(())
                }
            };
            if parse_result.is_ok() {
                if let Err(err) = result {
                    parse_result = Err(err);
                }
            }
        }

        parse_result
    }

    fn parse_gbe_region(&mut self, region: &Bytes, offset: usize, parent: ItemId) -> Result<(), ParseError> {
        if region.is_empty() {
            return Err(ParseError::EmptyRegion);
        }
        if region.len() < gbe::VERSION_OFFSET + core::mem::size_of::<gbe::Version>() {
            return Err(ParseError::InvalidRegion);
        }

        let mac: gbe::MacAddress = region.read_struct(0).ok_or(ParseError::InvalidRegion)?;
        let version: gbe::Version = region.read_struct(gbe::VERSION_OFFSET).ok_or(ParseError::InvalidRegion)?;
        let info = format!(
            "Full size: {}\nMAC: {:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}\nVersion: {}.{}",
            size_string(region.len()),
            mac.vendor[0],
            mac.vendor[1],
            mac.vendor[2],
            mac.device[0],
            mac.device[1],
            mac.device[2],
            version.major,
            version.minor()
        );

        self.model.add_item(
            offset,
            ItemType::Region,
            Subtype::Region(RegionSubtype::Gbe),
            "GbE region",
            "",
            info,
            Bytes::new(),
            region.clone(),
            true,
            ParsingData::None,
            Some(parent),
            InsertMode::Append,
        );
        Ok(())
    }

    fn parse_me_region(&mut self, region: &Bytes, offset: usize, parent: ItemId) -> Result<(), ParseError> {
        if region.is_empty() {
            return Err(ParseError::EmptyRegion);
        }

        let mut info = format!("Full size: {}", size_string(region.len()));
        let mut version_found = true;
        let mut empty_region = false;

        if region.all(0xFF) || region.all(0x00) {
            empty_region = true;
            info.push_str("\nState: empty");
        } else {
            let mut version_offset = region.index_of(&me::ME_VERSION_SIGNATURE2, 0);
            if version_offset.is_none() {
                version_offset = region.index_of(&me::ME_VERSION_SIGNATURE, 0);
            }
            match version_offset {
                None => {
                    info.push_str("\nVersion: unknown");
                    version_found = false;
                }
                Some(version_offset) => {
                    let version: me::MeVersion =
                        region.read_struct(version_offset).ok_or(ParseError::InvalidRegion)?;
                    info.push_str(&format!(
                        "\nVersion: {}.{}.{}.{}",
                        version.major, version.minor, version.bugfix, version.build
                    ));
                }
            }
        }

        let index = self.model.add_item(
            offset,
            ItemType::Region,
            Subtype::Region(RegionSubtype::Me),
            "ME region",
            "",
            info,
            Bytes::new(),
            region.clone(),
            true,
            ParsingData::None,
            Some(parent),
            InsertMode::Append,
        );

        if empty_region {
            self.msg(Some(index), Severity::Warning, "parseMeRegion: ME region is empty");
        } else if !version_found {
            self.msg(Some(index), Severity::Warning, "parseMeRegion: ME version is unknown, it can be damaged");
        }
        Ok(())
    }

    fn parse_pdr_region(&mut self, region: &Bytes, offset: usize, parent: ItemId) -> Result<(), ParseError> {
        if region.is_empty() {
            return Err(ParseError::EmptyRegion);
        }

        let info = format!("Full size: {}", size_string(region.len()));
        let index = self.model.add_item(
            offset,
            ItemType::Region,
            Subtype::Region(RegionSubtype::Pdr),
            "PDR region",
            "",
            info,
            Bytes::new(),
            region.clone(),
            true,
            ParsingData::None,
            Some(parent),
            InsertMode::Append,
        );

        // The PDR region may carry volumes like a BIOS space; an empty one
        // is fine.
        match self.parse_raw_area(index) {
            Ok(()) | Err(ParseError::VolumesNotFound) | Err(ParseError::InvalidVolume) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn parse_general_region(
        &mut self,
        subtype: RegionSubtype,
        region: &Bytes,
        offset: usize,
        parent: ItemId,
    ) -> Result<(), ParseError> {
        if region.is_empty() {
            return Err(ParseError::EmptyRegion);
        }

        let info = format!("Full size: {}", size_string(region.len()));
        self.model.add_item(
            offset,
            ItemType::Region,
            Subtype::Region(subtype),
            format!("{} region", region_name(subtype)),
            "",
            info,
            Bytes::new(),
            region.clone(),
            true,
            ParsingData::None,
            Some(parent),
            InsertMode::Append,
        );
        Ok(())
    }

    fn parse_bios_region(&mut self, region: &Bytes, offset: usize, parent: ItemId) -> Result<(), ParseError> {
        if region.is_empty() {
            return Err(ParseError::EmptyRegion);
        }

        let info = format!("Full size: {}", size_string(region.len()));
        let index = self.model.add_item(
            offset,
            ItemType::Region,
            Subtype::Region(RegionSubtype::Bios),
            "BIOS region",
            "",
            info,
            Bytes::new(),
            region.clone(),
            true,
            ParsingData::None,
            Some(parent),
            InsertMode::Append,
        );

        self.parse_raw_area(index)
    }
}
