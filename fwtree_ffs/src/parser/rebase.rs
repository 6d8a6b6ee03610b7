//! Second pass: memory address propagation from the last Volume Top File.
//!
//! The last byte of the last VTF maps to physical address 0xFFFFFFFF, so
//! the difference between image offsets and physical addresses is fixed
//! for everything outside compressed encapsulations.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use fwtree_pi::ffs::section as pi_section;

use crate::model::{ItemId, ItemType, ParsingData, Subtype, TeBaseType};
use crate::msg::Severity;
use crate::parser::FfsParser;

impl FfsParser {
    /// Computes the address difference and annotates every uncompressed
    /// node with its memory addresses. Never fails the parse.
    pub(crate) fn perform_second_pass(&mut self) {
        let Some(last_vtf) = self.last_vtf else {
            return;
        };
        if self.model.compressed(last_vtf) {
            self.msg(
                Some(last_vtf),
                Severity::Warning,
                "performSecondPass: the last VTF appears inside compressed item, the image may be damaged",
            );
            return;
        }

        let vtf_size = self.model.full_size(last_vtf) as u64;
        let vtf_offset = self.model.offset(last_vtf) as u64;
        let diff = 0xFFFF_FFFFu64 - vtf_offset - vtf_size + 1;
        self.address_diff = Some(diff);

        for index in self.model.depth_first() {
            self.add_memory_addresses(index, diff);
        }
    }

    fn add_memory_addresses(&mut self, index: ItemId, diff: u64) {
        // Nodes inside compressed encapsulations have no fixed address.
        if self.model.compressed(index) {
            return;
        }
        let address = diff + self.model.offset(index) as u64;
        if address > 0xFFFF_FFFF {
            return;
        }

        let header_size = self.model.header(index).len() as u64;
        let info = if header_size != 0 {
            format!(
                "\nHeader memory address: {:08X}h\nData memory address: {:08X}h",
                address,
                address + header_size
            )
        } else {
            format!("\nMemory address: {:08X}h", address)
        };
        self.model.add_info(index, &info, true);

        // Uncompressed TE sections reveal whether their image base was
        // left as linked or adjusted for the stripped headers.
        if self.model.item_type(index) == ItemType::Section
            && self.model.subtype(index) == Subtype::Section(pi_section::raw_type::TE)
        {
            if let ParsingData::TeImageSection(mut pdata) = self.model.parsing_data(index).clone() {
                let expected = address + header_size;
                pdata.base_type = if pdata.image_base == expected {
                    TeBaseType::Original
                } else if pdata.adjusted_image_base == expected {
                    TeBaseType::Adjusted
                } else if (pdata.image_base ^ expected).count_ones() == 1 {
                    // A single flipped bit is far more likely a bitrot
                    // artifact than a different base.
                    TeBaseType::Original
                } else if (pdata.adjusted_image_base ^ expected).count_ones() == 1 {
                    TeBaseType::Adjusted
                } else {
                    self.msg(
                        Some(index),
                        Severity::Warning,
                        "addMemoryAddresses: TE image base is neither original nor adjusted, it's likely a part of backup PEI volume or DXE volume, but can also be damaged",
                    );
                    TeBaseType::Other
                };
                self.model.set_parsing_data(index, ParsingData::TeImageSection(pdata));
            }
        }
    }
}
