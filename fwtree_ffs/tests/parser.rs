//! End-to-end parser tests over synthetic flash images.
//!
//! Every image is built byte-by-byte in the test, so the expectations are
//! exact: tree shape, node classification, message log content.
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use r_efi::efi;

use fwtree_ffs::checksum::{checksum16, checksum8};
use fwtree_ffs::model::{
    ImageSubtype, ItemId, ItemType, Marking, PaddingSubtype, RegionSubtype, Subtype, TreeModel, VolumeSubtype,
};
use fwtree_ffs::msg::Severity;
use fwtree_ffs::{FfsParser, ParseError};
use fwtree_pi::ffs::file::raw::r#type as file_type;
use fwtree_pi::ffs::section::raw_type as section_type;
use fwtree_pi::guid;

const VOLUME_HEADER_LEN: usize = 72; // fixed header + two block map entries
const FILE_HEADER_LEN: usize = 24;

fn test_guid(seed: u8) -> efi::Guid {
    efi::Guid::from_bytes(&[seed; 16])
}

/// Builds a revision 2 volume: erase polarity 1, alignment 1, valid
/// header checksum, body padded with 0xFF up to `fv_length`.
fn build_volume(fs_guid: &efi::Guid, fv_length: usize, body: &[u8]) -> Vec<u8> {
    assert!(VOLUME_HEADER_LEN + body.len() <= fv_length);
    let mut volume = vec![0u8; 56];
    volume[16..32].copy_from_slice(fs_guid.as_bytes());
    volume[32..40].copy_from_slice(&(fv_length as u64).to_le_bytes());
    volume[40..44].copy_from_slice(b"_FVH");
    let attributes: u32 = 0x0000_0800; // erase polarity 1
    volume[44..48].copy_from_slice(&attributes.to_le_bytes());
    volume[48..50].copy_from_slice(&(VOLUME_HEADER_LEN as u16).to_le_bytes());
    volume[55] = 2; // revision
    volume.extend(((fv_length / 0x1000) as u32).to_le_bytes());
    volume.extend(0x1000u32.to_le_bytes());
    volume.extend([0u8; 8]); // block map terminator
    let checksum = checksum16(&volume);
    volume[50..52].copy_from_slice(&checksum.to_le_bytes());
    volume.extend_from_slice(body);
    volume.resize(fv_length, 0xFF);
    volume
}

/// Builds an FFSv2 file with a valid header checksum and the fixed data
/// checksum byte.
fn build_file(file_guid: &efi::Guid, file_type: u8, body: &[u8]) -> Vec<u8> {
    let total = FILE_HEADER_LEN + body.len();
    let mut file = vec![0u8; FILE_HEADER_LEN];
    file[..16].copy_from_slice(file_guid.as_bytes());
    file[18] = file_type;
    file[19] = 0; // attributes
    file[20..23].copy_from_slice(&(total as u32).to_le_bytes()[..3]);
    file[23] = 0xF8; // state
    let header_checksum = checksum8(&file[..FILE_HEADER_LEN - 1]);
    file[16] = header_checksum;
    file[17] = 0xAA; // fixed data checksum
    file.extend_from_slice(body);
    file
}

fn build_section(section_type: u8, body: &[u8]) -> Vec<u8> {
    let total = 4 + body.len();
    let mut section = (total as u32).to_le_bytes()[..3].to_vec();
    section.push(section_type);
    section.extend_from_slice(body);
    section
}

/// UTF-16LE encoding with terminator, for UI and Version sections.
fn ucs2(text: &str) -> Vec<u8> {
    let mut encoded: Vec<u8> = text.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect();
    encoded.extend([0u8, 0]);
    encoded
}

/// Minimal PE32 image: DOS header, PE signature, COFF header, 32-bit
/// optional header.
fn build_pe32_body() -> Vec<u8> {
    let mut pe = vec![0u8; 64];
    pe[0..2].copy_from_slice(&0x5A4Du16.to_le_bytes()); // MZ
    pe[60..64].copy_from_slice(&64u32.to_le_bytes()); // e_lfanew
    pe.extend(0x0000_4550u32.to_le_bytes()); // PE\0\0
    // COFF file header
    pe.extend(0x014Cu16.to_le_bytes()); // machine: x86
    pe.extend(1u16.to_le_bytes()); // sections
    pe.extend(0u32.to_le_bytes()); // timestamp
    pe.extend(0u32.to_le_bytes()); // symbol table
    pe.extend(0u32.to_le_bytes()); // symbols
    pe.extend(100u16.to_le_bytes()); // optional header size
    pe.extend(0x0102u16.to_le_bytes()); // characteristics
    // Optional header, sized to keep the enclosing file 8-byte aligned
    let mut optional = vec![0u8; 100];
    optional[0..2].copy_from_slice(&0x010Bu16.to_le_bytes()); // PE32 magic
    optional[16..20].copy_from_slice(&0x1000u32.to_le_bytes()); // entry point
    optional[20..24].copy_from_slice(&0x2000u32.to_le_bytes()); // base of code
    optional[28..32].copy_from_slice(&0x0040_0000u32.to_le_bytes()); // image base
    optional[68..70].copy_from_slice(&0x000Au16.to_le_bytes()); // subsystem
    pe.extend(optional);
    pe
}

fn warnings_and_errors(parser: &FfsParser) -> Vec<String> {
    parser
        .messages()
        .iter()
        .filter(|m| m.severity != Severity::Info)
        .map(|m| m.text.clone())
        .collect()
}

/// Byte coverage of a subtree: leaves count in full, containers count
/// their header plus their children (decompressed children excluded).
fn covered_bytes(model: &TreeModel, index: ItemId) -> usize {
    let uncompressed_children: Vec<ItemId> =
        model.children(index).iter().copied().filter(|&c| !model.compressed(c)).collect();
    if uncompressed_children.is_empty() {
        return model.full_size(index);
    }
    model.header(index).len()
        + model.tail(index).len()
        + uncompressed_children.iter().map(|&c| covered_bytes(model, c)).sum::<usize>()
}

fn assert_sibling_order(model: &TreeModel, index: ItemId) {
    let children = model.children(index);
    for pair in children.windows(2) {
        let previous_end = model.offset(pair[0]) + model.full_size(pair[0]);
        assert!(
            model.offset(pair[1]) >= previous_end,
            "sibling at {:#x} overlaps the end of the previous one at {:#x}",
            model.offset(pair[1]),
            previous_end
        );
    }
    for &child in children {
        assert_sibling_order(model, child);
    }
}

#[test]
fn pure_capsule_header_is_rejected() {
    // A capsule that is all header has no image to parse.
    let mut capsule = Vec::new();
    capsule.extend(guid::EFI_CAPSULE_GUID.as_bytes());
    capsule.extend(0x1Cu32.to_le_bytes()); // header size
    capsule.extend(0u32.to_le_bytes()); // flags
    capsule.extend(0x1Cu32.to_le_bytes()); // image size
    assert_eq!(capsule.len(), 28);

    let mut parser = FfsParser::new();
    assert_eq!(parser.parse(&capsule), Err(ParseError::InvalidParameter));
    assert!(parser.messages().contains("smaller than minimum size"));
    assert!(parser.model().children(parser.model().root()).is_empty());
}

#[test]
fn uefi_capsule_wraps_the_flash_image() {
    let volume = build_volume(&guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID, 0x1000, &[]);
    let mut capsule = Vec::new();
    capsule.extend(guid::EFI_CAPSULE_GUID.as_bytes());
    capsule.extend(28u32.to_le_bytes());
    capsule.extend(0u32.to_le_bytes());
    capsule.extend(((28 + volume.len()) as u32).to_le_bytes());
    capsule.extend(&volume);

    let mut parser = FfsParser::new();
    parser.parse(&capsule).unwrap();

    let model = parser.model();
    let root_children = model.children(model.root());
    assert_eq!(root_children.len(), 1);
    let capsule_node = root_children[0];
    assert_eq!(model.item_type(capsule_node), ItemType::Capsule);
    assert_eq!(model.header(capsule_node).len(), 28);

    let image_node = model.children(capsule_node)[0];
    assert_eq!(model.subtype(image_node), Subtype::Image(ImageSubtype::Uefi));
    let volume_node = model.children(image_node)[0];
    assert_eq!(model.subtype(volume_node), Subtype::Volume(VolumeSubtype::Ffs2));
    assert_eq!(model.offset(volume_node), 28);
}

#[test]
fn empty_intel_image_yields_descriptor_and_bios_regions() {
    let mut image = vec![0xFFu8; 0x2000];
    image[..16].fill(0xFF); // reserved vector
    image[0x10..0x14].copy_from_slice(&0x0FF0_A55Au32.to_le_bytes());
    // Descriptor map: component base 0x03, region base 0x04, master base 0x06.
    image[0x14..0x18].copy_from_slice(&0x0204_0103u32.to_le_bytes());
    image[0x18..0x1C].copy_from_slice(&0x0000_0206u32.to_le_bytes());
    image[0x1C..0x20].copy_from_slice(&0u32.to_le_bytes());
    image[0x20..0x24].copy_from_slice(&0u32.to_le_bytes());
    // Component section at 0x30: read clock frequency 0 (20 MHz, v1).
    image[0x30..0x3C].fill(0);
    // Region section at 0x40: descriptor pair zero, BIOS [0x1000, 0x2000).
    image[0x40..0x44].fill(0);
    image[0x44..0x46].copy_from_slice(&0x0001u16.to_le_bytes()); // BIOS base
    image[0x46..0x48].copy_from_slice(&0x0001u16.to_le_bytes()); // BIOS limit
    image[0x48..0x68].fill(0); // remaining region pairs unused
    // Master section at 0x60 is inside the zeroed area already.
    // Upper map: empty VSCC table.
    image[0xEFC] = 0;
    image[0xEFD] = 0;

    let mut parser = FfsParser::new();
    // An empty BIOS region holds no volumes; the tree is still complete.
    assert_eq!(parser.parse(&image), Err(ParseError::VolumesNotFound));

    let model = parser.model();
    let image_node = model.children(model.root())[0];
    assert_eq!(model.subtype(image_node), Subtype::Image(ImageSubtype::Intel));

    let regions = model.children(image_node);
    assert_eq!(regions.len(), 2);
    assert_eq!(model.subtype(regions[0]), Subtype::Region(RegionSubtype::Descriptor));
    assert_eq!(model.subtype(regions[1]), Subtype::Region(RegionSubtype::Bios));
    assert_eq!(model.offset(regions[1]), 0x1000);
    assert!(model.children(regions[1]).is_empty());

    // A consistent region map produces no complaints at all.
    let complaints = warnings_and_errors(&parser);
    assert!(complaints.is_empty(), "unexpected messages: {:?}", complaints);
}

#[test]
fn ffsv2_volume_with_pe32_driver() {
    let pe32_section = build_section(section_type::PE32, &build_pe32_body());
    let file = build_file(&test_guid(0x11), file_type::DRIVER, &pe32_section);
    let image = build_volume(&guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID, 0x1000, &file);

    let mut parser = FfsParser::new();
    parser.parse(&image).unwrap();

    let model = parser.model();
    let image_node = model.children(model.root())[0];
    let volume_node = model.children(image_node)[0];
    assert_eq!(model.subtype(volume_node), Subtype::Volume(VolumeSubtype::Ffs2));

    let volume_children = model.children(volume_node);
    assert_eq!(volume_children.len(), 2, "expected the file plus trailing free space");
    let file_node = volume_children[0];
    assert_eq!(model.subtype(file_node), Subtype::File(file_type::DRIVER));
    assert_eq!(model.item_type(volume_children[1]), ItemType::FreeSpace);

    // The displayed name is the file GUID in registry format.
    let expected_name = uuid::Uuid::from_bytes_le(*test_guid(0x11).as_bytes()).to_string().to_uppercase();
    assert_eq!(model.name(file_node), expected_name);

    let section_node = model.children(file_node)[0];
    assert_eq!(model.subtype(section_node), Subtype::Section(section_type::PE32));
    assert!(model.info(section_node).contains("Machine type: x86"));
    assert!(model.info(section_node).contains("Image base: 400000h"));

    // No checksum or alignment complaints on a well-formed image.
    let complaints = warnings_and_errors(&parser);
    assert_eq!(complaints.len(), 1, "unexpected messages: {:?}", complaints);
    assert!(complaints[0].contains("not a single Volume Top File"));

    // Byte accounting and sibling ordering hold for the whole tree.
    assert_eq!(covered_bytes(model, image_node), image.len());
    assert_sibling_order(model, model.root());
}

#[test]
fn uncompressed_encapsulation_materialises_inner_ui_section() {
    // Compression section with type 0 carries its payload verbatim.
    let ui_section = build_section(section_type::USER_INTERFACE, &ucs2("Test"));
    let mut compression_body = Vec::new();
    compression_body.extend((ui_section.len() as u32).to_le_bytes()); // uncompressed size
    compression_body.push(0x00); // not compressed
    compression_body.extend(&ui_section);
    let compression_section = build_section(section_type::encapsulated::COMPRESSION, &compression_body);

    let file = build_file(&test_guid(0x22), file_type::FREEFORM, &compression_section);
    let image = build_volume(&guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID, 0x1000, &file);

    let mut parser = FfsParser::new();
    parser.parse(&image).unwrap();

    let model = parser.model();
    let image_node = model.children(model.root())[0];
    let volume_node = model.children(image_node)[0];
    let file_node = model.children(volume_node)[0];
    let compression_node = model.children(file_node)[0];
    assert_eq!(model.subtype(compression_node), Subtype::Section(section_type::encapsulated::COMPRESSION));
    assert!(model.info(compression_node).contains("Compression algorithm: None"));
    assert!(!model.compressed(compression_node));

    let ui_node = model.children(compression_node)[0];
    assert_eq!(model.subtype(ui_node), Subtype::Section(section_type::USER_INTERFACE));
    assert!(model.info(ui_node).contains("Text: Test"));

    // The UI string renames the containing file.
    assert_eq!(model.text(file_node), "Test");
}

#[test]
fn lzma_guided_section_is_decompressed_and_marked() {
    let ui_section = build_section(section_type::USER_INTERFACE, &ucs2("Test"));
    let mut compressed = Vec::new();
    let options = lzma_rs::compress::Options {
        unpacked_size: lzma_rs::compress::UnpackedSize::WriteToHeader(Some(ui_section.len() as u64)),
    };
    lzma_rs::lzma_compress_with_options(&mut std::io::Cursor::new(&ui_section[..]), &mut compressed, &options)
        .unwrap();

    // GUID-defined section: common lead, GUID, data offset, attributes.
    let mut guided_body = Vec::new();
    guided_body.extend(guid::EFI_GUIDED_SECTION_LZMA.as_bytes());
    guided_body.extend(24u16.to_le_bytes()); // data offset
    guided_body.extend(0x0001u16.to_le_bytes()); // processing required
    guided_body.extend(&compressed);
    let guided_section = build_section(section_type::encapsulated::GUID_DEFINED, &guided_body);

    let file = build_file(&test_guid(0x33), file_type::FREEFORM, &guided_section);
    let image = build_volume(&guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID, 0x1000, &file);

    let mut parser = FfsParser::new();
    parser.parse(&image).unwrap();

    let model = parser.model();
    let image_node = model.children(model.root())[0];
    let volume_node = model.children(image_node)[0];
    let file_node = model.children(volume_node)[0];
    let guided_node = model.children(file_node)[0];
    assert_eq!(model.subtype(guided_node), Subtype::Section(section_type::encapsulated::GUID_DEFINED));
    assert!(model.compressed(guided_node));
    assert!(model.info(guided_node).contains("Compression algorithm: LZMA"));

    let ui_node = model.children(guided_node)[0];
    assert!(model.compressed(ui_node));
    assert!(model.info(ui_node).contains("Text: Test"));
    assert_eq!(model.text(file_node), "Test");
}

#[test]
fn truncated_volume_becomes_padding() {
    // 0x100 bytes of padding, then a volume claiming 0x2000 bytes with
    // only 0x1000 available.
    let volume = build_volume(&guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID, 0x2000, &[]);
    let mut image = vec![0x00u8; 0x100];
    image.extend(&volume[..0x1000]);

    let mut parser = FfsParser::new();
    assert_eq!(parser.parse(&image), Err(ParseError::InvalidVolume));
    assert!(parser.messages().contains("one of volumes inside overlaps the end of data"));

    let model = parser.model();
    let image_node = model.children(model.root())[0];
    let children = model.children(image_node);
    assert_eq!(children.len(), 2);
    assert_eq!(model.subtype(children[0]), Subtype::Padding(PaddingSubtype::Zero));
    assert_eq!(model.item_type(children[1]), ItemType::Padding);
    assert_eq!(model.offset(children[1]), 0x100);
    assert_eq!(model.full_size(children[1]), 0x1000);
}

#[test]
fn volume_header_length_boundary() {
    // HeaderLength equal to the full volume length parses.
    let mut volume = build_volume(&guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID, 0x1000, &[]);
    volume[48..50].copy_from_slice(&0x1000u16.to_le_bytes());
    let checksum_zeroed = {
        let mut copy = volume[..0x1000].to_vec();
        copy[50] = 0;
        copy[51] = 0;
        checksum16(&copy)
    };
    volume[50..52].copy_from_slice(&checksum_zeroed.to_le_bytes());

    let mut parser = FfsParser::new();
    parser.parse(&volume).unwrap_or(());
    let model = parser.model();
    let image_node = model.children(model.root())[0];
    assert_eq!(model.item_type(model.children(image_node)[0]), ItemType::Volume);

    // One byte more and the header overlaps the end of the data.
    volume[48..50].copy_from_slice(&0x1001u16.to_le_bytes());
    let mut parser = FfsParser::new();
    let _ = parser.parse(&volume);
    assert!(parser.messages().contains("volume header overlaps the end of data"));
    let model = parser.model();
    let image_node = model.children(model.root())[0];
    assert!(model.children(image_node).iter().all(|&c| model.item_type(c) != ItemType::Volume));
}

#[test]
fn truncated_large_file_keeps_prior_children() {
    // FFSv3 volume: one good file, then a file claiming the large-file
    // attribute with a size too small to hold the extended header.
    let good_file = build_file(&test_guid(0x44), file_type::FREEFORM, &build_section(section_type::RAW, &[0xAA; 4]));
    let mut body = good_file.clone();

    let mut bad_file = vec![0u8; FILE_HEADER_LEN];
    bad_file[..16].copy_from_slice(test_guid(0x45).as_bytes());
    bad_file[18] = file_type::FREEFORM;
    bad_file[19] = 0x01; // LARGE_FILE
    bad_file[23] = 0xF8;
    let header_checksum = checksum8(&bad_file[..FILE_HEADER_LEN - 1]);
    bad_file[16] = header_checksum;
    bad_file[17] = 0xAA;
    // Extended size declares 28 bytes: the slice handed to the file
    // header parser is too small to hold the 32-byte extended header.
    bad_file.extend(28u64.to_le_bytes());
    body.extend(&bad_file);

    let image = build_volume(&guid::EFI_FIRMWARE_FILE_SYSTEM3_GUID, 0x1000, &body);

    let mut parser = FfsParser::new();
    let _ = parser.parse(&image);
    assert!(parser.messages().contains("file header parsing failed"));

    let model = parser.model();
    let image_node = model.children(model.root())[0];
    let volume_node = model.children(image_node)[0];
    assert_eq!(model.subtype(volume_node), Subtype::Volume(VolumeSubtype::Ffs3));
    let first_file = model.children(volume_node)[0];
    assert_eq!(model.subtype(first_file), Subtype::File(file_type::FREEFORM));
}

#[test]
fn non_empty_pad_file_is_renamed() {
    let mut pad_body = vec![0xFFu8; 32];
    pad_body[24] = 0x12; // stray byte in the pad
    let pad_file = build_file(&test_guid(0xFF), file_type::FFS_PAD, &pad_body);
    let image = build_volume(&guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID, 0x1000, &pad_file);

    let mut parser = FfsParser::new();
    parser.parse(&image).unwrap();

    let model = parser.model();
    let image_node = model.children(model.root())[0];
    let volume_node = model.children(image_node)[0];
    let pad_node = model.children(volume_node)[0];
    assert_eq!(model.name(pad_node), "Non-empty pad-file");
    assert!(parser.messages().contains("non-UEFI data found in pad-file"));

    let pad_children = model.children(pad_node);
    assert_eq!(pad_children.len(), 2);
    assert_eq!(model.item_type(pad_children[0]), ItemType::FreeSpace);
    assert_eq!(model.subtype(pad_children[1]), Subtype::Padding(PaddingSubtype::Data));
}

#[test]
fn duplicate_file_guids_are_reported() {
    let file_a = build_file(&test_guid(0x55), file_type::FREEFORM, &build_section(section_type::RAW, &[1, 2, 3, 4]));
    let mut body = file_a.clone();
    while body.len() % 8 != 0 {
        body.push(0xFF);
    }
    body.extend(build_file(&test_guid(0x55), file_type::FREEFORM, &build_section(section_type::RAW, &[5, 6, 7, 8])));
    let image = build_volume(&guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID, 0x1000, &body);

    let mut parser = FfsParser::new();
    parser.parse(&image).unwrap();
    assert!(parser.messages().contains("file with duplicate GUID"));
}

#[test]
fn depex_section_renders_parsed_expression() {
    let mut depex_body = vec![0x02u8]; // PUSH
    depex_body.extend(test_guid(0x66).as_bytes());
    depex_body.push(0x08); // END
    let depex_section = build_section(section_type::DXE_DEPEX, &depex_body);
    let file = build_file(&test_guid(0x67), file_type::DRIVER, &depex_section);
    let image = build_volume(&guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID, 0x1000, &file);

    let mut parser = FfsParser::new();
    parser.parse(&image).unwrap();

    let model = parser.model();
    let image_node = model.children(model.root())[0];
    let volume_node = model.children(image_node)[0];
    let file_node = model.children(volume_node)[0];
    let depex_node = model.children(file_node)[0];
    let info = model.info(depex_node);
    assert!(info.contains("Parsed expression:"));
    assert!(info.contains("PUSH 66666666-6666-6666-6666-666666666666"));
    assert!(info.contains("END"));
    assert!(!parser.messages().contains("unknown opcode"));
}

#[test]
fn vtf_anchors_memory_addresses() {
    // Volume body: one driver, free space, then the VTF at the very end.
    let driver =
        build_file(&test_guid(0x77), file_type::DRIVER, &build_section(section_type::PE32, &build_pe32_body()));

    let fv_length = 0x2000;
    let body_len = fv_length - VOLUME_HEADER_LEN;
    let vtf_total = FILE_HEADER_LEN + 0x40;
    let vtf_body = vec![0xFFu8; 0x40];
    let vtf = build_file(&guid::EFI_FFS_VOLUME_TOP_FILE_GUID, file_type::RAW, &vtf_body);
    assert_eq!(vtf.len(), vtf_total);

    let mut body = driver.clone();
    body.resize(body_len - vtf_total, 0xFF);
    body.extend(&vtf);
    let image = build_volume(&guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID, fv_length, &body);

    let mut parser = FfsParser::new();
    parser.parse(&image).unwrap();

    // VTF found: the no-VTF advisory must be absent and addresses appear.
    assert!(!parser.messages().contains("not a single Volume Top File"));
    let model = parser.model();
    let image_node = model.children(model.root())[0];
    let volume_node = model.children(image_node)[0];
    let expected_base = 0x1_0000_0000u64 - fv_length as u64;
    assert!(model.info(volume_node).contains(&format!("Header memory address: {:08X}h", expected_base)));

    let vtf_node = *model
        .children(volume_node)
        .iter()
        .find(|&&c| model.text(c) == "Volume Top File")
        .expect("VTF node missing");
    assert_eq!(model.offset(vtf_node) + model.full_size(vtf_node), image.len());
}

/// Builds the boot policy manifest blob with one IBB segment.
fn build_boot_policy(digest: &[u8; 32], segment_base: u32, segment_size: u32) -> Vec<u8> {
    let mut bpm = Vec::new();
    bpm.extend(b"__ACBP__");
    bpm.push(1); // version
    bpm.push(0);
    bpm.extend(0u16.to_le_bytes()); // total size, patched below

    bpm.extend(b"__IBBS__");
    bpm.push(1); // version
    bpm.push(0);
    bpm.extend(0u16.to_le_bytes());
    bpm.extend(0u32.to_le_bytes()); // flags
    bpm.extend(0u64.to_le_bytes()); // IBB MCH BAR
    bpm.extend(0u64.to_le_bytes()); // VT-d BAR
    bpm.extend(0u32.to_le_bytes()); // DMA protection base 0
    bpm.extend(0u32.to_le_bytes()); // DMA protection limit 0
    bpm.extend(0u64.to_le_bytes()); // DMA protection base 1
    bpm.extend(0u64.to_le_bytes()); // DMA protection limit 1
    bpm.extend(0x000Bu16.to_le_bytes()); // post-IBB hash: SHA256
    bpm.extend(32u16.to_le_bytes());
    bpm.extend([0u8; 32]);
    bpm.extend(0u32.to_le_bytes()); // IBB entry point
    bpm.extend(0x000Bu16.to_le_bytes()); // IBB digest: SHA256
    bpm.extend(32u16.to_le_bytes());
    bpm.extend(digest);
    bpm.push(1); // segment count
    bpm.extend(0u16.to_le_bytes()); // reserved
    bpm.extend(0u16.to_le_bytes()); // flags
    bpm.extend(segment_base.to_le_bytes());
    bpm.extend(segment_size.to_le_bytes());

    let total = bpm.len() as u16;
    bpm[10..12].copy_from_slice(&total.to_le_bytes());
    bpm
}

#[test]
fn boot_guard_range_mismatch_is_flagged() {
    let fv_length = 0x2000usize;
    let diff = 0x1_0000_0000u64 - fv_length as u64;

    // File A carries the FIT table, file B the boot policy manifest.
    let fit_file_guid = test_guid(0xA1);
    let bpm_file_guid = test_guid(0xA2);

    // Offsets inside the image, laid out up front.
    let fit_image_offset = VOLUME_HEADER_LEN + FILE_HEADER_LEN;
    let fit_file_total = FILE_HEADER_LEN + 32; // two 16-byte entries
    let bpm_file_offset = VOLUME_HEADER_LEN + ((fit_file_total + 7) & !7);
    let bpm_image_offset = bpm_file_offset + FILE_HEADER_LEN;

    // The protected range covers the volume header; the declared digest
    // is deliberately wrong.
    let bogus_digest = [0u8; 32];
    let bpm = build_boot_policy(&bogus_digest, diff as u32, VOLUME_HEADER_LEN as u32);

    let mut fit = Vec::new();
    fit.extend(b"_FIT_   "); // header entry address doubles as signature
    fit.extend([2u8, 0, 0]); // two entries
    fit.push(0);
    fit.extend(0x0100u16.to_le_bytes());
    fit.push(0x00); // header type, no checksum flag
    fit.push(0);
    fit.extend((diff + bpm_image_offset as u64).to_le_bytes()); // BP address
    fit.extend((bpm.len() as u32).to_le_bytes()[..3].iter());
    fit.push(0);
    fit.extend(0x0100u16.to_le_bytes());
    fit.push(0x0C); // BG Boot Policy
    fit.push(0);
    assert_eq!(fit.len(), 32);

    let fit_file = build_file(&fit_file_guid, file_type::RAW, &fit);
    let bpm_file = build_file(&bpm_file_guid, file_type::RAW, &bpm);

    let mut body = fit_file.clone();
    while body.len() % 8 != 0 {
        body.push(0xFF);
    }
    assert_eq!(VOLUME_HEADER_LEN + body.len(), bpm_file_offset);
    body.extend(&bpm_file);

    // VTF at the very end of the image, FIT pointer at its fixed slot.
    let vtf_total = FILE_HEADER_LEN + 0x40;
    let mut vtf_body = vec![0xFFu8; 0x40];
    vtf_body[..4].copy_from_slice(&((diff + fit_image_offset as u64) as u32).to_le_bytes());
    let vtf = build_file(&guid::EFI_FFS_VOLUME_TOP_FILE_GUID, file_type::RAW, &vtf_body);

    let body_len = fv_length - VOLUME_HEADER_LEN;
    body.resize(body_len - vtf_total, 0xFF);
    body.extend(&vtf);
    let image = build_volume(&guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID, fv_length, &body);
    assert_eq!(image.len(), fv_length);

    let mut parser = FfsParser::new();
    parser.parse(&image).unwrap();

    // The FIT was found through the VTF pointer and rendered.
    assert!(parser.messages().contains("real FIT table found"));
    let rows = parser.fit_table();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].entry_type, "Header");
    assert_eq!(rows[1].entry_type, "BG Boot Policy");

    // The declared IBB digest does not match the protected bytes.
    assert!(parser.messages().contains("BG-protected ranges hash mismatch"));

    // The volume straddles the violated range and is marked.
    let model = parser.model();
    let image_node = model.children(model.root())[0];
    let volume_node = model.children(image_node)[0];
    assert_eq!(model.marking(volume_node), Marking::OverlapsRange);
}

#[test]
fn phoenix_vendor_hash_mismatch_is_flagged() {
    // Protect the first 8 bytes of the first volume with a wrong hash.
    let mut hash_body = Vec::new();
    hash_body.extend(b"$HS2");
    hash_body.extend(1u32.to_le_bytes()); // one entry
    hash_body.extend(0u32.to_le_bytes()); // offset, relative to first volume
    hash_body.extend(8u32.to_le_bytes()); // size
    hash_body.extend([0u8; 32]); // bogus digest

    let hash_file = build_file(&guid::VENDOR_HASH_FILE_GUID_PHOENIX, file_type::RAW, &hash_body);

    // A VTF is needed so the later passes run at all.
    let fv_length = 0x1000;
    let vtf_total = FILE_HEADER_LEN + 0x40;
    let vtf = build_file(&guid::EFI_FFS_VOLUME_TOP_FILE_GUID, file_type::RAW, &vec![0xFFu8; 0x40]);

    let mut body = hash_file.clone();
    body.resize(fv_length - VOLUME_HEADER_LEN - vtf_total, 0xFF);
    body.extend(&vtf);
    let image = build_volume(&guid::EFI_FIRMWARE_FILE_SYSTEM2_GUID, fv_length, &body);

    let mut parser = FfsParser::new();
    parser.parse(&image).unwrap();

    let model = parser.model();
    let image_node = model.children(model.root())[0];
    let volume_node = model.children(image_node)[0];
    let hash_node = model.children(volume_node)[0];
    assert!(model.info(hash_node).contains("Protected range"));
    assert!(parser.messages().contains("vendor hash mismatch"));
    assert_eq!(model.marking(volume_node), Marking::OverlapsRange);
}
