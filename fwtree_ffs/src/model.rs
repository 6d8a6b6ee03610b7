//! Tree model for parsed flash images.
//!
//! Nodes live in an index-addressed arena owned by [`TreeModel`]; an
//! [`ItemId`] is just a stable index into it. Children are ordered by
//! ascending on-disk offset within their parent. The parser is the only
//! writer during the first pass; later passes touch nothing but the
//! annotation fields (`info`, `parsing_data`, `marking`).
//!
//! ## License
//!
//! Copyright (C) Microsoft Corporation.
//!
//! SPDX-License-Identifier: Apache-2.0
//!
use r_efi::efi;

use crate::bytes::Bytes;

/// Handle of a node inside a [`TreeModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId(usize);

/// Node type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    Root,
    Capsule,
    Image,
    Region,
    Padding,
    Volume,
    File,
    Section,
    FreeSpace,
}

/// Capsule flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapsuleSubtype {
    Uefi,
    Toshiba,
    AptioSigned,
    AptioUnsigned,
}

/// Image flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageSubtype {
    Intel,
    Uefi,
}

/// Flash descriptor region role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RegionSubtype {
    Descriptor,
    Bios,
    Me,
    Gbe,
    Pdr,
    Reserved1,
    Reserved2,
    Reserved3,
    Ec,
    Reserved4,
}

/// Padding content classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaddingSubtype {
    /// All bytes are 0x00
    Zero,
    /// All bytes are 0xFF
    One,
    /// Anything else
    Data,
}

/// Volume filesystem classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeSubtype {
    Unknown,
    Ffs2,
    Ffs3,
    Nvram,
}

/// Type-specific node subtype. File and section subtypes are the raw type
/// bytes from their headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subtype {
    None,
    Capsule(CapsuleSubtype),
    Image(ImageSubtype),
    Region(RegionSubtype),
    Padding(PaddingSubtype),
    Volume(VolumeSubtype),
    File(u8),
    Section(u8),
}

/// Mutation intent attached by editors; the parser always leaves
/// `NoAction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Action {
    #[default]
    NoAction,
    Create,
    Insert,
    Replace,
    Remove,
    Rebuild,
    Rebase,
}

/// Colour tag applied by the protected-range validator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Marking {
    #[default]
    None,
    /// Node lies entirely inside a protected range
    InRange,
    /// Node straddles a protected range boundary
    OverlapsRange,
}

/// Per-subtype parsing data recorded by the parser.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ParsingData {
    #[default]
    None,
    Volume(VolumeParsingData),
    File(FileParsingData),
    CompressedSection(CompressedSectionParsingData),
    GuidedSection(GuidedSectionParsingData),
    FreeformSubtypeGuidSection(FreeformSubtypeGuidSectionParsingData),
    TeImageSection(TeImageSectionParsingData),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeParsingData {
    pub empty_byte: u8,
    pub ffs_version: u8,
    pub has_extended_header: bool,
    pub extended_header_guid: efi::Guid,
    pub alignment: u32,
    pub revision: u8,
    pub has_apple_crc32: bool,
    pub used_space: bool,
    pub is_weak_aligned: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileParsingData {
    pub empty_byte: u8,
    pub guid: efi::Guid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressedSectionParsingData {
    pub compression_type: u8,
    pub uncompressed_size: u32,
    /// Detected by the body parse; `None` until then
    pub algorithm: Option<fwtree_extract::Algorithm>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidedSectionParsingData {
    pub guid: efi::Guid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FreeformSubtypeGuidSectionParsingData {
    pub guid: efi::Guid,
}

/// How a TE section's stored image base relates to its actual memory
/// address; decided during the second pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TeBaseType {
    #[default]
    Other,
    Original,
    Adjusted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TeImageSectionParsingData {
    pub image_base: u64,
    pub adjusted_image_base: u64,
    pub base_type: TeBaseType,
}

/// Placement of a new node among its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertMode {
    Append,
    Prepend,
    Before(ItemId),
    After(ItemId),
}

#[derive(Debug)]
struct TreeItem {
    parent: Option<ItemId>,
    children: Vec<ItemId>,
    item_type: ItemType,
    subtype: Subtype,
    /// Absolute offset in the original image (or in the decompressed
    /// buffer for nodes below a compressed boundary)
    offset: usize,
    name: String,
    text: String,
    info: String,
    header: Bytes,
    body: Bytes,
    tail: Bytes,
    parsing_data: ParsingData,
    fixed: bool,
    compressed: bool,
    action: Action,
    marking: Marking,
}

/// Arena-backed ordered tree of parse nodes.
#[derive(Debug)]
pub struct TreeModel {
    items: Vec<TreeItem>,
}

impl TreeModel {
    /// Creates a model holding only the root node.
    pub fn new() -> Self {
        Self {
            items: vec![TreeItem {
                parent: None,
                children: Vec::new(),
                item_type: ItemType::Root,
                subtype: Subtype::None,
                offset: 0,
                name: String::new(),
                text: String::new(),
                info: String::new(),
                header: Bytes::new(),
                body: Bytes::new(),
                tail: Bytes::new(),
                parsing_data: ParsingData::None,
                fixed: false,
                compressed: false,
                action: Action::NoAction,
                marking: Marking::None,
            }],
        }
    }

    pub fn root(&self) -> ItemId {
        ItemId(0)
    }

    fn item(&self, id: ItemId) -> &TreeItem {
        &self.items[id.0]
    }

    fn item_mut(&mut self, id: ItemId) -> &mut TreeItem {
        &mut self.items[id.0]
    }

    /// Adds a node under `parent` (the root when `None`).
    #[allow(clippy::too_many_arguments)]
    pub fn add_item(
        &mut self,
        offset: usize,
        item_type: ItemType,
        subtype: Subtype,
        name: impl Into<String>,
        text: impl Into<String>,
        info: impl Into<String>,
        header: Bytes,
        body: Bytes,
        fixed: bool,
        parsing_data: ParsingData,
        parent: Option<ItemId>,
        mode: InsertMode,
    ) -> ItemId {
        let parent = parent.unwrap_or_else(|| self.root());
        let compressed = self.item(parent).compressed;
        let id = ItemId(self.items.len());
        self.items.push(TreeItem {
            parent: Some(parent),
            children: Vec::new(),
            item_type,
            subtype,
            offset,
            name: name.into(),
            text: text.into(),
            info: info.into(),
            header,
            body,
            tail: Bytes::new(),
            parsing_data,
            fixed,
            compressed,
            action: Action::NoAction,
            marking: Marking::None,
        });

        let siblings = &mut self.item_mut(parent).children;
        match mode {
            InsertMode::Append => siblings.push(id),
            InsertMode::Prepend => siblings.insert(0, id),
            InsertMode::Before(anchor) => {
                let at = siblings.iter().position(|&c| c == anchor).unwrap_or(0);
                siblings.insert(at, id);
            }
            InsertMode::After(anchor) => {
                let at = siblings.iter().position(|&c| c == anchor).map(|p| p + 1).unwrap_or(siblings.len());
                siblings.insert(at, id);
            }
        }

        if fixed {
            self.set_fixed(id, true);
        }
        id
    }

    pub fn children(&self, id: ItemId) -> &[ItemId] {
        &self.item(id).children
    }

    /// Position of the node among its siblings.
    pub fn row(&self, id: ItemId) -> usize {
        match self.item(id).parent {
            Some(parent) => self.item(parent).children.iter().position(|&c| c == id).unwrap_or(0),
            None => 0,
        }
    }

    pub fn parent(&self, id: ItemId) -> Option<ItemId> {
        self.item(id).parent
    }

    pub fn item_type(&self, id: ItemId) -> ItemType {
        self.item(id).item_type
    }

    pub fn subtype(&self, id: ItemId) -> Subtype {
        self.item(id).subtype
    }

    pub fn offset(&self, id: ItemId) -> usize {
        self.item(id).offset
    }

    pub fn name(&self, id: ItemId) -> &str {
        &self.item(id).name
    }

    pub fn text(&self, id: ItemId) -> &str {
        &self.item(id).text
    }

    pub fn info(&self, id: ItemId) -> &str {
        &self.item(id).info
    }

    pub fn header(&self, id: ItemId) -> &Bytes {
        &self.item(id).header
    }

    pub fn body(&self, id: ItemId) -> &Bytes {
        &self.item(id).body
    }

    pub fn tail(&self, id: ItemId) -> &Bytes {
        &self.item(id).tail
    }

    /// Full on-disk size of the node: header + body + tail.
    pub fn full_size(&self, id: ItemId) -> usize {
        let item = self.item(id);
        item.header.len() + item.body.len() + item.tail.len()
    }

    pub fn parsing_data(&self, id: ItemId) -> &ParsingData {
        &self.item(id).parsing_data
    }

    pub fn fixed(&self, id: ItemId) -> bool {
        self.item(id).fixed
    }

    pub fn compressed(&self, id: ItemId) -> bool {
        self.item(id).compressed
    }

    pub fn action(&self, id: ItemId) -> Action {
        self.item(id).action
    }

    pub fn marking(&self, id: ItemId) -> Marking {
        self.item(id).marking
    }

    pub fn set_name(&mut self, id: ItemId, name: impl Into<String>) {
        self.item_mut(id).name = name.into();
    }

    pub fn set_text(&mut self, id: ItemId, text: impl Into<String>) {
        self.item_mut(id).text = text.into();
    }

    pub fn set_info(&mut self, id: ItemId, info: impl Into<String>) {
        self.item_mut(id).info = info.into();
    }

    /// Appends (or prepends) to the accumulated info text.
    pub fn add_info(&mut self, id: ItemId, info: &str, append: bool) {
        let item = self.item_mut(id);
        if append {
            item.info.push_str(info);
        } else {
            item.info.insert_str(0, info);
        }
    }

    pub fn set_tail(&mut self, id: ItemId, tail: Bytes) {
        self.item_mut(id).tail = tail;
    }

    pub fn set_parsing_data(&mut self, id: ItemId, data: ParsingData) {
        self.item_mut(id).parsing_data = data;
    }

    pub fn set_compressed(&mut self, id: ItemId, compressed: bool) {
        self.item_mut(id).compressed = compressed;
    }

    pub fn set_action(&mut self, id: ItemId, action: Action) {
        self.item_mut(id).action = action;
    }

    pub fn set_marking(&mut self, id: ItemId, marking: Marking) {
        self.item_mut(id).marking = marking;
    }

    /// Sets the fixed flag and propagates it upward. Propagation stops at
    /// a compressed boundary (a compressed node under an uncompressed
    /// parent takes the parent's current flag instead of forcing it), so
    /// fixing something inside a compressed body never pins the container.
    pub fn set_fixed(&mut self, id: ItemId, fixed: bool) {
        self.item_mut(id).fixed = fixed;
        if !fixed {
            return;
        }
        let Some(parent) = self.item(id).parent else {
            return;
        };
        if self.item(id).compressed && !self.item(parent).compressed {
            let parent_fixed = self.item(parent).fixed;
            self.item_mut(id).fixed = parent_fixed;
        } else if self.item(parent).item_type != ItemType::Root {
            self.set_fixed(parent, fixed);
        }
    }

    /// Nearest ancestor of the given type.
    pub fn find_parent_of_type(&self, id: ItemId, item_type: ItemType) -> Option<ItemId> {
        let mut current = self.item(id).parent;
        while let Some(ancestor) = current {
            if self.item(ancestor).item_type == item_type {
                return Some(ancestor);
            }
            current = self.item(ancestor).parent;
        }
        None
    }

    /// Outermost ancestor of the given type.
    pub fn find_last_parent_of_type(&self, id: ItemId, item_type: ItemType) -> Option<ItemId> {
        let mut found = None;
        let mut current = self.item(id).parent;
        while let Some(ancestor) = current {
            if self.item(ancestor).item_type == item_type {
                found = Some(ancestor);
            }
            current = self.item(ancestor).parent;
        }
        found
    }

    /// Deepest uncompressed node whose on-disk range contains `offset`.
    /// Children below compressed boundaries hold offsets into decompressed
    /// buffers and are never descended into.
    pub fn find_by_offset(&self, offset: usize) -> Option<ItemId> {
        let mut current = self.root();
        loop {
            let next = self.item(current).children.iter().copied().find(|&child| {
                !self.item(child).compressed
                    && self.offset(child) <= offset
                    && offset < self.offset(child) + self.full_size(child)
            });
            match next {
                Some(child) => current = child,
                None => break,
            }
        }
        if current == self.root() {
            return None;
        }
        Some(current)
    }

    /// Depth-first pre-order walk of the whole tree, root excluded.
    pub fn depth_first(&self) -> Vec<ItemId> {
        let mut order = Vec::with_capacity(self.items.len() - 1);
        let mut stack: Vec<ItemId> = self.item(self.root()).children.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            order.push(id);
            stack.extend(self.item(id).children.iter().rev());
        }
        order
    }
}

impl Default for TreeModel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn add_plain(
        model: &mut TreeModel,
        offset: usize,
        item_type: ItemType,
        size: usize,
        parent: Option<ItemId>,
    ) -> ItemId {
        model.add_item(
            offset,
            item_type,
            Subtype::None,
            "item",
            "",
            "",
            Bytes::new(),
            Bytes::from(vec![0u8; size]),
            false,
            ParsingData::None,
            parent,
            InsertMode::Append,
        )
    }

    #[test]
    fn insert_modes_order_siblings() {
        let mut model = TreeModel::new();
        let parent = add_plain(&mut model, 0, ItemType::Volume, 0x100, None);
        let b = add_plain(&mut model, 0x10, ItemType::File, 0x10, Some(parent));
        let d = add_plain(&mut model, 0x30, ItemType::File, 0x10, Some(parent));
        let a = model.add_item(
            0x00,
            ItemType::File,
            Subtype::None,
            "a",
            "",
            "",
            Bytes::new(),
            Bytes::new(),
            false,
            ParsingData::None,
            Some(parent),
            InsertMode::Prepend,
        );
        let c = model.add_item(
            0x20,
            ItemType::File,
            Subtype::None,
            "c",
            "",
            "",
            Bytes::new(),
            Bytes::new(),
            false,
            ParsingData::None,
            Some(parent),
            InsertMode::After(b),
        );
        assert_eq!(model.children(parent), &[a, b, c, d]);
        assert_eq!(model.row(c), 2);
        assert_eq!(model.parent(c), Some(parent));
    }

    #[test]
    fn fixed_propagates_to_ancestors() {
        let mut model = TreeModel::new();
        let volume = add_plain(&mut model, 0, ItemType::Volume, 0x1000, None);
        let file = add_plain(&mut model, 0x48, ItemType::File, 0x100, Some(volume));
        let section = add_plain(&mut model, 0x60, ItemType::Section, 0x40, Some(file));
        model.set_fixed(section, true);
        assert!(model.fixed(section));
        assert!(model.fixed(file));
        assert!(model.fixed(volume));
    }

    #[test]
    fn fixed_stops_at_compressed_boundary() {
        let mut model = TreeModel::new();
        let volume = add_plain(&mut model, 0, ItemType::Volume, 0x1000, None);
        let file = add_plain(&mut model, 0x48, ItemType::File, 0x100, Some(volume));
        let encapsulation = add_plain(&mut model, 0x60, ItemType::Section, 0x40, Some(file));
        let inner = add_plain(&mut model, 0, ItemType::Section, 0x20, Some(encapsulation));
        model.set_compressed(inner, true);
        model.set_fixed(inner, true);
        // The boundary node takes its parent's flag instead of forcing it.
        assert!(!model.fixed(inner));
        assert!(!model.fixed(encapsulation));
        assert!(!model.fixed(volume));
    }

    #[test]
    fn children_of_compressed_parents_are_compressed() {
        let mut model = TreeModel::new();
        let section = add_plain(&mut model, 0, ItemType::Section, 0x40, None);
        model.set_compressed(section, true);
        let child = add_plain(&mut model, 0, ItemType::Section, 0x10, Some(section));
        assert!(model.compressed(child));
    }

    #[test]
    fn ancestor_queries() {
        let mut model = TreeModel::new();
        let outer = add_plain(&mut model, 0, ItemType::Volume, 0x4000, None);
        let file = add_plain(&mut model, 0x48, ItemType::File, 0x2000, Some(outer));
        let section = add_plain(&mut model, 0x50, ItemType::Section, 0x1f00, Some(file));
        let inner = add_plain(&mut model, 0x60, ItemType::Volume, 0x1000, Some(section));
        let inner_file = add_plain(&mut model, 0xA8, ItemType::File, 0x100, Some(inner));
        assert_eq!(model.find_parent_of_type(inner_file, ItemType::Volume), Some(inner));
        assert_eq!(model.find_last_parent_of_type(inner_file, ItemType::Volume), Some(outer));
        assert_eq!(model.find_parent_of_type(outer, ItemType::Volume), None);
    }

    #[test]
    fn find_by_offset_picks_deepest_uncompressed() {
        let mut model = TreeModel::new();
        let volume = model.add_item(
            0,
            ItemType::Volume,
            Subtype::None,
            "v",
            "",
            "",
            Bytes::from(vec![0u8; 0x48]),
            Bytes::from(vec![0u8; 0xB8]),
            false,
            ParsingData::None,
            None,
            InsertMode::Append,
        );
        let file = model.add_item(
            0x48,
            ItemType::File,
            Subtype::None,
            "f",
            "",
            "",
            Bytes::from(vec![0u8; 0x18]),
            Bytes::from(vec![0u8; 0x28]),
            false,
            ParsingData::None,
            Some(volume),
            InsertMode::Append,
        );
        assert_eq!(model.find_by_offset(0x50), Some(file));
        assert_eq!(model.find_by_offset(0x10), Some(volume));
        assert_eq!(model.find_by_offset(0x1000), None);
    }

    #[test]
    fn depth_first_is_preorder() {
        let mut model = TreeModel::new();
        let a = add_plain(&mut model, 0, ItemType::Volume, 0x100, None);
        let a1 = add_plain(&mut model, 0x10, ItemType::File, 0x10, Some(a));
        let a2 = add_plain(&mut model, 0x20, ItemType::File, 0x10, Some(a));
        let b = add_plain(&mut model, 0x100, ItemType::Padding, 0x100, None);
        assert_eq!(model.depth_first(), vec![a, a1, a2, b]);
    }
}
