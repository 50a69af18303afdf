//! Type descriptors sent by the server in CommandDataDescription.
//!
//! A descriptor blob is a flat sequence of entries; composite entries point
//! at their children by position in the same blob, and only backwards.

use crate::buffer::{put_string, put_uuid, ReadBuffer};
use crate::messages::Cardinality;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashMap;
use strata_core::{StrataError, TypeId};

pub const DESC_SET: u8 = 0;
pub const DESC_OBJECT_SHAPE: u8 = 1;
pub const DESC_BASE_SCALAR: u8 = 2;
pub const DESC_SCALAR: u8 = 3;
pub const DESC_TUPLE: u8 = 4;
pub const DESC_NAMED_TUPLE: u8 = 5;
pub const DESC_ARRAY: u8 = 6;
pub const DESC_ENUMERATION: u8 = 7;
pub const DESC_RANGE: u8 = 9;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldFlags(pub u32);

impl FieldFlags {
    /// Present on the wire but hidden from callers by default.
    pub const IMPLICIT: FieldFlags = FieldFlags(1 << 0);
    pub const LINK_PROPERTY: FieldFlags = FieldFlags(1 << 1);
    pub const LINK: FieldFlags = FieldFlags(1 << 2);
    /// Part of the identity key; informational only.
    pub const IDENTITY: FieldFlags = FieldFlags(1 << 3);
    pub const NONE: FieldFlags = FieldFlags(0);

    pub fn contains(self, other: FieldFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_implicit(self) -> bool {
        self.contains(FieldFlags::IMPLICIT)
    }
}

impl std::ops::BitOr for FieldFlags {
    type Output = FieldFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        FieldFlags(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorField {
    pub name: String,
    pub flags: FieldFlags,
    pub cardinality: Cardinality,
    pub type_pos: usize,
}

impl DescriptorField {
    pub fn is_required(&self) -> bool {
        self.cardinality.is_required()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeOrigin {
    Object,
    NamedTuple,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DescriptorKind {
    Set { element: usize },
    LabeledTuple {
        origin: ShapeOrigin,
        fields: Vec<DescriptorField>,
    },
    BaseScalar,
    /// A user-visible scalar that shares the wire format of `base`.
    NamedScalar { name: String, base: usize },
    Tuple { elements: Vec<usize> },
    /// `dimensions` is presentation metadata; -1 means unbounded.
    Array { element: usize, dimensions: Vec<i32> },
    Enumeration { labels: Vec<String> },
    Range { element: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeDescriptorNode {
    pub id: TypeId,
    pub kind: DescriptorKind,
}

impl TypeDescriptorNode {
    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            DescriptorKind::Set { .. } => "set",
            DescriptorKind::LabeledTuple { .. } => "labeled-tuple",
            DescriptorKind::BaseScalar => "scalar",
            DescriptorKind::NamedScalar { .. } => "named-scalar",
            DescriptorKind::Tuple { .. } => "tuple",
            DescriptorKind::Array { .. } => "array",
            DescriptorKind::Enumeration { .. } => "enumeration",
            DescriptorKind::Range { .. } => "range",
        }
    }

    /// Positions of the entries this node is built from.
    pub fn children(&self) -> Vec<usize> {
        match &self.kind {
            DescriptorKind::Set { element }
            | DescriptorKind::Array { element, .. }
            | DescriptorKind::Range { element } => vec![*element],
            DescriptorKind::NamedScalar { base, .. } => vec![*base],
            DescriptorKind::Tuple { elements } => elements.clone(),
            DescriptorKind::LabeledTuple { fields, .. } => {
                fields.iter().map(|f| f.type_pos).collect()
            }
            DescriptorKind::BaseScalar | DescriptorKind::Enumeration { .. } => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DescriptorTable {
    nodes: Vec<TypeDescriptorNode>,
    positions: HashMap<TypeId, usize>,
}

impl DescriptorTable {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn parse(blob: Bytes) -> Result<Self, StrataError> {
        let mut buf = ReadBuffer::for_descriptor(blob);
        let mut table = Self::default();
        while !buf.is_empty() {
            let position = table.nodes.len();
            let tag = buf.get_u8()?;
            let id = buf.get_uuid()?;
            let kind = parse_kind(&mut buf, tag, position)?;
            if table.positions.insert(id, position).is_some() {
                return Err(StrataError::descriptor(format!(
                    "type {id} described twice"
                )));
            }
            table.nodes.push(TypeDescriptorNode { id, kind });
        }
        Ok(table)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[TypeDescriptorNode] {
        &self.nodes
    }

    pub fn get(&self, position: usize) -> Option<&TypeDescriptorNode> {
        self.nodes.get(position)
    }

    pub fn position(&self, id: &TypeId) -> Option<usize> {
        self.positions.get(id).copied()
    }

    pub fn find(&self, id: &TypeId) -> Option<&TypeDescriptorNode> {
        self.position(id).and_then(|pos| self.nodes.get(pos))
    }

    pub fn child_ids(&self, position: usize) -> Vec<TypeId> {
        self.nodes
            .get(position)
            .map(|node| {
                node.children()
                    .into_iter()
                    .filter_map(|child| self.nodes.get(child).map(|c| c.id))
                    .collect()
            })
            .unwrap_or_default()
    }
}

fn get_position(buf: &mut ReadBuffer, current: usize) -> Result<usize, StrataError> {
    let pos = buf.get_u16()? as usize;
    if pos >= current {
        return Err(StrataError::descriptor(format!(
            "entry {current} references position {pos}, which is not defined before it"
        )));
    }
    Ok(pos)
}

fn parse_kind(
    buf: &mut ReadBuffer,
    tag: u8,
    position: usize,
) -> Result<DescriptorKind, StrataError> {
    let kind = match tag {
        DESC_SET => DescriptorKind::Set {
            element: get_position(buf, position)?,
        },
        DESC_OBJECT_SHAPE => {
            let count = buf.get_u16()?;
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let flags = FieldFlags(buf.get_u32()?);
                let cardinality = Cardinality::from_wire(buf.get_u8()?).map_err(|_| {
                    StrataError::descriptor(format!("bad field cardinality in entry {position}"))
                })?;
                let name = buf.get_string()?;
                let type_pos = get_position(buf, position)?;
                fields.push(DescriptorField {
                    name,
                    flags,
                    cardinality,
                    type_pos,
                });
            }
            DescriptorKind::LabeledTuple {
                origin: ShapeOrigin::Object,
                fields,
            }
        }
        DESC_BASE_SCALAR => DescriptorKind::BaseScalar,
        DESC_SCALAR => DescriptorKind::NamedScalar {
            name: buf.get_string()?,
            base: get_position(buf, position)?,
        },
        DESC_TUPLE => {
            let count = buf.get_u16()?;
            let mut elements = Vec::with_capacity(count as usize);
            for _ in 0..count {
                elements.push(get_position(buf, position)?);
            }
            DescriptorKind::Tuple { elements }
        }
        DESC_NAMED_TUPLE => {
            let count = buf.get_u16()?;
            let mut fields = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let name = buf.get_string()?;
                let type_pos = get_position(buf, position)?;
                fields.push(DescriptorField {
                    name,
                    flags: FieldFlags::NONE,
                    cardinality: Cardinality::AtMostOne,
                    type_pos,
                });
            }
            DescriptorKind::LabeledTuple {
                origin: ShapeOrigin::NamedTuple,
                fields,
            }
        }
        DESC_ARRAY => {
            let element = get_position(buf, position)?;
            let ndims = buf.get_u16()?;
            let mut dimensions = Vec::with_capacity(ndims as usize);
            for _ in 0..ndims {
                dimensions.push(buf.get_i32()?);
            }
            DescriptorKind::Array {
                element,
                dimensions,
            }
        }
        DESC_ENUMERATION => {
            let count = buf.get_u16()?;
            let mut labels = Vec::with_capacity(count as usize);
            for _ in 0..count {
                labels.push(buf.get_string()?);
            }
            DescriptorKind::Enumeration { labels }
        }
        DESC_RANGE => DescriptorKind::Range {
            element: get_position(buf, position)?,
        },
        other => {
            return Err(StrataError::descriptor(format!(
                "unknown descriptor tag 0x{other:02x} at entry {position}"
            )))
        }
    };
    Ok(kind)
}

/// Element of an object shape being written by [`DescriptorWriter`].
#[derive(Debug, Clone, Copy)]
pub struct ShapeElement<'a> {
    pub name: &'a str,
    pub flags: FieldFlags,
    pub cardinality: Cardinality,
    pub type_pos: u16,
}

impl<'a> ShapeElement<'a> {
    pub fn new(name: &'a str, type_pos: u16) -> Self {
        Self {
            name,
            flags: FieldFlags::NONE,
            cardinality: Cardinality::AtMostOne,
            type_pos,
        }
    }

    pub fn required(mut self) -> Self {
        self.cardinality = Cardinality::One;
        self
    }

    pub fn implicit(mut self) -> Self {
        self.flags = self.flags | FieldFlags::IMPLICIT;
        self
    }
}

/// Serializes descriptor blobs, the server's side of [`DescriptorTable::parse`].
/// Every method returns the position of the entry it wrote.
#[derive(Debug, Default)]
pub struct DescriptorWriter {
    buf: BytesMut,
    count: u16,
}

impl DescriptorWriter {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, tag: u8, id: TypeId) -> u16 {
        self.buf.put_u8(tag);
        put_uuid(&mut self.buf, &id);
        let pos = self.count;
        self.count += 1;
        pos
    }

    pub fn base_scalar(&mut self, id: TypeId) -> u16 {
        self.entry(DESC_BASE_SCALAR, id)
    }

    pub fn named_scalar(&mut self, id: TypeId, name: &str, base: u16) -> u16 {
        let pos = self.entry(DESC_SCALAR, id);
        put_string(&mut self.buf, name);
        self.buf.put_u16(base);
        pos
    }

    pub fn set(&mut self, id: TypeId, element: u16) -> u16 {
        let pos = self.entry(DESC_SET, id);
        self.buf.put_u16(element);
        pos
    }

    pub fn array(&mut self, id: TypeId, element: u16, dimensions: &[i32]) -> u16 {
        let pos = self.entry(DESC_ARRAY, id);
        self.buf.put_u16(element);
        self.buf.put_u16(dimensions.len() as u16);
        for dim in dimensions {
            self.buf.put_i32(*dim);
        }
        pos
    }

    pub fn tuple(&mut self, id: TypeId, elements: &[u16]) -> u16 {
        let pos = self.entry(DESC_TUPLE, id);
        self.buf.put_u16(elements.len() as u16);
        for element in elements {
            self.buf.put_u16(*element);
        }
        pos
    }

    pub fn object_shape(&mut self, id: TypeId, elements: &[ShapeElement<'_>]) -> u16 {
        let pos = self.entry(DESC_OBJECT_SHAPE, id);
        self.buf.put_u16(elements.len() as u16);
        for element in elements {
            self.buf.put_u32(element.flags.0);
            self.buf.put_u8(element.cardinality.wire_byte());
            put_string(&mut self.buf, element.name);
            self.buf.put_u16(element.type_pos);
        }
        pos
    }

    pub fn named_tuple(&mut self, id: TypeId, elements: &[(&str, u16)]) -> u16 {
        let pos = self.entry(DESC_NAMED_TUPLE, id);
        self.buf.put_u16(elements.len() as u16);
        for (name, type_pos) in elements {
            put_string(&mut self.buf, name);
            self.buf.put_u16(*type_pos);
        }
        pos
    }

    pub fn enumeration(&mut self, id: TypeId, labels: &[&str]) -> u16 {
        let pos = self.entry(DESC_ENUMERATION, id);
        self.buf.put_u16(labels.len() as u16);
        for label in labels {
            put_string(&mut self.buf, label);
        }
        pos
    }

    pub fn range(&mut self, id: TypeId, element: u16) -> u16 {
        let pos = self.entry(DESC_RANGE, id);
        self.buf.put_u16(element);
        pos
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}
