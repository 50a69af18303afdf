use crate::composite;
use crate::scalar::ScalarCodec;
use bytes::{Bytes, BytesMut};
use metrics::counter;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use strata_core::{StrataError, TypeId, Value};
use strata_protocol::buffer::{begin_element, finish_element, put_null_element, ReadBuffer};
use strata_protocol::descriptor::{DescriptorKind, DescriptorTable};
use tracing::{debug, trace};

/// Composite descriptors nested deeper than this are rejected.
pub const MAX_NESTING_DEPTH: usize = 128;

static NEXT_REGISTRY_ID: AtomicU64 = AtomicU64::new(1);

/// Handle to a codec owned by a [`CodecRegistry`].
///
/// The registry id ties a handle to the registry that built it, and the
/// epoch to one generation of that registry; after
/// [`CodecRegistry::invalidate`] every older handle is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodecRef {
    registry: u64,
    index: u32,
    epoch: u32,
}

impl CodecRef {
    pub fn registry_id(self) -> u64 {
        self.registry
    }

    pub fn index(self) -> usize {
        self.index as usize
    }

    pub fn epoch(self) -> u32 {
        self.epoch
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldCodec {
    pub name: String,
    pub codec: CodecRef,
    pub implicit: bool,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecKind {
    /// Commands that return nothing or take no arguments.
    Null,
    Scalar(ScalarCodec),
    Tuple(Vec<CodecRef>),
    Record(Vec<FieldCodec>),
    Array(CodecRef),
    Set(CodecRef),
    Range(CodecRef),
    Enumeration(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecNode {
    pub type_id: TypeId,
    pub kind: CodecKind,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecodeOptions {
    /// Keep fields the server flagged implicit (ids, type names).
    pub include_implicit: bool,
}

/// Per-connection cache of codecs keyed by server type id.
#[derive(Debug)]
pub struct CodecRegistry {
    id: u64,
    nodes: Vec<CodecNode>,
    by_id: HashMap<TypeId, CodecRef>,
    epoch: u32,
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self {
            id: NEXT_REGISTRY_ID.fetch_add(1, Ordering::Relaxed),
            nodes: Vec::new(),
            by_id: HashMap::new(),
            epoch: 0,
        }
    }
}

impl CodecRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, type_id: &TypeId) -> bool {
        self.by_id.contains_key(type_id)
    }

    pub fn resolve(&self, type_id: &TypeId) -> Option<CodecRef> {
        self.by_id.get(type_id).copied()
    }

    pub fn is_current(&self, codec: CodecRef) -> bool {
        codec.registry == self.id && codec.epoch == self.epoch && codec.index() < self.nodes.len()
    }

    /// Returns the codec for `type_id`, building it and any missing children
    /// from `table` on first use. A failed build leaves the registry untouched.
    pub fn get_or_build(
        &mut self,
        type_id: TypeId,
        table: &DescriptorTable,
    ) -> Result<CodecRef, StrataError> {
        if let Some(found) = self.resolve(&type_id) {
            counter!("strata_codec_cache_hit_total").increment(1);
            return Ok(found);
        }
        counter!("strata_codec_cache_miss_total").increment(1);

        let (root, nodes, ids) = {
            let mut staging = Staging {
                registry: self,
                table,
                nodes: Vec::new(),
                ids: HashMap::new(),
                building: HashSet::new(),
            };
            let root = staging.build(type_id)?;
            (root, staging.nodes, staging.ids)
        };
        debug!(%type_id, built = nodes.len(), "codecs built");
        self.nodes.extend(nodes);
        self.by_id.extend(ids);
        Ok(root)
    }

    /// Drops every codec and starts a new epoch.
    pub fn invalidate(&mut self) {
        debug!(dropped = self.nodes.len(), epoch = self.epoch, "codec registry invalidated");
        self.nodes.clear();
        self.by_id.clear();
        self.epoch = self.epoch.wrapping_add(1);
    }

    pub fn lookup(&self, codec: CodecRef) -> Result<&CodecNode, StrataError> {
        if codec.registry != self.id {
            return Err(StrataError::state(format!(
                "codec from registry {} used with registry {}",
                codec.registry, self.id
            )));
        }
        if codec.epoch != self.epoch {
            return Err(StrataError::state(format!(
                "codec from epoch {} used after invalidation (now {})",
                codec.epoch, self.epoch
            )));
        }
        self.nodes
            .get(codec.index())
            .ok_or_else(|| StrataError::state(format!("no codec at index {}", codec.index)))
    }

    /// Decodes a complete value payload, which must be consumed exactly.
    pub fn decode(
        &self,
        codec: CodecRef,
        payload: Bytes,
        options: DecodeOptions,
    ) -> Result<Value, StrataError> {
        let node = self.lookup(codec)?;
        trace!(type_id = %node.type_id, len = payload.len(), "decode");
        let mut buf = ReadBuffer::for_value(payload);
        let value = match &node.kind {
            CodecKind::Null => {
                if !buf.is_empty() {
                    return Err(StrataError::codec(format!(
                        "{} bytes for a command without output",
                        buf.remaining()
                    )));
                }
                Value::Nothing
            }
            CodecKind::Scalar(scalar) => scalar.decode(buf.take_rest())?,
            CodecKind::Enumeration(labels) => composite::decode_enum(labels, buf.take_rest())?,
            CodecKind::Tuple(elements) => composite::decode_tuple(self, elements, &mut buf, options)?,
            CodecKind::Record(fields) => composite::decode_record(self, fields, &mut buf, options)?,
            CodecKind::Array(element) => {
                Value::Array(composite::decode_array(self, *element, &mut buf, options)?)
            }
            CodecKind::Set(element) => {
                Value::Set(composite::decode_array(self, *element, &mut buf, options)?)
            }
            CodecKind::Range(element) => composite::decode_range(self, *element, &mut buf, options)?,
        };
        buf.finish()?;
        Ok(value)
    }

    /// Decodes one framed element; NULL becomes [`Value::Nothing`].
    pub fn decode_element(
        &self,
        codec: CodecRef,
        element: Option<Bytes>,
        options: DecodeOptions,
    ) -> Result<Value, StrataError> {
        match element {
            Some(payload) => self.decode(codec, payload, options),
            None => Ok(Value::Nothing),
        }
    }

    /// Appends the payload of `value` without a length prefix.
    pub fn encode(
        &self,
        codec: CodecRef,
        value: &Value,
        buf: &mut BytesMut,
    ) -> Result<(), StrataError> {
        let node = self.lookup(codec)?;
        match &node.kind {
            CodecKind::Null => match value {
                Value::Nothing => Ok(()),
                other => Err(StrataError::codec(format!(
                    "command takes no arguments, got {}",
                    other.kind()
                ))),
            },
            CodecKind::Scalar(scalar) => scalar.encode(buf, value),
            CodecKind::Tuple(elements) => composite::encode_tuple(self, elements, value, buf),
            CodecKind::Record(fields) => composite::encode_record(self, fields, value, buf),
            CodecKind::Array(element) | CodecKind::Set(element) => {
                composite::encode_array(self, *element, value, buf)
            }
            CodecKind::Range(element) => composite::encode_range(self, *element, value, buf),
            CodecKind::Enumeration(labels) => composite::encode_enum(labels, value, buf),
        }
    }

    /// Writes `value` as a length-prefixed element, or NULL for
    /// [`Value::Nothing`].
    pub fn encode_element(
        &self,
        codec: CodecRef,
        value: &Value,
        buf: &mut BytesMut,
    ) -> Result<(), StrataError> {
        if value.is_nothing() {
            put_null_element(buf);
            return Ok(());
        }
        let at = begin_element(buf);
        self.encode(codec, value, buf)?;
        finish_element(buf, at)
    }

    /// Encodes command arguments with the input codec of a prepared command.
    pub fn encode_arguments(&self, codec: CodecRef, args: &Value) -> Result<Bytes, StrataError> {
        let mut buf = BytesMut::new();
        self.encode(codec, args, &mut buf)?;
        Ok(buf.freeze())
    }
}

/// Codecs built during one `get_or_build` call, committed only on success.
struct Staging<'a> {
    registry: &'a CodecRegistry,
    table: &'a DescriptorTable,
    nodes: Vec<CodecNode>,
    ids: HashMap<TypeId, CodecRef>,
    building: HashSet<TypeId>,
}

impl Staging<'_> {
    fn known(&self, type_id: &TypeId) -> Option<CodecRef> {
        self.registry
            .by_id
            .get(type_id)
            .or_else(|| self.ids.get(type_id))
            .copied()
    }

    fn kind_of(&self, codec: CodecRef) -> Option<&CodecKind> {
        let committed = self.registry.nodes.len();
        if codec.index() < committed {
            self.registry.nodes.get(codec.index()).map(|n| &n.kind)
        } else {
            self.nodes.get(codec.index() - committed).map(|n| &n.kind)
        }
    }

    fn push(&mut self, type_id: TypeId, kind: CodecKind) -> Result<CodecRef, StrataError> {
        let index = self.registry.nodes.len() + self.nodes.len();
        let index = u32::try_from(index)
            .map_err(|_| StrataError::descriptor("codec registry is full"))?;
        let codec = CodecRef {
            registry: self.registry.id,
            index,
            epoch: self.registry.epoch,
        };
        self.nodes.push(CodecNode { type_id, kind });
        self.ids.insert(type_id, codec);
        Ok(codec)
    }

    fn build(&mut self, type_id: TypeId) -> Result<CodecRef, StrataError> {
        if let Some(found) = self.known(&type_id) {
            return Ok(found);
        }
        if type_id == TypeId::NULL {
            return self.push(type_id, CodecKind::Null);
        }
        if type_id == TypeId::EMPTY_TUPLE {
            return self.push(type_id, CodecKind::Tuple(Vec::new()));
        }
        let Some(position) = self.table.position(&type_id) else {
            return match ScalarCodec::from_type_id(&type_id) {
                Some(scalar) => self.push(type_id, CodecKind::Scalar(scalar)),
                None => Err(StrataError::descriptor(format!(
                    "type {type_id} is not described"
                ))),
            };
        };
        if self.building.len() >= MAX_NESTING_DEPTH {
            return Err(StrataError::descriptor(format!(
                "type {type_id} is nested more than {MAX_NESTING_DEPTH} levels deep"
            )));
        }
        if !self.building.insert(type_id) {
            return Err(StrataError::descriptor(format!(
                "type {type_id} refers to itself"
            )));
        }
        let built = self.build_entry(type_id, position);
        self.building.remove(&type_id);
        built
    }

    fn child(&mut self, position: usize) -> Result<CodecRef, StrataError> {
        let type_id = self
            .table
            .get(position)
            .map(|node| node.id)
            .ok_or_else(|| {
                StrataError::descriptor(format!("no descriptor at position {position}"))
            })?;
        self.build(type_id)
    }

    fn build_entry(&mut self, type_id: TypeId, position: usize) -> Result<CodecRef, StrataError> {
        let table = self.table;
        let node = table.get(position).ok_or_else(|| {
            StrataError::descriptor(format!("no descriptor at position {position}"))
        })?;
        let kind = match &node.kind {
            DescriptorKind::BaseScalar => {
                let scalar = ScalarCodec::from_type_id(&type_id).ok_or_else(|| {
                    StrataError::descriptor(format!("unsupported base scalar {type_id}"))
                })?;
                CodecKind::Scalar(scalar)
            }
            DescriptorKind::NamedScalar { name, base } => {
                let base = self.child(*base)?;
                if !matches!(
                    self.kind_of(base),
                    Some(CodecKind::Scalar(_) | CodecKind::Enumeration(_))
                ) {
                    return Err(StrataError::descriptor(format!(
                        "scalar {name} is based on a non-scalar type"
                    )));
                }
                // Shares the wire format of its base.
                self.ids.insert(type_id, base);
                return Ok(base);
            }
            DescriptorKind::Set { element } => CodecKind::Set(self.child(*element)?),
            DescriptorKind::Array { element, .. } => CodecKind::Array(self.child(*element)?),
            DescriptorKind::Range { element } => CodecKind::Range(self.child(*element)?),
            DescriptorKind::Tuple { elements } => {
                let mut children = Vec::with_capacity(elements.len());
                for element in elements {
                    children.push(self.child(*element)?);
                }
                CodecKind::Tuple(children)
            }
            DescriptorKind::LabeledTuple { fields, .. } => {
                let mut children = Vec::with_capacity(fields.len());
                for field in fields {
                    children.push(FieldCodec {
                        name: field.name.clone(),
                        codec: self.child(field.type_pos)?,
                        implicit: field.flags.is_implicit(),
                        required: field.is_required(),
                    });
                }
                CodecKind::Record(children)
            }
            DescriptorKind::Enumeration { labels } => CodecKind::Enumeration(labels.clone()),
        };
        self.push(type_id, kind)
    }
}
