//! Type descriptors: the wire layout of every value a message can carry.
//!
//! Descriptors are immutable once built and shared through `Arc`, so one spec
//! serves every message of its type. Struct field offsets are fixed when the
//! spec is built; nothing is recomputed per message.
//!
//! Sizes returned by the `*_size` functions are what the encoder will consume
//! from the message arena, every allocation rounded up to 8 bytes.

use std::collections::{HashMap, HashSet};
use std::collections::hash_map::Entry;
use std::sync::Arc;

use crate::error::{EncodeError, SpecError};
use crate::value::{StructValue, UnionValue, Value};

pub const STRUCT_HEADER_SIZE: usize = 8;
pub const ARRAY_HEADER_SIZE: usize = 8;
pub const UNION_DATA_SIZE: usize = 16;
pub const MAP_DATA_SIZE: usize = 24;
pub const INVALID_HANDLE_INDEX: u32 = 0xFFFF_FFFF;

/// Round `size` up to the next multiple of 8.
pub fn align(size: usize) -> usize {
    (size + 7) & !7
}

#[derive(Debug, Clone)]
pub enum Type {
    Bool,
    Int8,
    Uint8,
    Int16,
    Uint16,
    Int32,
    Uint32,
    Int64,
    Uint64,
    Float,
    Double,
    /// Encoded as a signed 32-bit integer.
    Enum,
    Handle,
    String,
    Array(Arc<ArraySpec>),
    Map(Arc<MapSpec>),
    Struct(Arc<StructSpec>),
    Union(Arc<UnionSpec>),
    /// Remote end of an interface; the name is informational.
    InterfaceProxy(Arc<str>),
    InterfaceRequest(Arc<str>),
}

impl Type {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Type::Bool => "bool",
            Type::Int8 => "int8",
            Type::Uint8 => "uint8",
            Type::Int16 => "int16",
            Type::Uint16 => "uint16",
            Type::Int32 => "int32",
            Type::Uint32 => "uint32",
            Type::Int64 => "int64",
            Type::Uint64 => "uint64",
            Type::Float => "float",
            Type::Double => "double",
            Type::Enum => "enum",
            Type::Handle => "handle",
            Type::String => "string",
            Type::Array(_) => "array",
            Type::Map(_) => "map",
            Type::Struct(_) => "struct",
            Type::Union(_) => "union",
            Type::InterfaceProxy(_) => "interface proxy",
            Type::InterfaceRequest(_) => "interface request",
        }
    }

    /// Fixed-width scalars, which have no null representation.
    pub fn is_primitive(&self) -> bool {
        matches!(
            self,
            Type::Bool
                | Type::Int8
                | Type::Uint8
                | Type::Int16
                | Type::Uint16
                | Type::Int32
                | Type::Uint32
                | Type::Int64
                | Type::Uint64
                | Type::Float
                | Type::Double
                | Type::Enum
        )
    }

    pub fn is_union(&self) -> bool {
        matches!(self, Type::Union(_))
    }

    /// Bytes occupied inside a struct's packed region or a union's data slot.
    pub fn inline_size(&self, nullable: bool) -> usize {
        match self {
            Type::Bool | Type::Int8 | Type::Uint8 => 1,
            Type::Int16 | Type::Uint16 => 2,
            Type::Int32 | Type::Uint32 | Type::Float | Type::Enum => 4,
            Type::Handle | Type::InterfaceRequest(_) => 4,
            Type::Int64 | Type::Uint64 | Type::Double => 8,
            Type::String | Type::Array(_) | Type::Map(_) | Type::Struct(_) => 8,
            Type::InterfaceProxy(_) => 8,
            Type::Union(_) if nullable => 8,
            Type::Union(_) => UNION_DATA_SIZE,
        }
    }

    /// Bytes per array element. Bool arrays are bit-packed and size separately.
    pub fn array_element_size(&self, nullable: bool) -> usize {
        self.inline_size(nullable)
    }

    /// Bytes this value needs outside its inline slot, already aligned.
    ///
    /// Null values and inline-only types need nothing. Sizing also checks
    /// every shape the encoder relies on, so a value that sizes cleanly
    /// encodes cleanly.
    pub fn payload_size(&self, value: &Value, nullable: bool) -> Result<usize, EncodeError> {
        if value.is_null() {
            return Ok(0);
        }
        match (self, value) {
            (Type::String, Value::String(s)) => Ok(align(ARRAY_HEADER_SIZE + s.len())),
            (Type::Array(spec), Value::Array(items)) => spec.total_size(items.iter()),
            (Type::Map(spec), Value::Map(entries)) => spec.total_size(entries),
            (Type::Struct(spec), Value::Struct(s)) => spec.total_size(s),
            (Type::Union(spec), Value::Union(u)) => spec.total_size(u, nullable),
            (ty, value) if ty.accepts_inline(value) => Ok(0),
            (ty, value) => Err(ty.mismatch(value)),
        }
    }

    /// Scalars and handles, written straight into their slot.
    fn accepts_inline(&self, value: &Value) -> bool {
        matches!(
            (self, value),
            (Type::Bool, Value::Bool(_))
                | (Type::Int8, Value::Int8(_))
                | (Type::Uint8, Value::Uint8(_))
                | (Type::Int16, Value::Int16(_))
                | (Type::Uint16, Value::Uint16(_))
                | (Type::Int32 | Type::Enum, Value::Int32(_))
                | (Type::Uint32, Value::Uint32(_))
                | (Type::Int64, Value::Int64(_))
                | (Type::Uint64, Value::Uint64(_))
                | (Type::Float, Value::Float(_))
                | (Type::Double, Value::Double(_))
                | (
                    Type::Handle | Type::InterfaceRequest(_) | Type::InterfaceProxy(_),
                    Value::Handle(_)
                )
        )
    }

    pub(crate) fn mismatch(&self, value: &Value) -> EncodeError {
        EncodeError::TypeMismatch {
            expected: self.kind_name(),
            found: value.kind_name(),
        }
    }

    fn valid_map_key(&self) -> bool {
        self.is_primitive() || matches!(self, Type::String)
    }
}

// ----------------------------------------------------------------------------
// Arrays and maps
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ArraySpec {
    pub element: Type,
    pub element_nullable: bool,
}

impl ArraySpec {
    pub fn new(element: Type, element_nullable: bool) -> Result<Arc<Self>, SpecError> {
        if element_nullable && element.is_primitive() {
            return Err(SpecError::NullablePrimitive {
                spec: "array".into(),
                field: "element".into(),
                kind: element.kind_name(),
            });
        }
        Ok(Arc::new(Self {
            element,
            element_nullable,
        }))
    }

    /// Header plus element data for `len` elements, unaligned.
    pub fn inline_size(&self, len: usize) -> usize {
        match self.element {
            Type::Bool => ARRAY_HEADER_SIZE + ((len + 7) >> 3),
            _ => ARRAY_HEADER_SIZE + len * self.element.array_element_size(self.element_nullable),
        }
    }

    pub fn total_size<'a>(
        &self,
        items: impl ExactSizeIterator<Item = &'a Value>,
    ) -> Result<usize, EncodeError> {
        let mut size = align(self.inline_size(items.len()));
        for item in items {
            if item.is_null() && !self.element_nullable {
                return Err(EncodeError::NullArrayElement);
            }
            size += self.element.payload_size(item, self.element_nullable)?;
        }
        Ok(size)
    }
}

/// Maps are two parallel arrays, keys and values, behind a 24-byte header.
#[derive(Debug, Clone)]
pub struct MapSpec {
    pub keys: Arc<ArraySpec>,
    pub values: Arc<ArraySpec>,
}

impl MapSpec {
    pub fn new(key: Type, value: Type, value_nullable: bool) -> Result<Arc<Self>, SpecError> {
        if !key.valid_map_key() {
            return Err(SpecError::InvalidMapKey {
                kind: key.kind_name(),
            });
        }
        Ok(Arc::new(Self {
            keys: ArraySpec::new(key, false)?,
            values: ArraySpec::new(value, value_nullable)?,
        }))
    }

    pub fn key_type(&self) -> &Type {
        &self.keys.element
    }

    pub fn value_type(&self) -> &Type {
        &self.values.element
    }

    pub fn total_size(&self, entries: &[(Value, Value)]) -> Result<usize, EncodeError> {
        Ok(MAP_DATA_SIZE
            + self.keys.total_size(entries.iter().map(|(k, _)| k))?
            + self.values.total_size(entries.iter().map(|(_, v)| v))?)
    }
}

// ----------------------------------------------------------------------------
// Structs
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct StructField {
    pub name: String,
    pub packed_offset: usize,
    /// Bit within the byte at `packed_offset`; only bools use it.
    pub packed_bit_offset: u8,
    pub ty: Type,
    pub nullable: bool,
}

#[derive(Debug)]
pub struct StructSpec {
    name: String,
    packed_size: usize,
    fields: Vec<StructField>,
}

impl StructSpec {
    pub fn builder(name: impl Into<String>, packed_size: usize) -> StructSpecBuilder {
        StructSpecBuilder {
            name: name.into(),
            packed_size,
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn packed_size(&self) -> usize {
        self.packed_size
    }

    pub fn fields(&self) -> &[StructField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&StructField> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Value written to the struct header's size word.
    pub fn header_size(&self) -> usize {
        STRUCT_HEADER_SIZE + self.packed_size
    }

    /// The struct's own region plus everything its fields point at.
    pub fn total_size(&self, value: &StructValue) -> Result<usize, EncodeError> {
        if let Some(unknown) = value.field_names().find(|name| self.field(name).is_none()) {
            return Err(EncodeError::UnknownField {
                spec: self.name.clone(),
                field: unknown.to_owned(),
            });
        }

        let mut size = align(self.header_size());
        for field in &self.fields {
            match value.get(&field.name) {
                Some(v) if !v.is_null() => size += field.ty.payload_size(v, field.nullable)?,
                _ if field.nullable => {}
                _ => {
                    return Err(EncodeError::MissingField {
                        spec: self.name.clone(),
                        field: field.name.clone(),
                    });
                }
            }
        }
        Ok(size)
    }
}

pub struct StructSpecBuilder {
    name: String,
    packed_size: usize,
    fields: Vec<StructField>,
}

impl StructSpecBuilder {
    pub fn field(
        mut self,
        name: impl Into<String>,
        packed_offset: usize,
        packed_bit_offset: u8,
        ty: Type,
        nullable: bool,
    ) -> Self {
        self.fields.push(StructField {
            name: name.into(),
            packed_offset,
            packed_bit_offset,
            ty,
            nullable,
        });
        self
    }

    pub fn build(self) -> Result<Arc<StructSpec>, SpecError> {
        let mut seen = HashSet::new();
        for field in &self.fields {
            if !seen.insert(field.name.as_str()) {
                return Err(SpecError::DuplicateField {
                    spec: self.name.clone(),
                    field: field.name.clone(),
                });
            }
            if field.nullable && field.ty.is_primitive() {
                return Err(SpecError::NullablePrimitive {
                    spec: self.name.clone(),
                    field: field.name.clone(),
                    kind: field.ty.kind_name(),
                });
            }
            if field.packed_bit_offset > 7 {
                return Err(SpecError::InvalidBitOffset {
                    spec: self.name.clone(),
                    field: field.name.clone(),
                    bit_offset: field.packed_bit_offset,
                });
            }
            if field.packed_offset + field.ty.inline_size(field.nullable) > self.packed_size {
                return Err(SpecError::FieldOutOfBounds {
                    spec: self.name.clone(),
                    field: field.name.clone(),
                    packed_size: self.packed_size,
                });
            }
        }
        Ok(Arc::new(StructSpec {
            name: self.name,
            packed_size: self.packed_size,
            fields: self.fields,
        }))
    }
}

// ----------------------------------------------------------------------------
// Unions
// ----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct UnionField {
    pub name: String,
    pub ordinal: u32,
    pub ty: Type,
    pub nullable: bool,
}

impl UnionField {
    /// Union arms that are themselves unions are always stored indirectly.
    pub fn stored_nullable(&self) -> bool {
        self.nullable || self.ty.is_union()
    }
}

#[derive(Debug)]
pub struct UnionSpec {
    name: String,
    fields: Vec<UnionField>,
}

impl UnionSpec {
    pub fn builder(name: impl Into<String>) -> UnionSpecBuilder {
        UnionSpecBuilder {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[UnionField] {
        &self.fields
    }

    pub fn field_by_tag(&self, tag: &str) -> Option<&UnionField> {
        self.fields.iter().find(|f| f.name == tag)
    }

    pub fn field_by_ordinal(&self, ordinal: u32) -> Option<&UnionField> {
        self.fields.iter().find(|f| f.ordinal == ordinal)
    }

    pub(crate) fn resolve(&self, value: &UnionValue) -> Result<&UnionField, EncodeError> {
        self.field_by_tag(&value.tag)
            .ok_or_else(|| EncodeError::UnknownUnionTag {
                union: self.name.clone(),
                tag: value.tag.clone(),
            })
    }

    /// Out-of-line bytes for a union value; the 16-byte block counts only when
    /// the union sits in a nullable slot.
    pub fn total_size(&self, value: &UnionValue, nullable: bool) -> Result<usize, EncodeError> {
        let field = self.resolve(value)?;
        if value.value.is_null() && !field.nullable {
            return Err(EncodeError::MissingField {
                spec: self.name.clone(),
                field: field.name.clone(),
            });
        }
        let own = if nullable { UNION_DATA_SIZE } else { 0 };
        Ok(own + field.ty.payload_size(&value.value, field.stored_nullable())?)
    }
}

pub struct UnionSpecBuilder {
    name: String,
    fields: Vec<UnionField>,
}

impl UnionSpecBuilder {
    pub fn field(mut self, name: impl Into<String>, ordinal: u32, ty: Type, nullable: bool) -> Self {
        self.fields.push(UnionField {
            name: name.into(),
            ordinal,
            ty,
            nullable,
        });
        self
    }

    pub fn build(self) -> Result<Arc<UnionSpec>, SpecError> {
        let mut names = HashSet::new();
        let mut ordinals = HashSet::new();
        for field in &self.fields {
            if !names.insert(field.name.as_str()) {
                return Err(SpecError::DuplicateField {
                    spec: self.name.clone(),
                    field: field.name.clone(),
                });
            }
            if !ordinals.insert(field.ordinal) {
                return Err(SpecError::DuplicateOrdinal {
                    union: self.name.clone(),
                    ordinal: field.ordinal,
                });
            }
            if field.nullable && field.ty.is_primitive() {
                return Err(SpecError::NullablePrimitive {
                    spec: self.name.clone(),
                    field: field.name.clone(),
                    kind: field.ty.kind_name(),
                });
            }
        }
        Ok(Arc::new(UnionSpec {
            name: self.name,
            fields: self.fields,
        }))
    }
}

// ----------------------------------------------------------------------------
// Registry
// ----------------------------------------------------------------------------

/// Named descriptors, built once and read-only afterwards.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: HashMap<String, Type>,
}

impl TypeRegistry {
    pub fn builder() -> TypeRegistryBuilder {
        TypeRegistryBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&Type> {
        self.types.get(name)
    }

    pub fn struct_spec(&self, name: &str) -> Option<Arc<StructSpec>> {
        match self.types.get(name) {
            Some(Type::Struct(spec)) => Some(Arc::clone(spec)),
            _ => None,
        }
    }

    pub fn union_spec(&self, name: &str) -> Option<Arc<UnionSpec>> {
        match self.types.get(name) {
            Some(Type::Union(spec)) => Some(Arc::clone(spec)),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TypeRegistryBuilder {
    types: HashMap<String, Type>,
}

impl TypeRegistryBuilder {
    pub fn add_struct(&mut self, spec: Arc<StructSpec>) -> Result<&mut Self, SpecError> {
        let name = spec.name().to_owned();
        self.insert(name, Type::Struct(spec))
    }

    pub fn add_union(&mut self, spec: Arc<UnionSpec>) -> Result<&mut Self, SpecError> {
        let name = spec.name().to_owned();
        self.insert(name, Type::Union(spec))
    }

    fn insert(&mut self, name: String, ty: Type) -> Result<&mut Self, SpecError> {
        match self.types.entry(name) {
            Entry::Occupied(e) => Err(SpecError::DuplicateName(e.key().clone())),
            Entry::Vacant(e) => {
                tracing::trace!(name = %e.key(), kind = ty.kind_name(), "Registered type");
                e.insert(ty);
                Ok(self)
            }
        }
    }

    pub fn build(self) -> TypeRegistry {
        TypeRegistry { types: self.types }
    }
}
