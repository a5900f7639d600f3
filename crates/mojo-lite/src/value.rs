//! Dynamic value graph carried by messages.
//!
//! A [`Value`] is what the encoder consumes and the decoder produces. Struct
//! values keep their fields by name in insertion order; the owning
//! [`StructSpec`] decides the wire order. Handles are owned, so values are
//! moved, never cloned.

use std::sync::Arc;

use indexmap::IndexMap;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};

use crate::error::{DecodeError, EncodeError, SpecError};
use crate::pipe::Handle;
use crate::types::StructSpec;

#[derive(Debug, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int8(i8),
    Uint8(u8),
    Int16(i16),
    Uint16(u16),
    Int32(i32),
    Uint32(u32),
    Int64(i64),
    Uint64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    /// Entries in encounter order. Keys are never null.
    Map(Vec<(Value, Value)>),
    Struct(StructValue),
    Union(UnionValue),
    /// A message pipe endpoint; also the value of interface proxy and request fields.
    Handle(Handle),
}

impl Value {
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int8(_) => "int8",
            Value::Uint8(_) => "uint8",
            Value::Int16(_) => "int16",
            Value::Uint16(_) => "uint16",
            Value::Int32(_) => "int32",
            Value::Uint32(_) => "uint32",
            Value::Int64(_) => "int64",
            Value::Uint64(_) => "uint64",
            Value::Float(_) => "float",
            Value::Double(_) => "double",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Map(_) => "map",
            Value::Struct(_) => "struct",
            Value::Union(_) => "union",
            Value::Handle(_) => "handle",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn union(tag: impl Into<String>, value: impl Into<Value>) -> Self {
        Value::Union(UnionValue::new(tag, value))
    }
}

macro_rules! impl_from_primitive {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for Value {
                fn from(v: $ty) -> Self {
                    Value::$variant(v)
                }
            }
        )*
    };
}

impl_from_primitive! {
    bool => Bool,
    i8 => Int8,
    u8 => Uint8,
    i16 => Int16,
    u16 => Uint16,
    i32 => Int32,
    u32 => Uint32,
    i64 => Int64,
    u64 => Uint64,
    f32 => Float,
    f64 => Double,
    String => String,
    StructValue => Struct,
    UnionValue => Union,
    Handle => Handle,
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(v: Vec<T>) -> Self {
        Value::Array(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

// ----------------------------------------------------------------------------
// Struct and union values
// ----------------------------------------------------------------------------

#[derive(Debug, PartialEq, Default)]
pub struct StructValue {
    fields: IndexMap<String, Value>,
}

impl StructValue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Remove a field, keeping the order of the rest.
    pub fn take(&mut self, name: &str) -> Option<Value> {
        self.fields.shift_remove(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.fields.keys().map(String::as_str)
    }

    /// Build a struct value from positional arguments in field declaration order.
    pub fn from_args(spec: &StructSpec, args: Vec<Value>) -> Result<Self, EncodeError> {
        if args.len() != spec.fields().len() {
            return Err(EncodeError::ArgumentCount {
                spec: spec.name().to_owned(),
                expected: spec.fields().len(),
                found: args.len(),
            });
        }
        let fields = spec
            .fields()
            .iter()
            .zip(args)
            .map(|(field, value)| (field.name.clone(), value))
            .collect();
        Ok(Self { fields })
    }

    /// Positional arguments in field declaration order; absent fields become `Null`.
    pub fn into_args(mut self, spec: &StructSpec) -> Vec<Value> {
        spec.fields()
            .iter()
            .map(|field| self.take(&field.name).unwrap_or_default())
            .collect()
    }

    /// Take a field and convert it to `T`, for [`MojomStruct::from_value`] impls.
    pub fn take_as<T: FromValue>(&mut self, spec: &str, field: &str) -> Result<T, DecodeError> {
        let value = self.take(field).unwrap_or_default();
        T::extract(value).ok_or_else(|| DecodeError::FieldType {
            spec: spec.to_owned(),
            field: field.to_owned(),
            expected: T::KIND,
        })
    }
}

impl IntoIterator for StructValue {
    type Item = (String, Value);
    type IntoIter = indexmap::map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

/// A union value: exactly one tagged field is set.
#[derive(Debug, PartialEq)]
pub struct UnionValue {
    pub tag: String,
    pub value: Box<Value>,
}

impl UnionValue {
    pub fn new(tag: impl Into<String>, value: impl Into<Value>) -> Self {
        Self {
            tag: tag.into(),
            value: Box::new(value.into()),
        }
    }
}

// ----------------------------------------------------------------------------
// Typed access
// ----------------------------------------------------------------------------

/// Conversion out of the dynamic graph for one field.
pub trait FromValue: Sized {
    const KIND: &'static str;

    fn extract(value: Value) -> Option<Self>;
}

macro_rules! impl_extract {
    ($($ty:ty => $variant:ident, $kind:literal);* $(;)?) => {
        $(
            impl FromValue for $ty {
                const KIND: &'static str = $kind;

                fn extract(value: Value) -> Option<Self> {
                    match value {
                        Value::$variant(v) => Some(v),
                        _ => None,
                    }
                }
            }
        )*
    };
}

impl_extract! {
    bool => Bool, "bool";
    i8 => Int8, "int8";
    u8 => Uint8, "uint8";
    i16 => Int16, "int16";
    u16 => Uint16, "uint16";
    i32 => Int32, "int32";
    u32 => Uint32, "uint32";
    i64 => Int64, "int64";
    u64 => Uint64, "uint64";
    f32 => Float, "float";
    f64 => Double, "double";
    String => String, "string";
    StructValue => Struct, "struct";
    UnionValue => Union, "union";
    Handle => Handle, "handle";
}

impl<T: FromValue> FromValue for Option<T> {
    const KIND: &'static str = T::KIND;

    fn extract(value: Value) -> Option<Self> {
        match value {
            Value::Null => Some(None),
            other => T::extract(other).map(Some),
        }
    }
}

impl<T: FromValue> FromValue for Vec<T> {
    const KIND: &'static str = "array";

    fn extract(value: Value) -> Option<Self> {
        match value {
            Value::Array(items) => items.into_iter().map(T::extract).collect(),
            _ => None,
        }
    }
}

/// A Rust struct with a fixed wire layout.
///
/// This is the seam generated bindings implement; hand-written impls work too.
pub trait MojomStruct: Sized {
    fn spec() -> Result<Arc<StructSpec>, SpecError>;

    fn into_value(self) -> StructValue;

    fn from_value(value: StructValue) -> Result<Self, DecodeError>;
}

// ----------------------------------------------------------------------------
// JSON rendering (diagnostics and snapshots)
// ----------------------------------------------------------------------------

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Value::Null => serializer.serialize_unit(),
            Value::Bool(v) => serializer.serialize_bool(*v),
            Value::Int8(v) => serializer.serialize_i8(*v),
            Value::Uint8(v) => serializer.serialize_u8(*v),
            Value::Int16(v) => serializer.serialize_i16(*v),
            Value::Uint16(v) => serializer.serialize_u16(*v),
            Value::Int32(v) => serializer.serialize_i32(*v),
            Value::Uint32(v) => serializer.serialize_u32(*v),
            Value::Int64(v) => serializer.serialize_i64(*v),
            Value::Uint64(v) => serializer.serialize_u64(*v),
            Value::Float(v) => serializer.serialize_f32(*v),
            Value::Double(v) => serializer.serialize_f64(*v),
            Value::String(v) => serializer.serialize_str(v),
            Value::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Value::Map(entries) => {
                let mut seq = serializer.serialize_seq(Some(entries.len()))?;
                for (key, value) in entries {
                    seq.serialize_element(&(key, value))?;
                }
                seq.end()
            }
            Value::Struct(s) => s.serialize(serializer),
            Value::Union(u) => u.serialize(serializer),
            Value::Handle(h) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("handle", &h.id())?;
                map.end()
            }
        }
    }
}

impl Serialize for StructValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.fields.len()))?;
        for (name, value) in &self.fields {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl Serialize for UnionValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(&self.tag, self.value.as_ref())?;
        map.end()
    }
}
