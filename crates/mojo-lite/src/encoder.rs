//! Writes value graphs into a [`Message`] arena.
//!
//! An encoder is bound to one region of the arena (`base`); field offsets are
//! relative to that region. Out-of-line objects get their own region and a
//! child encoder, and the referring slot stores a relative pointer:
//! `target - (base + offset)`.

use crate::error::EncodeError;
use crate::message::Message;
use crate::pipe::Handle;
use crate::types::{
    ARRAY_HEADER_SIZE, ArraySpec, INVALID_HANDLE_INDEX, MAP_DATA_SIZE, MapSpec, STRUCT_HEADER_SIZE,
    StructSpec, Type, UNION_DATA_SIZE, UnionSpec,
};
use crate::value::{StructValue, UnionValue, Value};

pub struct Encoder<'m> {
    message: &'m mut Message,
    base: usize,
}

impl<'m> Encoder<'m> {
    pub fn new(message: &'m mut Message, base: usize) -> Self {
        Self { message, base }
    }

    fn child(&mut self, base: usize) -> Encoder<'_> {
        Encoder {
            message: &mut *self.message,
            base,
        }
    }

    fn write_bytes(&mut self, offset: usize, bytes: &[u8]) {
        let start = self.base + offset;
        self.message.bytes_mut()[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.write_bytes(offset, &value.to_le_bytes());
    }

    fn write_bool(&mut self, offset: usize, bit: u8, value: bool) {
        let byte = &mut self.message.bytes_mut()[self.base + offset];
        if value {
            *byte |= 1 << bit;
        } else {
            *byte &= !(1 << bit);
        }
    }

    fn write_pointer(&mut self, offset: usize, target: usize) {
        let relative = (target - (self.base + offset)) as u64;
        self.write_bytes(offset, &relative.to_le_bytes());
    }

    fn write_handle(&mut self, offset: usize, handle: Handle) {
        let index = self.message.push_handle(handle);
        self.write_u32(offset, index);
    }

    /// Encode one non-null value into the slot at `offset`.
    pub fn encode_value(
        &mut self,
        ty: &Type,
        offset: usize,
        bit: u8,
        value: Value,
        nullable: bool,
    ) -> Result<(), EncodeError> {
        match (ty, value) {
            (Type::Bool, Value::Bool(v)) => self.write_bool(offset, bit, v),
            (Type::Int8, Value::Int8(v)) => self.write_bytes(offset, &v.to_le_bytes()),
            (Type::Uint8, Value::Uint8(v)) => self.write_bytes(offset, &v.to_le_bytes()),
            (Type::Int16, Value::Int16(v)) => self.write_bytes(offset, &v.to_le_bytes()),
            (Type::Uint16, Value::Uint16(v)) => self.write_bytes(offset, &v.to_le_bytes()),
            (Type::Int32 | Type::Enum, Value::Int32(v)) => {
                self.write_bytes(offset, &v.to_le_bytes())
            }
            (Type::Uint32, Value::Uint32(v)) => self.write_u32(offset, v),
            (Type::Int64, Value::Int64(v)) => self.write_bytes(offset, &v.to_le_bytes()),
            (Type::Uint64, Value::Uint64(v)) => self.write_bytes(offset, &v.to_le_bytes()),
            (Type::Float, Value::Float(v)) => self.write_bytes(offset, &v.to_le_bytes()),
            (Type::Double, Value::Double(v)) => self.write_bytes(offset, &v.to_le_bytes()),
            (Type::Handle | Type::InterfaceRequest(_), Value::Handle(h)) => {
                self.write_handle(offset, h)
            }
            (Type::InterfaceProxy(_), Value::Handle(h)) => {
                self.write_handle(offset, h);
                // Interface version, always 0.
                self.write_u32(offset + 4, 0);
            }
            (Type::String, Value::String(s)) => self.encode_string(offset, &s),
            (Type::Array(spec), Value::Array(items)) => self.encode_array(spec, offset, items)?,
            (Type::Map(spec), Value::Map(entries)) => self.encode_map(spec, offset, entries)?,
            (Type::Struct(spec), Value::Struct(v)) => self.encode_struct(spec, offset, v)?,
            (Type::Union(spec), Value::Union(v)) => self.encode_union(spec, offset, nullable, v)?,
            (ty, value) => return Err(ty.mismatch(&value)),
        }
        Ok(())
    }

    /// Write the null marker for `ty`. Pointer slots are already zero.
    pub fn encode_null(&mut self, ty: &Type, offset: usize) {
        if matches!(
            ty,
            Type::Handle | Type::InterfaceProxy(_) | Type::InterfaceRequest(_)
        ) {
            self.write_u32(offset, INVALID_HANDLE_INDEX);
        }
    }

    pub fn encode_string(&mut self, offset: usize, value: &str) {
        let bytes = value.as_bytes();
        let size = ARRAY_HEADER_SIZE + bytes.len();
        let region = self.message.allocate(size);
        self.write_pointer(offset, region);

        let mut enc = self.child(region);
        enc.write_u32(0, size as u32);
        enc.write_u32(4, bytes.len() as u32);
        enc.write_bytes(ARRAY_HEADER_SIZE, bytes);
    }

    pub fn encode_array(
        &mut self,
        spec: &ArraySpec,
        offset: usize,
        items: Vec<Value>,
    ) -> Result<(), EncodeError> {
        let size = spec.inline_size(items.len());
        let region = self.message.allocate(size);
        self.write_pointer(offset, region);

        let mut enc = self.child(region);
        enc.write_u32(0, size as u32);
        enc.write_u32(4, items.len() as u32);

        if let Type::Bool = spec.element {
            for (i, item) in items.into_iter().enumerate() {
                match item {
                    Value::Bool(b) => enc.write_bool(ARRAY_HEADER_SIZE + i / 8, (i % 8) as u8, b),
                    other => return Err(spec.element.mismatch(&other)),
                }
            }
            return Ok(());
        }

        let stride = spec.element.array_element_size(spec.element_nullable);
        for (i, item) in items.into_iter().enumerate() {
            let slot = ARRAY_HEADER_SIZE + i * stride;
            if item.is_null() {
                if !spec.element_nullable {
                    return Err(EncodeError::NullArrayElement);
                }
                enc.encode_null(&spec.element, slot);
                continue;
            }
            enc.encode_value(&spec.element, slot, 0, item, spec.element_nullable)?;
        }
        Ok(())
    }

    pub fn encode_map(
        &mut self,
        spec: &MapSpec,
        offset: usize,
        entries: Vec<(Value, Value)>,
    ) -> Result<(), EncodeError> {
        let region = self.message.allocate(MAP_DATA_SIZE);
        self.write_pointer(offset, region);

        let (keys, values): (Vec<Value>, Vec<Value>) = entries.into_iter().unzip();
        let mut enc = self.child(region);
        enc.write_u32(0, MAP_DATA_SIZE as u32);
        enc.write_u32(4, 0);
        enc.encode_array(&spec.keys, 8, keys)?;
        enc.encode_array(&spec.values, 16, values)
    }

    pub fn encode_struct(
        &mut self,
        spec: &StructSpec,
        offset: usize,
        value: StructValue,
    ) -> Result<(), EncodeError> {
        let region = self.message.allocate(spec.header_size());
        self.write_pointer(offset, region);
        self.child(region).encode_struct_inline(spec, value)
    }

    /// Encode `value` as a struct whose header sits at this encoder's base.
    pub fn encode_struct_inline(
        &mut self,
        spec: &StructSpec,
        mut value: StructValue,
    ) -> Result<(), EncodeError> {
        if let Some(unknown) = value.field_names().find(|name| spec.field(name).is_none()) {
            return Err(EncodeError::UnknownField {
                spec: spec.name().to_owned(),
                field: unknown.to_owned(),
            });
        }

        self.write_u32(0, spec.header_size() as u32);
        self.write_u32(4, 0);
        for field in spec.fields() {
            let offset = STRUCT_HEADER_SIZE + field.packed_offset;
            let field_value = value.take(&field.name).unwrap_or_default();
            if field_value.is_null() {
                if !field.nullable {
                    return Err(EncodeError::MissingField {
                        spec: spec.name().to_owned(),
                        field: field.name.clone(),
                    });
                }
                self.encode_null(&field.ty, offset);
                continue;
            }
            self.encode_value(
                &field.ty,
                offset,
                field.packed_bit_offset,
                field_value,
                field.nullable,
            )?;
        }
        Ok(())
    }

    /// Unions in nullable slots live in their own 16-byte block behind a pointer.
    pub fn encode_union(
        &mut self,
        spec: &UnionSpec,
        offset: usize,
        nullable: bool,
        value: UnionValue,
    ) -> Result<(), EncodeError> {
        let field = spec.resolve(&value)?.clone();
        let arm_nullable = field.stored_nullable();

        let (mut enc, offset) = if nullable {
            let region = self.message.allocate(UNION_DATA_SIZE);
            self.write_pointer(offset, region);
            (self.child(region), 0)
        } else {
            let base = self.base;
            (self.child(base), offset)
        };

        enc.write_u32(offset, UNION_DATA_SIZE as u32);
        enc.write_u32(offset + 4, field.ordinal);
        let data = offset + 8;
        let arm_value = *value.value;
        if arm_value.is_null() {
            if !field.nullable {
                return Err(EncodeError::MissingField {
                    spec: spec.name().to_owned(),
                    field: field.name,
                });
            }
            enc.encode_null(&field.ty, data);
            return Ok(());
        }
        enc.encode_value(&field.ty, data, 0, arm_value, arm_nullable)
    }
}
