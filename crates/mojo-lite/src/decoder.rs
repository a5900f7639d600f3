//! Reads value graphs back out of a received message.
//!
//! Every read is bounds-checked and every pointer must land on an 8-byte
//! boundary inside the buffer. Handles are taken out of the message's side
//! table as they are decoded, so an index used twice is rejected.

use crate::error::DecodeError;
use crate::pipe::Handle;
use crate::types::{
    ARRAY_HEADER_SIZE, ArraySpec, INVALID_HANDLE_INDEX, MAP_DATA_SIZE, MapSpec, STRUCT_HEADER_SIZE,
    StructSpec, Type, UNION_DATA_SIZE, UnionSpec,
};
use crate::value::{StructValue, UnionValue, Value};

pub struct Decoder<'a> {
    data: &'a [u8],
    handles: &'a mut Vec<Option<Handle>>,
    base: usize,
    depth: usize,
    max_depth: usize,
}

impl<'a> Decoder<'a> {
    pub fn new(
        data: &'a [u8],
        handles: &'a mut Vec<Option<Handle>>,
        base: usize,
        max_depth: usize,
    ) -> Self {
        Self {
            data,
            handles,
            base,
            depth: 0,
            max_depth,
        }
    }

    fn child(&mut self, base: usize) -> Result<Decoder<'_>, DecodeError> {
        let depth = self.depth + 1;
        if depth > self.max_depth {
            return Err(DecodeError::TooDeep(self.max_depth));
        }
        Ok(Decoder {
            data: self.data,
            handles: &mut *self.handles,
            base,
            depth,
            max_depth: self.max_depth,
        })
    }

    fn check_bounds(&self, start: usize, needed: usize) -> Result<(), DecodeError> {
        match start.checked_add(needed) {
            Some(end) if end <= self.data.len() => Ok(()),
            _ => Err(DecodeError::OutOfBounds {
                offset: start,
                needed,
                len: self.data.len(),
            }),
        }
    }

    fn read<const N: usize>(&self, offset: usize) -> Result<[u8; N], DecodeError> {
        let start = self.base + offset;
        self.check_bounds(start, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[start..start + N]);
        Ok(out)
    }

    fn read_u32(&self, offset: usize) -> Result<u32, DecodeError> {
        self.read::<4>(offset).map(u32::from_le_bytes)
    }

    fn read_bool(&self, offset: usize, bit: u8) -> Result<bool, DecodeError> {
        let [byte] = self.read::<1>(offset)?;
        Ok(byte & (1 << bit) != 0)
    }

    /// Resolve the relative pointer at `offset`; `None` for a null pointer.
    pub fn decode_pointer(&self, offset: usize) -> Result<Option<usize>, DecodeError> {
        let relative = u64::from_le_bytes(self.read::<8>(offset)?);
        if relative == 0 {
            return Ok(None);
        }
        let slot = self.base + offset;
        let target = usize::try_from(relative)
            .ok()
            .and_then(|r| slot.checked_add(r))
            .filter(|t| *t < self.data.len())
            .ok_or(DecodeError::OutOfBounds {
                offset: slot,
                needed: 8,
                len: self.data.len(),
            })?;
        if target % 8 != 0 {
            return Err(DecodeError::MisalignedPointer { offset: target });
        }
        Ok(Some(target))
    }

    fn take_handle(&mut self, offset: usize) -> Result<Option<Handle>, DecodeError> {
        let index = self.read_u32(offset)?;
        if index == INVALID_HANDLE_INDEX {
            return Ok(None);
        }
        let available = self.handles.len();
        let slot = self
            .handles
            .get_mut(index as usize)
            .ok_or(DecodeError::InvalidHandleIndex { index, available })?;
        slot.take()
            .map(Some)
            .ok_or(DecodeError::DuplicateHandle { index })
    }

    /// Decode the slot at `offset`. Nulls come back as [`Value::Null`]; the
    /// caller decides whether that is allowed.
    pub fn decode_value(
        &mut self,
        ty: &Type,
        offset: usize,
        bit: u8,
        nullable: bool,
    ) -> Result<Value, DecodeError> {
        let value = match ty {
            Type::Bool => Value::Bool(self.read_bool(offset, bit)?),
            Type::Int8 => Value::Int8(i8::from_le_bytes(self.read(offset)?)),
            Type::Uint8 => Value::Uint8(u8::from_le_bytes(self.read(offset)?)),
            Type::Int16 => Value::Int16(i16::from_le_bytes(self.read(offset)?)),
            Type::Uint16 => Value::Uint16(u16::from_le_bytes(self.read(offset)?)),
            Type::Int32 | Type::Enum => Value::Int32(i32::from_le_bytes(self.read(offset)?)),
            Type::Uint32 => Value::Uint32(self.read_u32(offset)?),
            Type::Int64 => Value::Int64(i64::from_le_bytes(self.read(offset)?)),
            Type::Uint64 => Value::Uint64(u64::from_le_bytes(self.read(offset)?)),
            Type::Float => Value::Float(f32::from_le_bytes(self.read(offset)?)),
            Type::Double => Value::Double(f64::from_le_bytes(self.read(offset)?)),
            Type::Handle | Type::InterfaceRequest(_) => self.take_handle(offset)?.into(),
            Type::InterfaceProxy(_) => {
                // Interface version is not negotiated; read it for bounds only.
                self.read_u32(offset + 4)?;
                self.take_handle(offset)?.into()
            }
            Type::String => match self.decode_pointer(offset)? {
                Some(target) => Value::String(self.decode_string(target)?),
                None => Value::Null,
            },
            Type::Array(spec) => match self.decode_pointer(offset)? {
                Some(target) => Value::Array(self.decode_array(spec, target)?),
                None => Value::Null,
            },
            Type::Map(spec) => match self.decode_pointer(offset)? {
                Some(target) => Value::Map(self.decode_map(spec, target)?),
                None => Value::Null,
            },
            Type::Struct(spec) => match self.decode_pointer(offset)? {
                Some(target) => Value::Struct(self.child(target)?.decode_struct_inline(spec)?),
                None => Value::Null,
            },
            Type::Union(spec) => self.decode_union(spec, offset, nullable)?,
        };
        Ok(value)
    }

    fn array_header(&self, target: usize) -> Result<(u32, u32), DecodeError> {
        let size = u32::from_le_bytes(self.read_abs(target)?);
        let elements = u32::from_le_bytes(self.read_abs(target + 4)?);
        Ok((size, elements))
    }

    fn read_abs<const N: usize>(&self, absolute: usize) -> Result<[u8; N], DecodeError> {
        self.check_bounds(absolute, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[absolute..absolute + N]);
        Ok(out)
    }

    pub fn decode_string(&self, target: usize) -> Result<String, DecodeError> {
        let (size, len) = self.array_header(target)?;
        if size as usize != ARRAY_HEADER_SIZE + len as usize {
            return Err(DecodeError::InvalidArrayHeader { size, elements: len });
        }
        let start = target + ARRAY_HEADER_SIZE;
        self.check_bounds(start, len as usize)?;
        String::from_utf8(self.data[start..start + len as usize].to_vec())
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    pub fn decode_array(&mut self, spec: &ArraySpec, target: usize) -> Result<Vec<Value>, DecodeError> {
        let (size, count) = self.array_header(target)?;
        let count_usize = count as usize;
        let expected = spec.inline_size(count_usize);
        if (size as usize) < expected {
            return Err(DecodeError::InvalidArrayHeader {
                size,
                elements: count,
            });
        }
        self.check_bounds(target, expected)?;

        let mut dec = self.child(target)?;
        let mut items = Vec::with_capacity(count_usize);
        if let Type::Bool = spec.element {
            for i in 0..count_usize {
                items.push(Value::Bool(
                    dec.read_bool(ARRAY_HEADER_SIZE + i / 8, (i % 8) as u8)?,
                ));
            }
            return Ok(items);
        }

        let stride = spec.element.array_element_size(spec.element_nullable);
        for i in 0..count_usize {
            let item = dec.decode_value(
                &spec.element,
                ARRAY_HEADER_SIZE + i * stride,
                0,
                spec.element_nullable,
            )?;
            if item.is_null() && !spec.element_nullable {
                return Err(DecodeError::UnexpectedNullElement);
            }
            items.push(item);
        }
        Ok(items)
    }

    pub fn decode_map(
        &mut self,
        spec: &MapSpec,
        target: usize,
    ) -> Result<Vec<(Value, Value)>, DecodeError> {
        let dec = self.child(target)?;
        let size = dec.read_u32(0)?;
        let version = dec.read_u32(4)?;
        if size as usize != MAP_DATA_SIZE || version != 0 {
            return Err(DecodeError::InvalidMap);
        }
        let keys_at = dec.decode_pointer(8)?.ok_or(DecodeError::InvalidMap)?;
        let values_at = dec.decode_pointer(16)?.ok_or(DecodeError::InvalidMap)?;

        let mut dec = self.child(target)?;
        let keys = dec.decode_array(&spec.keys, keys_at)?;
        let values = dec.decode_array(&spec.values, values_at)?;
        if keys.len() != values.len() {
            return Err(DecodeError::InvalidMap);
        }
        Ok(keys.into_iter().zip(values).collect())
    }

    /// Decode a struct whose header sits at this decoder's base.
    pub fn decode_struct_inline(&mut self, spec: &StructSpec) -> Result<StructValue, DecodeError> {
        let size = self.read_u32(0)?;
        if (size as usize) < spec.header_size() || (size as usize) < STRUCT_HEADER_SIZE {
            return Err(DecodeError::InvalidStructHeader {
                spec: spec.name().to_owned(),
                size,
            });
        }
        self.check_bounds(self.base, size as usize)?;

        let mut value = StructValue::new();
        for field in spec.fields() {
            let field_value = self.decode_value(
                &field.ty,
                STRUCT_HEADER_SIZE + field.packed_offset,
                field.packed_bit_offset,
                field.nullable,
            )?;
            if field_value.is_null() && !field.nullable {
                return Err(DecodeError::UnexpectedNull {
                    spec: spec.name().to_owned(),
                    field: field.name.clone(),
                });
            }
            value.insert(field.name.clone(), field_value);
        }
        Ok(value)
    }

    pub fn decode_union(
        &mut self,
        spec: &UnionSpec,
        offset: usize,
        nullable: bool,
    ) -> Result<Value, DecodeError> {
        let (mut dec, offset) = if nullable {
            match self.decode_pointer(offset)? {
                Some(target) => (self.child(target)?, 0),
                None => return Ok(Value::Null),
            }
        } else {
            let base = self.base;
            (self.child(base)?, offset)
        };

        let size = dec.read_u32(offset)?;
        if size as usize != UNION_DATA_SIZE {
            return Err(DecodeError::InvalidUnionSize {
                union: spec.name().to_owned(),
                size,
            });
        }
        let ordinal = dec.read_u32(offset + 4)?;
        let field = spec
            .field_by_ordinal(ordinal)
            .ok_or_else(|| DecodeError::UnknownUnionOrdinal {
                union: spec.name().to_owned(),
                ordinal,
            })?;

        let arm = dec.decode_value(&field.ty, offset + 8, 0, field.stored_nullable())?;
        if arm.is_null() && !field.nullable {
            return Err(DecodeError::UnexpectedNull {
                spec: spec.name().to_owned(),
                field: field.name.clone(),
            });
        }
        Ok(Value::Union(UnionValue::new(field.name.clone(), arm)))
    }
}
