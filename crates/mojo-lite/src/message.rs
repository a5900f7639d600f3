//! Message envelope: header codec and the allocation arena.
//!
//! Layout of every message:
//!
//! ```text
//! [header: 24 bytes (v0) | 32 bytes (v1)] [params struct] [out-of-line objects...]
//! ```
//!
//! The header is `size:u32, version:u32, interface_id:u32, ordinal:u32,
//! flags:u32, padding:u32`, and v1 appends `request_id:u64`. All integers are
//! little-endian.

use std::sync::Arc;

use crate::config::BindingConfig;
use crate::decoder::Decoder;
use crate::encoder::Encoder;
use crate::error::{DecodeError, EncodeError};
use crate::pipe::{Handle, RawMessage};
use crate::types::{StructSpec, align};
use crate::value::StructValue;

pub const HEADER_V0_SIZE: usize = 24;
pub const HEADER_V1_SIZE: usize = 32;

pub const FLAG_EXPECTS_RESPONSE: u32 = 1 << 0;
pub const FLAG_IS_RESPONSE: u32 = 1 << 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub header_size: u32,
    pub version: u32,
    pub interface_id: u32,
    pub ordinal: u32,
    pub flags: u32,
    /// Zero for v0 headers.
    pub request_id: u64,
}

impl MessageHeader {
    /// Build a header, choosing v1 whenever a response flag is set.
    pub fn new(ordinal: u32, flags: u32, request_id: u64) -> Self {
        let versioned = flags & (FLAG_EXPECTS_RESPONSE | FLAG_IS_RESPONSE) != 0;
        let (header_size, version) = if versioned {
            (HEADER_V1_SIZE as u32, 1)
        } else {
            (HEADER_V0_SIZE as u32, 0)
        };
        Self {
            header_size,
            version,
            interface_id: 0,
            ordinal,
            flags,
            request_id: if versioned { request_id } else { 0 },
        }
    }

    pub fn request(ordinal: u32, request_id: u64) -> Self {
        Self::new(ordinal, FLAG_EXPECTS_RESPONSE, request_id)
    }

    pub fn response(ordinal: u32, request_id: u64) -> Self {
        Self::new(ordinal, FLAG_IS_RESPONSE, request_id)
    }

    pub fn expects_response(&self) -> bool {
        self.flags & FLAG_EXPECTS_RESPONSE != 0
    }

    pub fn is_response(&self) -> bool {
        self.flags & FLAG_IS_RESPONSE != 0
    }

    pub fn size(&self) -> usize {
        self.header_size as usize
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, DecodeError> {
        let word = |offset: usize| -> Result<u32, DecodeError> {
            bytes
                .get(offset..offset + 4)
                .and_then(|b| b.try_into().ok())
                .map(u32::from_le_bytes)
                .ok_or(DecodeError::InvalidHeader)
        };

        let header_size = word(0)?;
        let version = word(4)?;
        match (header_size as usize, version) {
            (HEADER_V0_SIZE, 0) | (HEADER_V1_SIZE, 1) => {}
            (_, 2) => return Err(DecodeError::UnsupportedHeaderVersion),
            _ => return Err(DecodeError::InvalidHeader),
        }
        if bytes.len() < header_size as usize {
            return Err(DecodeError::InvalidHeader);
        }

        let request_id = if version == 1 {
            let low = word(24)? as u64;
            let high = word(28)? as u64;
            low | (high << 32)
        } else {
            0
        };

        Ok(Self {
            header_size,
            version,
            interface_id: word(8)?,
            ordinal: word(12)?,
            flags: word(16)?,
            request_id,
        })
    }

    fn write_to(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.header_size.to_le_bytes());
        buf[4..8].copy_from_slice(&self.version.to_le_bytes());
        buf[8..12].copy_from_slice(&self.interface_id.to_le_bytes());
        buf[12..16].copy_from_slice(&self.ordinal.to_le_bytes());
        buf[16..20].copy_from_slice(&self.flags.to_le_bytes());
        if self.version == 1 {
            buf[24..32].copy_from_slice(&self.request_id.to_le_bytes());
        }
    }
}

/// Outgoing message under construction.
///
/// Every allocation starts at an 8-byte boundary and is zero-filled to an
/// 8-byte multiple, so `allocated_len` is always aligned.
#[derive(Debug, Default)]
pub struct Message {
    buffer: Vec<u8>,
    handles: Vec<Handle>,
}

impl Message {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
            handles: Vec::new(),
        }
    }

    /// Reserve `size` bytes (rounded up to 8) and return their absolute offset.
    pub fn allocate(&mut self, size: usize) -> usize {
        let offset = self.buffer.len();
        let new_len = offset + align(size);
        if new_len > self.buffer.capacity() {
            tracing::trace!(from = self.buffer.capacity(), to = new_len, "Growing message arena");
        }
        self.buffer.resize(new_len, 0);
        offset
    }

    pub fn allocated_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn handles(&self) -> &[Handle] {
        &self.handles
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    /// Append a handle to the side table, returning its index.
    pub(crate) fn push_handle(&mut self, handle: Handle) -> u32 {
        self.handles.push(handle);
        (self.handles.len() - 1) as u32
    }

    pub fn into_raw(self) -> RawMessage {
        RawMessage::new(self.buffer, self.handles)
    }
}

/// Serialize `value` as the params (or response params) struct of a message.
///
/// Sizing runs first and validates the whole value, so every encode failure
/// happens before a single byte is produced; a size above
/// `config.max_message_bytes` is refused. On failure `value` is left as it
/// was, handles included. On success its fields have moved into the message.
pub fn serialize_message(
    header: MessageHeader,
    spec: &Arc<StructSpec>,
    value: &mut StructValue,
    config: &BindingConfig,
) -> Result<Message, EncodeError> {
    let payload_size = spec.total_size(value)?;
    let total_size = header.size() + payload_size;
    if total_size > config.max_message_bytes {
        return Err(EncodeError::MessageTooLarge {
            size: total_size,
            limit: config.max_message_bytes,
        });
    }
    if total_size >= config.large_message_log_bytes {
        tracing::info!(
            ordinal = header.ordinal,
            size_bytes = total_size,
            size_kb = total_size / 1024,
            "Large message being encoded"
        );
    }

    let mut message = Message::with_capacity(total_size);
    let header_offset = message.allocate(header.size());
    header.write_to(&mut message.bytes_mut()[header_offset..]);

    let struct_offset = message.allocate(spec.header_size());
    Encoder::new(&mut message, struct_offset).encode_struct_inline(spec, std::mem::take(value))?;

    debug_assert_eq!(message.allocated_len(), total_size);
    tracing::trace!(
        ordinal = header.ordinal,
        request_id = header.request_id,
        bytes = total_size,
        handles = message.handles.len(),
        "Serialized message"
    );
    Ok(message)
}

/// Decode the params struct of a received message whose header is `header`.
pub fn decode_message_payload(
    raw: RawMessage,
    header: &MessageHeader,
    spec: &StructSpec,
    config: &BindingConfig,
) -> Result<StructValue, DecodeError> {
    if raw.bytes.len() > config.max_message_bytes {
        return Err(DecodeError::MessageTooLarge {
            size: raw.bytes.len(),
            limit: config.max_message_bytes,
        });
    }
    let mut handles: Vec<Option<Handle>> = raw.handles.into_iter().map(Some).collect();
    let mut decoder = Decoder::new(&raw.bytes, &mut handles, header.size(), config.max_decode_depth);
    decoder.decode_struct_inline(spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Type;

    fn empty_spec() -> Arc<StructSpec> {
        StructSpec::builder("Empty", 0).build().unwrap()
    }

    #[test]
    fn header_version_follows_flags() {
        let plain = MessageHeader::new(3, 0, 99);
        assert_eq!(plain.size(), HEADER_V0_SIZE);
        assert_eq!(plain.request_id, 0);

        let request = MessageHeader::request(3, 99);
        assert_eq!(request.size(), HEADER_V1_SIZE);
        assert!(request.expects_response());
        assert!(!request.is_response());

        let response = MessageHeader::response(3, 99);
        assert_eq!(response.version, 1);
        assert!(response.is_response());
    }

    #[test]
    fn v1_header_layout() {
        let message = serialize_message(
            MessageHeader::request(7, 0x1_0000_0002),
            &empty_spec(),
            &mut StructValue::new(),
            &BindingConfig::default(),
        )
        .unwrap();
        let hex: Vec<String> = message
            .bytes()
            .chunks(8)
            .map(|c| c.iter().map(|b| format!("{b:02x}")).collect())
            .collect();
        insta::assert_json_snapshot!(hex, @r#"
        [
          "2000000001000000",
          "0000000007000000",
          "0100000000000000",
          "0200000001000000",
          "0800000000000000"
        ]
        "#);

        let parsed = MessageHeader::parse(message.bytes()).unwrap();
        assert_eq!(parsed, MessageHeader::request(7, 0x1_0000_0002));
    }

    #[test]
    fn header_rejects_illegal_combinations() {
        let mut bytes = vec![0u8; 32];
        bytes[0..4].copy_from_slice(&24u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&1u32.to_le_bytes());
        assert_eq!(MessageHeader::parse(&bytes), Err(DecodeError::InvalidHeader));

        bytes[0..4].copy_from_slice(&32u32.to_le_bytes());
        bytes[4..8].copy_from_slice(&0u32.to_le_bytes());
        assert_eq!(MessageHeader::parse(&bytes), Err(DecodeError::InvalidHeader));

        bytes[4..8].copy_from_slice(&2u32.to_le_bytes());
        assert_eq!(
            MessageHeader::parse(&bytes),
            Err(DecodeError::UnsupportedHeaderVersion)
        );

        bytes[4..8].copy_from_slice(&1u32.to_le_bytes());
        assert_eq!(
            MessageHeader::parse(&bytes[..28]),
            Err(DecodeError::InvalidHeader)
        );
        assert_eq!(MessageHeader::parse(&bytes[..4]), Err(DecodeError::InvalidHeader));
    }

    #[test]
    fn allocations_stay_aligned() {
        let mut message = Message::default();
        assert_eq!(message.allocate(3), 0);
        assert_eq!(message.allocate(9), 8);
        assert_eq!(message.allocate(0), 24);
        assert_eq!(message.allocate(16), 24);
        assert_eq!(message.allocated_len(), 40);
    }

    #[test]
    fn oversized_messages_are_refused() {
        let spec = StructSpec::builder("Blob", 8)
            .field("data", 0, 0, Type::String, false)
            .build()
            .unwrap();
        let config = BindingConfig::default().with_max_message_bytes(64);
        let mut value = StructValue::new().with("data", "x".repeat(100));
        let err =
            serialize_message(MessageHeader::new(0, 0, 0), &spec, &mut value, &config).unwrap_err();
        assert_eq!(err, EncodeError::MessageTooLarge { size: 152, limit: 64 });
        assert_eq!(value.len(), 1);
    }
}
