//! Error taxonomy for the binding runtime.
//!
//! - **EncodeError**: raised while serializing, always before any bytes leave the process
//! - **DecodeError**: malformed or unexpected wire data; fatal to the message
//! - **ChannelError**: the message pipe failed or its peer went away
//! - **BindingError**: what proxy and target callers see, wrapping the three above

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("{spec} missing value for non-nullable field \"{field}\"")]
    MissingField { spec: String, field: String },

    #[error("{spec} has no field named \"{field}\"")]
    UnknownField { spec: String, field: String },

    #[error("trying to send a null element in an array of non-nullable elements")]
    NullArrayElement,

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("value for {union} must name one of its fields, got \"{tag}\"")]
    UnknownUnionTag { union: String, tag: String },

    #[error("{spec} takes {expected} arguments, got {found}")]
    ArgumentCount {
        spec: String,
        expected: usize,
        found: usize,
    },

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("received invalid message header")]
    InvalidHeader,

    #[error("v2 messages not yet supported")]
    UnsupportedHeaderVersion,

    #[error("message truncated: {needed} bytes at offset {offset} exceed buffer of {len}")]
    OutOfBounds {
        offset: usize,
        needed: usize,
        len: usize,
    },

    #[error("pointer to offset {offset} is not 8-byte aligned")]
    MisalignedPointer { offset: usize },

    #[error("decoded invalid handle index {index} ({available} handles attached)")]
    InvalidHandleIndex { index: u32, available: usize },

    #[error("handle index {index} referenced more than once")]
    DuplicateHandle { index: u32 },

    #[error("received {spec} with invalid null field \"{field}\"")]
    UnexpectedNull { spec: String, field: String },

    #[error("received unexpected null array element")]
    UnexpectedNullElement,

    #[error("invalid struct header for {spec}: size {size}")]
    InvalidStructHeader { spec: String, size: u32 },

    #[error("invalid array header: size {size} cannot hold {elements} elements")]
    InvalidArrayHeader { size: u32, elements: u32 },

    #[error("received invalid map data")]
    InvalidMap,

    #[error("invalid union size {size} for {union}")]
    InvalidUnionSize { union: String, size: u32 },

    #[error("received {union} with unknown ordinal {ordinal}")]
    UnknownUnionOrdinal { union: String, ordinal: u32 },

    #[error("string data is not valid UTF-8")]
    InvalidUtf8,

    #[error("nesting exceeds the maximum decode depth of {0}")]
    TooDeep(usize),

    #[error("message of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("field \"{field}\" of {spec} is not a {expected}")]
    FieldType {
        spec: String,
        field: String,
        expected: &'static str,
    },

    #[error("received unexpected response message for request {request_id}")]
    UnexpectedResponse { request_id: u64 },

    #[error("response ordinal {actual} does not match request ordinal {expected}")]
    OrdinalMismatch { expected: u32, actual: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("peer endpoint closed")]
    PeerClosed,

    #[error("endpoint already closed")]
    Closed,

    #[error("transport failure: {0}")]
    Transport(String),
}

/// A type descriptor that cannot describe any valid wire layout.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SpecError {
    #[error("type name {0} registered twice")]
    DuplicateName(String),

    #[error("{spec} declares field \"{field}\" twice")]
    DuplicateField { spec: String, field: String },

    #[error("{union} declares ordinal {ordinal} twice")]
    DuplicateOrdinal { union: String, ordinal: u32 },

    #[error("field \"{field}\" of {spec} does not fit in {packed_size} packed bytes")]
    FieldOutOfBounds {
        spec: String,
        field: String,
        packed_size: usize,
    },

    #[error("field \"{field}\" of {spec} has bit offset {bit_offset}, must be below 8")]
    InvalidBitOffset {
        spec: String,
        field: String,
        bit_offset: u8,
    },

    #[error("{kind} values cannot be nullable (\"{field}\" in {spec})")]
    NullablePrimitive {
        spec: String,
        field: String,
        kind: &'static str,
    },

    #[error("{kind} cannot be used as a map key")]
    InvalidMapKey { kind: &'static str },
}

/// Handler-side failure. Fatal to the binding that dispatched the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct HandlerError(String);

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BindingError {
    #[error(transparent)]
    Encode(#[from] EncodeError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Spec(#[from] SpecError),

    #[error("attempting to use an unbound proxy")]
    Unbound,

    #[error("proxy already bound")]
    AlreadyBound,

    /// Rejection delivered to every pending call when the channel fails.
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("call dropped before a reply arrived")]
    Cancelled,

    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("message expects a reply but its handler did not provide one")]
    MissingResponse,

    #[error("received unknown message with ordinal {0}")]
    UnknownOrdinal(u32),

    #[error("{0}")]
    UnexpectedMessage(&'static str),
}

pub type Result<T> = std::result::Result<T, BindingError>;
