//! mojo-lite: typed message-pipe bindings.
//!
//! Values described by a [`TypeRegistry`] are encoded into the Mojo wire
//! format and exchanged over message pipes. An [`InterfaceProxy`] sends calls
//! and matches replies by request id; an [`InterfaceTarget`] dispatches
//! incoming messages to registered handlers.

pub mod config;
pub mod control;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod message;
pub mod pipe;
pub mod proxy;
pub mod reader;
pub mod router;
pub mod target;
pub mod transport;
pub mod types;
pub mod value;

pub use config::BindingConfig;
pub use error::{
    BindingError, ChannelError, DecodeError, EncodeError, HandlerError, Result, SpecError,
};
pub use message::{Message, MessageHeader};
pub use pipe::{Handle, RawMessage, create_message_pipe};
pub use proxy::{InterfaceProxy, PendingCall};
pub use reader::{ChannelReader, ReadEvent, ReaderState};
pub use router::{CallbackRouter, InterfaceCallbackTarget, Listener};
pub use target::{InterfaceTarget, MessageHandler};
pub use transport::bridge_stream;
pub use types::{
    ArraySpec, MapSpec, StructField, StructSpec, Type, TypeRegistry, TypeRegistryBuilder,
    UnionField, UnionSpec,
};
pub use value::{FromValue, MojomStruct, StructValue, UnionValue, Value};
