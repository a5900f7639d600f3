//! Control messages on the reserved ordinal.
//!
//! A control request carries `RunMessageParams { input: RunInput }` and is
//! answered with `RunResponseMessageParams { output: RunOutput? }`. Both
//! proxies and targets answer them, so either end of a pipe can ask the other
//! to confirm it has processed everything sent so far (flush) or to report its
//! interface version.

use std::sync::{Arc, OnceLock};

use crate::config::BindingConfig;
use crate::error::{BindingError, DecodeError, SpecError};
use crate::message::{Message, MessageHeader, decode_message_payload, serialize_message};
use crate::pipe::RawMessage;
use crate::types::{StructSpec, Type, TypeRegistry, UnionSpec};
use crate::value::{StructValue, Value};

pub const RUN_MESSAGE_ID: u32 = 0xFFFF_FFFF;

const QUERY_VERSION: &str = "query_version";
const FLUSH_FOR_TESTING: &str = "flush_for_testing";
const QUERY_VERSION_RESULT: &str = "query_version_result";

pub struct ControlTypes {
    pub registry: TypeRegistry,
    pub run_params: Arc<StructSpec>,
    pub run_response_params: Arc<StructSpec>,
}

fn build_control_types() -> Result<ControlTypes, SpecError> {
    let query_version = StructSpec::builder("QueryVersion", 0).build()?;
    let flush = StructSpec::builder("FlushForTesting", 0).build()?;
    let query_version_result = StructSpec::builder("QueryVersionResult", 8)
        .field("version", 0, 0, Type::Uint32, false)
        .build()?;

    let run_input = UnionSpec::builder("RunInput")
        .field(QUERY_VERSION, 0, Type::Struct(Arc::clone(&query_version)), false)
        .field(FLUSH_FOR_TESTING, 1, Type::Struct(Arc::clone(&flush)), false)
        .build()?;
    let run_output = UnionSpec::builder("RunOutput")
        .field(
            QUERY_VERSION_RESULT,
            0,
            Type::Struct(Arc::clone(&query_version_result)),
            false,
        )
        .build()?;

    let run_params = StructSpec::builder("RunMessageParams", 16)
        .field("input", 0, 0, Type::Union(Arc::clone(&run_input)), false)
        .build()?;
    let run_response_params = StructSpec::builder("RunResponseMessageParams", 8)
        .field("output", 0, 0, Type::Union(Arc::clone(&run_output)), true)
        .build()?;

    let mut registry = TypeRegistry::builder();
    registry
        .add_struct(query_version)?
        .add_struct(flush)?
        .add_struct(query_version_result)?
        .add_union(run_input)?
        .add_union(run_output)?
        .add_struct(Arc::clone(&run_params))?
        .add_struct(Arc::clone(&run_response_params))?;

    Ok(ControlTypes {
        registry: registry.build(),
        run_params,
        run_response_params,
    })
}

/// Descriptors for the control messages, built on first use.
pub fn control_types() -> Result<&'static ControlTypes, SpecError> {
    static TYPES: OnceLock<Result<ControlTypes, SpecError>> = OnceLock::new();
    TYPES.get_or_init(build_control_types).as_ref().map_err(Clone::clone)
}

pub fn flush_params() -> StructValue {
    StructValue::new().with("input", Value::union(FLUSH_FOR_TESTING, StructValue::new()))
}

pub fn query_version_params() -> StructValue {
    StructValue::new().with("input", Value::union(QUERY_VERSION, StructValue::new()))
}

/// Pull the version out of a query-version reply.
pub fn parse_query_version_result(mut response: StructValue) -> Result<u32, DecodeError> {
    let output = response.take("output").unwrap_or_default();
    match output {
        Value::Union(u) if u.tag == QUERY_VERSION_RESULT => match *u.value {
            Value::Struct(mut result) => result.take_as("QueryVersionResult", "version"),
            _ => Err(DecodeError::UnexpectedNull {
                spec: "RunOutput".into(),
                field: QUERY_VERSION_RESULT.into(),
            }),
        },
        _ => Err(DecodeError::UnexpectedNull {
            spec: "RunResponseMessageParams".into(),
            field: "output".into(),
        }),
    }
}

/// Answers control requests on behalf of a proxy or target.
#[derive(Debug, Clone, Copy, Default)]
pub struct ControlMessageHandler {
    version: u32,
}

impl ControlMessageHandler {
    pub fn new(version: u32) -> Self {
        Self { version }
    }

    pub fn is_control_message(header: &MessageHeader) -> bool {
        header.ordinal == RUN_MESSAGE_ID
    }

    /// Build the reply for a control request. `None` when the message asks
    /// for no reply.
    pub fn handle(
        &self,
        header: &MessageHeader,
        raw: RawMessage,
        config: &BindingConfig,
    ) -> Result<Option<Message>, BindingError> {
        if !header.expects_response() {
            tracing::debug!("Ignoring control message that expects no response");
            return Ok(None);
        }

        let types = control_types()?;
        let mut params = decode_message_payload(raw, header, &types.run_params, config)?;
        let output = match params.take("input") {
            Some(Value::Union(input)) if input.tag == QUERY_VERSION => {
                tracing::debug!(version = self.version, "Answering version query");
                Value::union(
                    QUERY_VERSION_RESULT,
                    StructValue::new().with("version", self.version),
                )
            }
            Some(Value::Union(input)) if input.tag == FLUSH_FOR_TESTING => {
                tracing::debug!(request_id = header.request_id, "Answering flush");
                Value::Null
            }
            _ => {
                return Err(BindingError::UnexpectedMessage(
                    "control message without a known input",
                ));
            }
        };

        let response = serialize_message(
            MessageHeader::response(RUN_MESSAGE_ID, header.request_id),
            &types.run_response_params,
            &mut StructValue::new().with("output", output),
            config,
        )?;
        Ok(Some(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(mut params: StructValue, request_id: u64) -> (MessageHeader, RawMessage) {
        let types = control_types().unwrap();
        let header = MessageHeader::request(RUN_MESSAGE_ID, request_id);
        let message =
            serialize_message(header, &types.run_params, &mut params, &BindingConfig::default())
                .unwrap();
        (header, message.into_raw())
    }

    fn decode_reply(message: Message) -> (MessageHeader, StructValue) {
        let raw = message.into_raw();
        let header = MessageHeader::parse(&raw.bytes).unwrap();
        let types = control_types().unwrap();
        let value = decode_message_payload(
            raw,
            &header,
            &types.run_response_params,
            &BindingConfig::default(),
        )
        .unwrap();
        (header, value)
    }

    #[test]
    fn registry_holds_every_control_type() {
        let types = control_types().unwrap();
        assert_eq!(types.registry.len(), 7);
        assert!(types.registry.union_spec("RunInput").is_some());
        assert_eq!(types.run_params.packed_size(), 16);
    }

    #[test]
    fn answers_version_query() {
        let handler = ControlMessageHandler::new(3);
        let (header, raw) = request(query_version_params(), 12);
        let reply = handler
            .handle(&header, raw, &BindingConfig::default())
            .unwrap()
            .unwrap();

        let (reply_header, value) = decode_reply(reply);
        assert!(reply_header.is_response());
        assert_eq!(reply_header.request_id, 12);
        assert_eq!(reply_header.ordinal, RUN_MESSAGE_ID);
        assert_eq!(parse_query_version_result(value), Ok(3));
    }

    #[test]
    fn answers_flush_with_null_output() {
        let handler = ControlMessageHandler::default();
        let (header, raw) = request(flush_params(), 4);
        let reply = handler
            .handle(&header, raw, &BindingConfig::default())
            .unwrap()
            .unwrap();

        let (_, value) = decode_reply(reply);
        insta::assert_json_snapshot!(value, @r#"
        {
          "output": null
        }
        "#);
    }

    #[test]
    fn ignores_requests_without_reply() {
        let types = control_types().unwrap();
        let header = MessageHeader::new(RUN_MESSAGE_ID, 0, 0);
        let message =
            serialize_message(header, &types.run_params, &mut flush_params(), &BindingConfig::default())
                .unwrap();
        let reply = ControlMessageHandler::default()
            .handle(&header, message.into_raw(), &BindingConfig::default())
            .unwrap();
        assert!(reply.is_none());
    }
}
